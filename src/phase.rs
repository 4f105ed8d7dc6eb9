//! Next-phase selection policy.
//!
//! [`select_next_phase`] is a pure function of a [`PhaseHistory`] snapshot so
//! the same history always yields the same decision.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::{retries_left, Cycle, CycleStatus, Issue, IssueStatus, Phase, Priority};

/// The parts of the previous cycle the selector looks at.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleSnapshot {
    pub phase: Phase,
    pub status: CycleStatus,
    pub issue_id: Option<String>,
    #[serde(default)]
    pub interrupted: bool,
}

impl CycleSnapshot {
    /// Whether the cycle ran to a pass or fail result. Rate-limited,
    /// interrupted and still-running cycles say nothing about the work.
    pub fn reached_verdict(&self) -> bool {
        !self.interrupted && matches!(self.status, CycleStatus::Completed | CycleStatus::Failed)
    }

    /// The most recent cycle with a verdict, scanning `cycles` from the end.
    pub fn last_verdict<'a, I>(cycles: I) -> Option<Self>
    where
        I: IntoIterator<Item = &'a Cycle>,
        I::IntoIter: DoubleEndedIterator,
    {
        cycles
            .into_iter()
            .rev()
            .map(Self::from)
            .find(Self::reached_verdict)
    }
}

impl From<&Cycle> for CycleSnapshot {
    fn from(cycle: &Cycle) -> Self {
        Self {
            phase: cycle.phase,
            status: cycle.status,
            issue_id: cycle.issue_id.clone(),
            interrupted: cycle.interrupted,
        }
    }
}

/// The parts of an issue the selector looks at.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IssueSnapshot {
    pub id: String,
    pub priority: Priority,
    pub status: IssueStatus,
    pub retry_count: u32,
    pub max_retries: u32,
    pub created_at: DateTime<Utc>,
}

impl IssueSnapshot {
    fn has_retries_left(&self) -> bool {
        retries_left(self.status, self.retry_count, self.max_retries)
    }
}

impl From<&Issue> for IssueSnapshot {
    fn from(issue: &Issue) -> Self {
        Self {
            id: issue.id.clone(),
            priority: issue.priority,
            status: issue.status,
            retry_count: issue.retry_count,
            max_retries: issue.max_retries,
            created_at: issue.created_at,
        }
    }
}

/// Everything the selector needs to decide.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseHistory {
    /// Number the next cycle will carry.
    pub cycle_number: u32,
    /// Latest cycle that reached a verdict; see [`CycleSnapshot::last_verdict`].
    pub last_cycle: Option<CycleSnapshot>,
    /// Known issues in creation order.
    pub issues: Vec<IssueSnapshot>,
    /// Zero disables periodic review.
    pub review_interval: u32,
    /// Zero disables periodic discovery.
    pub discovery_interval: u32,
}

/// Which phase to run next and, where relevant, against which issue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseDecision {
    pub phase: Phase,
    pub issue_id: Option<String>,
}

impl PhaseDecision {
    fn new(phase: Phase, issue_id: Option<String>) -> Self {
        Self { phase, issue_id }
    }
}

fn is_multiple(n: u32, interval: u32) -> bool {
    interval > 0 && n > 0 && n % interval == 0
}

/// Picks the next phase. The first matching rule wins.
pub fn select_next_phase(history: &PhaseHistory) -> PhaseDecision {
    let n = history.cycle_number;

    let last = history.last_cycle.as_ref().filter(|c| c.reached_verdict());
    if last.is_none() && history.issues.is_empty() {
        return PhaseDecision::new(Phase::Discovery, None);
    }

    if let Some(last) = last {
        // Always verify a change before moving on.
        if last.phase.is_change() && last.status == CycleStatus::Completed {
            return PhaseDecision::new(Phase::Test, last.issue_id.clone());
        }

        if last.phase == Phase::Test && last.status == CycleStatus::Failed {
            let retry = last.issue_id.as_ref().and_then(|id| {
                history
                    .issues
                    .iter()
                    .find(|issue| &issue.id == id && issue.has_retries_left())
            });
            if let Some(issue) = retry {
                return PhaseDecision::new(Phase::Fix, Some(issue.id.clone()));
            }
        }
    }

    if is_multiple(n, history.review_interval) {
        return PhaseDecision::new(Phase::Review, None);
    }
    if is_multiple(n, history.discovery_interval) {
        return PhaseDecision::new(Phase::Discovery, None);
    }

    let candidate = history
        .issues
        .iter()
        .filter(|issue| issue.status == IssueStatus::Open && issue.has_retries_left())
        .min_by(|a, b| {
            a.priority
                .cmp(&b.priority)
                .then_with(|| a.created_at.cmp(&b.created_at))
        });

    match candidate {
        Some(issue) if issue.priority.is_critical() => {
            PhaseDecision::new(Phase::Fix, Some(issue.id.clone()))
        }
        Some(issue) => PhaseDecision::new(Phase::Improve, Some(issue.id.clone())),
        None => PhaseDecision::new(Phase::Discovery, None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn issue(id: &str, priority: Priority, age_secs: i64) -> IssueSnapshot {
        IssueSnapshot {
            id: id.to_string(),
            priority,
            status: IssueStatus::Open,
            retry_count: 0,
            max_retries: 3,
            created_at: Utc.timestamp_opt(age_secs, 0).unwrap(),
        }
    }

    fn history(n: u32, last: Option<CycleSnapshot>, issues: Vec<IssueSnapshot>) -> PhaseHistory {
        PhaseHistory {
            cycle_number: n,
            last_cycle: last,
            issues,
            review_interval: 5,
            discovery_interval: 10,
        }
    }

    fn last(phase: Phase, status: CycleStatus, issue_id: Option<&str>) -> Option<CycleSnapshot> {
        Some(CycleSnapshot {
            phase,
            status,
            issue_id: issue_id.map(str::to_string),
            interrupted: false,
        })
    }

    fn cycle(phase: Phase, status: CycleStatus, issue_id: Option<&str>) -> Cycle {
        let mut cycle = Cycle::new("s1", 0, phase, issue_id.map(str::to_string));
        cycle.status = status;
        cycle
    }

    #[test]
    fn empty_session_starts_with_discovery() {
        let decision = select_next_phase(&history(0, None, vec![]));
        assert_eq!(decision, PhaseDecision::new(Phase::Discovery, None));
    }

    #[test]
    fn completed_change_is_followed_by_test() {
        for phase in [Phase::Fix, Phase::Improve, Phase::Pipeline] {
            let decision = select_next_phase(&history(
                5,
                last(phase, CycleStatus::Completed, Some("i1")),
                vec![issue("i1", Priority::P0, 0)],
            ));
            assert_eq!(decision, PhaseDecision::new(Phase::Test, Some("i1".into())));
        }
    }

    #[test]
    fn failed_change_does_not_trigger_test() {
        let decision = select_next_phase(&history(
            1,
            last(Phase::Fix, CycleStatus::Failed, Some("i1")),
            vec![issue("i1", Priority::P1, 0)],
        ));
        assert_eq!(decision, PhaseDecision::new(Phase::Fix, Some("i1".into())));
    }

    #[test]
    fn failed_test_refixes_issue_with_retries() {
        let mut target = issue("i1", Priority::P3, 0);
        target.status = IssueStatus::Resolved;
        let decision = select_next_phase(&history(
            3,
            last(Phase::Test, CycleStatus::Failed, Some("i1")),
            vec![target, issue("i2", Priority::P0, 1)],
        ));
        assert_eq!(decision, PhaseDecision::new(Phase::Fix, Some("i1".into())));
    }

    #[test]
    fn failed_test_skips_exhausted_issue() {
        let mut target = issue("i1", Priority::P1, 0);
        target.status = IssueStatus::WontFix;
        let decision = select_next_phase(&history(
            3,
            last(Phase::Test, CycleStatus::Failed, Some("i1")),
            vec![target, issue("i2", Priority::P2, 1)],
        ));
        assert_eq!(decision, PhaseDecision::new(Phase::Improve, Some("i2".into())));
    }

    #[test]
    fn review_interval_precedes_issue_work() {
        let decision = select_next_phase(&history(
            10,
            last(Phase::Test, CycleStatus::Completed, None),
            vec![issue("i1", Priority::P0, 0)],
        ));
        assert_eq!(decision.phase, Phase::Review);
    }

    #[test]
    fn discovery_interval_applies_when_review_does_not() {
        let mut h = history(
            7,
            last(Phase::Test, CycleStatus::Completed, None),
            vec![issue("i1", Priority::P0, 0)],
        );
        h.review_interval = 0;
        h.discovery_interval = 7;
        assert_eq!(select_next_phase(&h).phase, Phase::Discovery);

        h.discovery_interval = 0;
        assert_eq!(select_next_phase(&h).phase, Phase::Fix);
    }

    #[test]
    fn highest_priority_then_oldest_wins() {
        let decision = select_next_phase(&history(
            1,
            last(Phase::Discovery, CycleStatus::Completed, None),
            vec![
                issue("newer-p1", Priority::P1, 20),
                issue("p2", Priority::P2, 0),
                issue("older-p1", Priority::P1, 10),
            ],
        ));
        assert_eq!(decision, PhaseDecision::new(Phase::Fix, Some("older-p1".into())));
    }

    #[test]
    fn low_priority_routes_to_improve() {
        let decision = select_next_phase(&history(
            1,
            last(Phase::Discovery, CycleStatus::Completed, None),
            vec![issue("i1", Priority::P3, 0)],
        ));
        assert_eq!(decision, PhaseDecision::new(Phase::Improve, Some("i1".into())));
    }

    #[test]
    fn no_actionable_issue_falls_back_to_discovery() {
        let mut done = issue("i1", Priority::P0, 0);
        done.status = IssueStatus::Resolved;
        let mut exhausted = issue("i2", Priority::P0, 1);
        exhausted.retry_count = 4;
        let decision = select_next_phase(&history(
            1,
            last(Phase::Test, CycleStatus::Completed, None),
            vec![done, exhausted],
        ));
        assert_eq!(decision, PhaseDecision::new(Phase::Discovery, None));
    }

    #[test]
    fn selection_is_deterministic() {
        let h = history(
            3,
            last(Phase::Review, CycleStatus::Completed, None),
            vec![issue("a", Priority::P2, 0), issue("b", Priority::P2, 0)],
        );
        let first = select_next_phase(&h);
        for _ in 0..10 {
            assert_eq!(select_next_phase(&h), first);
        }
        assert_eq!(first.issue_id.as_deref(), Some("a"));
    }

    #[test]
    fn completed_change_always_followed_by_test_for_any_history() {
        let priorities = [Priority::P0, Priority::P1, Priority::P2, Priority::P3];
        for n in 0..40 {
            for phase in [Phase::Fix, Phase::Improve] {
                let issues: Vec<_> = (0..(n % 4))
                    .map(|i| issue(&format!("i{}", i), priorities[(i as usize + n as usize) % 4], i as i64))
                    .collect();
                let decision = select_next_phase(&history(
                    n,
                    last(phase, CycleStatus::Completed, None),
                    issues,
                ));
                assert_eq!(decision.phase, Phase::Test, "cycle {}", n);
            }
        }
    }

    #[test]
    fn rate_limited_test_is_rerun_for_the_fixed_issue() {
        let cycles = vec![
            cycle(Phase::Fix, CycleStatus::Completed, Some("i1")),
            cycle(Phase::Test, CycleStatus::RateLimited, Some("i1")),
        ];
        let decision = select_next_phase(&history(
            2,
            CycleSnapshot::last_verdict(&cycles),
            vec![issue("i1", Priority::P0, 0), issue("i2", Priority::P0, 1)],
        ));
        assert_eq!(decision, PhaseDecision::new(Phase::Test, Some("i1".into())));
    }

    #[test]
    fn interrupted_test_does_not_trigger_a_refix() {
        let mut cut_short = cycle(Phase::Test, CycleStatus::Failed, Some("i1"));
        cut_short.interrupted = true;
        let cycles = vec![cycle(Phase::Fix, CycleStatus::Completed, Some("i1")), cut_short];

        let decision = select_next_phase(&history(
            2,
            CycleSnapshot::last_verdict(&cycles),
            vec![issue("i1", Priority::P0, 0)],
        ));
        assert_eq!(decision, PhaseDecision::new(Phase::Test, Some("i1".into())));
    }

    #[test]
    fn verdictless_last_cycle_is_ignored_even_when_passed_directly() {
        let mut snapshot = last(Phase::Test, CycleStatus::Failed, Some("i1"));
        if let Some(s) = snapshot.as_mut() {
            s.interrupted = true;
        }
        let decision = select_next_phase(&history(1, snapshot, vec![issue("i1", Priority::P3, 0)]));
        assert_eq!(decision, PhaseDecision::new(Phase::Improve, Some("i1".into())));

        let decision = select_next_phase(&history(
            1,
            last(Phase::Fix, CycleStatus::RateLimited, Some("i1")),
            vec![],
        ));
        assert_eq!(decision, PhaseDecision::new(Phase::Discovery, None));
    }

    #[test]
    fn only_rate_limited_history_has_no_verdict() {
        let cycles = vec![cycle(Phase::Discovery, CycleStatus::RateLimited, None)];
        assert_eq!(CycleSnapshot::last_verdict(&cycles), None);
    }

    #[test]
    fn snapshot_and_issue_agree_on_retries() {
        let mut full = Issue::new(crate::model::Category::Bug, Priority::P1, "flaky", "", 2);
        for (status, retry_count, expected) in [
            (IssueStatus::Open, 2, true),
            (IssueStatus::Open, 3, false),
            (IssueStatus::Resolved, 1, true),
            (IssueStatus::WontFix, 0, false),
            (IssueStatus::Duplicate, 0, false),
        ] {
            full.status = status;
            full.retry_count = retry_count;
            assert_eq!(full.has_retries_left(), expected, "{:?}/{}", status, retry_count);
            assert_eq!(IssueSnapshot::from(&full).has_retries_left(), expected);
        }
    }
}
