//! Persistent records manipulated by the cycle engine.
//!
//! These mirror the rows owned by the persistence layer: sessions, cycles,
//! issues (findings), pipeline agents and agent runs.

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle status of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Running,
    Paused,
    WaitingForLimit,
    Completed,
    Stopped,
}

impl SessionStatus {
    /// Returns true for statuses a session never leaves.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionStatus::Completed | SessionStatus::Stopped)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Running => "running",
            SessionStatus::Paused => "paused",
            SessionStatus::WaitingForLimit => "waiting_for_limit",
            SessionStatus::Completed => "completed",
            SessionStatus::Stopped => "stopped",
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Category of work a cycle performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Discovery,
    Fix,
    Test,
    Improve,
    Review,
    /// Multi-agent pipeline cycle.
    Pipeline,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Discovery => "discovery",
            Phase::Fix => "fix",
            Phase::Test => "test",
            Phase::Improve => "improve",
            Phase::Review => "review",
            Phase::Pipeline => "pipeline",
        }
    }

    /// Returns true for phases that change the target project.
    pub fn is_change(&self) -> bool {
        matches!(self, Phase::Fix | Phase::Improve | Phase::Pipeline)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of a single cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleStatus {
    Running,
    Completed,
    Failed,
    RateLimited,
    RolledBack,
}

/// Issue category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Bug,
    Improvement,
    Idea,
    TestFailure,
    Performance,
    Accessibility,
    Security,
}

impl Category {
    /// Parses a category leniently; unknown values map to `Improvement`.
    pub fn parse_lenient(value: &str) -> Self {
        match value.trim().to_lowercase().replace(['-', ' '], "_").as_str() {
            "bug" => Category::Bug,
            "idea" => Category::Idea,
            "test_failure" => Category::TestFailure,
            "performance" => Category::Performance,
            "accessibility" => Category::Accessibility,
            "security" => Category::Security,
            _ => Category::Improvement,
        }
    }
}

/// Issue priority. `P0` sorts first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Priority {
    P0,
    P1,
    P2,
    P3,
}

impl Priority {
    /// Parses `P0`..`P3` (case-insensitive, optional `P`); unknown values map to `P2`.
    pub fn parse_lenient(value: &str) -> Self {
        match value.trim().trim_start_matches(['p', 'P']) {
            "0" => Priority::P0,
            "1" => Priority::P1,
            "3" => Priority::P3,
            _ => Priority::P2,
        }
    }

    /// P0 and P1 are addressed by fix cycles, the rest by improve cycles.
    pub fn is_critical(&self) -> bool {
        matches!(self, Priority::P0 | Priority::P1)
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Status of an issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueStatus {
    Open,
    InProgress,
    Resolved,
    WontFix,
    Duplicate,
}

/// One autonomous run against a target project.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub project_path: PathBuf,
    pub status: SessionStatus,
    pub total_cycles: u32,
    pub total_cost_usd: f64,
    pub goal: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    /// Creates a running session.
    pub fn new(project_path: PathBuf, goal: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            id: String::new(),
            project_path,
            status: SessionStatus::Running,
            total_cycles: 0,
            total_cost_usd: 0.0,
            goal,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Test counts parsed from a verification result.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestCounts {
    pub passed: u32,
    pub failed: u32,
    pub total: u32,
}

/// One phase executed once within a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cycle {
    pub id: String,
    pub session_id: String,
    pub cycle_number: u32,
    pub phase: Phase,
    pub status: CycleStatus,
    pub issue_id: Option<String>,
    pub prompt: String,
    pub output: String,
    pub cost_usd: Option<f64>,
    pub duration_ms: Option<u64>,
    pub checkpoint: Option<String>,
    pub tests: Option<TestCounts>,
    pub error: Option<String>,
    /// Set when the cycle was cut short by pause or stop, or never got the
    /// executor. Such a cycle carries no verdict about its issue.
    #[serde(default)]
    pub interrupted: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Cycle {
    pub fn new(session_id: &str, cycle_number: u32, phase: Phase, issue_id: Option<String>) -> Self {
        Self {
            id: String::new(),
            session_id: session_id.to_string(),
            cycle_number,
            phase,
            status: CycleStatus::Running,
            issue_id,
            prompt: String::new(),
            output: String::new(),
            cost_usd: None,
            duration_ms: None,
            checkpoint: None,
            tests: None,
            error: None,
            interrupted: false,
            started_at: Utc::now(),
            finished_at: None,
        }
    }
}

/// Shared retry rule for issues and their snapshots.
pub(crate) fn retries_left(status: IssueStatus, retry_count: u32, max_retries: u32) -> bool {
    !matches!(status, IssueStatus::WontFix | IssueStatus::Duplicate) && retry_count <= max_retries
}

/// A unit of work discovered by analysis or review.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Issue {
    pub id: String,
    pub category: Category,
    pub priority: Priority,
    pub title: String,
    pub description: String,
    pub file_path: Option<String>,
    pub status: IssueStatus,
    pub retry_count: u32,
    pub max_retries: u32,
    pub resolved_cycle_id: Option<String>,
    pub source_cycle_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Issue {
    pub fn new(
        category: Category,
        priority: Priority,
        title: impl Into<String>,
        description: impl Into<String>,
        max_retries: u32,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: String::new(),
            category,
            priority,
            title: title.into(),
            description: description.into(),
            file_path: None,
            status: IssueStatus::Open,
            retry_count: 0,
            max_retries,
            resolved_cycle_id: None,
            source_cycle_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether another attempt may be made at this issue.
    pub fn has_retries_left(&self) -> bool {
        retries_left(self.status, self.retry_count, self.max_retries)
    }

    /// Records a failed attempt.
    ///
    /// An issue already at its ceiling becomes `wont_fix`; otherwise the retry
    /// counter is incremented and the issue reopened.
    pub fn record_failure(&mut self) {
        if self.retry_count >= self.max_retries {
            self.status = IssueStatus::WontFix;
        } else {
            self.retry_count += 1;
            self.status = IssueStatus::Open;
        }
        self.updated_at = Utc::now();
    }
}

/// A pipeline persona.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub id: String,
    pub name: String,
    pub display_name: String,
    pub role: String,
    pub instructions: String,
    pub position: u32,
    pub enabled: bool,
    pub builtin: bool,
}

/// Status of an agent run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentRunStatus {
    Running,
    Completed,
    Failed,
    RateLimited,
}

/// One persona invocation within one cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRun {
    pub id: String,
    pub cycle_id: String,
    pub agent_id: String,
    pub iteration: u32,
    pub status: AgentRunStatus,
    pub prompt: String,
    pub output: String,
    pub cost_usd: Option<f64>,
    pub duration_ms: Option<u64>,
    pub started_at: DateTime<Utc>,
}

impl AgentRun {
    pub fn new(cycle_id: &str, agent_id: &str, iteration: u32, prompt: String) -> Self {
        Self {
            id: String::new(),
            cycle_id: cycle_id.to_string(),
            agent_id: agent_id.to_string(),
            iteration,
            status: AgentRunStatus::Running,
            prompt,
            output: String::new(),
            cost_usd: None,
            duration_ms: None,
            started_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_orders_p0_first() {
        let mut priorities = vec![Priority::P3, Priority::P0, Priority::P2, Priority::P1];
        priorities.sort();
        assert_eq!(
            priorities,
            vec![Priority::P0, Priority::P1, Priority::P2, Priority::P3]
        );
    }

    #[test]
    fn priority_parses_leniently() {
        assert_eq!(Priority::parse_lenient("P0"), Priority::P0);
        assert_eq!(Priority::parse_lenient("p1"), Priority::P1);
        assert_eq!(Priority::parse_lenient("3"), Priority::P3);
        assert_eq!(Priority::parse_lenient("urgent"), Priority::P2);
    }

    #[test]
    fn category_parses_leniently() {
        assert_eq!(Category::parse_lenient("test-failure"), Category::TestFailure);
        assert_eq!(Category::parse_lenient("Security"), Category::Security);
        assert_eq!(Category::parse_lenient("refactor"), Category::Improvement);
    }

    #[test]
    fn session_status_serializes_snake_case() {
        assert_eq!(
            serde_json::to_string(&SessionStatus::WaitingForLimit).unwrap(),
            "\"waiting_for_limit\""
        );
        assert!(SessionStatus::Stopped.is_terminal());
        assert!(!SessionStatus::Paused.is_terminal());
    }

    #[test]
    fn record_failure_increments_until_ceiling() {
        let mut issue = Issue::new(Category::Bug, Priority::P1, "crash", "", 3);
        issue.retry_count = 2;

        issue.record_failure();
        assert_eq!(issue.retry_count, 3);
        assert_eq!(issue.status, IssueStatus::Open);
        assert!(issue.has_retries_left());

        issue.record_failure();
        assert_eq!(issue.retry_count, 3);
        assert_eq!(issue.status, IssueStatus::WontFix);
        assert!(!issue.has_retries_left());
    }

    #[test]
    fn zero_max_retries_gives_single_attempt() {
        let mut issue = Issue::new(Category::Bug, Priority::P0, "x", "", 0);
        assert!(issue.has_retries_left());
        issue.record_failure();
        assert_eq!(issue.status, IssueStatus::WontFix);
    }
}
