//! The cycle loop: prepare, execute and finalise one cycle at a time.

use std::collections::HashSet;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;

use super::{ActiveCycle, EngineInner, EngineState};
use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::events::EventType;
use crate::findings::{is_duplicate, parse_findings, parse_verification, Finding, VerificationOutcome};
use crate::git::GitManager;
use crate::model::{Category, Cycle, CycleStatus, Issue, IssueStatus, Phase, Priority, Session, SessionStatus};
use crate::phase::{select_next_phase, CycleSnapshot, IssueSnapshot, PhaseHistory};
use crate::pipeline::{forward_agent_event, session_summary, PipelineOutcome, PipelineRequest};
use crate::prompt::PhasePromptBuilder;
use crate::rate_limit::RateLimitInfo;
use crate::runner::{drive, InvocationOutcome};

/// How often a new loop checks whether the previous invocation has exited.
const RUNNER_IDLE_POLL: Duration = Duration::from_millis(50);

/// How a prepared cycle runs.
enum Work {
    Single { prompt: String },
    Pipeline(PipelineRequest),
}

/// A cycle that has been recorded and is ready to execute.
struct Prepared {
    session_id: String,
    project_path: std::path::PathBuf,
    cycle: Cycle,
    issue: Option<Issue>,
    config: EngineConfig,
    work: Work,
}

/// What an execution produced, independent of how it ran.
#[derive(Default)]
struct Executed {
    success: bool,
    output: String,
    cost_usd: Option<f64>,
    duration_ms: u64,
    error: Option<String>,
    verification: Option<VerificationOutcome>,
    review_issues: Vec<Finding>,
    rate_limit: Option<RateLimitInfo>,
    /// The executor refused the invocation; nothing was attempted.
    not_attempted: bool,
}

impl From<PipelineOutcome> for Executed {
    fn from(outcome: PipelineOutcome) -> Self {
        Self {
            success: outcome.success,
            output: outcome.output,
            cost_usd: Some(outcome.cost_usd),
            duration_ms: outcome.duration_ms,
            error: outcome.error,
            verification: outcome.verification,
            review_issues: outcome.review_issues,
            rate_limit: outcome.rate_limit,
            not_attempted: false,
        }
    }
}

/// Whether the loop keeps going after a cycle.
enum Flow {
    Continue,
    Halt,
}

impl EngineInner {
    pub(super) async fn run_loop(self: Arc<Self>, generation: u64) {
        tracing::debug!(generation, "cycle loop started");
        loop {
            if !self.wait_for_idle_runner(generation).await {
                return;
            }
            let prepared = {
                let mut state = self.lock();
                if state.generation != generation {
                    return;
                }
                match self.prepare_cycle(&mut state) {
                    Ok(Some(prepared)) => Some(prepared),
                    Ok(None) => return,
                    Err(e) => {
                        self.record_loop_error(&mut state, None, &e);
                        None
                    }
                }
            };
            let Some(prepared) = prepared else {
                tokio::time::sleep(self.base_config.cycle_delay()).await;
                continue;
            };

            let delay = prepared.config.cycle_delay();
            let executed = self.execute_cycle(&prepared).await;

            let flow = {
                let mut state = self.lock();
                if state.generation != generation {
                    // Paused or stopped mid-cycle; the interrupt already
                    // finalised this cycle.
                    return;
                }
                match self.finish_cycle(&mut state, &prepared, executed) {
                    Ok(flow) => flow,
                    Err(e) => {
                        self.record_loop_error(&mut state, Some(&prepared.cycle), &e);
                        Flow::Continue
                    }
                }
            };

            match flow {
                Flow::Continue => tokio::time::sleep(delay).await,
                Flow::Halt => return,
            }
        }
    }

    /// Waits for a previous, killed invocation to release the executor.
    ///
    /// Returns `false` once this loop has been superseded.
    async fn wait_for_idle_runner(&self, generation: u64) -> bool {
        let mut waited = false;
        while self.runner.is_running() {
            if self.lock().generation != generation {
                return false;
            }
            if !waited {
                tracing::debug!(generation, "waiting for the previous invocation to exit");
                waited = true;
            }
            tokio::time::sleep(RUNNER_IDLE_POLL).await;
        }
        self.lock().generation == generation
    }

    /// Applies safety limits, selects the phase and records the new cycle.
    ///
    /// Returns `None` when the session left the running state.
    fn prepare_cycle(&self, state: &mut EngineState) -> Result<Option<Prepared>> {
        let Some(session_id) = state.session_id.clone() else {
            return Ok(None);
        };
        let mut session = self.store.get_session(&session_id)?;
        if session.status != SessionStatus::Running {
            return Ok(None);
        }
        let config = self.effective_config()?;
        let cycles = self.store.list_cycles(&session_id)?;
        let cycle_number = cycles.len() as u32;

        if config.budget_usd > 0.0 && session.total_cost_usd >= config.budget_usd {
            let reason = format!(
                "budget exhausted: ${:.2} of ${:.2}",
                session.total_cost_usd, config.budget_usd
            );
            self.complete_session(state, &mut session, &reason)?;
            return Ok(None);
        }
        if config.max_cycles > 0 && cycle_number >= config.max_cycles {
            let reason = format!("reached max cycles ({})", config.max_cycles);
            self.complete_session(state, &mut session, &reason)?;
            return Ok(None);
        }
        let failure_ceiling = config.max_consecutive_failures.max(1);
        if state.consecutive_failures >= failure_ceiling {
            let reason = format!("{} consecutive failures", state.consecutive_failures);
            tracing::warn!(session_id = %session.id, failures = state.consecutive_failures, "pausing session");
            session.status = SessionStatus::Paused;
            self.store.update_session(&session)?;
            self.emit_session_status(&session, Some(&reason));
            self.publish(state, Some(&session));
            return Ok(None);
        }

        let issues = self.store.list_issues()?;
        let history = PhaseHistory {
            cycle_number,
            last_cycle: CycleSnapshot::last_verdict(&cycles),
            issues: issues.iter().map(IssueSnapshot::from).collect(),
            review_interval: config.review_interval,
            discovery_interval: config.discovery_interval,
        };
        let decision = select_next_phase(&history);

        let pipelined = config.pipeline_mode
            && (matches!(decision.phase, Phase::Fix | Phase::Improve)
                || (decision.phase == Phase::Discovery
                    && cycle_number == 0
                    && session.goal.is_some()));
        let phase = if pipelined { Phase::Pipeline } else { decision.phase };
        let mut issue = decision
            .issue_id
            .as_ref()
            .and_then(|id| issues.iter().find(|i| &i.id == id).cloned());

        tracing::info!(
            session_id = %session.id,
            cycle = cycle_number,
            phase = %phase,
            issue_id = ?decision.issue_id,
            "starting cycle"
        );
        self.events.emit(
            EventType::PhaseChange,
            json!({
                "cycle_number": cycle_number,
                "phase": phase,
                "selected": decision.phase,
                "issue_id": decision.issue_id,
            }),
        );

        let checkpoint = if config.auto_commit && phase.is_change() {
            self.checkpoint(&session, cycle_number, phase)
        } else {
            None
        };

        let mut cycle = Cycle::new(&session.id, cycle_number, phase, decision.issue_id.clone());
        cycle.checkpoint = checkpoint.clone();

        let open_issues: Vec<Issue> = issues
            .iter()
            .filter(|i| i.status == IssueStatus::Open)
            .cloned()
            .collect();
        let summary = session_summary(cycle_number, open_issues.len(), session.total_cost_usd);

        let work = if pipelined {
            cycle.prompt = pipeline_context(&session, issue.as_ref(), &summary, decision.phase);
            Work::Pipeline(PipelineRequest {
                cycle_id: String::new(),
                phase: decision.phase,
                project_path: session.project_path.clone(),
                goal: session.goal.clone(),
                issue: issue.clone(),
                session_summary: summary,
                checkpoint,
                test_command: config.test_command.clone(),
                review_max_iterations: config.review_max_iterations,
                skip_design_on_fix: config.skip_design_on_fix,
                cancel: Arc::new(AtomicBool::new(false)),
            })
        } else {
            let recent = &cycles[cycles.len().saturating_sub(5)..];
            let prompt = PhasePromptBuilder::new(phase, &session.project_path)
                .with_goal(session.goal.as_deref())
                .with_issue(issue.as_ref())
                .with_open_issues(&open_issues)
                .with_test_command(config.test_command.as_deref())
                .with_recent_cycles(recent)
                .build();
            cycle.prompt = prompt.clone();
            Work::Single { prompt }
        };

        let cycle = self.store.create_cycle(cycle)?;
        if phase.is_change() {
            if let Some(issue) = issue.as_mut() {
                issue.status = IssueStatus::InProgress;
                if let Err(e) = self.store.update_issue(issue) {
                    self.abandon_cycle(&cycle, &e);
                    return Err(e);
                }
            }
        }
        let work = match work {
            Work::Pipeline(mut request) => {
                request.cycle_id = cycle.id.clone();
                Work::Pipeline(request)
            }
            single => single,
        };
        let cancel = match &work {
            Work::Pipeline(request) => request.cancel.clone(),
            Work::Single { .. } => Arc::new(AtomicBool::new(false)),
        };

        state.active_cycle = Some(ActiveCycle {
            cycle_id: cycle.id.clone(),
            cycle_number,
            phase,
            issue_id: cycle.issue_id.clone(),
            cancel,
        });
        self.events.emit(
            EventType::CycleStart,
            json!({
                "cycle_id": cycle.id,
                "cycle_number": cycle_number,
                "phase": phase,
                "issue_id": cycle.issue_id,
            }),
        );
        self.publish(state, Some(&session));

        Ok(Some(Prepared {
            session_id: session.id,
            project_path: session.project_path,
            cycle,
            issue,
            config,
            work,
        }))
    }

    /// Closes a recorded cycle that could not be started.
    fn abandon_cycle(&self, cycle: &Cycle, error: &Error) {
        let mut cycle = cycle.clone();
        cycle.status = CycleStatus::Failed;
        cycle.error = Some(error.to_string());
        cycle.finished_at = Some(Utc::now());
        if let Err(e) = self.store.update_cycle(&cycle) {
            tracing::error!(error = %e, cycle = cycle.cycle_number, "could not record abandoned cycle");
        }
    }

    fn checkpoint(&self, session: &Session, cycle_number: u32, phase: Phase) -> Option<String> {
        let git = GitManager::new(&session.project_path);
        let label = format!("before cycle {} ({})", cycle_number, phase);
        match git.create_checkpoint(&label) {
            Ok(Some(commit)) => {
                self.events.emit(
                    EventType::GitCheckpoint,
                    json!({ "cycle_number": cycle_number, "commit": commit }),
                );
                Some(commit)
            }
            Ok(None) => None,
            Err(e) => {
                tracing::warn!(error = %e, cycle = cycle_number, "checkpoint failed");
                None
            }
        }
    }

    async fn execute_cycle(&self, prepared: &Prepared) -> Executed {
        match &prepared.work {
            Work::Pipeline(request) => match self.pipeline.run(request.clone()).await {
                Ok(outcome) => outcome.into(),
                Err(e) => Executed {
                    error: Some(e.to_string()),
                    ..Default::default()
                },
            },
            Work::Single { prompt } => {
                let rx = match self.runner.execute(prompt, &prepared.project_path).await {
                    Ok(rx) => rx,
                    Err(Error::ExecutorBusy) => {
                        return Executed {
                            error: Some(Error::ExecutorBusy.to_string()),
                            not_attempted: true,
                            ..Default::default()
                        }
                    }
                    Err(e) => {
                        return Executed {
                            error: Some(e.to_string()),
                            ..Default::default()
                        }
                    }
                };
                let interrupted = self
                    .lock()
                    .active_cycle
                    .as_ref()
                    .map_or(true, |active| active.cycle_id != prepared.cycle.id);
                if interrupted {
                    self.runner.kill();
                }

                let events = self.events.clone();
                let cycle_id = prepared.cycle.id.clone();
                let outcome = drive(rx, |event| forward_agent_event(&events, &cycle_id, None, event)).await;
                match outcome {
                    InvocationOutcome::Completed(c) => Executed {
                        success: c.success,
                        output: c.output,
                        cost_usd: c.cost_usd,
                        duration_ms: c.duration_ms,
                        error: c.error,
                        ..Default::default()
                    },
                    InvocationOutcome::RateLimited(info) => Executed {
                        error: Some(info.message.clone()),
                        rate_limit: Some(info),
                        ..Default::default()
                    },
                }
            }
        }
    }

    /// Records the outcome of an executed cycle.
    fn finish_cycle(
        self: &Arc<Self>,
        state: &mut EngineState,
        prepared: &Prepared,
        executed: Executed,
    ) -> Result<Flow> {
        state.active_cycle = None;
        let mut session = self.store.get_session(&prepared.session_id)?;
        let mut cycle = prepared.cycle.clone();
        let phase = cycle.phase;

        if executed.not_attempted {
            return self.skip_cycle(state, session, cycle, prepared.issue.as_ref(), executed.error);
        }

        cycle.output = executed.output;
        cycle.cost_usd = executed.cost_usd;
        cycle.duration_ms = Some(executed.duration_ms);
        cycle.finished_at = Some(Utc::now());
        session.total_cycles = cycle.cycle_number + 1;
        session.total_cost_usd += executed.cost_usd.unwrap_or(0.0);

        if let Some(info) = executed.rate_limit {
            return self.handle_rate_limit(state, session, cycle, prepared.issue.as_ref(), info);
        }
        state.backoff.reset();

        let mut success = executed.success;
        let mut error = executed.error;

        let verification = match (phase, executed.verification) {
            (Phase::Test, _) if success => Some(parse_verification(&cycle.output)),
            (_, verification) => verification,
        };
        if let Some(verification) = &verification {
            cycle.tests = verification.counts;
            self.emit_test_result(&cycle, verification);
            if phase == Phase::Test && !verification.passed() {
                success = false;
                let failed = verification.counts.map_or(0, |c| c.failed);
                error = Some(format!("{} tests failed", failed));
            }
            let failures: Vec<Finding> = verification
                .failures
                .iter()
                .map(|f| Finding {
                    category: Category::TestFailure,
                    priority: Priority::P1,
                    title: format!("Failing test: {}", f.name),
                    description: f.message.clone(),
                    file_path: f.file_path.clone(),
                })
                .collect();
            self.persist_findings(&cycle, failures, &prepared.config)?;
        }

        if !executed.review_issues.is_empty() {
            self.persist_findings(&cycle, executed.review_issues, &prepared.config)?;
        }

        cycle.error = error.clone();
        if success {
            state.consecutive_failures = 0;
            cycle.status = CycleStatus::Completed;
            match phase {
                Phase::Discovery | Phase::Review => {
                    let findings = parse_findings(&cycle.output);
                    self.persist_findings(&cycle, findings, &prepared.config)?;
                }
                Phase::Fix | Phase::Improve | Phase::Pipeline => {
                    if let Some(issue) = &prepared.issue {
                        self.resolve_issue(&issue.id, &cycle)?;
                    }
                }
                Phase::Test => {}
            }
            tracing::info!(cycle = cycle.cycle_number, phase = %phase, cost = ?cycle.cost_usd, "cycle completed");
            self.events.emit(
                EventType::CycleComplete,
                json!({
                    "cycle_id": cycle.id,
                    "cycle_number": cycle.cycle_number,
                    "phase": phase,
                    "cost_usd": cycle.cost_usd,
                    "duration_ms": cycle.duration_ms,
                }),
            );
        } else {
            state.consecutive_failures += 1;
            cycle.status = CycleStatus::Failed;
            if phase.is_change() {
                if let Some(issue) = &prepared.issue {
                    self.fail_issue(&issue.id, error.as_deref())?;
                }
                if prepared.config.auto_commit {
                    if let Some(checkpoint) = &cycle.checkpoint {
                        if self.rollback(&prepared.project_path, checkpoint, cycle.cycle_number) {
                            cycle.status = CycleStatus::RolledBack;
                        }
                    }
                }
            }
            tracing::warn!(
                cycle = cycle.cycle_number,
                phase = %phase,
                error = ?error,
                consecutive_failures = state.consecutive_failures,
                "cycle failed"
            );
            self.events.emit(
                EventType::CycleFailed,
                json!({
                    "cycle_id": cycle.id,
                    "cycle_number": cycle.cycle_number,
                    "phase": phase,
                    "error": error,
                    "consecutive_failures": state.consecutive_failures,
                }),
            );
        }

        self.store.update_cycle(&cycle)?;
        self.store.update_session(&session)?;
        self.publish(state, Some(&session));
        Ok(Flow::Continue)
    }

    /// Closes a cycle the executor never ran. It carries no verdict and
    /// costs the issue no retry.
    fn skip_cycle(
        &self,
        state: &mut EngineState,
        mut session: Session,
        mut cycle: Cycle,
        issue: Option<&Issue>,
        error: Option<String>,
    ) -> Result<Flow> {
        cycle.status = CycleStatus::Failed;
        cycle.interrupted = true;
        cycle.error = error;
        cycle.finished_at = Some(Utc::now());
        self.store.update_cycle(&cycle)?;
        session.total_cycles = cycle.cycle_number + 1;
        self.store.update_session(&session)?;

        if let Some(issue) = issue {
            let mut issue = self.store.get_issue(&issue.id)?;
            if issue.status == IssueStatus::InProgress {
                issue.status = IssueStatus::Open;
                self.store.update_issue(&issue)?;
            }
        }

        tracing::warn!(cycle = cycle.cycle_number, error = ?cycle.error, "executor busy, cycle skipped");
        self.events.emit(
            EventType::CycleFailed,
            json!({
                "cycle_id": cycle.id,
                "cycle_number": cycle.cycle_number,
                "phase": cycle.phase,
                "error": cycle.error,
                "skipped": true,
            }),
        );
        self.publish(state, Some(&session));
        Ok(Flow::Continue)
    }

    fn handle_rate_limit(
        self: &Arc<Self>,
        state: &mut EngineState,
        mut session: Session,
        mut cycle: Cycle,
        issue: Option<&Issue>,
        info: RateLimitInfo,
    ) -> Result<Flow> {
        cycle.status = CycleStatus::RateLimited;
        cycle.error = Some(info.message.clone());
        self.store.update_cycle(&cycle)?;

        if let Some(issue) = issue {
            let mut issue = self.store.get_issue(&issue.id)?;
            if issue.status == IssueStatus::InProgress {
                issue.status = IssueStatus::Open;
                self.store.update_issue(&issue)?;
            }
        }

        let delay = state.backoff.delay(info.retry_after_seconds);
        let retry_at = Utc::now()
            + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
        session.status = SessionStatus::WaitingForLimit;
        self.store.update_session(&session)?;

        tracing::warn!(
            cycle = cycle.cycle_number,
            delay_secs = delay.as_secs(),
            attempt = state.backoff.attempts(),
            message = %info.message,
            "rate limited, waiting"
        );
        self.events.emit(
            EventType::RateLimit,
            json!({
                "cycle_id": cycle.id,
                "cycle_number": cycle.cycle_number,
                "message": info.message,
                "source": info.source,
                "delay_ms": delay.as_millis() as u64,
                "retry_at": retry_at,
            }),
        );
        self.emit_session_status(&session, Some("rate limited"));

        if let Some(timer) = state.resume_timer.take() {
            timer.abort();
        }
        state.resume_at = Some(retry_at);
        let inner = Arc::clone(self);
        let generation = state.generation;
        state.resume_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            inner.resume_after_limit(generation);
        }));

        self.publish(state, Some(&session));
        Ok(Flow::Halt)
    }

    fn resume_after_limit(self: &Arc<Self>, generation: u64) {
        let mut state = self.lock();
        if state.generation != generation {
            return;
        }
        state.resume_timer = None;
        state.resume_at = None;

        let Some(session_id) = state.session_id.clone() else {
            return;
        };
        let result = self.store.get_session(&session_id).and_then(|mut session| {
            if session.status != SessionStatus::WaitingForLimit {
                return Ok(None);
            }
            session.status = SessionStatus::Running;
            self.store.update_session(&session)?;
            Ok(Some(session))
        });
        match result {
            Ok(Some(session)) => {
                tracing::info!(session_id = %session.id, "rate limit wait over, resuming");
                self.emit_session_status(&session, Some("rate limit wait over"));
                self.publish(&state, Some(&session));
                self.spawn_loop(generation);
            }
            Ok(None) => {}
            Err(e) => tracing::error!(error = %e, "failed to resume after rate limit"),
        }
    }

    fn complete_session(&self, state: &mut EngineState, session: &mut Session, reason: &str) -> Result<()> {
        session.status = SessionStatus::Completed;
        self.store.update_session(session)?;
        tracing::info!(
            session_id = %session.id,
            cycles = session.total_cycles,
            cost = session.total_cost_usd,
            reason,
            "session completed"
        );
        self.emit_session_status(session, Some(reason));
        self.clear_session(state);
        self.publish(state, Some(session));
        Ok(())
    }

    /// Stores new findings, skipping near-duplicates of unresolved issues.
    fn persist_findings(&self, cycle: &Cycle, findings: Vec<Finding>, config: &EngineConfig) -> Result<()> {
        if findings.is_empty() {
            return Ok(());
        }
        let mut titles: Vec<String> = self
            .store
            .list_issues()?
            .into_iter()
            .filter(|i| matches!(i.status, IssueStatus::Open | IssueStatus::InProgress))
            .map(|i| i.title)
            .collect();
        let mut seen = HashSet::new();

        for finding in findings {
            if !seen.insert(finding.title.to_lowercase())
                || is_duplicate(&finding.title, titles.iter().map(String::as_str))
            {
                tracing::debug!(title = %finding.title, "skipping duplicate finding");
                continue;
            }
            let mut issue = Issue::new(
                finding.category,
                finding.priority,
                finding.title,
                finding.description,
                config.max_retries,
            );
            issue.file_path = finding.file_path;
            issue.source_cycle_id = Some(cycle.id.clone());
            let issue = self.store.create_issue(issue)?;

            self.events.emit(
                EventType::IssueCreated,
                json!({
                    "issue_id": issue.id,
                    "title": issue.title,
                    "category": issue.category,
                    "priority": issue.priority,
                    "cycle_id": cycle.id,
                }),
            );
            titles.push(issue.title);
        }
        Ok(())
    }

    fn resolve_issue(&self, issue_id: &str, cycle: &Cycle) -> Result<()> {
        let mut issue = self.store.get_issue(issue_id)?;
        issue.status = IssueStatus::Resolved;
        issue.resolved_cycle_id = Some(cycle.id.clone());
        self.store.update_issue(&issue)?;
        tracing::info!(issue_id, title = %issue.title, "issue resolved");
        self.events.emit(
            EventType::IssueResolved,
            json!({ "issue_id": issue.id, "title": issue.title, "cycle_id": cycle.id }),
        );
        Ok(())
    }

    fn fail_issue(&self, issue_id: &str, error: Option<&str>) -> Result<()> {
        let mut issue = self.store.get_issue(issue_id)?;
        issue.record_failure();
        self.store.update_issue(&issue)?;
        self.events.emit(
            EventType::IssueFailed,
            json!({
                "issue_id": issue.id,
                "title": issue.title,
                "status": issue.status,
                "retry_count": issue.retry_count,
                "max_retries": issue.max_retries,
                "error": error,
            }),
        );
        Ok(())
    }

    /// Restores the checkpoint. Returns whether the tree was rolled back.
    fn rollback(&self, project_path: &std::path::Path, checkpoint: &str, cycle_number: u32) -> bool {
        match GitManager::new(project_path).rollback(checkpoint) {
            Ok(()) => {
                tracing::info!(cycle = cycle_number, commit = %checkpoint, "rolled back");
                self.events.emit(
                    EventType::GitRollback,
                    json!({ "cycle_number": cycle_number, "commit": checkpoint }),
                );
                true
            }
            Err(e) => {
                tracing::error!(error = %e, commit = %checkpoint, "rollback failed");
                false
            }
        }
    }

    fn emit_test_result(&self, cycle: &Cycle, verification: &VerificationOutcome) {
        let counts = verification.counts.unwrap_or_default();
        self.events.emit(
            EventType::TestResult,
            json!({
                "cycle_id": cycle.id,
                "passed": counts.passed,
                "failed": counts.failed,
                "total": counts.total,
                "skipped": verification.skipped,
                "parsed": verification.counts.is_some(),
            }),
        );
    }

    /// Logs an error raised while driving the loop and counts it as a failure.
    fn record_loop_error(&self, state: &mut EngineState, cycle: Option<&Cycle>, error: &Error) {
        tracing::error!(error = %error, cycle = ?cycle.map(|c| c.cycle_number), "cycle loop error");
        state.active_cycle = None;
        state.consecutive_failures += 1;

        if let Some(cycle) = cycle {
            let mut cycle = cycle.clone();
            cycle.status = CycleStatus::Failed;
            cycle.error = Some(error.to_string());
            cycle.finished_at = Some(Utc::now());
            if let Err(e) = self.store.update_cycle(&cycle) {
                tracing::error!(error = %e, "could not record failed cycle");
            }
        }

        self.events.emit(
            EventType::Error,
            json!({ "message": error.to_string(), "cycle_id": cycle.map(|c| c.id.clone()) }),
        );
        self.publish(state, None);
    }
}

/// Context recorded as the prompt of a pipeline cycle.
fn pipeline_context(session: &Session, issue: Option<&Issue>, summary: &str, work: Phase) -> String {
    let mut context = format!("pipeline ({})\n{}\n", work, summary);
    if let Some(goal) = &session.goal {
        context.push_str(&format!("Goal: {}\n", goal));
    }
    if let Some(issue) = issue {
        context.push_str(&format!("Issue: [{}] {}\n", issue.priority, issue.title));
    }
    context
}
