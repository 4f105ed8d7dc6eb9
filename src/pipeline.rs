//! Multi-agent pipeline for one cycle.
//!
//! Enabled personas run in position order. After the reviewer, a bounded
//! reviewer/developer loop runs until the reviewer approves or the iteration
//! cap is reached, after which the pipeline proceeds regardless.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use serde_json::json;

use crate::agents::{AgentContextBuilder, AgentKind};
use crate::error::Result;
use crate::events::{EventBus, EventType};
use crate::findings::{parse_review, parse_verification, Finding, ReviewOutcome, VerificationOutcome};
use crate::git::GitManager;
use crate::model::{Agent, AgentRun, AgentRunStatus, Issue, Phase};
use crate::rate_limit::RateLimitInfo;
use crate::runner::{drive, AgentEvent, AgentRunner, Completion, InvocationOutcome};
use crate::store::Store;

/// Input for one pipeline run.
#[derive(Debug, Clone)]
pub struct PipelineRequest {
    pub cycle_id: String,
    /// The work this pipeline stands in for: fix, improve or discovery.
    pub phase: Phase,
    pub project_path: PathBuf,
    pub goal: Option<String>,
    pub issue: Option<Issue>,
    pub session_summary: String,
    /// Commit the reviewer's diff is taken against.
    pub checkpoint: Option<String>,
    pub test_command: Option<String>,
    pub review_max_iterations: u32,
    pub skip_design_on_fix: bool,
    /// Set to stop the pipeline before its next persona.
    pub cancel: Arc<AtomicBool>,
}

/// Result of a pipeline run.
#[derive(Debug, Clone, Default)]
pub struct PipelineOutcome {
    pub success: bool,
    pub cost_usd: f64,
    pub duration_ms: u64,
    /// Every persona's output, labelled.
    pub output: String,
    /// Reviewer issues still open when the loop ended.
    pub review_issues: Vec<Finding>,
    pub verification: Option<VerificationOutcome>,
    pub rate_limit: Option<RateLimitInfo>,
    pub aborted: bool,
    pub error: Option<String>,
}

/// Terminal state of one persona invocation.
enum Step {
    Done(Completion),
    RateLimited(RateLimitInfo),
}

/// Runs pipeline personas through an [`AgentRunner`].
pub struct PipelineExecutor {
    store: Arc<dyn Store>,
    runner: Arc<dyn AgentRunner>,
    events: Arc<EventBus>,
}

/// Republishes an assistant event on the bus.
pub(crate) fn forward_agent_event(
    events: &EventBus,
    cycle_id: &str,
    agent: Option<&str>,
    event: AgentEvent,
) {
    match event {
        AgentEvent::Text { text } => events.emit(
            EventType::Text,
            json!({ "cycle_id": cycle_id, "agent": agent, "text": text }),
        ),
        AgentEvent::ToolStart { name } => events.emit(
            EventType::ToolStart,
            json!({ "cycle_id": cycle_id, "agent": agent, "tool": name }),
        ),
        AgentEvent::ToolEnd { name } => events.emit(
            EventType::ToolEnd,
            json!({ "cycle_id": cycle_id, "agent": agent, "tool": name }),
        ),
    }
}

impl PipelineExecutor {
    pub fn new(store: Arc<dyn Store>, runner: Arc<dyn AgentRunner>, events: Arc<EventBus>) -> Self {
        Self {
            store,
            runner,
            events,
        }
    }

    /// Runs the enabled personas for one cycle.
    pub async fn run(&self, request: PipelineRequest) -> Result<PipelineOutcome> {
        let start = Instant::now();
        let agents: Vec<Agent> = self
            .store
            .list_agents()?
            .into_iter()
            .filter(|a| a.enabled)
            .filter(|a| {
                !(request.skip_design_on_fix
                    && request.phase == Phase::Fix
                    && AgentKind::of(a) == AgentKind::Design)
            })
            .collect();
        let developer = agents
            .iter()
            .find(|a| AgentKind::of(a) == AgentKind::Implement)
            .cloned();

        tracing::info!(
            cycle_id = %request.cycle_id,
            agents = agents.len(),
            phase = %request.phase,
            "starting pipeline"
        );

        let mut outcome = PipelineOutcome {
            success: true,
            ..Default::default()
        };
        let mut prior: Vec<(String, String)> = Vec::new();

        for agent in &agents {
            if request.cancel.load(Ordering::SeqCst) {
                outcome.aborted = true;
                break;
            }

            let kind = AgentKind::of(agent);
            let diff = match kind {
                AgentKind::Review => self.diff(&request),
                _ => None,
            };
            let context = self.context(agent, &request, &prior, diff.as_deref(), None);

            let completion = match self.invoke(agent, &request, 1, context, &mut outcome).await? {
                Some(completion) => completion,
                None => break,
            };
            prior.push((agent.display_name.clone(), completion.output.clone()));

            match kind {
                AgentKind::Review => {
                    let review = parse_review(&completion.output);
                    let review = match &developer {
                        Some(developer) => {
                            self.review_loop(agent, developer, &request, &mut prior, review, &mut outcome)
                                .await?
                        }
                        None => {
                            tracing::warn!("no enabled developer persona, skipping review loop");
                            Some(review)
                        }
                    };
                    match review {
                        Some(review) if !review.approved => outcome.review_issues = review.issues,
                        Some(_) => {}
                        None => break,
                    }
                }
                AgentKind::Verify => {
                    let verification = parse_verification(&completion.output);
                    if !verification.passed() {
                        outcome.success = false;
                        let failed = verification.counts.map_or(0, |c| c.failed);
                        outcome.error = Some(format!("verification reported {} failing tests", failed));
                    }
                    outcome.verification = Some(verification);
                }
                _ => {}
            }
        }

        if outcome.aborted || outcome.rate_limit.is_some() {
            outcome.success = false;
        }
        outcome.duration_ms = start.elapsed().as_millis() as u64;
        outcome.output = prior
            .iter()
            .map(|(name, output)| format!("## {}\n\n{}", name, output))
            .collect::<Vec<_>>()
            .join("\n\n");

        tracing::info!(
            cycle_id = %request.cycle_id,
            success = outcome.success,
            cost_usd = outcome.cost_usd,
            aborted = outcome.aborted,
            rate_limited = outcome.rate_limit.is_some(),
            "pipeline finished"
        );
        Ok(outcome)
    }

    /// Reviewer/developer rework loop. Returns `None` when the pipeline must stop.
    async fn review_loop(
        &self,
        reviewer: &Agent,
        developer: &Agent,
        request: &PipelineRequest,
        prior: &mut Vec<(String, String)>,
        mut review: ReviewOutcome,
        outcome: &mut PipelineOutcome,
    ) -> Result<Option<ReviewOutcome>> {
        let mut iteration = 1;
        while !review.approved && iteration <= request.review_max_iterations {
            if request.cancel.load(Ordering::SeqCst) {
                outcome.aborted = true;
                return Ok(None);
            }
            iteration += 1;

            self.events.emit(
                EventType::ReviewIteration,
                json!({
                    "cycle_id": request.cycle_id,
                    "iteration": iteration,
                    "max_iterations": request.review_max_iterations,
                    "issues": review.issues.len(),
                }),
            );
            tracing::info!(iteration, issues = review.issues.len(), "review not approved, reworking");

            let context = self.context(developer, request, prior, None, Some(&review));
            let Some(fix) = self.invoke(developer, request, iteration, context, outcome).await? else {
                return Ok(None);
            };
            prior.push((developer.display_name.clone(), fix.output));

            if request.cancel.load(Ordering::SeqCst) {
                outcome.aborted = true;
                return Ok(None);
            }

            let diff = self.diff(request);
            let context = self.context(reviewer, request, prior, diff.as_deref(), None);
            let Some(rereview) = self.invoke(reviewer, request, iteration, context, outcome).await?
            else {
                return Ok(None);
            };
            review = parse_review(&rereview.output);
            prior.push((reviewer.display_name.clone(), rereview.output));
        }

        if !review.approved {
            tracing::warn!(
                iterations = request.review_max_iterations,
                "review loop exhausted without approval, proceeding"
            );
        }
        Ok(Some(review))
    }

    fn diff(&self, request: &PipelineRequest) -> Option<String> {
        let checkpoint = request.checkpoint.as_deref()?;
        match GitManager::new(&request.project_path).get_diff(checkpoint) {
            Ok(diff) => Some(diff),
            Err(e) => {
                tracing::warn!(error = %e, "could not compute diff for review");
                None
            }
        }
    }

    fn context(
        &self,
        agent: &Agent,
        request: &PipelineRequest,
        prior: &[(String, String)],
        diff: Option<&str>,
        feedback: Option<&ReviewOutcome>,
    ) -> String {
        let mut builder = AgentContextBuilder::new(agent)
            .with_goal(request.goal.as_deref())
            .with_session_summary(request.session_summary.clone())
            .with_issue(request.issue.as_ref())
            .with_diff(diff)
            .with_review_feedback(feedback)
            .with_test_command(request.test_command.as_deref());
        for (name, output) in prior {
            builder = builder.with_prior_output(name, output);
        }
        builder.build()
    }

    /// Runs one persona and records it. Returns `None` when the pipeline must stop.
    async fn invoke(
        &self,
        agent: &Agent,
        request: &PipelineRequest,
        iteration: u32,
        context: String,
        outcome: &mut PipelineOutcome,
    ) -> Result<Option<Completion>> {
        let mut run = self.store.create_agent_run(AgentRun::new(
            &request.cycle_id,
            &agent.id,
            iteration,
            context.clone(),
        ))?;

        self.events.emit(
            EventType::AgentStart,
            json!({
                "cycle_id": request.cycle_id,
                "agent": agent.name,
                "display_name": agent.display_name,
                "iteration": iteration,
            }),
        );

        let step = self.execute(agent, request, &context).await;

        match step {
            Step::RateLimited(info) => {
                run.status = AgentRunStatus::RateLimited;
                self.store.update_agent_run(&run)?;
                self.events.emit(
                    EventType::AgentFailed,
                    json!({
                        "cycle_id": request.cycle_id,
                        "agent": agent.name,
                        "iteration": iteration,
                        "error": "rate limited",
                    }),
                );
                outcome.rate_limit = Some(info);
                Ok(None)
            }
            Step::Done(completion) => {
                run.output = completion.output.clone();
                run.cost_usd = completion.cost_usd;
                run.duration_ms = Some(completion.duration_ms);
                outcome.cost_usd += completion.cost_usd.unwrap_or(0.0);

                if completion.success {
                    run.status = AgentRunStatus::Completed;
                    self.store.update_agent_run(&run)?;
                    self.events.emit(
                        EventType::AgentComplete,
                        json!({
                            "cycle_id": request.cycle_id,
                            "agent": agent.name,
                            "iteration": iteration,
                            "cost_usd": completion.cost_usd,
                            "duration_ms": completion.duration_ms,
                        }),
                    );
                    return Ok(Some(completion));
                }

                run.status = AgentRunStatus::Failed;
                self.store.update_agent_run(&run)?;
                let error = completion
                    .error
                    .clone()
                    .unwrap_or_else(|| "agent failed".to_string());
                self.events.emit(
                    EventType::AgentFailed,
                    json!({
                        "cycle_id": request.cycle_id,
                        "agent": agent.name,
                        "iteration": iteration,
                        "error": error,
                    }),
                );
                tracing::warn!(agent = %agent.name, error = %error, "pipeline agent failed");

                if request.cancel.load(Ordering::SeqCst) {
                    outcome.aborted = true;
                }
                outcome.success = false;
                outcome.error = Some(format!("{}: {}", agent.display_name, error));
                Ok(None)
            }
        }
    }

    async fn execute(&self, agent: &Agent, request: &PipelineRequest, context: &str) -> Step {
        let rx = match self.runner.execute(context, &request.project_path).await {
            Ok(rx) => rx,
            Err(e) => return Step::Done(Completion::failed(e.to_string())),
        };
        // A cancel that raced the spawn must still reach the new subprocess.
        if request.cancel.load(Ordering::SeqCst) {
            self.runner.kill();
        }

        let events = self.events.clone();
        let outcome = drive(rx, |event| {
            forward_agent_event(&events, &request.cycle_id, Some(agent.name.as_str()), event)
        })
        .await;

        match outcome {
            InvocationOutcome::Completed(completion) => Step::Done(completion),
            InvocationOutcome::RateLimited(info) => Step::RateLimited(info),
        }
    }
}

/// Short textual state summary handed to personas.
pub fn session_summary(cycle_number: u32, open_issues: usize, total_cost_usd: f64) -> String {
    format!(
        "Cycle {} at {}. {} open issues. ${:.2} spent so far.",
        cycle_number,
        Utc::now().format("%Y-%m-%d %H:%M UTC"),
        open_issues,
        total_cost_usd
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::ExecutorMessage;
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::path::Path;
    use std::sync::Mutex;
    use tokio::sync::mpsc;

    /// Replies with scripted outputs in order; falls back to an empty success.
    struct ScriptedRunner {
        replies: Mutex<VecDeque<ExecutorMessage>>,
        prompts: Mutex<Vec<String>>,
    }

    impl ScriptedRunner {
        fn new(replies: Vec<ExecutorMessage>) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies.into()),
                prompts: Mutex::new(Vec::new()),
            })
        }
    }

    fn ok(output: &str, cost: f64) -> ExecutorMessage {
        ExecutorMessage::Completed(Completion {
            success: true,
            cost_usd: Some(cost),
            output: output.to_string(),
            ..Default::default()
        })
    }

    #[async_trait]
    impl AgentRunner for ScriptedRunner {
        async fn execute(&self, instructions: &str, _: &Path) -> Result<mpsc::Receiver<ExecutorMessage>> {
            self.prompts.lock().unwrap().push(instructions.to_string());
            let reply = self
                .replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| ok("", 0.0));
            let (tx, rx) = mpsc::channel(4);
            tx.send(ExecutorMessage::Event(AgentEvent::Text { text: "working".into() }))
                .await
                .unwrap();
            tx.send(reply).await.unwrap();
            Ok(rx)
        }

        fn kill(&self) {}

        fn is_running(&self) -> bool {
            false
        }
    }

    fn request(store: &MemoryStore, phase: Phase, max_iterations: u32) -> PipelineRequest {
        let session = store
            .create_session(crate::model::Session::new(PathBuf::from("/tmp"), None))
            .unwrap();
        let cycle = store
            .create_cycle(crate::model::Cycle::new(&session.id, 0, Phase::Pipeline, None))
            .unwrap();
        PipelineRequest {
            cycle_id: cycle.id,
            phase,
            project_path: PathBuf::from("/tmp"),
            goal: Some("build it".into()),
            issue: None,
            session_summary: "cycle 0".into(),
            checkpoint: None,
            test_command: None,
            review_max_iterations: max_iterations,
            skip_design_on_fix: true,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    const REJECT: &str = r#"{"approved": false, "issues": [{"title": "Missing edge case"}], "summary": "no"}"#;
    const APPROVE: &str = r#"{"approved": true, "issues": [], "summary": "ok"}"#;

    #[tokio::test]
    async fn runs_all_personas_in_order_and_sums_cost() {
        let store = Arc::new(MemoryStore::new());
        let runner = ScriptedRunner::new(vec![
            ok("plan", 0.1),
            ok("code", 0.2),
            ok(APPROVE, 0.3),
            ok(r#"{"summary": {"total": 3, "passed": 3, "failed": 0}}"#, 0.4),
        ]);
        let executor = PipelineExecutor::new(store.clone(), runner.clone(), Arc::new(EventBus::default()));
        let req = request(&store, Phase::Improve, 2);
        let cycle_id = req.cycle_id.clone();

        let outcome = executor.run(req).await.unwrap();

        assert!(outcome.success);
        assert!((outcome.cost_usd - 1.0).abs() < 1e-9);
        assert!(outcome.output.contains("## Architect\n\nplan"));
        assert_eq!(outcome.verification.unwrap().counts.unwrap().passed, 3);

        let prompts = runner.prompts.lock().unwrap();
        assert!(prompts[0].starts_with("## Architect"));
        assert!(prompts[1].contains("### Output from Architect"));
        assert!(prompts[2].starts_with("## Reviewer"));

        let runs = store.list_agent_runs(&cycle_id).unwrap();
        assert_eq!(runs.len(), 4);
        assert!(runs.iter().all(|r| r.iteration == 1 && r.status == AgentRunStatus::Completed));
    }

    #[tokio::test]
    async fn design_persona_skipped_on_fix() {
        let store = Arc::new(MemoryStore::new());
        let runner = ScriptedRunner::new(vec![]);
        let executor = PipelineExecutor::new(store.clone(), runner.clone(), Arc::new(EventBus::default()));

        executor.run(request(&store, Phase::Fix, 0)).await.unwrap();

        let prompts = runner.prompts.lock().unwrap();
        assert_eq!(prompts.len(), 3);
        assert!(prompts[0].starts_with("## Developer"));
    }

    #[tokio::test]
    async fn review_loop_runs_exactly_max_iterations_without_approval() {
        let store = Arc::new(MemoryStore::new());
        let runner = ScriptedRunner::new(vec![
            ok("plan", 0.0),
            ok("code", 0.0),
            ok(REJECT, 0.0),
            ok("rework 1", 0.0),
            ok(REJECT, 0.0),
            ok("rework 2", 0.0),
            ok(REJECT, 0.0),
            ok("tests ran", 0.0),
        ]);
        let events = Arc::new(EventBus::default());
        let executor = PipelineExecutor::new(store.clone(), runner.clone(), events.clone());
        let req = request(&store, Phase::Improve, 2);
        let cycle_id = req.cycle_id.clone();

        let outcome = executor.run(req).await.unwrap();

        assert!(outcome.success);
        assert_eq!(outcome.review_issues.len(), 1);
        assert_eq!(runner.prompts.lock().unwrap().len(), 8);

        let iterations: Vec<u32> = store
            .list_agent_runs(&cycle_id)
            .unwrap()
            .iter()
            .map(|r| r.iteration)
            .collect();
        assert_eq!(iterations, vec![1, 1, 1, 2, 2, 3, 3, 1]);

        let loops = events
            .history()
            .iter()
            .filter(|e| e.event_type == EventType::ReviewIteration)
            .count();
        assert_eq!(loops, 2);
    }

    #[tokio::test]
    async fn review_loop_stops_early_on_approval() {
        let store = Arc::new(MemoryStore::new());
        let runner = ScriptedRunner::new(vec![
            ok("plan", 0.0),
            ok("code", 0.0),
            ok(REJECT, 0.0),
            ok("rework", 0.0),
            ok(APPROVE, 0.0),
            ok("tests ran", 0.0),
        ]);
        let executor = PipelineExecutor::new(store.clone(), runner.clone(), Arc::new(EventBus::default()));

        let outcome = executor.run(request(&store, Phase::Improve, 3)).await.unwrap();

        assert!(outcome.success);
        assert!(outcome.review_issues.is_empty());
        let prompts = runner.prompts.lock().unwrap();
        assert_eq!(prompts.len(), 6);
        assert!(prompts[3].contains("### Review Feedback"));
        assert!(prompts[3].contains("Missing edge case"));
    }

    #[tokio::test]
    async fn failing_verification_fails_pipeline() {
        let store = Arc::new(MemoryStore::new());
        let runner = ScriptedRunner::new(vec![
            ok("plan", 0.0),
            ok("code", 0.0),
            ok("looks good", 0.0),
            ok(r#"{"summary": {"total": 2, "passed": 1, "failed": 1}, "failures": ["t"]}"#, 0.0),
        ]);
        let executor = PipelineExecutor::new(store.clone(), runner, Arc::new(EventBus::default()));

        let outcome = executor.run(request(&store, Phase::Improve, 1)).await.unwrap();

        assert!(!outcome.success);
        assert!(outcome.error.unwrap().contains("1 failing"));
    }

    #[tokio::test]
    async fn persona_failure_stops_pipeline() {
        let store = Arc::new(MemoryStore::new());
        let runner = ScriptedRunner::new(vec![
            ok("plan", 0.5),
            ExecutorMessage::Completed(Completion::failed("exit 1")),
        ]);
        let executor = PipelineExecutor::new(store.clone(), runner.clone(), Arc::new(EventBus::default()));
        let req = request(&store, Phase::Improve, 1);
        let cycle_id = req.cycle_id.clone();

        let outcome = executor.run(req).await.unwrap();

        assert!(!outcome.success);
        assert_eq!(runner.prompts.lock().unwrap().len(), 2);
        assert!(outcome.error.unwrap().contains("Developer"));
        let runs = store.list_agent_runs(&cycle_id).unwrap();
        assert_eq!(runs[1].status, AgentRunStatus::Failed);
    }

    #[tokio::test]
    async fn rate_limit_aborts_pipeline() {
        let store = Arc::new(MemoryStore::new());
        let info = crate::rate_limit::RateLimitDetector::new().check_text("429 too many requests");
        let runner = ScriptedRunner::new(vec![ok("plan", 0.0), ExecutorMessage::RateLimited(info)]);
        let executor = PipelineExecutor::new(store.clone(), runner.clone(), Arc::new(EventBus::default()));

        let outcome = executor.run(request(&store, Phase::Improve, 1)).await.unwrap();

        assert!(!outcome.success);
        assert!(outcome.rate_limit.is_some());
        assert_eq!(runner.prompts.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn cancelled_pipeline_runs_nothing() {
        let store = Arc::new(MemoryStore::new());
        let runner = ScriptedRunner::new(vec![]);
        let executor = PipelineExecutor::new(store.clone(), runner.clone(), Arc::new(EventBus::default()));
        let req = request(&store, Phase::Improve, 1);
        req.cancel.store(true, Ordering::SeqCst);

        let outcome = executor.run(req).await.unwrap();

        assert!(outcome.aborted);
        assert!(!outcome.success);
        assert!(runner.prompts.lock().unwrap().is_empty());
    }
}
