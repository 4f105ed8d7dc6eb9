//! Cycle engine: session lifecycle and the cycle loop.
//!
//! ```text
//! idle -> running <-> paused
//! running -> waiting_for_limit -> running
//! running -> completed | stopped
//! ```
//!
//! One supervising task per session runs cycles strictly one after another.
//! `pause` and `stop` bump a generation counter, kill the in-flight
//! subprocess and finalise the in-flight cycle before returning. A loop that
//! wakes up under a stale generation exits without writing anything.

mod cycle;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::backoff::RateLimitBackoff;
use crate::config::{EngineConfig, Validate};
use crate::error::{Error, Result};
use crate::events::{EventBus, EventType};
use crate::git::GitManager;
use crate::model::{CycleStatus, IssueStatus, Phase, Session, SessionStatus};
use crate::pipeline::PipelineExecutor;
use crate::runner::AgentRunner;
use crate::store::Store;

/// Parameters for a new session.
#[derive(Debug, Clone, Default)]
pub struct StartRequest {
    /// Target project; falls back to the `project_path` setting.
    pub project_path: Option<PathBuf>,
    pub goal: Option<String>,
}

/// Snapshot of the engine for observers.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EngineStatus {
    pub session_id: Option<String>,
    pub status: Option<SessionStatus>,
    /// Number of the cycle in flight.
    pub cycle_number: Option<u32>,
    pub phase: Option<Phase>,
    pub total_cycles: u32,
    pub total_cost_usd: f64,
    pub consecutive_failures: u32,
    /// When a rate-limited session will retry.
    pub resume_at: Option<DateTime<Utc>>,
    pub manual_queue_active: bool,
}

/// The cycle currently executing.
struct ActiveCycle {
    cycle_id: String,
    cycle_number: u32,
    phase: Phase,
    issue_id: Option<String>,
    cancel: Arc<AtomicBool>,
}

struct EngineState {
    /// Set while a session is running, paused or waiting for a rate limit.
    session_id: Option<String>,
    /// Last session driven by this engine, kept for status after it ends.
    last_session_id: Option<String>,
    generation: u64,
    active_cycle: Option<ActiveCycle>,
    consecutive_failures: u32,
    backoff: RateLimitBackoff,
    resume_timer: Option<JoinHandle<()>>,
    resume_at: Option<DateTime<Utc>>,
    manual_queue_active: bool,
}

struct EngineInner {
    store: Arc<dyn Store>,
    runner: Arc<dyn AgentRunner>,
    events: Arc<EventBus>,
    pipeline: PipelineExecutor,
    base_config: EngineConfig,
    state: Mutex<EngineState>,
    status_tx: watch::Sender<EngineStatus>,
}

/// Handle to the orchestration engine. Cheap to clone.
///
/// Lifecycle methods spawn tasks and must be called inside a tokio runtime.
/// Event listeners must not call back into the engine.
#[derive(Clone)]
pub struct CycleEngine {
    inner: Arc<EngineInner>,
}

impl CycleEngine {
    /// Creates an engine. `config` holds defaults and file values; store
    /// settings override it at the start of every cycle.
    pub fn new(
        store: Arc<dyn Store>,
        runner: Arc<dyn AgentRunner>,
        events: Arc<EventBus>,
        config: EngineConfig,
    ) -> Self {
        let (status_tx, _) = watch::channel(EngineStatus::default());
        let pipeline = PipelineExecutor::new(store.clone(), runner.clone(), events.clone());
        Self {
            inner: Arc::new(EngineInner {
                store,
                runner,
                events,
                pipeline,
                base_config: config,
                state: Mutex::new(EngineState {
                    session_id: None,
                    last_session_id: None,
                    generation: 0,
                    active_cycle: None,
                    consecutive_failures: 0,
                    backoff: RateLimitBackoff::default(),
                    resume_timer: None,
                    resume_at: None,
                    manual_queue_active: false,
                }),
                status_tx,
            }),
        }
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.inner.events
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.inner.store
    }

    /// Configuration as the next cycle would see it.
    pub fn effective_config(&self) -> Result<EngineConfig> {
        self.inner.effective_config()
    }

    /// Starts a new session and its cycle loop.
    pub fn start(&self, request: StartRequest) -> Result<Session> {
        self.inner.start(request)
    }

    /// Pauses the session, interrupting the in-flight cycle.
    pub fn pause(&self) -> Result<()> {
        self.inner.pause()
    }

    /// Resumes a paused or rate-limited session immediately.
    pub fn resume(&self) -> Result<()> {
        self.inner.resume()
    }

    /// Stops the session for good.
    pub fn stop(&self) -> Result<()> {
        self.inner.stop()
    }

    pub fn status(&self) -> EngineStatus {
        self.inner.status_tx.borrow().clone()
    }

    /// Receives every status change.
    pub fn watch_status(&self) -> watch::Receiver<EngineStatus> {
        self.inner.status_tx.subscribe()
    }

    /// Marks the manual prompt queue as owning the assistant. While set, no
    /// session can start.
    pub fn set_manual_queue_active(&self, active: bool) {
        let mut state = self.inner.lock();
        state.manual_queue_active = active;
        self.inner.publish(&state, None);
    }
}

impl EngineInner {
    fn lock(&self) -> MutexGuard<'_, EngineState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn effective_config(&self) -> Result<EngineConfig> {
        Ok(self.base_config.clone().with_settings(&self.store.settings()?))
    }

    fn start(self: &Arc<Self>, request: StartRequest) -> Result<Session> {
        let mut state = self.lock();
        if state.manual_queue_active {
            return Err(Error::ManualQueueActive);
        }
        if state.session_id.is_some() {
            return Err(Error::AlreadyRunning);
        }

        let config = self.effective_config()?;
        for warning in config.validate().into_result()? {
            tracing::warn!(warning = %warning, "configuration warning");
        }

        let project_path = request
            .project_path
            .or_else(|| config.project_path.clone())
            .ok_or_else(|| Error::Config("no project path given".to_string()))?;
        if !project_path.is_dir() {
            return Err(Error::InvalidPath(project_path));
        }

        let goal = request
            .goal
            .map(|g| g.trim().to_string())
            .filter(|g| !g.is_empty());
        if config.require_goal && goal.is_none() {
            return Err(Error::GoalRequired);
        }

        if config.auto_commit {
            let git = GitManager::new(&project_path);
            if !git.is_repo() {
                tracing::warn!(path = ?project_path, "not a git repository, checkpoints unavailable");
            } else if let Err(e) = git.ensure_branch(&config.branch_name) {
                tracing::warn!(error = %e, branch = %config.branch_name, "could not switch branch");
            }
        }

        let session = self.store.create_session(Session::new(project_path, goal))?;
        tracing::info!(
            session_id = %session.id,
            project = ?session.project_path,
            goal = session.goal.is_some(),
            "session started"
        );

        state.session_id = Some(session.id.clone());
        state.last_session_id = Some(session.id.clone());
        state.consecutive_failures = 0;
        state.backoff.reset();
        state.generation += 1;

        self.emit_session_status(&session, None);
        self.publish(&state, Some(&session));
        self.spawn_loop(state.generation);

        Ok(session)
    }

    fn pause(&self) -> Result<()> {
        let mut state = self.lock();
        let mut session = self.active_session(&state, "pause")?;
        if !matches!(
            session.status,
            SessionStatus::Running | SessionStatus::WaitingForLimit
        ) {
            return Err(Error::InvalidTransition {
                action: "pause",
                status: session.status.to_string(),
            });
        }

        self.interrupt(&mut state, &mut session)?;
        session.status = SessionStatus::Paused;
        self.store.update_session(&session)?;

        tracing::info!(session_id = %session.id, "session paused");
        self.emit_session_status(&session, Some("paused by user"));
        self.publish(&state, Some(&session));
        Ok(())
    }

    fn resume(self: &Arc<Self>) -> Result<()> {
        let mut state = self.lock();
        let mut session = self.active_session(&state, "resume")?;
        if !matches!(
            session.status,
            SessionStatus::Paused | SessionStatus::WaitingForLimit
        ) {
            return Err(Error::InvalidTransition {
                action: "resume",
                status: session.status.to_string(),
            });
        }

        if let Some(timer) = state.resume_timer.take() {
            timer.abort();
        }
        state.resume_at = None;
        state.consecutive_failures = 0;
        state.generation += 1;

        session.status = SessionStatus::Running;
        self.store.update_session(&session)?;

        tracing::info!(session_id = %session.id, "session resumed");
        self.emit_session_status(&session, None);
        self.publish(&state, Some(&session));
        self.spawn_loop(state.generation);
        Ok(())
    }

    fn stop(&self) -> Result<()> {
        let mut state = self.lock();
        let mut session = self.active_session(&state, "stop")?;

        self.interrupt(&mut state, &mut session)?;
        session.status = SessionStatus::Stopped;
        self.store.update_session(&session)?;

        tracing::info!(session_id = %session.id, "session stopped");
        self.emit_session_status(&session, Some("stopped by user"));
        self.clear_session(&mut state);
        self.publish(&state, Some(&session));
        Ok(())
    }

    fn active_session(&self, state: &EngineState, action: &'static str) -> Result<Session> {
        match &state.session_id {
            Some(id) => self.store.get_session(id),
            None => Err(Error::InvalidTransition {
                action,
                status: "idle".to_string(),
            }),
        }
    }

    /// Invalidates the running loop, cancels timers and finalises the
    /// in-flight cycle as interrupted.
    fn interrupt(&self, state: &mut EngineState, session: &mut Session) -> Result<()> {
        state.generation += 1;
        if let Some(timer) = state.resume_timer.take() {
            timer.abort();
        }
        state.resume_at = None;

        let Some(active) = state.active_cycle.take() else {
            return Ok(());
        };
        active.cancel.store(true, Ordering::SeqCst);
        self.runner.kill();

        let mut cycle = self.store.get_cycle(&active.cycle_id)?;
        cycle.status = CycleStatus::Failed;
        cycle.error = Some("interrupted".to_string());
        cycle.interrupted = true;
        cycle.finished_at = Some(Utc::now());
        self.store.update_cycle(&cycle)?;
        session.total_cycles = session.total_cycles.max(active.cycle_number + 1);

        if let Some(issue_id) = &active.issue_id {
            let mut issue = self.store.get_issue(issue_id)?;
            if issue.status == IssueStatus::InProgress {
                issue.status = IssueStatus::Open;
                self.store.update_issue(&issue)?;
            }
        }

        tracing::info!(
            cycle = active.cycle_number,
            phase = %active.phase,
            "interrupted in-flight cycle"
        );
        self.events.emit(
            EventType::CycleFailed,
            json!({
                "cycle_id": active.cycle_id,
                "cycle_number": active.cycle_number,
                "phase": active.phase,
                "error": "interrupted",
            }),
        );
        Ok(())
    }

    /// Forgets the session once it has reached a terminal status.
    fn clear_session(&self, state: &mut EngineState) {
        state.session_id = None;
        state.active_cycle = None;
        state.consecutive_failures = 0;
        state.backoff.reset();
        if let Some(timer) = state.resume_timer.take() {
            timer.abort();
        }
        state.resume_at = None;
    }

    fn spawn_loop(self: &Arc<Self>, generation: u64) {
        let inner = Arc::clone(self);
        tokio::spawn(async move { inner.run_loop(generation).await });
    }

    fn emit_session_status(&self, session: &Session, reason: Option<&str>) {
        self.events.emit(
            EventType::SessionStatus,
            json!({
                "session_id": session.id,
                "status": session.status,
                "total_cycles": session.total_cycles,
                "total_cost_usd": session.total_cost_usd,
                "reason": reason,
            }),
        );
    }

    /// Publishes a status snapshot. Reads the session when none is given.
    fn publish(&self, state: &EngineState, session: Option<&Session>) {
        let loaded;
        let session = match session {
            Some(session) => Some(session),
            None => {
                loaded = state
                    .last_session_id
                    .as_ref()
                    .and_then(|id| self.store.get_session(id).ok());
                loaded.as_ref()
            }
        };

        let status = EngineStatus {
            session_id: session.map(|s| s.id.clone()),
            status: session.map(|s| s.status),
            cycle_number: state.active_cycle.as_ref().map(|c| c.cycle_number),
            phase: state.active_cycle.as_ref().map(|c| c.phase),
            total_cycles: session.map_or(0, |s| s.total_cycles),
            total_cost_usd: session.map_or(0.0, |s| s.total_cost_usd),
            consecutive_failures: state.consecutive_failures,
            resume_at: state.resume_at,
            manual_queue_active: state.manual_queue_active,
        };
        self.status_tx.send_replace(status);
    }
}
