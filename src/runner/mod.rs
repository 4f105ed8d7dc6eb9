//! Assistant invocation: one subprocess per call, streamed back as messages.
//!
//! Each invocation yields a channel of [`ExecutorMessage`]s ending in exactly one
//! terminal message, either [`ExecutorMessage::RateLimited`] or
//! [`ExecutorMessage::Completed`].

mod claude;
mod subprocess;

pub use claude::{claude_args, StreamInterpreter};
pub use subprocess::{ExecutorConfig, SubprocessExecutor};

use std::path::Path;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::Result;
use crate::rate_limit::RateLimitInfo;

/// Incremental output from a running assistant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AgentEvent {
    /// Text fragment.
    Text { text: String },
    /// A tool invocation started.
    ToolStart { name: String },
    /// A tool invocation finished.
    ToolEnd { name: String },
}

/// Final state of an invocation that was not rate limited.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Completion {
    pub success: bool,
    pub cost_usd: Option<f64>,
    pub duration_ms: u64,
    pub output: String,
    pub error: Option<String>,
    pub exit_code: Option<i32>,
}

impl Completion {
    /// A failed completion carrying only an error message.
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Default::default()
        }
    }
}

/// Message emitted by an invocation.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutorMessage {
    Event(AgentEvent),
    RateLimited(RateLimitInfo),
    Completed(Completion),
}

/// Terminal result of an invocation.
#[derive(Debug, Clone, PartialEq)]
pub enum InvocationOutcome {
    Completed(Completion),
    RateLimited(RateLimitInfo),
}

/// Runs the external assistant.
#[async_trait]
pub trait AgentRunner: Send + Sync {
    /// Launches one invocation and returns its message stream.
    async fn execute(
        &self,
        instructions: &str,
        working_dir: &Path,
    ) -> Result<mpsc::Receiver<ExecutorMessage>>;

    /// Terminates the in-flight invocation, if any.
    fn kill(&self);

    /// Whether an invocation is in flight.
    fn is_running(&self) -> bool;
}

/// Consumes an invocation's messages until its terminal message.
///
/// A stream that closes without a terminal message is reported as a failed
/// completion.
pub async fn drive<F>(mut rx: mpsc::Receiver<ExecutorMessage>, mut on_event: F) -> InvocationOutcome
where
    F: FnMut(AgentEvent),
{
    while let Some(message) = rx.recv().await {
        match message {
            ExecutorMessage::Event(event) => on_event(event),
            ExecutorMessage::RateLimited(info) => return InvocationOutcome::RateLimited(info),
            ExecutorMessage::Completed(completion) => return InvocationOutcome::Completed(completion),
        }
    }
    InvocationOutcome::Completed(Completion::failed(
        "invocation ended without a completion message",
    ))
}
