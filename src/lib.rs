//! autodev - autonomous agent orchestration engine
//!
//! This library drives a coding-assistant CLI against a target project in
//! repeated cycles of discovery, fixing, testing, improvement and review,
//! with git checkpoints, rate-limit backoff and a multi-persona pipeline.

pub mod agents;
pub mod backoff;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod findings;
pub mod git;
pub mod model;
pub mod phase;
pub mod pipeline;
pub mod prompt;
pub mod rate_limit;
pub mod runner;
pub mod store;
pub mod stream;

pub use error::{Error, Result};

pub use agents::{builtin_agents, AgentContextBuilder, AgentKind};
pub use backoff::{ExponentialBackoff, RateLimitBackoff};
pub use config::{EngineConfig, Validate, ValidationResult};
pub use engine::{CycleEngine, EngineStatus, StartRequest};
pub use events::{EngineEvent, EventBus, EventListener, EventType, ListenerError, ListenerId};
pub use findings::{Finding, ReviewOutcome, TestFailure, VerificationOutcome};
pub use git::GitManager;
pub use model::{
    Agent, AgentRun, AgentRunStatus, Category, Cycle, CycleStatus, Issue, IssueStatus, Phase,
    Priority, Session, SessionStatus, TestCounts,
};
pub use phase::{select_next_phase, PhaseDecision, PhaseHistory};
pub use pipeline::{PipelineExecutor, PipelineOutcome, PipelineRequest};
pub use prompt::PhasePromptBuilder;
pub use rate_limit::{RateLimitDetector, RateLimitInfo, RateLimitSource};
pub use runner::{
    AgentEvent, AgentRunner, Completion, ExecutorConfig, ExecutorMessage, InvocationOutcome,
    SubprocessExecutor,
};
pub use store::{MemoryStore, Store};
pub use stream::{StreamEvent, StreamParser};
