//! Error types for the autodev orchestration engine.

use std::path::PathBuf;
use thiserror::Error;

/// Top-level error type for engine operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Failed to launch the assistant subprocess.
    #[error("failed to spawn assistant: {0}")]
    Spawn(String),

    /// The assistant binary could not be resolved.
    #[error("assistant binary '{0}' not found on PATH")]
    BinaryNotFound(String),

    /// The executor already has a live subprocess.
    #[error("executor already has a running subprocess")]
    ExecutorBusy,

    /// Git operation failed.
    #[error("git operation failed: {0}")]
    Git(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// TOML configuration could not be parsed.
    #[error("invalid TOML configuration: {0}")]
    Toml(#[from] toml::de::Error),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// The project directory is not usable.
    #[error("invalid project path: {0}")]
    InvalidPath(PathBuf),

    /// A record was not found in the store.
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// The store refused an operation.
    #[error("store error: {0}")]
    Store(String),

    /// A session is already active on this engine.
    #[error("a session is already running")]
    AlreadyRunning,

    /// The manual prompt queue owns the assistant right now.
    #[error("manual queue is active; stop it before starting a session")]
    ManualQueueActive,

    /// Settings demand an initial goal and none was given.
    #[error("an initial goal prompt is required to start")]
    GoalRequired,

    /// Requested lifecycle transition is not valid from the current state.
    #[error("cannot {action} while session is {status}")]
    InvalidTransition { action: &'static str, status: String },
}

impl Error {
    /// Shorthand for a missing record.
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Error::NotFound {
            kind,
            id: id.into(),
        }
    }
}

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, Error>;
