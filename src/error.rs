use thiserror::Error;

use crate::agent::AgentStatus;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, SupervisorError>;

/// Error type for all supervisor operations.
///
/// Sub-component failures surface through these variants rather than
/// being swallowed; the only documented exception is `kill_session`,
/// which suppresses `NotFound` to stay idempotent.
#[derive(Error, Debug)]
pub enum SupervisorError {
    /// Unknown agent, checkpoint, or session id
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// Duplicate id, already-present session, or other conflicting state
    #[error("conflict: {0}")]
    Conflict(String),

    /// State-machine transition outside the permitted table
    #[error("invalid transition: {from} -> {to}")]
    InvalidTransition { from: AgentStatus, to: AgentStatus },

    /// Agent already has a task in flight
    #[error("agent busy: {0}")]
    Busy(String),

    /// Unrecognised agent type, out-of-range configuration, missing field
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Multiplexer binary or launcher script missing
    #[error("unavailable: {0}")]
    Unavailable(String),

    /// Readiness poll, request/response, or probe deadline elapsed
    #[error("timed out: {0}")]
    Timeout(String),

    /// Non-zero exit from a session exec, unparseable agent state file
    #[error("external failure: {0}")]
    ExternalFailure(String),

    /// Operation aborted by shutdown or caller
    #[error("cancelled: {0}")]
    Cancelled(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl SupervisorError {
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }

    /// True for errors the caller may retry without changing anything.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::ExternalFailure(_))
    }
}
