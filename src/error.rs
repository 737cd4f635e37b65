use crate::registry::ProcessState;
use thiserror::Error;

/// Errors produced by the supervisor core.
///
/// A failed health probe is not an error of the supervisor, it is a
/// `HealthCheckResult { is_healthy: false, .. }` (see `monitor::HealthCheckResult`).
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("process not found: {id}")]
    NotFound { id: String },

    #[error("process name already registered: {name}")]
    NameConflict { name: String },

    #[error("illegal transition from {from:?} to {to:?}")]
    IllegalTransition {
        from: ProcessState,
        to: ProcessState,
    },

    #[error("failed to spawn process: {message}")]
    SpawnFailure { message: String },

    #[error("process {id} must be stopped before it can be unregistered (state: {state:?})")]
    NotTerminal { id: String, state: ProcessState },

    #[error("process {pid} did not terminate within the graceful timeout")]
    TerminationTimeout { pid: i64 },

    #[error("durable store error: {0}")]
    StorageFailure(#[from] rusqlite::Error),

    #[error("invalid process config: {0}")]
    InvalidConfig(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, SupervisorError>;
