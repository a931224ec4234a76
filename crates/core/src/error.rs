use std::time::Duration;

use thiserror::Error;

/// Reason attached to every request resolved during teardown.
pub const SHUTDOWN_REASON: &str = "runtime has been shut down; requests submitted after shutdown, \
     or still queued when it began, are never executed";

/// Reason attached to admission failures caused by a name collision.
pub const DUPLICATE_NAME_REASON: &str = "a request with the same name is already in flight; \
     use a different name or wait for the pending one to complete";

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CommError {
    #[error("runtime has not been initialized; call Runtime::start first")]
    NotInitialized,

    #[error("{SHUTDOWN_REASON}")]
    Shutdown,

    #[error("duplicate request name '{0}': {DUPLICATE_NAME_REASON}")]
    DuplicateName(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("precondition failed: {0}")]
    Precondition(String),

    #[error("aborted: {0}")]
    Aborted(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("config error: {0}")]
    Config(String),

    #[error("{0}")]
    Unknown(String),
}

impl CommError {
    /// Wrap a poisoned-lock error. The lock name is kept for the log line.
    pub fn lock_poisoned(what: &str) -> Self {
        CommError::Unknown(format!("lock poisoned: {what}"))
    }
}
