//! Admission error types.

use confluence_core::CommError;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueueError {
    #[error("request name already in flight: {0}")]
    Duplicate(String),

    #[error("admission queue is closed")]
    Closed,

    #[error("{0} request(s) still in flight")]
    Busy(usize),
}

impl From<QueueError> for CommError {
    fn from(err: QueueError) -> Self {
        match err {
            QueueError::Duplicate(name) => CommError::DuplicateName(name),
            QueueError::Closed => CommError::Shutdown,
            QueueError::Busy(n) => CommError::Precondition(format!(
                "there are {n} unfinished requests"
            )),
        }
    }
}
