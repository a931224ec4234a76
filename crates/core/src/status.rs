//! Operation outcome value type.
//!
//! A [`Status`] is what crosses the boundary between the dispatch thread and
//! callers: substrate primitives return one, handles store one, and
//! [`Status::into_result`] turns a terminal one back into a [`CommError`].

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{CommError, SHUTDOWN_REASON};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StatusKind {
    Ok,
    UnknownError,
    PreconditionError,
    Aborted,
    InvalidArgument,
    /// Sentinel for "not yet resolved". Never a final outcome.
    InProgress,
}

impl fmt::Display for StatusKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StatusKind::Ok => write!(f, "ok"),
            StatusKind::UnknownError => write!(f, "unknown_error"),
            StatusKind::PreconditionError => write!(f, "precondition_error"),
            StatusKind::Aborted => write!(f, "aborted"),
            StatusKind::InvalidArgument => write!(f, "invalid_argument"),
            StatusKind::InProgress => write!(f, "in_progress"),
        }
    }
}

/// Runtime-level causes that share a [`StatusKind`] with other failures.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
enum Marker {
    Shutdown,
    DuplicateName(String),
}

/// Immutable outcome of an operation. `Ok` and `InProgress` carry no reason.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Status {
    kind: StatusKind,
    reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    marker: Option<Marker>,
}

impl Status {
    pub fn ok() -> Self {
        Self { kind: StatusKind::Ok, reason: None, marker: None }
    }

    pub fn in_progress() -> Self {
        Self { kind: StatusKind::InProgress, reason: None, marker: None }
    }

    pub fn unknown_error(reason: impl Into<String>) -> Self {
        Self::with_reason(StatusKind::UnknownError, reason)
    }

    pub fn precondition_error(reason: impl Into<String>) -> Self {
        Self::with_reason(StatusKind::PreconditionError, reason)
    }

    pub fn aborted(reason: impl Into<String>) -> Self {
        Self::with_reason(StatusKind::Aborted, reason)
    }

    pub fn invalid_argument(reason: impl Into<String>) -> Self {
        Self::with_reason(StatusKind::InvalidArgument, reason)
    }

    /// The terminal status given to every request failed during teardown.
    pub fn shutdown() -> Self {
        CommError::Shutdown.into()
    }

    fn marked(mut self, marker: Marker) -> Self {
        self.marker = Some(marker);
        self
    }

    fn with_reason(kind: StatusKind, reason: impl Into<String>) -> Self {
        Self { kind, reason: Some(reason.into()), marker: None }
    }

    pub fn kind(&self) -> StatusKind {
        self.kind
    }

    pub fn reason(&self) -> &str {
        self.reason.as_deref().unwrap_or("")
    }

    pub fn is_ok(&self) -> bool {
        self.kind == StatusKind::Ok
    }

    pub fn is_in_progress(&self) -> bool {
        self.kind == StatusKind::InProgress
    }

    pub fn is_terminal(&self) -> bool {
        !self.is_in_progress()
    }

    /// Convert a terminal status into a `Result`.
    ///
    /// `InProgress` is not an outcome; converting it yields a precondition error.
    pub fn into_result(self) -> Result<(), CommError> {
        match self.marker {
            Some(Marker::Shutdown) => return Err(CommError::Shutdown),
            Some(Marker::DuplicateName(name)) => return Err(CommError::DuplicateName(name)),
            None => {}
        }
        let reason = self.reason.unwrap_or_default();
        match self.kind {
            StatusKind::Ok => Ok(()),
            StatusKind::InProgress => Err(CommError::Precondition(
                "status is still in progress".to_string(),
            )),
            StatusKind::Aborted => Err(CommError::Aborted(reason)),
            StatusKind::InvalidArgument => Err(CommError::InvalidArgument(reason)),
            StatusKind::PreconditionError => Err(CommError::Precondition(reason)),
            StatusKind::UnknownError => Err(CommError::Unknown(reason)),
        }
    }
}

impl Default for Status {
    fn default() -> Self {
        Self::ok()
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.reason {
            Some(reason) => write!(f, "{}: {}", self.kind, reason),
            None => write!(f, "{}", self.kind),
        }
    }
}

impl From<CommError> for Status {
    fn from(err: CommError) -> Self {
        match err {
            CommError::NotInitialized => Status::precondition_error(err.to_string()),
            CommError::Precondition(reason) | CommError::Config(reason) => {
                Status::precondition_error(reason)
            }
            CommError::DuplicateName(name) => {
                Status::invalid_argument(format!("duplicate name: {name}"))
                    .marked(Marker::DuplicateName(name))
            }
            CommError::InvalidArgument(reason) => Status::invalid_argument(reason),
            CommError::Shutdown => Status::aborted(SHUTDOWN_REASON).marked(Marker::Shutdown),
            CommError::Aborted(reason) => Status::aborted(reason),
            CommError::Timeout(_) => Status::aborted(err.to_string()),
            CommError::Unknown(reason) => Status::unknown_error(reason),
        }
    }
}
