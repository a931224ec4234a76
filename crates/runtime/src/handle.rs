//! Handle table bridging caller threads and the dispatch thread.
//!
//! Callers allocate a handle before submitting, the dispatch thread marks it
//! done exactly once, and the caller releases it after observing completion.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};

use confluence_core::{CommError, Status};

/// Opaque token for the outcome of a submitted request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct HandleId(u64);

impl HandleId {
    pub fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Thread-safe map from handle to its current [`Status`].
///
/// Ids come from a monotonically increasing counter and are never reused.
#[derive(Debug)]
pub struct HandleTable {
    next: AtomicU64,
    entries: Mutex<HashMap<HandleId, Status>>,
}

impl HandleTable {
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(0),
            entries: Mutex::new(HashMap::new()),
        }
    }

    // Each operation is a single map access; a poisoned map is still consistent.
    fn lock(&self) -> MutexGuard<'_, HashMap<HandleId, Status>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Allocate a fresh handle in the `InProgress` state.
    pub fn allocate(&self) -> HandleId {
        let id = HandleId(self.next.fetch_add(1, Ordering::Relaxed));
        self.lock().insert(id, Status::in_progress());
        id
    }

    /// Record the terminal status of `handle`.
    ///
    /// A handle transitions at most once; marking it again, marking an
    /// unknown handle, or passing `InProgress` is rejected.
    pub fn mark_done(&self, handle: HandleId, status: Status) -> Result<(), CommError> {
        if status.is_in_progress() {
            return Err(CommError::InvalidArgument(format!(
                "handle {handle} cannot be completed with an in-progress status"
            )));
        }
        let mut entries = self.lock();
        match entries.get_mut(&handle) {
            None => Err(unknown(handle)),
            Some(current) if current.is_terminal() => Err(CommError::Precondition(format!(
                "handle {handle} was already completed"
            ))),
            Some(current) => {
                *current = status;
                Ok(())
            }
        }
    }

    /// Non-blocking completion check.
    pub fn poll(&self, handle: HandleId) -> Result<bool, CommError> {
        self.lock()
            .get(&handle)
            .map(Status::is_terminal)
            .ok_or_else(|| unknown(handle))
    }

    /// Remove a completed handle and return its terminal status.
    pub fn release(&self, handle: HandleId) -> Result<Status, CommError> {
        let mut entries = self.lock();
        match entries.get(&handle) {
            None => Err(unknown(handle)),
            Some(status) if status.is_in_progress() => Err(CommError::Precondition(format!(
                "handle {handle} is still in progress"
            ))),
            Some(_) => Ok(entries.remove(&handle).unwrap_or_default()),
        }
    }

    /// Drop a handle whose request never made it into the queue.
    pub(crate) fn discard(&self, handle: HandleId) {
        self.lock().remove(&handle);
    }

    /// Number of unreleased handles.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for HandleTable {
    fn default() -> Self {
        Self::new()
    }
}

fn unknown(handle: HandleId) -> CommError {
    CommError::InvalidArgument(format!("unknown handle {handle}"))
}
