//! Order-preserving admission queue for named requests.
//!
//! Requests enter at the tail and leave from the head, in exactly the order
//! they were admitted. A name stays reserved from admission until the
//! consumer calls [`AdmissionQueue::finish`], so no two requests with the
//! same name are ever in flight together.

use std::collections::{HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tracing::debug;

use crate::error::QueueError;

/// Anything the queue can hold: it only needs a unique name.
pub trait Admit {
    fn name(&self) -> &str;
}

struct Inner<T> {
    entries: VecDeque<T>,
    /// Names admitted and not yet finished, queued or executing.
    in_flight: HashSet<String>,
    closed: bool,
}

/// Thread-safe FIFO of pending requests keyed by unique name.
///
/// One mutex guards entries, reserved names and the closed flag together,
/// so admission, shutdown and the idle check never interleave.
pub struct AdmissionQueue<T> {
    inner: Mutex<Inner<T>>,
}

impl<T: Admit> AdmissionQueue<T> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: VecDeque::new(),
                in_flight: HashSet::new(),
                closed: false,
            }),
        }
    }

    // Every critical section leaves `Inner` consistent, so a panic elsewhere
    // never invalidates it.
    fn lock(&self) -> MutexGuard<'_, Inner<T>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Admit a request at the tail.
    ///
    /// Fails with [`QueueError::Closed`] once the queue is closed and with
    /// [`QueueError::Duplicate`] while a request with the same name is in flight.
    pub fn enqueue(&self, item: T) -> Result<(), QueueError> {
        let mut inner = self.lock();
        if inner.closed {
            return Err(QueueError::Closed);
        }
        if inner.in_flight.contains(item.name()) {
            return Err(QueueError::Duplicate(item.name().to_string()));
        }
        inner.in_flight.insert(item.name().to_string());
        inner.entries.push_back(item);
        Ok(())
    }

    /// Remove and return the head, or `None` when nothing is queued.
    ///
    /// The popped name stays reserved until [`finish`](Self::finish).
    pub fn try_pop(&self) -> Option<T> {
        self.lock().entries.pop_front()
    }

    /// Release the name of a request the consumer is done with.
    ///
    /// Returns `false` if the name was not reserved.
    pub fn finish(&self, name: &str) -> bool {
        self.lock().in_flight.remove(name)
    }

    /// Atomically take every queued request, releasing their names.
    pub fn drain(&self) -> Vec<T> {
        let mut inner = self.lock();
        let drained: Vec<T> = inner.entries.drain(..).collect();
        for item in &drained {
            inner.in_flight.remove(item.name());
        }
        if !drained.is_empty() {
            debug!(count = drained.len(), "drained admission queue");
        }
        drained
    }

    /// Number of queued (not yet popped) requests.
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of admitted requests not yet finished, queued or executing.
    pub fn in_flight(&self) -> usize {
        self.lock().in_flight.len()
    }

    /// Refuse all further admissions.
    pub fn close(&self) {
        self.lock().closed = true;
    }

    /// Accept admissions again after a restart.
    pub fn reopen(&self) {
        self.lock().closed = false;
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Run `f` only if nothing is in flight, holding the queue lock for the
    /// whole call so no request can be admitted meanwhile.
    pub fn with_idle<R>(&self, f: impl FnOnce() -> R) -> Result<R, QueueError> {
        let inner = self.lock();
        if !inner.in_flight.is_empty() {
            return Err(QueueError::Busy(inner.in_flight.len()));
        }
        let result = f();
        drop(inner);
        Ok(result)
    }
}

impl<T: Admit> Default for AdmissionQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}
