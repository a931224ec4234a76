use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tracing::debug;

use confluence_core::{shared, Buffer, CommError, Rank, SharedBuffer};

use crate::handle::HandleId;
use crate::request::{request_name, Completion, Operation, Request};

use super::Runtime;

impl Runtime {
    /// Allocate a handle and admit `op` under its kind-prefixed name.
    pub(super) fn submit(&self, name: Option<&str>, op: Operation) -> Result<HandleId, CommError> {
        self.ensure_running()?;
        let handle = self.handles.allocate();
        let name = request_name(op.kind(), name, handle);
        let output = op.output().cloned();
        if let Some(output) = &output {
            self.outputs().insert(handle, Arc::clone(output));
        }

        let request = Request::new(name, op, Completion::new(handle, Arc::clone(&self.handles)));
        if let Err(e) = self.queue.enqueue(request) {
            debug!(handle = %handle, error = %e, "Admission refused");
            self.handles.discard(handle);
            self.outputs().remove(&handle);
            return Err(e.into());
        }
        Ok(handle)
    }

    // ── Asynchronous submissions ──────────────────────────────

    /// Sum `input` across the group into `output`, averaging if asked.
    pub fn allreduce_async(
        &self,
        input: &SharedBuffer,
        output: &SharedBuffer,
        average: bool,
        name: Option<&str>,
    ) -> Result<HandleId, CommError> {
        self.submit(
            name,
            Operation::Allreduce {
                input: Arc::clone(input),
                output: Arc::clone(output),
                average,
            },
        )
    }

    pub fn broadcast_async(
        &self,
        input: &SharedBuffer,
        output: &SharedBuffer,
        root_rank: Rank,
        name: Option<&str>,
    ) -> Result<HandleId, CommError> {
        if root_rank >= self.size() {
            return Err(CommError::InvalidArgument(format!(
                "broadcast root {root_rank} is outside a group of {}",
                self.size()
            )));
        }
        self.submit(
            name,
            Operation::Broadcast {
                input: Arc::clone(input),
                output: Arc::clone(output),
                root_rank,
            },
        )
    }

    pub fn allgather_async(
        &self,
        input: &SharedBuffer,
        output: &SharedBuffer,
        name: Option<&str>,
    ) -> Result<HandleId, CommError> {
        self.submit(
            name,
            Operation::Allgather {
                input: Arc::clone(input),
                output: Arc::clone(output),
                allocator: Arc::clone(&self.allocator),
            },
        )
    }

    pub fn neighbor_allgather_async(
        &self,
        input: &SharedBuffer,
        output: &SharedBuffer,
        name: Option<&str>,
    ) -> Result<HandleId, CommError> {
        self.submit(
            name,
            Operation::NeighborAllgather {
                input: Arc::clone(input),
                output: Arc::clone(output),
                allocator: Arc::clone(&self.allocator),
            },
        )
    }

    /// Combine `input` with the in-neighbors' values using the topology in
    /// force when the request executes.
    pub fn neighbor_allreduce_async(
        &self,
        input: &SharedBuffer,
        output: &SharedBuffer,
        average: bool,
        name: Option<&str>,
    ) -> Result<HandleId, CommError> {
        self.submit(
            name,
            Operation::NeighborAllreduce {
                input: Arc::clone(input),
                output: Arc::clone(output),
                average,
                allocator: Arc::clone(&self.allocator),
            },
        )
    }

    // ── Blocking wrappers ─────────────────────────────────────

    pub fn allreduce(
        &self,
        tensor: &Buffer,
        average: bool,
        name: Option<&str>,
    ) -> Result<Buffer, CommError> {
        let buffer = shared(tensor.clone());
        let handle = self.allreduce_async(&buffer, &buffer, average, name)?;
        self.synchronize(handle)
    }

    pub fn broadcast(
        &self,
        tensor: &Buffer,
        root_rank: Rank,
        name: Option<&str>,
    ) -> Result<Buffer, CommError> {
        let buffer = shared(tensor.clone());
        let handle = self.broadcast_async(&buffer, &buffer, root_rank, name)?;
        self.synchronize(handle)
    }

    pub fn allgather(&self, tensor: &Buffer, name: Option<&str>) -> Result<Buffer, CommError> {
        let input = shared(tensor.clone());
        let output = shared(Buffer::zeros(tensor.dtype(), tensor.shape().with_first_dim(0)));
        let handle = self.allgather_async(&input, &output, name)?;
        self.synchronize(handle)
    }

    pub fn neighbor_allgather(
        &self,
        tensor: &Buffer,
        name: Option<&str>,
    ) -> Result<Buffer, CommError> {
        let input = shared(tensor.clone());
        let output = shared(Buffer::zeros(tensor.dtype(), tensor.shape().with_first_dim(0)));
        let handle = self.neighbor_allgather_async(&input, &output, name)?;
        self.synchronize(handle)
    }

    pub fn neighbor_allreduce(
        &self,
        tensor: &Buffer,
        average: bool,
        name: Option<&str>,
    ) -> Result<Buffer, CommError> {
        let buffer = shared(tensor.clone());
        let handle = self.neighbor_allreduce_async(&buffer, &buffer, average, name)?;
        self.synchronize(handle)
    }

    /// Block until every rank reaches the barrier.
    pub fn barrier(&self) -> Result<(), CommError> {
        let handle = self.submit(None, Operation::Barrier)?;
        self.wait(handle)
    }

    // ── Completion ────────────────────────────────────────────

    /// Non-blocking completion check.
    pub fn poll(&self, handle: HandleId) -> Result<bool, CommError> {
        self.handles.poll(handle)
    }

    /// Block until `handle` completes, release it, and return its outcome.
    pub fn wait(&self, handle: HandleId) -> Result<(), CommError> {
        self.block_on(handle, None)?;
        self.release(handle).map(|_| ())
    }

    /// Like [`wait`](Self::wait), but give up after `timeout`. On timeout
    /// the handle stays pending and can be waited on again.
    pub fn wait_timeout(&self, handle: HandleId, timeout: Duration) -> Result<(), CommError> {
        self.block_on(handle, Some(timeout))?;
        self.release(handle).map(|_| ())
    }

    /// Wait for `handle` and return a copy of the output buffer it wrote.
    pub fn synchronize(&self, handle: HandleId) -> Result<Buffer, CommError> {
        self.block_on(handle, None)?;
        let output = self.release(handle)?.ok_or_else(|| {
            CommError::InvalidArgument(format!("handle {handle} has no output buffer"))
        })?;
        let buffer = output
            .read()
            .map_err(|_| CommError::lock_poisoned("output buffer"))?
            .clone();
        Ok(buffer)
    }

    // Busy-poll at the configured interval.
    fn block_on(&self, handle: HandleId, timeout: Option<Duration>) -> Result<(), CommError> {
        let interval = self.config.handles.wait_poll();
        let started = Instant::now();
        while !self.handles.poll(handle)? {
            match timeout {
                Some(timeout) if started.elapsed() >= timeout => {
                    return Err(CommError::Timeout(timeout));
                }
                _ => thread::sleep(interval),
            }
        }
        Ok(())
    }

    /// Release a completed handle, surfacing a failed status as an error.
    fn release(&self, handle: HandleId) -> Result<Option<SharedBuffer>, CommError> {
        let status = self.handles.release(handle)?;
        let output = self.outputs().remove(&handle);
        status.into_result()?;
        Ok(output)
    }
}
