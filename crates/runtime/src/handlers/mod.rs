//! Per-kind request handlers.
//!
//! Each operation kind binds to one [`OpHandler`]; the dispatch loop looks
//! the handler up in a [`HandlerTable`] instead of switching on the kind.

mod collective;
mod neighbor;
mod window;

use std::collections::HashMap;
use std::sync::Arc;

use confluence_core::{Buffer, CommError, OpKind, Rank, SharedBuffer, Status, TopologySnapshot};

use crate::request::Request;
use crate::substrate::Substrate;

pub use collective::{AllgatherHandler, AllreduceHandler, BarrierHandler, BroadcastHandler};
pub use neighbor::{NeighborAllgatherHandler, NeighborAllreduceHandler};
pub use window::{WinAccumulateHandler, WinGetHandler, WinPutHandler};

/// What a handler may touch while executing one request.
pub struct DispatchContext<'a> {
    pub substrate: &'a dyn Substrate,
    /// Topology in force when the request was popped.
    pub topology: &'a TopologySnapshot,
}

impl DispatchContext<'_> {
    pub fn rank(&self) -> Rank {
        self.substrate.rank()
    }

    pub fn size(&self) -> usize {
        self.substrate.size()
    }
}

/// Executes requests of one operation kind against the substrate.
pub trait OpHandler: Send + Sync {
    /// The kind this handler is registered under.
    fn kind(&self) -> OpKind;

    /// Run the blocking primitive for `request`.
    fn execute(&self, request: &Request, ctx: &DispatchContext<'_>) -> Status;

    /// Post-process after [`execute`](Self::execute), before the handle is
    /// resolved. Receives and returns the terminal status.
    fn complete(&self, _request: &Request, _ctx: &DispatchContext<'_>, status: Status) -> Status {
        status
    }
}

/// Operation kind -> handler.
pub struct HandlerTable {
    handlers: HashMap<OpKind, Arc<dyn OpHandler>>,
}

impl HandlerTable {
    /// A table with nothing registered.
    pub fn empty() -> Self {
        Self { handlers: HashMap::new() }
    }

    /// A table with a handler for every [`OpKind`].
    pub fn standard() -> Self {
        let mut table = Self::empty();
        table.register(Arc::new(AllreduceHandler));
        table.register(Arc::new(BroadcastHandler));
        table.register(Arc::new(AllgatherHandler));
        table.register(Arc::new(NeighborAllgatherHandler));
        table.register(Arc::new(NeighborAllreduceHandler));
        table.register(Arc::new(BarrierHandler));
        table.register(Arc::new(WinPutHandler));
        table.register(Arc::new(WinGetHandler));
        table.register(Arc::new(WinAccumulateHandler));
        table
    }

    /// Bind `handler` to its kind, returning the handler it replaced.
    pub fn register(&mut self, handler: Arc<dyn OpHandler>) -> Option<Arc<dyn OpHandler>> {
        self.handlers.insert(handler.kind(), handler)
    }

    pub fn remove(&mut self, kind: OpKind) -> Option<Arc<dyn OpHandler>> {
        self.handlers.remove(&kind)
    }

    pub fn get(&self, kind: OpKind) -> Option<&Arc<dyn OpHandler>> {
        self.handlers.get(&kind)
    }

    pub fn kinds(&self) -> Vec<OpKind> {
        let mut kinds: Vec<OpKind> = self.handlers.keys().copied().collect();
        kinds.sort();
        kinds
    }
}

impl Default for HandlerTable {
    fn default() -> Self {
        Self::standard()
    }
}

// ── Helpers shared by the handlers ────────────────────────────

/// Copy a caller buffer out so no lock is held across a blocking call.
pub(crate) fn snapshot(buffer: &SharedBuffer) -> Result<Buffer, Status> {
    buffer
        .read()
        .map(|b| b.clone())
        .map_err(|_| Status::from(CommError::lock_poisoned("request buffer")))
}

/// Overwrite a caller buffer with `value`.
pub(crate) fn store(buffer: &SharedBuffer, value: Buffer) -> Status {
    match buffer.write() {
        Ok(mut guard) => {
            *guard = value;
            Status::ok()
        }
        Err(_) => Status::from(CommError::lock_poisoned("request buffer")),
    }
}

pub(crate) fn mismatch(expected: OpKind, request: &Request) -> Status {
    Status::invalid_argument(format!(
        "{expected} handler cannot execute {} request '{}'",
        request.kind(),
        request.name()
    ))
}
