use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use tracing::warn;

use confluence_core::{OpKind, OutputAllocator, Rank, SharedBuffer, Status};
use confluence_queue::Admit;

use crate::handle::{HandleId, HandleTable};

/// Per-rank weights for window puts, gets and accumulates.
pub type Weights = BTreeMap<Rank, f64>;

/// Payload of a request, one variant per operation kind.
pub enum Operation {
    Allreduce {
        input: SharedBuffer,
        output: SharedBuffer,
        average: bool,
    },
    Broadcast {
        input: SharedBuffer,
        output: SharedBuffer,
        root_rank: Rank,
    },
    /// Output size is only known after the gather, hence the allocator.
    Allgather {
        input: SharedBuffer,
        output: SharedBuffer,
        allocator: Arc<dyn OutputAllocator>,
    },
    NeighborAllgather {
        input: SharedBuffer,
        output: SharedBuffer,
        allocator: Arc<dyn OutputAllocator>,
    },
    NeighborAllreduce {
        input: SharedBuffer,
        output: SharedBuffer,
        average: bool,
        allocator: Arc<dyn OutputAllocator>,
    },
    Barrier,
    WinPut {
        window: String,
        input: SharedBuffer,
        dst_weights: Weights,
    },
    WinGet {
        window: String,
        src_weights: Weights,
    },
    WinAccumulate {
        window: String,
        input: SharedBuffer,
        dst_weights: Weights,
    },
}

impl Operation {
    pub fn kind(&self) -> OpKind {
        match self {
            Operation::Allreduce { .. } => OpKind::Allreduce,
            Operation::Broadcast { .. } => OpKind::Broadcast,
            Operation::Allgather { .. } => OpKind::Allgather,
            Operation::NeighborAllgather { .. } => OpKind::NeighborAllgather,
            Operation::NeighborAllreduce { .. } => OpKind::NeighborAllreduce,
            Operation::Barrier => OpKind::Barrier,
            Operation::WinPut { .. } => OpKind::WinPut,
            Operation::WinGet { .. } => OpKind::WinGet,
            Operation::WinAccumulate { .. } => OpKind::WinAccumulate,
        }
    }

    /// The buffer the result lands in, for kinds that produce one.
    pub fn output(&self) -> Option<&SharedBuffer> {
        match self {
            Operation::Allreduce { output, .. }
            | Operation::Broadcast { output, .. }
            | Operation::Allgather { output, .. }
            | Operation::NeighborAllgather { output, .. }
            | Operation::NeighborAllreduce { output, .. } => Some(output),
            _ => None,
        }
    }
}

impl fmt::Debug for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Operation::{:?}", self.kind())
    }
}

/// Resolves a request's handle. Consumed on use, so a request completes once.
#[derive(Debug)]
pub struct Completion {
    handle: HandleId,
    table: Arc<HandleTable>,
}

impl Completion {
    pub fn new(handle: HandleId, table: Arc<HandleTable>) -> Self {
        Self { handle, table }
    }

    pub fn handle(&self) -> HandleId {
        self.handle
    }

    pub fn resolve(self, status: Status) {
        if let Err(e) = self.table.mark_done(self.handle, status) {
            warn!(handle = %self.handle, error = %e, "failed to resolve handle");
        }
    }
}

/// One unit of work travelling from a caller thread to the dispatch thread.
#[derive(Debug)]
pub struct Request {
    name: String,
    op: Operation,
    completion: Completion,
}

impl Request {
    pub fn new(name: impl Into<String>, op: Operation, completion: Completion) -> Self {
        Self { name: name.into(), op, completion }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> OpKind {
        self.op.kind()
    }

    pub fn op(&self) -> &Operation {
        &self.op
    }

    pub fn handle(&self) -> HandleId {
        self.completion.handle()
    }

    /// Split into name and completion once execution is over.
    pub fn into_completion(self) -> (String, Completion) {
        (self.name, self.completion)
    }
}

impl Admit for Request {
    fn name(&self) -> &str {
        &self.name
    }
}

/// `"<kind>.<name>"`, or `"<kind>.noname.<handle>"` for anonymous requests.
pub fn request_name(kind: OpKind, name: Option<&str>, handle: HandleId) -> String {
    match name {
        Some(name) => format!("{}.{name}", kind.prefix()),
        None => format!("{}.noname.{handle}", kind.prefix()),
    }
}
