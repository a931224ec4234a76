use std::fmt;

use serde::{Deserialize, Serialize};

/// Kind of communication request routed by the dispatch loop.
///
/// Every kind except the window ops is collective: all ranks must issue
/// the matching request in the same relative order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpKind {
    Allreduce,
    Broadcast,
    Allgather,
    NeighborAllgather,
    NeighborAllreduce,
    Barrier,
    WinPut,
    WinGet,
    WinAccumulate,
}

impl OpKind {
    pub const ALL: [OpKind; 9] = [
        OpKind::Allreduce,
        OpKind::Broadcast,
        OpKind::Allgather,
        OpKind::NeighborAllgather,
        OpKind::NeighborAllreduce,
        OpKind::Barrier,
        OpKind::WinPut,
        OpKind::WinGet,
        OpKind::WinAccumulate,
    ];

    /// Prefix used when naming requests of this kind.
    pub fn prefix(&self) -> &'static str {
        match self {
            OpKind::Allreduce => "allreduce",
            OpKind::Broadcast => "broadcast",
            OpKind::Allgather => "allgather",
            OpKind::NeighborAllgather => "neighbor.allgather",
            OpKind::NeighborAllreduce => "neighbor.allreduce",
            OpKind::Barrier => "barrier",
            OpKind::WinPut => "win.put",
            OpKind::WinGet => "win.get",
            OpKind::WinAccumulate => "win.accumulate",
        }
    }

    /// Whether every rank must call this op in lockstep.
    pub fn is_collective(&self) -> bool {
        !matches!(self, OpKind::WinPut | OpKind::WinGet | OpKind::WinAccumulate)
    }
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.prefix())
    }
}
