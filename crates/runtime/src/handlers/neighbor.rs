use confluence_core::{Buffer, OpKind, Status};
use tracing::trace;

use crate::aggregate;
use crate::request::{Operation, Request};

use super::{mismatch, snapshot, store, DispatchContext, OpHandler};

/// Stack the in-neighbors' inputs, in in-neighbor order.
pub struct NeighborAllgatherHandler;

impl OpHandler for NeighborAllgatherHandler {
    fn kind(&self) -> OpKind {
        OpKind::NeighborAllgather
    }

    fn execute(&self, request: &Request, ctx: &DispatchContext<'_>) -> Status {
        let Operation::NeighborAllgather { input, output, allocator } = request.op() else {
            return mismatch(self.kind(), request);
        };
        let input = match snapshot(input) {
            Ok(b) => b,
            Err(status) => return status,
        };
        let mut gathered = Buffer::zeros(input.dtype(), input.shape().with_first_dim(0));
        let status =
            ctx.substrate
                .neighbor_allgather(request.name(), &input, allocator.as_ref(), &mut gathered);
        if !status.is_ok() {
            return status;
        }
        store(output, gathered)
    }
}

/// Gather from the in-neighbors, then reduce with the local value.
///
/// The reduction reads the topology in force when the request was popped,
/// so a later topology change never affects a request already running.
pub struct NeighborAllreduceHandler;

impl OpHandler for NeighborAllreduceHandler {
    fn kind(&self) -> OpKind {
        OpKind::NeighborAllreduce
    }

    fn execute(&self, request: &Request, ctx: &DispatchContext<'_>) -> Status {
        let Operation::NeighborAllreduce { input, output, average, allocator } = request.op()
        else {
            return mismatch(self.kind(), request);
        };
        let local = match snapshot(input) {
            Ok(b) => b,
            Err(status) => return status,
        };
        let mut gathered = Buffer::zeros(local.dtype(), local.shape().with_first_dim(0));
        let status =
            ctx.substrate
                .neighbor_allreduce(request.name(), &local, allocator.as_ref(), &mut gathered);
        if !status.is_ok() {
            return status;
        }
        trace!(
            name = %request.name(),
            indegree = ctx.topology.indegree(),
            weighted = ctx.topology.is_weighted(),
            "aggregating neighbor payloads"
        );
        // `local` was copied before the gather, so this also works in place.
        match aggregate::reduce_neighbors(&gathered, &local, ctx.topology, ctx.rank(), *average) {
            Ok(reduced) => store(output, reduced),
            Err(e) => Status::from(e),
        }
    }
}
