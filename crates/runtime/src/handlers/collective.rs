use confluence_core::{Buffer, OpKind, Status};
use tracing::trace;

use crate::request::{Operation, Request};

use super::{mismatch, snapshot, store, DispatchContext, OpHandler};

/// Sum across the group; divides by group size afterwards when averaging.
pub struct AllreduceHandler;

impl OpHandler for AllreduceHandler {
    fn kind(&self) -> OpKind {
        OpKind::Allreduce
    }

    fn execute(&self, request: &Request, ctx: &DispatchContext<'_>) -> Status {
        let Operation::Allreduce { input, output, .. } = request.op() else {
            return mismatch(self.kind(), request);
        };
        let input = match snapshot(input) {
            Ok(b) => b,
            Err(status) => return status,
        };
        let mut reduced = Buffer::zeros(input.dtype(), input.shape().clone());
        let status = ctx.substrate.allreduce(request.name(), &input, &mut reduced);
        if !status.is_ok() {
            return status;
        }
        store(output, reduced)
    }

    fn complete(&self, request: &Request, ctx: &DispatchContext<'_>, status: Status) -> Status {
        let Operation::Allreduce { output, average: true, .. } = request.op() else {
            return status;
        };
        if !status.is_ok() {
            return status;
        }
        match output.write() {
            Ok(mut out) => {
                out.div_scalar(ctx.size());
                Status::ok()
            }
            Err(_) => Status::unknown_error("allreduce output lock poisoned"),
        }
    }
}

/// Replicate the root's input on every rank.
pub struct BroadcastHandler;

impl OpHandler for BroadcastHandler {
    fn kind(&self) -> OpKind {
        OpKind::Broadcast
    }

    fn execute(&self, request: &Request, ctx: &DispatchContext<'_>) -> Status {
        let Operation::Broadcast { input, output, root_rank } = request.op() else {
            return mismatch(self.kind(), request);
        };
        if *root_rank >= ctx.size() {
            return Status::invalid_argument(format!(
                "broadcast root {root_rank} is outside a group of {}",
                ctx.size()
            ));
        }
        let input = match snapshot(input) {
            Ok(b) => b,
            Err(status) => return status,
        };
        // The root sends its input; everyone else receives into a buffer of
        // the same shape.
        let mut buffer = if ctx.rank() == *root_rank {
            input
        } else {
            Buffer::zeros(input.dtype(), input.shape().clone())
        };
        let status = ctx.substrate.broadcast(request.name(), &mut buffer, *root_rank);
        if !status.is_ok() {
            return status;
        }
        store(output, buffer)
    }
}

/// Stack every rank's input along the first dimension.
pub struct AllgatherHandler;

impl OpHandler for AllgatherHandler {
    fn kind(&self) -> OpKind {
        OpKind::Allgather
    }

    fn execute(&self, request: &Request, ctx: &DispatchContext<'_>) -> Status {
        let Operation::Allgather { input, output, allocator } = request.op() else {
            return mismatch(self.kind(), request);
        };
        let input = match snapshot(input) {
            Ok(b) => b,
            Err(status) => return status,
        };
        let mut gathered = Buffer::zeros(input.dtype(), input.shape().with_first_dim(0));
        let status = ctx
            .substrate
            .allgather(request.name(), &input, allocator.as_ref(), &mut gathered);
        if !status.is_ok() {
            return status;
        }
        trace!(name = %request.name(), shape = %gathered.shape(), "allgather output allocated");
        store(output, gathered)
    }
}

pub struct BarrierHandler;

impl OpHandler for BarrierHandler {
    fn kind(&self) -> OpKind {
        OpKind::Barrier
    }

    fn execute(&self, request: &Request, ctx: &DispatchContext<'_>) -> Status {
        let Operation::Barrier = request.op() else {
            return mismatch(self.kind(), request);
        };
        ctx.substrate.barrier(request.name())
    }
}
