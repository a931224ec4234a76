use confluence_core::{OpKind, Status};

use crate::request::{Operation, Request};

use super::{mismatch, snapshot, DispatchContext, OpHandler};

pub struct WinPutHandler;

impl OpHandler for WinPutHandler {
    fn kind(&self) -> OpKind {
        OpKind::WinPut
    }

    fn execute(&self, request: &Request, ctx: &DispatchContext<'_>) -> Status {
        let Operation::WinPut { window, input, dst_weights } = request.op() else {
            return mismatch(self.kind(), request);
        };
        match snapshot(input) {
            Ok(input) => ctx.substrate.win_put(window, &input, dst_weights),
            Err(status) => status,
        }
    }
}

pub struct WinGetHandler;

impl OpHandler for WinGetHandler {
    fn kind(&self) -> OpKind {
        OpKind::WinGet
    }

    fn execute(&self, request: &Request, ctx: &DispatchContext<'_>) -> Status {
        let Operation::WinGet { window, src_weights } = request.op() else {
            return mismatch(self.kind(), request);
        };
        ctx.substrate.win_get(window, src_weights)
    }
}

pub struct WinAccumulateHandler;

impl OpHandler for WinAccumulateHandler {
    fn kind(&self) -> OpKind {
        OpKind::WinAccumulate
    }

    fn execute(&self, request: &Request, ctx: &DispatchContext<'_>) -> Status {
        let Operation::WinAccumulate { window, input, dst_weights } = request.op() else {
            return mismatch(self.kind(), request);
        };
        match snapshot(input) {
            Ok(input) => ctx.substrate.win_accumulate(window, &input, dst_weights),
            Err(status) => status,
        }
    }
}
