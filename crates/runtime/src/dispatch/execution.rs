use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::Ordering;
use std::sync::PoisonError;
use std::time::Instant;

use tracing::{debug, error, info, trace, warn};

use confluence_core::Status;

use crate::handlers::DispatchContext;
use crate::metrics::DispatchMetrics;
use crate::request::Request;

use super::Dispatcher;

impl Dispatcher {
    /// Run the dispatch loop. Blocks until shutdown is signaled.
    ///
    /// On exit every request still queued is resolved with a shutdown
    /// status, then the substrate is finalized exactly once.
    pub fn run(&self) {
        info!(
            rank = self.substrate.rank(),
            size = self.substrate.size(),
            handlers = self.handlers.kinds().len(),
            "Dispatch loop starting"
        );

        while !self.shutdown.load(Ordering::Acquire) {
            if !self.run_once() {
                std::thread::sleep(self.idle_sleep);
            }
        }

        debug!("Dispatch loop observed shutdown");
        self.fail_pending();
        self.substrate.finalize();
        info!("Dispatch loop stopped");
    }

    /// Pop and execute at most one request. Returns `false` if the queue
    /// was empty.
    pub fn run_once(&self) -> bool {
        match self.queue.try_pop() {
            Some(request) => {
                self.execute(request);
                true
            }
            None => false,
        }
    }

    fn execute(&self, request: Request) {
        let kind = request.kind();
        let Some(handler) = self.handlers.get(kind).cloned() else {
            error!(name = %request.name(), kind = %kind, "no handler registered, skipping request");
            self.record(|m| m.record_unsupported());
            self.complete(
                request,
                Status::invalid_argument(format!("unsupported operation kind: {kind}")),
            );
            return;
        };

        trace!(name = %request.name(), kind = %kind, handle = %request.handle(), "executing");
        let topology = self.current_topology();
        let ctx = DispatchContext {
            substrate: self.substrate.as_ref(),
            topology: &topology,
        };

        let started = Instant::now();
        // A panicking handler must not take the dispatch thread down with it.
        let status = panic::catch_unwind(AssertUnwindSafe(|| {
            let status = handler.execute(&request, &ctx);
            handler.complete(&request, &ctx, status)
        }))
        .unwrap_or_else(|_| Status::unknown_error(format!("{kind} handler panicked")));
        let elapsed = started.elapsed();

        if !status.is_ok() {
            warn!(name = %request.name(), kind = %kind, status = %status, "request failed");
        }
        self.record(|m| m.record_execution(kind, elapsed, status.is_ok()));
        self.complete(request, status);
    }

    /// Release the request's name, then resolve its handle, so a caller that
    /// observes completion can reuse the name straight away.
    fn complete(&self, request: Request, status: Status) {
        let (name, completion) = request.into_completion();
        self.queue.finish(&name);
        completion.resolve(status);
    }

    fn fail_pending(&self) {
        let drained = self.queue.drain();
        if drained.is_empty() {
            return;
        }
        info!(count = drained.len(), "Failing requests left in the queue at shutdown");
        self.record(|m| m.record_drained(drained.len()));
        for request in drained {
            let (_, completion) = request.into_completion();
            completion.resolve(Status::shutdown());
        }
    }

    fn record(&self, f: impl FnOnce(&mut DispatchMetrics)) {
        f(&mut self.metrics.write().unwrap_or_else(PoisonError::into_inner));
    }
}
