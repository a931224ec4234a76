use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use tracing::info;

use confluence_core::TopologySnapshot;
use confluence_queue::AdmissionQueue;

use crate::handlers::HandlerTable;
use crate::metrics::DispatchMetrics;
use crate::request::Request;
use crate::substrate::Substrate;

/// Topology read by the dispatch thread and replaced by the runtime.
///
/// Readers clone the inner `Arc`, so a replacement never disturbs a request
/// that is already executing.
pub type SharedTopology = Arc<RwLock<Arc<TopologySnapshot>>>;

/// Pops requests in admission order and runs them against the substrate.
pub struct Dispatcher {
    pub(super) queue: Arc<AdmissionQueue<Request>>,
    pub(super) substrate: Arc<dyn Substrate>,
    pub(super) handlers: Arc<HandlerTable>,
    pub(super) topology: SharedTopology,
    pub(super) metrics: Arc<RwLock<DispatchMetrics>>,
    /// Shutdown signal.
    pub(super) shutdown: Arc<AtomicBool>,
    /// Sleep between polls of an empty queue.
    pub(super) idle_sleep: Duration,
}

impl Dispatcher {
    pub fn new(
        queue: Arc<AdmissionQueue<Request>>,
        substrate: Arc<dyn Substrate>,
        handlers: Arc<HandlerTable>,
        topology: SharedTopology,
        idle_sleep: Duration,
    ) -> Self {
        Self {
            queue,
            substrate,
            handlers,
            topology,
            metrics: Arc::new(RwLock::new(DispatchMetrics::default())),
            shutdown: Arc::new(AtomicBool::new(false)),
            idle_sleep,
        }
    }

    /// Share an existing metrics cell instead of a fresh one.
    pub fn with_metrics(mut self, metrics: Arc<RwLock<DispatchMetrics>>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Share an existing shutdown flag instead of a fresh one.
    pub fn with_shutdown_signal(mut self, shutdown: Arc<AtomicBool>) -> Self {
        self.shutdown = shutdown;
        self
    }

    /// Signal the loop to stop after its current iteration.
    pub fn shutdown(&self) {
        info!("Dispatch shutdown requested");
        self.shutdown.store(true, Ordering::Release);
    }

    pub fn shutdown_signal(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    pub fn metrics_handle(&self) -> Arc<RwLock<DispatchMetrics>> {
        Arc::clone(&self.metrics)
    }

    /// Snapshot of the metrics with the current queue depth filled in.
    pub fn metrics(&self) -> DispatchMetrics {
        let mut snapshot = self
            .metrics
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        snapshot.queue_depth = self.queue.len();
        snapshot
    }

    /// The topology a request popped now would execute against.
    pub fn current_topology(&self) -> Arc<TopologySnapshot> {
        Arc::clone(&self.topology.read().unwrap_or_else(PoisonError::into_inner))
    }
}
