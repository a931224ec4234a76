//! Runtime context: owns the queue, the handle table, the dispatch thread
//! and the substrate, and exposes the caller-facing API.
//!
//! Split into focused submodules:
//! - `lifecycle`: start, shutdown, and topology replacement
//! - `submit`: collective submissions, blocking wrappers, and handle waits
//! - `window`: one-sided window lifecycle and put/get/accumulate

mod lifecycle;
mod submit;
mod window;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::thread::JoinHandle;

use serde_json::{json, Value};

use confluence_core::config::load_dotenv;
use confluence_core::{
    CommError, HeapAllocator, OutputAllocator, Rank, RuntimeConfig, SharedBuffer, TopologySnapshot,
};
use confluence_queue::AdmissionQueue;

use crate::dispatch::SharedTopology;
use crate::handle::{HandleId, HandleTable};
use crate::handlers::HandlerTable;
use crate::metrics::DispatchMetrics;
use crate::request::Request;
use crate::substrate::Substrate;

const IDLE: u8 = 0;
const RUNNING: u8 = 1;
const STOPPED: u8 = 2;

/// One explicitly constructed runtime per process group member.
///
/// Nothing happens until [`start`](Runtime::start); dropping a started
/// runtime shuts it down.
pub struct Runtime {
    config: RuntimeConfig,
    queue: Arc<AdmissionQueue<Request>>,
    handles: Arc<HandleTable>,
    substrate: Arc<dyn Substrate>,
    handlers: Arc<HandlerTable>,
    allocator: Arc<dyn OutputAllocator>,
    topology: SharedTopology,
    metrics: Arc<RwLock<DispatchMetrics>>,
    shutdown: Arc<AtomicBool>,
    state: AtomicU8,
    worker: Mutex<Option<JoinHandle<()>>>,
    /// Output buffers of pending submissions, for `synchronize`.
    outputs: Mutex<HashMap<HandleId, SharedBuffer>>,
}

impl Runtime {
    /// Create a runtime with the standard handler table.
    pub fn new(config: RuntimeConfig, substrate: Arc<dyn Substrate>) -> Result<Self, CommError> {
        Self::with_handlers(config, substrate, HandlerTable::standard())
    }

    pub fn with_handlers(
        config: RuntimeConfig,
        substrate: Arc<dyn Substrate>,
        handlers: HandlerTable,
    ) -> Result<Self, CommError> {
        config.validate()?;
        let queue = Arc::new(AdmissionQueue::new());
        // Nothing is admitted before start.
        queue.close();
        let topology = Arc::new(TopologySnapshot::isolated(substrate.rank()));
        Ok(Self {
            config,
            queue,
            handles: Arc::new(HandleTable::new()),
            substrate,
            handlers: Arc::new(handlers),
            allocator: Arc::new(HeapAllocator),
            topology: Arc::new(RwLock::new(topology)),
            metrics: Arc::new(RwLock::new(DispatchMetrics::default())),
            shutdown: Arc::new(AtomicBool::new(false)),
            state: AtomicU8::new(IDLE),
            worker: Mutex::new(None),
            outputs: Mutex::new(HashMap::new()),
        })
    }

    /// Load `.env`, read the config from the environment, and create a runtime.
    pub fn from_env(substrate: Arc<dyn Substrate>) -> Result<Self, CommError> {
        load_dotenv();
        Self::new(RuntimeConfig::from_env()?, substrate)
    }

    /// Allocate gather outputs through `allocator` instead of the heap.
    pub fn with_allocator(mut self, allocator: Arc<dyn OutputAllocator>) -> Self {
        self.allocator = allocator;
        self
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.state.load(Ordering::Acquire) == RUNNING
    }

    pub(crate) fn ensure_running(&self) -> Result<(), CommError> {
        match self.state.load(Ordering::Acquire) {
            RUNNING => Ok(()),
            STOPPED => Err(CommError::Shutdown),
            _ => Err(CommError::NotInitialized),
        }
    }

    // ── Group accessors ───────────────────────────────────────

    pub fn rank(&self) -> Rank {
        self.substrate.rank()
    }

    pub fn size(&self) -> usize {
        self.substrate.size()
    }

    pub fn local_rank(&self) -> Rank {
        self.substrate.local_rank()
    }

    pub fn local_size(&self) -> usize {
        self.substrate.local_size()
    }

    pub fn threads_supported(&self) -> bool {
        self.substrate.threads_supported()
    }

    pub fn unified_memory_model(&self) -> bool {
        self.substrate.unified_memory_model()
    }

    /// The topology requests currently execute against.
    pub fn load_topology(&self) -> Arc<TopologySnapshot> {
        Arc::clone(&self.topology.read().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn load_topology_weights(&self) -> Option<std::collections::BTreeMap<Rank, f64>> {
        self.load_topology().weights.clone()
    }

    pub fn in_neighbor_ranks(&self) -> Vec<Rank> {
        self.load_topology().in_neighbors.clone()
    }

    pub fn out_neighbor_ranks(&self) -> Vec<Rank> {
        self.load_topology().out_neighbors.clone()
    }

    /// Number of in-neighbors.
    pub fn neighbor_size(&self) -> usize {
        self.load_topology().indegree()
    }

    // ── Metrics ───────────────────────────────────────────────

    pub fn metrics(&self) -> DispatchMetrics {
        let mut snapshot = self
            .metrics
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        snapshot.queue_depth = self.queue.len();
        snapshot
    }

    /// Summary for status endpoints and logs.
    pub fn metrics_json(&self) -> Value {
        let metrics = self.metrics();
        let topology = self.load_topology();
        json!({
            "running": self.is_running(),
            "rank": self.rank(),
            "size": self.size(),
            "indegree": topology.indegree(),
            "outdegree": topology.outdegree(),
            "queue_depth": metrics.queue_depth,
            "in_flight": self.queue.in_flight(),
            "pending_handles": self.handles.len(),
            "executed": metrics.total_executed(),
            "failed": metrics.total_failed(),
            "unsupported": metrics.unsupported,
            "drained_on_shutdown": metrics.drained_on_shutdown,
            "per_kind": metrics.executed,
        })
    }

    fn outputs(&self) -> MutexGuard<'_, HashMap<HandleId, SharedBuffer>> {
        self.outputs.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            tracing::error!(error = %e, "Runtime shutdown failed during drop");
        }
    }
}
