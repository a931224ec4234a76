//! End-to-end tests through the public `Runtime` API.
//!
//! `MirrorSubstrate` stands in for a real group. `GatedSubstrate` wraps it and
//! parks the allreduce named `allreduce.hold` until the test opens the gate,
//! so requests can be kept queued or in flight on purpose. It can also stall
//! its first initialization, optionally panicking afterwards.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use confluence_core::{
    init_tracing, shared, Buffer, CommError, LoggingConfig, OutputAllocator, Rank, RuntimeConfig,
    Status, TopologySnapshot,
};
use confluence_runtime::{MirrorSubstrate, Runtime, Substrate, Weights};

const HOLD: &str = "hold";
const TIMEOUT: Duration = Duration::from_secs(5);

struct GatedSubstrate {
    inner: MirrorSubstrate,
    open: Mutex<bool>,
    opened: Condvar,
    entered: AtomicBool,
    first_init_delay: Duration,
    first_init_panics: bool,
    init_attempts: AtomicUsize,
}

impl GatedSubstrate {
    fn new(size: usize) -> Self {
        Self {
            inner: MirrorSubstrate::new(size),
            open: Mutex::new(false),
            opened: Condvar::new(),
            entered: AtomicBool::new(false),
            first_init_delay: Duration::ZERO,
            first_init_panics: false,
            init_attempts: AtomicUsize::new(0),
        }
    }

    fn with_slow_first_init(mut self, delay: Duration, then_panic: bool) -> Self {
        self.first_init_delay = delay;
        self.first_init_panics = then_panic;
        self
    }

    fn open(&self) {
        *self.open.lock().unwrap() = true;
        self.opened.notify_all();
    }

    /// Spin until the held request is executing on the dispatch thread.
    fn wait_entered(&self) {
        let started = Instant::now();
        while !self.entered.load(Ordering::Acquire) {
            assert!(started.elapsed() < TIMEOUT, "held request never started");
            thread::sleep(Duration::from_millis(1));
        }
    }
}

impl Substrate for GatedSubstrate {
    fn initialize(&self) -> Result<(), CommError> {
        let attempt = self.init_attempts.fetch_add(1, Ordering::AcqRel);
        if attempt == 0 && !self.first_init_delay.is_zero() {
            thread::sleep(self.first_init_delay);
            if self.first_init_panics {
                panic!("substrate initialization crashed");
            }
        }
        self.inner.initialize()
    }

    fn finalize(&self) {
        self.inner.finalize()
    }

    fn rank(&self) -> Rank {
        self.inner.rank()
    }

    fn size(&self) -> usize {
        self.inner.size()
    }

    fn windows_empty(&self) -> bool {
        self.inner.windows_empty()
    }

    fn set_topology(&self, topology: &TopologySnapshot) -> Status {
        self.inner.set_topology(topology)
    }

    fn allreduce(&self, name: &str, input: &Buffer, output: &mut Buffer) -> Status {
        if name == format!("allreduce.{HOLD}") {
            self.entered.store(true, Ordering::Release);
            let mut open = self.open.lock().unwrap();
            while !*open {
                open = self.opened.wait(open).unwrap();
            }
        }
        self.inner.allreduce(name, input, output)
    }

    fn broadcast(&self, name: &str, buffer: &mut Buffer, root_rank: Rank) -> Status {
        self.inner.broadcast(name, buffer, root_rank)
    }

    fn allgather(
        &self,
        name: &str,
        input: &Buffer,
        allocator: &dyn OutputAllocator,
        output: &mut Buffer,
    ) -> Status {
        self.inner.allgather(name, input, allocator, output)
    }

    fn neighbor_allgather(
        &self,
        name: &str,
        input: &Buffer,
        allocator: &dyn OutputAllocator,
        output: &mut Buffer,
    ) -> Status {
        self.inner.neighbor_allgather(name, input, allocator, output)
    }

    fn barrier(&self, name: &str) -> Status {
        self.inner.barrier(name)
    }

    fn win_create(&self, name: &str, buffer: &Buffer) -> Status {
        self.inner.win_create(name, buffer)
    }

    fn win_sync(
        &self,
        name: &str,
        update_weights: &Weights,
        local: &mut Buffer,
        neighbors: &mut BTreeMap<Rank, Buffer>,
    ) -> Status {
        self.inner.win_sync(name, update_weights, local, neighbors)
    }

    fn win_update(&self, name: &str, value: &Buffer) -> Status {
        self.inner.win_update(name, value)
    }

    fn win_free(&self, name: Option<&str>) -> Status {
        self.inner.win_free(name)
    }

    fn win_fence(&self, name: &str) -> Status {
        self.inner.win_fence(name)
    }

    fn win_put(&self, name: &str, input: &Buffer, dst_weights: &Weights) -> Status {
        self.inner.win_put(name, input, dst_weights)
    }

    fn win_get(&self, name: &str, src_weights: &Weights) -> Status {
        self.inner.win_get(name, src_weights)
    }

    fn win_accumulate(&self, name: &str, input: &Buffer, dst_weights: &Weights) -> Status {
        self.inner.win_accumulate(name, input, dst_weights)
    }
}

fn mirrored(size: usize) -> (Runtime, Arc<MirrorSubstrate>) {
    init_tracing(&LoggingConfig { filter: "warn".into() });
    let mirror = Arc::new(MirrorSubstrate::new(size));
    let rt = Runtime::new(RuntimeConfig::default(), mirror.clone()).unwrap();
    rt.start().unwrap();
    (rt, mirror)
}

fn gated(size: usize) -> (Runtime, Arc<GatedSubstrate>) {
    let gate = Arc::new(GatedSubstrate::new(size));
    let rt = Runtime::new(RuntimeConfig::default(), gate.clone()).unwrap();
    rt.start().unwrap();
    (rt, gate)
}

/// A runtime whose first substrate initialization outlasts its timeout.
fn slow_start(then_panic: bool) -> (Runtime, Arc<GatedSubstrate>) {
    let gate = Arc::new(
        GatedSubstrate::new(2).with_slow_first_init(Duration::from_millis(200), then_panic),
    );
    let mut config = RuntimeConfig::default();
    config.dispatch.init_timeout_ms = 20;
    let rt = Runtime::new(config, gate.clone()).unwrap();
    (rt, gate)
}

fn values(buffer: &Buffer) -> Vec<f32> {
    buffer.typed::<f32>().unwrap().to_vec()
}

// ── Collectives ───────────────────────────────────────────────

#[test]
fn blocking_collectives_on_a_mirrored_group() {
    let (rt, _mirror) = mirrored(3);
    let x = Buffer::vector(vec![1.0f32, 2.0]);

    assert_eq!(values(&rt.allreduce(&x, false, None).unwrap()), vec![3.0, 6.0]);
    assert_eq!(values(&rt.allreduce(&x, true, Some("avg")).unwrap()), vec![1.0, 2.0]);
    // the local rank is the root, so its own value comes back
    assert_eq!(values(&rt.broadcast(&x, 0, None).unwrap()), vec![1.0, 2.0]);

    let gathered = rt.allgather(&x, None).unwrap();
    assert_eq!(gathered.shape().dims(), &[6]);
    assert_eq!(values(&gathered), vec![1.0, 2.0, 1.0, 2.0, 1.0, 2.0]);
}

#[test]
fn broadcast_root_outside_group_is_rejected() {
    let (rt, _mirror) = mirrored(2);
    let err = rt.broadcast(&Buffer::vector(vec![1.0f32]), 2, None).unwrap_err();
    assert!(matches!(err, CommError::InvalidArgument(_)));
}

#[test]
fn async_submission_and_synchronize() {
    let (rt, _mirror) = mirrored(4);
    let input = shared(Buffer::vector(vec![0.5f32]));
    let output = shared(Buffer::vector(vec![0.0f32]));

    let h = rt.allreduce_async(&input, &output, false, Some("grad")).unwrap();
    let result = rt.synchronize(h).unwrap();
    assert_eq!(values(&result), vec![2.0]);
    // the caller's output buffer was written too
    assert_eq!(values(&output.read().unwrap()), vec![2.0]);
    assert!(matches!(rt.poll(h), Err(CommError::InvalidArgument(_))));
}

#[test]
fn requests_execute_in_admission_order() {
    let (rt, mirror) = mirrored(2);
    let buffers: Vec<_> = (0..3).map(|i| shared(Buffer::vector(vec![i as f32]))).collect();

    let handles: Vec<_> = ["a", "b", "c"]
        .iter()
        .zip(&buffers)
        .map(|(name, buf)| rt.allreduce_async(buf, buf, false, Some(*name)).unwrap())
        .collect();
    for h in handles {
        rt.wait(h).unwrap();
    }

    let order: Vec<String> = mirror
        .executed()
        .into_iter()
        .filter(|n| n.starts_with("allreduce."))
        .collect();
    assert_eq!(order, vec!["allreduce.a", "allreduce.b", "allreduce.c"]);
}

#[test]
fn unnamed_requests_never_collide() {
    let (rt, _mirror) = mirrored(2);
    let buf = shared(Buffer::vector(vec![1.0f32]));
    let first = rt.allreduce_async(&buf, &buf, false, None).unwrap();
    let second = rt.allreduce_async(&buf, &buf, false, None).unwrap();
    assert_ne!(first, second);
    rt.wait(first).unwrap();
    rt.wait(second).unwrap();
}

// ── Neighbor allreduce ────────────────────────────────────────

#[test]
fn neighbor_allreduce_weighted_average() {
    let (rt, _mirror) = mirrored(4);
    rt.set_topology(TopologySnapshot::ring(0, 4, false)).unwrap();

    // self 0.5 and the one in-neighbor 0.5 over mirrored values
    let out = rt.neighbor_allreduce(&Buffer::vector(vec![4.0f32, 8.0]), true, None).unwrap();
    assert_eq!(values(&out), vec![4.0, 8.0]);
}

#[test]
fn neighbor_allreduce_custom_weights() {
    let (rt, _mirror) = mirrored(4);
    rt.set_topology(TopologySnapshot::bi_ring(0, 4)).unwrap();
    rt.set_topology_weights(Some(BTreeMap::from([(0, 0.5), (1, 0.25), (3, 0.25)])))
        .unwrap();

    let out = rt.neighbor_allreduce(&Buffer::vector(vec![2.0f32]), true, None).unwrap();
    assert_eq!(values(&out), vec![2.0]);
}

#[test]
fn neighbor_allreduce_unweighted() {
    let (rt, _mirror) = mirrored(4);
    rt.set_topology(TopologySnapshot::bi_ring(0, 4)).unwrap();
    rt.set_topology_weights(None).unwrap();
    let x = Buffer::vector(vec![3.0f32]);

    assert_eq!(values(&rt.neighbor_allreduce(&x, true, Some("avg")).unwrap()), vec![3.0]);
    assert_eq!(values(&rt.neighbor_allreduce(&x, false, Some("sum")).unwrap()), vec![9.0]);
}

#[test]
fn neighbor_allgather_stacks_in_neighbors() {
    let (rt, _mirror) = mirrored(4);
    rt.set_topology(TopologySnapshot::bi_ring(0, 4)).unwrap();
    let out = rt.neighbor_allgather(&Buffer::vector(vec![7.0f32]), None).unwrap();
    assert_eq!(values(&out), vec![7.0, 7.0]);
}

// ── Admission and shutdown ────────────────────────────────────

#[test]
fn duplicate_name_is_refused_while_in_flight() {
    let (rt, gate) = gated(2);
    let hold = shared(Buffer::vector(vec![1.0f32]));
    let held = rt.allreduce_async(&hold, &hold, false, Some(HOLD)).unwrap();
    gate.wait_entered();

    let buf = shared(Buffer::vector(vec![1.0f32]));
    let first = rt.allreduce_async(&buf, &buf, false, Some("x")).unwrap();
    assert_eq!(
        rt.allreduce_async(&buf, &buf, false, Some("x")),
        Err(CommError::DuplicateName("allreduce.x".to_string()))
    );
    // the running request's name is reserved as well
    assert!(matches!(
        rt.allreduce_async(&buf, &buf, false, Some(HOLD)),
        Err(CommError::DuplicateName(_))
    ));

    gate.open();
    rt.wait(held).unwrap();
    rt.wait(first).unwrap();

    let again = rt.allreduce_async(&buf, &buf, false, Some("x")).unwrap();
    rt.wait(again).unwrap();
}

#[test]
fn topology_change_refused_while_requests_are_in_flight() {
    let (rt, gate) = gated(4);
    let hold = shared(Buffer::vector(vec![1.0f32]));
    let held = rt.allreduce_async(&hold, &hold, false, Some(HOLD)).unwrap();
    gate.wait_entered();

    let err = rt.set_topology(TopologySnapshot::bi_ring(0, 4)).unwrap_err();
    assert!(matches!(err, CommError::Precondition(_)));
    assert_eq!(rt.neighbor_size(), 0);

    gate.open();
    rt.wait(held).unwrap();
    rt.set_topology(TopologySnapshot::bi_ring(0, 4)).unwrap();
    assert_eq!(rt.neighbor_size(), 2);
}

#[test]
fn wait_timeout_leaves_handle_pending() {
    let (rt, gate) = gated(2);
    let hold = shared(Buffer::vector(vec![1.0f32]));
    let held = rt.allreduce_async(&hold, &hold, false, Some(HOLD)).unwrap();
    gate.wait_entered();

    let timeout = Duration::from_millis(20);
    assert_eq!(rt.wait_timeout(held, timeout), Err(CommError::Timeout(timeout)));
    assert_eq!(rt.poll(held), Ok(false));

    gate.open();
    rt.wait(held).unwrap();
}

#[test]
fn shutdown_fails_queued_requests() {
    let (rt, gate) = gated(2);
    let hold = shared(Buffer::vector(vec![1.0f32]));
    let held = rt.allreduce_async(&hold, &hold, false, Some(HOLD)).unwrap();
    gate.wait_entered();

    let queued: Vec<_> = ["b", "c"]
        .iter()
        .map(|name| {
            let buf = shared(Buffer::vector(vec![1.0f32]));
            rt.allreduce_async(&buf, &buf, false, Some(*name)).unwrap()
        })
        .collect();

    thread::scope(|s| {
        let stopper = s.spawn(|| rt.shutdown());
        let started = Instant::now();
        while rt.is_running() {
            assert!(started.elapsed() < TIMEOUT, "shutdown never began");
            thread::sleep(Duration::from_millis(1));
        }
        thread::sleep(Duration::from_millis(20));
        gate.open();
        stopper.join().unwrap().unwrap();
    });

    // the executing request ran to completion, the queued ones never ran
    rt.wait(held).unwrap();
    for h in queued {
        assert_eq!(rt.wait(h), Err(CommError::Shutdown));
    }
    let buf = shared(Buffer::vector(vec![1.0f32]));
    assert_eq!(
        rt.allreduce_async(&buf, &buf, false, Some("late")),
        Err(CommError::Shutdown)
    );

    let metrics = rt.metrics();
    assert_eq!(metrics.drained_on_shutdown, 2);
    assert_eq!(rt.metrics_json()["running"], false);
}

// ── Windows ───────────────────────────────────────────────────

#[test]
fn window_put_accumulate_get_and_sync() {
    let (rt, _mirror) = mirrored(4);
    rt.set_topology(TopologySnapshot::bi_ring(0, 4)).unwrap();
    rt.win_create("w", &Buffer::vector(vec![1.0f32])).unwrap();

    // slots start as copies of the registered value
    assert_eq!(values(&rt.win_sync("w", None, None).unwrap()), vec![1.0]);

    rt.win_put("w", &Buffer::vector(vec![4.0f32]), Some(BTreeMap::from([(1, 1.0)])))
        .unwrap();
    // (1 + 4 + 1) / 3, which becomes the registered value
    assert_eq!(values(&rt.win_sync("w", None, None).unwrap()), vec![2.0]);

    rt.win_accumulate("w", &Buffer::vector(vec![3.0f32]), None).unwrap();
    // slots are now 7 and 4; slot 1 is cleared after it is read
    let weights = BTreeMap::from([(0, 0.5), (1, 0.5)]);
    let clear = BTreeMap::from([(1, 0.0)]);
    assert_eq!(values(&rt.win_sync("w", Some(&weights), Some(&clear)).unwrap()), vec![4.5]);

    // both slots take the registered 4.5
    rt.win_get("w", None).unwrap();
    assert_eq!(values(&rt.win_sync_then_collect("w").unwrap()), vec![13.5]);
    // collecting emptied the slots
    assert_eq!(values(&rt.win_sync("w", None, None).unwrap()), vec![4.5]);

    rt.win_fence("w").unwrap();
    rt.win_free(Some("w")).unwrap();
}

#[test]
fn one_way_ring_window_round() {
    let (rt, _mirror) = mirrored(4);
    // rank 0 sends to 1 and hears from 3
    rt.set_topology(TopologySnapshot::ring(0, 4, false)).unwrap();
    rt.win_create("w", &Buffer::vector(vec![1.0f32])).unwrap();

    rt.win_put("w", &Buffer::vector(vec![4.0f32]), None).unwrap();
    // (1 + 4) / 2
    assert_eq!(values(&rt.win_sync("w", None, None).unwrap()), vec![2.5]);

    rt.win_accumulate("w", &Buffer::vector(vec![1.0f32]), None).unwrap();
    assert_eq!(values(&rt.win_sync_then_collect("w").unwrap()), vec![7.5]);
    rt.win_free(None).unwrap();
}

#[test]
fn window_weights_must_match_the_topology() {
    let (rt, _mirror) = mirrored(4);
    rt.set_topology(TopologySnapshot::ring(0, 4, false)).unwrap();
    let local = Buffer::vector(vec![1.0f32]);
    rt.win_create("w", &local).unwrap();

    // rank 3 is an in-neighbor, not an out-neighbor
    let err = rt.win_put("w", &local, Some(BTreeMap::from([(3, 1.0)]))).unwrap_err();
    assert!(matches!(err, CommError::InvalidArgument(_)));

    let err = rt.win_sync("w", Some(&BTreeMap::from([(0, 0.5), (2, 0.5)])), None).unwrap_err();
    assert!(matches!(err, CommError::InvalidArgument(_)));
    // only in-neighbor slots can be rescaled
    let err = rt.win_sync("w", None, Some(&BTreeMap::from([(1, 0.0)]))).unwrap_err();
    assert!(matches!(err, CommError::InvalidArgument(_)));
    // a refused sync leaves the registered value alone
    assert_eq!(values(&rt.win_sync("w", None, None).unwrap()), vec![1.0]);

    assert!(matches!(rt.win_create("", &local), Err(CommError::InvalidArgument(_))));
    assert!(matches!(rt.win_create("w", &local), Err(CommError::InvalidArgument(_))));
}

#[test]
fn operations_on_unknown_window_fail() {
    let (rt, _mirror) = mirrored(4);
    rt.set_topology(TopologySnapshot::bi_ring(0, 4)).unwrap();
    let err = rt.win_put("missing", &Buffer::vector(vec![1.0f32]), None).unwrap_err();
    assert!(matches!(err, CommError::InvalidArgument(_)));
}

// ── Startup ───────────────────────────────────────────────────

#[test]
fn initialization_timeout_is_reported_and_cleaned_up() {
    let (rt, gate) = slow_start(false);
    assert_eq!(rt.start(), Err(CommError::Timeout(Duration::from_millis(20))));
    assert!(!rt.is_running());
    assert_eq!(rt.barrier(), Err(CommError::NotInitialized));

    // shutdown waits for the late initialization, which then finalizes
    rt.shutdown().unwrap();
    assert_eq!(gate.inner.initialize_calls(), 1);
    assert_eq!(gate.inner.finalize_calls(), 1);

    rt.start().unwrap();
    rt.barrier().unwrap();
    rt.shutdown().unwrap();
    assert_eq!(gate.inner.initialize_calls(), 2);
    assert_eq!(gate.inner.finalize_calls(), 2);
}

#[test]
fn restart_after_timed_out_initialization_panicked() {
    let (rt, gate) = slow_start(true);
    assert!(matches!(rt.start(), Err(CommError::Timeout(_))));

    // joins the crashed thread before initializing again
    rt.start().unwrap();
    assert!(rt.is_running());
    rt.barrier().unwrap();
    assert_eq!(gate.inner.initialize_calls(), 1);

    rt.shutdown().unwrap();
    assert_eq!(gate.inner.finalize_calls(), 1);
}
