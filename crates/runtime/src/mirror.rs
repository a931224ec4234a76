//! In-process substrate for single-process runs and tests.
//!
//! Every peer is assumed to contribute exactly what the local rank
//! contributes, so collectives can be computed without a transport. The
//! substrate also counts lifecycle calls and records which primitives ran,
//! in order.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tracing::debug;

use confluence_core::{Buffer, CommError, OutputAllocator, Rank, Status, TopologySnapshot};

use crate::request::Weights;
use crate::substrate::Substrate;

struct Window {
    local: Buffer,
    /// One slot per in-neighbor, seeded with the local buffer.
    neighbors: BTreeMap<Rank, Buffer>,
}

#[derive(Default)]
struct MirrorState {
    topology: TopologySnapshot,
    windows: HashMap<String, Window>,
    executed: Vec<String>,
    initialize_calls: usize,
    finalize_calls: usize,
}

/// A group of `size` identical ranks, simulated by one.
pub struct MirrorSubstrate {
    rank: Rank,
    size: usize,
    state: Mutex<MirrorState>,
}

impl MirrorSubstrate {
    /// Rank 0 of a mirrored group of `size`.
    pub fn new(size: usize) -> Self {
        Self::with_rank(0, size)
    }

    pub fn with_rank(rank: Rank, size: usize) -> Self {
        Self {
            rank,
            size,
            state: Mutex::new(MirrorState {
                topology: TopologySnapshot::isolated(rank),
                ..MirrorState::default()
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MirrorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record(&self, name: &str) {
        self.lock().executed.push(name.to_string());
    }

    /// Names of the primitives executed so far, oldest first.
    pub fn executed(&self) -> Vec<String> {
        self.lock().executed.clone()
    }

    pub fn initialize_calls(&self) -> usize {
        self.lock().initialize_calls
    }

    pub fn finalize_calls(&self) -> usize {
        self.lock().finalize_calls
    }

    pub fn topology(&self) -> TopologySnapshot {
        self.lock().topology.clone()
    }

    /// Stack `copies` clones of `input`, allocating through `allocator`.
    fn stack(
        input: &Buffer,
        copies: usize,
        allocator: &dyn OutputAllocator,
        output: &mut Buffer,
    ) -> Result<(), CommError> {
        let stacked = if copies == 0 {
            Buffer::zeros(input.dtype(), input.shape().with_first_dim(0))
        } else {
            Buffer::concat(&vec![input; copies])?
        };
        let mut allocated = allocator.allocate(input.dtype(), stacked.shape().clone())?;
        allocated.copy_from(&stacked);
        *output = allocated;
        Ok(())
    }

    /// The in-neighbor whose put lands in our window when we put to `dst`.
    ///
    /// Every peer mirrors us, so over a two-way edge that is `dst` itself.
    /// Otherwise it is the rank at the same offset on the other side of us:
    /// we send to `rank + k` while `rank - k` sends to us.
    fn mirrored_source(&self, window: &Window, dst: Rank) -> Rank {
        if window.neighbors.contains_key(&dst) {
            return dst;
        }
        (2 * self.rank + self.size - dst % self.size) % self.size
    }

    fn with_window(
        &self,
        name: &str,
        f: impl FnOnce(&mut Window) -> Result<(), CommError>,
    ) -> Status {
        let mut state = self.lock();
        let Some(window) = state.windows.get_mut(name) else {
            return Status::invalid_argument(format!("no window named '{name}'"));
        };
        match f(window) {
            Ok(()) => {
                state.executed.push(name.to_string());
                Status::ok()
            }
            Err(e) => Status::from(e),
        }
    }
}

fn weighted(buffer: &Buffer, weight: f64) -> Buffer {
    let mut copy = buffer.clone();
    copy.scale(weight);
    copy
}

fn slot<'a>(window: &'a mut Window, rank: Rank) -> Result<&'a mut Buffer, CommError> {
    window.neighbors.get_mut(&rank).ok_or_else(|| {
        CommError::InvalidArgument(format!("rank {rank} has no slot in this window"))
    })
}

impl Substrate for MirrorSubstrate {
    fn initialize(&self) -> Result<(), CommError> {
        if self.size == 0 || self.rank >= self.size {
            return Err(CommError::InvalidArgument(format!(
                "rank {} is outside a group of {}",
                self.rank, self.size
            )));
        }
        self.lock().initialize_calls += 1;
        debug!(rank = self.rank, size = self.size, "mirror substrate initialized");
        Ok(())
    }

    fn finalize(&self) {
        let mut state = self.lock();
        state.finalize_calls += 1;
        state.windows.clear();
    }

    fn rank(&self) -> Rank {
        self.rank
    }

    fn size(&self) -> usize {
        self.size
    }

    fn threads_supported(&self) -> bool {
        true
    }

    fn unified_memory_model(&self) -> bool {
        true
    }

    fn windows_empty(&self) -> bool {
        self.lock().windows.is_empty()
    }

    fn set_topology(&self, topology: &TopologySnapshot) -> Status {
        if let Err(e) = topology.validate(self.size, self.rank) {
            return Status::from(e);
        }
        self.lock().topology = topology.clone();
        Status::ok()
    }

    fn allreduce(&self, name: &str, input: &Buffer, output: &mut Buffer) -> Status {
        let mut sum = input.clone();
        for _ in 1..self.size {
            if let Err(e) = sum.add_assign(input) {
                return Status::from(e);
            }
        }
        *output = sum;
        self.record(name);
        Status::ok()
    }

    fn broadcast(&self, name: &str, _buffer: &mut Buffer, root_rank: Rank) -> Status {
        if root_rank >= self.size {
            return Status::invalid_argument(format!("root {root_rank} is outside the group"));
        }
        // The root holds the same data as every other rank.
        self.record(name);
        Status::ok()
    }

    fn allgather(
        &self,
        name: &str,
        input: &Buffer,
        allocator: &dyn OutputAllocator,
        output: &mut Buffer,
    ) -> Status {
        if let Err(e) = Self::stack(input, self.size, allocator, output) {
            return Status::from(e);
        }
        self.record(name);
        Status::ok()
    }

    fn neighbor_allgather(
        &self,
        name: &str,
        input: &Buffer,
        allocator: &dyn OutputAllocator,
        output: &mut Buffer,
    ) -> Status {
        let indegree = self.lock().topology.indegree();
        if let Err(e) = Self::stack(input, indegree, allocator, output) {
            return Status::from(e);
        }
        self.record(name);
        Status::ok()
    }

    fn barrier(&self, name: &str) -> Status {
        self.record(name);
        Status::ok()
    }

    fn win_create(&self, name: &str, buffer: &Buffer) -> Status {
        let mut state = self.lock();
        if state.windows.contains_key(name) {
            return Status::invalid_argument(format!("window '{name}' already exists"));
        }
        let neighbors = state
            .topology
            .in_neighbors
            .iter()
            .map(|r| (*r, buffer.clone()))
            .collect();
        state
            .windows
            .insert(name.to_string(), Window { local: buffer.clone(), neighbors });
        Status::ok()
    }

    fn win_sync(
        &self,
        name: &str,
        update_weights: &Weights,
        local: &mut Buffer,
        neighbors: &mut BTreeMap<Rank, Buffer>,
    ) -> Status {
        let mut state = self.lock();
        let Some(window) = state.windows.get_mut(name) else {
            return Status::invalid_argument(format!("no window named '{name}'"));
        };
        let missing = update_weights.keys().find(|r| !window.neighbors.contains_key(*r));
        if let Some(rank) = missing {
            return Status::invalid_argument(format!("rank {rank} has no slot in window '{name}'"));
        }
        local.clone_from(&window.local);
        neighbors.clone_from(&window.neighbors);
        for (rank, w) in update_weights {
            if let Some(slot) = window.neighbors.get_mut(rank) {
                slot.scale(*w);
            }
        }
        Status::ok()
    }

    fn win_update(&self, name: &str, value: &Buffer) -> Status {
        match self.lock().windows.get_mut(name) {
            Some(window) => {
                window.local = value.clone();
                Status::ok()
            }
            None => Status::invalid_argument(format!("no window named '{name}'")),
        }
    }

    fn win_free(&self, name: Option<&str>) -> Status {
        let mut state = self.lock();
        match name {
            None => {
                state.windows.clear();
                Status::ok()
            }
            Some(name) if state.windows.remove(name).is_some() => Status::ok(),
            Some(name) => Status::invalid_argument(format!("no window named '{name}'")),
        }
    }

    fn win_fence(&self, name: &str) -> Status {
        if self.lock().windows.contains_key(name) {
            Status::ok()
        } else {
            Status::invalid_argument(format!("no window named '{name}'"))
        }
    }

    fn win_put(&self, name: &str, input: &Buffer, dst_weights: &Weights) -> Status {
        self.with_window(name, |window| {
            for (dst, w) in dst_weights {
                let src = self.mirrored_source(window, *dst);
                *slot(window, src)? = weighted(input, *w);
            }
            Ok(())
        })
    }

    fn win_get(&self, name: &str, src_weights: &Weights) -> Status {
        self.with_window(name, |window| {
            let exposed = window.local.clone();
            for (src, w) in src_weights {
                *slot(window, *src)? = weighted(&exposed, *w);
            }
            Ok(())
        })
    }

    fn win_accumulate(&self, name: &str, input: &Buffer, dst_weights: &Weights) -> Status {
        self.with_window(name, |window| {
            for (dst, w) in dst_weights {
                let src = self.mirrored_source(window, *dst);
                slot(window, src)?.add_assign(&weighted(input, *w))?;
            }
            Ok(())
        })
    }
}

impl std::fmt::Debug for MirrorSubstrate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MirrorSubstrate")
            .field("rank", &self.rank)
            .field("size", &self.size)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use confluence_core::{HeapAllocator, StatusKind};

    #[test]
    fn rejects_rank_outside_group() {
        assert!(MirrorSubstrate::with_rank(3, 2).initialize().is_err());
        assert!(MirrorSubstrate::new(0).initialize().is_err());
    }

    #[test]
    fn counts_lifecycle_calls() {
        let m = MirrorSubstrate::new(2);
        m.initialize().unwrap();
        m.finalize();
        assert_eq!((m.initialize_calls(), m.finalize_calls()), (1, 1));
    }

    #[test]
    fn allreduce_multiplies_by_size() {
        let m = MirrorSubstrate::new(3);
        let mut out = Buffer::vector(vec![0u8]);
        assert!(m.allreduce("allreduce.x", &Buffer::vector(vec![5u8]), &mut out).is_ok());
        assert_eq!(out.as_slice::<u8>().unwrap(), &[15]);
        assert_eq!(m.executed(), vec!["allreduce.x".to_string()]);
    }

    #[test]
    fn neighbor_allgather_without_neighbors_is_empty() {
        let m = MirrorSubstrate::new(3);
        let mut out = Buffer::vector(vec![0.0f32]);
        let status = m.neighbor_allgather("g", &Buffer::vector(vec![1.0f32]), &HeapAllocator, &mut out);
        assert!(status.is_ok());
        assert!(out.is_empty());
    }

    #[test]
    fn topology_is_validated() {
        let m = MirrorSubstrate::new(2);
        let bad = TopologySnapshot::new(vec![5], vec![]);
        assert_eq!(m.set_topology(&bad).kind(), StatusKind::InvalidArgument);
    }

    #[test]
    fn window_lifecycle() {
        let m = MirrorSubstrate::new(4);
        assert!(m.set_topology(&TopologySnapshot::ring(0, 4, true)).is_ok());
        assert!(m.windows_empty());

        assert!(m.win_create("a", &Buffer::vector(vec![1.0f64])).is_ok());
        assert!(m.win_create("b", &Buffer::vector(vec![1.0f64])).is_ok());
        assert_eq!(m.win_create("a", &Buffer::vector(vec![1.0f64])).kind(), StatusKind::InvalidArgument);
        assert!(m.win_fence("a").is_ok());

        assert!(m.win_free(Some("a")).is_ok());
        assert!(!m.win_free(Some("a")).is_ok());
        assert!(m.win_free(None).is_ok());
        assert!(m.windows_empty());
    }

    fn synced(m: &MirrorSubstrate, update: &Weights) -> (Vec<f32>, BTreeMap<Rank, Vec<f32>>) {
        let mut local = Buffer::vector(Vec::<f32>::new());
        let mut slots = BTreeMap::new();
        assert!(m.win_sync("w", update, &mut local, &mut slots).is_ok());
        let slots = slots
            .into_iter()
            .map(|(r, b)| (r, b.as_slice::<f32>().unwrap().to_vec()))
            .collect();
        (local.as_slice::<f32>().unwrap().to_vec(), slots)
    }

    #[test]
    fn one_way_ring_puts_land_in_the_upstream_slot() {
        // Rank 0 on a one-way ring of 4 hears from 3 and sends to 1.
        let m = MirrorSubstrate::new(4);
        assert!(m.set_topology(&TopologySnapshot::ring(0, 4, false)).is_ok());
        assert!(m.win_create("w", &Buffer::vector(vec![1.0f32])).is_ok());

        let to_next = Weights::from([(1, 1.0)]);
        assert!(m.win_put("w", &Buffer::vector(vec![4.0f32]), &to_next).is_ok());
        assert_eq!(synced(&m, &Weights::new()).1, BTreeMap::from([(3, vec![4.0])]));

        let half = Weights::from([(1, 0.5)]);
        assert!(m.win_accumulate("w", &Buffer::vector(vec![2.0f32]), &half).is_ok());
        assert_eq!(synced(&m, &Weights::new()).1, BTreeMap::from([(3, vec![5.0])]));
        assert_eq!(m.executed(), vec!["w".to_string(), "w".to_string()]);
    }

    #[test]
    fn two_way_edges_keep_the_destination_slot() {
        let m = MirrorSubstrate::new(4);
        assert!(m.set_topology(&TopologySnapshot::ring(0, 4, true)).is_ok());
        assert!(m.win_create("w", &Buffer::vector(vec![1.0f32])).is_ok());

        assert!(m.win_put("w", &Buffer::vector(vec![4.0f32]), &Weights::from([(3, 1.0)])).is_ok());
        assert_eq!(
            synced(&m, &Weights::new()).1,
            BTreeMap::from([(1, vec![1.0]), (3, vec![4.0])])
        );
    }

    #[test]
    fn sync_scales_slots_after_copying_them() {
        let m = MirrorSubstrate::new(4);
        assert!(m.set_topology(&TopologySnapshot::ring(0, 4, true)).is_ok());
        assert!(m.win_create("w", &Buffer::vector(vec![2.0f32])).is_ok());

        let (local, slots) = synced(&m, &Weights::from([(1, 0.0), (3, 0.5)]));
        assert_eq!(local, vec![2.0]);
        assert_eq!(slots, BTreeMap::from([(1, vec![2.0]), (3, vec![2.0])]));
        assert_eq!(
            synced(&m, &Weights::new()).1,
            BTreeMap::from([(1, vec![0.0]), (3, vec![1.0])])
        );

        assert!(m.win_update("w", &Buffer::vector(vec![7.0f32])).is_ok());
        assert_eq!(synced(&m, &Weights::new()).0, vec![7.0]);
    }

    #[test]
    fn sync_with_a_stray_update_rank_changes_nothing() {
        let m = MirrorSubstrate::new(4);
        assert!(m.set_topology(&TopologySnapshot::ring(0, 4, false)).is_ok());
        assert!(m.win_create("w", &Buffer::vector(vec![2.0f32])).is_ok());

        let mut local = Buffer::vector(Vec::<f32>::new());
        let mut slots = BTreeMap::new();
        let stray = Weights::from([(3, 0.0), (1, 0.0)]);
        let status = m.win_sync("w", &stray, &mut local, &mut slots);
        assert_eq!(status.kind(), StatusKind::InvalidArgument);
        assert_eq!(synced(&m, &Weights::new()).1, BTreeMap::from([(3, vec![2.0])]));
    }
}
