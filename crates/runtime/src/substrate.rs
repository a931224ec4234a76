//! The seam between the runtime and the transport that actually moves bytes.

use std::collections::BTreeMap;

use confluence_core::{Buffer, CommError, OutputAllocator, Rank, Status, TopologySnapshot};

use crate::request::Weights;

/// Collective and one-sided primitives of a process group.
///
/// Every method is called from the dispatch thread, except the window
/// lifecycle and topology calls which run on the caller thread that owns
/// them. Implementations report failures through [`Status`] and must not
/// panic on bad input.
pub trait Substrate: Send + Sync {
    /// Bring the transport up. Called once per runtime start.
    fn initialize(&self) -> Result<(), CommError>;

    /// Release the transport. Called once, after the last request.
    fn finalize(&self);

    fn rank(&self) -> Rank;
    fn size(&self) -> usize;

    fn local_rank(&self) -> Rank {
        self.rank()
    }

    fn local_size(&self) -> usize {
        self.size()
    }

    fn threads_supported(&self) -> bool {
        false
    }

    fn unified_memory_model(&self) -> bool {
        false
    }

    /// Whether no one-sided windows are currently registered.
    fn windows_empty(&self) -> bool;

    /// Install the virtual topology used by neighbor and window operations.
    fn set_topology(&self, topology: &TopologySnapshot) -> Status;

    /// Sum `input` across the group into `output`.
    fn allreduce(&self, name: &str, input: &Buffer, output: &mut Buffer) -> Status;

    /// Replace `buffer` with the root's copy.
    fn broadcast(&self, name: &str, buffer: &mut Buffer, root_rank: Rank) -> Status;

    /// Stack every rank's `input` along the first dimension, in rank order.
    fn allgather(
        &self,
        name: &str,
        input: &Buffer,
        allocator: &dyn OutputAllocator,
        output: &mut Buffer,
    ) -> Status;

    /// Stack the in-neighbors' `input`, in in-neighbor order.
    fn neighbor_allgather(
        &self,
        name: &str,
        input: &Buffer,
        allocator: &dyn OutputAllocator,
        output: &mut Buffer,
    ) -> Status;

    /// Gather phase of a neighbor allreduce; the runtime aggregates afterwards.
    fn neighbor_allreduce(
        &self,
        name: &str,
        input: &Buffer,
        allocator: &dyn OutputAllocator,
        output: &mut Buffer,
    ) -> Status {
        self.neighbor_allgather(name, input, allocator, output)
    }

    fn barrier(&self, name: &str) -> Status;

    fn win_create(&self, name: &str, buffer: &Buffer) -> Status;

    /// Copy the registered buffer of window `name` into `local` and its
    /// neighbor slots into `neighbors`, then scale every slot named in
    /// `update_weights` by its weight. Nothing changes if a named slot is
    /// missing.
    fn win_sync(
        &self,
        name: &str,
        update_weights: &Weights,
        local: &mut Buffer,
        neighbors: &mut BTreeMap<Rank, Buffer>,
    ) -> Status;

    /// Replace the registered buffer of window `name`.
    fn win_update(&self, name: &str, value: &Buffer) -> Status;

    /// Free window `name`, or every window when `None`.
    fn win_free(&self, name: Option<&str>) -> Status;

    fn win_fence(&self, name: &str) -> Status;

    fn win_put(&self, name: &str, input: &Buffer, dst_weights: &Weights) -> Status;

    fn win_get(&self, name: &str, src_weights: &Weights) -> Status;

    fn win_accumulate(&self, name: &str, input: &Buffer, dst_weights: &Weights) -> Status;
}
