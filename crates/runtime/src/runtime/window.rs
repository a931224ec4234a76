use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, info};

use confluence_core::{shared, Buffer, CommError, Rank, SharedBuffer};

use crate::aggregate;
use crate::handle::HandleId;
use crate::request::{Operation, Weights};

use super::Runtime;

fn check_ranks(weights: &Weights, allowed: &[Rank], role: &str) -> Result<(), CommError> {
    match weights.keys().find(|r| !allowed.contains(*r)) {
        Some(rank) => Err(CommError::InvalidArgument(format!(
            "rank {rank} is not an {role} of this rank"
        ))),
        None => Ok(()),
    }
}

/// Fill in default weights (1.0 per allowed rank) or check that the given
/// ones only name allowed ranks.
fn resolve_weights(given: Option<Weights>, allowed: &[Rank], role: &str) -> Result<Weights, CommError> {
    match given {
        None => Ok(allowed.iter().map(|r| (*r, 1.0)).collect()),
        Some(weights) => {
            check_ranks(&weights, allowed, role)?;
            Ok(weights)
        }
    }
}

fn check_name(name: &str) -> Result<(), CommError> {
    if name.is_empty() {
        return Err(CommError::InvalidArgument("window name must not be empty".to_string()));
    }
    Ok(())
}

impl Runtime {
    /// Register `buffer` as window `name`, with one slot per in-neighbor.
    pub fn win_create(&self, name: &str, buffer: &Buffer) -> Result<(), CommError> {
        self.ensure_running()?;
        check_name(name)?;
        self.substrate.win_create(name, buffer).into_result()?;
        info!(window = name, shape = %buffer.shape(), "Window created");
        Ok(())
    }

    /// Combine the window's registered buffer with its neighbor slots and
    /// store the result back as the registered buffer.
    ///
    /// Without `weights`, the local value and every slot count equally.
    /// Given weights may only name the local rank or an in-neighbor; a rank
    /// left out contributes nothing. After the slots are read, each slot
    /// named in `update_weights` is scaled by its weight, so `0.0` clears
    /// it for the next round.
    pub fn win_sync(
        &self,
        name: &str,
        weights: Option<&Weights>,
        update_weights: Option<&Weights>,
    ) -> Result<Buffer, CommError> {
        self.ensure_running()?;
        check_name(name)?;
        let rank = self.rank();
        let in_neighbors = self.in_neighbor_ranks();
        if let Some(weights) = weights {
            let mut allowed = in_neighbors.clone();
            allowed.push(rank);
            check_ranks(weights, &allowed, "in-neighbor or self")?;
        }
        let no_update = Weights::new();
        let update_weights = update_weights.unwrap_or(&no_update);
        check_ranks(update_weights, &in_neighbors, "in-neighbor")?;

        // Overwritten by the substrate with the registered buffer.
        let mut local = Buffer::vector(Vec::<u8>::new());
        let mut neighbors = BTreeMap::new();
        self.substrate
            .win_sync(name, update_weights, &mut local, &mut neighbors)
            .into_result()?;

        let weights = match weights {
            Some(weights) => weights.clone(),
            None => {
                let ranks: Vec<Rank> = neighbors.keys().copied().collect();
                aggregate::uniform_weights(rank, &ranks)
            }
        };
        let combined = aggregate::weighted_combine(&local, &neighbors, &weights, rank)?;
        self.substrate.win_update(name, &combined).into_result()?;
        debug!(window = name, "Window synced");
        Ok(combined)
    }

    /// Sum the registered buffer with every neighbor slot, then clear the
    /// slots. Repeated calls collect only what arrived since the last one.
    pub fn win_sync_then_collect(&self, name: &str) -> Result<Buffer, CommError> {
        let in_neighbors = self.in_neighbor_ranks();
        let weights: Weights = std::iter::once(self.rank())
            .chain(in_neighbors.iter().copied())
            .map(|r| (r, 1.0))
            .collect();
        let clear: Weights = in_neighbors.iter().map(|r| (*r, 0.0)).collect();
        self.win_sync(name, Some(&weights), Some(&clear))
    }

    /// Free window `name`, or every window when `None`.
    pub fn win_free(&self, name: Option<&str>) -> Result<(), CommError> {
        self.ensure_running()?;
        self.substrate.win_free(name).into_result()?;
        info!(window = name.unwrap_or("*"), "Window freed");
        Ok(())
    }

    pub fn win_fence(&self, name: &str) -> Result<(), CommError> {
        self.ensure_running()?;
        self.substrate.win_fence(name).into_result()
    }

    /// Write `input` into the out-neighbors' slots of window `window`.
    ///
    /// Without `dst_weights`, every out-neighbor receives `input` unscaled.
    pub fn win_put_async(
        &self,
        window: &str,
        input: &SharedBuffer,
        dst_weights: Option<Weights>,
    ) -> Result<HandleId, CommError> {
        check_name(window)?;
        let dst_weights =
            resolve_weights(dst_weights, &self.out_neighbor_ranks(), "out-neighbor")?;
        self.submit(
            Some(window),
            Operation::WinPut {
                window: window.to_string(),
                input: Arc::clone(input),
                dst_weights,
            },
        )
    }

    /// Pull the in-neighbors' exposed window memory into the local slots.
    pub fn win_get_async(
        &self,
        window: &str,
        src_weights: Option<Weights>,
    ) -> Result<HandleId, CommError> {
        check_name(window)?;
        let src_weights = resolve_weights(src_weights, &self.in_neighbor_ranks(), "in-neighbor")?;
        self.submit(
            Some(window),
            Operation::WinGet { window: window.to_string(), src_weights },
        )
    }

    /// Add `input` into the out-neighbors' slots of window `window`.
    pub fn win_accumulate_async(
        &self,
        window: &str,
        input: &SharedBuffer,
        dst_weights: Option<Weights>,
    ) -> Result<HandleId, CommError> {
        check_name(window)?;
        let dst_weights =
            resolve_weights(dst_weights, &self.out_neighbor_ranks(), "out-neighbor")?;
        self.submit(
            Some(window),
            Operation::WinAccumulate {
                window: window.to_string(),
                input: Arc::clone(input),
                dst_weights,
            },
        )
    }

    pub fn win_put(
        &self,
        window: &str,
        input: &Buffer,
        dst_weights: Option<Weights>,
    ) -> Result<(), CommError> {
        let handle = self.win_put_async(window, &shared(input.clone()), dst_weights)?;
        self.wait(handle)
    }

    pub fn win_get(&self, window: &str, src_weights: Option<Weights>) -> Result<(), CommError> {
        let handle = self.win_get_async(window, src_weights)?;
        self.wait(handle)
    }

    pub fn win_accumulate(
        &self,
        window: &str,
        input: &Buffer,
        dst_weights: Option<Weights>,
    ) -> Result<(), CommError> {
        let handle = self.win_accumulate_async(window, &shared(input.clone()), dst_weights)?;
        self.wait(handle)
    }
}
