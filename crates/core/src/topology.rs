//! Directed neighbor graph as seen from one rank.
//!
//! A [`TopologySnapshot`] is read-only while requests are in flight. The
//! runtime swaps in a new one only when nothing is queued and no windows
//! are open.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::error::CommError;

pub type Rank = usize;

/// In/out neighbors of the local rank, optionally weighted.
///
/// Neighbor order is significant: gathered payloads are concatenated in
/// `in_neighbors` order.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TopologySnapshot {
    pub in_neighbors: Vec<Rank>,
    pub out_neighbors: Vec<Rank>,
    /// rank -> weight, including the local rank when present.
    pub weights: Option<BTreeMap<Rank, f64>>,
}

impl TopologySnapshot {
    pub fn new(in_neighbors: Vec<Rank>, out_neighbors: Vec<Rank>) -> Self {
        Self { in_neighbors, out_neighbors, weights: None }
    }

    pub fn with_weights(mut self, weights: BTreeMap<Rank, f64>) -> Self {
        self.weights = Some(weights);
        self
    }

    /// Drop the weights, keeping the graph.
    pub fn unweighted(mut self) -> Self {
        self.weights = None;
        self
    }

    pub fn indegree(&self) -> usize {
        self.in_neighbors.len()
    }

    pub fn outdegree(&self) -> usize {
        self.out_neighbors.len()
    }

    pub fn is_weighted(&self) -> bool {
        self.weights.is_some()
    }

    /// Weight of `rank`. A missing entry counts as zero.
    pub fn weight_of(&self, rank: Rank) -> f64 {
        self.weights
            .as_ref()
            .and_then(|w| w.get(&rank).copied())
            .unwrap_or(0.0)
    }

    /// Check the snapshot against the group it will be installed in.
    pub fn validate(&self, size: usize, self_rank: Rank) -> Result<(), CommError> {
        check_ranks("in_neighbors", &self.in_neighbors, size, self_rank)?;
        check_ranks("out_neighbors", &self.out_neighbors, size, self_rank)?;

        if let Some(weights) = &self.weights {
            if !weights.contains_key(&self_rank) {
                return Err(CommError::InvalidArgument(format!(
                    "weighted topology must carry a weight for the local rank {self_rank}"
                )));
            }
            for (rank, weight) in weights {
                if *rank != self_rank && !self.in_neighbors.contains(rank) {
                    return Err(CommError::InvalidArgument(format!(
                        "weight given for rank {rank}, which is not an in-neighbor"
                    )));
                }
                if !weight.is_finite() {
                    return Err(CommError::InvalidArgument(format!(
                        "weight for rank {rank} is not finite"
                    )));
                }
            }
        }
        Ok(())
    }

    // ── Standard graphs ─────────────────────────────────────────

    /// Every rank talks only to itself. The topology before any is set.
    pub fn isolated(rank: Rank) -> Self {
        Self::new(Vec::new(), Vec::new()).with_weights(BTreeMap::from([(rank, 1.0)]))
    }

    /// One-directional ring. Each rank receives from `rank - 1` and sends to
    /// `rank + 1` (reversed with `left_connect`); self and neighbor weigh 1/2.
    pub fn ring(rank: Rank, size: usize, left_connect: bool) -> Self {
        if size <= 1 {
            return Self::isolated(rank);
        }
        let prev = (rank + size - 1) % size;
        let next = (rank + 1) % size;
        let (source, dest) = if left_connect { (next, prev) } else { (prev, next) };
        Self::new(vec![source], vec![dest])
            .with_weights(BTreeMap::from([(rank, 0.5), (source, 0.5)]))
    }

    /// Bidirectional ring; self and both neighbors weigh 1/3.
    pub fn bi_ring(rank: Rank, size: usize) -> Self {
        if size <= 1 {
            return Self::isolated(rank);
        }
        let neighbors = dedup_sorted([(rank + size - 1) % size, (rank + 1) % size], rank);
        let third = 1.0 / 3.0;
        let mut weights: BTreeMap<Rank, f64> = neighbors.iter().map(|r| (*r, third)).collect();
        weights.insert(rank, third);
        Self::new(neighbors.clone(), neighbors).with_weights(weights)
    }

    /// Star around `center`. Leaves keep `1 - 1/size` of their own value and
    /// take `1/size` from the center; the center averages everyone equally.
    pub fn star(rank: Rank, size: usize, center: Rank) -> Self {
        if size <= 1 {
            return Self::isolated(rank);
        }
        let share = 1.0 / size as f64;
        if rank == center {
            let leaves: Vec<Rank> = (0..size).filter(|r| *r != center).collect();
            let weights = (0..size).map(|r| (r, share)).collect();
            Self::new(leaves.clone(), leaves).with_weights(weights)
        } else {
            Self::new(vec![center], vec![center])
                .with_weights(BTreeMap::from([(rank, 1.0 - share), (center, share)]))
        }
    }

    /// Each rank sends to `rank + 2^k` and receives from `rank - 2^k` for every
    /// power of two below `size`; all weights are equal.
    pub fn power_two_ring(rank: Rank, size: usize) -> Self {
        if size <= 1 {
            return Self::isolated(rank);
        }
        let offsets: Vec<usize> = (0u32..)
            .map(|k| 1usize << k)
            .take_while(|step| *step < size)
            .collect();
        let share = 1.0 / (offsets.len() + 1) as f64;
        let sources = dedup_sorted(offsets.iter().map(|o| (rank + size - o) % size), rank);
        let dests = dedup_sorted(offsets.iter().map(|o| (rank + o) % size), rank);
        let mut weights: BTreeMap<Rank, f64> = sources.iter().map(|r| (*r, share)).collect();
        weights.insert(rank, share);
        Self::new(sources, dests).with_weights(weights)
    }
}

fn dedup_sorted(ranks: impl IntoIterator<Item = Rank>, self_rank: Rank) -> Vec<Rank> {
    ranks
        .into_iter()
        .filter(|r| *r != self_rank)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

fn check_ranks(field: &str, ranks: &[Rank], size: usize, self_rank: Rank) -> Result<(), CommError> {
    let mut seen = BTreeSet::new();
    for rank in ranks {
        if *rank >= size {
            return Err(CommError::InvalidArgument(format!(
                "{field} contains rank {rank}, group size is {size}"
            )));
        }
        if *rank == self_rank {
            return Err(CommError::InvalidArgument(format!(
                "{field} must not contain the local rank {self_rank}"
            )));
        }
        if !seen.insert(*rank) {
            return Err(CommError::InvalidArgument(format!(
                "{field} lists rank {rank} twice"
            )));
        }
    }
    Ok(())
}
