//! Neighbor-reduce aggregation.
//!
//! Turns the concatenated payloads of the in-neighbors plus the local value
//! into one result. Pure functions; no state survives a call.

use std::collections::BTreeMap;

use confluence_core::{Buffer, CommError, DataType, Element, Rank, TopologySnapshot};

/// Aggregate `gathered` (in-neighbor payloads in `in_neighbors` order) with
/// `local` into `out`.
///
/// Each neighbor owns `gathered.len() / indegree` elements. Payloads of
/// different lengths are not detected: extra elements are ignored and
/// missing ones contribute nothing.
///
/// With `average` and a weight map, the result is
/// `Σ w(src) * slice + w(self) * local`, where an absent source weight is 0
/// and an absent self weight is an error. Otherwise the slices and `local`
/// are summed, then divided by `indegree + 1` when averaging.
pub fn neighbor_reduce<T: Element>(
    gathered: &[T],
    local: &[T],
    topology: &TopologySnapshot,
    self_rank: Rank,
    average: bool,
    out: &mut [T],
) -> Result<(), CommError> {
    let indegree = topology.indegree();
    let slice_len = if indegree == 0 { 0 } else { gathered.len() / indegree };
    let slices = topology
        .in_neighbors
        .iter()
        .enumerate()
        .map(|(i, src)| (*src, &gathered[i * slice_len..(i + 1) * slice_len]));

    match (average, topology.weights.as_ref()) {
        (true, Some(weights)) => {
            let self_weight = *weights.get(&self_rank).ok_or_else(|| {
                CommError::Precondition(format!(
                    "weighted reduction needs a weight for the local rank {self_rank}"
                ))
            })?;
            let mut acc: Vec<f64> = local.iter().map(|x| self_weight * x.to_f64()).collect();
            for (src, slice) in slices {
                let w = weights.get(&src).copied().unwrap_or(0.0);
                for (a, x) in acc.iter_mut().zip(slice) {
                    *a += w * x.to_f64();
                }
            }
            for (o, a) in out.iter_mut().zip(acc) {
                *o = T::from_f64(a);
            }
        }
        _ => {
            for (o, l) in out.iter_mut().zip(local) {
                *o = *l;
            }
            for (_, slice) in slices {
                for (o, x) in out.iter_mut().zip(slice) {
                    *o = Element::add(*o, *x);
                }
            }
            if average {
                for o in out.iter_mut() {
                    *o = Element::div_count(*o, indegree + 1);
                }
            }
        }
    }
    Ok(())
}

/// [`neighbor_reduce`] over buffers. The result takes the local buffer's
/// dtype and shape.
pub fn reduce_neighbors(
    gathered: &Buffer,
    local: &Buffer,
    topology: &TopologySnapshot,
    self_rank: Rank,
    average: bool,
) -> Result<Buffer, CommError> {
    if gathered.dtype() != local.dtype() {
        return Err(CommError::InvalidArgument(format!(
            "gathered buffer is {}, local buffer is {}",
            gathered.dtype(),
            local.dtype()
        )));
    }
    let mut out = Buffer::zeros(local.dtype(), local.shape().clone());

    macro_rules! reduce_as {
        ($t:ty) => {{
            let dst = out
                .as_mut_slice::<$t>()
                .ok_or_else(|| CommError::Unknown("output dtype changed".to_string()))?;
            neighbor_reduce::<$t>(
                gathered.typed::<$t>()?,
                local.typed::<$t>()?,
                topology,
                self_rank,
                average,
                dst,
            )
        }};
    }
    match local.dtype() {
        DataType::U8 => reduce_as!(u8),
        DataType::I8 => reduce_as!(i8),
        DataType::U16 => reduce_as!(u16),
        DataType::I16 => reduce_as!(i16),
        DataType::I32 => reduce_as!(i32),
        DataType::I64 => reduce_as!(i64),
        DataType::F32 => reduce_as!(f32),
        DataType::F64 => reduce_as!(f64),
    }?;
    Ok(out)
}

/// Weighted sum of `local` and the window's neighbor copies.
///
/// `weights` must hold the local rank; neighbors it omits count as zero.
pub fn weighted_combine(
    local: &Buffer,
    neighbors: &BTreeMap<Rank, Buffer>,
    weights: &BTreeMap<Rank, f64>,
    self_rank: Rank,
) -> Result<Buffer, CommError> {
    let ranks: Vec<Rank> = neighbors.keys().copied().collect();
    let gathered = if neighbors.is_empty() {
        Buffer::zeros(local.dtype(), local.shape().with_first_dim(0))
    } else {
        let parts: Vec<&Buffer> = neighbors.values().collect();
        Buffer::concat(&parts)?
    };
    let topology = TopologySnapshot::new(ranks, Vec::new()).with_weights(weights.clone());
    reduce_neighbors(&gathered, local, &topology, self_rank, true)
}

/// `1 / (n + 1)` for the local rank and each of `neighbors`.
pub fn uniform_weights(self_rank: Rank, neighbors: &[Rank]) -> BTreeMap<Rank, f64> {
    let w = 1.0 / (neighbors.len() + 1) as f64;
    std::iter::once(self_rank)
        .chain(neighbors.iter().copied())
        .map(|r| (r, w))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use confluence_core::Shape;

    fn two_in(weights: Option<BTreeMap<Rank, f64>>) -> TopologySnapshot {
        let t = TopologySnapshot::new(vec![1, 2], vec![1, 2]);
        match weights {
            Some(w) => t.with_weights(w),
            None => t,
        }
    }

    #[test]
    fn weighted_average() {
        let topo = two_in(Some(BTreeMap::from([(1, 0.25), (2, 0.25), (0, 0.5)])));
        let mut out = [0.0f64];
        neighbor_reduce(&[2.0, 4.0], &[6.0], &topo, 0, true, &mut out).unwrap();
        assert_eq!(out, [4.5]);
    }

    #[test]
    fn unweighted_average() {
        let mut out = [0.0f64];
        neighbor_reduce(&[2.0, 4.0], &[6.0], &two_in(None), 0, true, &mut out).unwrap();
        assert_eq!(out, [4.0]);
    }

    #[test]
    fn sum_ignores_weights() {
        let topo = two_in(Some(BTreeMap::from([(1, 0.25), (2, 0.25), (0, 0.5)])));
        let mut out = [0.0f32];
        neighbor_reduce(&[2.0, 4.0], &[6.0], &topo, 0, false, &mut out).unwrap();
        assert_eq!(out, [12.0]);
    }

    #[test]
    fn missing_source_weight_counts_as_zero() {
        let topo = two_in(Some(BTreeMap::from([(1, 0.5), (0, 0.5)])));
        let mut out = [0.0f64];
        neighbor_reduce(&[2.0, 100.0], &[6.0], &topo, 0, true, &mut out).unwrap();
        assert_eq!(out, [4.0]);
    }

    #[test]
    fn missing_self_weight_is_a_precondition_error() {
        let topo = two_in(Some(BTreeMap::from([(1, 0.5), (2, 0.5)])));
        let mut out = [0.0f64];
        let err = neighbor_reduce(&[2.0, 4.0], &[6.0], &topo, 0, true, &mut out).unwrap_err();
        assert!(matches!(err, CommError::Precondition(_)));
    }

    #[test]
    fn multi_element_slices() {
        // neighbor 1 sends [1, 2], neighbor 2 sends [3, 4]
        let mut out = [0i32; 2];
        neighbor_reduce(&[1, 2, 3, 4], &[5, 6], &two_in(None), 0, true, &mut out).unwrap();
        assert_eq!(out, [3, 4]);
    }

    #[test]
    fn narrow_integers_divide_by_the_full_count() {
        let topo = TopologySnapshot::new((1..=200).collect(), vec![]);
        let mut gathered = vec![0i8; 200];
        gathered[0] = 100;
        let mut out = [0i8];
        neighbor_reduce(&gathered, &[27], &topo, 0, true, &mut out).unwrap();
        // 127 / 201
        assert_eq!(out, [0]);
    }

    #[test]
    fn no_in_neighbors_keeps_local() {
        let topo = TopologySnapshot::new(vec![], vec![]);
        let mut out = [0.0f64; 2];
        neighbor_reduce(&[], &[1.5, 2.5], &topo, 0, true, &mut out).unwrap();
        assert_eq!(out, [1.5, 2.5]);
    }

    #[test]
    fn is_idempotent() {
        let topo = two_in(Some(BTreeMap::from([(1, 0.2), (2, 0.3), (0, 0.5)])));
        let mut first = [0.0f64; 1];
        let mut second = [0.0f64; 1];
        neighbor_reduce(&[1.0, 2.0], &[3.0], &topo, 0, true, &mut first).unwrap();
        neighbor_reduce(&[1.0, 2.0], &[3.0], &topo, 0, true, &mut second).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn buffer_result_takes_local_shape() {
        let local = Buffer::from_vec(vec![1.0f32, 1.0, 1.0, 1.0], Shape::new(vec![2, 2])).unwrap();
        let gathered = Buffer::from_vec(vec![3.0f32; 8], Shape::new(vec![4, 2])).unwrap();
        let out = reduce_neighbors(&gathered, &local, &two_in(None), 0, false).unwrap();
        assert_eq!(out.shape(), &Shape::new(vec![2, 2]));
        assert_eq!(out.as_slice::<f32>().unwrap(), &[7.0; 4]);
    }

    #[test]
    fn buffer_dtype_mismatch() {
        let local = Buffer::vector(vec![1.0f32]);
        let gathered = Buffer::vector(vec![1.0f64, 2.0]);
        assert!(reduce_neighbors(&gathered, &local, &two_in(None), 0, true).is_err());
    }

    #[test]
    fn combine_window_copies() {
        let local = Buffer::vector(vec![3.0f64]);
        let neighbors = BTreeMap::from([(1, Buffer::vector(vec![6.0f64])), (3, Buffer::vector(vec![9.0f64]))]);
        let weights = uniform_weights(0, &[1, 3]);
        let out = weighted_combine(&local, &neighbors, &weights, 0).unwrap();
        let v = out.as_slice::<f64>().unwrap()[0];
        assert!((v - 6.0).abs() < 1e-12);
    }

    #[test]
    fn combine_without_neighbors() {
        let local = Buffer::vector(vec![2.0f64, 4.0]);
        let weights = BTreeMap::from([(0, 0.5)]);
        let out = weighted_combine(&local, &BTreeMap::new(), &weights, 0).unwrap();
        assert_eq!(out.as_slice::<f64>().unwrap(), &[1.0, 2.0]);
    }
}
