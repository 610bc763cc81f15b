use std::ops::Range;

use log::warn;
use machine_learning::dataset::BatchView;

use crate::{ReplicaErr, Result};

/// How one global batch is split across the replicas.
///
/// Every replica gets the same `payload`, the trailing `dropped` examples are never
/// assigned to any replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShardPlan {
    pub replicas: usize,
    pub payload: usize,
    pub dropped: usize,
}

impl ShardPlan {
    /// Computes the plan of a batch of `batch_size` examples.
    ///
    /// # Returns
    /// `ReplicaErr::ZeroReplicas` if `replicas` is zero, the single-process path
    /// doesn't go through the sharder.
    pub fn new(batch_size: usize, replicas: usize) -> Result<Self> {
        if replicas == 0 {
            return Err(ReplicaErr::ZeroReplicas);
        }

        let payload = batch_size / replicas;
        Ok(Self {
            replicas,
            payload,
            dropped: batch_size - payload * replicas,
        })
    }

    /// The range of the batch assigned to `replica`.
    ///
    /// # Panics
    /// If `replica` is not lower than the amount of replicas.
    #[inline]
    pub fn range(&self, replica: usize) -> Range<usize> {
        assert!(replica < self.replicas, "replica out of range");
        replica * self.payload..(replica + 1) * self.payload
    }

    /// The amount of examples that end up assigned to a replica.
    #[inline]
    pub fn assigned(&self) -> usize {
        self.payload * self.replicas
    }

    /// Splits `batch` into one contiguous, zero-copy shard per replica.
    ///
    /// Warns once if the batch size isn't divisible by the amount of replicas.
    pub fn split<'a>(batch: BatchView<'a>, replicas: usize) -> Result<(Self, Vec<BatchView<'a>>)> {
        let plan = Self::new(batch.len(), replicas)?;

        if plan.dropped != 0 {
            warn!(
                batch_size = batch.len(),
                replicas = replicas,
                dropped = plan.dropped;
                "batch size isn't divisible by the amount of replicas, dropping the remainder"
            );
        }

        let shards = (0..replicas).map(|i| batch.slice(plan.range(i))).collect();
        Ok((plan, shards))
    }
}

#[cfg(test)]
mod tests {
    use machine_learning::dataset::Batch;
    use ndarray::Array2;

    use super::*;

    fn batch(n: usize) -> Batch {
        let features = Array2::from_shape_fn((n, 2), |(i, j)| (i * 2 + j) as f32);
        Batch::new(features, (0..n).collect()).unwrap()
    }

    #[test]
    fn uneven_batch_drops_the_remainder() {
        let plan = ShardPlan::new(10, 3).unwrap();
        assert_eq!(plan.payload, 3);
        assert_eq!(plan.dropped, 1);
        assert_eq!(plan.range(0), 0..3);
        assert_eq!(plan.range(2), 6..9);
    }

    #[test]
    fn completeness_holds_for_every_size() {
        for b in 0..64 {
            for r in 1..9 {
                let plan = ShardPlan::new(b, r).unwrap();
                assert_eq!(plan.assigned(), r * (b / r));
                assert!(plan.assigned() <= b);
                assert_eq!(plan.dropped, b % r);
            }
        }
    }

    #[test]
    fn zero_replicas_is_rejected() {
        assert!(matches!(
            ShardPlan::new(4, 0),
            Err(ReplicaErr::ZeroReplicas)
        ));
    }

    #[test]
    fn shards_are_contiguous_slices() {
        let batch = batch(7);
        let (plan, shards) = ShardPlan::split(batch.view(), 2).unwrap();
        assert_eq!(plan.dropped, 1);
        assert_eq!(shards.len(), 2);

        assert_eq!(shards[0].labels, &[0, 1, 2]);
        assert_eq!(shards[1].labels, &[3, 4, 5]);
        assert_eq!(shards[1].features.row(0).to_vec(), [6., 7.]);
    }

    #[test]
    fn batch_smaller_than_replicas_yields_empty_shards() {
        let batch = batch(2);
        let (plan, shards) = ShardPlan::split(batch.view(), 4).unwrap();
        assert_eq!(plan.payload, 0);
        assert!(shards.iter().all(|s| s.is_empty()));
    }
}
