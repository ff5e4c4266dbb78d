//! Per-replica sharding of a shuffled epoch

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

/// Splits the dataset across replicas, reshuffling every epoch
///
/// All replicas shuffle with the same `seed + epoch`, pad the permutation
/// by wrapping around to a multiple of `world_size`, and take every
/// `world_size`-th index starting at their rank. Every replica therefore
/// sees the same number of examples.
#[derive(Debug, Clone)]
pub struct DistributedSampler {
    dataset_len: usize,
    world_size: usize,
    rank: usize,
    seed: u64,
    shuffle: bool,
}

impl DistributedSampler {
    pub fn new(dataset_len: usize, world_size: usize, rank: usize, seed: u64) -> Self {
        assert!(world_size > 0, "world_size must be positive");
        assert!(rank < world_size, "rank {rank} out of range for world size {world_size}");
        Self {
            dataset_len,
            world_size,
            rank,
            seed,
            shuffle: true,
        }
    }

    /// Keep dataset order, for deterministic tests
    #[cfg(test)]
    pub fn without_shuffle(mut self) -> Self {
        self.shuffle = false;
        self
    }

    /// Examples this replica sees per epoch
    pub fn num_samples(&self) -> usize {
        self.dataset_len.div_ceil(self.world_size)
    }

    /// Dataset indices assigned to this replica for `epoch`
    pub fn indices(&self, epoch: usize) -> Vec<usize> {
        if self.dataset_len == 0 {
            return Vec::new();
        }

        let mut order: Vec<usize> = (0..self.dataset_len).collect();
        if self.shuffle {
            let mut rng = StdRng::seed_from_u64(self.seed.wrapping_add(epoch as u64));
            order.shuffle(&mut rng);
        }

        let total = self.num_samples() * self.world_size;
        let padded = order.iter().cycle().take(total);

        padded
            .skip(self.rank)
            .step_by(self.world_size)
            .copied()
            .collect()
    }

    /// Consecutive batches of indices; the last one may be short
    pub fn batches(&self, epoch: usize, batch_size: usize) -> Vec<Vec<usize>> {
        self.indices(epoch)
            .chunks(batch_size.max(1))
            .map(<[usize]>::to_vec)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashSet;

    #[test]
    fn test_single_replica_is_permutation() {
        let sampler = DistributedSampler::new(10, 1, 0, 42);
        let mut indices = sampler.indices(0);
        indices.sort_unstable();
        assert_eq!(indices, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn test_epochs_reshuffle_deterministically() {
        let sampler = DistributedSampler::new(50, 1, 0, 42);
        assert_eq!(sampler.indices(1), sampler.indices(1));
        assert_ne!(sampler.indices(0), sampler.indices(1));
    }

    #[test]
    fn test_wraps_to_multiple_of_world() {
        // 5 examples over 4 replicas: 8 slots, 3 repeated
        let world = 4;
        let shards: Vec<Vec<usize>> = (0..world)
            .map(|r| DistributedSampler::new(5, world, r, 0).without_shuffle().indices(0))
            .collect();

        assert!(shards.iter().all(|s| s.len() == 2));
        assert_eq!(shards[0], vec![0, 4]);
        assert_eq!(shards[1], vec![1, 0]);
        assert_eq!(shards[3], vec![3, 2]);
    }

    #[test]
    fn test_batches_last_may_be_short() {
        let sampler = DistributedSampler::new(7, 1, 0, 0).without_shuffle();
        let batches = sampler.batches(0, 3);
        assert_eq!(batches, vec![vec![0, 1, 2], vec![3, 4, 5], vec![6]]);
    }

    #[test]
    fn test_empty_dataset() {
        let sampler = DistributedSampler::new(0, 2, 1, 0);
        assert!(sampler.indices(0).is_empty());
        assert!(sampler.batches(0, 4).is_empty());
    }

    proptest! {
        #[test]
        fn prop_shards_cover_dataset_disjointly(
            len in 1usize..200,
            world in 1usize..9,
            epoch in 0usize..5,
        ) {
            let shards: Vec<Vec<usize>> = (0..world)
                .map(|r| DistributedSampler::new(len, world, r, 42).indices(epoch))
                .collect();

            let per_rank = len.div_ceil(world);
            prop_assert!(shards.iter().all(|s| s.len() == per_rank));

            let covered: HashSet<usize> = shards.iter().flatten().copied().collect();
            prop_assert_eq!(covered.len(), len);

            // Without wrap-around padding the shards are disjoint
            if len % world == 0 {
                let total: usize = shards.iter().map(Vec::len).sum();
                prop_assert_eq!(total, len);
            }
        }
    }
}
