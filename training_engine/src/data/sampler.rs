// training_engine/src/data/sampler.rs

#![warn(missing_docs, clippy::all, clippy::pedantic, clippy::nursery)]
#![deny(unsafe_code, clippy::unwrap_used, clippy::expect_used)]

//! Распределенный сэмплер.
//!
//! Каждую эпоху индексы перемешиваются генератором с зерном `seed + epoch`
//! (одинаково у всех участников), дополняются повтором начала до кратного
//! `world_size` и раздаются через один: участник `r` получает позиции
//! `r, r + world_size, ...`. Все участники видят одинаковое число примеров.

use rand::{seq::SliceRandom, SeedableRng};
use rand_chacha::ChaCha8Rng;

/// Сэмплер одного участника.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DistributedSampler {
    dataset_len: usize,
    rank: usize,
    world_size: usize,
    seed: u64,
    shuffle: bool,
}

impl DistributedSampler {
    /// Создает сэмплер.
    #[must_use]
    pub fn new(dataset_len: usize, rank: usize, world_size: usize, seed: u64, shuffle: bool) -> Self {
        Self {
            dataset_len,
            rank,
            world_size: world_size.max(1),
            seed,
            shuffle,
        }
    }

    /// Число примеров на участника за эпоху.
    #[must_use]
    pub const fn num_samples(&self) -> usize {
        self.dataset_len.div_ceil(self.world_size)
    }

    /// Индексы участника на эпоху.
    #[must_use]
    pub fn indices(&self, epoch: usize) -> Vec<usize> {
        let mut indices: Vec<usize> = (0..self.dataset_len).collect();
        if self.shuffle {
            let mut rng = ChaCha8Rng::seed_from_u64(self.seed.wrapping_add(epoch as u64));
            indices.shuffle(&mut rng);
        }
        let total = self.num_samples() * self.world_size;
        let mut cursor = 0;
        while indices.len() < total && self.dataset_len > 0 {
            indices.push(indices[cursor % self.dataset_len]);
            cursor += 1;
        }
        indices
            .into_iter()
            .skip(self.rank)
            .step_by(self.world_size)
            .collect()
    }
}
