//! Pre-simulated datasets for offline and round-based training.
//!
//! A thin wrapper over one growing [`SimulationBatch`] that hands out
//! shuffled mini-batches per epoch. Shuffling is seeded and reproducible; the
//! last partial batch is kept, so every simulation is visited exactly once
//! per epoch.

use crate::configure::SimulationBatch;
use crate::{Error, Result};
use rand::Rng;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

/// A fixed (but appendable) collection of simulations.
#[derive(Debug, Clone)]
pub struct SimulatedDataset {
    data: SimulationBatch,
}

impl SimulatedDataset {
    pub fn new(data: SimulationBatch) -> Self {
        Self { data }
    }

    pub fn n_sim(&self) -> usize {
        self.data.n_sim()
    }

    pub fn data(&self) -> &SimulationBatch {
        &self.data
    }

    /// Grow the dataset (round-based training). Shape and context presence
    /// must match the existing data.
    pub fn append(&mut self, batch: &SimulationBatch) -> Result<()> {
        self.data.append(batch)
    }

    /// One epoch worth of shuffled mini-batches. The shuffle is a seeded
    /// Fisher–Yates over row indices; the final batch may be smaller than
    /// `batch_size`.
    pub fn epoch_batches(&self, batch_size: usize, seed: u64) -> Result<Vec<SimulationBatch>> {
        if batch_size == 0 {
            return Err(Error::Domain("batch_size must be >= 1"));
        }
        let n = self.n_sim();
        let mut idx: Vec<usize> = (0..n).collect();
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        for i in (1..n).rev() {
            let j = rng.random_range(0..=i);
            idx.swap(i, j);
        }

        let mut batches = Vec::with_capacity(n.div_ceil(batch_size));
        for chunk in idx.chunks(batch_size) {
            batches.push(self.data.select_rows(chunk));
        }
        Ok(batches)
    }
}
