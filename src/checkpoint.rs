//! Per-epoch parameter snapshot seam.
//!
//! The trainer notifies a sink after every epoch with the epoch's mean loss
//! and the current flat parameter vector. How (or whether) snapshots are
//! persisted is up to the sink; this crate only ships an in-memory
//! best-loss keeper.

use crate::amortizer::Amortizer;
use crate::Result;

/// Receives the trained state after each epoch.
pub trait CheckpointSink {
    fn on_epoch_end(&mut self, epoch: u64, mean_loss: f32, params: &[f32]) -> Result<()>;
}

/// Keeps the parameter vector of the best (lowest mean loss) epoch seen.
#[derive(Debug, Clone, Default)]
pub struct BestKeeper {
    best_loss: Option<f32>,
    best_epoch: u64,
    best_params: Option<Vec<f32>>,
}

impl BestKeeper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn best_loss(&self) -> Option<f32> {
        self.best_loss
    }

    pub fn best_epoch(&self) -> u64 {
        self.best_epoch
    }

    pub fn best_params(&self) -> Option<&[f32]> {
        self.best_params.as_deref()
    }

    /// Load the best snapshot into an amortizer. Returns `false` when no
    /// epoch has been recorded yet.
    pub fn restore_into<A: Amortizer>(&self, amortizer: &mut A) -> Result<bool> {
        match &self.best_params {
            Some(params) => {
                amortizer.set_parameters(params)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

impl CheckpointSink for BestKeeper {
    fn on_epoch_end(&mut self, epoch: u64, mean_loss: f32, params: &[f32]) -> Result<()> {
        let improved = match self.best_loss {
            Some(best) => mean_loss < best,
            None => true,
        };
        if improved {
            self.best_loss = Some(mean_loss);
            self.best_epoch = epoch;
            self.best_params = Some(params.to_vec());
        }
        Ok(())
    }
}
