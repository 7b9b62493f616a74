//! Evaluation utilities for trained amortizers (small + explicit).
//!
//! These helpers are deliberately glass-box: they surface exactly the scalar
//! they compute and nothing else. A well-calibrated amortizer maps its
//! targets to a standard normal latent, so per-dimension latent moments near
//! `(0, 1)` are a cheap sanity signal (not a formal calibration test).

use crate::amortizer::FlowAmortizer;
use crate::{Error, Result};
use ndarray::{Array1, ArrayView2, Axis};

/// Per-dimension mean and standard deviation of the latent
/// `z = forward(targets, condition)`.
pub fn latent_moments(
    amortizer: &FlowAmortizer,
    targets: &ArrayView2<f32>,
    condition: Option<&ArrayView2<f32>>,
) -> Result<(Array1<f32>, Array1<f32>)> {
    if targets.nrows() < 2 {
        return Err(Error::Domain(
            "latent moments need at least two samples",
        ));
    }
    let (z, _ldj) = amortizer.network().forward(targets, condition)?;
    // Non-empty by the check above.
    let mean = z
        .mean_axis(Axis(0))
        .ok_or(Error::Domain("latent batch must be non-empty"))?;
    let std = z.std_axis(Axis(0), 0.0);
    Ok((mean, std))
}
