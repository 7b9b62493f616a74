//! # amortflow
//!
//! Simulation-based training of amortized inference networks as a library
//! primitive.
//!
//! This crate is intentionally small:
//!
//! - it implements an **invertible coupling stack** (the conditional density
//!   estimator) with exact log-det-Jacobians and explicit gradients,
//! - it implements the **training loops** that connect a generative model, a
//!   configurator, and an amortizer (online / offline / round-based),
//! - it does not provide a CLI or experiment runner (that belongs in apps).
//!
//! ## Public invariants (must not change)
//!
//! - **Determinism knobs are explicit**: constructors and training/sampling
//!   functions take `seed` (or configs do).
//! - **Exact invertibility**: for any network and any valid `(x, condition)`,
//!   `inverse(forward(x, c).0, c)` recovers `x` to floating-point tolerance.
//!   `forward` and `inverse` are pure; only training passes mutate state
//!   (activation-norm initialization), and that never changes the bijection
//!   algebra.
//! - **No hidden normalization**: configurators that rescale inputs say so by
//!   name; the network itself never rescales behind your back.
//! - **Backend-agnostic by default**: this crate uses `ndarray` and explicit
//!   gradients; no GPU framework types leak through the public API.
//!
//! ## Module map
//!
//! - `invertible`: the coupling stack (main primitive), built from
//!   `coupling`, `actnorm`, `permute`, and `dense`
//! - `amortizer`: posterior/likelihood amortizers (loss, sampling, `log_prob`)
//! - `trainer`: online / offline / round-based training regimes
//! - `configure`: simulation batches, configurators, string dispatch
//! - `dataset`: pre-simulated datasets for offline and round-based training
//! - `optim`: Adam / SGD on flat parameter vectors, gradient clipping
//! - `checkpoint`: per-epoch parameter snapshot seam
//! - `diagnostics`: latent-space evaluation helpers

pub mod actnorm;
pub mod amortizer;
pub mod checkpoint;
pub mod configure;
pub mod coupling;
pub mod dataset;
pub mod dense;
pub mod diagnostics;
pub mod invertible;
pub mod optim;
pub mod permute;
pub mod trainer;

/// amortflow error variants.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("shape mismatch: {0}")]
    Shape(&'static str),
    #[error("domain error: {0}")]
    Domain(&'static str),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("simulation error: {0}")]
    Simulation(&'static str),
}

pub type Result<T> = std::result::Result<T, Error>;
