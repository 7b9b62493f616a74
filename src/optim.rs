//! Optimizers over flat parameter vectors, plus gradient clipping.
//!
//! Amortizers expose their trainable state as one flat `Vec<f32>` (see
//! `invertible::InvertibleNetwork::parameters`), so optimizers here work on
//! plain slices and keep their own moment state sized to the first step.

use crate::{Error, Result};

/// Gradient clipping applied by the trainer before the optimizer step.
///
/// With flat parameter vectors there is a single gradient "tensor", so
/// `Norm` and `GlobalNorm` coincide; both are kept so call sites can state
/// their intent.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum GradientClip {
    /// No clipping.
    None,
    /// Rescale the whole gradient vector if its L2 norm exceeds the bound.
    GlobalNorm(f32),
    /// Rescale the gradient vector if its L2 norm exceeds the bound.
    Norm(f32),
    /// Clamp each component into `[-bound, bound]`.
    Value(f32),
}

impl GradientClip {
    pub fn validate(&self) -> Result<()> {
        let bound = match self {
            GradientClip::None => return Ok(()),
            GradientClip::GlobalNorm(b) | GradientClip::Norm(b) | GradientClip::Value(b) => *b,
        };
        if !(bound > 0.0) || !bound.is_finite() {
            return Err(Error::Domain("clip bound must be positive and finite"));
        }
        Ok(())
    }

    /// Clip `grads` in place.
    pub fn apply(&self, grads: &mut [f32]) {
        match *self {
            GradientClip::None => {}
            GradientClip::GlobalNorm(bound) | GradientClip::Norm(bound) => {
                let norm_sq: f64 = grads.iter().map(|&g| (g as f64) * (g as f64)).sum();
                let norm = norm_sq.sqrt() as f32;
                if norm > bound {
                    let scale = bound / norm;
                    for g in grads.iter_mut() {
                        *g *= scale;
                    }
                }
            }
            GradientClip::Value(bound) => {
                for g in grads.iter_mut() {
                    *g = g.clamp(-bound, bound);
                }
            }
        }
    }
}

/// Interface the trainer drives: one in-place parameter update per batch.
pub trait Optimizer {
    fn step(&mut self, params: &mut [f32], grads: &[f32]) -> Result<()>;
}

/// Plain SGD baseline.
#[derive(Debug, Clone)]
pub struct Sgd {
    lr: f32,
}

impl Sgd {
    pub fn new(lr: f32) -> Result<Self> {
        if !(lr > 0.0) || !lr.is_finite() {
            return Err(Error::Domain("lr must be positive and finite"));
        }
        Ok(Self { lr })
    }
}

impl Optimizer for Sgd {
    fn step(&mut self, params: &mut [f32], grads: &[f32]) -> Result<()> {
        if params.len() != grads.len() {
            return Err(Error::Shape("params and grads must have the same length"));
        }
        for (p, &g) in params.iter_mut().zip(grads.iter()) {
            *p -= self.lr * g;
        }
        Ok(())
    }
}

/// Adam with bias correction:
///
/// m = β1·m + (1−β1)·g
/// v = β2·v + (1−β2)·g²
/// θ = θ − lr · m̂ / (√v̂ + ε)
#[derive(Debug, Clone)]
pub struct Adam {
    lr: f32,
    beta1: f32,
    beta2: f32,
    eps: f32,
    t: u64,
    m: Vec<f32>,
    v: Vec<f32>,
}

impl Adam {
    /// Adam with the standard defaults (β1=0.9, β2=0.999, ε=1e-8).
    pub fn new(lr: f32) -> Result<Self> {
        Self::with_betas(lr, 0.9, 0.999, 1e-8)
    }

    pub fn with_betas(lr: f32, beta1: f32, beta2: f32, eps: f32) -> Result<Self> {
        if !(lr > 0.0) || !lr.is_finite() {
            return Err(Error::Domain("lr must be positive and finite"));
        }
        if !(0.0..1.0).contains(&beta1) || !(0.0..1.0).contains(&beta2) {
            return Err(Error::Domain("betas must lie in [0, 1)"));
        }
        if !(eps > 0.0) || !eps.is_finite() {
            return Err(Error::Domain("eps must be positive and finite"));
        }
        Ok(Self {
            lr,
            beta1,
            beta2,
            eps,
            t: 0,
            m: Vec::new(),
            v: Vec::new(),
        })
    }
}

impl Optimizer for Adam {
    fn step(&mut self, params: &mut [f32], grads: &[f32]) -> Result<()> {
        if params.len() != grads.len() {
            return Err(Error::Shape("params and grads must have the same length"));
        }
        if self.m.is_empty() {
            self.m = vec![0.0; params.len()];
            self.v = vec![0.0; params.len()];
        }
        if self.m.len() != params.len() {
            return Err(Error::Shape("optimizer state does not match parameter count"));
        }

        self.t += 1;
        let bc1 = 1.0 - self.beta1.powi(self.t as i32);
        let bc2 = 1.0 - self.beta2.powi(self.t as i32);

        for k in 0..params.len() {
            let g = grads[k];
            self.m[k] = self.beta1 * self.m[k] + (1.0 - self.beta1) * g;
            self.v[k] = self.beta2 * self.v[k] + (1.0 - self.beta2) * g * g;
            let m_hat = self.m[k] / bc1;
            let v_hat = self.v[k] / bc2;
            params[k] -= self.lr * m_hat / (v_hat.sqrt() + self.eps);
        }
        Ok(())
    }
}
