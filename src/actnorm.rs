//! Activation normalization.
//!
//! A learned per-dimension affine whitening step,
//! `z = (x + bias) ⊙ exp(log_scale)`, with data-dependent initialization from
//! the first training batch (`bias = −mean`, `log_scale = −ln(std + ε)`).
//! Before initialization both parameter vectors are zero, so the layer is the
//! identity; initialization never changes the bijection algebra, only the
//! parameter values, and the inverse is exact in every state.

use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};

const INIT_EPS: f32 = 1e-6;

/// Per-dimension affine whitening with log-det `Σ log_scale`.
#[derive(Debug, Clone)]
pub struct ActNorm {
    dim: usize,
    log_scale: Array1<f32>,
    bias: Array1<f32>,
    initialized: bool,
}

/// Parameter gradients for an [`ActNorm`] layer.
#[derive(Debug, Clone)]
pub struct ActNormGrads {
    pub dlog_scale: Array1<f32>,
    pub dbias: Array1<f32>,
}

impl ActNorm {
    pub fn new(dim: usize) -> Self {
        Self {
            dim,
            log_scale: Array1::zeros(dim),
            bias: Array1::zeros(dim),
            initialized: false,
        }
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Set `bias`/`log_scale` from batch statistics so the first transformed
    /// batch is approximately whitened. No-op when already initialized.
    pub fn initialize(&mut self, x: &ArrayView2<f32>) {
        if self.initialized || x.nrows() == 0 {
            return;
        }
        // mean_axis is only None for an empty axis, which is excluded above.
        if let Some(mean) = x.mean_axis(Axis(0)) {
            let std = x.std_axis(Axis(0), 0.0);
            self.bias = -mean;
            self.log_scale = std.mapv(|s| -(s + INIT_EPS).ln());
            self.initialized = true;
        }
    }

    /// Forward transform: `(z, log_det)` with the same log-det for every
    /// sample (the transform is per-dimension, not data-dependent).
    pub fn forward(&self, x: &ArrayView2<f32>) -> (Array2<f32>, Array1<f32>) {
        let mut z = x.to_owned();
        z += &self.bias;
        for k in 0..self.dim {
            let e = self.log_scale[k].exp();
            for v in z.column_mut(k).iter_mut() {
                *v *= e;
            }
        }
        let ldj = Array1::from_elem(x.nrows(), self.log_scale.sum());
        (z, ldj)
    }

    /// Exact inverse: `x = z ⊙ exp(−log_scale) − bias`.
    pub fn inverse(&self, z: &ArrayView2<f32>) -> Array2<f32> {
        let mut x = z.to_owned();
        for k in 0..self.dim {
            let e = (-self.log_scale[k]).exp();
            for v in x.column_mut(k).iter_mut() {
                *v *= e;
            }
        }
        x -= &self.bias;
        x
    }

    /// Backpropagate `(dz, dldj)`; returns the input gradient.
    pub fn backward(
        &self,
        x: &ArrayView2<f32>,
        dz: &ArrayView2<f32>,
        dldj: &ArrayView1<f32>,
        grads: &mut ActNormGrads,
    ) -> Array2<f32> {
        let n = x.nrows();
        let mut dx = Array2::<f32>::zeros((n, self.dim));
        let dldj_total: f32 = dldj.iter().sum();
        for k in 0..self.dim {
            let e = self.log_scale[k].exp();
            let mut dls = 0.0f32;
            let mut db = 0.0f32;
            for i in 0..n {
                let g = dz[[i, k]] * e;
                dx[[i, k]] = g;
                dls += g * (x[[i, k]] + self.bias[k]);
                db += g;
            }
            grads.dlog_scale[k] += dls + dldj_total;
            grads.dbias[k] += db;
        }
        dx
    }

    pub fn zero_grads(&self) -> ActNormGrads {
        ActNormGrads {
            dlog_scale: Array1::zeros(self.dim),
            dbias: Array1::zeros(self.dim),
        }
    }

    pub fn param_count(&self) -> usize {
        2 * self.dim
    }

    pub fn write_params(&self, out: &mut Vec<f32>) {
        out.extend(self.log_scale.iter());
        out.extend(self.bias.iter());
    }

    pub fn read_params(&mut self, params: &[f32], pos: &mut usize) {
        for v in self.log_scale.iter_mut() {
            *v = params[*pos];
            *pos += 1;
        }
        for v in self.bias.iter_mut() {
            *v = params[*pos];
            *pos += 1;
        }
    }
}

impl ActNormGrads {
    pub fn write_flat(&self, out: &mut Vec<f32>) {
        out.extend(self.dlog_scale.iter());
        out.extend(self.dbias.iter());
    }
}
