//! Dense sub-networks for coupling layers.
//!
//! These are deliberately plain fully-connected stacks: ELU hidden layers, a
//! linear output layer, Glorot-uniform initialization from an explicit seed.
//! Gradients are computed by hand against a cached forward pass; nothing here
//! depends on an autodiff framework.
//!
//! Shape convention throughout: rows are samples, columns are features.

use ndarray::{Array1, Array2, ArrayView2, Axis};
use rand::Rng;
use rand_chacha::ChaCha8Rng;

#[inline]
fn elu(p: f32) -> f32 {
    if p > 0.0 {
        p
    } else {
        p.exp() - 1.0
    }
}

#[inline]
fn elu_prime(p: f32) -> f32 {
    if p > 0.0 {
        1.0
    } else {
        p.exp()
    }
}

/// A fully-connected stack: `n_hidden` ELU layers of width `hidden_units`,
/// then a linear layer to `out_dim`.
///
/// Weight matrices are stored `(out, in)`; the forward pass computes
/// `h W^T + b` row-wise over the batch.
#[derive(Debug, Clone)]
pub struct DenseStack {
    weights: Vec<Array2<f32>>,
    biases: Vec<Array1<f32>>,
}

/// Cached activations from [`DenseStack::forward_cached`], consumed by
/// [`DenseStack::backward`].
#[derive(Debug, Clone)]
pub struct DenseCache {
    input: Array2<f32>,
    /// Pre-activation of each hidden layer.
    pre: Vec<Array2<f32>>,
    /// Post-ELU output of each hidden layer.
    post: Vec<Array2<f32>>,
}

/// Parameter gradients mirroring a [`DenseStack`]'s layout.
#[derive(Debug, Clone)]
pub struct DenseGrads {
    pub dw: Vec<Array2<f32>>,
    pub db: Vec<Array1<f32>>,
}

impl DenseStack {
    /// Build a stack with Glorot-uniform weights and zero biases.
    ///
    /// `n_hidden == 0` yields a single linear layer `in_dim -> out_dim`.
    pub fn new(
        in_dim: usize,
        hidden_units: usize,
        out_dim: usize,
        n_hidden: usize,
        rng: &mut ChaCha8Rng,
    ) -> Self {
        let mut dims: Vec<(usize, usize)> = Vec::with_capacity(n_hidden + 1);
        let mut prev = in_dim;
        for _ in 0..n_hidden {
            dims.push((hidden_units, prev));
            prev = hidden_units;
        }
        dims.push((out_dim, prev));

        let mut weights = Vec::with_capacity(dims.len());
        let mut biases = Vec::with_capacity(dims.len());
        for &(fan_out, fan_in) in &dims {
            let limit = (6.0f32 / ((fan_in + fan_out) as f32)).sqrt();
            let w = Array2::from_shape_fn((fan_out, fan_in), |_| {
                (rng.random::<f32>() * 2.0 - 1.0) * limit
            });
            weights.push(w);
            biases.push(Array1::zeros(fan_out));
        }
        Self { weights, biases }
    }

    pub fn in_dim(&self) -> usize {
        self.weights[0].ncols()
    }

    pub fn out_dim(&self) -> usize {
        self.weights[self.weights.len() - 1].nrows()
    }

    fn n_hidden(&self) -> usize {
        self.weights.len() - 1
    }

    /// Batched forward pass without caching (inference / inverse path).
    pub fn forward(&self, x: &ArrayView2<f32>) -> Array2<f32> {
        debug_assert_eq!(x.ncols(), self.in_dim());
        let mut h = x.to_owned();
        for i in 0..self.n_hidden() {
            let mut pre = h.dot(&self.weights[i].t());
            pre += &self.biases[i];
            pre.mapv_inplace(elu);
            h = pre;
        }
        let last = self.n_hidden();
        let mut out = h.dot(&self.weights[last].t());
        out += &self.biases[last];
        out
    }

    /// Batched forward pass that records everything [`Self::backward`] needs.
    pub fn forward_cached(&self, x: &ArrayView2<f32>) -> (Array2<f32>, DenseCache) {
        debug_assert_eq!(x.ncols(), self.in_dim());
        let n_hidden = self.n_hidden();
        let mut pre_acts = Vec::with_capacity(n_hidden);
        let mut post_acts = Vec::with_capacity(n_hidden);

        let mut h = x.to_owned();
        for i in 0..n_hidden {
            let mut pre = h.dot(&self.weights[i].t());
            pre += &self.biases[i];
            let post = pre.mapv(elu);
            pre_acts.push(pre);
            h = post.clone();
            post_acts.push(post);
        }
        let mut out = h.dot(&self.weights[n_hidden].t());
        out += &self.biases[n_hidden];

        let cache = DenseCache {
            input: x.to_owned(),
            pre: pre_acts,
            post: post_acts,
        };
        (out, cache)
    }

    /// Backpropagate `grad_out` (batch x out_dim) through the stack.
    ///
    /// Accumulates parameter gradients into `grads` and returns the gradient
    /// with respect to the stack's input (batch x in_dim).
    pub fn backward(
        &self,
        cache: &DenseCache,
        grad_out: &ArrayView2<f32>,
        grads: &mut DenseGrads,
    ) -> Array2<f32> {
        debug_assert_eq!(grad_out.ncols(), self.out_dim());
        debug_assert_eq!(grad_out.nrows(), cache.input.nrows());

        let n_hidden = self.n_hidden();
        let last_in = if n_hidden == 0 {
            &cache.input
        } else {
            &cache.post[n_hidden - 1]
        };

        grads.db[n_hidden] += &grad_out.sum_axis(Axis(0));
        grads.dw[n_hidden] += &grad_out.t().dot(last_in);
        let mut dh = grad_out.dot(&self.weights[n_hidden]);

        for i in (0..n_hidden).rev() {
            let mut dpre = dh;
            dpre.zip_mut_with(&cache.pre[i], |g, &p| *g *= elu_prime(p));
            let layer_in = if i == 0 { &cache.input } else { &cache.post[i - 1] };
            grads.db[i] += &dpre.sum_axis(Axis(0));
            grads.dw[i] += &dpre.t().dot(layer_in);
            dh = dpre.dot(&self.weights[i]);
        }
        dh
    }

    /// Zero-filled gradient container matching this stack's layout.
    pub fn zero_grads(&self) -> DenseGrads {
        DenseGrads {
            dw: self.weights.iter().map(|w| Array2::zeros(w.dim())).collect(),
            db: self.biases.iter().map(|b| Array1::zeros(b.len())).collect(),
        }
    }

    pub fn param_count(&self) -> usize {
        self.weights.iter().map(|w| w.len()).sum::<usize>()
            + self.biases.iter().map(|b| b.len()).sum::<usize>()
    }

    /// Append this stack's parameters (weights row-major, then bias, per
    /// layer) to a flat vector.
    pub fn write_params(&self, out: &mut Vec<f32>) {
        for (w, b) in self.weights.iter().zip(self.biases.iter()) {
            out.extend(w.iter());
            out.extend(b.iter());
        }
    }

    /// Read parameters back in [`Self::write_params`] order, advancing `pos`.
    pub fn read_params(&mut self, params: &[f32], pos: &mut usize) {
        for (w, b) in self.weights.iter_mut().zip(self.biases.iter_mut()) {
            for v in w.iter_mut() {
                *v = params[*pos];
                *pos += 1;
            }
            for v in b.iter_mut() {
                *v = params[*pos];
                *pos += 1;
            }
        }
    }
}

impl DenseGrads {
    /// Append gradients in the same order as [`DenseStack::write_params`].
    pub fn write_flat(&self, out: &mut Vec<f32>) {
        for (dw, db) in self.dw.iter().zip(self.db.iter()) {
            out.extend(dw.iter());
            out.extend(db.iter());
        }
    }
}
