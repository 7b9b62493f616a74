//! Conditional affine coupling layer.
//!
//! The layer splits its input into two halves along the feature axis, keeps
//! the first half untouched, and transforms the second half with a scale and
//! translation predicted from the first half (plus an optional condition
//! vector). Both directions recompute the scale/translation from the untouched
//! half, which is what makes the transform exactly invertible with a
//! triangular Jacobian:
//!
//! forward:  `z2 = x2 ⊙ exp(s(x1, c)) + t(x1, c)`, `z1 = x1`
//! inverse:  `x2 = (z2 − t(z1, c)) ⊙ exp(−s(z1, c))`, `x1 = z1`
//! log-det:  `Σ_k s_k` per sample.
//!
//! Scale predictions are soft-clamped with `s = α·tanh(s_raw/α)` before
//! exponentiation so `exp(s)` stays inside `[exp(−α), exp(α)]`.

use crate::dense::{DenseCache, DenseGrads, DenseStack};
use crate::{Error, Result};
use ndarray::{s, Array1, Array2, ArrayView1, ArrayView2, Axis};
use rand_chacha::ChaCha8Rng;

/// Concatenate blocks along the feature axis.
fn hstack(blocks: &[ArrayView2<f32>]) -> Array2<f32> {
    let n = blocks[0].nrows();
    let width: usize = blocks.iter().map(|b| b.ncols()).sum();
    let mut out = Array2::<f32>::zeros((n, width));
    let mut offset = 0usize;
    for b in blocks {
        out.slice_mut(s![.., offset..offset + b.ncols()]).assign(b);
        offset += b.ncols();
    }
    out
}

/// An affine coupling layer over `n_params` features with an optional,
/// fixed-width condition.
#[derive(Debug, Clone)]
pub struct AffineCoupling {
    n_params: usize,
    /// Width of the untouched half (floor), which feeds the sub-networks.
    d1: usize,
    /// Width of the transformed half (ceil).
    d2: usize,
    condition_dim: Option<usize>,
    clamp_alpha: f32,
    scale_net: DenseStack,
    trans_net: DenseStack,
}

/// Forward-pass state needed by [`AffineCoupling::backward`].
#[derive(Debug, Clone)]
pub struct CouplingCache {
    x2: Array2<f32>,
    /// Soft-clamped scale (not the raw prediction).
    s: Array2<f32>,
    exp_s: Array2<f32>,
    scale_cache: DenseCache,
    trans_cache: DenseCache,
}

/// Parameter gradients for both sub-networks.
#[derive(Debug, Clone)]
pub struct CouplingGrads {
    pub scale: DenseGrads,
    pub trans: DenseGrads,
}

impl AffineCoupling {
    /// Build a coupling layer.
    ///
    /// `n_params` must be at least 2 (a one-dimensional input has nothing to
    /// couple). `clamp_alpha` bounds the scale exponent and must be positive
    /// and finite.
    pub fn new(
        n_params: usize,
        condition_dim: Option<usize>,
        hidden_units: usize,
        n_hidden: usize,
        clamp_alpha: f32,
        rng: &mut ChaCha8Rng,
    ) -> Result<Self> {
        if n_params < 2 {
            return Err(Error::Domain("coupling requires n_params >= 2"));
        }
        if let Some(c) = condition_dim {
            if c == 0 {
                return Err(Error::Domain(
                    "condition_dim must be >= 1; use None for unconditional",
                ));
            }
        }
        if !(clamp_alpha > 0.0) || !clamp_alpha.is_finite() {
            return Err(Error::Domain("clamp_alpha must be positive and finite"));
        }
        if n_hidden > 0 && hidden_units == 0 {
            return Err(Error::Domain("hidden_units must be >= 1 when n_hidden > 0"));
        }

        let d1 = n_params / 2;
        let d2 = n_params - d1;
        let in_dim = d1 + condition_dim.unwrap_or(0);
        let scale_net = DenseStack::new(in_dim, hidden_units, d2, n_hidden, rng);
        let trans_net = DenseStack::new(in_dim, hidden_units, d2, n_hidden, rng);

        Ok(Self {
            n_params,
            d1,
            d2,
            condition_dim,
            clamp_alpha,
            scale_net,
            trans_net,
        })
    }

    pub fn n_params(&self) -> usize {
        self.n_params
    }

    pub fn condition_dim(&self) -> Option<usize> {
        self.condition_dim
    }

    /// Fail fast on any input/condition mismatch.
    fn validate(&self, x: &ArrayView2<f32>, condition: Option<&ArrayView2<f32>>) -> Result<()> {
        if x.ncols() != self.n_params {
            return Err(Error::Shape("input width does not match n_params"));
        }
        match (condition, self.condition_dim) {
            (None, None) => Ok(()),
            (Some(c), Some(dim)) => {
                if c.ncols() != dim {
                    return Err(Error::Shape(
                        "condition width does not match the declared condition_dim",
                    ));
                }
                if c.nrows() != x.nrows() {
                    return Err(Error::Shape("condition batch length does not match input"));
                }
                Ok(())
            }
            (Some(_), None) => Err(Error::Domain(
                "coupling layer is unconditional but a condition was provided",
            )),
            (None, Some(_)) => Err(Error::Domain(
                "coupling layer expects a condition but none was provided",
            )),
        }
    }

    fn net_input(
        &self,
        untouched: &ArrayView2<f32>,
        condition: Option<&ArrayView2<f32>>,
    ) -> Array2<f32> {
        match condition {
            Some(c) => hstack(&[untouched.view(), c.view()]),
            None => untouched.to_owned(),
        }
    }

    #[inline]
    fn soft_clamp(&self, s_raw: f32) -> f32 {
        self.clamp_alpha * (s_raw / self.clamp_alpha).tanh()
    }

    /// Forward transform: `(z, log_det_jacobian)` with one ldj per sample.
    pub fn forward(
        &self,
        x: &ArrayView2<f32>,
        condition: Option<&ArrayView2<f32>>,
    ) -> Result<(Array2<f32>, Array1<f32>)> {
        self.validate(x, condition)?;
        let x1 = x.slice(s![.., ..self.d1]);
        let x2 = x.slice(s![.., self.d1..]);

        let net_in = self.net_input(&x1, condition);
        let s = self.scale_net.forward(&net_in.view()).mapv(|v| self.soft_clamp(v));
        let t = self.trans_net.forward(&net_in.view());

        let mut z2 = x2.to_owned();
        z2.zip_mut_with(&s, |z, &sv| *z *= sv.exp());
        z2 += &t;

        let z = hstack(&[x1.view(), z2.view()]);
        let ldj = s.sum_axis(Axis(1));
        Ok((z, ldj))
    }

    /// Inverse transform. Scale and translation are recomputed from the
    /// untouched half `z1`, never from the transformed output.
    pub fn inverse(
        &self,
        z: &ArrayView2<f32>,
        condition: Option<&ArrayView2<f32>>,
    ) -> Result<Array2<f32>> {
        self.validate(z, condition)?;
        let z1 = z.slice(s![.., ..self.d1]);
        let z2 = z.slice(s![.., self.d1..]);

        let net_in = self.net_input(&z1, condition);
        let s = self.scale_net.forward(&net_in.view()).mapv(|v| self.soft_clamp(v));
        let t = self.trans_net.forward(&net_in.view());

        let mut x2 = z2.to_owned();
        x2 -= &t;
        x2.zip_mut_with(&s, |x, &sv| *x *= (-sv).exp());

        Ok(hstack(&[z1.view(), x2.view()]))
    }

    /// Forward pass with cached state for [`Self::backward`].
    pub fn forward_train(
        &self,
        x: &ArrayView2<f32>,
        condition: Option<&ArrayView2<f32>>,
    ) -> Result<(Array2<f32>, Array1<f32>, CouplingCache)> {
        self.validate(x, condition)?;
        let x1 = x.slice(s![.., ..self.d1]);
        let x2 = x.slice(s![.., self.d1..]).to_owned();

        let net_in = self.net_input(&x1, condition);
        let (s_raw, scale_cache) = self.scale_net.forward_cached(&net_in.view());
        let (t, trans_cache) = self.trans_net.forward_cached(&net_in.view());

        let s = s_raw.mapv(|v| self.soft_clamp(v));
        let exp_s = s.mapv(f32::exp);

        let mut z2 = x2.clone();
        z2.zip_mut_with(&exp_s, |z, &e| *z *= e);
        z2 += &t;

        let z = hstack(&[x1.view(), z2.view()]);
        let ldj = s.sum_axis(Axis(1));
        let cache = CouplingCache {
            x2,
            s,
            exp_s,
            scale_cache,
            trans_cache,
        };
        Ok((z, ldj, cache))
    }

    /// Backpropagate `(dz, dldj)` through the layer.
    ///
    /// Accumulates sub-network parameter gradients into `grads` and returns
    /// the gradient with respect to the layer input. Gradients with respect to
    /// the condition are discarded (conditions are data, not parameters).
    pub fn backward(
        &self,
        cache: &CouplingCache,
        dz: &ArrayView2<f32>,
        dldj: &ArrayView1<f32>,
        grads: &mut CouplingGrads,
    ) -> Array2<f32> {
        let dz1 = dz.slice(s![.., ..self.d1]);
        let dz2 = dz.slice(s![.., self.d1..]);

        // dx2 = dz2 ⊙ exp(s)
        let mut dx2 = dz2.to_owned();
        dx2.zip_mut_with(&cache.exp_s, |g, &e| *g *= e);

        // ds = dz2 ⊙ x2 ⊙ exp(s) + dldj (the ldj contributes to every
        // transformed dimension of its sample).
        let n = dz.nrows();
        let mut ds = Array2::<f32>::zeros((n, self.d2));
        for i in 0..n {
            let g = dldj[i];
            for k in 0..self.d2 {
                ds[[i, k]] = dz2[[i, k]] * cache.x2[[i, k]] * cache.exp_s[[i, k]] + g;
            }
        }

        // Chain through the soft clamp: s = α·tanh(s_raw/α), so
        // ds_raw = ds ⊙ (1 − (s/α)²).
        let alpha = self.clamp_alpha;
        ds.zip_mut_with(&cache.s, |g, &sv| {
            let th = sv / alpha;
            *g *= 1.0 - th * th;
        });

        let din_s = self.scale_net.backward(&cache.scale_cache, &ds.view(), &mut grads.scale);
        let din_t = self.trans_net.backward(&cache.trans_cache, &dz2, &mut grads.trans);

        // Both sub-networks saw [x1 | condition]; only the x1 slice flows back.
        let mut dx1 = dz1.to_owned();
        dx1 += &din_s.slice(s![.., ..self.d1]);
        dx1 += &din_t.slice(s![.., ..self.d1]);

        hstack(&[dx1.view(), dx2.view()])
    }

    pub fn zero_grads(&self) -> CouplingGrads {
        CouplingGrads {
            scale: self.scale_net.zero_grads(),
            trans: self.trans_net.zero_grads(),
        }
    }

    pub fn param_count(&self) -> usize {
        self.scale_net.param_count() + self.trans_net.param_count()
    }

    pub fn write_params(&self, out: &mut Vec<f32>) {
        self.scale_net.write_params(out);
        self.trans_net.write_params(out);
    }

    pub fn read_params(&mut self, params: &[f32], pos: &mut usize) {
        self.scale_net.read_params(params, pos);
        self.trans_net.read_params(params, pos);
    }
}

impl CouplingGrads {
    pub fn write_flat(&self, out: &mut Vec<f32>) {
        self.scale.write_flat(out);
        self.trans.write_flat(out);
    }
}
