//! The invertible coupling stack.
//!
//! A chain of blocks, each `[act-norm] -> [permutation] -> affine coupling`,
//! all sharing one declared input width and one declared condition width. The
//! total log-det-Jacobian is the sum over sub-layers, so the per-sample ldj
//! gradient passes through every block unchanged.
//!
//! `forward`/`inverse` are pure. `forward_train` additionally performs lazy
//! act-norm initialization (first batch statistics) and returns the caches
//! that `backward` consumes.

use crate::actnorm::{ActNorm, ActNormGrads};
use crate::coupling::{AffineCoupling, CouplingCache, CouplingGrads};
use crate::permute::FixedPermutation;
use crate::{Error, Result};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

/// Architecture of an [`InvertibleNetwork`].
#[derive(Debug, Clone)]
pub struct InvertibleNetworkConfig {
    /// Width of the transformed vector (posterior: parameter dimension).
    pub n_params: usize,
    /// Width of the condition vector; `None` builds an unconditional network.
    pub condition_dim: Option<usize>,
    /// Number of coupling blocks.
    pub n_coupling_layers: usize,
    /// Hidden width of the scale/translation sub-networks.
    pub hidden_units: usize,
    /// Hidden depth of the scale/translation sub-networks.
    pub n_hidden: usize,
    /// Soft-clamp bound for scale exponents.
    pub clamp_alpha: f32,
    /// Insert a fixed seeded permutation in front of each coupling.
    pub use_permutation: bool,
    /// Insert an act-norm layer in front of each block.
    pub use_act_norm: bool,
    /// Seed for weight init and permutation draws.
    pub seed: u64,
}

impl Default for InvertibleNetworkConfig {
    fn default() -> Self {
        Self {
            n_params: 2,
            condition_dim: None,
            n_coupling_layers: 4,
            hidden_units: 64,
            n_hidden: 2,
            clamp_alpha: 1.9,
            use_permutation: true,
            use_act_norm: true,
            seed: 42,
        }
    }
}

/// One `[act-norm] -> [permutation] -> coupling` block.
#[derive(Debug, Clone)]
pub struct CouplingBlock {
    pub act_norm: Option<ActNorm>,
    pub permutation: Option<FixedPermutation>,
    pub coupling: AffineCoupling,
}

/// Per-block forward-pass caches for one training batch.
#[derive(Debug)]
pub struct BlockCache {
    /// The block's input (act-norm backward needs it).
    input: Array2<f32>,
    coupling: CouplingCache,
}

/// Per-block parameter gradients.
#[derive(Debug)]
pub struct BlockGrads {
    pub act_norm: Option<ActNormGrads>,
    pub coupling: CouplingGrads,
}

/// Gradients for the whole stack, in `parameters()` order.
#[derive(Debug)]
pub struct NetGrads {
    pub blocks: Vec<BlockGrads>,
}

impl NetGrads {
    /// Flatten in the same order as [`InvertibleNetwork::parameters`].
    pub fn to_flat(&self) -> Vec<f32> {
        let mut out = Vec::new();
        for b in &self.blocks {
            if let Some(an) = &b.act_norm {
                an.write_flat(&mut out);
            }
            b.coupling.write_flat(&mut out);
        }
        out
    }
}

/// A stack of conditional coupling blocks with exact inverse and tractable
/// log-det-Jacobian.
#[derive(Debug, Clone)]
pub struct InvertibleNetwork {
    n_params: usize,
    condition_dim: Option<usize>,
    blocks: Vec<CouplingBlock>,
}

impl InvertibleNetwork {
    pub fn new(config: &InvertibleNetworkConfig) -> Result<Self> {
        if config.n_coupling_layers == 0 {
            return Err(Error::Domain("n_coupling_layers must be >= 1"));
        }
        let mut rng = ChaCha8Rng::seed_from_u64(config.seed);
        let mut blocks = Vec::with_capacity(config.n_coupling_layers);
        for _ in 0..config.n_coupling_layers {
            let act_norm = config.use_act_norm.then(|| ActNorm::new(config.n_params));
            let permutation = config
                .use_permutation
                .then(|| FixedPermutation::new(config.n_params, &mut rng));
            let coupling = AffineCoupling::new(
                config.n_params,
                config.condition_dim,
                config.hidden_units,
                config.n_hidden,
                config.clamp_alpha,
                &mut rng,
            )?;
            blocks.push(CouplingBlock {
                act_norm,
                permutation,
                coupling,
            });
        }
        Ok(Self {
            n_params: config.n_params,
            condition_dim: config.condition_dim,
            blocks,
        })
    }

    pub fn n_params(&self) -> usize {
        self.n_params
    }

    pub fn condition_dim(&self) -> Option<usize> {
        self.condition_dim
    }

    pub fn blocks(&self) -> &[CouplingBlock] {
        &self.blocks
    }

    /// Network-level fail-fast validation; runs before any layer touches the
    /// data (sub-layers would otherwise panic on broadcast mismatches).
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
                "network is unconditional but a condition was provided",
            )),
            (None, Some(_)) => Err(Error::Domain(
                "network expects a condition but none was provided",
            )),
        }
    }

    /// Batched forward transform: `(z, log_det_jacobian)`.
    pub fn forward(
        &self,
        x: &ArrayView2<f32>,
        condition: Option<&ArrayView2<f32>>,
    ) -> Result<(Array2<f32>, Array1<f32>)> {
        self.validate(x, condition)?;
        let mut h = x.to_owned();
        let mut total_ldj = Array1::<f32>::zeros(x.nrows());
        for block in &self.blocks {
            if let Some(an) = &block.act_norm {
                let (h2, ldj) = an.forward(&h.view());
                h = h2;
                total_ldj += &ldj;
            }
            if let Some(p) = &block.permutation {
                h = p.forward(&h.view());
            }
            let (h2, ldj) = block.coupling.forward(&h.view(), condition)?;
            h = h2;
            total_ldj += &ldj;
        }
        Ok((h, total_ldj))
    }

    /// Batched inverse transform.
    pub fn inverse(
        &self,
        z: &ArrayView2<f32>,
        condition: Option<&ArrayView2<f32>>,
    ) -> Result<Array2<f32>> {
        self.validate(z, condition)?;
        let mut h = z.to_owned();
        for block in self.blocks.iter().rev() {
            h = block.coupling.inverse(&h.view(), condition)?;
            if let Some(p) = &block.permutation {
                h = p.inverse(&h.view());
            }
            if let Some(an) = &block.act_norm {
                h = an.inverse(&h.view());
            }
        }
        Ok(h)
    }

    /// Training forward pass: lazily initializes act-norm layers from their
    /// first batch and records the caches [`Self::backward`] needs.
    pub fn forward_train(
        &mut self,
        x: &ArrayView2<f32>,
        condition: Option<&ArrayView2<f32>>,
    ) -> Result<(Array2<f32>, Array1<f32>, Vec<BlockCache>)> {
        self.validate(x, condition)?;
        let mut h = x.to_owned();
        let mut total_ldj = Array1::<f32>::zeros(x.nrows());
        let mut caches = Vec::with_capacity(self.blocks.len());
        for block in self.blocks.iter_mut() {
            let input = h.clone();
            if let Some(an) = block.act_norm.as_mut() {
                an.initialize(&h.view());
                let (h2, ldj) = an.forward(&h.view());
                h = h2;
                total_ldj += &ldj;
            }
            if let Some(p) = &block.permutation {
                h = p.forward(&h.view());
            }
            let (h2, ldj, coupling_cache) = block.coupling.forward_train(&h.view(), condition)?;
            h = h2;
            total_ldj += &ldj;
            caches.push(BlockCache {
                input,
                coupling: coupling_cache,
            });
        }
        Ok((h, total_ldj, caches))
    }

    /// Backpropagate `(dz, dldj)` through the stack; returns the gradient with
    /// respect to the stack input and fills `grads`.
    pub fn backward(
        &self,
        caches: &[BlockCache],
        dz: &ArrayView2<f32>,
        dldj: &ArrayView1<f32>,
        grads: &mut NetGrads,
    ) -> Array2<f32> {
        debug_assert_eq!(caches.len(), self.blocks.len());
        let mut dh = dz.to_owned();
        for ((block, cache), bgrads) in self
            .blocks
            .iter()
            .zip(caches.iter())
            .zip(grads.blocks.iter_mut())
            .rev()
        {
            dh = block
                .coupling
                .backward(&cache.coupling, &dh.view(), dldj, &mut bgrads.coupling);
            if let Some(p) = &block.permutation {
                dh = p.backward(&dh.view());
            }
            if let Some(an) = &block.act_norm {
                // Safe: act_norm and its grads are built together.
                if let Some(angrads) = bgrads.act_norm.as_mut() {
                    dh = an.backward(&cache.input.view(), &dh.view(), dldj, angrads);
                }
            }
        }
        dh
    }

    pub fn zero_grads(&self) -> NetGrads {
        NetGrads {
            blocks: self
                .blocks
                .iter()
                .map(|b| BlockGrads {
                    act_norm: b.act_norm.as_ref().map(|an| an.zero_grads()),
                    coupling: b.coupling.zero_grads(),
                })
                .collect(),
        }
    }

    pub fn param_count(&self) -> usize {
        self.blocks
            .iter()
            .map(|b| {
                b.act_norm.as_ref().map_or(0, |an| an.param_count()) + b.coupling.param_count()
            })
            .sum()
    }

    /// All trainable parameters as one flat vector (per block: act-norm, then
    /// coupling sub-networks).
    pub fn parameters(&self) -> Vec<f32> {
        let mut out = Vec::with_capacity(self.param_count());
        for b in &self.blocks {
            if let Some(an) = &b.act_norm {
                an.write_params(&mut out);
            }
            b.coupling.write_params(&mut out);
        }
        out
    }

    /// Restore parameters from [`Self::parameters`] order.
    pub fn set_parameters(&mut self, params: &[f32]) -> Result<()> {
        if params.len() != self.param_count() {
            return Err(Error::Shape("parameter vector length mismatch"));
        }
        let mut pos = 0usize;
        for b in self.blocks.iter_mut() {
            if let Some(an) = b.act_norm.as_mut() {
                an.read_params(params, &mut pos);
            }
            b.coupling.read_params(params, &mut pos);
        }
        Ok(())
    }
}
