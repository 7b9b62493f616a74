//! Fixed feature permutations.
//!
//! A seeded, non-trainable shuffle of the feature axis, used between coupling
//! layers so every dimension eventually lands in the transformed half. Volume
//! preserving, so the log-det contribution is zero.

use ndarray::{Array2, ArrayView2};
use rand::Rng;
use rand_chacha::ChaCha8Rng;

/// A fixed permutation of `dim` features and its exact inverse.
#[derive(Debug, Clone)]
pub struct FixedPermutation {
    perm: Vec<usize>,
    inv: Vec<usize>,
}

impl FixedPermutation {
    /// Draw a permutation with Fisher–Yates from the given RNG.
    pub fn new(dim: usize, rng: &mut ChaCha8Rng) -> Self {
        let mut perm: Vec<usize> = (0..dim).collect();
        for i in (1..dim).rev() {
            let j = rng.random_range(0..=i);
            perm.swap(i, j);
        }
        let mut inv = vec![0usize; dim];
        for (k, &p) in perm.iter().enumerate() {
            inv[p] = k;
        }
        Self { perm, inv }
    }

    pub fn dim(&self) -> usize {
        self.perm.len()
    }

    /// `z[.., k] = x[.., perm[k]]`.
    pub fn forward(&self, x: &ArrayView2<f32>) -> Array2<f32> {
        let n = x.nrows();
        let d = self.dim();
        let mut z = Array2::<f32>::zeros((n, d));
        for k in 0..d {
            let p = self.perm[k];
            for i in 0..n {
                z[[i, k]] = x[[i, p]];
            }
        }
        z
    }

    /// `x[.., j] = z[.., inv[j]]`.
    pub fn inverse(&self, z: &ArrayView2<f32>) -> Array2<f32> {
        let n = z.nrows();
        let d = self.dim();
        let mut x = Array2::<f32>::zeros((n, d));
        for j in 0..d {
            let q = self.inv[j];
            for i in 0..n {
                x[[i, j]] = z[[i, q]];
            }
        }
        x
    }

    /// The gradient of a gather is the inverse scatter, which for a
    /// permutation is just the inverse permutation of the output gradient.
    pub fn backward(&self, dz: &ArrayView2<f32>) -> Array2<f32> {
        self.inverse(dz)
    }
}
