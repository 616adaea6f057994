//! Substitution model handed to every engine instance.
//!
//! The engine never sees a rate matrix, only its eigendecomposition
//! `Q = V · diag(λ) · V⁻¹`, from which it builds `P(t) = V · diag(exp(λt)) · V⁻¹`
//! for every edge. Matrices are row-major, 4×4.
//!
//! The model is built once per run and shared read-only by all workers.

use crate::encoding::STATE_COUNT;

/// Eigenvectors, inverse eigenvectors and eigenvalues of a rate matrix.
#[derive(Debug, Clone, PartialEq)]
pub struct EigenDecomposition {
    pub eigenvectors: [f64; STATE_COUNT * STATE_COUNT],
    pub inverse_eigenvectors: [f64; STATE_COUNT * STATE_COUNT],
    pub eigenvalues: [f64; STATE_COUNT],
}

/// A nucleotide substitution model with a single rate category.
#[derive(Debug, Clone, PartialEq)]
pub struct SubstitutionModel {
    eigen: EigenDecomposition,
    frequencies: [f64; STATE_COUNT],
    category_weight: f64,
    category_rate: f64,
}

impl SubstitutionModel {
    pub fn new(eigen: EigenDecomposition, frequencies: [f64; STATE_COUNT]) -> Self {
        Self {
            eigen,
            frequencies,
            category_weight: 1.0,
            category_rate: 1.0,
        }
    }

    /// Jukes–Cantor, normalised to one expected substitution per unit length.
    pub fn jukes_cantor() -> Self {
        let eigen = EigenDecomposition {
            eigenvectors: [
                1.0, 2.0, 0.0, 0.5, //
                1.0, -2.0, 0.5, 0.0, //
                1.0, 2.0, 0.0, -0.5, //
                1.0, -2.0, -0.5, 0.0,
            ],
            inverse_eigenvectors: [
                0.25, 0.25, 0.25, 0.25, //
                0.125, -0.125, 0.125, -0.125, //
                0.0, 1.0, 0.0, -1.0, //
                1.0, 0.0, -1.0, 0.0,
            ],
            eigenvalues: [0.0, -4.0 / 3.0, -4.0 / 3.0, -4.0 / 3.0],
        };
        Self::new(eigen, [0.25; STATE_COUNT])
    }

    /// Override the single category's rate (defaults to 1).
    pub fn with_category_rate(mut self, rate: f64) -> Self {
        self.category_rate = rate;
        self
    }

    pub fn eigen_decomposition(&self) -> &EigenDecomposition {
        &self.eigen
    }

    pub fn frequencies(&self) -> &[f64; STATE_COUNT] {
        &self.frequencies
    }

    pub fn category_weights(&self) -> [f64; 1] {
        [self.category_weight]
    }

    pub fn category_rates(&self) -> [f64; 1] {
        [self.category_rate]
    }
}

impl Default for SubstitutionModel {
    fn default() -> Self {
        Self::jukes_cantor()
    }
}
