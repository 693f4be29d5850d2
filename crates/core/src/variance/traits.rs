use std::fmt::Debug;

use crate::types::DenseMatrix;

/// Covariance structure of one random-effects term.
///
/// A structure maps its slice of θ onto the lower-triangular relative
/// covariance factor λ (q × q), so that the random effects of one level have
/// covariance `σ² λ λ'`. θ entries that land on the diagonal of λ are bounded
/// below by zero; every other entry is free.
pub trait CovarianceStructure: Send + Sync + Debug {
    /// Human-readable name: "Unstructured", "Diagonal".
    fn name(&self) -> &str;

    /// Dimension q of the random effect per level.
    fn dim(&self) -> usize;

    /// Number of θ entries consumed by this term.
    fn n_theta(&self) -> usize;

    /// Build λ from this term's θ slice.
    ///
    /// # Panics
    /// When `theta.len() != self.n_theta()`; callers validate θ first.
    fn lambda(&self, theta: &[f64]) -> DenseMatrix;

    /// Positions within this term's θ slice that sit on the diagonal of λ.
    fn diagonal_positions(&self) -> Vec<usize>;

    /// Names of the θ entries given the random-effect column names.
    fn theta_names(&self, cnames: &[String]) -> Vec<String>;

    /// Clone into a boxed trait object.
    fn clone_boxed(&self) -> Box<dyn CovarianceStructure>;

    /// Lower bounds: 0 on diagonal positions, -inf elsewhere.
    fn lower_bounds(&self) -> Vec<f64> {
        let mut lb = vec![f64::NEG_INFINITY; self.n_theta()];
        for pos in self.diagonal_positions() {
            lb[pos] = 0.0;
        }
        lb
    }

    /// Starting value: λ = I.
    fn initial_theta(&self) -> Vec<f64> {
        let mut theta = vec![0.0; self.n_theta()];
        for pos in self.diagonal_positions() {
            theta[pos] = 1.0;
        }
        theta
    }
}

impl Clone for Box<dyn CovarianceStructure> {
    fn clone(&self) -> Box<dyn CovarianceStructure> {
        self.clone_boxed()
    }
}
