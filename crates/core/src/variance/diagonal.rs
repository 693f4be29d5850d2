use crate::types::DenseMatrix;

use super::traits::CovarianceStructure;

/// Uncorrelated random effects: λ is diagonal with one θ entry per
/// random-effect column.
#[derive(Debug, Clone)]
pub struct Diagonal {
    dim: usize,
}

impl Diagonal {
    pub fn new(dim: usize) -> Self {
        assert!(dim > 0, "Diagonal covariance needs dim >= 1");
        Self { dim }
    }
}

impl CovarianceStructure for Diagonal {
    fn name(&self) -> &str {
        "Diagonal"
    }

    fn dim(&self) -> usize {
        self.dim
    }

    fn n_theta(&self) -> usize {
        self.dim
    }

    fn lambda(&self, theta: &[f64]) -> DenseMatrix {
        assert_eq!(
            theta.len(),
            self.dim,
            "Diagonal(dim={}) expects {} parameters, got {}",
            self.dim,
            self.dim,
            theta.len()
        );
        DenseMatrix::from_diagonal(&nalgebra::DVector::from_column_slice(theta))
    }

    fn diagonal_positions(&self) -> Vec<usize> {
        (0..self.dim).collect()
    }

    fn theta_names(&self, cnames: &[String]) -> Vec<String> {
        cnames.to_vec()
    }

    fn clone_boxed(&self) -> Box<dyn CovarianceStructure> {
        Box::new(self.clone())
    }
}
