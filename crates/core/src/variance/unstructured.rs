use crate::types::DenseMatrix;

use super::traits::CovarianceStructure;

/// Full relative covariance factor for a vector-valued random effect.
///
/// θ holds the q(q+1)/2 entries of the lower triangle of λ, column-major:
///
/// ```text
/// theta = [λ00, λ10, ..., λ(q-1)0,   // column 0
///          λ11, ..., λ(q-1)1,        // column 1
///          ...
///          λ(q-1)(q-1)]
/// ```
#[derive(Debug, Clone)]
pub struct Unstructured {
    dim: usize,
}

impl Unstructured {
    pub fn new(dim: usize) -> Self {
        assert!(dim > 0, "Unstructured covariance needs dim >= 1");
        Self { dim }
    }
}

impl CovarianceStructure for Unstructured {
    fn name(&self) -> &str {
        "Unstructured"
    }

    fn dim(&self) -> usize {
        self.dim
    }

    fn n_theta(&self) -> usize {
        self.dim * (self.dim + 1) / 2
    }

    fn lambda(&self, theta: &[f64]) -> DenseMatrix {
        assert_eq!(
            theta.len(),
            self.n_theta(),
            "Unstructured(dim={}) expects {} parameters, got {}",
            self.dim,
            self.n_theta(),
            theta.len()
        );
        let k = self.dim;
        let mut lambda = DenseMatrix::zeros(k, k);
        let mut idx = 0;
        for col in 0..k {
            for row in col..k {
                lambda[(row, col)] = theta[idx];
                idx += 1;
            }
        }
        lambda
    }

    fn diagonal_positions(&self) -> Vec<usize> {
        let mut positions = Vec::with_capacity(self.dim);
        let mut idx = 0;
        for col in 0..self.dim {
            positions.push(idx);
            idx += self.dim - col;
        }
        positions
    }

    fn theta_names(&self, cnames: &[String]) -> Vec<String> {
        let mut names = Vec::with_capacity(self.n_theta());
        for col in 0..self.dim {
            for row in col..self.dim {
                if row == col {
                    names.push(cnames[col].clone());
                } else {
                    names.push(format!("{}, {}", cnames[row], cnames[col]));
                }
            }
        }
        names
    }

    fn clone_boxed(&self) -> Box<dyn CovarianceStructure> {
        Box::new(self.clone())
    }
}
