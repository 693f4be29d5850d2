use nalgebra::{DMatrix, SymmetricEigen};

use crate::error::{LmmError, Result};

/// Gauss–Hermite rule for the standard normal density: Σ w_i f(z_i)
/// approximates E[f(Z)], Z ~ N(0, 1).
#[derive(Debug, Clone, PartialEq)]
pub struct GaussHermite {
    pub nodes: Vec<f64>,
    pub weights: Vec<f64>,
}

impl GaussHermite {
    /// `k`-point rule by Golub–Welsch on the probabilists' Hermite Jacobi
    /// matrix. `k` must be odd so that zero is a node.
    pub fn normal(k: usize) -> Result<Self> {
        if k == 0 || k % 2 == 0 {
            return Err(LmmError::ModelSpec(format!(
                "number of quadrature points must be odd and positive, got {}",
                k
            )));
        }
        if k == 1 {
            return Ok(Self {
                nodes: vec![0.0],
                weights: vec![1.0],
            });
        }

        let mut jacobi = DMatrix::<f64>::zeros(k, k);
        for i in 1..k {
            let b = (i as f64).sqrt();
            jacobi[(i, i - 1)] = b;
            jacobi[(i - 1, i)] = b;
        }
        let eig = SymmetricEigen::new(jacobi);

        let mut pairs: Vec<(f64, f64)> = (0..k)
            .map(|i| (eig.eigenvalues[i], eig.eigenvectors[(0, i)].powi(2)))
            .collect();
        pairs.sort_by(|a, b| a.0.total_cmp(&b.0));

        // the rule is symmetric; average mirrored pairs to remove round-off
        let mut nodes = vec![0.0; k];
        let mut weights = vec![0.0; k];
        for i in 0..k / 2 {
            let j = k - 1 - i;
            let z = 0.5 * (pairs[j].0 - pairs[i].0);
            let w = 0.5 * (pairs[i].1 + pairs[j].1);
            nodes[i] = -z;
            nodes[j] = z;
            weights[i] = w;
            weights[j] = w;
        }
        weights[k / 2] = pairs[k / 2].1;

        let total: f64 = weights.iter().sum();
        for w in &mut weights {
            *w /= total;
        }
        Ok(Self { nodes, weights })
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_three_point_rule() {
        let gh = GaussHermite::normal(3).unwrap();
        let r3 = 3f64.sqrt();
        assert_relative_eq!(gh.nodes[0], -r3, epsilon = 1e-12);
        assert_eq!(gh.nodes[1], 0.0);
        assert_relative_eq!(gh.nodes[2], r3, epsilon = 1e-12);
        assert_relative_eq!(gh.weights[0], 1.0 / 6.0, epsilon = 1e-12);
        assert_relative_eq!(gh.weights[1], 2.0 / 3.0, epsilon = 1e-12);
    }

    #[test]
    fn test_normal_moments_are_exact() {
        // a k-point rule integrates polynomials up to degree 2k - 1
        let gh = GaussHermite::normal(9).unwrap();
        let moment = |p: i32| -> f64 {
            gh.nodes
                .iter()
                .zip(&gh.weights)
                .map(|(z, w)| w * z.powi(p))
                .sum()
        };
        assert_relative_eq!(moment(0), 1.0, epsilon = 1e-12);
        assert_relative_eq!(moment(1), 0.0, epsilon = 1e-12);
        assert_relative_eq!(moment(2), 1.0, epsilon = 1e-10);
        assert_relative_eq!(moment(4), 3.0, epsilon = 1e-10);
        assert_relative_eq!(moment(6), 15.0, epsilon = 1e-9);
        assert_relative_eq!(moment(8), 105.0, epsilon = 1e-8);
    }

    #[test]
    fn test_rule_is_symmetric() {
        let gh = GaussHermite::normal(11).unwrap();
        for i in 0..gh.len() {
            let j = gh.len() - 1 - i;
            assert_eq!(gh.nodes[i], -gh.nodes[j]);
            assert_eq!(gh.weights[i], gh.weights[j]);
        }
    }

    #[test]
    fn test_even_count_rejected() {
        assert!(GaussHermite::normal(4).is_err());
        assert!(GaussHermite::normal(0).is_err());
        assert_eq!(GaussHermite::normal(1).unwrap().nodes, vec![0.0]);
    }
}
