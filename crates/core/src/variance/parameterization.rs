use serde::{Deserialize, Serialize};

use crate::error::{LmmError, Result};
use crate::types::DenseMatrix;

use super::traits::CovarianceStructure;

/// θ values at or below `lower + SINGULAR_TOL` count as a zero pivot.
pub const SINGULAR_TOL: f64 = 1e-6;

/// Maps the concatenated θ vector onto one λ factor per random-effects term.
///
/// Terms appear in elimination order; term `k` owns
/// `theta[offsets[k]..offsets[k + 1]]`.
#[derive(Debug, Clone)]
pub struct Parameterization {
    structures: Vec<Box<dyn CovarianceStructure>>,
    offsets: Vec<usize>,
}

impl Parameterization {
    pub fn new(structures: Vec<Box<dyn CovarianceStructure>>) -> Self {
        let mut offsets = Vec::with_capacity(structures.len() + 1);
        offsets.push(0);
        for s in &structures {
            offsets.push(offsets[offsets.len() - 1] + s.n_theta());
        }
        Self {
            structures,
            offsets,
        }
    }

    pub fn n_terms(&self) -> usize {
        self.structures.len()
    }

    pub fn n_theta(&self) -> usize {
        self.offsets[self.offsets.len() - 1]
    }

    pub fn structure(&self, k: usize) -> &dyn CovarianceStructure {
        self.structures[k].as_ref()
    }

    /// θ slice belonging to term `k`.
    pub fn term_theta<'a>(&self, theta: &'a [f64], k: usize) -> &'a [f64] {
        &theta[self.offsets[k]..self.offsets[k + 1]]
    }

    pub fn lower_bounds(&self) -> Vec<f64> {
        self.structures
            .iter()
            .flat_map(|s| s.lower_bounds())
            .collect()
    }

    pub fn initial(&self) -> Vec<f64> {
        self.structures
            .iter()
            .flat_map(|s| s.initial_theta())
            .collect()
    }

    /// θ names as "group: entry", given each term's group name and
    /// random-effect column names.
    pub fn names(&self, labels: &[(&str, &[String])]) -> Vec<String> {
        self.structures
            .iter()
            .zip(labels)
            .flat_map(|(s, (group, cnames))| {
                s.theta_names(cnames)
                    .into_iter()
                    .map(move |n| format!("{}: {}", group, n))
            })
            .collect()
    }

    /// Check length, finiteness and the box constraints.
    pub fn validate(&self, theta: &[f64]) -> Result<()> {
        if theta.len() != self.n_theta() {
            return Err(LmmError::InvalidParameter(format!(
                "theta has length {}, expected {}",
                theta.len(),
                self.n_theta()
            )));
        }
        for (i, (&t, &lb)) in theta.iter().zip(self.lower_bounds().iter()).enumerate() {
            if !t.is_finite() {
                return Err(LmmError::InvalidParameter(format!(
                    "theta[{}] is not finite ({})",
                    i, t
                )));
            }
            if t < lb {
                return Err(LmmError::InvalidParameter(format!(
                    "theta[{}] = {} is below its lower bound {}",
                    i, t, lb
                )));
            }
        }
        Ok(())
    }

    /// λ factors for every term.
    ///
    /// # Panics
    /// On a θ of the wrong length.
    pub fn factors(&self, theta: &[f64]) -> Vec<DenseMatrix> {
        assert_eq!(
            theta.len(),
            self.n_theta(),
            "theta has length {}, expected {}",
            theta.len(),
            self.n_theta()
        );
        self.structures
            .iter()
            .enumerate()
            .map(|(k, s)| s.lambda(self.term_theta(theta, k)))
            .collect()
    }

    /// Terms whose λ has a zero pivot at `theta` (a boundary fit).
    pub fn singular_terms(&self, theta: &[f64]) -> Vec<usize> {
        (0..self.n_terms())
            .filter(|&k| {
                let t = self.term_theta(theta, k);
                self.structures[k]
                    .diagonal_positions()
                    .iter()
                    .any(|&pos| t[pos] <= SINGULAR_TOL)
            })
            .collect()
    }

    pub fn is_singular(&self, theta: &[f64]) -> bool {
        !self.singular_terms(theta).is_empty()
    }
}

/// Standard deviations and correlations of one term's random effects.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VarianceComponent {
    pub group: String,
    pub names: Vec<String>,
    pub std_devs: Vec<f64>,
    /// Row-major q × q correlation matrix.
    pub correlations: Vec<Vec<f64>>,
}

impl VarianceComponent {
    /// Σ = σ² λ λ' split into standard deviations and correlations.
    pub fn from_lambda(group: &str, names: &[String], lambda: &DenseMatrix, sigma: f64) -> Self {
        let cov = lambda * lambda.transpose() * (sigma * sigma);
        let q = cov.nrows();
        let std_devs: Vec<f64> = (0..q).map(|i| cov[(i, i)].max(0.0).sqrt()).collect();
        let correlations = (0..q)
            .map(|i| {
                (0..q)
                    .map(|j| {
                        if i == j {
                            1.0
                        } else if std_devs[i] > 0.0 && std_devs[j] > 0.0 {
                            cov[(i, j)] / (std_devs[i] * std_devs[j])
                        } else {
                            0.0
                        }
                    })
                    .collect()
            })
            .collect();
        Self {
            group: group.to_string(),
            names: names.to_vec(),
            std_devs,
            correlations,
        }
    }
}
