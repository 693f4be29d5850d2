use nalgebra::{DMatrix, DVector};

use crate::error::{LmmError, Result};

use super::family::Family;
use super::generalized::GeneralizedLinearMixedModel;

/// Step-halvings allowed per PIRLS iteration.
const MAX_HALVINGS: usize = 10;
const GLM_MAX_ITER: usize = 50;
const GLM_TOL: f64 = 1e-10;

/// IRLS working weights and working response (net of the offset) at `eta`.
pub fn working_values(
    family: &Family,
    y: &DVector<f64>,
    eta: &DVector<f64>,
    offset: Option<&DVector<f64>>,
    prior: &DVector<f64>,
    iteration: usize,
) -> Result<(DVector<f64>, DVector<f64>)> {
    let n = y.len();
    let mut w = DVector::zeros(n);
    let mut z = DVector::zeros(n);
    for i in 0..n {
        let mu = family.linkinv(eta[i]);
        let d = family.mu_eta(eta[i]);
        let wi = prior[i] * d * d / family.variance(mu);
        let zi = eta[i] - offset.map_or(0.0, |o| o[i]) + (y[i] - mu) / d;
        if !wi.is_finite() || !(wi > 0.0) || !zi.is_finite() {
            return Err(LmmError::PirlsDivergence {
                iteration,
                reason: format!("working weight {} at observation {}", wi, i),
            });
        }
        w[i] = wi;
        z[i] = zi;
    }
    Ok((w, z))
}

/// Σ devresid over all observations at `eta`.
pub fn total_deviance(
    family: &Family,
    y: &DVector<f64>,
    eta: &DVector<f64>,
    prior: &DVector<f64>,
) -> f64 {
    y.iter()
        .zip(eta.iter())
        .zip(prior.iter())
        .map(|((&yi, &ei), &wi)| family.devresid(yi, family.linkinv(ei), wi))
        .sum()
}

/// Fixed-effects-only GLM fit by IRLS, used as the PIRLS starting β.
pub fn glm_start(
    family: &Family,
    x: &DMatrix<f64>,
    y: &DVector<f64>,
    offset: Option<&DVector<f64>>,
    prior: &DVector<f64>,
) -> Result<DVector<f64>> {
    let mut eta = DVector::from_fn(y.len(), |i, _| family.link(family.init_mu(y[i], prior[i])));
    let mut beta = DVector::zeros(x.ncols());
    let mut dev_old = f64::INFINITY;
    for iteration in 1..=GLM_MAX_ITER {
        let (w, z) = working_values(family, y, &eta, offset, prior, iteration)?;
        let mut xtw = x.transpose();
        for (i, mut col) in xtw.column_iter_mut().enumerate() {
            col *= w[i];
        }
        let chol = (&xtw * x).cholesky().ok_or_else(|| {
            LmmError::ModelSpec("fixed-effects matrix is rank deficient".into())
        })?;
        beta = chol.solve(&(&xtw * &z));
        eta = x * &beta;
        if let Some(off) = offset {
            eta += off;
        }
        let dev = total_deviance(family, y, &eta, prior);
        if !dev.is_finite() {
            return Err(LmmError::PirlsDivergence {
                iteration,
                reason: "non-finite deviance in the starting GLM".into(),
            });
        }
        if (dev_old - dev).abs() < GLM_TOL * (dev.abs() + GLM_TOL) {
            log::debug!("starting GLM converged in {} iterations, deviance {:.6}", iteration, dev);
            break;
        }
        dev_old = dev;
    }
    Ok(beta)
}

impl GeneralizedLinearMixedModel {
    /// Penalized iteratively reweighted least squares at the current θ.
    ///
    /// Starts from u = 0 and either the starting β (`vary_beta`, updated
    /// jointly with u) or the installed β (held fixed). On return the
    /// factor holds the working weights at the conditional modes. Returns the
    /// penalized deviance Σ devresid + ‖u‖².
    pub(crate) fn pirls(&mut self, vary_beta: bool, tol: f64, max_iter: usize) -> Result<f64> {
        if vary_beta {
            self.beta = self.beta_start.clone();
        }
        self.u = self.zero_effects();
        self.update_eta();
        let mut pdev_old = self.penalized_deviance();
        if !pdev_old.is_finite() {
            return Err(LmmError::PirlsDivergence {
                iteration: 0,
                reason: "non-finite deviance at the starting values".into(),
            });
        }

        let mut converged = false;
        for iteration in 1..=max_iter {
            self.refactor_at_eta(iteration)?;
            let beta_old = self.beta.clone();
            let u_old = self.u.clone();

            let factor = self.lmm.factor();
            if vary_beta {
                self.beta = factor.beta()?;
            }
            self.u = factor.spherical_effects(&self.beta)?;
            self.update_eta();
            let mut pdev = self.penalized_deviance();

            let slack = tol * pdev_old.abs();
            let mut halvings = 0;
            while !(pdev <= pdev_old + slack) {
                if halvings == MAX_HALVINGS {
                    return Err(LmmError::PirlsDivergence {
                        iteration,
                        reason: format!(
                            "penalized deviance {} not reduced below {} after {} step-halvings",
                            pdev, pdev_old, MAX_HALVINGS
                        ),
                    });
                }
                halvings += 1;
                self.beta = (&self.beta + &beta_old) * 0.5;
                for (uk, ok) in self.u.iter_mut().zip(&u_old) {
                    *uk = (&*uk + ok) * 0.5;
                }
                self.update_eta();
                pdev = self.penalized_deviance();
            }
            log::debug!(
                "PIRLS iteration {}: penalized deviance {:.8} ({} halvings)",
                iteration,
                pdev,
                halvings
            );

            if (pdev_old - pdev).abs() < tol * pdev.abs().max(tol) {
                pdev_old = pdev;
                converged = true;
                break;
            }
            pdev_old = pdev;
        }
        if !converged {
            return Err(LmmError::PirlsDivergence {
                iteration: max_iter,
                reason: "iteration limit reached".into(),
            });
        }
        // logdet must correspond to the weights at the modes
        self.refactor_at_eta(max_iter)?;
        Ok(pdev_old)
    }

    /// Rebuild the crossproducts for the working values at the current η and
    /// refactor at the installed θ.
    fn refactor_at_eta(&mut self, iteration: usize) -> Result<()> {
        let (w, z) = working_values(
            &self.family,
            &self.lmm.matrices().y,
            &self.eta,
            self.lmm.matrices().offset.as_ref(),
            &self.prior_weights,
            iteration,
        )?;
        self.lmm.reweight(&w, &z)?;
        let theta = self.lmm.theta().to_vec();
        self.lmm.set_theta(&theta)
    }

    /// Σ devresid + ‖u‖² at the current state.
    pub(crate) fn penalized_deviance(&self) -> f64 {
        let usq: f64 = self.u.iter().map(|uk| uk.norm_squared()).sum();
        total_deviance(&self.family, &self.lmm.matrices().y, &self.eta, &self.prior_weights) + usq
    }
}
