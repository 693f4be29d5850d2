use std::io::{Read, Write};

use nalgebra::{DMatrix, DVector};

use crate::error::{LmmError, Result};
use crate::lmm::linear::{check_restored, random_effect_block};
use crate::lmm::{FitOptions, FitResult, LinearMixedModel, NamedEffect, OptSummary};
use crate::model::{ModelMatrices, ReTerm};
use crate::optim::{ConvergenceMonitor, NelderMead, OptimStatus};
use crate::variance::VarianceComponent;

use super::family::Family;
use super::pirls::glm_start;
use super::quadrature::GaussHermite;

/// Generalized linear mixed model fitted by PIRLS with a Laplace or adaptive
/// Gauss–Hermite approximation to the deviance.
///
/// The random-effects system is held by an inner [`LinearMixedModel`] whose
/// crossproducts are rebuilt from the working weights at every PIRLS step.
#[derive(Debug, Clone)]
pub struct GeneralizedLinearMixedModel {
    pub(super) lmm: LinearMixedModel,
    pub(super) family: Family,
    pub(super) prior_weights: DVector<f64>,
    pub(super) beta_start: DVector<f64>,
    pub(super) beta: DVector<f64>,
    /// Spherical random effects, one vector per term in elimination order.
    pub(super) u: Vec<DVector<f64>>,
    pub(super) eta: DVector<f64>,
    nagq: usize,
    optsum: Option<OptSummary>,
}

impl GeneralizedLinearMixedModel {
    pub fn new(matrices: ModelMatrices, family: Family) -> Result<Self> {
        if family.is_linear() {
            return Err(LmmError::ModelSpec(
                "Gaussian responses with the identity link are fitted as linear mixed models".into(),
            ));
        }
        family.validate_response(matrices.y.as_slice())?;
        let prior_weights = matrices
            .weights
            .clone()
            .unwrap_or_else(|| DVector::from_element(matrices.n_obs(), 1.0));
        let beta_start = glm_start(
            &family,
            &matrices.x,
            &matrices.y,
            matrices.offset.as_ref(),
            &prior_weights,
        )?;
        let lmm = LinearMixedModel::new(matrices)?;
        let u = lmm.reterms().iter().map(|t| DVector::zeros(t.size())).collect();
        let eta = DVector::zeros(lmm.n_obs());
        log::debug!(
            "generalized mixed model ({}): starting beta {:?}",
            family,
            beta_start.as_slice()
        );
        let mut model = Self {
            lmm,
            family,
            prior_weights,
            beta: beta_start.clone(),
            beta_start,
            u,
            eta,
            nagq: 1,
            optsum: None,
        };
        model.update_eta();
        Ok(model)
    }

    pub fn family(&self) -> Family {
        self.family
    }

    /// Quadrature points in use; 1 is the Laplace approximation.
    pub fn nagq(&self) -> usize {
        self.nagq
    }

    /// Select the number of quadrature points. Anything but a single scalar
    /// random-effects term falls back to the Laplace approximation.
    pub fn set_nagq(&mut self, nagq: usize) -> Result<()> {
        if nagq == 0 || nagq % 2 == 0 {
            return Err(LmmError::ModelSpec(format!(
                "nAGQ must be odd and positive, got {}",
                nagq
            )));
        }
        let scalar_single = self.lmm.reterms().len() == 1 && self.lmm.reterms()[0].q() == 1;
        if nagq > 1 && !scalar_single {
            log::warn!(
                "adaptive quadrature needs a single scalar random-effects term; using the Laplace approximation"
            );
            self.nagq = 1;
        } else {
            self.nagq = nagq;
        }
        Ok(())
    }

    pub(super) fn zero_effects(&self) -> Vec<DVector<f64>> {
        self.lmm
            .reterms()
            .iter()
            .map(|t| DVector::zeros(t.size()))
            .collect()
    }

    pub(super) fn update_eta(&mut self) {
        let b = self.lmm.scale_effects(&self.u);
        self.eta = self.lmm.linear_predictor(&self.beta, &b);
    }

    /// Laplace or quadrature deviance at the state left by PIRLS.
    fn deviance(&self, pdev: f64) -> Result<f64> {
        if self.nagq <= 1 {
            return Ok(pdev + self.lmm.factor().logdet());
        }
        self.agq_deviance(self.nagq)
    }

    /// Adaptive Gauss–Hermite quadrature for one scalar term, recentred at
    /// the conditional modes and scaled by the inverse factor diagonal.
    fn agq_deviance(&self, k: usize) -> Result<f64> {
        let rule = GaussHermite::normal(k)?;
        let term = &self.lmm.reterms()[0];
        let n_levels = term.n_levels();
        let sd: Vec<f64> = self
            .lmm
            .factor()
            .diagonal_block(0)
            .diagonal()
            .iter()
            .map(|l| 1.0 / l)
            .collect();
        let lambda = self.lmm.theta()[0];
        let mut fixed = &self.lmm.matrices().x * &self.beta;
        if let Some(off) = &self.lmm.matrices().offset {
            fixed += off;
        }
        let y = &self.lmm.matrices().y;
        let u0 = self.u[0].clone();

        let level_deviance = |shift: f64| -> Vec<f64> {
            let mut dev: Vec<f64> = (0..n_levels)
                .map(|j| {
                    let uj = u0[j] + shift * sd[j];
                    uj * uj
                })
                .collect();
            for (i, &level) in term.refs.iter().enumerate() {
                let uj = u0[level] + shift * sd[level];
                let eta = fixed[i] + term.z[(0, i)] * lambda * uj;
                let mu = self.family.linkinv(eta);
                dev[level] += self.family.devresid(y[i], mu, self.prior_weights[i]);
            }
            dev
        };

        let dev0 = level_deviance(0.0);
        let mut mult = vec![0.0; n_levels];
        for (&z, &w) in rule.nodes.iter().zip(&rule.weights) {
            if z == 0.0 {
                for m in &mut mult {
                    *m += w;
                }
                continue;
            }
            let dev = level_deviance(z);
            for j in 0..n_levels {
                mult[j] += w * (-(dev[j] - dev0[j]) / 2.0 + z * z / 2.0).exp();
            }
        }
        let total: f64 = dev0.iter().sum();
        let log_terms: f64 = mult
            .iter()
            .zip(&sd)
            .map(|(m, s)| m.ln() + s.ln())
            .sum();
        let value = total - 2.0 * log_terms;
        if !value.is_finite() {
            return Err(LmmError::PirlsDivergence {
                iteration: 0,
                reason: "non-finite quadrature deviance".into(),
            });
        }
        Ok(value)
    }

    /// Deviance at θ with β and u found jointly by PIRLS.
    pub fn objective_at(&mut self, theta: &[f64], options: &FitOptions) -> Result<f64> {
        self.lmm.set_theta(theta)?;
        let pdev = self.pirls(true, options.pirls_tol, options.pirls_max_iter)?;
        self.deviance(pdev)
    }

    /// Deviance at `[β; θ]` with only u found by PIRLS.
    pub fn objective_at_params(&mut self, params: &[f64], options: &FitOptions) -> Result<f64> {
        let p = self.lmm.n_fixed();
        if params.len() != p + self.lmm.n_theta() {
            return Err(LmmError::InvalidParameter(format!(
                "parameter vector has length {}, expected {}",
                params.len(),
                p + self.lmm.n_theta()
            )));
        }
        self.lmm.set_theta(&params[p..])?;
        self.beta = DVector::from_column_slice(&params[..p]);
        let pdev = self.pirls(false, options.pirls_tol, options.pirls_max_iter)?;
        self.deviance(pdev)
    }

    /// Fit θ (and, unless `options.fast`, β jointly with θ).
    ///
    /// The full fit starts from the fast solution and optimizes `[β; θ]`
    /// with PIRLS over u only.
    pub fn fit(&mut self, options: &FitOptions) -> Result<FitResult> {
        options.validate()?;
        if options.reml {
            return Err(LmmError::ModelSpec(
                "REML is not defined for generalized linear mixed models".into(),
            ));
        }
        self.set_nagq(options.nagq)?;
        let param = self.lmm.parameterization().clone();
        let start = options
            .theta_start
            .clone()
            .unwrap_or_else(|| param.initial());
        param.validate(&start)?;
        let n_theta = param.n_theta();
        let monitor = || {
            ConvergenceMonitor::new(
                options.ftol_rel,
                options.xtol_abs,
                options.max_feval,
                options.thin,
            )
        };

        let lower = param.lower_bounds();
        let optimizer = NelderMead::with_lower_bounds(lower.clone(), options.initial_step)?;
        let fast = optimizer.minimize(|theta| self.objective_at(theta, options), &start, monitor())?;
        self.objective_at(&fast.x, options)?;

        let optsum = if options.fast {
            self.log_fit("fast GLMM", fast.fmin, fast.feval, fast.status);
            OptSummary::from_outcome(start, lower, n_theta, options, fast)
        } else {
            log::debug!(
                "fast phase: deviance {:.6} after {} evaluations",
                fast.fmin,
                fast.feval
            );
            let se = self.stderror()?;
            let mut x0: Vec<f64> = self.beta.iter().copied().collect();
            x0.extend_from_slice(&fast.x);
            let mut full_lower = vec![f64::NEG_INFINITY; self.lmm.n_fixed()];
            full_lower.extend_from_slice(&lower);
            let mut steps: Vec<f64> = se
                .iter()
                .map(|s| if s.is_finite() && *s > 0.0 { s / 3.0 } else { 0.1 })
                .collect();
            steps.extend(fast.x.iter().map(|t| (t.abs() / 4.0).clamp(0.01, 0.05)));
            let upper = vec![f64::INFINITY; x0.len()];
            let optimizer = NelderMead::new(full_lower.clone(), upper, steps)?;
            let outcome = optimizer.minimize(
                |params| self.objective_at_params(params, options),
                &x0,
                monitor(),
            )?;
            self.objective_at_params(&outcome.x, options)?;
            self.log_fit("GLMM", outcome.fmin, outcome.feval, outcome.status);
            OptSummary::from_outcome(x0, full_lower, n_theta, options, outcome)
        };
        self.optsum = Some(optsum);
        self.result()
    }

    fn log_fit(&self, kind: &str, fmin: f64, feval: usize, status: OptimStatus) {
        log::info!(
            "{} fit ({}, nAGQ = {}): deviance {:.6} after {} evaluations ({:?})",
            kind,
            self.family,
            self.nagq,
            fmin,
            feval,
            status
        );
        let singular = self.lmm.singular_terms();
        if !singular.is_empty() {
            log::warn!("singular fit: {} on the boundary", singular.join(", "));
        }
    }

    /// Summary of the current fit.
    pub fn result(&self) -> Result<FitResult> {
        let optsum = self
            .optsum
            .clone()
            .ok_or_else(|| LmmError::ModelSpec("model has not been fitted".into()))?;
        let se = self.stderror()?;
        let fixed_effects = self
            .lmm
            .matrices()
            .xnames
            .iter()
            .zip(self.beta.iter().zip(se.iter()))
            .map(|(name, (&estimate, &se))| NamedEffect {
                name: name.clone(),
                estimate,
                se,
            })
            .collect();
        let random_effects = self
            .ranef()
            .iter()
            .zip(self.lmm.reterms().iter())
            .map(|(b, term)| random_effect_block(term, b))
            .collect();
        let fitted = self.fitted();
        let y = &self.lmm.matrices().y;
        let residuals: Vec<f64> = y.iter().zip(fitted.iter()).map(|(y, m)| y - m).collect();
        let theta = self.lmm.theta().to_vec();
        Ok(FitResult {
            family: Some(self.family.to_string()),
            theta_names: self.lmm.theta_names(),
            fixed_effects,
            sigma: None,
            variance_components: self.variance_components(),
            random_effects,
            objective: optsum.fmin,
            log_likelihood: self.log_likelihood(optsum.fmin),
            reml: false,
            n_obs: self.lmm.n_obs(),
            n_fixed: self.lmm.n_fixed(),
            n_theta: self.lmm.n_theta(),
            converged: optsum.converged(),
            singular: self.lmm.parameterization().is_singular(&theta),
            singular_terms: self.lmm.singular_terms(),
            theta,
            optsum,
            fitted: fitted.as_slice().to_vec(),
            residuals,
        })
    }

    /// log L = -objective / 2 + Σ (log f(y|μ) + devresid / 2).
    fn log_likelihood(&self, objective: f64) -> f64 {
        let y = &self.lmm.matrices().y;
        let correction: f64 = (0..y.len())
            .map(|i| {
                let mu = self.family.linkinv(self.eta[i]);
                let wt = self.prior_weights[i];
                self.family.log_density(y[i], mu, wt) + self.family.devresid(y[i], mu, wt) / 2.0
            })
            .sum();
        -objective / 2.0 + correction
    }

    pub fn beta(&self) -> &DVector<f64> {
        &self.beta
    }

    pub fn theta(&self) -> &[f64] {
        self.lmm.theta()
    }

    /// Standard errors of β from the factor at the conditional modes.
    pub fn stderror(&self) -> Result<Vec<f64>> {
        let linv = self.lmm.factor().fixed_inverse()?;
        Ok(linv.column_iter().map(|c| c.norm()).collect())
    }

    /// Conditional modes b_k = λ_k u_k, each q × ℓ, in elimination order.
    pub fn ranef(&self) -> Vec<DMatrix<f64>> {
        self.lmm.scale_effects(&self.u)
    }

    /// Conditional means μ.
    pub fn fitted(&self) -> DVector<f64> {
        self.eta.map(|e| self.family.linkinv(e))
    }

    pub fn linear_predictor(&self) -> &DVector<f64> {
        &self.eta
    }

    /// Random-effect standard deviations and correlations (unit scale).
    pub fn variance_components(&self) -> Vec<VarianceComponent> {
        self.lmm.component_list(1.0)
    }

    pub fn prior_weights(&self) -> &DVector<f64> {
        &self.prior_weights
    }

    pub fn matrices(&self) -> &ModelMatrices {
        self.lmm.matrices()
    }

    pub fn reterms(&self) -> &[ReTerm] {
        self.lmm.reterms()
    }

    pub fn n_theta(&self) -> usize {
        self.lmm.n_theta()
    }

    pub fn n_fixed(&self) -> usize {
        self.lmm.n_fixed()
    }

    pub fn linear_model(&self) -> &LinearMixedModel {
        &self.lmm
    }

    pub fn optsum(&self) -> Option<&OptSummary> {
        self.optsum.as_ref()
    }

    /// Same design and family with a new response; the starting β is
    /// recomputed and the fit is cleared.
    pub fn with_response(&self, y: DVector<f64>) -> Result<Self> {
        self.family.validate_response(y.as_slice())?;
        let lmm = self.lmm.with_response(y)?;
        let m = lmm.matrices();
        let beta_start = glm_start(&self.family, &m.x, &m.y, m.offset.as_ref(), &self.prior_weights)?;
        let mut model = Self {
            lmm,
            family: self.family,
            prior_weights: self.prior_weights.clone(),
            beta: beta_start.clone(),
            beta_start,
            u: self.zero_effects(),
            eta: self.eta.clone(),
            nagq: self.nagq,
            optsum: None,
        };
        model.update_eta();
        Ok(model)
    }

    pub fn save_optsum<W: Write>(&self, writer: W) -> Result<()> {
        match &self.optsum {
            Some(o) => o.save(writer),
            None => Err(LmmError::ModelSpec("model has not been fitted".into())),
        }
    }

    /// Load an optimizer summary, install its parameters and check that the
    /// objective it records is reproduced.
    pub fn restore_optsum<R: Read>(&mut self, reader: R) -> Result<()> {
        let optsum = OptSummary::load(reader)?;
        let n_theta = self.lmm.n_theta();
        let full = self.lmm.n_fixed() + n_theta;
        let len = optsum.final_params.len();
        if optsum.n_theta != n_theta || (len != n_theta && len != full) {
            return Err(LmmError::DimensionMismatch {
                expected: full,
                got: len,
                context: "restored parameters".into(),
            });
        }
        self.set_nagq(optsum.options.nagq)?;
        let recomputed = if len == n_theta {
            self.objective_at(&optsum.final_params, &optsum.options)?
        } else {
            self.objective_at_params(&optsum.final_params, &optsum.options)?
        };
        check_restored(optsum.fmin, recomputed)?;
        log::info!("restored GLMM fit with deviance {:.6}", recomputed);
        self.optsum = Some(optsum);
        Ok(())
    }
}
