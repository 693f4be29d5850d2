use std::io::{Read, Write};
use std::sync::Arc;

use nalgebra::{DMatrix, DVector};

use crate::error::{LmmError, Result};
use crate::matrix::{FillInPlan, FillInReport, RawBlocks};
use crate::model::{ModelMatrices, ReTerm};
use crate::optim::{ConvergenceMonitor, NelderMead};
use crate::variance::{Parameterization, VarianceComponent};

use super::deviance::{profiled_deviance, sigma_squared};
use super::factor::BlockedFactor;
use super::options::FitOptions;
use super::optsum::OptSummary;
use super::result::{FitResult, NamedEffect, RandomEffectBlock};

/// Relative tolerance when checking a restored objective.
const RESTORE_RTOL: f64 = 1e-6;

/// Linear mixed model fitted by minimizing the profiled deviance over θ.
///
/// Random-effects terms, θ and everything derived from them are kept in
/// elimination order (see [`LinearMixedModel::reterms`]).
#[derive(Debug, Clone)]
pub struct LinearMixedModel {
    matrices: Arc<ModelMatrices>,
    reterms: Arc<Vec<ReTerm>>,
    plan: Arc<FillInPlan>,
    param: Parameterization,
    raw: RawBlocks,
    factor: BlockedFactor,
    weights: Option<DVector<f64>>,
    sum_log_weights: f64,
    theta: Vec<f64>,
    reml: bool,
    optsum: Option<OptSummary>,
}

impl LinearMixedModel {
    /// Analyze the block structure, build the raw crossproducts and factor at
    /// the initial θ.
    pub fn new(matrices: ModelMatrices) -> Result<Self> {
        let p1 = matrices.n_fixed() + 1;
        let plan = Arc::new(FillInPlan::analyze(&matrices.reterms, p1)?);
        let reterms: Vec<ReTerm> = plan
            .order()
            .iter()
            .map(|&t| matrices.reterms[t].clone())
            .collect();
        let param = Parameterization::new(reterms.iter().map(|t| t.structure.clone()).collect());
        let y = match &matrices.offset {
            Some(off) => &matrices.y - off,
            None => matrices.y.clone(),
        };
        let weights = matrices.weights.clone();
        let sum_log_weights = weights
            .as_ref()
            .map_or(0.0, |w| w.iter().map(|v| v.ln()).sum());
        let raw = RawBlocks::build(&plan, &reterms, &matrices.x, &y, weights.as_ref())?;
        let factor = BlockedFactor::new(plan.clone(), &raw)?;
        let theta = param.initial();

        log::debug!(
            "linear mixed model: n = {}, p = {}, {} terms, {} theta, factor {} bytes",
            matrices.n_obs(),
            matrices.n_fixed(),
            reterms.len(),
            param.n_theta(),
            plan.factor_bytes()
        );

        let mut model = Self {
            matrices: Arc::new(matrices),
            reterms: Arc::new(reterms),
            plan,
            param,
            raw,
            factor,
            weights,
            sum_log_weights,
            theta: Vec::new(),
            reml: false,
            optsum: None,
        };
        model.set_theta(&theta)?;
        Ok(model)
    }

    pub fn set_reml(&mut self, reml: bool) {
        self.reml = reml;
    }

    /// Install θ and refactor.
    ///
    /// θ is laid out term by term in elimination order, as named by
    /// [`LinearMixedModel::theta_names`].
    pub fn set_theta(&mut self, theta: &[f64]) -> Result<()> {
        self.param.validate(theta)?;
        let lambdas = self.param.factors(theta);
        self.factor.update(&self.raw, &lambdas)?;
        self.theta = theta.to_vec();
        Ok(())
    }

    /// Profiled deviance (or REML criterion) at the current θ.
    pub fn objective(&self) -> f64 {
        profiled_deviance(
            &self.factor,
            self.n_obs(),
            self.n_fixed(),
            self.reml,
            self.sum_log_weights,
        )
    }

    pub fn objective_at(&mut self, theta: &[f64]) -> Result<f64> {
        self.set_theta(theta)?;
        Ok(self.objective())
    }

    /// Minimize the objective over θ and return the fitted model.
    pub fn fit(&mut self, options: &FitOptions) -> Result<FitResult> {
        options.validate()?;
        self.reml = options.reml;
        let start = options
            .theta_start
            .clone()
            .unwrap_or_else(|| self.param.initial());
        self.param.validate(&start)?;

        let lower = self.param.lower_bounds();
        let optimizer = NelderMead::with_lower_bounds(lower.clone(), options.initial_step)?;
        let monitor = ConvergenceMonitor::new(
            options.ftol_rel,
            options.xtol_abs,
            options.max_feval,
            options.thin,
        );
        let outcome = optimizer.minimize(|theta| self.objective_at(theta), &start, monitor)?;
        // leave the factor at the optimum, not at the last trial point
        self.set_theta(&outcome.x)?;

        log::info!(
            "{} fit: objective {:.6} after {} evaluations ({:?})",
            if self.reml { "REML" } else { "ML" },
            outcome.fmin,
            outcome.feval,
            outcome.status
        );
        let singular = self.singular_terms();
        if !singular.is_empty() {
            log::warn!("singular fit: {} on the boundary", singular.join(", "));
        }
        let n_theta = self.param.n_theta();
        self.optsum = Some(OptSummary::from_outcome(start, lower, n_theta, options, outcome));
        self.result()
    }

    /// Summary of the current fit.
    pub fn result(&self) -> Result<FitResult> {
        let optsum = self
            .optsum
            .clone()
            .ok_or_else(|| LmmError::ModelSpec("model has not been fitted".into()))?;
        let beta = self.beta()?;
        let se = self.stderror()?;
        let fixed_effects = self
            .matrices
            .xnames
            .iter()
            .zip(beta.iter().zip(se.iter()))
            .map(|(name, (&estimate, &se))| NamedEffect {
                name: name.clone(),
                estimate,
                se,
            })
            .collect();
        let random_effects = self
            .ranef()?
            .iter()
            .zip(self.reterms.iter())
            .map(|(b, term)| random_effect_block(term, b))
            .collect();
        let fitted = self.fitted()?;
        let residuals = &self.matrices.y - &fitted;
        let objective = self.objective();
        Ok(FitResult {
            family: None,
            theta: self.theta.clone(),
            theta_names: self.theta_names(),
            fixed_effects,
            sigma: Some(self.sigma()),
            variance_components: self.variance_components(),
            random_effects,
            objective,
            log_likelihood: -objective / 2.0,
            reml: self.reml,
            n_obs: self.n_obs(),
            n_fixed: self.n_fixed(),
            n_theta: self.param.n_theta(),
            converged: optsum.converged(),
            singular: self.param.is_singular(&self.theta),
            singular_terms: self.singular_terms(),
            optsum,
            fitted: fitted.as_slice().to_vec(),
            residuals: residuals.as_slice().to_vec(),
        })
    }

    pub fn beta(&self) -> Result<DVector<f64>> {
        self.factor.beta()
    }

    /// Spherical random effects u at the conditional β.
    pub fn spherical_effects(&self) -> Result<Vec<DVector<f64>>> {
        self.factor.spherical_effects(&self.beta()?)
    }

    /// Conditional modes b_k = λ_k U_k, each q × ℓ, in elimination order.
    pub fn ranef(&self) -> Result<Vec<DMatrix<f64>>> {
        let u = self.spherical_effects()?;
        Ok(self.scale_effects(&u))
    }

    pub(crate) fn scale_effects(&self, u: &[DVector<f64>]) -> Vec<DMatrix<f64>> {
        let lambdas = self.param.factors(&self.theta);
        u.iter()
            .zip(self.reterms.iter())
            .zip(lambdas.iter())
            .map(|((uk, term), lambda)| {
                lambda * DMatrix::from_column_slice(term.q(), term.n_levels(), uk.as_slice())
            })
            .collect()
    }

    /// Residual standard deviation.
    pub fn sigma(&self) -> f64 {
        sigma_squared(self.factor.pwrss(), self.n_obs(), self.n_fixed(), self.reml).sqrt()
    }

    /// Standard errors of β.
    pub fn stderror(&self) -> Result<Vec<f64>> {
        let linv = self.factor.fixed_inverse()?;
        let sigma = self.sigma();
        Ok(linv.column_iter().map(|c| sigma * c.norm()).collect())
    }

    /// Xβ + Zb + offset.
    pub fn fitted(&self) -> Result<DVector<f64>> {
        let beta = self.beta()?;
        let b = self.ranef()?;
        Ok(self.linear_predictor(&beta, &b))
    }

    pub(crate) fn linear_predictor(&self, beta: &DVector<f64>, b: &[DMatrix<f64>]) -> DVector<f64> {
        let mut eta = &self.matrices.x * beta;
        for (term, bk) in self.reterms.iter().zip(b) {
            term.mul_add(bk, &mut eta);
        }
        if let Some(off) = &self.matrices.offset {
            eta += off;
        }
        eta
    }

    pub fn residuals(&self) -> Result<DVector<f64>> {
        Ok(&self.matrices.y - self.fitted()?)
    }

    pub fn variance_components(&self) -> Vec<VarianceComponent> {
        let sigma = self.sigma();
        self.component_list(sigma)
    }

    pub(crate) fn component_list(&self, sigma: f64) -> Vec<VarianceComponent> {
        let lambdas = self.param.factors(&self.theta);
        self.reterms
            .iter()
            .zip(lambdas.iter())
            .map(|(t, l)| VarianceComponent::from_lambda(&t.name, &t.cnames, l, sigma))
            .collect()
    }

    pub fn theta_names(&self) -> Vec<String> {
        let labels: Vec<(&str, &[String])> = self
            .reterms
            .iter()
            .map(|t| (t.name.as_str(), t.cnames.as_slice()))
            .collect();
        self.param.names(&labels)
    }

    pub fn singular_terms(&self) -> Vec<String> {
        self.param
            .singular_terms(&self.theta)
            .into_iter()
            .map(|k| self.reterms[k].name.clone())
            .collect()
    }

    pub fn lower_bounds(&self) -> Vec<f64> {
        self.param.lower_bounds()
    }

    pub fn fill_in_report(&self) -> &FillInReport {
        self.plan.report()
    }

    /// Current θ in elimination order.
    pub fn theta(&self) -> &[f64] {
        &self.theta
    }

    /// Input term index of each term, in elimination order: entry `k` is
    /// the position in [`ModelMatrices::reterms`] of `self.reterms()[k]`.
    pub fn elimination_order(&self) -> &[usize] {
        self.plan.order()
    }

    pub fn is_reml(&self) -> bool {
        self.reml
    }

    pub fn n_obs(&self) -> usize {
        self.matrices.n_obs()
    }

    pub fn n_fixed(&self) -> usize {
        self.matrices.n_fixed()
    }

    pub fn n_theta(&self) -> usize {
        self.param.n_theta()
    }

    pub fn matrices(&self) -> &ModelMatrices {
        &self.matrices
    }

    /// Random-effects terms in elimination order.
    pub fn reterms(&self) -> &[ReTerm] {
        &self.reterms
    }

    pub fn parameterization(&self) -> &Parameterization {
        &self.param
    }

    pub fn optsum(&self) -> Option<&OptSummary> {
        self.optsum.as_ref()
    }

    pub(crate) fn factor(&self) -> &BlockedFactor {
        &self.factor
    }

    /// Whether both models read the same random-effects crossproducts.
    pub fn shares_blocks_with(&self, other: &LinearMixedModel) -> bool {
        self.raw.shares_re_with(&other.raw)
    }

    /// Same design and θ with a new response. The random-effects
    /// crossproducts are shared; the factor is private to the new model.
    pub fn with_response(&self, y: DVector<f64>) -> Result<Self> {
        let matrices = self.matrices.with_response(y)?;
        let y_eff = match &matrices.offset {
            Some(off) => &matrices.y - off,
            None => matrices.y.clone(),
        };
        let mut raw = self.raw.clone();
        raw.update_response(&self.reterms, &matrices.x, &y_eff, self.weights.as_ref())?;
        let mut model = Self {
            matrices: Arc::new(matrices),
            reterms: Arc::clone(&self.reterms),
            plan: Arc::clone(&self.plan),
            param: self.param.clone(),
            raw,
            factor: self.factor.clone(),
            weights: self.weights.clone(),
            sum_log_weights: self.sum_log_weights,
            theta: Vec::new(),
            reml: self.reml,
            optsum: None,
        };
        model.set_theta(&self.theta)?;
        Ok(model)
    }

    /// Rebuild the crossproducts for working weights `w` and working
    /// response `z` (already net of any offset), keeping θ.
    pub(crate) fn reweight(&mut self, w: &DVector<f64>, z: &DVector<f64>) -> Result<()> {
        self.raw.reweight(&self.plan, &self.reterms, &self.matrices.x, z, w)?;
        self.weights = Some(w.clone());
        Ok(())
    }

    pub fn save_optsum<W: Write>(&self, writer: W) -> Result<()> {
        match &self.optsum {
            Some(o) => o.save(writer),
            None => Err(LmmError::ModelSpec("model has not been fitted".into())),
        }
    }

    /// Load an optimizer summary, install its θ and check that the objective
    /// it records is reproduced.
    pub fn restore_optsum<R: Read>(&mut self, reader: R) -> Result<()> {
        let optsum = OptSummary::load(reader)?;
        if optsum.final_params.len() != self.param.n_theta() || optsum.n_theta != self.param.n_theta() {
            return Err(LmmError::DimensionMismatch {
                expected: self.param.n_theta(),
                got: optsum.final_params.len(),
                context: "restored theta".into(),
            });
        }
        self.reml = optsum.options.reml;
        let recomputed = self.objective_at(&optsum.final_params)?;
        check_restored(optsum.fmin, recomputed)?;
        log::info!("restored fit with objective {:.6}", recomputed);
        self.optsum = Some(optsum);
        Ok(())
    }
}

pub(crate) fn check_restored(stored: f64, recomputed: f64) -> Result<()> {
    if (recomputed - stored).abs() > RESTORE_RTOL * stored.abs().max(1.0) {
        return Err(LmmError::RestoreMismatch { stored, recomputed });
    }
    Ok(())
}

pub(crate) fn random_effect_block(term: &ReTerm, b: &DMatrix<f64>) -> RandomEffectBlock {
    RandomEffectBlock {
        group: term.name.clone(),
        cnames: term.cnames.clone(),
        levels: term.levels.clone(),
        values: b
            .column_iter()
            .map(|c| c.iter().copied().collect())
            .collect(),
    }
}
