use serde::Serialize;

use crate::variance::VarianceComponent;

use super::optsum::OptSummary;

/// The result of fitting a mixed model.
#[derive(Debug, Clone, Serialize)]
pub struct FitResult {
    /// Response family for generalized models; `None` for linear models.
    pub family: Option<String>,
    /// Fitted θ, terms in elimination order.
    pub theta: Vec<f64>,
    pub theta_names: Vec<String>,
    /// Fixed-effects coefficients with standard errors.
    pub fixed_effects: Vec<NamedEffect>,
    /// Residual standard deviation (linear models only).
    pub sigma: Option<f64>,
    pub variance_components: Vec<VarianceComponent>,
    /// Conditional modes of the random effects, one block per term.
    pub random_effects: Vec<RandomEffectBlock>,
    /// Objective at convergence: -2 log-likelihood (ML), the REML
    /// criterion, or the Laplace / quadrature deviance.
    pub objective: f64,
    pub log_likelihood: f64,
    pub reml: bool,
    pub n_obs: usize,
    pub n_fixed: usize,
    pub n_theta: usize,
    pub converged: bool,
    /// θ on the boundary of the parameter space.
    pub singular: bool,
    pub singular_terms: Vec<String>,
    pub optsum: OptSummary,
    pub fitted: Vec<f64>,
    pub residuals: Vec<f64>,
}

/// A named fixed-effect estimate.
#[derive(Debug, Clone, Serialize)]
pub struct NamedEffect {
    pub name: String,
    pub estimate: f64,
    pub se: f64,
}

/// Random effects of one term: `values[level][j]` is effect `cnames[j]` at
/// `levels[level]`.
#[derive(Debug, Clone, Serialize)]
pub struct RandomEffectBlock {
    pub group: String,
    pub cnames: Vec<String>,
    pub levels: Vec<String>,
    pub values: Vec<Vec<f64>>,
}

impl FitResult {
    /// Estimated parameters: fixed effects, θ, and σ when estimated.
    pub fn dof(&self) -> usize {
        self.n_fixed + self.n_theta + usize::from(self.sigma.is_some())
    }

    pub fn aic(&self) -> f64 {
        -2.0 * self.log_likelihood + 2.0 * self.dof() as f64
    }

    pub fn bic(&self) -> f64 {
        -2.0 * self.log_likelihood + self.dof() as f64 * (self.n_obs as f64).ln()
    }

    pub fn summary(&self) -> String {
        let mut s = String::new();

        let kind = match &self.family {
            Some(f) => format!("Generalized linear mixed model ({})", f),
            None if self.reml => "Linear mixed model (REML)".to_string(),
            None => "Linear mixed model (ML)".to_string(),
        };
        s.push_str(&format!("=== {} ===\n\n", kind));
        s.push_str(&format!(
            "Observations: {}   Fixed params: {}   Theta params: {}\n",
            self.n_obs, self.n_fixed, self.n_theta
        ));
        s.push_str(&format!(
            "Converged: {}   Evaluations: {}\n",
            self.converged, self.optsum.feval
        ));
        if self.singular {
            s.push_str(&format!(
                "Singular fit: {}\n",
                self.singular_terms.join(", ")
            ));
        }
        s.push('\n');

        s.push_str(&format!("Objective: {:.4}\n", self.objective));
        s.push_str(&format!("Log-likelihood: {:.4}\n", self.log_likelihood));
        s.push_str(&format!("AIC: {:.4}\n", self.aic()));
        s.push_str(&format!("BIC: {:.4}\n\n", self.bic()));

        s.push_str("--- Variance Components ---\n");
        for vc in &self.variance_components {
            for (name, sd) in vc.names.iter().zip(&vc.std_devs) {
                s.push_str(&format!("  {} {}: sd = {:.6}\n", vc.group, name, sd));
            }
            for i in 0..vc.correlations.len() {
                for j in 0..i {
                    s.push_str(&format!(
                        "  {} corr({}, {}) = {:.4}\n",
                        vc.group, vc.names[i], vc.names[j], vc.correlations[i][j]
                    ));
                }
            }
        }
        if let Some(sigma) = self.sigma {
            s.push_str(&format!("  Residual: sd = {:.6}\n", sigma));
        }

        s.push_str("\n--- Fixed Effects ---\n");
        for ef in &self.fixed_effects {
            s.push_str(&format!(
                "  {}: {:.6} (SE: {:.6})\n",
                ef.name, ef.estimate, ef.se
            ));
        }

        for block in &self.random_effects {
            s.push_str(&format!("\n--- Random Effects: {} ---\n", block.group));
            let show = block.levels.len().min(10);
            for (level, values) in block.levels.iter().zip(&block.values).take(show) {
                let formatted: Vec<String> = values.iter().map(|v| format!("{:.6}", v)).collect();
                s.push_str(&format!("  {}: {}\n", level, formatted.join("  ")));
            }
            if block.levels.len() > 10 {
                s.push_str(&format!("  ... and {} more\n", block.levels.len() - 10));
            }
        }

        s
    }
}
