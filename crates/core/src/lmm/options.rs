use serde::{Deserialize, Serialize};

use crate::error::{LmmError, Result};

/// Settings for one fit. Passed explicitly; a copy is stored in the
/// optimizer summary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FitOptions {
    /// Starting θ in elimination order (see
    /// [`LinearMixedModel::theta_names`](crate::lmm::LinearMixedModel::theta_names));
    /// the structures' defaults when `None`.
    pub theta_start: Option<Vec<f64>>,
    pub max_feval: usize,
    /// Relative tolerance on the objective spread over the simplex.
    pub ftol_rel: f64,
    /// Absolute tolerance on the simplex diameter.
    pub xtol_abs: f64,
    /// Initial simplex step for θ coordinates.
    pub initial_step: f64,
    /// Quadrature nodes per random effect (1 = Laplace).
    pub nagq: usize,
    /// Keep every `thin`-th evaluation in the trace; 0 keeps none.
    pub thin: usize,
    pub reml: bool,
    /// GLMM: optimize θ only, with β profiled inside PIRLS.
    pub fast: bool,
    pub pirls_tol: f64,
    pub pirls_max_iter: usize,
}

impl Default for FitOptions {
    fn default() -> Self {
        Self {
            theta_start: None,
            max_feval: 10_000,
            ftol_rel: 1e-12,
            xtol_abs: 1e-6,
            initial_step: 0.75,
            nagq: 1,
            thin: 1,
            reml: false,
            fast: false,
            pirls_tol: 1e-10,
            pirls_max_iter: 100,
        }
    }
}

impl FitOptions {
    pub fn theta_start(mut self, theta: Vec<f64>) -> Self {
        self.theta_start = Some(theta);
        self
    }

    pub fn max_feval(mut self, n: usize) -> Self {
        self.max_feval = n;
        self
    }

    pub fn ftol_rel(mut self, tol: f64) -> Self {
        self.ftol_rel = tol;
        self
    }

    pub fn xtol_abs(mut self, tol: f64) -> Self {
        self.xtol_abs = tol;
        self
    }

    pub fn initial_step(mut self, step: f64) -> Self {
        self.initial_step = step;
        self
    }

    pub fn nagq(mut self, nagq: usize) -> Self {
        self.nagq = nagq;
        self
    }

    pub fn thin(mut self, thin: usize) -> Self {
        self.thin = thin;
        self
    }

    pub fn reml(mut self, reml: bool) -> Self {
        self.reml = reml;
        self
    }

    pub fn fast(mut self, fast: bool) -> Self {
        self.fast = fast;
        self
    }

    pub fn pirls_tol(mut self, tol: f64) -> Self {
        self.pirls_tol = tol;
        self
    }

    pub fn pirls_max_iter(mut self, n: usize) -> Self {
        self.pirls_max_iter = n;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.nagq == 0 || self.nagq % 2 == 0 {
            return Err(LmmError::ModelSpec(format!(
                "nagq must be a positive odd number, got {}",
                self.nagq
            )));
        }
        if self.max_feval == 0 {
            return Err(LmmError::ModelSpec("max_feval must be positive".into()));
        }
        let positive = [
            ("ftol_rel", self.ftol_rel),
            ("xtol_abs", self.xtol_abs),
            ("initial_step", self.initial_step),
            ("pirls_tol", self.pirls_tol),
        ];
        if let Some((name, v)) = positive.iter().find(|(_, v)| !(*v > 0.0)) {
            return Err(LmmError::ModelSpec(format!(
                "{} must be positive, got {}",
                name, v
            )));
        }
        Ok(())
    }
}
