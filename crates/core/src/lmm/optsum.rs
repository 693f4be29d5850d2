use std::io::{Read, Write};

use serde::{Deserialize, Serialize};

use crate::error::{LmmError, Result};
use crate::optim::{OptimOutcome, OptimStatus, TraceEntry};

use super::options::FitOptions;

/// Snapshot of an optimization: settings, start and end points, and trace.
///
/// `final_params` is θ for linear models and fast GLMM fits, and `[β; θ]`
/// for full GLMM fits (`n_theta` says where θ starts).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptSummary {
    pub optimizer: String,
    pub initial: Vec<f64>,
    pub final_params: Vec<f64>,
    pub n_theta: usize,
    pub fmin: f64,
    pub feval: usize,
    pub status: OptimStatus,
    /// Lower bounds; `None` for unbounded coordinates.
    #[serde(with = "bounds")]
    pub lower_bounds: Vec<f64>,
    pub options: FitOptions,
    pub trace: Vec<TraceEntry>,
}

impl OptSummary {
    pub fn from_outcome(
        initial: Vec<f64>,
        lower_bounds: Vec<f64>,
        n_theta: usize,
        options: &FitOptions,
        outcome: OptimOutcome,
    ) -> Self {
        Self {
            optimizer: "NelderMead".to_string(),
            initial,
            final_params: outcome.x,
            n_theta,
            fmin: outcome.fmin,
            feval: outcome.feval,
            status: outcome.status,
            lower_bounds,
            options: options.clone(),
            trace: outcome.trace,
        }
    }

    /// θ part of the final parameters.
    pub fn theta(&self) -> &[f64] {
        &self.final_params[self.split()..]
    }

    /// β part of the final parameters (empty unless β was optimized).
    pub fn beta(&self) -> &[f64] {
        &self.final_params[..self.split()]
    }

    fn split(&self) -> usize {
        self.final_params.len().saturating_sub(self.n_theta)
    }

    pub fn converged(&self) -> bool {
        self.status.is_converged()
    }

    pub fn save<W: Write>(&self, writer: W) -> Result<()> {
        serde_json::to_writer_pretty(writer, self)?;
        Ok(())
    }

    /// Read a summary written by [`OptSummary::save`].
    ///
    /// # Errors
    /// `Json` for malformed input; `InvalidParameter` when the parameter
    /// vectors disagree in length or `n_theta` exceeds them.
    pub fn load<R: Read>(reader: R) -> Result<Self> {
        let summary: Self = serde_json::from_reader(reader)?;
        summary.validate()?;
        Ok(summary)
    }

    fn validate(&self) -> Result<()> {
        let n = self.final_params.len();
        if self.n_theta > n {
            return Err(LmmError::InvalidParameter(format!(
                "optimization summary has n_theta = {} but only {} parameters",
                self.n_theta, n
            )));
        }
        if self.initial.len() != n || self.lower_bounds.len() != n {
            return Err(LmmError::InvalidParameter(format!(
                "optimization summary has {} final parameters, {} initial values and {} bounds",
                n,
                self.initial.len(),
                self.lower_bounds.len()
            )));
        }
        Ok(())
    }
}

/// Non-finite bounds are written as `null`.
mod bounds {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(v: &[f64], s: S) -> Result<S::Ok, S::Error> {
        let mapped: Vec<Option<f64>> = v
            .iter()
            .map(|&x| if x.is_finite() { Some(x) } else { None })
            .collect();
        mapped.serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<f64>, D::Error> {
        let mapped = Vec::<Option<f64>>::deserialize(d)?;
        Ok(mapped
            .into_iter()
            .map(|x| x.unwrap_or(f64::NEG_INFINITY))
            .collect())
    }
}
