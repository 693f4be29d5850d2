use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Objective assigned to trial points where the model cannot be evaluated
/// (non-positive-definite system, PIRLS divergence, non-finite value).
pub const INFEASIBLE_OBJECTIVE: f64 = 1e100;

/// Optimizer state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OptimStatus {
    Initialized,
    Iterating,
    Converged,
    MaxEvaluations,
}

impl OptimStatus {
    pub fn is_converged(&self) -> bool {
        matches!(self, OptimStatus::Converged)
    }
}

/// One recorded objective evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceEntry {
    pub feval: usize,
    pub params: Vec<f64>,
    pub objective: f64,
}

/// Counts evaluations, keeps the best point and a thinned trace, and decides
/// when a simplex has converged.
#[derive(Debug)]
pub struct ConvergenceMonitor {
    ftol_rel: f64,
    xtol_abs: f64,
    max_feval: usize,
    thin: usize,
    feval: usize,
    best: Option<(Vec<f64>, f64)>,
    trace: Vec<TraceEntry>,
    status: OptimStatus,
}

impl ConvergenceMonitor {
    pub fn new(ftol_rel: f64, xtol_abs: f64, max_feval: usize, thin: usize) -> Self {
        Self {
            ftol_rel,
            xtol_abs,
            max_feval,
            thin,
            feval: 0,
            best: None,
            trace: Vec::new(),
            status: OptimStatus::Initialized,
        }
    }

    /// Evaluate `f` at `x`, or return `None` once the budget is spent.
    ///
    /// Recoverable model errors and non-finite values become
    /// [`INFEASIBLE_OBJECTIVE`]; any other error aborts the search.
    pub fn evaluate<F>(&mut self, f: &mut F, x: &[f64]) -> Result<Option<f64>>
    where
        F: FnMut(&[f64]) -> Result<f64>,
    {
        if self.feval >= self.max_feval {
            self.status = OptimStatus::MaxEvaluations;
            return Ok(None);
        }
        self.feval += 1;
        self.status = OptimStatus::Iterating;
        let value = match f(x) {
            Ok(v) if v.is_finite() => v,
            Ok(v) => {
                log::debug!("evaluation {} returned {}; penalized", self.feval, v);
                INFEASIBLE_OBJECTIVE
            }
            Err(e) if e.is_recoverable() => {
                log::debug!("evaluation {} failed ({}); penalized", self.feval, e);
                INFEASIBLE_OBJECTIVE
            }
            Err(e) => return Err(e),
        };
        log::debug!("evaluation {}: objective {:.8} at {:?}", self.feval, value, x);

        if self.thin > 0 && (self.feval - 1) % self.thin == 0 {
            self.trace.push(TraceEntry {
                feval: self.feval,
                params: x.to_vec(),
                objective: value,
            });
        }
        let improved = self.best.as_ref().map_or(true, |(_, b)| value < *b);
        if improved {
            self.best = Some((x.to_vec(), value));
        }
        Ok(Some(value))
    }

    /// Objective spread and diameter of a simplex are both within tolerance.
    ///
    /// `values[0]` and `points[0]` are the best vertex.
    pub fn simplex_converged(&self, points: &[Vec<f64>], values: &[f64]) -> bool {
        let best = values[0];
        if best >= INFEASIBLE_OBJECTIVE {
            return false;
        }
        let spread = values.iter().fold(0.0f64, |acc, &v| acc.max((v - best).abs()));
        let diameter = points.iter().fold(0.0f64, |acc, p| {
            p.iter()
                .zip(points[0].iter())
                .fold(acc, |a, (x, y)| a.max((x - y).abs()))
        });
        spread <= self.ftol_rel * (best.abs() + self.ftol_rel) && diameter <= self.xtol_abs
    }

    pub fn set_status(&mut self, status: OptimStatus) {
        self.status = status;
    }

    pub fn status(&self) -> OptimStatus {
        self.status
    }

    pub fn feval(&self) -> usize {
        self.feval
    }

    pub fn budget_left(&self) -> bool {
        self.feval < self.max_feval
    }

    /// Best point seen so far and its objective.
    pub fn best(&self) -> Option<(&[f64], f64)> {
        self.best.as_ref().map(|(x, v)| (x.as_slice(), *v))
    }

    pub fn into_parts(self) -> (Option<(Vec<f64>, f64)>, Vec<TraceEntry>, OptimStatus, usize) {
        (self.best, self.trace, self.status, self.feval)
    }
}
