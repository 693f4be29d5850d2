use crate::error::{LmmError, Result};

use super::convergence::{ConvergenceMonitor, OptimStatus, TraceEntry};

const REFLECT: f64 = 1.0;
const EXPAND: f64 = 2.0;
const CONTRACT: f64 = 0.5;
const SHRINK: f64 = 0.5;

/// Result of a bounded minimization.
#[derive(Debug, Clone)]
pub struct OptimOutcome {
    pub x: Vec<f64>,
    pub fmin: f64,
    pub feval: usize,
    pub status: OptimStatus,
    pub trace: Vec<TraceEntry>,
}

/// Derivative-free Nelder–Mead simplex search on a box.
///
/// Every trial point is projected onto `[lower, upper]`. After the first
/// convergence the search restarts once from the best vertex with a fresh
/// simplex.
#[derive(Debug, Clone)]
pub struct NelderMead {
    lower: Vec<f64>,
    upper: Vec<f64>,
    step: Vec<f64>,
}

impl NelderMead {
    pub fn new(lower: Vec<f64>, upper: Vec<f64>, step: Vec<f64>) -> Result<Self> {
        let n = lower.len();
        if upper.len() != n || step.len() != n {
            return Err(LmmError::DimensionMismatch {
                expected: n,
                got: if upper.len() != n { upper.len() } else { step.len() },
                context: "optimizer bounds and steps".into(),
            });
        }
        if let Some(i) = (0..n).find(|&i| !(lower[i] <= upper[i]) || !(step[i] > 0.0)) {
            return Err(LmmError::InvalidParameter(format!(
                "coordinate {}: bounds [{}, {}] with step {}",
                i, lower[i], upper[i], step[i]
            )));
        }
        Ok(Self { lower, upper, step })
    }

    /// Lower bounds only; every step set to `step`.
    pub fn with_lower_bounds(lower: Vec<f64>, step: f64) -> Result<Self> {
        let n = lower.len();
        Self::new(lower, vec![f64::INFINITY; n], vec![step; n])
    }

    pub fn minimize<F>(&self, mut f: F, x0: &[f64], mut monitor: ConvergenceMonitor) -> Result<OptimOutcome>
    where
        F: FnMut(&[f64]) -> Result<f64>,
    {
        if x0.len() != self.lower.len() {
            return Err(LmmError::DimensionMismatch {
                expected: self.lower.len(),
                got: x0.len(),
                context: "optimizer starting point".into(),
            });
        }
        let start = self.project(x0.to_vec());
        let mut converged = self.run(&mut f, &start, &mut monitor)?;
        if converged {
            let restart = monitor.best().map(|(x, _)| x.to_vec()).unwrap_or(start);
            log::debug!("simplex converged after {} evaluations; restarting", monitor.feval());
            converged = self.run(&mut f, &restart, &mut monitor)?;
        }
        let status = if converged {
            OptimStatus::Converged
        } else {
            log::warn!(
                "optimizer stopped after {} evaluations without converging",
                monitor.feval()
            );
            OptimStatus::MaxEvaluations
        };
        monitor.set_status(status);
        let (best, trace, status, feval) = monitor.into_parts();
        let (x, fmin) = best.ok_or_else(|| {
            LmmError::InvalidParameter("optimizer made no evaluations".into())
        })?;
        Ok(OptimOutcome {
            x,
            fmin,
            feval,
            status,
            trace,
        })
    }

    fn project(&self, mut x: Vec<f64>) -> Vec<f64> {
        for (i, v) in x.iter_mut().enumerate() {
            *v = v.max(self.lower[i]).min(self.upper[i]);
        }
        x
    }

    fn combine(&self, a: &[f64], b: &[f64], t: f64) -> Vec<f64> {
        // a + t (b - a)
        self.project(a.iter().zip(b).map(|(ai, bi)| ai + t * (bi - ai)).collect())
    }

    /// One simplex search from `x0`. Returns `false` when the evaluation
    /// budget ran out first.
    fn run<F>(&self, f: &mut F, x0: &[f64], monitor: &mut ConvergenceMonitor) -> Result<bool>
    where
        F: FnMut(&[f64]) -> Result<f64>,
    {
        let n = x0.len();
        let mut points = vec![x0.to_vec()];
        for i in 0..n {
            let mut v = x0.to_vec();
            v[i] += self.step[i];
            if v[i] > self.upper[i] {
                v[i] = x0[i] - self.step[i];
            }
            points.push(self.project(v));
        }
        let mut values = Vec::with_capacity(n + 1);
        for p in &points {
            match monitor.evaluate(f, p)? {
                Some(v) => values.push(v),
                None => return Ok(false),
            }
        }

        loop {
            let mut idx: Vec<usize> = (0..=n).collect();
            idx.sort_by(|&a, &b| values[a].total_cmp(&values[b]));
            points = idx.iter().map(|&i| points[i].clone()).collect();
            values = idx.iter().map(|&i| values[i]).collect();

            if monitor.simplex_converged(&points, &values) {
                return Ok(true);
            }
            if !monitor.budget_left() {
                return Ok(false);
            }

            let mut centroid = vec![0.0; n];
            for p in &points[..n] {
                for (c, v) in centroid.iter_mut().zip(p) {
                    *c += v / n as f64;
                }
            }
            let worst = points[n].clone();
            let f_worst = values[n];

            let xr = self.combine(&centroid, &worst, -REFLECT);
            let Some(fr) = monitor.evaluate(f, &xr)? else {
                return Ok(false);
            };

            if fr < values[0] {
                let xe = self.combine(&centroid, &xr, EXPAND);
                let Some(fe) = monitor.evaluate(f, &xe)? else {
                    return Ok(false);
                };
                if fe < fr {
                    points[n] = xe;
                    values[n] = fe;
                } else {
                    points[n] = xr;
                    values[n] = fr;
                }
                continue;
            }
            if fr < values[n - 1] {
                points[n] = xr;
                values[n] = fr;
                continue;
            }

            let (xc, accept_below) = if fr < f_worst {
                (self.combine(&centroid, &xr, CONTRACT), fr)
            } else {
                (self.combine(&centroid, &worst, CONTRACT), f_worst)
            };
            let Some(fc) = monitor.evaluate(f, &xc)? else {
                return Ok(false);
            };
            if fc < accept_below {
                points[n] = xc;
                values[n] = fc;
                continue;
            }

            let best = points[0].clone();
            for i in 1..=n {
                points[i] = self.combine(&best, &points[i], SHRINK);
                match monitor.evaluate(f, &points[i])? {
                    Some(v) => values[i] = v,
                    None => return Ok(false),
                }
            }
        }
    }
}
