//! Parametric bootstrap: simulate responses from a fitted model, refit and
//! collect the estimates.

pub mod simulate;
pub mod table;

use nalgebra::DVector;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::{LmmError, Result};
use crate::lmm::{FitOptions, FitResult};

pub use table::{BootstrapRecord, ParameterKind, ParameterSummary};

/// A fitted model that can simulate new responses and be refitted to them.
pub trait Bootstrappable: Send + Sync {
    /// Result of the original fit; errors when the model is not fitted.
    fn fit_result(&self) -> Result<FitResult>;

    /// Approximate memory held by one refit.
    fn per_fit_bytes(&self) -> usize;

    /// Draw a response from the fitted model.
    fn simulate_response(&self, rng: &mut StdRng) -> Result<DVector<f64>>;

    /// Fit the same model to a new response.
    fn refit(&self, y: DVector<f64>, options: &FitOptions) -> Result<FitResult>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BootstrapOptions {
    /// Worker threads; `None` uses rayon's default.
    pub threads: Option<usize>,
    /// Upper bound on memory used by concurrent refits, in bytes.
    pub memory_budget: usize,
    /// Coverage of the reported intervals.
    pub level: f64,
}

impl Default for BootstrapOptions {
    fn default() -> Self {
        Self {
            threads: None,
            memory_budget: 2 << 30,
            level: 0.95,
        }
    }
}

impl BootstrapOptions {
    pub fn threads(mut self, threads: usize) -> Self {
        self.threads = Some(threads);
        self
    }

    pub fn memory_budget(mut self, bytes: usize) -> Self {
        self.memory_budget = bytes;
        self
    }

    pub fn level(mut self, level: f64) -> Self {
        self.level = level;
        self
    }

    /// Pool size: requested threads capped by how many refits fit in the
    /// memory budget, never below one.
    pub fn pool_size(&self, per_fit_bytes: usize) -> usize {
        let requested = self.threads.unwrap_or_else(rayon::current_num_threads);
        let by_memory = self.memory_budget / per_fit_bytes.max(1);
        requested.min(by_memory).max(1)
    }
}

/// Outcome of one bootstrap draw.
#[derive(Debug, Clone, Serialize)]
pub enum SampleOutcome {
    Fitted {
        converged: bool,
        records: Vec<BootstrapRecord>,
    },
    Failed {
        error: String,
    },
}

impl SampleOutcome {
    pub fn is_failed(&self) -> bool {
        matches!(self, SampleOutcome::Failed { .. })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BootstrapResult {
    pub seed: u64,
    pub threads: usize,
    /// One outcome per sample, in sample order.
    pub samples: Vec<SampleOutcome>,
}

impl BootstrapResult {
    pub fn n_samples(&self) -> usize {
        self.samples.len()
    }

    pub fn n_failed(&self) -> usize {
        self.samples.iter().filter(|s| s.is_failed()).count()
    }

    /// Records of all successful samples, in sample order.
    pub fn records(&self) -> impl Iterator<Item = &BootstrapRecord> {
        self.samples.iter().flat_map(|s| match s {
            SampleOutcome::Fitted { records, .. } => records.as_slice(),
            SampleOutcome::Failed { .. } => &[],
        })
    }

    /// Per-parameter mean, standard deviation and shortest interval holding
    /// `level` of the draws. Failed samples are excluded.
    pub fn summarize(&self, level: f64) -> Vec<ParameterSummary> {
        table::summarize(self.records(), level)
    }
}

/// Simulate `n_samples` responses from `model`, refit each starting at the
/// fitted θ and collect the estimates.
///
/// Per-sample seeds are drawn up front from `seed`, so the outcome does not
/// depend on the number of threads.
pub fn parametric_bootstrap<M: Bootstrappable>(
    model: &M,
    n_samples: usize,
    seed: u64,
    options: &BootstrapOptions,
) -> Result<BootstrapResult> {
    let base = model.fit_result()?;
    let fit_options = base.optsum.options.clone().theta_start(base.theta.clone());

    let mut master = StdRng::seed_from_u64(seed);
    let seeds: Vec<u64> = (0..n_samples).map(|_| master.gen()).collect();

    let threads = options.pool_size(model.per_fit_bytes());
    log::info!(
        "parametric bootstrap: {} samples on {} threads ({} bytes per refit)",
        n_samples,
        threads,
        model.per_fit_bytes()
    );
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(threads)
        .build()
        .map_err(|e| LmmError::ThreadPool(format!("failed to create thread pool: {e}")))?;

    let samples: Vec<SampleOutcome> = pool.install(|| {
        seeds
            .par_iter()
            .enumerate()
            .map(|(i, &s)| run_sample(model, i, s, &fit_options))
            .collect()
    });

    let result = BootstrapResult {
        seed,
        threads,
        samples,
    };
    let failed = result.n_failed();
    if failed > 0 {
        log::warn!("{} of {} bootstrap refits failed", failed, n_samples);
    }
    Ok(result)
}

fn run_sample<M: Bootstrappable>(
    model: &M,
    sample: usize,
    seed: u64,
    options: &FitOptions,
) -> SampleOutcome {
    let mut rng = StdRng::seed_from_u64(seed);
    let fitted = model
        .simulate_response(&mut rng)
        .and_then(|y| model.refit(y, options));
    match fitted {
        Ok(res) => SampleOutcome::Fitted {
            converged: res.converged,
            records: table::records_from_result(sample, &res),
        },
        Err(e) => {
            log::debug!("bootstrap sample {} failed: {}", sample, e);
            SampleOutcome::Failed {
                error: e.to_string(),
            }
        }
    }
}
