use thiserror::Error;

#[derive(Error, Debug)]
pub enum LmmError {
    #[error("Data error: {0}")]
    Data(String),

    #[error("Column '{0}' not found in DataFrame")]
    ColumnNotFound(String),

    #[error("Dimension mismatch: expected {expected}, got {got} in {context}")]
    DimensionMismatch {
        expected: usize,
        got: usize,
        context: String,
    },

    #[error("Invalid covariance parameter: {0}")]
    InvalidParameter(String),

    #[error("Model specification error: {0}")]
    ModelSpec(String),

    #[error("Diagonal block {block} of the scaled system is not positive definite")]
    NonPositiveDefinite { block: usize },

    #[error("PIRLS diverged at iteration {iteration}: {reason}")]
    PirlsDivergence { iteration: usize, reason: String },

    #[error("Restored objective {recomputed} does not match stored objective {stored}")]
    RestoreMismatch { stored: f64, recomputed: f64 },

    #[error("Block structure error: {0}")]
    Structure(String),

    #[error("Thread pool error: {0}")]
    ThreadPool(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl LmmError {
    /// Numerical failures at a trial point. The optimizer turns these into a
    /// penalty objective instead of aborting the fit.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            LmmError::NonPositiveDefinite { .. } | LmmError::PirlsDivergence { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, LmmError>;
