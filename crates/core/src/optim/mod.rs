//! Bounded derivative-free minimization of the model objective.

pub mod convergence;
pub mod nelder_mead;

pub use convergence::{ConvergenceMonitor, OptimStatus, TraceEntry, INFEASIBLE_OBJECTIVE};
pub use nelder_mead::{NelderMead, OptimOutcome};
