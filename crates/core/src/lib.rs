//! Profiled-likelihood engine for linear and generalized linear mixed models.
//!
//! Model matrices go in; a blocked sparse Cholesky factorization of the
//! penalized system is updated for every covariance parameter vector θ the
//! optimizer proposes, and the profiled deviance is read off the factor.

pub mod bootstrap;
pub mod data;
pub mod error;
mod fit;
pub mod glmm;
pub mod lmm;
pub mod matrix;
pub mod model;
pub mod optim;
pub mod types;
pub mod variance;

pub use bootstrap::{parametric_bootstrap, BootstrapOptions, BootstrapResult, Bootstrappable};
pub use error::{LmmError, Result};
pub use fit::{fit, MixedModelFit};
pub use glmm::{Family, GeneralizedLinearMixedModel};
pub use lmm::{FitOptions, FitResult, LinearMixedModel, OptSummary};
pub use model::{ModelMatrices, ReTerm};
