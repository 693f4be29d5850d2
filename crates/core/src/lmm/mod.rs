pub mod deviance;
pub mod factor;
pub mod linear;
pub mod options;
pub mod optsum;
pub mod result;

pub use factor::BlockedFactor;
pub use linear::LinearMixedModel;
pub use options::FitOptions;
pub use optsum::OptSummary;
pub use result::{FitResult, NamedEffect, RandomEffectBlock};
