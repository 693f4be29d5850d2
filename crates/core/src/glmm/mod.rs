//! Generalized linear mixed models: response families, PIRLS and the
//! Laplace / adaptive Gauss–Hermite deviance.

pub mod family;
pub mod generalized;
pub mod pirls;
pub mod quadrature;

pub use family::{Distribution, Family, Link};
pub use generalized::GeneralizedLinearMixedModel;
pub use quadrature::GaussHermite;
