mod diagonal;
mod parameterization;
mod traits;
mod unstructured;

pub use diagonal::Diagonal;
pub use parameterization::{Parameterization, VarianceComponent, SINGULAR_TOL};
pub use traits::CovarianceStructure;
pub use unstructured::Unstructured;
