mod builder;
mod design;
mod matrices;

pub use builder::ModelBuilder;
pub use design::{build_fixed_matrix, build_reterm, grouping_factor, RandomSpec};
pub use matrices::{ModelMatrices, ReTerm};
