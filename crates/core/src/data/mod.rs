mod dataframe;
mod factor;
mod io;

pub use dataframe::{Column, DataFrame};
pub use factor::GroupingFactor;
