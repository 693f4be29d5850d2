use crate::data::DataFrame;
use crate::error::{LmmError, Result};
use crate::types::DenseVector;

use super::design::{build_fixed_matrix, build_reterm, RandomSpec};
use super::matrices::ModelMatrices;

/// Builder assembling [`ModelMatrices`] from named data columns.
///
/// ```
/// use lmefit_core::data::DataFrame;
/// use lmefit_core::model::{ModelBuilder, RandomSpec};
///
/// let mut df = DataFrame::new();
/// df.add_float_column("y", vec![1.0, 2.0, 3.0, 5.0]).unwrap();
/// df.add_factor_column("g", &["a", "a", "b", "b"]).unwrap();
/// let m = ModelBuilder::new()
///     .data(&df)
///     .response("y")
///     .random(RandomSpec::intercept("g"))
///     .build()
///     .unwrap();
/// assert_eq!(m.n_fixed(), 1);
/// ```
pub struct ModelBuilder<'a> {
    data: Option<&'a DataFrame>,
    response: Option<String>,
    covariates: Vec<String>,
    intercept: bool,
    random: Vec<RandomSpec>,
    weights: Option<String>,
    offset: Option<String>,
}

impl<'a> ModelBuilder<'a> {
    pub fn new() -> Self {
        Self {
            data: None,
            response: None,
            covariates: Vec::new(),
            intercept: true,
            random: Vec::new(),
            weights: None,
            offset: None,
        }
    }

    pub fn data(mut self, df: &'a DataFrame) -> Self {
        self.data = Some(df);
        self
    }

    pub fn response(mut self, col: &str) -> Self {
        self.response = Some(col.to_string());
        self
    }

    /// Add a numeric fixed-effect covariate.
    pub fn fixed(mut self, col: &str) -> Self {
        self.covariates.push(col.to_string());
        self
    }

    /// Include or drop the intercept column (included by default).
    pub fn intercept(mut self, yes: bool) -> Self {
        self.intercept = yes;
        self
    }

    pub fn random(mut self, spec: RandomSpec) -> Self {
        self.random.push(spec);
        self
    }

    /// Column of prior weights (binomial trials, precision weights).
    pub fn weights(mut self, col: &str) -> Self {
        self.weights = Some(col.to_string());
        self
    }

    pub fn offset(mut self, col: &str) -> Self {
        self.offset = Some(col.to_string());
        self
    }

    pub fn build(self) -> Result<ModelMatrices> {
        let df = self
            .data
            .ok_or_else(|| LmmError::ModelSpec("No data provided".into()))?;
        let response = self
            .response
            .ok_or_else(|| LmmError::ModelSpec("No response variable specified".into()))?;
        if df.nrows() == 0 {
            return Err(LmmError::ModelSpec("DataFrame is empty".into()));
        }

        let y = DenseVector::from_column_slice(df.get_float(&response)?);
        let (x, xnames) = build_fixed_matrix(df, &self.covariates, self.intercept)?;
        let reterms = self
            .random
            .iter()
            .map(|spec| build_reterm(df, spec))
            .collect::<Result<Vec<_>>>()?;

        let mut matrices = ModelMatrices::new(x, xnames, reterms, y)?;
        if let Some(col) = self.weights {
            matrices = matrices.with_weights(DenseVector::from_column_slice(df.get_float(&col)?))?;
        }
        if let Some(col) = self.offset {
            matrices = matrices.with_offset(DenseVector::from_column_slice(df.get_float(&col)?))?;
        }
        Ok(matrices)
    }
}

impl<'a> Default for ModelBuilder<'a> {
    fn default() -> Self {
        Self::new()
    }
}
