use indexmap::IndexMap;

use super::factor::GroupingFactor;
use crate::error::{LmmError, Result};

/// A single column of a [`DataFrame`].
#[derive(Debug, Clone)]
pub enum Column {
    /// Numeric values (responses, covariates, weights).
    Float(Vec<f64>),
    /// Categorical values usable as grouping factors.
    Factor(GroupingFactor),
}

impl Column {
    pub fn len(&self) -> usize {
        match self {
            Column::Float(v) => v.len(),
            Column::Factor(f) => f.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Columnar table feeding the design helpers. All columns share one row count.
#[derive(Debug, Clone, Default)]
pub struct DataFrame {
    pub(crate) columns: IndexMap<String, Column>,
    pub(crate) nrows: usize,
}

impl DataFrame {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a numeric column.
    ///
    /// # Errors
    /// Fails on a duplicate name or a row count that differs from the
    /// columns already present.
    pub fn add_float_column(&mut self, name: &str, data: Vec<f64>) -> Result<()> {
        self.insert_column(name, Column::Float(data))
    }

    /// Add a categorical column; levels are discovered in order of appearance.
    pub fn add_factor_column<S: AsRef<str>>(&mut self, name: &str, data: &[S]) -> Result<()> {
        self.insert_column(name, Column::Factor(GroupingFactor::new(data)))
    }

    pub fn get_column(&self, name: &str) -> Result<&Column> {
        self.columns
            .get(name)
            .ok_or_else(|| LmmError::ColumnNotFound(name.to_string()))
    }

    /// Numeric column as a slice.
    pub fn get_float(&self, name: &str) -> Result<&[f64]> {
        match self.get_column(name)? {
            Column::Float(v) => Ok(v.as_slice()),
            Column::Factor(_) => Err(LmmError::Data(format!(
                "Column '{}' is categorical, expected numeric values",
                name
            ))),
        }
    }

    /// A column interpreted as a grouping factor.
    ///
    /// Numeric columns (e.g. integer subject ids) are accepted; each distinct
    /// value becomes a level, named by its shortest decimal form.
    pub fn grouping(&self, name: &str) -> Result<GroupingFactor> {
        match self.get_column(name)? {
            Column::Factor(f) => Ok(f.clone()),
            Column::Float(v) => {
                let labels: Vec<String> = v.iter().map(|x| format!("{}", x)).collect();
                Ok(GroupingFactor::new(&labels))
            }
        }
    }

    pub fn nrows(&self) -> usize {
        self.nrows
    }

    pub fn ncols(&self) -> usize {
        self.columns.len()
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.columns.keys().map(|s| s.as_str()).collect()
    }

    pub(crate) fn insert_column(&mut self, name: &str, column: Column) -> Result<()> {
        if self.columns.contains_key(name) {
            return Err(LmmError::Data(format!(
                "Column '{}' already exists in DataFrame",
                name
            )));
        }
        let len = column.len();
        if self.columns.is_empty() {
            self.nrows = len;
        } else if len != self.nrows {
            return Err(LmmError::DimensionMismatch {
                expected: self.nrows,
                got: len,
                context: format!("adding column '{}'", name),
            });
        }
        self.columns.insert(name.to_string(), column);
        Ok(())
    }
}
