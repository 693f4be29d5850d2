use std::io::Read;
use std::path::Path;

use crate::error::{LmmError, Result};

use super::dataframe::{Column, DataFrame};
use super::factor::GroupingFactor;

impl DataFrame {
    /// Read a CSV file with a header row.
    ///
    /// A column whose every field parses as `f64` becomes numeric, anything
    /// else becomes a grouping factor.
    pub fn from_csv<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = std::fs::File::open(path.as_ref())?;
        Self::from_reader(file)
    }

    /// Read CSV text from any reader.
    pub fn from_reader<R: Read>(reader: R) -> Result<Self> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(false)
            .trim(csv::Trim::All)
            .from_reader(reader);

        let headers: Vec<String> = reader.headers()?.iter().map(|h| h.to_string()).collect();
        let ncols = headers.len();
        let mut raw: Vec<Vec<String>> = vec![Vec::new(); ncols];

        for record in reader.records() {
            let record = record?;
            if record.len() != ncols {
                return Err(LmmError::Data(format!(
                    "Row has {} fields but header has {} columns",
                    record.len(),
                    ncols
                )));
            }
            for (i, field) in record.iter().enumerate() {
                raw[i].push(field.to_string());
            }
        }

        let mut df = DataFrame::new();
        if raw.first().map_or(true, |c| c.is_empty()) {
            return Ok(df);
        }

        for (header, values) in headers.iter().zip(raw.iter()) {
            let parsed: std::result::Result<Vec<f64>, _> =
                values.iter().map(|s| s.parse::<f64>()).collect();
            let column = match parsed {
                Ok(v) => Column::Float(v),
                Err(_) => Column::Factor(GroupingFactor::new(values)),
            };
            df.insert_column(header, column)?;
        }
        log::debug!(
            "read {} rows x {} columns from CSV",
            df.nrows(),
            df.ncols()
        );
        Ok(df)
    }
}
