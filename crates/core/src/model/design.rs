use std::str::FromStr;

use crate::data::{DataFrame, GroupingFactor};
use crate::error::{LmmError, Result};
use crate::types::DenseMatrix;
use crate::variance::{CovarianceStructure, Diagonal, Unstructured};

use super::matrices::ReTerm;

/// Description of one random-effects term in terms of data columns.
///
/// The textual form accepted by [`FromStr`] is
/// `GROUP`, `GROUP|SLOPE,SLOPE` or `GROUP||SLOPE,SLOPE`, where `GROUP` may be
/// an interaction `outer:inner` and `||` requests uncorrelated effects.
#[derive(Debug, Clone, PartialEq)]
pub struct RandomSpec {
    pub group: String,
    pub slopes: Vec<String>,
    pub intercept: bool,
    pub zerocorr: bool,
}

impl RandomSpec {
    /// Random intercept for `group`.
    pub fn intercept(group: &str) -> Self {
        Self {
            group: group.to_string(),
            slopes: Vec::new(),
            intercept: true,
            zerocorr: false,
        }
    }

    /// Add a random slope on a numeric column.
    pub fn slope(mut self, column: &str) -> Self {
        self.slopes.push(column.to_string());
        self
    }

    /// Drop the correlations between this term's random effects.
    pub fn zerocorr(mut self) -> Self {
        self.zerocorr = true;
        self
    }
}

impl FromStr for RandomSpec {
    type Err = LmmError;

    fn from_str(s: &str) -> Result<Self> {
        let (group, rest, zerocorr) = if let Some((g, r)) = s.split_once("||") {
            (g, Some(r), true)
        } else if let Some((g, r)) = s.split_once('|') {
            (g, Some(r), false)
        } else {
            (s, None, false)
        };
        let group = group.trim();
        if group.is_empty() {
            return Err(LmmError::ModelSpec(format!(
                "random term '{}' has no grouping factor",
                s
            )));
        }
        let mut spec = RandomSpec::intercept(group);
        spec.zerocorr = zerocorr;
        if let Some(rest) = rest {
            for slope in rest.split(',').map(str::trim).filter(|t| !t.is_empty()) {
                if slope == "0" {
                    spec.intercept = false;
                } else if slope != "1" {
                    spec.slopes.push(slope.to_string());
                }
            }
        }
        if !spec.intercept && spec.slopes.is_empty() {
            return Err(LmmError::ModelSpec(format!(
                "random term '{}' has no random effects",
                s
            )));
        }
        Ok(spec)
    }
}

/// Dense fixed-effects matrix from numeric columns, optionally with an
/// intercept column first.
pub fn build_fixed_matrix(
    df: &DataFrame,
    covariates: &[String],
    intercept: bool,
) -> Result<(DenseMatrix, Vec<String>)> {
    let n = df.nrows();
    if n == 0 {
        return Err(LmmError::Data("DataFrame has no observations".into()));
    }
    let p = covariates.len() + usize::from(intercept);
    if p == 0 {
        return Err(LmmError::ModelSpec("no fixed effects requested".into()));
    }
    let mut x = DenseMatrix::zeros(n, p);
    let mut names = Vec::with_capacity(p);
    let mut col = 0;
    if intercept {
        x.column_mut(0).fill(1.0);
        names.push("(Intercept)".to_string());
        col += 1;
    }
    for name in covariates {
        let values = df.get_float(name)?;
        x.column_mut(col).copy_from_slice(values);
        names.push(name.clone());
        col += 1;
    }
    Ok((x, names))
}

/// Grouping factor named by `group`, resolving `outer:inner` interactions.
pub fn grouping_factor(df: &DataFrame, group: &str) -> Result<GroupingFactor> {
    let mut parts = group.split(':').map(str::trim);
    let first = parts
        .next()
        .ok_or_else(|| LmmError::ModelSpec("empty grouping factor".into()))?;
    let mut factor = df.grouping(first)?;
    for part in parts {
        factor = GroupingFactor::interaction(&factor, &df.grouping(part)?);
    }
    Ok(factor)
}

/// Random-effects term for one [`RandomSpec`].
pub fn build_reterm(df: &DataFrame, spec: &RandomSpec) -> Result<ReTerm> {
    let factor = grouping_factor(df, &spec.group)?;
    let n = df.nrows();
    let q = spec.slopes.len() + usize::from(spec.intercept);
    let mut z = DenseMatrix::zeros(q, n);
    let mut cnames = Vec::with_capacity(q);
    let mut row = 0;
    if spec.intercept {
        z.row_mut(0).fill(1.0);
        cnames.push("(Intercept)".to_string());
        row += 1;
    }
    for slope in &spec.slopes {
        let values = df.get_float(slope)?;
        for (i, &v) in values.iter().enumerate() {
            z[(row, i)] = v;
        }
        cnames.push(slope.clone());
        row += 1;
    }
    let structure: Box<dyn CovarianceStructure> = if spec.zerocorr {
        Box::new(Diagonal::new(q))
    } else {
        Box::new(Unstructured::new(q))
    };
    ReTerm::new(
        &spec.group,
        factor.level_names(),
        factor.refs().to_vec(),
        cnames,
        z,
        structure,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_df() -> DataFrame {
        let mut df = DataFrame::new();
        df.add_float_column("y", vec![1.0, 2.0, 3.0, 4.0]).unwrap();
        df.add_float_column("days", vec![0.0, 1.0, 0.0, 1.0]).unwrap();
        df.add_factor_column("school", &["s1", "s1", "s2", "s2"]).unwrap();
        df.add_factor_column("class", &["a", "b", "a", "a"]).unwrap();
        df
    }

    #[test]
    fn test_parse_random_spec() {
        let s: RandomSpec = "subject".parse().unwrap();
        assert_eq!(s, RandomSpec::intercept("subject"));

        let s: RandomSpec = "subject|days".parse().unwrap();
        assert_eq!(s, RandomSpec::intercept("subject").slope("days"));

        let s: RandomSpec = "subject||days".parse().unwrap();
        assert!(s.zerocorr);
        assert_eq!(s.slopes, vec!["days"]);

        let s: RandomSpec = "subject|0,days".parse().unwrap();
        assert!(!s.intercept);

        assert!("subject|0".parse::<RandomSpec>().is_err());
        assert!("|days".parse::<RandomSpec>().is_err());
    }

    #[test]
    fn test_fixed_matrix() {
        let df = sample_df();
        let (x, names) = build_fixed_matrix(&df, &["days".to_string()], true).unwrap();
        assert_eq!(names, vec!["(Intercept)", "days"]);
        assert_eq!(x.column(0).as_slice(), &[1.0; 4]);
        assert_eq!(x.column(1).as_slice(), &[0.0, 1.0, 0.0, 1.0]);
    }

    #[test]
    fn test_slope_term() {
        let df = sample_df();
        let term = build_reterm(&df, &RandomSpec::intercept("school").slope("days")).unwrap();
        assert_eq!(term.q(), 2);
        assert_eq!(term.n_levels(), 2);
        assert_eq!(term.refs, vec![0, 0, 1, 1]);
        assert_eq!(term.z[(1, 1)], 1.0);
        assert_eq!(term.structure.name(), "Unstructured");
    }

    #[test]
    fn test_nested_group() {
        let df = sample_df();
        let term = build_reterm(&df, &RandomSpec::intercept("school:class")).unwrap();
        assert_eq!(term.levels, vec!["s1:a", "s1:b", "s2:a"]);
        assert_eq!(term.refs, vec![0, 1, 2, 2]);
    }

    #[test]
    fn test_slope_on_factor_column_fails() {
        let df = sample_df();
        let err = build_reterm(&df, &RandomSpec::intercept("school").slope("class")).unwrap_err();
        assert!(matches!(err, LmmError::Data(_)));
    }
}
