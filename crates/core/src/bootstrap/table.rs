use std::io::Write;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::lmm::FitResult;

use super::BootstrapResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ParameterKind {
    FixedEffect,
    Sigma,
    StdDev,
    Correlation,
    Theta,
    Objective,
}

/// One row of the bootstrap table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BootstrapRecord {
    pub sample: usize,
    pub parameter: String,
    pub value: f64,
    pub kind: ParameterKind,
}

#[derive(Debug, Clone, Serialize)]
pub struct ParameterSummary {
    pub parameter: String,
    pub kind: ParameterKind,
    pub n: usize,
    pub mean: f64,
    pub std_dev: f64,
    pub lower: f64,
    pub upper: f64,
}

/// Flatten a fit into table rows.
pub fn records_from_result(sample: usize, res: &FitResult) -> Vec<BootstrapRecord> {
    let mut out = Vec::new();
    let mut push = |parameter: String, value: f64, kind: ParameterKind| {
        out.push(BootstrapRecord {
            sample,
            parameter,
            value,
            kind,
        })
    };
    for ef in &res.fixed_effects {
        push(ef.name.clone(), ef.estimate, ParameterKind::FixedEffect);
    }
    if let Some(sigma) = res.sigma {
        push("residual".into(), sigma, ParameterKind::Sigma);
    }
    for vc in &res.variance_components {
        for (name, sd) in vc.names.iter().zip(&vc.std_devs) {
            push(format!("{}: {}", vc.group, name), *sd, ParameterKind::StdDev);
        }
        for i in 0..vc.names.len() {
            for j in 0..i {
                push(
                    format!("{}: corr({}, {})", vc.group, vc.names[i], vc.names[j]),
                    vc.correlations[i][j],
                    ParameterKind::Correlation,
                );
            }
        }
    }
    for (name, &t) in res.theta_names.iter().zip(&res.theta) {
        push(name.clone(), t, ParameterKind::Theta);
    }
    push("objective".into(), res.objective, ParameterKind::Objective);
    out
}

/// Shortest interval covering `ceil(level * n)` of the sorted values.
pub fn shortest_interval(sorted: &[f64], level: f64) -> (f64, f64) {
    let n = sorted.len();
    if n == 0 {
        return (f64::NAN, f64::NAN);
    }
    let k = ((level.clamp(0.0, 1.0) * n as f64).ceil() as usize).clamp(1, n);
    let mut best = (sorted[0], sorted[k - 1]);
    for i in 1..=n - k {
        let (lo, hi) = (sorted[i], sorted[i + k - 1]);
        if hi - lo < best.1 - best.0 {
            best = (lo, hi);
        }
    }
    best
}

pub fn summarize<'a, I>(records: I, level: f64) -> Vec<ParameterSummary>
where
    I: IntoIterator<Item = &'a BootstrapRecord>,
{
    let mut groups: IndexMap<(String, ParameterKind), Vec<f64>> = IndexMap::new();
    for r in records {
        if r.value.is_finite() {
            groups
                .entry((r.parameter.clone(), r.kind))
                .or_default()
                .push(r.value);
        }
    }
    groups
        .into_iter()
        .map(|((parameter, kind), mut values)| {
            values.sort_by(f64::total_cmp);
            let n = values.len();
            let mean = values.iter().sum::<f64>() / n as f64;
            let std_dev = if n > 1 {
                (values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1) as f64).sqrt()
            } else {
                0.0
            };
            let (lower, upper) = shortest_interval(&values, level);
            ParameterSummary {
                parameter,
                kind,
                n,
                mean,
                std_dev,
                lower,
                upper,
            }
        })
        .collect()
}

impl BootstrapResult {
    /// One CSV row per (sample, parameter) of the successful samples.
    pub fn write_csv<W: Write>(&self, writer: W) -> Result<()> {
        let mut wtr = csv::Writer::from_writer(writer);
        for rec in self.records() {
            wtr.serialize(rec)?;
        }
        wtr.flush()?;
        Ok(())
    }

    pub fn write_json<W: Write>(&self, writer: W) -> Result<()> {
        serde_json::to_writer_pretty(writer, self)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bootstrap::SampleOutcome;
    use approx::assert_relative_eq;

    fn record(sample: usize, parameter: &str, value: f64) -> BootstrapRecord {
        BootstrapRecord {
            sample,
            parameter: parameter.into(),
            value,
            kind: ParameterKind::FixedEffect,
        }
    }

    #[test]
    fn test_shortest_interval() {
        let v = [0.0, 1.0, 1.1, 1.2, 1.3, 5.0];
        assert_eq!(shortest_interval(&v, 0.5), (1.0, 1.2));
        assert_eq!(shortest_interval(&v, 1.0), (0.0, 5.0));
        assert_eq!(shortest_interval(&[2.0], 0.95), (2.0, 2.0));
        assert!(shortest_interval(&[], 0.95).0.is_nan());
    }

    #[test]
    fn test_summarize_keeps_first_seen_order() {
        let recs = vec![
            record(0, "b", 1.0),
            record(0, "a", 10.0),
            record(1, "b", 3.0),
            record(1, "a", f64::NAN),
        ];
        let s = summarize(&recs, 0.95);
        assert_eq!(s.len(), 2);
        assert_eq!(s[0].parameter, "b");
        assert_eq!(s[0].n, 2);
        assert_relative_eq!(s[0].mean, 2.0);
        assert_relative_eq!(s[0].std_dev, 2f64.sqrt());
        assert_eq!(s[1].n, 1);
    }

    #[test]
    fn test_csv_output() {
        let result = BootstrapResult {
            seed: 3,
            threads: 1,
            samples: vec![
                SampleOutcome::Fitted {
                    converged: true,
                    records: vec![record(0, "x", 0.5)],
                },
                SampleOutcome::Failed {
                    error: "diverged".into(),
                },
            ],
        };
        let mut buf = Vec::new();
        result.write_csv(&mut buf).unwrap();
        let text = String::from_utf8(buf).unwrap();
        assert_eq!(text, "sample,parameter,value,kind\n0,x,0.5,FixedEffect\n");

        let mut json = Vec::new();
        result.write_json(&mut json).unwrap();
        let v: serde_json::Value = serde_json::from_slice(&json).unwrap();
        assert_eq!(v["samples"].as_array().unwrap().len(), 2);
    }
}
