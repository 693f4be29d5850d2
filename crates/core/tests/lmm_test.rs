//! Integration tests for linear mixed models.
//!
//! The main data set is a longitudinal design: 200 subjects measured at 10
//! time points with a correlated random intercept and slope per subject,
//! generated from known parameters so the fit can be checked against them.

use approx::assert_relative_eq;
use nalgebra::{DMatrix, DVector};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};

use lmefit_core::data::DataFrame;
use lmefit_core::lmm::{FitOptions, LinearMixedModel};
use lmefit_core::model::{ModelBuilder, ModelMatrices, RandomSpec, ReTerm};
use lmefit_core::variance::Unstructured;
use lmefit_core::LmmError;

const INTERCEPT: f64 = 35.0;
const SLOPE: f64 = 2.0;
const SIGMA: f64 = 1.5;
const SD_INTERCEPT: f64 = 2.0;
const SD_SLOPE: f64 = 0.3;
const CORR: f64 = -0.5;

/// Subject-level random intercept and slope on time.
fn longitudinal(n_subjects: usize, n_times: usize, seed: u64) -> ModelMatrices {
    let mut rng = StdRng::seed_from_u64(seed);
    let normal = Normal::new(0.0, 1.0).unwrap();
    let n = n_subjects * n_times;

    let mut y = DVector::zeros(n);
    let mut x = DMatrix::from_element(n, 2, 1.0);
    let mut z = DMatrix::from_element(2, n, 1.0);
    let mut refs = Vec::with_capacity(n);
    for s in 0..n_subjects {
        let z1 = normal.sample(&mut rng);
        let z2 = normal.sample(&mut rng);
        let b0 = SD_INTERCEPT * z1;
        let b1 = SD_SLOPE * (CORR * z1 + (1.0 - CORR * CORR).sqrt() * z2);
        for t in 0..n_times {
            let i = s * n_times + t;
            let time = t as f64;
            x[(i, 1)] = time;
            z[(1, i)] = time;
            refs.push(s);
            y[i] = INTERCEPT + b0 + (SLOPE + b1) * time + SIGMA * normal.sample(&mut rng);
        }
    }
    let term = ReTerm::new(
        "subject",
        (0..n_subjects).map(|s| format!("S{}", s)).collect(),
        refs,
        vec!["(Intercept)".into(), "time".into()],
        z,
        Box::new(Unstructured::new(2)),
    )
    .unwrap();
    ModelMatrices::new(x, vec!["(Intercept)".into(), "time".into()], vec![term], y).unwrap()
}

#[test]
fn test_recovers_generating_parameters() {
    let mut model = LinearMixedModel::new(longitudinal(200, 10, 2024)).unwrap();
    let res = model.fit(&FitOptions::default()).unwrap();

    assert!(res.converged, "fit should converge");
    assert!(!res.singular);
    let beta: Vec<f64> = res.fixed_effects.iter().map(|e| e.estimate).collect();
    assert!((beta[0] - INTERCEPT).abs() < 0.6, "intercept {}", beta[0]);
    assert!((beta[1] - SLOPE).abs() < 0.1, "slope {}", beta[1]);
    let sigma = res.sigma.unwrap();
    assert!((sigma - SIGMA).abs() < 0.15, "sigma {}", sigma);

    let vc = &res.variance_components[0];
    assert!((vc.std_devs[0] - SD_INTERCEPT).abs() < 0.5, "sd intercept {}", vc.std_devs[0]);
    assert!((vc.std_devs[1] - SD_SLOPE).abs() < 0.1, "sd slope {}", vc.std_devs[1]);
    assert!((vc.correlations[1][0] - CORR).abs() < 0.35, "corr {}", vc.correlations[1][0]);

    // standard errors shrink with 2000 observations
    assert!(res.fixed_effects.iter().all(|e| e.se > 0.0 && e.se < 0.5));
    assert_eq!(res.random_effects[0].levels.len(), 200);
    assert_eq!(res.random_effects[0].values[0].len(), 2);
}

#[test]
fn test_small_fit_from_data_frame() {
    let mut df = DataFrame::new();
    let y = vec![10.0, 12.0, 8.0, 10.5, 6.0, 8.5, 11.0, 12.5, 7.5, 9.0];
    df.add_float_column("yield", y).unwrap();
    df.add_factor_column("genotype", &["G1", "G1", "G2", "G2", "G3", "G3", "G4", "G4", "G5", "G5"])
        .unwrap();

    let matrices = ModelBuilder::new()
        .data(&df)
        .response("yield")
        .random(RandomSpec::intercept("genotype"))
        .build()
        .unwrap();
    let mut model = LinearMixedModel::new(matrices).unwrap();
    let res = model.fit(&FitOptions::default().reml(true)).unwrap();

    assert!(res.converged);
    assert!(res.reml);
    assert_relative_eq!(res.fixed_effects[0].estimate, 9.5, epsilon = 1e-6);
    // BLUPs keep the ranking of the genotype means
    let blup = |level: &str| {
        let block = &res.random_effects[0];
        let idx = block.levels.iter().position(|l| l == level).unwrap();
        block.values[idx][0]
    };
    assert!(blup("G4") > blup("G1"));
    assert!(blup("G1") > blup("G2"));
    assert!(blup("G2") > blup("G5"));
    assert!(blup("G5") > blup("G3"));
    assert!(res.summary().contains("genotype"));
}

#[test]
fn test_collinear_fixed_effects_are_a_model_error() {
    let mut df = DataFrame::new();
    df.add_float_column("y", vec![3.0, 4.5, 2.0, 5.5, 4.0, 6.0]).unwrap();
    df.add_float_column("dose", vec![1.0, 2.0, 3.0, 1.0, 2.0, 3.0]).unwrap();
    df.add_float_column("dose_mg", vec![10.0, 20.0, 30.0, 10.0, 20.0, 30.0]).unwrap();
    df.add_factor_column("plot", &["p1", "p1", "p1", "p2", "p2", "p2"]).unwrap();

    let err = ModelBuilder::new()
        .data(&df)
        .response("y")
        .fixed("dose")
        .fixed("dose_mg")
        .random(RandomSpec::intercept("plot"))
        .build()
        .unwrap_err();
    assert!(matches!(err, LmmError::ModelSpec(_)), "{:?}", err);
    assert!(!err.is_recoverable());
}

#[test]
fn test_theta_zero_is_ordinary_least_squares() {
    let mm = longitudinal(30, 5, 7);
    let x = mm.x().clone();
    let y = mm.y().clone();
    let n = y.len() as f64;
    let mut model = LinearMixedModel::new(mm).unwrap();
    let obj = model.objective_at(&[0.0, 0.0, 0.0]).unwrap();

    let xtx = x.transpose() * &x;
    let beta = xtx.cholesky().unwrap().solve(&(x.transpose() * &y));
    let rss = (&y - &x * &beta).norm_squared();
    let expected = n * (1.0 + (2.0 * std::f64::consts::PI * rss / n).ln());
    assert_relative_eq!(obj, expected, epsilon = 1e-8);
    let fitted_beta = model.beta().unwrap();
    assert_relative_eq!(fitted_beta[0], beta[0], epsilon = 1e-8);
    assert_relative_eq!(fitted_beta[1], beta[1], epsilon = 1e-8);
}

#[test]
fn test_observation_order_does_not_matter() {
    let mm = longitudinal(25, 6, 99);
    let n = mm.n_obs();
    // reverse the observations and relabel the subjects in reverse
    let perm: Vec<usize> = (0..n).rev().collect();
    let x = DMatrix::from_fn(n, 2, |i, j| mm.x()[(perm[i], j)]);
    let y = DVector::from_fn(n, |i, _| mm.y()[perm[i]]);
    let term = &mm.reterms()[0];
    let z = DMatrix::from_fn(2, n, |j, i| term.z()[(j, perm[i])]);
    let n_levels = term.n_levels();
    let refs = perm.iter().map(|&p| n_levels - 1 - term.refs()[p]).collect();
    let levels = term.levels().iter().rev().cloned().collect();
    let permuted_term = ReTerm::new(
        "subject",
        levels,
        refs,
        term.cnames().to_vec(),
        z,
        Box::new(Unstructured::new(2)),
    )
    .unwrap();
    let permuted = ModelMatrices::new(x, mm.xnames().to_vec(), vec![permuted_term], y).unwrap();

    let mut a = LinearMixedModel::new(mm).unwrap();
    let mut b = LinearMixedModel::new(permuted).unwrap();
    for theta in [[1.0, 0.0, 1.0], [0.7, -0.2, 0.1], [2.0, 0.5, 0.0]] {
        assert_relative_eq!(
            a.objective_at(&theta).unwrap(),
            b.objective_at(&theta).unwrap(),
            epsilon = 1e-8
        );
    }
    let ra = a.fit(&FitOptions::default()).unwrap();
    let rb = b.fit(&FitOptions::default()).unwrap();
    assert_relative_eq!(ra.objective, rb.objective, epsilon = 1e-6);
}

#[test]
fn test_fit_is_reproducible() {
    let mut a = LinearMixedModel::new(longitudinal(40, 5, 3)).unwrap();
    let mut b = LinearMixedModel::new(longitudinal(40, 5, 3)).unwrap();
    let ra = a.fit(&FitOptions::default()).unwrap();
    let rb = b.fit(&FitOptions::default()).unwrap();
    assert_eq!(ra.theta, rb.theta);
    assert_eq!(ra.objective, rb.objective);
    assert_eq!(ra.optsum.trace, rb.optsum.trace);
}

#[test]
fn test_singular_fit_is_flagged() {
    // every subject has the same residual pattern, so the subject means
    // carry no between-subject variation
    let n_subjects = 20;
    let n_times = 4;
    let n = n_subjects * n_times;
    let pattern = [0.3, -0.5, 0.4, -0.2];
    let y = DVector::from_fn(n, |i, _| 1.0 + 0.5 * (i % n_times) as f64 + pattern[i % n_times]);
    let refs = (0..n).map(|i| i / n_times).collect();
    let mut x = DMatrix::from_element(n, 2, 1.0);
    for i in 0..n {
        x[(i, 1)] = (i % n_times) as f64;
    }
    let term = ReTerm::intercept("subject", (0..n_subjects).map(|s| s.to_string()).collect(), refs).unwrap();
    let mm = ModelMatrices::new(x, vec!["(Intercept)".into(), "time".into()], vec![term], y).unwrap();
    let mut model = LinearMixedModel::new(mm).unwrap();
    let res = model.fit(&FitOptions::default()).unwrap();
    assert!(res.singular, "theta = {:?}", res.theta);
    assert_eq!(res.singular_terms, vec!["subject".to_string()]);
    assert!(res.summary().contains("Singular fit"));
}

#[test]
fn test_optsum_restore_through_file() {
    let mut model = LinearMixedModel::new(longitudinal(30, 4, 5)).unwrap();
    let res = model.fit(&FitOptions::default().thin(5)).unwrap();
    assert!(res.optsum.trace.iter().all(|t| (t.feval - 1) % 5 == 0));
    assert_eq!(res.optsum.trace[0].feval, 1);

    let path = std::env::temp_dir().join(format!("lmefit-optsum-{}.json", std::process::id()));
    model
        .save_optsum(std::fs::File::create(&path).unwrap())
        .unwrap();
    let mut fresh = LinearMixedModel::new(longitudinal(30, 4, 5)).unwrap();
    fresh
        .restore_optsum(std::fs::File::open(&path).unwrap())
        .unwrap();
    std::fs::remove_file(&path).ok();

    assert_eq!(fresh.theta(), res.theta.as_slice());
    let restored = fresh.result().unwrap();
    assert_relative_eq!(restored.objective, res.objective, epsilon = 1e-10);
    assert_eq!(restored.optsum.feval, res.optsum.feval);
}
