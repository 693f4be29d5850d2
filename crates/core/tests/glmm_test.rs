//! Integration tests for generalized linear mixed models.

use nalgebra::{DMatrix, DVector};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};

use lmefit_core::bootstrap::{parametric_bootstrap, BootstrapOptions, ParameterKind};
use lmefit_core::glmm::{Family, GeneralizedLinearMixedModel};
use lmefit_core::lmm::{FitOptions, OptSummary};
use lmefit_core::model::{ModelMatrices, ReTerm};
use lmefit_core::{fit, LmmError, MixedModelFit};

/// Counts with a log-exposure offset: 50 groups of 8, β = (0.5, 0.3),
/// random-intercept SD 0.5.
fn poisson_data(seed: u64) -> ModelMatrices {
    let mut rng = StdRng::seed_from_u64(seed);
    let normal = Normal::new(0.0, 0.5).unwrap();
    let fam = Family::poisson();
    let (groups, per_group) = (50, 8);
    let n = groups * per_group;
    let b: Vec<f64> = (0..groups).map(|_| normal.sample(&mut rng)).collect();
    let mut x = DMatrix::from_element(n, 2, 1.0);
    let mut offset = DVector::zeros(n);
    let mut y = DVector::zeros(n);
    for i in 0..n {
        let xi: f64 = rng.gen_range(-1.0..1.0);
        let exposure: f64 = rng.gen_range(1.0..5.0);
        x[(i, 1)] = xi;
        offset[i] = exposure.ln();
        let mu = fam.linkinv(offset[i] + 0.5 + 0.3 * xi + b[i / per_group]);
        y[i] = fam.simulate(&mut rng, mu, 1.0).unwrap();
    }
    let refs = (0..n).map(|i| i / per_group).collect();
    let term = ReTerm::intercept("site", (0..groups).map(|g| format!("site{}", g)).collect(), refs).unwrap();
    ModelMatrices::new(x, vec!["(Intercept)".into(), "x".into()], vec![term], y)
        .unwrap()
        .with_offset(offset)
        .unwrap()
}

/// Successes out of `trials` per row, plus the same data expanded to one
/// Bernoulli row per trial.
fn binomial_pair(groups: usize, rows: usize, trials: usize, seed: u64) -> (ModelMatrices, ModelMatrices) {
    let mut rng = StdRng::seed_from_u64(seed);
    let normal = Normal::new(0.0, 0.8).unwrap();
    let fam = Family::binomial();
    let b: Vec<f64> = (0..groups).map(|_| normal.sample(&mut rng)).collect();
    let levels: Vec<String> = (0..groups).map(|g| format!("g{}", g)).collect();

    let (mut xs, mut props, mut refs) = (Vec::new(), Vec::new(), Vec::new());
    let (mut xs_long, mut ys_long, mut refs_long) = (Vec::new(), Vec::new(), Vec::new());
    for g in 0..groups {
        for r in 0..rows {
            let xi = r as f64 / rows as f64 - 0.5;
            let mu = fam.linkinv(-0.2 + 0.9 * xi + b[g]);
            let p = fam.simulate(&mut rng, mu, trials as f64).unwrap();
            let successes = (p * trials as f64).round() as usize;
            xs.push(xi);
            props.push(p);
            refs.push(g);
            for t in 0..trials {
                xs_long.push(xi);
                ys_long.push(if t < successes { 1.0 } else { 0.0 });
                refs_long.push(g);
            }
        }
    }

    let design = |xs: &[f64]| {
        let mut x = DMatrix::from_element(xs.len(), 2, 1.0);
        for (i, &v) in xs.iter().enumerate() {
            x[(i, 1)] = v;
        }
        x
    };
    let names = vec!["(Intercept)".to_string(), "x".to_string()];
    let n = props.len();
    let short = ModelMatrices::new(
        design(&xs),
        names.clone(),
        vec![ReTerm::intercept("g", levels.clone(), refs).unwrap()],
        DVector::from_vec(props),
    )
    .unwrap()
    .with_weights(DVector::from_element(n, trials as f64))
    .unwrap();
    let long = ModelMatrices::new(
        design(&xs_long),
        names,
        vec![ReTerm::intercept("g", levels, refs_long).unwrap()],
        DVector::from_vec(ys_long),
    )
    .unwrap();
    (short, long)
}

#[test]
fn test_poisson_with_offset_recovers_parameters() {
    let mut model = GeneralizedLinearMixedModel::new(poisson_data(11), Family::poisson()).unwrap();
    let res = model.fit(&FitOptions::default()).unwrap();
    assert!(res.converged);
    assert_eq!(res.family.as_deref(), Some("Poisson(log)"));
    let beta: Vec<f64> = res.fixed_effects.iter().map(|e| e.estimate).collect();
    assert!((beta[0] - 0.5).abs() < 0.25, "intercept {}", beta[0]);
    assert!((beta[1] - 0.3).abs() < 0.15, "slope {}", beta[1]);
    let sd = res.variance_components[0].std_devs[0];
    assert!(sd > 0.25 && sd < 0.8, "site sd {}", sd);
    assert!(res.fitted.iter().all(|&m| m > 0.0));
}

#[test]
fn test_binomial_proportions_match_expanded_bernoulli() {
    let (short, long) = binomial_pair(12, 4, 6, 21);
    let mut binomial = GeneralizedLinearMixedModel::new(short, Family::binomial()).unwrap();
    let mut bernoulli = GeneralizedLinearMixedModel::new(long, Family::bernoulli()).unwrap();
    let opts = FitOptions::default();

    // the two deviances differ by a constant that does not depend on θ
    let d1 = binomial.objective_at(&[0.4], &opts).unwrap() - bernoulli.objective_at(&[0.4], &opts).unwrap();
    let d2 = binomial.objective_at(&[1.3], &opts).unwrap() - bernoulli.objective_at(&[1.3], &opts).unwrap();
    assert!((d1 - d2).abs() < 1e-5, "offsets {} and {}", d1, d2);
    for (a, b) in binomial.beta().iter().zip(bernoulli.beta().iter()) {
        assert!((a - b).abs() < 1e-5);
    }
}

#[test]
fn test_adaptive_quadrature_fit() {
    let (short, _) = binomial_pair(30, 3, 5, 31);
    let mut laplace = GeneralizedLinearMixedModel::new(short.clone(), Family::binomial()).unwrap();
    let mut agq = GeneralizedLinearMixedModel::new(short, Family::binomial()).unwrap();
    let r_laplace = laplace.fit(&FitOptions::default().fast(true)).unwrap();
    let r_agq = agq.fit(&FitOptions::default().fast(true).nagq(7)).unwrap();

    assert_eq!(agq.nagq(), 7);
    assert_eq!(r_agq.optsum.options.nagq, 7);
    assert!(r_agq.objective != r_laplace.objective);
    assert!((r_agq.objective - r_laplace.objective).abs() < 0.02 * r_laplace.objective.abs());
    assert!((r_agq.theta[0] - r_laplace.theta[0]).abs() < 0.2);
}

#[test]
fn test_full_fit_optsum_round_trip() {
    let (short, _) = binomial_pair(20, 4, 4, 41);
    let fitted = fit(short.clone(), Some(Family::binomial()), &FitOptions::default()).unwrap();
    assert!(!fitted.is_linear());
    let result = fitted.result().clone();
    assert_eq!(result.optsum.final_params.len(), 3);
    assert_eq!(result.optsum.n_theta, 1);

    let mut buf = Vec::new();
    fitted.save_optsum(&mut buf).unwrap();
    let mut fresh = GeneralizedLinearMixedModel::new(short.clone(), Family::binomial()).unwrap();
    fresh.restore_optsum(buf.as_slice()).unwrap();
    let restored = fresh.result().unwrap();
    assert!((restored.objective - result.objective).abs() < 1e-6 * result.objective.abs());
    for (a, b) in restored.fixed_effects.iter().zip(&result.fixed_effects) {
        assert!((a.estimate - b.estimate).abs() < 1e-8);
    }

    // a tampered objective is caught on restore
    let mut optsum = OptSummary::load(buf.as_slice()).unwrap();
    optsum.fmin += 1.0;
    let mut tampered = Vec::new();
    optsum.save(&mut tampered).unwrap();
    let mut fresh = GeneralizedLinearMixedModel::new(short, Family::binomial()).unwrap();
    assert!(matches!(
        fresh.restore_optsum(tampered.as_slice()),
        Err(LmmError::RestoreMismatch { .. })
    ));
}

#[test]
fn test_gaussian_family_fits_linear_model() {
    let (short, _) = binomial_pair(10, 4, 3, 51);
    let fitted = fit(short, Some(Family::gaussian()), &FitOptions::default()).unwrap();
    assert!(matches!(fitted, MixedModelFit::Linear { .. }));
    assert!(fitted.result().sigma.is_some());
}

#[test]
fn test_glmm_bootstrap() {
    let mut model = GeneralizedLinearMixedModel::new(poisson_data(61), Family::poisson()).unwrap();
    model.fit(&FitOptions::default().fast(true)).unwrap();
    let boot = parametric_bootstrap(&model, 4, 7, &BootstrapOptions::default().threads(2)).unwrap();
    assert_eq!(boot.n_samples(), 4);
    assert_eq!(boot.n_failed(), 0);
    assert!(boot.records().all(|r| r.kind != ParameterKind::Sigma));
    let summary = boot.summarize(0.9);
    let slope = summary.iter().find(|s| s.parameter == "x").unwrap();
    assert_eq!(slope.n, 4);
    assert!(slope.lower <= slope.mean && slope.mean <= slope.upper);
}
