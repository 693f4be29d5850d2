use nalgebra::{DMatrix, DVector};
use rand::rngs::StdRng;
use rand::Rng;
use rand_distr::StandardNormal;

use crate::error::Result;
use crate::glmm::GeneralizedLinearMixedModel;
use crate::lmm::{FitOptions, FitResult, LinearMixedModel};
use crate::model::ReTerm;

use super::Bootstrappable;

/// b_k = scale · λ_k V with V standard normal, q × ℓ per term.
fn draw_effects(
    rng: &mut StdRng,
    terms: &[ReTerm],
    lambdas: &[DMatrix<f64>],
    scale: f64,
) -> Vec<DMatrix<f64>> {
    terms
        .iter()
        .zip(lambdas)
        .map(|(term, lambda)| {
            let v = DMatrix::from_fn(term.q(), term.n_levels(), |_, _| rng.sample::<f64, _>(StandardNormal));
            lambda * v * scale
        })
        .collect()
}

impl Bootstrappable for LinearMixedModel {
    fn fit_result(&self) -> Result<FitResult> {
        self.result()
    }

    fn per_fit_bytes(&self) -> usize {
        let n = self.n_obs();
        self.fill_in_report().total_bytes + 8 * n * (self.n_fixed() + 3)
    }

    /// y = Xβ + Zb + σε, b ~ N(0, σ²ΛΛ'); ε is scaled by 1/√w under prior
    /// weights.
    fn simulate_response(&self, rng: &mut StdRng) -> Result<DVector<f64>> {
        let beta = self.beta()?;
        let sigma = self.sigma();
        let lambdas = self.parameterization().factors(self.theta());
        let b = draw_effects(rng, self.reterms(), &lambdas, sigma);
        let mut y = self.linear_predictor(&beta, &b);
        let weights = self.matrices().weights.as_ref();
        for i in 0..y.len() {
            let e: f64 = rng.sample(StandardNormal);
            let scale = weights.map_or(1.0, |w| 1.0 / w[i].sqrt());
            y[i] += sigma * scale * e;
        }
        Ok(y)
    }

    fn refit(&self, y: DVector<f64>, options: &FitOptions) -> Result<FitResult> {
        let mut model = self.with_response(y)?;
        model.fit(options)
    }
}

impl Bootstrappable for GeneralizedLinearMixedModel {
    fn fit_result(&self) -> Result<FitResult> {
        self.result()
    }

    fn per_fit_bytes(&self) -> usize {
        // reweighting copies the shared random-effects crossproducts
        let n = self.linear_model().n_obs();
        2 * self.linear_model().fill_in_report().total_bytes + 8 * n * (self.n_fixed() + 6)
    }

    /// η = Xβ + Zb, b ~ N(0, ΛΛ'), then a response draw from the family.
    fn simulate_response(&self, rng: &mut StdRng) -> Result<DVector<f64>> {
        let lmm = self.linear_model();
        let lambdas = lmm.parameterization().factors(self.theta());
        let b = draw_effects(rng, lmm.reterms(), &lambdas, 1.0);
        let eta = lmm.linear_predictor(self.beta(), &b);
        let family = self.family();
        let weights = self.prior_weights();
        let mut y = DVector::zeros(eta.len());
        for i in 0..eta.len() {
            y[i] = family.simulate(rng, family.linkinv(eta[i]), weights[i])?;
        }
        Ok(y)
    }

    fn refit(&self, y: DVector<f64>, options: &FitOptions) -> Result<FitResult> {
        let mut model = self.with_response(y)?;
        model.fit(options)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bootstrap::{parametric_bootstrap, BootstrapOptions, ParameterKind};
    use crate::model::ModelMatrices;
    use rand::SeedableRng;

    fn grouped(a: usize, m: usize) -> ModelMatrices {
        let n = a * m;
        let mut rng = StdRng::seed_from_u64(11);
        let b: Vec<f64> = (0..a).map(|_| rng.sample::<f64, _>(StandardNormal)).collect();
        let y = DVector::from_fn(n, |i, _| {
            5.0 + 1.5 * b[i / m] + rng.sample::<f64, _>(StandardNormal)
        });
        let refs = (0..n).map(|i| i / m).collect();
        let term = ReTerm::intercept("g", (0..a).map(|l| format!("g{}", l)).collect(), refs).unwrap();
        ModelMatrices::new(
            DMatrix::from_element(n, 1, 1.0),
            vec!["(Intercept)".into()],
            vec![term],
            y,
        )
        .unwrap()
    }

    #[test]
    fn test_simulated_response_is_reproducible() {
        let mut model = LinearMixedModel::new(grouped(10, 5)).unwrap();
        model.fit(&FitOptions::default()).unwrap();
        let y1 = model.simulate_response(&mut StdRng::seed_from_u64(5)).unwrap();
        let y2 = model.simulate_response(&mut StdRng::seed_from_u64(5)).unwrap();
        let y3 = model.simulate_response(&mut StdRng::seed_from_u64(6)).unwrap();
        assert_eq!(y1, y2);
        assert!(y1 != y3);
        assert_eq!(y1.len(), 50);
    }

    #[test]
    fn test_bootstrap_independent_of_threads() {
        let mut model = LinearMixedModel::new(grouped(12, 4)).unwrap();
        model.fit(&FitOptions::default()).unwrap();
        let one = parametric_bootstrap(&model, 6, 42, &BootstrapOptions::default().threads(1)).unwrap();
        let four = parametric_bootstrap(&model, 6, 42, &BootstrapOptions::default().threads(4)).unwrap();
        let r1: Vec<_> = one.records().cloned().collect();
        let r4: Vec<_> = four.records().cloned().collect();
        assert_eq!(r1, r4);
        assert_eq!(one.n_failed(), 0);
        // intercept, sigma, sd, theta, objective per sample
        assert_eq!(r1.len(), 6 * 5);
        assert!(r1.iter().any(|r| r.kind == ParameterKind::Sigma));
    }

    #[test]
    fn test_bootstrap_requires_fit() {
        let model = LinearMixedModel::new(grouped(4, 4)).unwrap();
        assert!(parametric_bootstrap(&model, 2, 1, &BootstrapOptions::default()).is_err());
    }
}
