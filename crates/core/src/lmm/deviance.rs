use std::f64::consts::PI;

use super::factor::BlockedFactor;

/// Profiled deviance of a linear mixed model at the θ the factor was
/// updated with.
///
/// ML:   logdet + n (1 + log(2π pwrss / n))
/// REML: logdet + log|L_X|² + (n - p)(1 + log(2π pwrss / (n - p)))
///
/// `sum_log_weights` is Σ log wᵢ over the prior weights (0 when unweighted).
pub fn profiled_deviance(
    factor: &BlockedFactor,
    n: usize,
    p: usize,
    reml: bool,
    sum_log_weights: f64,
) -> f64 {
    let dof = if reml { (n - p) as f64 } else { n as f64 };
    let mut value = factor.logdet() + dof * (1.0 + (2.0 * PI * factor.pwrss() / dof).ln());
    if reml {
        value += factor.logdet_fixed();
    }
    value - sum_log_weights
}

/// Residual variance estimate, pwrss / n (ML) or pwrss / (n - p) (REML).
pub fn sigma_squared(pwrss: f64, n: usize, p: usize, reml: bool) -> f64 {
    let dof = if reml { n - p } else { n };
    pwrss / dof as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_sigma_squared() {
        assert_relative_eq!(sigma_squared(12.0, 10, 2, false), 1.2);
        assert_relative_eq!(sigma_squared(12.0, 10, 2, true), 1.5);
    }
}
