use std::fmt;
use std::str::FromStr;

use rand::Rng;
use rand_distr::{Bernoulli, Binomial, Distribution as _, Poisson};
use serde::{Deserialize, Serialize};
use statrs::function::erf::{erfc, erfc_inv};
use statrs::function::gamma::ln_gamma;

use crate::error::{LmmError, Result};

/// Conditional distribution of the response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Distribution {
    Gaussian,
    Bernoulli,
    /// Proportions, with the number of trials supplied as prior weights.
    Binomial,
    Poisson,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Link {
    Identity,
    Logit,
    Probit,
    Cloglog,
    Log,
    Sqrt,
}

/// Response distribution together with its link function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Family {
    pub dist: Distribution,
    pub link: Link,
}

const MU_EPS: f64 = f64::EPSILON;

fn y_log_y(y: f64, mu: f64) -> f64 {
    if y == 0.0 {
        0.0
    } else {
        y * (y / mu).ln()
    }
}

fn std_normal_cdf(x: f64) -> f64 {
    0.5 * erfc(-x / std::f64::consts::SQRT_2)
}

fn std_normal_pdf(x: f64) -> f64 {
    (-0.5 * x * x).exp() / (2.0 * std::f64::consts::PI).sqrt()
}

fn std_normal_quantile(p: f64) -> f64 {
    -std::f64::consts::SQRT_2 * erfc_inv(2.0 * p)
}

impl Link {
    pub fn canonical(dist: Distribution) -> Self {
        match dist {
            Distribution::Gaussian => Link::Identity,
            Distribution::Bernoulli | Distribution::Binomial => Link::Logit,
            Distribution::Poisson => Link::Log,
        }
    }
}

impl Family {
    /// Family with the canonical link.
    pub fn new(dist: Distribution) -> Self {
        Self {
            dist,
            link: Link::canonical(dist),
        }
    }

    /// Family with an explicit link; rejects links that cannot map onto the
    /// distribution's mean range.
    pub fn with_link(dist: Distribution, link: Link) -> Result<Self> {
        let ok = match dist {
            Distribution::Gaussian => link == Link::Identity,
            Distribution::Bernoulli | Distribution::Binomial => {
                matches!(link, Link::Logit | Link::Probit | Link::Cloglog | Link::Log)
            }
            Distribution::Poisson => matches!(link, Link::Log | Link::Sqrt | Link::Identity),
        };
        if !ok {
            return Err(LmmError::ModelSpec(format!(
                "link {} is not supported for the {:?} distribution",
                link, dist
            )));
        }
        Ok(Self { dist, link })
    }

    pub fn bernoulli() -> Self {
        Self::new(Distribution::Bernoulli)
    }

    pub fn binomial() -> Self {
        Self::new(Distribution::Binomial)
    }

    pub fn poisson() -> Self {
        Self::new(Distribution::Poisson)
    }

    pub fn gaussian() -> Self {
        Self::new(Distribution::Gaussian)
    }

    /// Gaussian with the identity link: fitted as a linear mixed model.
    pub fn is_linear(&self) -> bool {
        self.dist == Distribution::Gaussian && self.link == Link::Identity
    }

    /// η = g(μ).
    pub fn link(&self, mu: f64) -> f64 {
        match self.link {
            Link::Identity => mu,
            Link::Logit => (mu / (1.0 - mu)).ln(),
            Link::Probit => std_normal_quantile(mu),
            Link::Cloglog => (-(1.0 - mu).ln()).ln(),
            Link::Log => mu.ln(),
            Link::Sqrt => mu.sqrt(),
        }
    }

    /// μ = g⁻¹(η), kept inside the open mean range.
    pub fn linkinv(&self, eta: f64) -> f64 {
        let mu = match self.link {
            Link::Identity => eta,
            Link::Logit => {
                if eta >= 0.0 {
                    1.0 / (1.0 + (-eta).exp())
                } else {
                    let e = eta.exp();
                    e / (1.0 + e)
                }
            }
            Link::Probit => std_normal_cdf(eta),
            Link::Cloglog => -(-eta.exp()).exp_m1(),
            Link::Log => eta.exp(),
            Link::Sqrt => eta * eta,
        };
        match self.dist {
            Distribution::Bernoulli | Distribution::Binomial => mu.clamp(MU_EPS, 1.0 - MU_EPS),
            Distribution::Poisson => mu.max(MU_EPS),
            Distribution::Gaussian => mu,
        }
    }

    /// dμ/dη.
    pub fn mu_eta(&self, eta: f64) -> f64 {
        match self.link {
            Link::Identity => 1.0,
            Link::Logit => {
                let e = (-eta.abs()).exp();
                (e / ((1.0 + e) * (1.0 + e))).max(MU_EPS)
            }
            Link::Probit => std_normal_pdf(eta).max(MU_EPS),
            Link::Cloglog => (eta - eta.exp()).exp().max(MU_EPS),
            Link::Log => eta.exp().max(MU_EPS),
            Link::Sqrt => 2.0 * eta,
        }
    }

    /// Variance function V(μ).
    pub fn variance(&self, mu: f64) -> f64 {
        match self.dist {
            Distribution::Gaussian => 1.0,
            Distribution::Bernoulli | Distribution::Binomial => mu * (1.0 - mu),
            Distribution::Poisson => mu,
        }
    }

    /// Unit deviance of one observation, times its prior weight.
    pub fn devresid(&self, y: f64, mu: f64, wt: f64) -> f64 {
        let unit = match self.dist {
            Distribution::Gaussian => (y - mu).powi(2),
            Distribution::Bernoulli | Distribution::Binomial => {
                2.0 * (y_log_y(y, mu) + y_log_y(1.0 - y, 1.0 - mu))
            }
            Distribution::Poisson => 2.0 * (y_log_y(y, mu) - (y - mu)),
        };
        wt * unit
    }

    /// Conditional log density of one observation. Gaussian uses unit
    /// variance.
    pub fn log_density(&self, y: f64, mu: f64, wt: f64) -> f64 {
        match self.dist {
            Distribution::Gaussian => {
                -0.5 * wt * ((y - mu).powi(2) + (2.0 * std::f64::consts::PI).ln())
            }
            Distribution::Bernoulli => {
                wt * if y > 0.5 { mu.ln() } else { (1.0 - mu).ln() }
            }
            Distribution::Binomial => {
                let n = wt;
                let k = (wt * y).round();
                ln_gamma(n + 1.0) - ln_gamma(k + 1.0) - ln_gamma(n - k + 1.0)
                    + k * mu.ln()
                    + (n - k) * (1.0 - mu).ln()
            }
            Distribution::Poisson => wt * (y * mu.ln() - mu - ln_gamma(y + 1.0)),
        }
    }

    /// Starting mean for IRLS.
    pub fn init_mu(&self, y: f64, wt: f64) -> f64 {
        match self.dist {
            Distribution::Gaussian => y,
            Distribution::Bernoulli | Distribution::Binomial => (wt * y + 0.5) / (wt + 1.0),
            Distribution::Poisson => y + 0.1,
        }
    }

    /// Check that every response value lies in the distribution's support.
    pub fn validate_response(&self, y: &[f64]) -> Result<()> {
        let bad = y.iter().position(|&v| {
            !v.is_finite()
                || match self.dist {
                    Distribution::Gaussian => false,
                    Distribution::Bernoulli => v != 0.0 && v != 1.0,
                    Distribution::Binomial => !(0.0..=1.0).contains(&v),
                    Distribution::Poisson => v < 0.0 || v.fract() != 0.0,
                }
        });
        match bad {
            Some(i) => Err(LmmError::Data(format!(
                "response value {} at row {} is outside the support of {}",
                y[i], i, self
            ))),
            None => Ok(()),
        }
    }

    /// Draw a response with mean `mu`. For binomial responses `wt` is the
    /// number of trials and the draw is a proportion.
    pub fn simulate<R: Rng + ?Sized>(&self, rng: &mut R, mu: f64, wt: f64) -> Result<f64> {
        let bad = |e: String| LmmError::Data(format!("cannot simulate from {}: {}", self, e));
        match self.dist {
            Distribution::Bernoulli => {
                let d = Bernoulli::new(mu).map_err(|e| bad(e.to_string()))?;
                Ok(if d.sample(rng) { 1.0 } else { 0.0 })
            }
            Distribution::Binomial => {
                let n = wt.round().max(1.0) as u64;
                let d = Binomial::new(n, mu).map_err(|e| bad(e.to_string()))?;
                Ok(d.sample(rng) as f64 / n as f64)
            }
            Distribution::Poisson => {
                let d = Poisson::new(mu).map_err(|e| bad(e.to_string()))?;
                Ok(d.sample(rng))
            }
            Distribution::Gaussian => Err(bad(
                "Gaussian responses are simulated by the linear model".into(),
            )),
        }
    }
}

impl fmt::Display for Link {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Link::Identity => "identity",
            Link::Logit => "logit",
            Link::Probit => "probit",
            Link::Cloglog => "cloglog",
            Link::Log => "log",
            Link::Sqrt => "sqrt",
        };
        f.write_str(s)
    }
}

impl fmt::Display for Family {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}({})", self.dist, self.link)
    }
}

impl FromStr for Distribution {
    type Err = LmmError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "gaussian" | "normal" => Ok(Distribution::Gaussian),
            "bernoulli" => Ok(Distribution::Bernoulli),
            "binomial" => Ok(Distribution::Binomial),
            "poisson" => Ok(Distribution::Poisson),
            other => Err(LmmError::ModelSpec(format!("unknown distribution '{}'", other))),
        }
    }
}

impl FromStr for Link {
    type Err = LmmError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "identity" => Ok(Link::Identity),
            "logit" => Ok(Link::Logit),
            "probit" => Ok(Link::Probit),
            "cloglog" => Ok(Link::Cloglog),
            "log" => Ok(Link::Log),
            "sqrt" => Ok(Link::Sqrt),
            other => Err(LmmError::ModelSpec(format!("unknown link '{}'", other))),
        }
    }
}

/// `dist` or `dist:link`, e.g. `poisson` or `bernoulli:probit`.
impl FromStr for Family {
    type Err = LmmError;

    fn from_str(s: &str) -> Result<Self> {
        match s.split_once(':') {
            Some((d, l)) => Family::with_link(d.parse()?, l.parse()?),
            None => Ok(Family::new(s.parse()?)),
        }
    }
}
