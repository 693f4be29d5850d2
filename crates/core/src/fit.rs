use crate::error::Result;
use crate::glmm::{Family, GeneralizedLinearMixedModel};
use crate::lmm::{FitOptions, FitResult, LinearMixedModel};
use crate::model::ModelMatrices;

/// A fitted model of either kind together with its result.
#[derive(Debug, Clone)]
pub enum MixedModelFit {
    Linear {
        model: LinearMixedModel,
        result: FitResult,
    },
    Generalized {
        model: GeneralizedLinearMixedModel,
        result: FitResult,
    },
}

impl MixedModelFit {
    pub fn result(&self) -> &FitResult {
        match self {
            MixedModelFit::Linear { result, .. } | MixedModelFit::Generalized { result, .. } => result,
        }
    }

    pub fn is_linear(&self) -> bool {
        matches!(self, MixedModelFit::Linear { .. })
    }

    pub fn save_optsum<W: std::io::Write>(&self, writer: W) -> Result<()> {
        match self {
            MixedModelFit::Linear { model, .. } => model.save_optsum(writer),
            MixedModelFit::Generalized { model, .. } => model.save_optsum(writer),
        }
    }
}

/// Fit a mixed model. `None` or a Gaussian family with the identity link
/// gives a linear mixed model; any other family a generalized one.
pub fn fit(matrices: ModelMatrices, family: Option<Family>, options: &FitOptions) -> Result<MixedModelFit> {
    match family {
        Some(f) if !f.is_linear() => {
            let mut model = GeneralizedLinearMixedModel::new(matrices, f)?;
            let result = model.fit(options)?;
            Ok(MixedModelFit::Generalized { model, result })
        }
        _ => {
            let mut model = LinearMixedModel::new(matrices)?;
            let result = model.fit(options)?;
            Ok(MixedModelFit::Linear { model, result })
        }
    }
}
