use crate::error::{LmmError, Result};
use crate::matrix::TripletBuilder;
use crate::types::{DenseMatrix, DenseVector, SparseMat};
use crate::variance::{CovarianceStructure, Diagonal, Unstructured};

/// One random-effects term: a grouping factor with q random effects per level.
///
/// The design matrix Z_k (n × ℓq) is stored compactly: observation `i`
/// belongs to level `refs[i]` and contributes the q-vector `z.column(i)` to
/// that level's columns. Columns of the expanded Z_k are level-major
/// (column `level * q + j`).
#[derive(Debug, Clone)]
pub struct ReTerm {
    pub(crate) name: String,
    pub(crate) levels: Vec<String>,
    pub(crate) refs: Vec<usize>,
    pub(crate) cnames: Vec<String>,
    /// q × n random-effects covariates.
    pub(crate) z: DenseMatrix,
    pub(crate) structure: Box<dyn CovarianceStructure>,
}

impl ReTerm {
    /// Build a term, checking that refs, levels and z agree.
    pub fn new(
        name: &str,
        levels: Vec<String>,
        refs: Vec<usize>,
        cnames: Vec<String>,
        z: DenseMatrix,
        structure: Box<dyn CovarianceStructure>,
    ) -> Result<Self> {
        if z.ncols() != refs.len() {
            return Err(LmmError::DimensionMismatch {
                expected: refs.len(),
                got: z.ncols(),
                context: format!("columns of z for term '{}'", name),
            });
        }
        if cnames.len() != z.nrows() || structure.dim() != z.nrows() {
            return Err(LmmError::DimensionMismatch {
                expected: z.nrows(),
                got: structure.dim(),
                context: format!("random-effect dimension of term '{}'", name),
            });
        }
        if let Some(&bad) = refs.iter().find(|&&r| r >= levels.len()) {
            return Err(LmmError::ModelSpec(format!(
                "term '{}' refers to level {} but has only {} levels",
                name,
                bad,
                levels.len()
            )));
        }
        Ok(Self {
            name: name.to_string(),
            levels,
            refs,
            cnames,
            z,
            structure,
        })
    }

    /// Random intercept: q = 1 and every z entry is 1.
    pub fn intercept(name: &str, levels: Vec<String>, refs: Vec<usize>) -> Result<Self> {
        let n = refs.len();
        Self::new(
            name,
            levels,
            refs,
            vec!["(Intercept)".to_string()],
            DenseMatrix::from_element(1, n, 1.0),
            Box::new(Unstructured::new(1)),
        )
    }

    /// Recover a term from an explicit sparse design Z_k (n × ℓq, level-major).
    ///
    /// Every row must touch the columns of a single level; a row with no
    /// non-zeros is attached to level 0 with a zero covariate vector.
    pub fn from_sparse(
        name: &str,
        zk: &SparseMat,
        q: usize,
        cnames: Vec<String>,
        zerocorr: bool,
    ) -> Result<Self> {
        if q == 0 || zk.cols() % q != 0 {
            return Err(LmmError::ModelSpec(format!(
                "term '{}': {} columns are not a multiple of q = {}",
                name,
                zk.cols(),
                q
            )));
        }
        let n = zk.rows();
        let nlevels = zk.cols() / q;
        let csr = zk.to_csr();
        let mut refs = vec![0usize; n];
        let mut z = DenseMatrix::zeros(q, n);
        for (i, row) in csr.outer_iterator().enumerate() {
            let mut level: Option<usize> = None;
            for (col, &val) in row.iter() {
                let l = col / q;
                match level {
                    Some(prev) if prev != l => {
                        return Err(LmmError::ModelSpec(format!(
                            "term '{}': row {} touches levels {} and {}",
                            name, i, prev, l
                        )));
                    }
                    _ => level = Some(l),
                }
                z[(col % q, i)] = val;
            }
            refs[i] = level.unwrap_or(0);
        }
        let levels = (0..nlevels).map(|l| format!("{}", l + 1)).collect();
        let structure: Box<dyn CovarianceStructure> = if zerocorr {
            Box::new(Diagonal::new(q))
        } else {
            Box::new(Unstructured::new(q))
        };
        Self::new(name, levels, refs, cnames, z, structure)
    }

    /// Expanded sparse design Z_k.
    pub fn to_sparse(&self) -> SparseMat {
        let q = self.q();
        let mut builder = TripletBuilder::new(self.n_obs(), self.n_levels() * q);
        for (i, &level) in self.refs.iter().enumerate() {
            for j in 0..q {
                let v = self.z[(j, i)];
                if v != 0.0 {
                    builder.add(i, level * q + j, v);
                }
            }
        }
        builder.to_csc()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn levels(&self) -> &[String] {
        &self.levels
    }

    /// Level index of each observation.
    pub fn refs(&self) -> &[usize] {
        &self.refs
    }

    /// Names of the q random effects.
    pub fn cnames(&self) -> &[String] {
        &self.cnames
    }

    /// q × n random-effects covariates.
    pub fn z(&self) -> &DenseMatrix {
        &self.z
    }

    pub fn structure(&self) -> &dyn CovarianceStructure {
        self.structure.as_ref()
    }

    /// Random effects per level, q.
    pub fn q(&self) -> usize {
        self.z.nrows()
    }

    pub fn n_levels(&self) -> usize {
        self.levels.len()
    }

    pub fn n_obs(&self) -> usize {
        self.refs.len()
    }

    /// Columns of the expanded Z_k.
    pub fn size(&self) -> usize {
        self.n_levels() * self.q()
    }

    /// Z_k b_k accumulated into `out`, with `b` stored q × ℓ.
    pub fn mul_add(&self, b: &DenseMatrix, out: &mut DenseVector) {
        for (i, &level) in self.refs.iter().enumerate() {
            out[i] += self.z.column(i).dot(&b.column(level));
        }
    }
}

/// Model matrices consumed by the engine: X, the random-effects terms, y
/// and optional prior weights and offset.
#[derive(Debug, Clone)]
pub struct ModelMatrices {
    pub(crate) x: DenseMatrix,
    pub(crate) xnames: Vec<String>,
    pub(crate) reterms: Vec<ReTerm>,
    pub(crate) y: DenseVector,
    pub(crate) weights: Option<DenseVector>,
    pub(crate) offset: Option<DenseVector>,
}

impl ModelMatrices {
    /// Assemble and validate model matrices.
    ///
    /// # Errors
    /// `DimensionMismatch` when the row counts of X, any Z_k and y disagree;
    /// `ModelSpec` when there is no random-effects term, no residual
    /// degrees of freedom or X does not have full column rank.
    pub fn new(
        x: DenseMatrix,
        xnames: Vec<String>,
        reterms: Vec<ReTerm>,
        y: DenseVector,
    ) -> Result<Self> {
        let n = y.len();
        if x.nrows() != n {
            return Err(LmmError::DimensionMismatch {
                expected: n,
                got: x.nrows(),
                context: "rows of X".into(),
            });
        }
        if xnames.len() != x.ncols() {
            return Err(LmmError::DimensionMismatch {
                expected: x.ncols(),
                got: xnames.len(),
                context: "fixed-effect names".into(),
            });
        }
        for term in &reterms {
            if term.n_obs() != n {
                return Err(LmmError::DimensionMismatch {
                    expected: n,
                    got: term.n_obs(),
                    context: format!("rows of Z for term '{}'", term.name),
                });
            }
        }
        if reterms.is_empty() {
            return Err(LmmError::ModelSpec(
                "at least one random-effects term is required".into(),
            ));
        }
        if n <= x.ncols() {
            return Err(LmmError::ModelSpec(format!(
                "{} observations for {} fixed effects",
                n,
                x.ncols()
            )));
        }
        if y.iter().any(|v| !v.is_finite()) {
            return Err(LmmError::Data("response contains non-finite values".into()));
        }
        if x.iter().any(|v| !v.is_finite()) {
            return Err(LmmError::Data("fixed-effects matrix contains non-finite values".into()));
        }
        let rank = fixed_rank(&x);
        if rank < x.ncols() {
            return Err(LmmError::ModelSpec(format!(
                "fixed-effects matrix is rank deficient: rank {} with {} columns",
                rank,
                x.ncols()
            )));
        }
        Ok(Self {
            x,
            xnames,
            reterms,
            y,
            weights: None,
            offset: None,
        })
    }

    /// Attach prior weights (positive, one per observation).
    pub fn with_weights(mut self, weights: DenseVector) -> Result<Self> {
        if weights.len() != self.n_obs() {
            return Err(LmmError::DimensionMismatch {
                expected: self.n_obs(),
                got: weights.len(),
                context: "prior weights".into(),
            });
        }
        if weights.iter().any(|&w| !(w > 0.0) || !w.is_finite()) {
            return Err(LmmError::Data("prior weights must be positive".into()));
        }
        self.weights = Some(weights);
        Ok(self)
    }

    /// Attach an offset added to the linear predictor.
    pub fn with_offset(mut self, offset: DenseVector) -> Result<Self> {
        if offset.len() != self.n_obs() {
            return Err(LmmError::DimensionMismatch {
                expected: self.n_obs(),
                got: offset.len(),
                context: "offset".into(),
            });
        }
        self.offset = Some(offset);
        Ok(self)
    }

    pub fn x(&self) -> &DenseMatrix {
        &self.x
    }

    pub fn xnames(&self) -> &[String] {
        &self.xnames
    }

    /// Random-effects terms in input order.
    pub fn reterms(&self) -> &[ReTerm] {
        &self.reterms
    }

    pub fn y(&self) -> &DenseVector {
        &self.y
    }

    pub fn weights(&self) -> Option<&DenseVector> {
        self.weights.as_ref()
    }

    pub fn offset(&self) -> Option<&DenseVector> {
        self.offset.as_ref()
    }

    pub fn n_obs(&self) -> usize {
        self.y.len()
    }

    pub fn n_fixed(&self) -> usize {
        self.x.ncols()
    }

    /// Same design with a different response vector.
    pub fn with_response(&self, y: DenseVector) -> Result<Self> {
        if y.len() != self.n_obs() {
            return Err(LmmError::DimensionMismatch {
                expected: self.n_obs(),
                got: y.len(),
                context: "replacement response".into(),
            });
        }
        let mut copy = self.clone();
        copy.y = y;
        Ok(copy)
    }
}

/// Relative singular-value cutoff below which a direction of X counts as
/// linearly dependent.
const RANK_RTOL: f64 = 1e-10;

/// Numerical column rank of X.
fn fixed_rank(x: &DenseMatrix) -> usize {
    if x.ncols() == 0 {
        return 0;
    }
    let svd = x.clone().svd(false, false);
    let max = svd.singular_values.max();
    if !(max > 0.0) {
        return 0;
    }
    svd.rank(RANK_RTOL * max)
}
