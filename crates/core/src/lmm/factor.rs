use std::sync::Arc;

use nalgebra::{DMatrix, DVector};

use crate::error::{LmmError, Result};
use crate::matrix::dense::{logdet_lower, lower_inverse};
use crate::matrix::symbolic::tri;
use crate::matrix::{Block, FillInPlan, RawBlocks, Storage};

/// Lower blocked Cholesky factor of the scaled system
///
/// ```text
/// [ Λ'Z'WZΛ + I   Λ'Z'W[X y]   ]
/// [ [X y]'WZΛ     [X y]'W[X y] ]
/// ```
///
/// with storage fixed by a [`FillInPlan`]. Block vectors are packed lower
/// triangles in elimination order; the `[X y]` row is kept separately.
#[derive(Debug, Clone)]
pub struct BlockedFactor {
    plan: Arc<FillInPlan>,
    re: Vec<Block>,
    xy: Vec<Block>,
}

impl BlockedFactor {
    /// Allocate factor storage for `raw`.
    pub fn new(plan: Arc<FillInPlan>, raw: &RawBlocks) -> Result<Self> {
        let k = plan.n_terms();
        if raw.n_terms() != k {
            return Err(LmmError::Structure(format!(
                "raw blocks hold {} terms, plan expects {}",
                raw.n_terms(),
                k
            )));
        }
        let mut re = Vec::with_capacity(tri(k - 1, k - 1) + 1);
        for i in 0..k {
            for j in 0..=i {
                let source = raw.re_block(i, j);
                if source.storage() != plan.raw_storage(i, j) {
                    return Err(LmmError::Structure(format!(
                        "raw block ({}, {}) is {:?}, plan expects {:?}",
                        i,
                        j,
                        source.storage(),
                        plan.raw_storage(i, j)
                    )));
                }
                let pattern = match source {
                    Block::Sparse(s) => Some(s),
                    _ => None,
                };
                let (si, sj) = (plan.shape(i), plan.shape(j));
                re.push(Block::zeros(
                    plan.factor_storage(i, j),
                    (si.n_levels, si.q),
                    (sj.n_levels, sj.q),
                    pattern,
                )?);
            }
        }
        let p1 = plan.p1();
        let mut xy: Vec<Block> = (0..k)
            .map(|j| {
                let s = plan.shape(j);
                Block::Dense(DMatrix::zeros(p1, s.n_levels * s.q))
            })
            .collect();
        xy.push(Block::Dense(DMatrix::zeros(p1, p1)));
        Ok(Self { plan, re, xy })
    }

    /// Scale `raw` by the relative covariance factors and factor it in place.
    ///
    /// `lambdas` are in elimination order. On error the factor contents are
    /// undefined until the next successful update.
    pub fn update(&mut self, raw: &RawBlocks, lambdas: &[DMatrix<f64>]) -> Result<()> {
        let k = self.plan.n_terms();
        if lambdas.len() != k {
            return Err(LmmError::DimensionMismatch {
                expected: k,
                got: lambdas.len(),
                context: "relative covariance factors".into(),
            });
        }
        for j in 0..k {
            for i in j..k {
                let idx = tri(i, j);
                let (done, rest) = self.re.split_at_mut(idx);
                let target = &mut rest[0];
                target.scale_from(raw.re_block(i, j), Some(&lambdas[i]), Some(&lambdas[j]), i == j)?;
                for c in 0..j {
                    if self.plan.is_nonempty(i, c) && self.plan.is_nonempty(j, c) {
                        target.rank_update(&done[tri(i, c)], &done[tri(j, c)])?;
                    }
                }
                if i == j {
                    target.cholesky_in_place(j)?;
                } else if self.plan.is_nonempty(i, j) {
                    target.right_divide(&done[tri(j, j)], j)?;
                }
            }

            let (xy_done, xy_rest) = self.xy.split_at_mut(j);
            let target = &mut xy_rest[0];
            target.scale_from(raw.xy_block(j), None, Some(&lambdas[j]), false)?;
            for c in 0..j {
                if self.plan.is_nonempty(j, c) {
                    target.rank_update(&xy_done[c], &self.re[tri(j, c)])?;
                }
            }
            target.right_divide(&self.re[tri(j, j)], j)?;
        }

        let (xy_done, xy_rest) = self.xy.split_at_mut(k);
        let closure = &mut xy_rest[0];
        closure.scale_from(raw.closure(), None, None, false)?;
        for block in xy_done.iter() {
            closure.rank_update(block, block)?;
        }
        closure.cholesky_in_place(k)
    }

    pub fn plan(&self) -> &FillInPlan {
        &self.plan
    }

    /// Factor of the `[X y]` closure block, (p + 1) × (p + 1).
    fn closure(&self) -> DMatrix<f64> {
        self.xy[self.xy.len() - 1].to_dense()
    }

    fn p(&self) -> usize {
        self.plan.p1() - 1
    }

    /// log |Λ'Z'WZΛ + I|.
    pub fn logdet(&self) -> f64 {
        (0..self.plan.n_terms())
            .map(|j| self.re[tri(j, j)].logdet())
            .sum()
    }

    /// log |L_X L_X'|, the REML correction.
    pub fn logdet_fixed(&self) -> f64 {
        let p = self.p();
        logdet_lower(&self.closure().view((0, 0), (p, p)).into_owned())
    }

    /// Penalized weighted residual sum of squares.
    pub fn pwrss(&self) -> f64 {
        let p = self.p();
        self.closure()[(p, p)].powi(2)
    }

    /// Lower-triangular factor of the fixed-effects block.
    pub fn fixed_factor(&self) -> DMatrix<f64> {
        let p = self.p();
        self.closure().view((0, 0), (p, p)).into_owned()
    }

    /// Conditional estimate of β.
    pub fn beta(&self) -> Result<DVector<f64>> {
        let p = self.p();
        let closure = self.closure();
        let lx = self.fixed_factor();
        let rhs: DVector<f64> = closure.row(p).columns(0, p).transpose();
        lx.tr_solve_lower_triangular(&rhs)
            .ok_or(LmmError::NonPositiveDefinite {
                block: self.plan.n_terms(),
            })
    }

    /// Spherical random effects u for a given β, one vector per term in
    /// elimination order (level-major, q values per level).
    pub fn spherical_effects(&self, beta: &DVector<f64>) -> Result<Vec<DVector<f64>>> {
        let k = self.plan.n_terms();
        let p = self.p();
        if beta.len() != p {
            return Err(LmmError::DimensionMismatch {
                expected: p,
                got: beta.len(),
                context: "fixed-effects coefficients".into(),
            });
        }
        let mut coef = DVector::zeros(p + 1);
        coef.rows_mut(0, p).copy_from(&(-beta));
        coef[p] = 1.0;

        let mut u: Vec<DVector<f64>> = (0..k)
            .map(|j| match &self.xy[j] {
                Block::Dense(m) => m.tr_mul(&coef),
                other => other.to_dense().tr_mul(&coef),
            })
            .collect();
        for j in (0..k).rev() {
            let (solved, rest) = u.split_at_mut(j + 1);
            let target = &mut solved[j];
            for (offset, ui) in rest.iter().enumerate() {
                let i = j + 1 + offset;
                if self.plan.is_nonempty(i, j) {
                    self.re[tri(i, j)].tr_mul_sub(ui, target);
                }
            }
            self.re[tri(j, j)].tr_solve_in_place(target, j)?;
        }
        Ok(u)
    }

    /// L_X⁻¹; the covariance of β is σ² L_X⁻ᵀ L_X⁻¹.
    pub fn fixed_inverse(&self) -> Result<DMatrix<f64>> {
        lower_inverse(&self.fixed_factor()).ok_or(LmmError::NonPositiveDefinite {
            block: self.plan.n_terms(),
        })
    }

    /// Factored diagonal block of the term at elimination position `j`.
    pub fn diagonal_block(&self, j: usize) -> &Block {
        &self.re[tri(j, j)]
    }

    /// Whether the diagonal blocks hold dense storage anywhere.
    pub fn has_dense_fill(&self) -> bool {
        (0..self.plan.n_terms()).any(|j| self.re[tri(j, j)].storage() == Storage::Dense)
    }

    pub fn bytes(&self) -> usize {
        self.re.iter().chain(self.xy.iter()).map(|b| b.bytes()).sum()
    }

    /// The whole factor as one dense lower-triangular matrix.
    pub fn to_dense(&self) -> DMatrix<f64> {
        let k = self.plan.n_terms();
        let sizes: Vec<usize> = (0..k)
            .map(|j| {
                let s = self.plan.shape(j);
                s.n_levels * s.q
            })
            .collect();
        let mut starts = vec![0usize; k + 1];
        for j in 0..k {
            starts[j + 1] = starts[j] + sizes[j];
        }
        let total = starts[k] + self.plan.p1();
        let mut m = DMatrix::zeros(total, total);
        for i in 0..k {
            for j in 0..=i {
                m.view_mut((starts[i], starts[j]), (sizes[i], sizes[j]))
                    .copy_from(&self.re[tri(i, j)].to_dense());
            }
        }
        for j in 0..k {
            m.view_mut((starts[k], starts[j]), (self.plan.p1(), sizes[j]))
                .copy_from(&self.xy[j].to_dense());
        }
        m.view_mut((starts[k], starts[k]), (self.plan.p1(), self.plan.p1()))
            .copy_from(&self.closure());
        m
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ReTerm;
    use crate::variance::Unstructured;
    use approx::assert_relative_eq;

    fn dense_z(term: &ReTerm) -> DMatrix<f64> {
        let sp = term.to_sparse();
        let mut m = DMatrix::zeros(sp.rows(), sp.cols());
        for (v, (r, c)) in sp.iter() {
            m[(r, c)] = *v;
        }
        m
    }

    /// Two crossed terms, one with a random slope, plus an intercept and a
    /// covariate.
    fn fixture() -> (Vec<ReTerm>, DMatrix<f64>, DVector<f64>) {
        let n = 24;
        let t: Vec<f64> = (0..n).map(|i| (i % 3) as f64).collect();
        let subj: Vec<usize> = (0..n).map(|i| i / 4).collect();
        let item: Vec<usize> = (0..n).map(|i| (i * 7) % 5).collect();
        let mut z = DMatrix::zeros(2, n);
        for i in 0..n {
            z[(0, i)] = 1.0;
            z[(1, i)] = t[i];
        }
        let subject = ReTerm::new(
            "subj",
            (0..6).map(|l| l.to_string()).collect(),
            subj,
            vec!["(Intercept)".into(), "t".into()],
            z,
            Box::new(Unstructured::new(2)),
        )
        .unwrap();
        let item = ReTerm::intercept("item", (0..5).map(|l| l.to_string()).collect(), item).unwrap();
        let x = DMatrix::from_fn(n, 2, |i, j| if j == 0 { 1.0 } else { t[i] });
        let y = DVector::from_fn(n, |i, _| ((i * 13) % 7) as f64 + 0.3 * t[i]);
        (vec![subject, item], x, y)
    }

    fn dense_system(
        terms: &[ReTerm],
        x: &DMatrix<f64>,
        y: &DVector<f64>,
        lambdas: &[DMatrix<f64>],
    ) -> DMatrix<f64> {
        // [ZΛ X y]' [ZΛ X y] + diag(I, 0)
        let n = y.len();
        let mut blocks: Vec<DMatrix<f64>> = terms
            .iter()
            .zip(lambdas)
            .map(|(t, l)| {
                let lambda_full = DMatrix::identity(t.n_levels(), t.n_levels()).kronecker(l);
                dense_z(t) * lambda_full
            })
            .collect();
        let q: usize = blocks.iter().map(|b| b.ncols()).sum();
        let mut xy = DMatrix::zeros(n, x.ncols() + 1);
        xy.columns_mut(0, x.ncols()).copy_from(x);
        xy.set_column(x.ncols(), y);
        blocks.push(xy);
        let total: usize = blocks.iter().map(|b| b.ncols()).sum();
        let mut full = DMatrix::zeros(n, total);
        let mut offset = 0;
        for b in &blocks {
            full.columns_mut(offset, b.ncols()).copy_from(b);
            offset += b.ncols();
        }
        let mut a = full.tr_mul(&full);
        for i in 0..q {
            a[(i, i)] += 1.0;
        }
        a
    }

    fn lambdas_for(plan: &FillInPlan, theta_by_term: &[DMatrix<f64>]) -> Vec<DMatrix<f64>> {
        plan.order().iter().map(|&t| theta_by_term[t].clone()).collect()
    }

    #[test]
    fn test_blocked_matches_dense_cholesky() {
        let (terms, x, y) = fixture();
        let by_term = vec![
            DMatrix::from_row_slice(2, 2, &[0.8, 0.0, -0.3, 0.5]),
            DMatrix::from_element(1, 1, 1.3),
        ];
        for order in [vec![0, 1], vec![1, 0]] {
            let plan = Arc::new(FillInPlan::with_order(&terms, order.clone(), 3).unwrap());
            let ordered: Vec<ReTerm> = order.iter().map(|&t| terms[t].clone()).collect();
            let raw = RawBlocks::build(&plan, &ordered, &x, &y, None).unwrap();
            let lambdas = lambdas_for(&plan, &by_term);
            let mut factor = BlockedFactor::new(plan.clone(), &raw).unwrap();
            factor.update(&raw, &lambdas).unwrap();

            let a = dense_system(&ordered, &x, &y, &lambdas);
            let expected = a.clone().cholesky().unwrap().unpack();
            assert_relative_eq!(factor.to_dense(), expected, epsilon = 1e-9);

            let qtot = a.nrows() - 3;
            let logdet_z = 2.0 * expected.diagonal().rows(0, qtot).iter().map(|d| d.ln()).sum::<f64>();
            assert_relative_eq!(factor.logdet(), logdet_z, epsilon = 1e-9);
            assert_relative_eq!(factor.pwrss(), expected[(a.nrows() - 1, a.nrows() - 1)].powi(2), epsilon = 1e-9);
        }
    }

    #[test]
    fn test_solves_match_dense_normal_equations() {
        let (terms, x, y) = fixture();
        let by_term = vec![
            DMatrix::from_row_slice(2, 2, &[0.6, 0.0, 0.2, 0.4]),
            DMatrix::from_element(1, 1, 0.9),
        ];
        let plan = Arc::new(FillInPlan::analyze(&terms, 3).unwrap());
        let ordered: Vec<ReTerm> = plan.order().iter().map(|&t| terms[t].clone()).collect();
        let raw = RawBlocks::build(&plan, &ordered, &x, &y, None).unwrap();
        let lambdas = lambdas_for(&plan, &by_term);
        let mut factor = BlockedFactor::new(plan.clone(), &raw).unwrap();
        factor.update(&raw, &lambdas).unwrap();

        // joint solve of [Λ'Z'ZΛ + I, Λ'Z'X; X'ZΛ, X'X] [u; β] = [Λ'Z'y; X'y]
        let a = dense_system(&ordered, &x, &y, &lambdas);
        let m = a.nrows() - 1;
        let lhs = a.view((0, 0), (m, m)).into_owned();
        let rhs: DVector<f64> = a.view((0, m), (m, 1)).column(0).into_owned();
        let sol = lhs.cholesky().unwrap().solve(&rhs);

        let beta = factor.beta().unwrap();
        assert_relative_eq!(beta, sol.rows(m - 2, 2).into_owned(), epsilon = 1e-8);
        let u = factor.spherical_effects(&beta).unwrap();
        let stacked: Vec<f64> = u.iter().flat_map(|v| v.iter().copied().collect::<Vec<_>>()).collect();
        assert_relative_eq!(
            DVector::from_vec(stacked),
            sol.rows(0, m - 2).into_owned(),
            epsilon = 1e-8
        );

        let linv = factor.fixed_inverse().unwrap();
        let lx = factor.fixed_factor();
        assert_relative_eq!(&linv * &lx, DMatrix::identity(2, 2), epsilon = 1e-10);
    }

    #[test]
    fn test_zero_theta_gives_ols_residuals() {
        let (terms, x, y) = fixture();
        let plan = Arc::new(FillInPlan::analyze(&terms, 3).unwrap());
        let ordered: Vec<ReTerm> = plan.order().iter().map(|&t| terms[t].clone()).collect();
        let raw = RawBlocks::build(&plan, &ordered, &x, &y, None).unwrap();
        let lambdas: Vec<DMatrix<f64>> = ordered.iter().map(|t| DMatrix::zeros(t.q(), t.q())).collect();
        let mut factor = BlockedFactor::new(plan, &raw).unwrap();
        factor.update(&raw, &lambdas).unwrap();

        assert_relative_eq!(factor.logdet(), 0.0, epsilon = 1e-12);
        let ols = (x.transpose() * &x).cholesky().unwrap().solve(&(x.transpose() * &y));
        let rss = (&y - &x * &ols).norm_squared();
        assert_relative_eq!(factor.pwrss(), rss, epsilon = 1e-9);
        assert_relative_eq!(factor.beta().unwrap(), ols, epsilon = 1e-9);
    }

    #[test]
    fn test_update_reports_wrong_factor_count() {
        let (terms, x, y) = fixture();
        let plan = Arc::new(FillInPlan::analyze(&terms, 3).unwrap());
        let ordered: Vec<ReTerm> = plan.order().iter().map(|&t| terms[t].clone()).collect();
        let raw = RawBlocks::build(&plan, &ordered, &x, &y, None).unwrap();
        let mut factor = BlockedFactor::new(plan, &raw).unwrap();
        assert!(matches!(
            factor.update(&raw, &[DMatrix::identity(2, 2)]),
            Err(LmmError::DimensionMismatch { .. })
        ));
    }
}
