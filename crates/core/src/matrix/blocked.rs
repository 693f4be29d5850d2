use std::collections::BTreeMap;
use std::sync::Arc;

use nalgebra::{DMatrix, DVector};

use crate::error::{LmmError, Result};
use crate::model::ReTerm;

use super::block::{Block, BlockSparse, Storage};
use super::symbolic::{tri, FillInPlan};

/// Raw crossproducts of `[Z_1 .. Z_K, [X y]]` in elimination order.
///
/// The random-effects blocks do not depend on the response and are shared
/// between models refitted to new responses. The `[X y]` row is private.
#[derive(Debug, Clone)]
pub struct RawBlocks {
    re: Arc<Vec<Block>>,
    /// `[X y]ᵀ W Z_j` for each term, then `[X y]ᵀ W [X y]`.
    xy: Vec<Block>,
}

impl RawBlocks {
    /// Crossproducts for `terms` given in elimination order.
    pub fn build(
        plan: &FillInPlan,
        terms: &[ReTerm],
        x: &DMatrix<f64>,
        y: &DVector<f64>,
        weights: Option<&DVector<f64>>,
    ) -> Result<Self> {
        check_rows(terms, x, y, weights)?;
        if plan.p1() != x.ncols() + 1 {
            return Err(LmmError::DimensionMismatch {
                expected: plan.p1(),
                got: x.ncols() + 1,
                context: "columns of [X y]".into(),
            });
        }
        Ok(Self {
            re: Arc::new(re_blocks(plan, terms, weights)),
            xy: xy_blocks(terms, x, y, weights),
        })
    }

    /// Replace the response, keeping the random-effects blocks shared.
    pub fn update_response(
        &mut self,
        terms: &[ReTerm],
        x: &DMatrix<f64>,
        y: &DVector<f64>,
        weights: Option<&DVector<f64>>,
    ) -> Result<()> {
        check_rows(terms, x, y, weights)?;
        self.xy = xy_blocks(terms, x, y, weights);
        Ok(())
    }

    /// Recompute every block under new observation weights.
    pub fn reweight(
        &mut self,
        plan: &FillInPlan,
        terms: &[ReTerm],
        x: &DMatrix<f64>,
        y: &DVector<f64>,
        weights: &DVector<f64>,
    ) -> Result<()> {
        check_rows(terms, x, y, Some(weights))?;
        *Arc::make_mut(&mut self.re) = re_blocks(plan, terms, Some(weights));
        self.xy = xy_blocks(terms, x, y, Some(weights));
        Ok(())
    }

    pub fn n_terms(&self) -> usize {
        self.xy.len() - 1
    }

    pub fn re_block(&self, i: usize, j: usize) -> &Block {
        &self.re[tri(i, j)]
    }

    pub fn xy_block(&self, j: usize) -> &Block {
        &self.xy[j]
    }

    pub fn closure(&self) -> &Block {
        &self.xy[self.xy.len() - 1]
    }

    /// Whether both share the same random-effects blocks in memory.
    pub fn shares_re_with(&self, other: &RawBlocks) -> bool {
        Arc::ptr_eq(&self.re, &other.re)
    }
}

fn check_rows(
    terms: &[ReTerm],
    x: &DMatrix<f64>,
    y: &DVector<f64>,
    weights: Option<&DVector<f64>>,
) -> Result<()> {
    let n = y.len();
    let mut counts = vec![("rows of X", x.nrows())];
    counts.extend(terms.iter().map(|t| ("observations of a random-effects term", t.n_obs())));
    if let Some(w) = weights {
        counts.push(("weights", w.len()));
    }
    match counts.into_iter().find(|&(_, got)| got != n) {
        Some((context, got)) => Err(LmmError::DimensionMismatch {
            expected: n,
            got,
            context: context.into(),
        }),
        None => Ok(()),
    }
}

fn weight(weights: Option<&DVector<f64>>, i: usize) -> f64 {
    weights.map_or(1.0, |w| w[i])
}

fn re_blocks(plan: &FillInPlan, terms: &[ReTerm], weights: Option<&DVector<f64>>) -> Vec<Block> {
    let k = terms.len();
    let mut blocks = Vec::with_capacity(tri(k - 1, k - 1) + 1);
    for i in 0..k {
        for j in 0..=i {
            let block = if i == j {
                diagonal_block(&terms[i], weights)
            } else {
                cross_block(&terms[i], &terms[j], plan.raw_storage(i, j), weights)
            };
            blocks.push(block);
        }
    }
    blocks
}

fn diagonal_block(term: &ReTerm, weights: Option<&DVector<f64>>) -> Block {
    let q = term.q();
    if q == 1 {
        let mut d = DVector::zeros(term.n_levels());
        for (i, &l) in term.refs.iter().enumerate() {
            let z = term.z[(0, i)];
            d[l] += weight(weights, i) * z * z;
        }
        Block::Diagonal(d)
    } else {
        let mut bs = vec![DMatrix::zeros(q, q); term.n_levels()];
        for (i, &l) in term.refs.iter().enumerate() {
            let z = term.z.column(i);
            bs[l].ger(weight(weights, i), &z, &z, 1.0);
        }
        Block::BlockDiagonal(bs)
    }
}

/// `Z_iᵀ W Z_j` with rows indexed by the levels of `ti`.
fn cross_block(
    ti: &ReTerm,
    tj: &ReTerm,
    storage: Storage,
    weights: Option<&DVector<f64>>,
) -> Block {
    let (qi, qj) = (ti.q(), tj.q());
    match storage {
        Storage::Dense => {
            let mut m = DMatrix::zeros(ti.size(), tj.size());
            for obs in 0..ti.n_obs() {
                let (r, c) = (ti.refs[obs], tj.refs[obs]);
                let mut view = m.view_mut((r * qi, c * qj), (qi, qj));
                view.ger(weight(weights, obs), &ti.z.column(obs), &tj.z.column(obs), 1.0);
            }
            Block::Dense(m)
        }
        _ => {
            let mut entries: BTreeMap<(usize, usize), DMatrix<f64>> = BTreeMap::new();
            for obs in 0..ti.n_obs() {
                let key = (tj.refs[obs], ti.refs[obs]);
                entries
                    .entry(key)
                    .or_insert_with(|| DMatrix::zeros(qi, qj))
                    .ger(weight(weights, obs), &ti.z.column(obs), &tj.z.column(obs), 1.0);
            }
            Block::Sparse(BlockSparse::from_entries(
                ti.n_levels(),
                tj.n_levels(),
                qi,
                qj,
                entries,
            ))
        }
    }
}

fn xy_blocks(
    terms: &[ReTerm],
    x: &DMatrix<f64>,
    y: &DVector<f64>,
    weights: Option<&DVector<f64>>,
) -> Vec<Block> {
    let p = x.ncols();
    let mut xy = DMatrix::zeros(x.nrows(), p + 1);
    xy.columns_mut(0, p).copy_from(x);
    xy.set_column(p, y);

    let mut blocks = Vec::with_capacity(terms.len() + 1);
    for term in terms {
        let q = term.q();
        let mut m = DMatrix::zeros(p + 1, term.size());
        for (obs, &l) in term.refs.iter().enumerate() {
            let row = xy.row(obs).transpose();
            let mut view = m.columns_mut(l * q, q);
            view.ger(weight(weights, obs), &row, &term.z.column(obs), 1.0);
        }
        blocks.push(Block::Dense(m));
    }
    let closure = match weights {
        Some(w) => {
            let mut scaled = xy.clone();
            for (mut row, &wi) in scaled.row_iter_mut().zip(w.iter()) {
                row *= wi;
            }
            xy.tr_mul(&scaled)
        }
        None => xy.tr_mul(&xy),
    };
    blocks.push(Block::Dense(closure));
    blocks
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::variance::Unstructured;
    use approx::assert_relative_eq;

    fn slope_term(refs: Vec<usize>, nlev: usize, t: &[f64]) -> ReTerm {
        let n = refs.len();
        let mut z = DMatrix::zeros(2, n);
        for i in 0..n {
            z[(0, i)] = 1.0;
            z[(1, i)] = t[i];
        }
        ReTerm::new(
            "g",
            (0..nlev).map(|l| l.to_string()).collect(),
            refs,
            vec!["(Intercept)".into(), "t".into()],
            z,
            Box::new(Unstructured::new(2)),
        )
        .unwrap()
    }

    fn dense_z(term: &ReTerm) -> DMatrix<f64> {
        let sp = term.to_sparse();
        let mut m = DMatrix::zeros(sp.rows(), sp.cols());
        for (v, (r, c)) in sp.iter() {
            m[(r, c)] = *v;
        }
        m
    }

    #[test]
    fn test_blocks_match_dense_crossproducts() {
        let t = [0.0, 1.0, 2.0, 0.0, 1.0, 2.0, 0.5];
        let g = slope_term(vec![0, 0, 0, 1, 1, 1, 2], 3, &t);
        let h = ReTerm::intercept(
            "h",
            vec!["a".into(), "b".into()],
            vec![0, 1, 0, 1, 0, 1, 0],
        )
        .unwrap();
        let terms = vec![g, h];
        let x = DMatrix::from_fn(7, 2, |i, j| if j == 0 { 1.0 } else { i as f64 });
        let y = DVector::from_fn(7, |i, _| (i * i) as f64 * 0.1);
        let w = DVector::from_fn(7, |i, _| 1.0 + 0.1 * i as f64);

        let plan = FillInPlan::with_order(&terms, vec![0, 1], 3).unwrap();
        let raw = RawBlocks::build(&plan, &terms, &x, &y, Some(&w)).unwrap();

        let zg = dense_z(&terms[0]);
        let zh = dense_z(&terms[1]);
        let wm = DMatrix::from_diagonal(&w);
        let mut xy = DMatrix::zeros(7, 3);
        xy.columns_mut(0, 2).copy_from(&x);
        xy.set_column(2, &y);

        assert_relative_eq!(raw.re_block(0, 0).to_dense(), zg.transpose() * &wm * &zg, epsilon = 1e-12);
        assert_relative_eq!(raw.re_block(1, 0).to_dense(), zh.transpose() * &wm * &zg, epsilon = 1e-12);
        assert_relative_eq!(raw.re_block(1, 1).to_dense(), zh.transpose() * &wm * &zh, epsilon = 1e-12);
        assert_relative_eq!(raw.xy_block(0).to_dense(), xy.transpose() * &wm * &zg, epsilon = 1e-12);
        assert_relative_eq!(raw.closure().to_dense(), xy.transpose() * &wm * &xy, epsilon = 1e-12);
        assert_eq!(raw.n_terms(), 2);
    }

    #[test]
    fn test_update_response_shares_random_effect_blocks() {
        let terms = vec![ReTerm::intercept("g", vec!["a".into(), "b".into()], vec![0, 0, 1, 1]).unwrap()];
        let x = DMatrix::from_element(4, 1, 1.0);
        let y = DVector::from_column_slice(&[1.0, 2.0, 3.0, 4.0]);
        let plan = FillInPlan::analyze(&terms, 2).unwrap();
        let raw = RawBlocks::build(&plan, &terms, &x, &y, None).unwrap();

        let mut refit = raw.clone();
        refit
            .update_response(&terms, &x, &DVector::from_column_slice(&[0.0, 0.0, 1.0, 1.0]), None)
            .unwrap();
        assert!(refit.shares_re_with(&raw));
        assert_relative_eq!(refit.closure().to_dense()[(1, 1)], 2.0);
        assert_relative_eq!(raw.closure().to_dense()[(1, 1)], 30.0);

        let mut reweighted = raw.clone();
        reweighted
            .reweight(&plan, &terms, &x, &y, &DVector::from_element(4, 2.0))
            .unwrap();
        assert!(!reweighted.shares_re_with(&raw));
        assert_relative_eq!(reweighted.re_block(0, 0).to_dense()[(0, 0)], 4.0);
    }

    #[test]
    fn test_build_rejects_row_mismatch() {
        let terms = vec![ReTerm::intercept("g", vec!["a".into()], vec![0, 0, 0]).unwrap()];
        let x = DMatrix::from_element(4, 1, 1.0);
        let y = DVector::from_element(4, 1.0);
        let plan = FillInPlan::analyze(&terms, 2).unwrap();
        assert!(matches!(
            RawBlocks::build(&plan, &terms, &x, &y, None),
            Err(LmmError::DimensionMismatch { .. })
        ));
    }
}
