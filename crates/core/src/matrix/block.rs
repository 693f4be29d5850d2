use std::collections::BTreeMap;

use nalgebra::{DMatrix, DVector};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::{LmmError, Result};

use super::dense::{cholesky_in_place, congruence, logdet_lower, right_solve_lower_transpose};

/// Block-diagonal Cholesky factorizations run in parallel from this many levels.
const PAR_MIN_LEVELS: usize = 256;

/// Storage class of one block of the blocked system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Storage {
    Diagonal,
    BlockDiagonal,
    Sparse,
    Dense,
}

/// Level-block compressed-column matrix.
///
/// The matrix is `nrows` × `ncols` levels; each stored entry is a dense
/// `row_dim` × `col_dim` sub-block. Row levels within a column are sorted.
#[derive(Debug, Clone, PartialEq)]
pub struct BlockSparse {
    pub row_dim: usize,
    pub col_dim: usize,
    pub nrows: usize,
    pub ncols: usize,
    pub col_ptr: Vec<usize>,
    pub row_levels: Vec<usize>,
    pub values: Vec<DMatrix<f64>>,
}

impl BlockSparse {
    /// Build from `(col, row) -> sub-block` entries.
    pub fn from_entries(
        nrows: usize,
        ncols: usize,
        row_dim: usize,
        col_dim: usize,
        entries: BTreeMap<(usize, usize), DMatrix<f64>>,
    ) -> Self {
        let mut col_ptr = vec![0usize; ncols + 1];
        let mut row_levels = Vec::with_capacity(entries.len());
        let mut values = Vec::with_capacity(entries.len());
        for ((col, row), value) in entries {
            col_ptr[col + 1] += 1;
            row_levels.push(row);
            values.push(value);
        }
        for c in 0..ncols {
            col_ptr[c + 1] += col_ptr[c];
        }
        Self {
            row_dim,
            col_dim,
            nrows,
            ncols,
            col_ptr,
            row_levels,
            values,
        }
    }

    /// Stored level pairs.
    pub fn nnz(&self) -> usize {
        self.row_levels.len()
    }

    pub fn density(&self) -> f64 {
        if self.nrows == 0 || self.ncols == 0 {
            0.0
        } else {
            self.nnz() as f64 / (self.nrows * self.ncols) as f64
        }
    }

    /// Index range of column `c` into `row_levels` / `values`.
    pub fn column_range(&self, c: usize) -> std::ops::Range<usize> {
        self.col_ptr[c]..self.col_ptr[c + 1]
    }

    /// Position of entry (row, col), if stored.
    pub fn find(&self, row: usize, col: usize) -> Option<usize> {
        let range = self.column_range(col);
        self.row_levels[range.clone()]
            .binary_search(&row)
            .ok()
            .map(|k| range.start + k)
    }

    /// Same pattern with zero values.
    pub fn zeroed(&self) -> Self {
        let mut copy = self.clone();
        for v in &mut copy.values {
            v.fill(0.0);
        }
        copy
    }

    pub fn to_dense(&self) -> DMatrix<f64> {
        let mut m = DMatrix::zeros(self.nrows * self.row_dim, self.ncols * self.col_dim);
        for c in 0..self.ncols {
            for k in self.column_range(c) {
                let r = self.row_levels[k];
                m.view_mut((r * self.row_dim, c * self.col_dim), (self.row_dim, self.col_dim))
                    .copy_from(&self.values[k]);
            }
        }
        m
    }

    pub fn bytes(&self) -> usize {
        self.nnz() * self.row_dim * self.col_dim * std::mem::size_of::<f64>()
            + (self.col_ptr.len() + self.row_levels.len()) * std::mem::size_of::<usize>()
    }
}

/// One block of a blocked symmetric system or of its Cholesky factor.
#[derive(Debug, Clone, PartialEq)]
pub enum Block {
    /// Diagonal block of a scalar random-effects term, one value per level.
    Diagonal(DVector<f64>),
    /// Diagonal block of a vector-valued term, one q × q block per level.
    BlockDiagonal(Vec<DMatrix<f64>>),
    /// Off-diagonal block stored by level pair.
    Sparse(BlockSparse),
    Dense(DMatrix<f64>),
}

impl Block {
    /// Zero block with the given storage.
    ///
    /// `pattern` supplies the level structure of sparse blocks.
    pub fn zeros(
        storage: Storage,
        rows: (usize, usize),
        cols: (usize, usize),
        pattern: Option<&BlockSparse>,
    ) -> Result<Self> {
        let (nrow_levels, row_dim) = rows;
        let (ncol_levels, col_dim) = cols;
        Ok(match storage {
            Storage::Diagonal => Block::Diagonal(DVector::zeros(nrow_levels)),
            Storage::BlockDiagonal => {
                Block::BlockDiagonal(vec![DMatrix::zeros(row_dim, row_dim); nrow_levels])
            }
            Storage::Sparse => match pattern {
                Some(p) => Block::Sparse(p.zeroed()),
                None => {
                    return Err(LmmError::Structure(
                        "sparse block requested without a level pattern".into(),
                    ))
                }
            },
            Storage::Dense => {
                Block::Dense(DMatrix::zeros(nrow_levels * row_dim, ncol_levels * col_dim))
            }
        })
    }

    pub fn storage(&self) -> Storage {
        match self {
            Block::Diagonal(_) => Storage::Diagonal,
            Block::BlockDiagonal(_) => Storage::BlockDiagonal,
            Block::Sparse(_) => Storage::Sparse,
            Block::Dense(_) => Storage::Dense,
        }
    }

    pub fn nrows(&self) -> usize {
        match self {
            Block::Diagonal(d) => d.len(),
            Block::BlockDiagonal(bs) => bs.iter().map(|b| b.nrows()).sum(),
            Block::Sparse(s) => s.nrows * s.row_dim,
            Block::Dense(m) => m.nrows(),
        }
    }

    pub fn ncols(&self) -> usize {
        match self {
            Block::Diagonal(d) => d.len(),
            Block::BlockDiagonal(bs) => bs.iter().map(|b| b.ncols()).sum(),
            Block::Sparse(s) => s.ncols * s.col_dim,
            Block::Dense(m) => m.ncols(),
        }
    }

    pub fn bytes(&self) -> usize {
        let f = std::mem::size_of::<f64>();
        match self {
            Block::Diagonal(d) => d.len() * f,
            Block::BlockDiagonal(bs) => bs.iter().map(|b| b.len()).sum::<usize>() * f,
            Block::Sparse(s) => s.bytes(),
            Block::Dense(m) => m.len() * f,
        }
    }

    pub fn to_dense(&self) -> DMatrix<f64> {
        match self {
            Block::Diagonal(d) => DMatrix::from_diagonal(d),
            Block::BlockDiagonal(bs) => {
                let n = self.nrows();
                let mut m = DMatrix::zeros(n, n);
                let mut offset = 0;
                for b in bs {
                    let q = b.nrows();
                    m.view_mut((offset, offset), (q, q)).copy_from(b);
                    offset += q;
                }
                m
            }
            Block::Sparse(s) => s.to_dense(),
            Block::Dense(m) => m.clone(),
        }
    }

    /// Diagonal entries (of a square block).
    pub fn diagonal(&self) -> DVector<f64> {
        match self {
            Block::Diagonal(d) => d.clone(),
            Block::BlockDiagonal(bs) => DVector::from_vec(
                bs.iter()
                    .flat_map(|b| b.diagonal().as_slice().to_vec())
                    .collect(),
            ),
            Block::Sparse(s) => s.to_dense().diagonal(),
            Block::Dense(m) => m.diagonal(),
        }
    }

    /// 2 Σ log diag for a factored diagonal block.
    pub fn logdet(&self) -> f64 {
        match self {
            Block::Diagonal(d) => 2.0 * d.iter().map(|v| v.ln()).sum::<f64>(),
            Block::BlockDiagonal(bs) => bs.iter().map(logdet_lower).sum(),
            Block::Sparse(s) => logdet_lower(&s.to_dense()),
            Block::Dense(m) => logdet_lower(m),
        }
    }

    /// self ← λᵢ' raw λⱼ (+ I when `add_identity`), keeping self's storage.
    ///
    /// `None` factors stand for the identity (fixed-effects rows).
    pub fn scale_from(
        &mut self,
        raw: &Block,
        left: Option<&DMatrix<f64>>,
        right: Option<&DMatrix<f64>>,
        add_identity: bool,
    ) -> Result<()> {
        match (raw, &mut *self) {
            (Block::Diagonal(a), Block::Diagonal(d)) => {
                let s = scalar_factor(left) * scalar_factor(right);
                for (dst, src) in d.iter_mut().zip(a.iter()) {
                    *dst = src * s;
                }
            }
            (Block::Diagonal(a), Block::Dense(m)) => {
                let s = scalar_factor(left) * scalar_factor(right);
                m.fill(0.0);
                for (l, v) in a.iter().enumerate() {
                    m[(l, l)] = v * s;
                }
            }
            (Block::BlockDiagonal(a), Block::BlockDiagonal(d)) => {
                for (dst, src) in d.iter_mut().zip(a.iter()) {
                    *dst = congruence(src, left, right);
                }
            }
            (Block::BlockDiagonal(a), Block::Dense(m)) => {
                m.fill(0.0);
                let mut offset = 0;
                for src in a {
                    let q = src.nrows();
                    m.view_mut((offset, offset), (q, q))
                        .copy_from(&congruence(src, left, right));
                    offset += q;
                }
            }
            (Block::Sparse(a), Block::Sparse(d)) => {
                if a.col_ptr != d.col_ptr || a.row_levels != d.row_levels {
                    return Err(LmmError::Structure(
                        "sparse factor block does not share the pattern of its source".into(),
                    ));
                }
                for (dst, src) in d.values.iter_mut().zip(a.values.iter()) {
                    *dst = congruence(src, left, right);
                }
            }
            (Block::Sparse(a), Block::Dense(m)) => {
                m.fill(0.0);
                for c in 0..a.ncols {
                    for k in a.column_range(c) {
                        let r = a.row_levels[k];
                        m.view_mut((r * a.row_dim, c * a.col_dim), (a.row_dim, a.col_dim))
                            .copy_from(&congruence(&a.values[k], left, right));
                    }
                }
            }
            (Block::Dense(a), Block::Dense(m)) => {
                m.copy_from(a);
                if let Some(r) = right {
                    let q = r.nrows();
                    for c in 0..m.ncols() / q {
                        let scaled = m.columns(c * q, q) * r;
                        m.columns_mut(c * q, q).copy_from(&scaled);
                    }
                }
                if let Some(l) = left {
                    let q = l.nrows();
                    for r in 0..m.nrows() / q {
                        let scaled = l.tr_mul(&m.rows(r * q, q));
                        m.rows_mut(r * q, q).copy_from(&scaled);
                    }
                }
            }
            (src, dst) => {
                return Err(LmmError::Structure(format!(
                    "cannot scale a {:?} block into {:?} storage",
                    src.storage(),
                    dst.storage()
                )))
            }
        }
        if add_identity {
            self.add_identity();
        }
        Ok(())
    }

    fn add_identity(&mut self) {
        match self {
            Block::Diagonal(d) => d.add_scalar_mut(1.0),
            Block::BlockDiagonal(bs) => {
                for b in bs {
                    for i in 0..b.nrows() {
                        b[(i, i)] += 1.0;
                    }
                }
            }
            Block::Sparse(_) => {}
            Block::Dense(m) => {
                for i in 0..m.nrows().min(m.ncols()) {
                    m[(i, i)] += 1.0;
                }
            }
        }
    }

    /// Subtract `v` from the level block (r, s).
    fn sub_level_block(&mut self, r: usize, s: usize, v: &DMatrix<f64>) -> Result<()> {
        match self {
            Block::Diagonal(d) if r == s => {
                d[r] -= v[(0, 0)];
                Ok(())
            }
            Block::BlockDiagonal(bs) if r == s => {
                bs[r] -= v;
                Ok(())
            }
            Block::Dense(m) => {
                let mut view = m.view_mut((r * v.nrows(), s * v.ncols()), v.shape());
                view -= v;
                Ok(())
            }
            Block::Sparse(sp) => match sp.find(r, s) {
                Some(k) => {
                    sp.values[k] -= v;
                    Ok(())
                }
                None => Err(LmmError::Structure(format!(
                    "update touches level pair ({}, {}) outside the sparse pattern",
                    r, s
                ))),
            },
            other => Err(LmmError::Structure(format!(
                "off-diagonal level update ({}, {}) into {:?} storage",
                r,
                s,
                other.storage()
            ))),
        }
    }

    /// self ← self − a bᵀ, where a and b share the column structure of an
    /// earlier-eliminated term.
    pub fn rank_update(&mut self, a: &Block, b: &Block) -> Result<()> {
        match (a, b) {
            (Block::Sparse(sa), Block::Sparse(sb)) => {
                for c in 0..sa.ncols {
                    for ka in sa.column_range(c) {
                        for kb in sb.column_range(c) {
                            let prod = &sa.values[ka] * sb.values[kb].transpose();
                            self.sub_level_block(sa.row_levels[ka], sb.row_levels[kb], &prod)?;
                        }
                    }
                }
                Ok(())
            }
            (Block::Dense(ma), Block::Dense(mb)) => match self {
                Block::Dense(m) => {
                    m.gemm(-1.0, ma, &mb.transpose(), 1.0);
                    Ok(())
                }
                other => Err(dense_update_error(other)),
            },
            (Block::Dense(ma), Block::Sparse(sb)) => match self {
                Block::Dense(m) => {
                    let qk = sb.col_dim;
                    let qb = sb.row_dim;
                    for c in 0..sb.ncols {
                        let a_cols = ma.columns(c * qk, qk);
                        for kb in sb.column_range(c) {
                            let prod = &a_cols * sb.values[kb].transpose();
                            let mut view = m.columns_mut(sb.row_levels[kb] * qb, qb);
                            view -= prod;
                        }
                    }
                    Ok(())
                }
                other => Err(dense_update_error(other)),
            },
            (Block::Sparse(sa), Block::Dense(mb)) => match self {
                Block::Dense(m) => {
                    let qk = sa.col_dim;
                    let qa = sa.row_dim;
                    for c in 0..sa.ncols {
                        let b_cols = mb.columns(c * qk, qk);
                        for ka in sa.column_range(c) {
                            let prod = &sa.values[ka] * b_cols.transpose();
                            let mut view = m.rows_mut(sa.row_levels[ka] * qa, qa);
                            view -= prod;
                        }
                    }
                    Ok(())
                }
                other => Err(dense_update_error(other)),
            },
            _ => Err(LmmError::Structure(format!(
                "rank update from {:?} and {:?} blocks",
                a.storage(),
                b.storage()
            ))),
        }
    }

    /// Factor a diagonal block in place; `index` names the block in errors.
    pub fn cholesky_in_place(&mut self, index: usize) -> Result<()> {
        let fail = || LmmError::NonPositiveDefinite { block: index };
        match self {
            Block::Diagonal(d) => {
                for v in d.iter_mut() {
                    if !(*v > 0.0) || !v.is_finite() {
                        return Err(fail());
                    }
                    *v = v.sqrt();
                }
                Ok(())
            }
            Block::BlockDiagonal(bs) => {
                let ok = if bs.len() >= PAR_MIN_LEVELS {
                    bs.par_iter_mut().all(cholesky_in_place)
                } else {
                    bs.iter_mut().all(cholesky_in_place)
                };
                if ok {
                    Ok(())
                } else {
                    Err(fail())
                }
            }
            Block::Dense(m) => {
                if cholesky_in_place(m) {
                    Ok(())
                } else {
                    Err(fail())
                }
            }
            Block::Sparse(_) => Err(LmmError::Structure(
                "diagonal blocks cannot use sparse storage".into(),
            )),
        }
    }

    /// self ← self L⁻ᵀ for a factored diagonal block L.
    pub fn right_divide(&mut self, l: &Block, index: usize) -> Result<()> {
        let fail = || LmmError::NonPositiveDefinite { block: index };
        match (l, &mut *self) {
            (Block::Diagonal(d), Block::Sparse(s)) => {
                for c in 0..s.ncols {
                    for k in s.column_range(c) {
                        s.values[k] /= d[c];
                    }
                }
            }
            (Block::Diagonal(d), Block::Dense(m)) => {
                for (c, &dc) in d.iter().enumerate() {
                    m.column_mut(c).unscale_mut(dc);
                }
            }
            (Block::BlockDiagonal(bs), Block::Sparse(s)) => {
                for c in 0..s.ncols {
                    for k in s.column_range(c) {
                        if !right_solve_lower_transpose(&bs[c], &mut s.values[k]) {
                            return Err(fail());
                        }
                    }
                }
            }
            (Block::BlockDiagonal(bs), Block::Dense(m)) => {
                let mut offset = 0;
                for b in bs {
                    let q = b.nrows();
                    if !right_solve_lower_transpose(b, &mut m.columns_mut(offset, q)) {
                        return Err(fail());
                    }
                    offset += q;
                }
            }
            (Block::Dense(lm), Block::Dense(m)) => {
                if !right_solve_lower_transpose(lm, m) {
                    return Err(fail());
                }
            }
            (lb, dst) => {
                return Err(LmmError::Structure(format!(
                    "cannot divide a {:?} block by a {:?} factor",
                    dst.storage(),
                    lb.storage()
                )))
            }
        }
        Ok(())
    }

    /// c ← c − selfᵀ u.
    pub fn tr_mul_sub(&self, u: &DVector<f64>, c: &mut DVector<f64>) {
        match self {
            Block::Diagonal(d) => {
                for i in 0..d.len() {
                    c[i] -= d[i] * u[i];
                }
            }
            Block::BlockDiagonal(bs) => {
                let mut offset = 0;
                for b in bs {
                    let q = b.nrows();
                    let delta = b.tr_mul(&u.rows(offset, q));
                    let mut seg = c.rows_mut(offset, q);
                    seg -= delta;
                    offset += q;
                }
            }
            Block::Sparse(s) => {
                for col in 0..s.ncols {
                    for k in s.column_range(col) {
                        let r = s.row_levels[k];
                        let delta = s.values[k].tr_mul(&u.rows(r * s.row_dim, s.row_dim));
                        let mut seg = c.rows_mut(col * s.col_dim, s.col_dim);
                        seg -= delta;
                    }
                }
            }
            Block::Dense(m) => c.gemv_tr(-1.0, m, u, 1.0),
        }
    }

    /// c ← L⁻ᵀ c for a factored diagonal block L.
    pub fn tr_solve_in_place(&self, c: &mut DVector<f64>, index: usize) -> Result<()> {
        let ok = match self {
            Block::Diagonal(d) => {
                c.component_div_assign(d);
                true
            }
            Block::BlockDiagonal(bs) => {
                let mut offset = 0;
                let mut ok = true;
                for b in bs {
                    let q = b.nrows();
                    ok &= b.tr_solve_lower_triangular_mut(&mut c.rows_mut(offset, q));
                    offset += q;
                }
                ok
            }
            Block::Dense(m) => m.tr_solve_lower_triangular_mut(c),
            Block::Sparse(_) => {
                return Err(LmmError::Structure(
                    "diagonal blocks cannot use sparse storage".into(),
                ))
            }
        };
        if ok {
            Ok(())
        } else {
            Err(LmmError::NonPositiveDefinite { block: index })
        }
    }
}

fn scalar_factor(l: Option<&DMatrix<f64>>) -> f64 {
    l.map_or(1.0, |m| m[(0, 0)])
}

fn dense_update_error(dst: &Block) -> LmmError {
    LmmError::Structure(format!(
        "dense rank update into {:?} storage",
        dst.storage()
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn sample_sparse() -> BlockSparse {
        // 3 row levels x 2 column levels, scalar sub-blocks
        let mut entries = BTreeMap::new();
        entries.insert((0, 0), DMatrix::from_element(1, 1, 2.0));
        entries.insert((0, 2), DMatrix::from_element(1, 1, 1.0));
        entries.insert((1, 1), DMatrix::from_element(1, 1, 3.0));
        BlockSparse::from_entries(3, 2, 1, 1, entries)
    }

    #[test]
    fn test_block_sparse_layout() {
        let s = sample_sparse();
        assert_eq!(s.col_ptr, vec![0, 2, 3]);
        assert_eq!(s.row_levels, vec![0, 2, 1]);
        assert_eq!(s.find(2, 0), Some(1));
        assert_eq!(s.find(1, 0), None);
        let d = s.to_dense();
        assert_eq!(d, DMatrix::from_row_slice(3, 2, &[2.0, 0.0, 0.0, 3.0, 1.0, 0.0]));
        assert_relative_eq!(s.density(), 0.5);
    }

    #[test]
    fn test_scale_sparse_into_dense_matches_dense_path() {
        let s = sample_sparse();
        let li = DMatrix::from_element(1, 1, 0.5);
        let lj = DMatrix::from_element(1, 1, 2.0);
        let mut via_sparse = Block::Dense(DMatrix::zeros(3, 2));
        via_sparse
            .scale_from(&Block::Sparse(s.clone()), Some(&li), Some(&lj), false)
            .unwrap();
        let mut via_dense = Block::Dense(DMatrix::zeros(3, 2));
        via_dense
            .scale_from(&Block::Dense(s.to_dense()), Some(&li), Some(&lj), false)
            .unwrap();
        assert_relative_eq!(via_sparse.to_dense(), via_dense.to_dense());
        assert_relative_eq!(via_sparse.to_dense(), s.to_dense());
    }

    #[test]
    fn test_scale_block_diagonal_adds_identity() {
        let raw = Block::BlockDiagonal(vec![DMatrix::from_row_slice(2, 2, &[4.0, 2.0, 2.0, 3.0])]);
        let lambda = DMatrix::from_row_slice(2, 2, &[1.0, 0.0, 0.5, 2.0]);
        let mut dst = Block::BlockDiagonal(vec![DMatrix::zeros(2, 2)]);
        dst.scale_from(&raw, Some(&lambda), Some(&lambda), true).unwrap();
        let expected = lambda.transpose() * raw.to_dense() * &lambda + DMatrix::identity(2, 2);
        assert_relative_eq!(dst.to_dense(), expected, epsilon = 1e-12);
    }

    #[test]
    fn test_scale_rejects_mismatched_storage() {
        let raw = Block::Dense(DMatrix::zeros(2, 2));
        let mut dst = Block::Diagonal(DVector::zeros(2));
        assert!(matches!(
            dst.scale_from(&raw, None, None, false),
            Err(LmmError::Structure(_))
        ));
    }

    #[test]
    fn test_rank_update_kinds_agree() {
        let s = sample_sparse();
        let dense = s.to_dense();
        let expected = DMatrix::identity(3, 3) * 10.0 - &dense * dense.transpose();

        let mut from_sparse = Block::Dense(DMatrix::identity(3, 3) * 10.0);
        from_sparse
            .rank_update(&Block::Sparse(s.clone()), &Block::Sparse(s.clone()))
            .unwrap();
        assert_relative_eq!(from_sparse.to_dense(), expected);

        let mut from_dense = Block::Dense(DMatrix::identity(3, 3) * 10.0);
        from_dense
            .rank_update(&Block::Dense(dense.clone()), &Block::Dense(dense.clone()))
            .unwrap();
        assert_relative_eq!(from_dense.to_dense(), expected);

        let mut mixed = Block::Dense(DMatrix::identity(3, 3) * 10.0);
        mixed
            .rank_update(&Block::Dense(dense.clone()), &Block::Sparse(s.clone()))
            .unwrap();
        assert_relative_eq!(mixed.to_dense(), expected);

        let mut mixed2 = Block::Dense(DMatrix::identity(3, 3) * 10.0);
        mixed2
            .rank_update(&Block::Sparse(s.clone()), &Block::Dense(dense))
            .unwrap();
        assert_relative_eq!(mixed2.to_dense(), expected);
    }

    #[test]
    fn test_rank_update_off_pattern_into_diagonal_fails() {
        // column 0 holds rows 0 and 2, so the update is not level-diagonal
        let s = sample_sparse();
        let mut diag = Block::Diagonal(DVector::from_element(3, 10.0));
        assert!(matches!(
            diag.rank_update(&Block::Sparse(s.clone()), &Block::Sparse(s)),
            Err(LmmError::Structure(_))
        ));
    }

    #[test]
    fn test_cholesky_and_solves() {
        let a = DMatrix::from_row_slice(3, 3, &[4.0, 2.0, 0.6, 2.0, 5.0, 1.0, 0.6, 1.0, 3.0]);
        let mut l = Block::Dense(a.clone());
        l.cholesky_in_place(0).unwrap();
        let ld = l.to_dense();
        assert_relative_eq!(&ld * ld.transpose(), a, epsilon = 1e-12);
        assert_relative_eq!(l.logdet(), a.determinant().ln(), epsilon = 1e-12);

        let mut c = DVector::from_column_slice(&[1.0, 2.0, 3.0]);
        l.tr_solve_in_place(&mut c, 0).unwrap();
        assert_relative_eq!(
            ld.transpose() * &c,
            DVector::from_column_slice(&[1.0, 2.0, 3.0]),
            epsilon = 1e-12
        );

        let d0 = DMatrix::from_row_slice(2, 3, &[1.0, 0.0, 2.0, 0.5, 1.0, 1.5]);
        let mut d = Block::Dense(d0.clone());
        d.right_divide(&l, 0).unwrap();
        assert_relative_eq!(d.to_dense() * ld.transpose(), d0, epsilon = 1e-12);
    }

    #[test]
    fn test_diagonal_cholesky_rejects_nonpositive() {
        let mut d = Block::Diagonal(DVector::from_column_slice(&[4.0, -1.0]));
        assert!(matches!(
            d.cholesky_in_place(3),
            Err(LmmError::NonPositiveDefinite { block: 3 })
        ));
    }

    #[test]
    fn test_block_diagonal_parallel_path() {
        let blocks: Vec<DMatrix<f64>> = (0..PAR_MIN_LEVELS + 5)
            .map(|i| DMatrix::from_row_slice(2, 2, &[2.0 + i as f64, 1.0, 1.0, 2.0]))
            .collect();
        let mut b = Block::BlockDiagonal(blocks.clone());
        b.cholesky_in_place(0).unwrap();
        if let Block::BlockDiagonal(ls) = &b {
            for (l, a) in ls.iter().zip(blocks.iter()) {
                assert_relative_eq!(l * l.transpose(), a.clone(), epsilon = 1e-10);
            }
        } else {
            panic!("storage changed during factorization");
        }
    }

    #[test]
    fn test_tr_mul_sub_sparse_matches_dense() {
        let s = sample_sparse();
        let u = DVector::from_column_slice(&[1.0, -2.0, 0.5]);
        let mut c_sparse = DVector::from_column_slice(&[1.0, 1.0]);
        Block::Sparse(s.clone()).tr_mul_sub(&u, &mut c_sparse);
        let mut c_dense = DVector::from_column_slice(&[1.0, 1.0]);
        Block::Dense(s.to_dense()).tr_mul_sub(&u, &mut c_dense);
        assert_relative_eq!(c_sparse, c_dense, epsilon = 1e-12);
    }
}
