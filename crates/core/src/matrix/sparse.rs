use sprs::{CsMat, TriMat};

/// Incremental sparse matrix builder using triplet (COO) format.
///
/// Duplicate entries at the same (row, col) are summed when converting to CSC.
#[derive(Debug)]
pub struct TripletBuilder {
    triplet: TriMat<f64>,
}

impl TripletBuilder {
    pub fn new(nrow: usize, ncol: usize) -> Self {
        Self {
            triplet: TriMat::new((nrow, ncol)),
        }
    }

    /// Add a value at (row, col). Duplicate entries will be summed.
    pub fn add(&mut self, row: usize, col: usize, val: f64) {
        self.triplet.add_triplet(row, col, val);
    }

    pub fn to_csc(&self) -> CsMat<f64> {
        self.triplet.to_csc()
    }
}

/// Co-occurrence counts of two grouping factors.
///
/// Entry (r, c) counts the observations at level r of the row factor and
/// level c of the column factor.
pub fn level_incidence(
    row_refs: &[usize],
    nrow: usize,
    col_refs: &[usize],
    ncol: usize,
) -> CsMat<f64> {
    assert_eq!(row_refs.len(), col_refs.len());
    let mut builder = TripletBuilder::new(nrow, ncol);
    for (&r, &c) in row_refs.iter().zip(col_refs.iter()) {
        builder.add(r, c, 1.0);
    }
    builder.to_csc()
}

/// Whether every column of `m` has at most one stored entry.
pub fn columns_have_single_entry(m: &CsMat<f64>) -> bool {
    if m.is_csc() {
        m.outer_iterator().all(|col| col.nnz() <= 1)
    } else {
        columns_have_single_entry(&m.to_csc())
    }
}

/// Multiply a sparse matrix by a dense vector: result = A * x.
pub fn spmv(a: &CsMat<f64>, x: &[f64]) -> Vec<f64> {
    assert_eq!(a.cols(), x.len());
    let mut result = vec![0.0; a.rows()];
    for (val, (row, col)) in a.iter() {
        result[row] += val * x[col];
    }
    result
}
