use nalgebra::storage::StorageMut;
use nalgebra::{DMatrix, Dyn, Matrix};

/// Replace a symmetric positive-definite matrix by its lower Cholesky factor.
///
/// Only the lower triangle is read. Returns `false` (and leaves a zero matrix
/// of the same shape) when the matrix is not positive definite.
pub fn cholesky_in_place(m: &mut DMatrix<f64>) -> bool {
    let (r, c) = m.shape();
    let owned = std::mem::replace(m, DMatrix::zeros(0, 0));
    match owned.cholesky() {
        Some(chol) => {
            *m = chol.unpack();
            true
        }
        None => {
            *m = DMatrix::zeros(r, c);
            false
        }
    }
}

/// d ← d L⁻ᵀ for lower-triangular L.
pub fn right_solve_lower_transpose<S>(l: &DMatrix<f64>, d: &mut Matrix<f64, Dyn, Dyn, S>) -> bool
where
    S: StorageMut<f64, Dyn, Dyn>,
{
    let mut t = d.transpose();
    if !l.solve_lower_triangular_mut(&mut t) {
        return false;
    }
    d.copy_from(&t.transpose());
    true
}

/// λᵢ' v λⱼ, with `None` standing for the identity.
pub fn congruence(
    v: &DMatrix<f64>,
    left: Option<&DMatrix<f64>>,
    right: Option<&DMatrix<f64>>,
) -> DMatrix<f64> {
    let scaled = match right {
        Some(r) => v * r,
        None => v.clone(),
    };
    match left {
        Some(l) => l.tr_mul(&scaled),
        None => scaled,
    }
}

/// 2 Σ log diag(L).
pub fn logdet_lower(l: &DMatrix<f64>) -> f64 {
    2.0 * l.diagonal().iter().map(|d| d.ln()).sum::<f64>()
}

/// L⁻¹ for a lower-triangular L.
pub fn lower_inverse(l: &DMatrix<f64>) -> Option<DMatrix<f64>> {
    l.solve_lower_triangular(&DMatrix::identity(l.nrows(), l.ncols()))
}
