//! Cholesky factorization and triangular solves on top of `faer`.
//!
//! Factors are handed around as ndarray matrices; each routine copies into a
//! `faer::Mat`, runs the dense kernel there and copies back.

use bt_types::NumericalError;
use faer::linalg::solvers::Llt;
use faer::linalg::triangular_solve::{
    solve_lower_triangular_in_place, solve_upper_triangular_in_place,
};
use faer::{Mat, MatRef, Par, Side};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2};

fn to_faer(a: ArrayView2<f64>) -> Mat<f64> {
    Mat::from_fn(a.nrows(), a.ncols(), |i, j| a[[i, j]])
}

fn column_to_faer(b: ArrayView1<f64>) -> Mat<f64> {
    Mat::from_fn(b.len(), 1, |i, _| b[i])
}

fn from_faer(m: MatRef<'_, f64>) -> Array2<f64> {
    Array2::from_shape_fn((m.nrows(), m.ncols()), |(i, j)| m[(i, j)])
}

fn column_from_faer(m: MatRef<'_, f64>) -> Array1<f64> {
    Array1::from_shape_fn(m.nrows(), |i| m[(i, 0)])
}

/// Lower-triangular Cholesky factor `L` with `a = L L^T`. Only the lower
/// triangle of `a` is read.
pub fn cholesky(a: &Array2<f64>) -> Result<Array2<f64>, NumericalError> {
    let n = a.nrows();
    let not_pd = || NumericalError::NotPositiveDefinite { size: n };
    if a.iter().any(|v| !v.is_finite()) {
        return Err(not_pd());
    }
    let llt = Llt::new(to_faer(a.view()).as_ref(), Side::Lower).map_err(|_| not_pd())?;
    let l = llt.L();
    Ok(Array2::from_shape_fn((n, n), |(i, j)| {
        if j <= i {
            l[(i, j)]
        } else {
            0.0
        }
    }))
}

/// Solve `L X = B`.
pub fn solve_lower_matrix(l: &Array2<f64>, b: ArrayView2<f64>) -> Array2<f64> {
    let factor = to_faer(l.view());
    let mut rhs = to_faer(b);
    solve_lower_triangular_in_place(factor.as_ref(), rhs.as_mut(), Par::Seq);
    from_faer(rhs.as_ref())
}

/// Solve `L x = b`.
pub fn solve_lower(l: &Array2<f64>, b: ArrayView1<f64>) -> Array1<f64> {
    let factor = to_faer(l.view());
    let mut rhs = column_to_faer(b);
    solve_lower_triangular_in_place(factor.as_ref(), rhs.as_mut(), Par::Seq);
    column_from_faer(rhs.as_ref())
}

/// Solve `L^T x = b`.
pub fn solve_lower_transpose(l: &Array2<f64>, b: ArrayView1<f64>) -> Array1<f64> {
    let factor = to_faer(l.view());
    let mut rhs = column_to_faer(b);
    solve_upper_triangular_in_place(factor.as_ref().transpose(), rhs.as_mut(), Par::Seq);
    column_from_faer(rhs.as_ref())
}

/// Solve `(L L^T) X = B`.
pub fn cho_solve_matrix(l: &Array2<f64>, b: ArrayView2<f64>) -> Array2<f64> {
    let factor = to_faer(l.view());
    let mut rhs = to_faer(b);
    solve_lower_triangular_in_place(factor.as_ref(), rhs.as_mut(), Par::Seq);
    solve_upper_triangular_in_place(factor.as_ref().transpose(), rhs.as_mut(), Par::Seq);
    from_faer(rhs.as_ref())
}

/// Solve `(L L^T) x = b`.
pub fn cho_solve(l: &Array2<f64>, b: ArrayView1<f64>) -> Array1<f64> {
    let factor = to_faer(l.view());
    let mut rhs = column_to_faer(b);
    solve_lower_triangular_in_place(factor.as_ref(), rhs.as_mut(), Par::Seq);
    solve_upper_triangular_in_place(factor.as_ref().transpose(), rhs.as_mut(), Par::Seq);
    column_from_faer(rhs.as_ref())
}

/// `log det(L L^T)`.
pub fn log_det(l: &Array2<f64>) -> f64 {
    2.0 * l.diag().iter().map(|v| v.ln()).sum::<f64>()
}

/// Add `value` to the diagonal in place.
pub fn add_diagonal(a: &mut Array2<f64>, value: f64) {
    a.diag_mut().mapv_inplace(|v| v + value);
}
