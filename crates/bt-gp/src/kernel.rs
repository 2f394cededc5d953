//! Stationary ARD covariance functions and their input gradients.
//!
//! All functions are pure: inputs are row-major point matrices (one point per
//! row) and a positive length scale per column.

use ndarray::{Array2, Array3, ArrayView1, ArrayView2};
use serde::{Deserialize, Serialize};

/// Supported kernel families. All have unit variance at zero distance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CovarianceKind {
    SquaredExponential,
    Matern32,
    #[default]
    Matern52,
}

impl CovarianceKind {
    /// Kernel value as a function of the scaled squared distance.
    pub fn from_r2(self, r2: f64) -> f64 {
        let r2 = r2.max(0.0);
        match self {
            Self::SquaredExponential => (-0.5 * r2).exp(),
            Self::Matern32 => {
                let r = (3.0 * r2).sqrt();
                (1.0 + r) * (-r).exp()
            }
            Self::Matern52 => {
                let r = (5.0 * r2).sqrt();
                (1.0 + r + 5.0 / 3.0 * r2) * (-r).exp()
            }
        }
    }

    /// Derivative of [`Self::from_r2`] with respect to r2.
    pub fn d_from_r2(self, r2: f64) -> f64 {
        let r2 = r2.max(0.0);
        match self {
            Self::SquaredExponential => -0.5 * (-0.5 * r2).exp(),
            Self::Matern32 => -1.5 * (-(3.0 * r2).sqrt()).exp(),
            Self::Matern52 => {
                let r = (5.0 * r2).sqrt();
                -5.0 / 6.0 * (1.0 + r) * (-r).exp()
            }
        }
    }
}

/// Pairwise squared distances after dividing each column by its length scale.
///
/// With `x2 = None` the result is computed against `x1` itself and is exactly
/// symmetric.
pub fn squared_distance(
    ls: ArrayView1<f64>,
    x1: ArrayView2<f64>,
    x2: Option<ArrayView2<f64>>,
) -> Array2<f64> {
    let dist = |a: ArrayView1<f64>, b: ArrayView1<f64>| -> f64 {
        a.iter()
            .zip(b.iter())
            .zip(ls.iter())
            .map(|((p, q), l)| {
                let d = (p - q) / l;
                d * d
            })
            .sum()
    };

    match x2 {
        Some(x2) => {
            let mut out = Array2::zeros((x1.nrows(), x2.nrows()));
            for (i, a) in x1.rows().into_iter().enumerate() {
                for (j, b) in x2.rows().into_iter().enumerate() {
                    out[[i, j]] = dist(a, b);
                }
            }
            out
        }
        None => {
            let n = x1.nrows();
            let mut out = Array2::zeros((n, n));
            for i in 0..n {
                for j in (i + 1)..n {
                    let d = dist(x1.row(i), x1.row(j));
                    out[[i, j]] = d;
                    out[[j, i]] = d;
                }
            }
            out
        }
    }
}

/// Kernel matrix between `x1` and `x2` (or `x1` with itself).
pub fn covariance(
    kind: CovarianceKind,
    ls: ArrayView1<f64>,
    x1: ArrayView2<f64>,
    x2: Option<ArrayView2<f64>>,
) -> Array2<f64> {
    squared_distance(ls, x1, x2).mapv_into(|r2| kind.from_r2(r2))
}

/// Gradient of `covariance(kind, ls, x1, x2)` with respect to the rows of
/// `x2`: element `[i, j, d]` is dK[i, j] / dx2[j, d].
pub fn covariance_gradient(
    kind: CovarianceKind,
    ls: ArrayView1<f64>,
    x1: ArrayView2<f64>,
    x2: ArrayView2<f64>,
) -> Array3<f64> {
    let dim = ls.len();
    let r2 = squared_distance(ls, x1, Some(x2));
    let mut grad = Array3::zeros((x1.nrows(), x2.nrows(), dim));
    for i in 0..x1.nrows() {
        for j in 0..x2.nrows() {
            let dk = kind.d_from_r2(r2[[i, j]]);
            for d in 0..dim {
                let dr2 = -2.0 * (x1[[i, d]] - x2[[j, d]]) / (ls[d] * ls[d]);
                grad[[i, j, d]] = dk * dr2;
            }
        }
    }
    grad
}
