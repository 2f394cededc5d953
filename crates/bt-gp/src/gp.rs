//! Gaussian-process surrogate: hyperparameters, marginal likelihood and the
//! posterior predictive distribution.

use bt_types::{validation_error, NumericalError, TuneResult};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2};
use serde::{Deserialize, Serialize};

use crate::kernel::{covariance, CovarianceKind};
use crate::linalg::{add_diagonal, cho_solve, cholesky, log_det, solve_lower_matrix};

/// Ridge added (scaled by the amplitude) to every self-covariance before
/// factorization.
pub const JITTER: f64 = 1e-6;

/// One sample of the surrogate's hyperparameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GpHypers {
    /// Constant prior mean.
    pub mean: f64,
    /// Signal variance a^2.
    pub amp2: f64,
    /// Observation noise variance n^2.
    pub noise: f64,
    /// One length scale per input dimension.
    pub ls: Array1<f64>,
}

impl GpHypers {
    pub fn new(mean: f64, amp2: f64, noise: f64, ls: Array1<f64>) -> Self {
        Self {
            mean,
            amp2,
            noise,
            ls,
        }
    }

    /// Inside the support of the prior: non-negative variances and every
    /// length scale in (0, max_ls].
    pub fn is_valid(&self, max_ls: f64) -> bool {
        self.amp2 >= 0.0
            && self.noise >= 0.0
            && self.ls.iter().all(|&l| l > 0.0 && l <= max_ls)
    }

    pub fn dim(&self) -> usize {
        self.ls.len()
    }
}

/// `a^2 (K + jitter I) + n^2 I` for the training points.
pub fn train_covariance(kind: CovarianceKind, hypers: &GpHypers, x: ArrayView2<f64>) -> Array2<f64> {
    let mut k = covariance(kind, hypers.ls.view(), x, None);
    add_diagonal(&mut k, JITTER);
    k *= hypers.amp2;
    add_diagonal(&mut k, hypers.noise);
    k
}

/// `a^2 K(x1, x2)`, no jitter.
pub fn cross_covariance(
    kind: CovarianceKind,
    hypers: &GpHypers,
    x1: ArrayView2<f64>,
    x2: ArrayView2<f64>,
) -> Array2<f64> {
    covariance(kind, hypers.ls.view(), x1, Some(x2)) * hypers.amp2
}

/// Prior variance of the latent function at any single point.
pub fn prior_variance(hypers: &GpHypers) -> f64 {
    hypers.amp2 * (1.0 + JITTER)
}

/// Gaussian log marginal likelihood of `y` under the GP prior.
///
/// Fails with a numerical error if the jittered covariance is not positive
/// definite.
pub fn log_marginal_likelihood(
    kind: CovarianceKind,
    hypers: &GpHypers,
    x: ArrayView2<f64>,
    y: ArrayView1<f64>,
) -> TuneResult<f64> {
    check_shapes(hypers, x, y)?;
    let chol = cholesky(&train_covariance(kind, hypers, x))?;
    let residual = y.mapv(|v| v - hypers.mean);
    let alpha = cho_solve(&chol, residual.view());
    let n = y.len() as f64;
    Ok(-0.5 * residual.dot(&alpha)
        - 0.5 * log_det(&chol)
        - 0.5 * n * (2.0 * std::f64::consts::PI).ln())
}

/// A GP conditioned on training data, ready for prediction.
#[derive(Debug, Clone)]
pub struct GaussianProcess {
    kind: CovarianceKind,
    hypers: GpHypers,
    x: Array2<f64>,
    chol: Array2<f64>,
    alpha: Array1<f64>,
}

impl GaussianProcess {
    pub fn fit(
        kind: CovarianceKind,
        hypers: GpHypers,
        x: ArrayView2<f64>,
        y: ArrayView1<f64>,
    ) -> TuneResult<Self> {
        check_shapes(&hypers, x, y)?;
        let chol = cholesky(&train_covariance(kind, &hypers, x))?;
        let residual = y.mapv(|v| v - hypers.mean);
        let alpha = cho_solve(&chol, residual.view());
        Ok(Self {
            kind,
            hypers,
            x: x.to_owned(),
            chol,
            alpha,
        })
    }

    pub fn hypers(&self) -> &GpHypers {
        &self.hypers
    }

    pub fn chol(&self) -> &Array2<f64> {
        &self.chol
    }

    /// Posterior mean and variance of the latent function at each test row.
    /// Variances are floored at zero.
    pub fn predict(&self, xtest: ArrayView2<f64>) -> (Array1<f64>, Array1<f64>) {
        let cross = cross_covariance(self.kind, &self.hypers, self.x.view(), xtest);
        let mean = cross.t().dot(&self.alpha) + self.hypers.mean;
        let beta = solve_lower_matrix(&self.chol, cross.view());
        let prior = prior_variance(&self.hypers);
        let var = beta
            .columns()
            .into_iter()
            .map(|col| (prior - col.dot(&col)).max(0.0))
            .collect();
        (mean, var)
    }

    /// Full posterior covariance between the test rows.
    pub fn predict_covariance(&self, xtest: ArrayView2<f64>) -> (Array1<f64>, Array2<f64>) {
        let cross = cross_covariance(self.kind, &self.hypers, self.x.view(), xtest);
        let mean = cross.t().dot(&self.alpha) + self.hypers.mean;
        let beta = solve_lower_matrix(&self.chol, cross.view());
        let mut cov = covariance(self.kind, self.hypers.ls.view(), xtest, None);
        add_diagonal(&mut cov, JITTER);
        cov *= self.hypers.amp2;
        cov -= &beta.t().dot(&beta);
        (mean, cov)
    }
}

/// Posterior predictive mean and variance at `xtest`.
pub fn predict(
    kind: CovarianceKind,
    hypers: &GpHypers,
    xtrain: ArrayView2<f64>,
    ytrain: ArrayView1<f64>,
    xtest: ArrayView2<f64>,
) -> TuneResult<(Array1<f64>, Array1<f64>)> {
    let gp = GaussianProcess::fit(kind, hypers.clone(), xtrain, ytrain)?;
    Ok(gp.predict(xtest))
}

fn check_shapes(hypers: &GpHypers, x: ArrayView2<f64>, y: ArrayView1<f64>) -> TuneResult<()> {
    if x.nrows() != y.len() {
        return Err(validation_error!(
            "{} training points but {} targets",
            x.nrows(),
            y.len()
        ));
    }
    if x.ncols() != hypers.dim() {
        return Err(validation_error!(
            "points have dimension {}, hyperparameters {}",
            x.ncols(),
            hypers.dim()
        ));
    }
    if y.iter().any(|v| !v.is_finite()) {
        return Err(NumericalError::NonFinite {
            what: "training targets".to_string(),
        }
        .into());
    }
    Ok(())
}
