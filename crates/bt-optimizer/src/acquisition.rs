//! Expected Improvement marginalized over a hyperparameter pool and over
//! fantasized outcomes of pending evaluations.
//!
//! [`ExpectedImprovement::prepare`] does all of the per-iteration work that
//! does not depend on the candidate: one Cholesky factor per pool member, the
//! fantasy draws for pending points, and the resulting regression weights.
//! The prepared value is immutable, so candidate scoring and gradient
//! refinement can share it across threads.

use bt_gp::{
    covariance_gradient, cross_covariance, prior_variance, train_covariance, CovarianceKind,
    FeasibilityModel, GaussianProcess, GpHypers,
};
use bt_gp::linalg::{cho_solve_matrix, cholesky, solve_lower, solve_lower_matrix, solve_lower_transpose};
use bt_gp::normal::{cdf, pdf};
use bt_types::{validation_error, TuneResult};
use ndarray::{concatenate, Array1, Array2, ArrayView1, ArrayView2, Axis};
use rand::Rng;
use rand_distr::StandardNormal;

/// Closed-form EI for a minimization problem. Zero when `sd` is zero.
pub fn ei_from_moments(best: f64, mean: f64, sd: f64) -> f64 {
    if sd <= 0.0 {
        return 0.0;
    }
    let u = (best - mean) / sd;
    (sd * (u * cdf(u) + pdf(u))).max(0.0)
}

/// Per-hyperparameter-sample state conditioned on observed and fantasized data.
#[derive(Debug, Clone)]
struct PreparedSample {
    hypers: GpHypers,
    /// Observed points followed by pending points.
    train_x: Array2<f64>,
    chol: Array2<f64>,
    /// Regression weights, one column per fantasy.
    alpha: Array2<f64>,
    /// Incumbent per fantasy.
    bests: Array1<f64>,
}

/// Prepared acquisition function for one optimizer iteration.
#[derive(Debug, Clone)]
pub struct ExpectedImprovement {
    kind: CovarianceKind,
    dim: usize,
    samples: Vec<PreparedSample>,
    feasibility: Vec<FeasibilityModel>,
}

impl ExpectedImprovement {
    /// Condition every pool member on the observations and, when pending
    /// points exist, on `pending_samples` joint fantasies of their outcomes.
    pub fn prepare<R: Rng + ?Sized>(
        kind: CovarianceKind,
        pool: &[GpHypers],
        x_obs: ArrayView2<f64>,
        y_obs: ArrayView1<f64>,
        x_pend: ArrayView2<f64>,
        pending_samples: usize,
        rng: &mut R,
    ) -> TuneResult<Self> {
        if pool.is_empty() {
            return Err(validation_error!("hyperparameter pool is empty"));
        }
        if y_obs.is_empty() || x_obs.nrows() != y_obs.len() {
            return Err(validation_error!(
                "need matching observations, got {} points and {} values",
                x_obs.nrows(),
                y_obs.len()
            ));
        }
        let dim = x_obs.ncols();
        if x_pend.nrows() > 0 && x_pend.ncols() != dim {
            return Err(validation_error!(
                "pending points have dimension {}, observations {}",
                x_pend.ncols(),
                dim
            ));
        }

        let samples = pool
            .iter()
            .map(|hypers| {
                prepare_sample(kind, hypers, x_obs, y_obs, x_pend, pending_samples.max(1), rng)
            })
            .collect::<TuneResult<Vec<_>>>()?;

        Ok(Self {
            kind,
            dim,
            samples,
            feasibility: Vec::new(),
        })
    }

    /// Weight EI by the probability of feasibility, one classifier per pool
    /// member.
    pub fn with_feasibility(mut self, models: Vec<FeasibilityModel>) -> TuneResult<Self> {
        if models.len() != self.samples.len() {
            return Err(validation_error!(
                "{} feasibility models for a pool of {}",
                models.len(),
                self.samples.len()
            ));
        }
        self.feasibility = models;
        Ok(self)
    }

    pub fn pool_size(&self) -> usize {
        self.samples.len()
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    /// EI per pool member (rows) and candidate (columns).
    pub fn per_sample(&self, candidates: ArrayView2<f64>) -> TuneResult<Array2<f64>> {
        self.check_candidates(candidates)?;
        let mut out = Array2::zeros((self.samples.len(), candidates.nrows()));
        for (s, sample) in self.samples.iter().enumerate() {
            let cross = cross_covariance(self.kind, &sample.hypers, sample.train_x.view(), candidates);
            let means = cross.t().dot(&sample.alpha) + sample.hypers.mean;
            let beta = solve_lower_matrix(&sample.chol, cross.view());
            let prior = prior_variance(&sample.hypers);
            let fantasies = sample.bests.len() as f64;

            for c in 0..candidates.nrows() {
                let col = beta.column(c);
                let sd = (prior - col.dot(&col)).max(0.0).sqrt();
                let mut total = 0.0;
                for (f, &best) in sample.bests.iter().enumerate() {
                    total += ei_from_moments(best, means[[c, f]], sd);
                }
                let mut value = total / fantasies;
                if let Some(model) = self.feasibility.get(s) {
                    value *= model.probability(candidates.row(c));
                }
                out[[s, c]] = value;
            }
        }
        Ok(out)
    }

    /// EI at one point for every pool member (rows) and fantasy (columns),
    /// before averaging. Without pending points there is one column.
    pub fn per_fantasy(&self, point: ArrayView1<f64>) -> TuneResult<Array2<f64>> {
        let row = point.insert_axis(Axis(0));
        self.check_candidates(row)?;
        let fantasies = self.samples.first().map_or(0, |s| s.bests.len());
        let mut out = Array2::zeros((self.samples.len(), fantasies));
        for (s, sample) in self.samples.iter().enumerate() {
            let cross = cross_covariance(self.kind, &sample.hypers, sample.train_x.view(), row);
            let means = cross.t().dot(&sample.alpha) + sample.hypers.mean;
            let beta = solve_lower_matrix(&sample.chol, cross.view());
            let col = beta.column(0);
            let sd = (prior_variance(&sample.hypers) - col.dot(&col)).max(0.0).sqrt();
            let weight = self
                .feasibility
                .get(s)
                .map_or(1.0, |model| model.probability(point));
            for (f, &best) in sample.bests.iter().enumerate() {
                out[[s, f]] = weight * ei_from_moments(best, means[[0, f]], sd);
            }
        }
        Ok(out)
    }

    /// EI averaged over the pool, one value per candidate.
    pub fn evaluate(&self, candidates: ArrayView2<f64>) -> TuneResult<Array1<f64>> {
        let per_sample = self.per_sample(candidates)?;
        per_sample
            .mean_axis(Axis(0))
            .ok_or_else(|| validation_error!("hyperparameter pool is empty"))
    }

    /// Pool-averaged EI at one point and its gradient with respect to the
    /// point's coordinates.
    pub fn value_and_gradient(&self, point: ArrayView1<f64>) -> TuneResult<(f64, Array1<f64>)> {
        let row = point.insert_axis(Axis(0));
        self.check_candidates(row)?;

        let mut value = 0.0;
        let mut grad = Array1::zeros(self.dim);
        for (s, sample) in self.samples.iter().enumerate() {
            let (mut v, mut g) = self.sample_value_and_gradient(sample, row);
            if let Some(model) = self.feasibility.get(s) {
                let (p, dp) = model.probability_and_gradient(point);
                g = &g * p + &(&dp * v);
                v *= p;
            }
            value += v;
            grad += &g;
        }
        let n = self.samples.len() as f64;
        Ok((value / n, grad / n))
    }

    fn sample_value_and_gradient(
        &self,
        sample: &PreparedSample,
        row: ArrayView2<f64>,
    ) -> (f64, Array1<f64>) {
        let hypers = &sample.hypers;
        let k = cross_covariance(self.kind, hypers, sample.train_x.view(), row)
            .column(0)
            .to_owned();
        let dk_full = covariance_gradient(self.kind, hypers.ls.view(), sample.train_x.view(), row);
        let dk: Array2<f64> = dk_full.index_axis(Axis(1), 0).to_owned() * hypers.amp2;

        let beta = solve_lower(&sample.chol, k.view());
        let var = prior_variance(hypers) - beta.dot(&beta);
        if var <= 0.0 {
            return (0.0, Array1::zeros(self.dim));
        }
        let sd = var.sqrt();
        let gamma = solve_lower_transpose(&sample.chol, beta.view());
        let dsd = dk.t().dot(&gamma) * (-1.0 / sd);

        let means = sample.alpha.t().dot(&k) + hypers.mean;
        let dmeans = dk.t().dot(&sample.alpha);

        let fantasies = sample.bests.len() as f64;
        let mut value = 0.0;
        let mut grad = Array1::<f64>::zeros(self.dim);
        for (f, &best) in sample.bests.iter().enumerate() {
            let u = (best - means[f]) / sd;
            let (cu, pu) = (cdf(u), pdf(u));
            value += (sd * (u * cu + pu)).max(0.0);
            grad += &(&dsd * pu - &(&dmeans.column(f) * cu));
        }
        (value / fantasies, grad / fantasies)
    }

    fn check_candidates(&self, candidates: ArrayView2<f64>) -> TuneResult<()> {
        if candidates.ncols() != self.dim {
            return Err(validation_error!(
                "candidates have dimension {}, model {}",
                candidates.ncols(),
                self.dim
            ));
        }
        if let Some(v) = candidates.iter().find(|v| !(0.0..=1.0).contains(*v)) {
            return Err(validation_error!(
                "candidate coordinate {v} lies outside the unit cube"
            ));
        }
        Ok(())
    }
}

fn prepare_sample<R: Rng + ?Sized>(
    kind: CovarianceKind,
    hypers: &GpHypers,
    x_obs: ArrayView2<f64>,
    y_obs: ArrayView1<f64>,
    x_pend: ArrayView2<f64>,
    pending_samples: usize,
    rng: &mut R,
) -> TuneResult<PreparedSample> {
    let n_obs = x_obs.nrows();
    let n_pend = x_pend.nrows();

    let (train_x, targets) = if n_pend == 0 {
        let targets = y_obs.to_owned().insert_axis(Axis(1));
        (x_obs.to_owned(), targets)
    } else {
        // Joint fantasies of the pending outcomes under this sample's posterior.
        let observed = GaussianProcess::fit(kind, hypers.clone(), x_obs, y_obs)?;
        let (pend_mean, pend_cov) = observed.predict_covariance(x_pend);
        let pend_chol = cholesky(&pend_cov)?;
        let z: Array2<f64> =
            Array2::from_shape_simple_fn((n_pend, pending_samples), || rng.sample(StandardNormal));
        let fantasies = pend_chol.dot(&z) + &pend_mean.insert_axis(Axis(1));

        let mut targets = Array2::zeros((n_obs + n_pend, pending_samples));
        for (i, &y) in y_obs.iter().enumerate() {
            targets.row_mut(i).fill(y);
        }
        targets
            .slice_mut(ndarray::s![n_obs.., ..])
            .assign(&fantasies);
        let train_x = concatenate![Axis(0), x_obs, x_pend];
        (train_x, targets)
    };

    let chol = cholesky(&train_covariance(kind, hypers, train_x.view()))?;
    let alpha = cho_solve_matrix(&chol, (targets.clone() - hypers.mean).view());
    let bests = targets
        .columns()
        .into_iter()
        .map(|col| col.iter().copied().fold(f64::INFINITY, f64::min))
        .collect();

    Ok(PreparedSample {
        hypers: hypers.clone(),
        train_x,
        chol,
        alpha,
        bests,
    })
}

/// Pool-averaged EI at `candidates`.
#[allow(clippy::too_many_arguments)]
pub fn expected_improvement<R: Rng + ?Sized>(
    kind: CovarianceKind,
    pool: &[GpHypers],
    x_obs: ArrayView2<f64>,
    y_obs: ArrayView1<f64>,
    x_pend: ArrayView2<f64>,
    candidates: ArrayView2<f64>,
    pending_samples: usize,
    rng: &mut R,
) -> TuneResult<Array1<f64>> {
    ExpectedImprovement::prepare(kind, pool, x_obs, y_obs, x_pend, pending_samples, rng)?
        .evaluate(candidates)
}
