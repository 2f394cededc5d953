//! Latent-GP feasibility classifier for constrained objectives.
//!
//! Labels mark whether a completed job produced a usable value. A latent
//! function `f ~ N(0, K)` explains them through `P(feasible) = sigmoid(g f)`.
//! The latent is updated by elliptical slice sampling; its length scales and
//! the gain `g` by ordinary slice sampling.

use bt_types::{validation_error, TuneResult};
use ndarray::{array, Array1, Array2, ArrayView1, ArrayView2};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::gp::JITTER;
use crate::kernel::{covariance, covariance_gradient, CovarianceKind};
use crate::linalg::{add_diagonal, cho_solve, cholesky, log_det};
use crate::normal::{log_sigmoid, sigmoid};
use crate::slice::{elliptical_slice, slice_sample, SliceConfig};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeasibilityConfig {
    pub kind: CovarianceKind,
    /// Fixed latent amplitude; the gain absorbs overall scale.
    pub amp2: f64,
    pub max_ls: f64,
    pub max_gain: f64,
    pub burnin: usize,
    pub mcmc_iters: usize,
    pub max_steps_out: usize,
}

impl Default for FeasibilityConfig {
    fn default() -> Self {
        Self {
            kind: CovarianceKind::Matern52,
            amp2: 1.0,
            max_ls: 2.0,
            max_gain: 20.0,
            burnin: 100,
            mcmc_iters: 10,
            max_steps_out: 1000,
        }
    }
}

/// One posterior draw of the classifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeasibilitySample {
    pub ls: Array1<f64>,
    pub gain: f64,
    /// Latent values at the labelled points.
    pub latent: Array1<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeasibilitySampler {
    config: FeasibilityConfig,
    state: Option<FeasibilitySample>,
    burned_in_dim: Option<usize>,
}

impl FeasibilitySampler {
    pub fn new(config: FeasibilityConfig) -> Self {
        Self {
            config,
            state: None,
            burned_in_dim: None,
        }
    }

    pub fn state(&self) -> Option<&FeasibilitySample> {
        self.state.as_ref()
    }

    /// Advance the chain over all labelled points and return `mcmc_iters`
    /// draws.
    pub fn sample_pool<R: Rng + ?Sized>(
        &mut self,
        x: ArrayView2<f64>,
        feasible: &[bool],
        rng: &mut R,
    ) -> TuneResult<Vec<FeasibilitySample>> {
        if x.nrows() != feasible.len() || feasible.is_empty() {
            return Err(validation_error!(
                "cannot fit the feasibility classifier to {} points and {} labels",
                x.nrows(),
                feasible.len()
            ));
        }
        let dim = x.ncols();
        let fresh_dim = self.burned_in_dim != Some(dim);
        self.warm_start(dim, feasible, fresh_dim);

        if fresh_dim {
            for _ in 0..self.config.burnin {
                self.step(x, feasible, rng)?;
            }
            self.burned_in_dim = Some(dim);
            debug!(dim, "feasibility burn-in complete");
        }

        let mut pool = Vec::with_capacity(self.config.mcmc_iters);
        for _ in 0..self.config.mcmc_iters {
            self.step(x, feasible, rng)?;
            if let Some(state) = &self.state {
                pool.push(state.clone());
            }
        }
        Ok(pool)
    }

    /// Resize the latent to the current label set. New labels start at +-1.
    fn warm_start(&mut self, dim: usize, feasible: &[bool], reset: bool) {
        let seed_latent = || -> Array1<f64> {
            feasible
                .iter()
                .map(|&ok| if ok { 1.0 } else { -1.0 })
                .collect()
        };
        match &mut self.state {
            Some(state) if !reset => {
                if state.latent.len() != feasible.len() {
                    state.latent = seed_latent();
                }
            }
            _ => {
                self.state = Some(FeasibilitySample {
                    ls: Array1::from_elem(dim, 1.0f64.min(self.config.max_ls)),
                    gain: 1.0,
                    latent: seed_latent(),
                });
            }
        }
    }

    fn step<R: Rng + ?Sized>(
        &mut self,
        x: ArrayView2<f64>,
        feasible: &[bool],
        rng: &mut R,
    ) -> TuneResult<()> {
        let Some(mut state) = self.state.clone() else {
            return Ok(());
        };
        let config = &self.config;
        let slice = SliceConfig {
            sigma: 1.0,
            max_steps_out: config.max_steps_out,
        };

        let chol = cholesky(&latent_covariance(config, state.ls.view(), x))?;
        let gain = state.gain;
        state.latent = elliptical_slice(
            &state.latent,
            &chol,
            |f| Ok(label_loglik(f.view(), feasible, gain)),
            rng,
        )?;

        let latent = state.latent.clone();
        state.ls = slice_sample(
            &state.ls,
            |ls| {
                if ls.iter().any(|&l| l <= 0.0 || l > config.max_ls) {
                    return Ok(f64::NEG_INFINITY);
                }
                let chol = cholesky(&latent_covariance(config, ls.view(), x))?;
                let alpha = cho_solve(&chol, latent.view());
                Ok(-0.5 * latent.dot(&alpha) - 0.5 * log_det(&chol))
            },
            true,
            &slice,
            rng,
        )?;

        let sampled = slice_sample(
            &array![state.gain],
            |g| {
                if g[0] <= 0.0 || g[0] > config.max_gain {
                    return Ok(f64::NEG_INFINITY);
                }
                Ok(label_loglik(latent.view(), feasible, g[0]))
            },
            false,
            &slice,
            rng,
        )?;
        state.gain = sampled[0];

        self.state = Some(state);
        Ok(())
    }
}

fn latent_covariance(
    config: &FeasibilityConfig,
    ls: ArrayView1<f64>,
    x: ArrayView2<f64>,
) -> Array2<f64> {
    let mut k = covariance(config.kind, ls, x, None);
    add_diagonal(&mut k, JITTER);
    k * config.amp2
}

fn label_loglik(latent: ArrayView1<f64>, feasible: &[bool], gain: f64) -> f64 {
    latent
        .iter()
        .zip(feasible)
        .map(|(&f, &ok)| {
            if ok {
                log_sigmoid(gain * f)
            } else {
                log_sigmoid(-gain * f)
            }
        })
        .sum()
}

/// A classifier draw conditioned on its labelled points, for prediction.
#[derive(Debug, Clone)]
pub struct FeasibilityModel {
    kind: CovarianceKind,
    amp2: f64,
    ls: Array1<f64>,
    gain: f64,
    x: Array2<f64>,
    alpha: Array1<f64>,
}

impl FeasibilityModel {
    pub fn fit(
        config: &FeasibilityConfig,
        sample: &FeasibilitySample,
        x: ArrayView2<f64>,
    ) -> TuneResult<Self> {
        if x.nrows() != sample.latent.len() {
            return Err(validation_error!(
                "latent has {} values for {} points",
                sample.latent.len(),
                x.nrows()
            ));
        }
        let chol = cholesky(&latent_covariance(config, sample.ls.view(), x))?;
        let alpha = cho_solve(&chol, sample.latent.view());
        Ok(Self {
            kind: config.kind,
            amp2: config.amp2,
            ls: sample.ls.clone(),
            gain: sample.gain,
            x: x.to_owned(),
            alpha,
        })
    }

    /// Probability that `point` is feasible: sigmoid of the gain-scaled
    /// posterior mean of the latent.
    pub fn probability(&self, point: ArrayView1<f64>) -> f64 {
        let row = point.insert_axis(ndarray::Axis(0));
        let k = covariance(self.kind, self.ls.view(), self.x.view(), Some(row));
        let mean = self.amp2 * k.column(0).dot(&self.alpha);
        sigmoid(self.gain * mean)
    }

    /// Probability and its gradient with respect to `point`.
    pub fn probability_and_gradient(&self, point: ArrayView1<f64>) -> (f64, Array1<f64>) {
        let row = point.insert_axis(ndarray::Axis(0));
        let k = covariance(self.kind, self.ls.view(), self.x.view(), Some(row));
        let mean = self.amp2 * k.column(0).dot(&self.alpha);
        let p = sigmoid(self.gain * mean);

        let dk = covariance_gradient(self.kind, self.ls.view(), self.x.view(), row);
        let dim = point.len();
        let mut grad = Array1::zeros(dim);
        for d in 0..dim {
            let dmean: f64 = (0..self.x.nrows())
                .map(|i| dk[[i, 0, d]] * self.alpha[i])
                .sum::<f64>()
                * self.amp2;
            grad[d] = p * (1.0 - p) * self.gain * dmean;
        }
        (p, grad)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    /// Feasible on the left half of the unit interval.
    fn labelled() -> (Array2<f64>, Vec<bool>) {
        let x = Array2::from_shape_fn((16, 1), |(i, _)| i as f64 / 15.0);
        let labels = x.column(0).iter().map(|&v| v < 0.5).collect();
        (x, labels)
    }

    fn quick() -> FeasibilityConfig {
        FeasibilityConfig {
            burnin: 50,
            mcmc_iters: 5,
            ..FeasibilityConfig::default()
        }
    }

    #[test]
    fn classifier_separates_regions() {
        let (x, labels) = labelled();
        let config = quick();
        let mut sampler = FeasibilitySampler::new(config.clone());
        let mut rng = ChaCha8Rng::seed_from_u64(21);
        let pool = sampler.sample_pool(x.view(), &labels, &mut rng).unwrap();
        assert_eq!(pool.len(), 5);

        let mut left = 0.0;
        let mut right = 0.0;
        for sample in &pool {
            assert!(sample.gain > 0.0 && sample.gain <= config.max_gain);
            let model = FeasibilityModel::fit(&config, sample, x.view()).unwrap();
            left += model.probability(array![0.1].view());
            right += model.probability(array![0.9].view());
        }
        assert!(left / 5.0 > 0.5, "left {left}");
        assert!(right / 5.0 < 0.5, "right {right}");
    }

    #[test]
    fn gradient_matches_finite_differences() {
        let (x, _) = labelled();
        let config = FeasibilityConfig::default();
        let sample = FeasibilitySample {
            ls: array![0.3],
            gain: 2.0,
            latent: x.column(0).mapv(|v| 1.0 - 2.0 * v),
        };
        let model = FeasibilityModel::fit(&config, &sample, x.view()).unwrap();
        let at = array![0.37];
        let (p, grad) = model.probability_and_gradient(at.view());
        assert!((p - model.probability(at.view())).abs() < 1e-12);
        let h = 1e-6;
        let numeric = (model.probability(array![0.37 + h].view())
            - model.probability(array![0.37 - h].view()))
            / (2.0 * h);
        assert!((numeric - grad[0]).abs() < 1e-5);
    }

    #[test]
    fn growing_label_set_keeps_chain() {
        let (x, labels) = labelled();
        let mut sampler = FeasibilitySampler::new(quick());
        let mut rng = ChaCha8Rng::seed_from_u64(8);
        sampler
            .sample_pool(x.slice(ndarray::s![..10, ..]), &labels[..10], &mut rng)
            .unwrap();
        let pool = sampler.sample_pool(x.view(), &labels, &mut rng).unwrap();
        assert!(pool.iter().all(|s| s.latent.len() == 16));
    }
}
