//! MCMC over GP hyperparameters.
//!
//! Each step runs a joint slice update over (mean, amplitude, noise), or
//! (mean, amplitude) in noiseless mode, followed by a component-wise slice
//! sweep over the length scales. Burn-in runs once per design dimension; the
//! chain state then carries over between optimizer iterations.

use bt_types::{validation_error, TuneResult};
use ndarray::{array, Array1, ArrayView1, ArrayView2};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::gp::{log_marginal_likelihood, GpHypers};
use crate::kernel::CovarianceKind;
use crate::slice::{slice_sample, SliceConfig};

/// Noise variance used when the objective is declared noiseless.
pub const NOISELESS_NOISE: f64 = 1e-3;

/// Resolved settings for the hyperparameter chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplerConfig {
    pub kind: CovarianceKind,
    /// Posterior samples collected per call to [`HyperSampler::sample_pool`].
    pub mcmc_iters: usize,
    /// Discarded steps run the first time a design dimension is seen.
    pub burnin: usize,
    pub noiseless: bool,
    /// Upper bound on every length scale.
    pub max_ls: f64,
    /// Scale of the horseshoe prior on the noise variance.
    pub noise_scale: f64,
    /// Scale of the log-normal prior on the amplitude.
    pub amp2_scale: f64,
    pub max_steps_out: usize,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            kind: CovarianceKind::Matern52,
            mcmc_iters: 10,
            burnin: 100,
            noiseless: false,
            max_ls: 2.0,
            noise_scale: 0.1,
            amp2_scale: 1.0,
            max_steps_out: 1000,
        }
    }
}

/// Persistent state of the hyperparameter chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HyperSampler {
    config: SamplerConfig,
    state: Option<GpHypers>,
    burned_in_dim: Option<usize>,
}

impl HyperSampler {
    pub fn new(config: SamplerConfig) -> Self {
        Self {
            config,
            state: None,
            burned_in_dim: None,
        }
    }

    pub fn config(&self) -> &SamplerConfig {
        &self.config
    }

    /// Current chain state, if the chain has been started.
    pub fn state(&self) -> Option<&GpHypers> {
        self.state.as_ref()
    }

    pub fn needs_burnin(&self, dim: usize) -> bool {
        self.burned_in_dim != Some(dim)
    }

    /// Advance the chain and return `mcmc_iters` posterior samples.
    ///
    /// Burn-in runs first if this design dimension has not been burned in.
    pub fn sample_pool<R: Rng + ?Sized>(
        &mut self,
        x: ArrayView2<f64>,
        y: ArrayView1<f64>,
        rng: &mut R,
    ) -> TuneResult<Vec<GpHypers>> {
        if x.nrows() != y.len() || y.is_empty() {
            return Err(validation_error!(
                "cannot sample hyperparameters from {} points and {} values",
                x.nrows(),
                y.len()
            ));
        }
        let dim = x.ncols();
        if self.needs_burnin(dim) {
            self.initialize(dim, y);
            for _ in 0..self.config.burnin {
                self.step(x, y, rng)?;
            }
            self.burned_in_dim = Some(dim);
            debug!(dim, burnin = self.config.burnin, "hyperparameter burn-in complete");
        }

        let mut pool = Vec::with_capacity(self.config.mcmc_iters);
        for _ in 0..self.config.mcmc_iters {
            self.step(x, y, rng)?;
            if let Some(state) = &self.state {
                pool.push(state.clone());
            }
        }
        Ok(pool)
    }

    fn initialize(&mut self, dim: usize, y: ArrayView1<f64>) {
        let n = y.len() as f64;
        let mean = y.sum() / n;
        let sd = (y.mapv(|v| (v - mean).powi(2)).sum() / n).sqrt();
        let noise = if self.config.noiseless {
            NOISELESS_NOISE
        } else {
            1e-3
        };
        self.state = Some(GpHypers::new(
            mean,
            sd + 1e-4,
            noise,
            Array1::from_elem(dim, 1.0f64.min(self.config.max_ls)),
        ));
    }

    /// One full MCMC sweep.
    pub fn step<R: Rng + ?Sized>(
        &mut self,
        x: ArrayView2<f64>,
        y: ArrayView1<f64>,
        rng: &mut R,
    ) -> TuneResult<()> {
        if self.state.is_none() {
            self.initialize(x.ncols(), y);
        }
        let Some(current) = self.state.clone() else {
            return Ok(());
        };
        let slice = SliceConfig {
            sigma: 1.0,
            max_steps_out: self.config.max_steps_out,
        };
        let updated = self.sample_scalars(current, x, y, &slice, rng)?;
        let updated = self.sample_length_scales(updated, x, y, &slice, rng)?;
        self.state = Some(updated);
        Ok(())
    }

    fn sample_scalars<R: Rng + ?Sized>(
        &self,
        current: GpHypers,
        x: ArrayView2<f64>,
        y: ArrayView1<f64>,
        slice: &SliceConfig,
        rng: &mut R,
    ) -> TuneResult<GpHypers> {
        let config = &self.config;
        let (lo, hi) = mean_bounds(y);
        let ls = current.ls.clone();

        let unpack = |v: &Array1<f64>| -> GpHypers {
            let noise = if config.noiseless {
                NOISELESS_NOISE
            } else {
                v[2]
            };
            GpHypers::new(v[0], v[1], noise, ls.clone())
        };
        let logprob = |v: &Array1<f64>| -> TuneResult<f64> {
            let hp = unpack(v);
            if hp.mean < lo || hp.mean > hi || hp.amp2 < 0.0 || hp.noise < 0.0 {
                return Ok(f64::NEG_INFINITY);
            }
            let mut prior = -0.5 * (hp.amp2.ln() / config.amp2_scale).powi(2);
            if !config.noiseless {
                prior += (1.0 + (config.noise_scale / hp.noise).powi(2)).ln().ln();
            }
            if !prior.is_finite() {
                return Ok(f64::NEG_INFINITY);
            }
            Ok(prior + log_marginal_likelihood(config.kind, &hp, x, y)?)
        };

        let init = if config.noiseless {
            array![current.mean, current.amp2]
        } else {
            array![current.mean, current.amp2, current.noise]
        };
        let sampled = slice_sample(&init, logprob, false, slice, rng)?;
        Ok(unpack(&sampled))
    }

    fn sample_length_scales<R: Rng + ?Sized>(
        &self,
        current: GpHypers,
        x: ArrayView2<f64>,
        y: ArrayView1<f64>,
        slice: &SliceConfig,
        rng: &mut R,
    ) -> TuneResult<GpHypers> {
        let config = &self.config;
        let logprob = |ls: &Array1<f64>| -> TuneResult<f64> {
            if ls.iter().any(|&l| l <= 0.0 || l > config.max_ls) {
                return Ok(f64::NEG_INFINITY);
            }
            let hp = GpHypers::new(current.mean, current.amp2, current.noise, ls.clone());
            log_marginal_likelihood(config.kind, &hp, x, y)
        };
        let ls = slice_sample(&current.ls, logprob, true, slice, rng)?;
        Ok(GpHypers { ls, ..current })
    }
}

/// The constant mean is confined to the observed range, widened by a hair so
/// a constant objective still leaves room to move.
fn mean_bounds(y: ArrayView1<f64>) -> (f64, f64) {
    let lo = y.iter().copied().fold(f64::INFINITY, f64::min);
    let hi = y.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let pad = 1e-6 * (1.0 + lo.abs().max(hi.abs()));
    (lo - pad, hi + pad)
}
