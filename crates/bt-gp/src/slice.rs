//! Slice samplers: Neal's stepping-out/shrinkage sampler along an axis or a
//! random direction, and Murray, Adams & MacKay's elliptical slice sampler for
//! latent Gaussian vectors.

use bt_types::{NumericalError, TuneResult};
use ndarray::{Array1, Array2};
use rand::seq::SliceRandom;
use rand::Rng;
use rand_distr::StandardNormal;

const MAX_SHRINK_STEPS: usize = 10_000;

/// Tuning for one slice-sampling update.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SliceConfig {
    /// Initial bracket width.
    pub sigma: f64,
    /// Expansion budget per bracket end; exceeding it is an error.
    pub max_steps_out: usize,
}

impl Default for SliceConfig {
    fn default() -> Self {
        Self {
            sigma: 1.0,
            max_steps_out: 1000,
        }
    }
}

/// Draw one new state from the density `exp(logprob)`.
///
/// With `compwise` the update sweeps every coordinate in random order, each
/// conditioned on the current value of the others. Otherwise a single update
/// moves along a random unit direction.
pub fn slice_sample<F, R>(
    init: &Array1<f64>,
    mut logprob: F,
    compwise: bool,
    config: &SliceConfig,
    rng: &mut R,
) -> TuneResult<Array1<f64>>
where
    F: FnMut(&Array1<f64>) -> TuneResult<f64>,
    R: Rng + ?Sized,
{
    let dims = init.len();
    if compwise {
        let mut order: Vec<usize> = (0..dims).collect();
        order.shuffle(rng);
        let mut current = init.clone();
        for d in order {
            let mut direction = Array1::zeros(dims);
            direction[d] = 1.0;
            current = direction_slice(&current, &direction, &mut logprob, config, rng)?;
        }
        Ok(current)
    } else {
        let mut direction: Array1<f64> = (0..dims).map(|_| rng.sample(StandardNormal)).collect();
        let norm = direction.dot(&direction).sqrt();
        if norm > 0.0 {
            direction /= norm;
        } else {
            direction[0] = 1.0;
        }
        direction_slice(init, &direction, &mut logprob, config, rng)
    }
}

fn direction_slice<F, R>(
    init: &Array1<f64>,
    direction: &Array1<f64>,
    logprob: &mut F,
    config: &SliceConfig,
    rng: &mut R,
) -> TuneResult<Array1<f64>>
where
    F: FnMut(&Array1<f64>) -> TuneResult<f64>,
    R: Rng + ?Sized,
{
    let along = |z: f64| init + &(direction * z);
    // -inf marks a point outside the support; NaN or +inf is a broken density.
    let mut density = |z: &Array1<f64>| -> TuneResult<f64> {
        let value = logprob(z)?;
        if value.is_nan() || value == f64::INFINITY {
            return Err(NumericalError::NonFinite {
                what: "slice sampler log density".to_string(),
            }
            .into());
        }
        Ok(value)
    };

    let mut upper = config.sigma * rng.gen::<f64>();
    let mut lower = upper - config.sigma;
    let level = rng.gen::<f64>().ln() + density(init)?;

    let mut steps = 0;
    while density(&along(lower))? > level {
        lower -= config.sigma;
        steps += 1;
        if steps > config.max_steps_out {
            return Err(NumericalError::BracketExpansion {
                steps: config.max_steps_out,
            }
            .into());
        }
    }
    steps = 0;
    while density(&along(upper))? > level {
        upper += config.sigma;
        steps += 1;
        if steps > config.max_steps_out {
            return Err(NumericalError::BracketExpansion {
                steps: config.max_steps_out,
            }
            .into());
        }
    }

    for _ in 0..MAX_SHRINK_STEPS {
        let z = (upper - lower) * rng.gen::<f64>() + lower;
        let candidate = along(z);
        if density(&candidate)? > level {
            return Ok(candidate);
        }
        if z < 0.0 {
            lower = z;
        } else if z > 0.0 {
            upper = z;
        } else {
            break;
        }
    }
    Err(NumericalError::SliceCollapsed.into())
}

/// One elliptical slice sampling update of `f ~ N(0, L L^T)` under the
/// likelihood `exp(loglik)`.
pub fn elliptical_slice<F, R>(
    f: &Array1<f64>,
    prior_chol: &Array2<f64>,
    mut loglik: F,
    rng: &mut R,
) -> TuneResult<Array1<f64>>
where
    F: FnMut(&Array1<f64>) -> TuneResult<f64>,
    R: Rng + ?Sized,
{
    let z: Array1<f64> = (0..f.len()).map(|_| rng.sample(StandardNormal)).collect();
    let nu = prior_chol.dot(&z);
    let level = rng.gen::<f64>().ln() + loglik(f)?;

    let two_pi = 2.0 * std::f64::consts::PI;
    let mut phi = rng.gen::<f64>() * two_pi;
    let mut phi_min = phi - two_pi;
    let mut phi_max = phi;

    for _ in 0..MAX_SHRINK_STEPS {
        let proposal = f * phi.cos() + &(&nu * phi.sin());
        if loglik(&proposal)? > level {
            return Ok(proposal);
        }
        if phi > 0.0 {
            phi_max = phi;
        } else {
            phi_min = phi;
        }
        if phi_max - phi_min < 1e-12 {
            break;
        }
        phi = rng.gen::<f64>() * (phi_max - phi_min) + phi_min;
    }
    Err(NumericalError::SliceCollapsed.into())
}
