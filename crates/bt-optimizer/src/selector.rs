//! Candidate selection: score a dense candidate set, then polish the most
//! promising points by gradient ascent on the acquisition surface.

use ndarray::{concatenate, Array1, Array2, ArrayView1, ArrayView2, Axis};
use rand::Rng;
use rand_distr::StandardNormal;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::acquisition::ExpectedImprovement;
use bt_types::{validation_error, TuneResult};

const INITIAL_STEP: f64 = 0.05;
const MAX_STEP: f64 = 0.25;
const MIN_STEP: f64 = 1e-7;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SelectorConfig {
    /// Number of top-scoring points handed to refinement.
    pub grid_subset: usize,
    /// Points sampled around the incumbent and added to the candidate set.
    pub perturbed_points: usize,
    /// Standard deviation of those perturbations, in unit-cube coordinates.
    pub perturb_scale: f64,
    /// Ascent iterations per refined start.
    pub refine_iterations: usize,
}

impl Default for SelectorConfig {
    fn default() -> Self {
        Self {
            grid_subset: 20,
            perturbed_points: 10,
            perturb_scale: 0.001,
            refine_iterations: 50,
        }
    }
}

/// Outcome of one selection round.
#[derive(Debug, Clone, PartialEq)]
pub enum Selection {
    /// Row `index` of the supplied candidates scored best.
    Existing { index: usize, value: f64 },
    /// A perturbed or refined point, not present among the candidates.
    New { point: Array1<f64>, value: f64 },
}

impl Selection {
    pub fn value(&self) -> f64 {
        match self {
            Selection::Existing { value, .. } | Selection::New { value, .. } => *value,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CandidateSelector {
    config: SelectorConfig,
}

impl CandidateSelector {
    pub fn new(config: SelectorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SelectorConfig {
        &self.config
    }

    /// Gaussian perturbations of `incumbent`, clipped to the unit cube.
    pub fn perturb<R: Rng + ?Sized>(&self, incumbent: ArrayView1<f64>, rng: &mut R) -> Array2<f64> {
        let scale = self.config.perturb_scale;
        Array2::from_shape_fn((self.config.perturbed_points, incumbent.len()), |(_, d)| {
            let noise: f64 = rng.sample(StandardNormal);
            (incumbent[d] + scale * noise).clamp(0.0, 1.0)
        })
    }

    /// Pick the best point among `candidates`, perturbations of `incumbent`,
    /// and refinements of the top-scoring of those.
    pub fn select<R: Rng + ?Sized>(
        &self,
        acquisition: &ExpectedImprovement,
        candidates: ArrayView2<f64>,
        incumbent: Option<ArrayView1<f64>>,
        rng: &mut R,
    ) -> TuneResult<Selection> {
        let pool = match incumbent {
            Some(best) if self.config.perturbed_points > 0 => {
                let perturbed = self.perturb(best, rng);
                concatenate![Axis(0), candidates, perturbed.view()]
            }
            _ => candidates.to_owned(),
        };
        if pool.nrows() == 0 {
            return Err(validation_error!("no candidates to select from"));
        }

        let scores = acquisition.evaluate(pool.view())?;
        let mut order: Vec<usize> = (0..scores.len()).collect();
        order.sort_by(|&a, &b| scores[b].total_cmp(&scores[a]));
        let best_scored = order[0];
        order.truncate(self.config.grid_subset);

        let iterations = self.config.refine_iterations;
        let refined = order
            .par_iter()
            .map(|&i| refine(acquisition, pool.row(i), iterations))
            .collect::<TuneResult<Vec<_>>>()?;

        let best_refined = refined
            .into_iter()
            .max_by(|a, b| a.1.total_cmp(&b.1));
        debug!(
            scored = pool.nrows(),
            refined = order.len(),
            best_scored = scores[best_scored],
            best_refined = best_refined.as_ref().map(|r| r.1),
            "candidate selection"
        );

        match best_refined {
            Some((point, value)) if improves(value, scores[best_scored]) => {
                Ok(Selection::New { point, value })
            }
            _ if best_scored < candidates.nrows() => Ok(Selection::Existing {
                index: best_scored,
                value: scores[best_scored],
            }),
            _ => Ok(Selection::New {
                point: pool.row(best_scored).to_owned(),
                value: scores[best_scored],
            }),
        }
    }
}

/// Refinement must beat the scored best by more than rounding noise.
fn improves(value: f64, best: f64) -> bool {
    value > best + 1e-9 * best.abs()
}

/// Projected gradient ascent from `start`, staying inside the unit cube.
///
/// Steps follow the normalized gradient; a step that fails to improve is
/// halved until it does or falls below the minimum step.
pub fn refine(
    acquisition: &ExpectedImprovement,
    start: ArrayView1<f64>,
    iterations: usize,
) -> TuneResult<(Array1<f64>, f64)> {
    let mut x = start.mapv(|v| v.clamp(0.0, 1.0));
    let (mut value, mut grad) = acquisition.value_and_gradient(x.view())?;
    let mut step = INITIAL_STEP;

    for _ in 0..iterations {
        let norm = grad.dot(&grad).sqrt();
        if !norm.is_finite() || norm <= 0.0 {
            break;
        }
        let direction = &grad / norm;

        let mut moved = false;
        while step >= MIN_STEP {
            let trial = (&x + &(&direction * step)).mapv(|v| v.clamp(0.0, 1.0));
            let (trial_value, trial_grad) = acquisition.value_and_gradient(trial.view())?;
            if trial_value > value {
                x = trial;
                value = trial_value;
                grad = trial_grad;
                step = (step * 1.5).min(MAX_STEP);
                moved = true;
                break;
            }
            step *= 0.5;
        }
        if !moved {
            break;
        }
    }
    Ok((x, value))
}
