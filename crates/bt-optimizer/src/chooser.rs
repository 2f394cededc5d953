//! The `choose_next` entry point: turns the experiment's job table into the
//! next point to evaluate.

use std::path::Path;

use bt_gp::{
    CovarianceKind, FeasibilityConfig, FeasibilityModel, FeasibilitySampler, HyperSampler,
    SamplerConfig,
};
use bt_types::{is_violation, validation_error, TuneResult};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::acquisition::ExpectedImprovement;
use crate::selector::{CandidateSelector, SelectorConfig, Selection};

/// Resolved chooser settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChooserConfig {
    pub covariance: CovarianceKind,
    pub mcmc_iters: usize,
    pub burnin: usize,
    /// Fantasies drawn per pending job.
    pub pending_samples: usize,
    pub grid_subset: usize,
    pub noiseless: bool,
    pub max_ls: f64,
    pub noise_scale: f64,
    pub amp2_scale: f64,
    pub perturbed_points: usize,
    pub perturb_scale: f64,
    pub max_steps_out: usize,
    pub refine_iterations: usize,

    /// Weight EI by a learned probability of feasibility.
    pub constrained: bool,
    /// Objective value reported by jobs that violated a constraint. Non-finite
    /// values always count as violations.
    pub constraint_sentinel: Option<f64>,
    pub max_constraint_gain: f64,
}

impl Default for ChooserConfig {
    fn default() -> Self {
        Self {
            covariance: CovarianceKind::Matern52,
            mcmc_iters: 10,
            burnin: 100,
            pending_samples: 100,
            grid_subset: 20,
            noiseless: false,
            max_ls: 2.0,
            noise_scale: 0.1,
            amp2_scale: 1.0,
            perturbed_points: 10,
            perturb_scale: 0.001,
            max_steps_out: 1000,
            refine_iterations: 50,
            constrained: false,
            constraint_sentinel: None,
            max_constraint_gain: 20.0,
        }
    }
}

impl ChooserConfig {
    pub fn with_covariance(mut self, kind: CovarianceKind) -> Self {
        self.covariance = kind;
        self
    }

    pub fn with_mcmc(mut self, burnin: usize, mcmc_iters: usize) -> Self {
        self.burnin = burnin;
        self.mcmc_iters = mcmc_iters;
        self
    }

    pub fn with_pending_samples(mut self, n: usize) -> Self {
        self.pending_samples = n;
        self
    }

    pub fn with_grid_subset(mut self, n: usize) -> Self {
        self.grid_subset = n;
        self
    }

    pub fn with_noiseless(mut self, noiseless: bool) -> Self {
        self.noiseless = noiseless;
        self
    }

    pub fn with_refine_iterations(mut self, n: usize) -> Self {
        self.refine_iterations = n;
        self
    }

    pub fn with_constraint(mut self, sentinel: Option<f64>) -> Self {
        self.constrained = true;
        self.constraint_sentinel = sentinel;
        self
    }

    pub fn validate(&self) -> TuneResult<()> {
        if self.mcmc_iters == 0 {
            return Err(validation_error!("mcmc_iters must be at least 1"));
        }
        if self.max_ls <= 0.0 || !self.max_ls.is_finite() {
            return Err(validation_error!("max_ls must be positive, got {}", self.max_ls));
        }
        if self.noise_scale <= 0.0 || self.amp2_scale <= 0.0 {
            return Err(validation_error!("prior scales must be positive"));
        }
        if self.perturb_scale < 0.0 {
            return Err(validation_error!("perturb_scale must be non-negative"));
        }
        if self.max_constraint_gain <= 0.0 {
            return Err(validation_error!("max_constraint_gain must be positive"));
        }
        Ok(())
    }

    pub fn sampler_config(&self) -> SamplerConfig {
        SamplerConfig {
            kind: self.covariance,
            mcmc_iters: self.mcmc_iters,
            burnin: self.burnin,
            noiseless: self.noiseless,
            max_ls: self.max_ls,
            noise_scale: self.noise_scale,
            amp2_scale: self.amp2_scale,
            max_steps_out: self.max_steps_out,
        }
    }

    pub fn feasibility_config(&self) -> FeasibilityConfig {
        FeasibilityConfig {
            kind: self.covariance,
            max_ls: self.max_ls,
            max_gain: self.max_constraint_gain,
            burnin: self.burnin,
            mcmc_iters: self.mcmc_iters,
            max_steps_out: self.max_steps_out,
            ..FeasibilityConfig::default()
        }
    }

    pub fn selector_config(&self) -> SelectorConfig {
        SelectorConfig {
            grid_subset: self.grid_subset,
            perturbed_points: self.perturbed_points,
            perturb_scale: self.perturb_scale,
            refine_iterations: self.refine_iterations,
        }
    }
}

/// What to evaluate next.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Choice {
    /// An existing candidate row, by id.
    Existing(usize),
    /// A point not yet in the store. `id` is the row it will occupy once
    /// appended.
    New { id: usize, point: Vec<f64> },
}

/// MCMC chain state carried between iterations and across restarts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChooserState {
    pub hypers: HyperSampler,
    pub feasibility: FeasibilitySampler,
}

#[derive(Debug, Clone)]
pub struct Chooser {
    config: ChooserConfig,
    state: ChooserState,
    selector: CandidateSelector,
}

impl Chooser {
    pub fn new(config: ChooserConfig) -> TuneResult<Self> {
        config.validate()?;
        let state = ChooserState {
            hypers: HyperSampler::new(config.sampler_config()),
            feasibility: FeasibilitySampler::new(config.feasibility_config()),
        };
        Ok(Self::with_state(config, state))
    }

    pub fn with_state(config: ChooserConfig, state: ChooserState) -> Self {
        let selector = CandidateSelector::new(config.selector_config());
        Self {
            config,
            state,
            selector,
        }
    }

    pub fn config(&self) -> &ChooserConfig {
        &self.config
    }

    pub fn state(&self) -> &ChooserState {
        &self.state
    }

    /// Write the chain state as JSON.
    pub fn save_state(&self, path: &Path) -> TuneResult<()> {
        let json = serde_json::to_string_pretty(&self.state)?;
        std::fs::write(path, json)?;
        debug!(path = %path.display(), "saved chooser state");
        Ok(())
    }

    /// Restore a chooser from state written by [`Chooser::save_state`].
    /// A missing file yields a fresh chooser.
    pub fn load_state(config: ChooserConfig, path: &Path) -> TuneResult<Self> {
        if !path.exists() {
            return Self::new(config);
        }
        config.validate()?;
        let json = std::fs::read_to_string(path)?;
        let state: ChooserState = serde_json::from_str(&json)?;
        if state.hypers.config() != &config.sampler_config() {
            warn!(path = %path.display(), "saved chooser state was built with different settings; starting fresh");
            return Self::new(config);
        }
        info!(path = %path.display(), "restored chooser state");
        Ok(Self::with_state(config, state))
    }

    /// Choose the next job.
    ///
    /// `grid`, `values` and `durations` hold every row of the experiment;
    /// only rows listed in `complete_ids` are read for values. With fewer
    /// than two usable observations the first candidate is returned without
    /// touching the model.
    #[allow(clippy::too_many_arguments)]
    pub fn choose_next<R: Rng + ?Sized>(
        &mut self,
        grid: ArrayView2<f64>,
        values: ArrayView1<f64>,
        durations: ArrayView1<f64>,
        candidate_ids: &[usize],
        pending_ids: &[usize],
        complete_ids: &[usize],
        rng: &mut R,
    ) -> TuneResult<Choice> {
        let rows = grid.nrows();
        if values.len() != rows || durations.len() != rows {
            return Err(validation_error!(
                "{} rows but {} values and {} durations",
                rows,
                values.len(),
                durations.len()
            ));
        }
        if let Some(id) = candidate_ids
            .iter()
            .chain(pending_ids)
            .chain(complete_ids)
            .find(|&&id| id >= rows)
        {
            return Err(validation_error!("job id {id} outside a grid of {rows} rows"));
        }

        let (feasible, infeasible): (Vec<usize>, Vec<usize>) = complete_ids
            .iter()
            .partition(|&&id| !is_violation(values[id], self.config.constraint_sentinel));

        if feasible.len() < 2 {
            let first = candidate_ids
                .first()
                .copied()
                .ok_or_else(|| validation_error!("no candidates left to choose from"))?;
            warn!(
                observed = feasible.len(),
                candidate = first,
                "too few observations to model, taking the next grid point"
            );
            return Ok(Choice::Existing(first));
        }

        let x_obs = grid.select(Axis(0), &feasible);
        let y_obs = standardize(feasible.iter().map(|&id| values[id]).collect());
        let x_pend = grid.select(Axis(0), pending_ids);
        let candidates = grid.select(Axis(0), candidate_ids);

        let pool = self
            .state
            .hypers
            .sample_pool(x_obs.view(), y_obs.view(), rng)?;
        let mut acquisition = ExpectedImprovement::prepare(
            self.config.covariance,
            &pool,
            x_obs.view(),
            y_obs.view(),
            x_pend.view(),
            self.config.pending_samples,
            rng,
        )?;

        if self.config.constrained && !infeasible.is_empty() {
            acquisition = acquisition.with_feasibility(self.feasibility_models(
                grid,
                complete_ids,
                values,
                rng,
            )?)?;
        }

        let incumbent = (0..y_obs.len())
            .min_by(|&a, &b| y_obs[a].total_cmp(&y_obs[b]))
            .map(|i| x_obs.row(i));
        debug!(
            observed = feasible.len(),
            violations = infeasible.len(),
            pending = pending_ids.len(),
            candidates = candidate_ids.len(),
            pool = pool.len(),
            "scoring candidates"
        );

        let selection = self
            .selector
            .select(&acquisition, candidates.view(), incumbent, rng)?;
        let choice = match selection {
            Selection::Existing { index, value } => {
                info!(id = candidate_ids[index], ei = value, "chose existing candidate");
                Choice::Existing(candidate_ids[index])
            }
            Selection::New { point, value } => {
                info!(id = rows, ei = value, "chose new point");
                Choice::New {
                    id: rows,
                    point: point.to_vec(),
                }
            }
        };
        Ok(choice)
    }

    fn feasibility_models<R: Rng + ?Sized>(
        &mut self,
        grid: ArrayView2<f64>,
        complete_ids: &[usize],
        values: ArrayView1<f64>,
        rng: &mut R,
    ) -> TuneResult<Vec<FeasibilityModel>> {
        let x: Array2<f64> = grid.select(Axis(0), complete_ids);
        let labels: Vec<bool> = complete_ids
            .iter()
            .map(|&id| !is_violation(values[id], self.config.constraint_sentinel))
            .collect();
        let config = self.config.feasibility_config();
        self.state
            .feasibility
            .sample_pool(x.view(), &labels, rng)?
            .iter()
            .map(|sample| FeasibilityModel::fit(&config, sample, x.view()))
            .collect()
    }
}

/// Zero mean, unit variance. EI rankings are unchanged by this affine map,
/// and it keeps the hyperparameter priors and slice widths on a unit scale.
fn standardize(y: Array1<f64>) -> Array1<f64> {
    let n = y.len() as f64;
    let mean = y.sum() / n;
    let sd = (y.mapv(|v| (v - mean).powi(2)).sum() / n).sqrt();
    let sd = if sd.is_finite() && sd > 1e-12 { sd } else { 1.0 };
    y.mapv(|v| (v - mean) / sd)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;
    use tempfile::tempdir;

    fn quick() -> ChooserConfig {
        ChooserConfig::default()
            .with_mcmc(10, 3)
            .with_pending_samples(10)
            .with_grid_subset(3)
            .with_refine_iterations(10)
    }

    fn grid(n: usize) -> Array2<f64> {
        Array2::from_shape_fn((n, 2), |(i, d)| {
            let golden = 0.618_033_988_749_895;
            ((i as f64 + 1.0) * if d == 0 { golden } else { golden * golden }).fract()
        })
    }

    fn objective(p: ArrayView1<f64>) -> f64 {
        (p[0] - 0.3).powi(2) + (p[1] - 0.6).powi(2)
    }

    #[test]
    fn defaults_are_resolved() {
        let config = ChooserConfig::default();
        assert_eq!(config.covariance, CovarianceKind::Matern52);
        assert_eq!(config.mcmc_iters, 10);
        assert_eq!(config.pending_samples, 100);
        assert_eq!(config.grid_subset, 20);
        assert!(config.validate().is_ok());
        let parsed: ChooserConfig = serde_json::from_str(r#"{"noiseless": true}"#).unwrap();
        assert!(parsed.noiseless);
        assert_eq!(parsed.burnin, 100);
    }

    #[test]
    fn standardized_values_have_unit_scale() {
        let y = standardize(ndarray::array![10.0, 20.0, 30.0, 40.0]);
        assert!(y.sum().abs() < 1e-12);
        assert!((y.mapv(|v| v * v).sum() / 4.0 - 1.0).abs() < 1e-12);
        assert_eq!(standardize(ndarray::array![3.0, 3.0]), ndarray::array![0.0, 0.0]);
    }

    #[test]
    fn no_observations_returns_first_candidate() {
        let grid = grid(20);
        let values = Array1::from_elem(20, f64::NAN);
        let durations = Array1::zeros(20);
        let candidates: Vec<usize> = (0..20).collect();
        let mut chooser = Chooser::new(quick()).unwrap();
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        let choice = chooser
            .choose_next(grid.view(), values.view(), durations.view(), &candidates, &[], &[], &mut rng)
            .unwrap();
        assert_eq!(choice, Choice::Existing(0));
        assert!(chooser.state().hypers.state().is_none());
    }

    #[test]
    fn violations_do_not_count_as_observations() {
        let grid = grid(10);
        let mut values = Array1::from_elem(10, f64::NAN);
        values[0] = 1.0;
        values[1] = f64::INFINITY;
        let durations = Array1::zeros(10);
        let candidates: Vec<usize> = (2..10).collect();
        let mut chooser = Chooser::new(quick()).unwrap();
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        let choice = chooser
            .choose_next(grid.view(), values.view(), durations.view(), &candidates, &[], &[0, 1], &mut rng)
            .unwrap();
        assert_eq!(choice, Choice::Existing(2));
    }

    #[test]
    fn no_candidates_and_no_model_is_an_error() {
        let grid = grid(2);
        let values = Array1::from_elem(2, f64::NAN);
        let durations = Array1::zeros(2);
        let mut chooser = Chooser::new(quick()).unwrap();
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        assert!(chooser
            .choose_next(grid.view(), values.view(), durations.view(), &[], &[0, 1], &[], &mut rng)
            .is_err());
    }

    #[test]
    fn out_of_range_ids_are_rejected() {
        let grid = grid(4);
        let values = Array1::zeros(4);
        let durations = Array1::zeros(4);
        let mut chooser = Chooser::new(quick()).unwrap();
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        assert!(chooser
            .choose_next(grid.view(), values.view(), durations.view(), &[7], &[], &[0, 1], &mut rng)
            .is_err());
    }

    #[test]
    fn modelled_choice_is_valid() {
        let grid = grid(60);
        let mut values = Array1::from_elem(60, f64::NAN);
        let complete: Vec<usize> = (0..8).collect();
        for &id in &complete {
            values[id] = objective(grid.row(id));
        }
        let pending = vec![8, 9];
        let candidates: Vec<usize> = (10..60).collect();
        let durations = Array1::zeros(60);

        let mut chooser = Chooser::new(quick()).unwrap();
        let mut rng = ChaCha8Rng::seed_from_u64(5);
        let choice = chooser
            .choose_next(
                grid.view(),
                values.view(),
                durations.view(),
                &candidates,
                &pending,
                &complete,
                &mut rng,
            )
            .unwrap();
        match choice {
            Choice::Existing(id) => assert!(candidates.contains(&id)),
            Choice::New { id, point } => {
                assert_eq!(id, 60);
                assert_eq!(point.len(), 2);
                assert!(point.iter().all(|&v| (0.0..=1.0).contains(&v)));
            }
        }
        assert!(!chooser.state().hypers.needs_burnin(2));
    }

    #[test]
    fn constrained_chooser_learns_feasibility() {
        let grid = grid(40);
        let mut values = Array1::from_elem(40, f64::NAN);
        let complete: Vec<usize> = (0..12).collect();
        for &id in &complete {
            let p = grid.row(id);
            values[id] = if p[0] > 0.7 { -1.0 } else { objective(p) };
        }
        let candidates: Vec<usize> = (12..40).collect();
        let durations = Array1::zeros(40);

        let config = quick().with_constraint(Some(-1.0));
        let mut chooser = Chooser::new(config).unwrap();
        let mut rng = ChaCha8Rng::seed_from_u64(6);
        chooser
            .choose_next(grid.view(), values.view(), durations.view(), &candidates, &[], &complete, &mut rng)
            .unwrap();
        let latent = &chooser.state().feasibility.state().unwrap().latent;
        assert_eq!(latent.len(), complete.len());
    }

    #[test]
    fn state_survives_a_restart() {
        let grid = grid(30);
        let mut values = Array1::from_elem(30, f64::NAN);
        let complete: Vec<usize> = (0..6).collect();
        for &id in &complete {
            values[id] = objective(grid.row(id));
        }
        let candidates: Vec<usize> = (6..30).collect();
        let durations = Array1::zeros(30);

        let mut chooser = Chooser::new(quick()).unwrap();
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        chooser
            .choose_next(grid.view(), values.view(), durations.view(), &candidates, &[], &complete, &mut rng)
            .unwrap();

        let dir = tempdir().unwrap();
        let path = dir.path().join("chooser.json");
        chooser.save_state(&path).unwrap();
        let restored = Chooser::load_state(quick(), &path).unwrap();
        assert_eq!(restored.state(), chooser.state());
        assert!(!restored.state().hypers.needs_burnin(2));

        let missing = Chooser::load_state(quick(), &dir.path().join("absent.json")).unwrap();
        assert!(missing.state().hypers.state().is_none());
    }
}
