//! The synchronous optimization loop: choose, dispatch, record, repeat.

use std::path::{Path, PathBuf};

use bt_optimizer::{Choice, Chooser};
use bt_store::ExperimentStore;
use bt_types::{Phenotype, TuneError, TuneResult};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::ExperimentConfig;
use crate::runner::JobRunner;

/// File in the experiment directory holding the chooser's MCMC state.
pub const CHOOSER_STATE_FILE: &str = "chooser.json";

/// What one call to [`Controller::step`] did.
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    /// Enough jobs have completed; nothing was dispatched.
    Finished,
    Completed { id: usize, value: f64 },
    Broken { id: usize, reason: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub completed: usize,
    pub broken: usize,
    pub best_id: Option<usize>,
    pub best_value: Option<f64>,
    pub best_params: Option<Phenotype>,
}

pub struct Controller {
    store: ExperimentStore,
    chooser: Chooser,
    runner: JobRunner,
    rng: ChaCha8Rng,
    max_finished_jobs: usize,
    state_path: Option<PathBuf>,
}

impl Controller {
    /// Open or create the experiment in `dir` and restore any saved chooser
    /// state found there.
    pub fn open(config: &ExperimentConfig, dir: &Path) -> TuneResult<Self> {
        Self::with_runner(config, dir, JobRunner::from(&config.runner))
    }

    /// Like [`Controller::open`], with an explicit runner (for in-process
    /// objectives).
    pub fn with_runner(
        config: &ExperimentConfig,
        dir: &Path,
        runner: JobRunner,
    ) -> TuneResult<Self> {
        config.validate()?;
        let store = ExperimentStore::create_or_open(
            dir,
            &config.space,
            config.grid_size,
            config.grid_seed,
            config.lock,
        )?;
        let state_path = dir.join(CHOOSER_STATE_FILE);
        let chooser = Chooser::load_state(config.chooser.clone(), &state_path)?;
        info!(
            experiment = %config.name,
            dir = %dir.display(),
            max_finished_jobs = config.max_finished_jobs,
            "controller ready"
        );
        Ok(Self {
            store,
            chooser,
            runner,
            rng: ChaCha8Rng::seed_from_u64(config.seed),
            max_finished_jobs: config.max_finished_jobs,
            state_path: Some(state_path),
        })
    }

    /// Assemble a controller from parts; chooser state is not persisted.
    pub fn from_parts(
        store: ExperimentStore,
        chooser: Chooser,
        runner: JobRunner,
        seed: u64,
        max_finished_jobs: usize,
    ) -> Self {
        Self {
            store,
            chooser,
            runner,
            rng: ChaCha8Rng::seed_from_u64(seed),
            max_finished_jobs,
            state_path: None,
        }
    }

    pub fn store(&self) -> &ExperimentStore {
        &self.store
    }

    pub fn chooser(&self) -> &Chooser {
        &self.chooser
    }

    /// Choose one job, run it to completion and record the outcome.
    pub fn step(&mut self) -> TuneResult<StepOutcome> {
        let snapshot = self.store.snapshot()?;
        if snapshot.complete().len() >= self.max_finished_jobs {
            return Ok(StepOutcome::Finished);
        }

        let choice = self.chooser.choose_next(
            snapshot.points(),
            snapshot.value_array().view(),
            snapshot.duration_array().view(),
            &snapshot.candidates(),
            &snapshot.pending(),
            &snapshot.complete(),
            &mut self.rng,
        )?;
        if let Some(path) = &self.state_path {
            self.chooser.save_state(path)?;
        }

        let (id, point) = match choice {
            Choice::Existing(id) => (id, snapshot.points().row(id).to_vec()),
            Choice::New { point, .. } => (self.store.append(&point)?, point),
        };
        let params = snapshot.space().decode(&point)?;

        self.store
            .mark_submitted(id, Some(format!("pid:{}", std::process::id())))?;
        self.store.mark_running(id)?;

        match self.runner.run(&params) {
            Ok(outcome) => {
                self.store.mark_complete(id, outcome.value, outcome.duration)?;
                info!(id, value = outcome.value, duration = outcome.duration, "job complete");
                Ok(StepOutcome::Completed {
                    id,
                    value: outcome.value,
                })
            }
            Err(e) => {
                self.store.mark_broken(id)?;
                warn!(id, error = %e, "job broken");
                Ok(StepOutcome::Broken {
                    id,
                    reason: e.to_string(),
                })
            }
        }
    }

    /// Step until `max_finished_jobs` jobs have completed.
    ///
    /// Gives up once as many jobs have broken as were asked to complete.
    pub fn run(&mut self) -> TuneResult<RunSummary> {
        loop {
            if self.step()? == StepOutcome::Finished {
                break;
            }
            let broken = self.store.snapshot()?.broken().len();
            if broken >= self.max_finished_jobs {
                return Err(TuneError::Evaluation(format!(
                    "{broken} jobs broke before {} completed",
                    self.max_finished_jobs
                )));
            }
        }
        let summary = self.summary()?;
        info!(
            completed = summary.completed,
            broken = summary.broken,
            best = ?summary.best_value,
            "experiment finished"
        );
        Ok(summary)
    }

    pub fn summary(&self) -> TuneResult<RunSummary> {
        let snapshot = self.store.snapshot()?;
        let best = snapshot.best();
        let best_params = best.map(|(id, _)| snapshot.params(id)).transpose()?;
        Ok(RunSummary {
            completed: snapshot.complete().len(),
            broken: snapshot.broken().len(),
            best_id: best.map(|(id, _)| id),
            best_value: best.map(|(_, v)| v),
            best_params,
        })
    }
}
