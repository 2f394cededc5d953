//! Experiment configuration, read from a JSON file by `bt-tune`.

use std::path::Path;

use bt_optimizer::ChooserConfig;
use bt_store::LockConfig;
use bt_types::{config_error, ParameterSpace, TuneResult};
use serde::{Deserialize, Serialize};

use crate::runner::{BuiltinObjective, JobRunner};

/// Serializable description of a [`JobRunner`]. In-process objectives can
/// only be supplied from code.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum RunnerConfig {
    Command {
        program: String,
        #[serde(default)]
        args: Vec<String>,
    },
    Builtin {
        objective: BuiltinObjective,
    },
}

impl From<&RunnerConfig> for JobRunner {
    fn from(config: &RunnerConfig) -> Self {
        match config {
            RunnerConfig::Command { program, args } => JobRunner::Command {
                program: program.clone(),
                args: args.clone(),
            },
            RunnerConfig::Builtin { objective } => JobRunner::Builtin(*objective),
        }
    }
}

fn default_grid_size() -> usize {
    1000
}

fn default_grid_seed() -> u64 {
    1
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentConfig {
    pub name: String,
    pub space: ParameterSpace,
    #[serde(default)]
    pub chooser: ChooserConfig,
    /// Quasi-random candidates written when the experiment is created.
    #[serde(default = "default_grid_size")]
    pub grid_size: usize,
    #[serde(default = "default_grid_seed")]
    pub grid_seed: u64,
    /// Stop once this many jobs have completed.
    pub max_finished_jobs: usize,
    /// Seed for the controller's random source.
    #[serde(default)]
    pub seed: u64,
    pub runner: RunnerConfig,
    #[serde(default)]
    pub lock: LockConfig,
}

impl ExperimentConfig {
    pub fn new(name: impl Into<String>, space: ParameterSpace, runner: RunnerConfig) -> Self {
        Self {
            name: name.into(),
            space,
            chooser: ChooserConfig::default(),
            grid_size: default_grid_size(),
            grid_seed: default_grid_seed(),
            max_finished_jobs: 100,
            seed: 0,
            runner,
            lock: LockConfig::default(),
        }
    }

    pub fn with_chooser(mut self, chooser: ChooserConfig) -> Self {
        self.chooser = chooser;
        self
    }

    pub fn with_grid(mut self, size: usize, seed: u64) -> Self {
        self.grid_size = size;
        self.grid_seed = seed;
        self
    }

    pub fn with_max_finished_jobs(mut self, n: usize) -> Self {
        self.max_finished_jobs = n;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn from_file(path: &Path) -> TuneResult<Self> {
        let text = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&text)
            .map_err(|e| config_error!("{}: {e}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> TuneResult<()> {
        self.space.validate()?;
        self.chooser.validate()?;
        if self.grid_size == 0 {
            return Err(config_error!("grid_size must be at least 1"));
        }
        if self.max_finished_jobs == 0 {
            return Err(config_error!("max_finished_jobs must be at least 1"));
        }
        if let RunnerConfig::Command { program, .. } = &self.runner {
            if program.trim().is_empty() {
                return Err(config_error!("runner program is empty"));
            }
        }
        Ok(())
    }
}
