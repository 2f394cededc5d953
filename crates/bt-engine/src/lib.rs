//! # bt-engine
//!
//! Experiment controller for BayesTune.
//!
//! Ties the experiment store, the chooser and a job runner together in a
//! synchronous loop: pick the next point, dispatch it, record the outcome,
//! until enough jobs have completed.

pub mod config;
pub mod controller;
pub mod runner;

pub use config::{ExperimentConfig, RunnerConfig};
pub use controller::{Controller, RunSummary, StepOutcome, CHOOSER_STATE_FILE};
pub use runner::{branin, params_json, BuiltinObjective, JobOutcome, JobRunner, ObjectiveFn, BRANIN_MINIMUM};
