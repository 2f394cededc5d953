//! End-to-end optimization of the Branin function through the store and the
//! builtin runner.

use bt_engine::{BuiltinObjective, Controller, ExperimentConfig, RunnerConfig, BRANIN_MINIMUM};
use bt_optimizer::ChooserConfig;
use bt_types::ParameterSpace;
use tempfile::tempdir;

fn branin_config(max_finished_jobs: usize, chooser: ChooserConfig) -> ExperimentConfig {
    let space = ParameterSpace::new()
        .add_real("x1", -5.0, 10.0)
        .add_real("x2", 0.0, 15.0);
    ExperimentConfig::new(
        "branin",
        space,
        RunnerConfig::Builtin {
            objective: BuiltinObjective::Branin,
        },
    )
    .with_chooser(chooser)
    .with_grid(500, 7)
    .with_max_finished_jobs(max_finished_jobs)
    .with_seed(11)
}

#[test]
fn short_run_finds_a_basin() {
    let chooser = ChooserConfig::default()
        .with_mcmc(30, 5)
        .with_pending_samples(10)
        .with_grid_subset(5)
        .with_refine_iterations(30)
        .with_noiseless(true);
    let dir = tempdir().unwrap();
    let mut controller = Controller::open(&branin_config(30, chooser), dir.path()).unwrap();
    let summary = controller.run().unwrap();

    assert_eq!(summary.completed, 30);
    assert_eq!(summary.broken, 0);
    let best = summary.best_value.unwrap();
    assert!(best < 5.0, "best {best}");

    let snap = controller.store().snapshot().unwrap();
    for id in snap.complete() {
        let record = snap.record(id).unwrap();
        assert!(record.point.iter().all(|&v| (0.0..=1.0).contains(&v)));
    }
}

#[test]
#[ignore = "slow: 200 evaluations with full MCMC settings"]
fn converges_to_the_global_minimum() {
    let chooser = ChooserConfig::default().with_noiseless(true);
    let dir = tempdir().unwrap();
    let mut controller = Controller::open(&branin_config(200, chooser), dir.path()).unwrap();
    let summary = controller.run().unwrap();
    let best = summary.best_value.unwrap();
    assert!((best - BRANIN_MINIMUM).abs() < 1e-2, "best {best}");
}
