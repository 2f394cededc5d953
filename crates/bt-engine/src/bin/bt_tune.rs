use std::path::PathBuf;

use anyhow::{bail, Context};
use bt_engine::{Controller, ExperimentConfig};
use tracing_subscriber::EnvFilter;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let mut args = std::env::args().skip(1);
    let (Some(config_path), Some(dir)) = (args.next(), args.next()) else {
        bail!("usage: bt-tune <config.json> <experiment-dir>");
    };
    let config_path = PathBuf::from(config_path);
    let dir = PathBuf::from(dir);

    let config = ExperimentConfig::from_file(&config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;
    let mut controller = Controller::open(&config, &dir)
        .with_context(|| format!("opening experiment in {}", dir.display()))?;
    let summary = controller.run()?;

    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}
