//! Distributed gradient boosted trees trainer.
//!
//! ```bash
//! dgbt-train --config run.toml
//! ```

use std::path::PathBuf;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use dgbt::{DistributedGbdtLearner, RunConfig};

#[derive(Parser, Debug)]
#[command(name = "dgbt-train")]
#[command(about = "Distributed gradient boosted trees trainer")]
struct Args {
    /// Run configuration file (TOML).
    #[arg(short, long)]
    config: PathBuf,

    /// Overrides the output model path from the configuration.
    #[arg(short, long)]
    output: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> dgbt::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let run_config = RunConfig::from_file(&args.config)?;

    let learner = DistributedGbdtLearner::new(
        run_config.training.clone(),
        run_config.deployment.clone(),
    );
    let model = learner.train(&run_config.dataset).await?;

    if let Some(output) = args.output.or(run_config.output) {
        model.save(&output)?;
        tracing::info!("Model written to {}", output.display());
    }
    Ok(())
}
