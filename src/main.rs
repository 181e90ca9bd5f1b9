//! CLI entry point for the inpainting pipeline

use anyhow::Result;
use clap::Parser;
use inpaint_pipeline::config::PipelineConfig;
use inpaint_pipeline::logging;
use inpaint_pipeline::stages::run_pipeline;
use std::path::PathBuf;
use tracing::{error, info};

const MAIN_CONFIG: &str = "config/main_config.yaml";
const SMOKE_TEST_CONFIG: &str = "config/smoke_test_config.yaml";

#[derive(Parser)]
#[command(name = "inpaint-pipeline")]
#[command(version)]
#[command(about = "Dataset-to-deployment pipeline for Stable Diffusion inpainting", long_about = None)]
struct Cli {
    /// Stage ids to run, in order
    ///
    /// 1 acquisition, 2 EDA, 3 processing, 4 splitting, 5 masking,
    /// 6 tuning, 7 training, 8 evaluation, 9 packaging
    #[arg(long, num_args = 1.., default_values = ["1", "2", "3", "4", "5", "6", "7", "8", "9"])]
    stages: Vec<String>,

    /// Use the small smoke-test configuration
    #[arg(long)]
    smoke_test: bool,

    /// Explicit configuration file (overrides --smoke-test)
    #[arg(long)]
    config: Option<PathBuf>,
}

impl Cli {
    fn config_path(&self) -> PathBuf {
        match (&self.config, self.smoke_test) {
            (Some(path), _) => path.clone(),
            (None, true) => PathBuf::from(SMOKE_TEST_CONFIG),
            (None, false) => PathBuf::from(MAIN_CONFIG),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config_path = cli.config_path();
    let config = PipelineConfig::load(&config_path)?;
    logging::init(&config.logging)?;

    info!(
        config = %config_path.display(),
        project = %config.global_params.project_name,
        stages = ?cli.stages,
        "Starting pipeline"
    );
    let report = run_pipeline(&cli.stages, &config).await;

    match report.failed {
        Some(stage) => error!(completed = report.completed.len(), "Pipeline halted at {}", stage),
        None => info!(completed = report.completed.len(), "Pipeline finished"),
    }
    Ok(())
}
