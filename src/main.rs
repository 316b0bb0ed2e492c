//! lab_equipment CLI.
//!
//! Runs the engine against the simulated equipment described in the
//! configuration's `[simulation]` section.
//!
//! ```bash
//! lab_equipment --config config/lab.toml validate --spec demos/distance.json
//! lab_equipment --config config/lab.toml run --spec demos/distance.json --output results.json
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio::time::{sleep, Duration};
use tracing::info;

use lab_equipment::device::simulated::Faults;
use lab_equipment::driver::DriverRegistry;
use lab_equipment::{logging, LabConfig, LabEquipmentManager};

#[derive(Parser)]
#[command(name = "lab_equipment")]
#[command(about = "Power-lifecycle orchestration and experiment execution for lab equipment")]
struct Cli {
    /// Configuration file
    #[arg(long, short, default_value = "config/lab.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a specification and print the time estimate.
    Validate {
        /// Specification file (JSON)
        #[arg(short, long)]
        spec: PathBuf,
    },

    /// Run a specification to completion and print its results.
    Run {
        /// Specification file (JSON)
        #[arg(short, long)]
        spec: PathBuf,
        /// Write results here instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// List the configured setup ids.
    Setups,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = LabConfig::load_from(&cli.config)
        .with_context(|| format!("Failed to load {}", cli.config.display()))?;
    logging::init_from_config(&config)?;

    let devices = config.simulation.build_devices(&Faults::new());
    let manager = LabEquipmentManager::start(&config, Arc::new(DriverRegistry::with_builtin()), devices)?;

    let outcome = match cli.command {
        Commands::Validate { spec } => validate(&manager, spec).await,
        Commands::Run { spec, output } => run(&manager, spec, output).await,
        Commands::Setups => {
            for id in manager.engine().setup_ids() {
                println!("{}", id);
            }
            Ok(())
        }
    };

    manager.shutdown().await?;
    outcome
}

async fn read_spec(path: &Path) -> Result<String> {
    tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read specification {}", path.display()))
}

async fn validate(manager: &LabEquipmentManager, spec: PathBuf) -> Result<()> {
    let text = read_spec(&spec).await?;
    let validation = manager.validate(&text).await?;
    if validation.accepted {
        println!("Accepted: estimated {} s", validation.execution_time);
        Ok(())
    } else {
        bail!(
            "Rejected: {}",
            validation.error_message.unwrap_or_default()
        )
    }
}

async fn run(manager: &LabEquipmentManager, spec: PathBuf, output: Option<PathBuf>) -> Result<()> {
    let text = read_spec(&spec).await?;

    let started = manager.start_execution(&text).await?;
    if started.is_completed() {
        bail!(
            "Not started: {}",
            started.error_message.unwrap_or_default()
        );
    }
    let execution_id = started.execution_id;
    info!(execution_id, estimate = started.time_remaining, "Execution started");

    let status = loop {
        sleep(Duration::from_secs(1)).await;
        let status = manager.get_execution_status(execution_id).await?;
        println!(
            "[{}] {} ({} s remaining)",
            execution_id, status.execute_status, status.time_remaining
        );
        if status.is_completed() {
            break status;
        }
    };

    if !status.succeeded() {
        bail!(
            "Execution {}: {}",
            status.result_status,
            status.error_message.unwrap_or_default()
        );
    }

    let results = manager
        .get_experiment_results(execution_id)
        .await?
        .context("Results were not available")?;
    match output {
        Some(path) => {
            tokio::fs::write(&path, results)
                .await
                .with_context(|| format!("Failed to write {}", path.display()))?;
            println!("Results written to {}", path.display());
        }
        None => println!("{}", results),
    }
    Ok(())
}
