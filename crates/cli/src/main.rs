//! Drive Creel workflows from the command line, running jobs as local processes.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use creel_job_manager::{
    dataset::{BasicPartitioner, StaticDescriptor},
    run, ControllerConfig, Dispatcher, WorkUnitStore,
};
use creel_local_jobs::LocalExecutor;
use error_stack::{Report, ResultExt};
use thiserror::Error;
use tracing::{event, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Debug, Error)]
enum CliError {
    #[error("Failed to load configuration")]
    Config,
    #[error("Run failed")]
    Run,
    #[error("Failed to read the work unit store")]
    Store,
}

#[derive(Debug, Parser)]
#[command(version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run every configured workflow to completion, resuming an earlier run if there is one.
    Run {
        /// The JSON configuration file.
        config: PathBuf,
        /// Directory for job scratch areas.
        #[arg(long)]
        tmpdir: Option<PathBuf>,
        /// Keep job scratch areas after the jobs finish.
        #[arg(long)]
        keep_scratch: bool,
    },
    /// Show unit counts for every configured workflow.
    Status { config: PathBuf },
}

#[tokio::main]
async fn main() -> Result<(), Report<CliError>> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Run {
            config,
            tmpdir,
            keep_scratch,
        } => run_workflows(config, tmpdir, keep_scratch).await,
        Command::Status { config } => status(config).await,
    }
}

async fn run_workflows(
    config: PathBuf,
    tmpdir: Option<PathBuf>,
    keep_scratch: bool,
) -> Result<(), Report<CliError>> {
    let config = ControllerConfig::load(&config).change_context(CliError::Config)?;
    let behavior = config.scheduler.clone();
    let dispatcher = Dispatcher::new(config, &BasicPartitioner, &StaticDescriptor::default())
        .await
        .change_context(CliError::Run)?;
    let executor = LocalExecutor {
        tmpdir,
        keep_scratch,
    };

    tokio::select! {
        summary = run(&dispatcher, &executor, &behavior) => {
            println!(
                "Finished {} jobs ({} merges, {} failed)",
                summary.jobs, summary.merges, summary.failed
            );
        }
        _ = tokio::signal::ctrl_c() => {
            event!(Level::WARN, "interrupted, running jobs will be recovered on the next run");
        }
    }

    Ok(())
}

async fn status(config: PathBuf) -> Result<(), Report<CliError>> {
    let config = ControllerConfig::load(&config).change_context(CliError::Config)?;
    let store = WorkUnitStore::open(&config.store_path(), config.scheduler.retry.clone())
        .await
        .change_context(CliError::Store)?;

    println!(
        "{:<24} {:>9} {:>9} {:>9} {:>9} {:>11}",
        "workflow", "pending", "running", "failed", "exhausted", "successful"
    );
    for workflow in &config.workflows {
        let counts = store
            .counts(&workflow.label)
            .await
            .change_context(CliError::Store)?;
        println!(
            "{:<24} {:>9} {:>9} {:>9} {:>9} {:>11}",
            workflow.label,
            counts.pending,
            counts.running,
            counts.failed,
            counts.exhausted,
            counts.successful
        );
    }

    Ok(())
}
