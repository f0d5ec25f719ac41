use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use flux_core::{Engine, RunId, RunRecord};
use std::path::PathBuf;

mod config;
mod demo;

use config::{FluxConfig, LoggingConfig};

#[derive(Parser, Debug)]
#[command(name = "flux")]
#[command(about = "Durable step execution with per-step retry and resume", long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "flux.toml", env = "FLUX_CONFIG")]
    config: PathBuf,

    /// Data directory for storage
    #[arg(short, long, default_value = "./data", env = "FLUX_DATA_DIR")]
    data_dir: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start a new run of the demo workflow
    Run {
        #[arg(long, default_value = "1")]
        order_id: u64,

        /// Make the API step fail on every attempt
        #[arg(long)]
        api_down: bool,
    },
    /// Resume a failed run at the step it failed on
    Retry {
        run_id: RunId,

        /// Step to resume; defaults to the recorded failed step
        #[arg(long)]
        step: Option<String>,

        #[arg(long)]
        api_down: bool,
    },
    /// Print a stored run as JSON
    Show { run_id: RunId },
    /// List stored runs, newest first
    List,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = FluxConfig::load(&args.config, args.data_dir.clone())?;
    init_tracing(&config.logging);

    if !args.config.exists() {
        tracing::info!("Configuration file not found, using defaults");
    }
    tracing::info!("Data directory: {}", config.data_dir.display());
    tracing::info!("Storage backend: {:?}", config.storage.backend);

    let engine = Engine::with_tracing(config.open_storage()?);

    match args.command {
        Command::Run { order_id, api_down } => {
            let workflow = demo::workflow(api_down)?;
            let record = engine
                .execute(&workflow, demo::SyncRequest { order_id })
                .await?;
            print_record(&record)?;
        }
        Command::Retry {
            run_id,
            step,
            api_down,
        } => {
            let step = match step {
                Some(step) => step,
                None => failed_step(&engine, run_id).await?,
            };
            let workflow = demo::workflow(api_down)?;
            match engine.retry_step(&workflow, run_id, &step).await? {
                Some(record) => print_record(&record)?,
                None => bail!("Run {} not found", run_id),
            }
        }
        Command::Show { run_id } => match engine.get_run(run_id).await? {
            Some(record) => print_record(&record)?,
            None => bail!("Run {} not found", run_id),
        },
        Command::List => {
            for record in engine.list_runs().await? {
                println!(
                    "{}  {:<9}  {:<16}  {}",
                    record.id,
                    record.status,
                    record.workflow_name,
                    record.updated_at.to_rfc3339()
                );
            }
        }
    }

    Ok(())
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| logging.filter.as_str().into());

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    if logging.json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

async fn failed_step(engine: &Engine, run_id: RunId) -> Result<String> {
    let record = engine
        .get_run(run_id)
        .await?
        .with_context(|| format!("Run {} not found", run_id))?;

    record
        .failure
        .map(|f| f.step)
        .with_context(|| format!("Run {} is {}, nothing to retry", run_id, record.status))
}

fn print_record(record: &RunRecord) -> Result<()> {
    let json = serde_json::to_string_pretty(record).context("Failed to serialize run")?;
    println!("{}", json);
    Ok(())
}
