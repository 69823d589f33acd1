use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use cadence::config::EngineConfig;
use cadence::orchestration::{Engine, HealthMonitor};
use cadence::persistence::PersistenceGateway;
use cadence::workflow::{ExecutionStatus, WorkflowSpec};
use cadence::{Error, Result};

/// Cadence - task and workflow orchestration engine
#[derive(Parser, Debug)]
#[command(name = "cadence")]
#[command(version, about, long_about = None)]
#[command(after_help = "ENVIRONMENT:\n    CADENCE_DEBUG=1     Enable debug logging (alternative to --debug)")]
pub struct Cli {
    /// Enable debug logging (writes to ~/.cadence/cadence.log)
    #[arg(short = 'd', long)]
    pub debug: bool,

    /// Config file (defaults to ~/.cadence/cadence.toml)
    #[arg(short = 'c', long)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Load persisted tasks and run triggers until interrupted
    Serve,

    /// Create and execute a workflow from a JSON or TOML definition
    Workflow {
        /// Workflow definition file
        file: PathBuf,

        /// Execution context as a JSON object
        #[arg(long)]
        context: Option<String>,
    },

    /// List persisted tasks as JSON
    Tasks,

    /// Print the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    cadence::log::init_with_debug(cli.debug);

    let config = match &cli.config {
        Some(path) => EngineConfig::load_from(path)?,
        None => EngineConfig::load()?,
    };

    match cli.command {
        Command::Serve => run_serve(config).await,
        Command::Workflow { file, context } => run_workflow(config, &file, context.as_deref()).await,
        Command::Tasks => run_tasks(config),
        Command::Config => {
            print!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

async fn run_serve(config: EngineConfig) -> Result<()> {
    let gateway = Arc::new(PersistenceGateway::open(&config)?);
    let engine = Engine::builder(config).gateway(gateway.clone()).build();
    let loaded = engine.load_persisted()?;

    let cancel = CancellationToken::new();
    let monitor = HealthMonitor::new(&engine).spawn(cancel.clone());
    let sync = gateway.spawn_sync(&engine, cancel.clone());

    tracing::info!(loaded, "cadence serving");
    eprintln!("cadence: {} task(s) loaded, press Ctrl-C to stop", loaded);

    tokio::signal::ctrl_c().await?;

    tracing::info!("shutdown requested");
    cancel.cancel();
    engine.shutdown();
    for handle in [monitor, sync].into_iter().flatten() {
        let _ = handle.await;
    }
    Ok(())
}

async fn run_workflow(config: EngineConfig, file: &Path, context: Option<&str>) -> Result<()> {
    let spec = read_workflow_spec(file)?;
    let context: Value = match context {
        Some(raw) => serde_json::from_str(raw)?,
        None => Value::Object(Default::default()),
    };
    if !context.is_object() {
        return Err(Error::Validation("--context must be a JSON object".to_string()));
    }

    let gateway = Arc::new(PersistenceGateway::open(&config)?);
    let engine = Engine::builder(config).gateway(gateway).build();

    let workflow = engine.create_workflow(spec)?;
    tracing::info!(workflow = %workflow.id.short(), steps = workflow.steps.len(), "running workflow");
    let execution = engine.execute_workflow(&workflow.id, context).await?;
    engine.shutdown();

    println!("{}", serde_json::to_string_pretty(&execution)?);
    if execution.status == ExecutionStatus::Failed {
        std::process::exit(1);
    }
    Ok(())
}

fn read_workflow_spec(file: &Path) -> Result<WorkflowSpec> {
    let raw = fs::read_to_string(file)?;
    match file.extension().and_then(|e| e.to_str()) {
        Some("toml") => Ok(toml::from_str(&raw)?),
        _ => Ok(serde_json::from_str(&raw)?),
    }
}

fn run_tasks(config: EngineConfig) -> Result<()> {
    let gateway = PersistenceGateway::open(&config)?;
    let records = gateway.load_tasks()?;
    println!("{}", serde_json::to_string_pretty(&records)?);
    Ok(())
}
