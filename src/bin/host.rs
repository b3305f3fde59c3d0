//! runtime-bridge host
//!
//! Spawns a pool of workers, waits for them to announce readiness and
//! dispatches execute or ping requests to them.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use runtime_bridge::config::{HostConfig, WorkerCommand};
use runtime_bridge::SessionManager;

#[derive(Parser, Debug)]
#[command(name = "runtime-bridge-host")]
#[command(about = "Dispatch code units to a pool of runtime-bridge workers")]
struct Args {
    /// JSON config file (defaults to RUNTIME_BRIDGE_CONFIG, then built-in defaults)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Listener port, 0 for any free port
    #[arg(long)]
    port: Option<u16>,

    /// Number of worker processes
    #[arg(long)]
    processes: Option<usize>,

    /// Worker program to spawn
    #[arg(long)]
    worker: Option<String>,

    /// Argument passed to the worker program (repeatable)
    #[arg(long = "worker-arg", allow_hyphen_values = true)]
    worker_args: Vec<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Execute code units concurrently and print their output
    Execute {
        #[arg(required = true)]
        specifiers: Vec<String>,
    },
    /// Health-check every worker
    Ping,
    /// Keep the pool running until interrupted
    Serve,
}

fn load_config(args: &Args) -> Result<HostConfig> {
    let mut config = match &args.config {
        Some(path) => HostConfig::from_file(path)?,
        None => HostConfig::from_env()?,
    };
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(processes) = args.processes {
        config.processes = processes;
    }
    if let Some(program) = &args.worker {
        let mut command = WorkerCommand::new(program.clone());
        command.args.clone_from(&args.worker_args);
        config.worker = Some(command);
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = load_config(&args).context("Failed to load host configuration")?;
    info!(
        port = config.port,
        processes = config.processes,
        worker = ?config.worker.as_ref().map(|w| &w.program),
        "Starting host"
    );

    let manager = SessionManager::start(config)
        .await
        .context("Failed to start worker pool")?;

    let outcome = run(&manager, args.command).await;
    manager.shutdown().await;
    outcome
}

async fn run(manager: &SessionManager, command: Command) -> Result<()> {
    match command {
        Command::Execute { specifiers } => {
            let calls = specifiers.iter().map(|s| manager.execute(s));
            let results = futures::future::join_all(calls).await;

            let mut failed = 0usize;
            for (specifier, result) in specifiers.iter().zip(results) {
                match result {
                    Ok(output) => println!("{output}"),
                    Err(e) => {
                        failed += 1;
                        eprintln!("{specifier}: {e}");
                    }
                }
            }
            anyhow::ensure!(failed == 0, "{failed} of {} executions failed", specifiers.len());
        }
        Command::Ping => {
            let results = manager.ping_all().await;
            anyhow::ensure!(!results.is_empty(), "No ready workers");
            let mut failed = 0usize;
            for (connection, result) in results {
                match result {
                    Ok(()) => println!("worker {connection}: pong"),
                    Err(e) => {
                        failed += 1;
                        println!("worker {connection}: {e}");
                    }
                }
            }
            anyhow::ensure!(failed == 0, "{failed} workers failed the health check");
        }
        Command::Serve => {
            info!(port = manager.local_port(), "Serving, press Ctrl-C to stop");
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "Failed to listen for Ctrl-C");
            }
        }
    }
    Ok(())
}
