//! runtime-bridge worker
//!
//! Connects to the host on `PORT`, announces readiness and executes code
//! units on request. Settings come from `BRIDGE_*` environment variables.

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use runtime_bridge::{config::WorkerConfig, loader::CommandLoader, WorkerSession};

#[derive(Parser, Debug)]
#[command(name = "runtime-bridge-worker")]
#[command(about = "Worker endpoint executing code units for a runtime-bridge host")]
struct Args {
    /// Directory relative specifiers are resolved against (overrides BRIDGE_MODULE_ROOT)
    #[arg(long)]
    module_root: Option<std::path::PathBuf>,

    /// Program that runs each unit, e.g. `node` (overrides BRIDGE_INTERPRETER)
    #[arg(long)]
    interpreter: Option<std::path::PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // stderr: stdout may be shared with the host's own output
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let mut config = WorkerConfig::from_env().context("Failed to load worker configuration")?;
    if let Some(root) = args.module_root {
        config.module_root = root;
    }
    if let Some(interpreter) = args.interpreter {
        config.interpreter = Some(interpreter);
    }

    info!(
        address = %config.address(),
        max_concurrency = config.max_concurrency,
        module_root = %config.module_root.display(),
        "Starting worker"
    );

    let mut loader = CommandLoader::new(config.module_root.clone());
    if let Some(interpreter) = &config.interpreter {
        loader = loader.with_interpreter(interpreter.clone());
    }

    WorkerSession::new(config, loader)
        .run()
        .await
        .context("Worker session failed")?;

    info!("Host closed the connection, exiting");
    Ok(())
}
