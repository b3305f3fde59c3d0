//! Worker process supervision.
//!
//! The host starts each worker with `PORT` set to its listener port. Workers
//! talk to the host over TCP, so stdin is closed and stdout/stderr are
//! inherited for their logs.

use std::process::{ExitStatus, Stdio};

use anyhow::{Context, Result};
use tokio::process::{Child, Command};
use tracing::{debug, warn};

use crate::config::{WorkerCommand, PORT_ENV};

/// A spawned worker. Killed when dropped.
#[derive(Debug)]
pub struct WorkerProcess {
    child: Child,
    program: String,
}

impl WorkerProcess {
    pub fn spawn(command: &WorkerCommand, port: u16) -> Result<Self> {
        debug!(program = %command.program, args = ?command.args, port, "Spawning worker process");

        let mut cmd = Command::new(&command.program);
        cmd.args(&command.args)
            .envs(&command.env)
            .env(PORT_ENV, port.to_string())
            .stdin(Stdio::null())
            .kill_on_drop(true);
        if let Some(dir) = &command.dir {
            cmd.current_dir(dir);
        }

        let child = cmd
            .spawn()
            .with_context(|| format!("Failed to spawn worker: {}", command.program))?;

        debug!(pid = ?child.id(), "Worker process started");
        Ok(Self {
            child,
            program: command.program.clone(),
        })
    }

    /// OS process id, `None` once the process has been reaped.
    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    /// Exit status if the process has already terminated.
    pub fn try_exit_status(&mut self) -> Result<Option<ExitStatus>> {
        self.child
            .try_wait()
            .with_context(|| format!("Failed to poll worker: {}", self.program))
    }

    /// Kill the process and reap it.
    pub async fn shutdown(mut self) -> Result<()> {
        if let Some(status) = self.try_exit_status()? {
            warn!(program = %self.program, %status, "Worker process had already exited");
            return Ok(());
        }

        if let Err(e) = self.child.kill().await {
            warn!(program = %self.program, error = %e, "Failed to kill worker process");
        }
        let status = self
            .child
            .wait()
            .await
            .with_context(|| format!("Failed to reap worker: {}", self.program))?;
        debug!(program = %self.program, %status, "Worker process shut down");
        Ok(())
    }
}
