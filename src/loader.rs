//! Code unit loaders.
//!
//! A worker executes "code units" named by a specifier string. The loader
//! resolves the specifier to a unit; running the unit produces the value that
//! is sent back as the response content. Loaders may cache resolutions; the
//! cache belongs to the loader instance, which belongs to one worker session.

mod command;
mod registry;

pub use command::CommandLoader;
pub use registry::{FnUnit, RegistryLoader};

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

/// Failure to turn a specifier into a runnable unit.
#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("Cannot find module '{specifier}'")]
    NotFound { specifier: String },

    #[error("Cannot load module '{specifier}': {message}")]
    Invalid { specifier: String, message: String },
}

impl LoadError {
    pub fn not_found(specifier: impl Into<String>) -> Self {
        Self::NotFound {
            specifier: specifier.into(),
        }
    }

    pub fn invalid(specifier: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Invalid {
            specifier: specifier.into(),
            message: message.into(),
        }
    }
}

/// Failure while running a loaded unit.
#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    /// The unit itself reported a failure.
    #[error("{0}")]
    Failed(String),

    #[error("process exited with status {code}: {stderr}")]
    Exit { code: i32, stderr: String },

    #[error("execution timed out after {0:?}")]
    Timeout(Duration),

    #[error("execution panicked: {0}")]
    Panicked(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ExecError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}

/// A loaded, runnable code unit.
#[async_trait]
pub trait CodeUnit: Send + Sync {
    /// Run the unit and return its produced value, stringified.
    async fn run(&self) -> Result<String, ExecError>;
}

/// Resolves specifiers to code units.
///
/// Shared by every concurrently running request of a session, so
/// implementations must tolerate concurrent `load` calls.
#[async_trait]
pub trait ModuleLoader: Send + Sync + 'static {
    async fn load(&self, specifier: &str) -> Result<Arc<dyn CodeUnit>, LoadError>;
}
