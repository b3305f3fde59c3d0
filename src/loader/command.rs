//! Loader for code units stored as files on disk.
//!
//! A specifier is a path (optionally `file://`-prefixed). Relative paths are
//! resolved against the loader's module root. Running the unit spawns it,
//! directly or through a configured interpreter, and captures stdout as the
//! produced value.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, instrument};

use super::{CodeUnit, ExecError, LoadError, ModuleLoader};

/// Loader that runs files as child processes.
#[derive(Debug)]
pub struct CommandLoader {
    root: PathBuf,
    interpreter: Option<PathBuf>,
    /// specifier → canonical path
    resolved: Mutex<HashMap<String, PathBuf>>,
}

impl CommandLoader {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            interpreter: None,
            resolved: Mutex::new(HashMap::new()),
        }
    }

    /// Run units as `<interpreter> <path>` instead of executing them directly.
    #[must_use]
    pub fn with_interpreter(mut self, interpreter: impl Into<PathBuf>) -> Self {
        self.interpreter = Some(interpreter.into());
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Number of cached specifier resolutions.
    pub fn cached(&self) -> usize {
        self.resolved.lock().map_or(0, |cache| cache.len())
    }

    fn cached_path(&self, specifier: &str) -> Option<PathBuf> {
        self.resolved
            .lock()
            .ok()
            .and_then(|cache| cache.get(specifier).cloned())
    }

    async fn resolve(&self, specifier: &str) -> Result<PathBuf, LoadError> {
        if let Some(path) = self.cached_path(specifier) {
            return Ok(path);
        }

        let trimmed = specifier.strip_prefix("file://").unwrap_or(specifier);
        if trimmed.is_empty() {
            return Err(LoadError::invalid(specifier, "empty module specifier"));
        }

        let candidate = Path::new(trimmed);
        let candidate = if candidate.is_absolute() {
            candidate.to_path_buf()
        } else {
            self.root.join(candidate)
        };

        let metadata = match tokio::fs::metadata(&candidate).await {
            Ok(m) => m,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(LoadError::not_found(specifier));
            }
            Err(e) => return Err(LoadError::invalid(specifier, e.to_string())),
        };
        if !metadata.is_file() {
            return Err(LoadError::invalid(specifier, "not a regular file"));
        }

        let path = tokio::fs::canonicalize(&candidate)
            .await
            .map_err(|e| LoadError::invalid(specifier, e.to_string()))?;

        debug!(specifier, path = %path.display(), "Resolved module");
        if let Ok(mut cache) = self.resolved.lock() {
            cache.insert(specifier.to_string(), path.clone());
        }
        Ok(path)
    }
}

#[async_trait]
impl ModuleLoader for CommandLoader {
    async fn load(&self, specifier: &str) -> Result<Arc<dyn CodeUnit>, LoadError> {
        let path = self.resolve(specifier).await?;
        Ok(Arc::new(CommandUnit {
            path,
            dir: self.root.clone(),
            interpreter: self.interpreter.clone(),
        }))
    }
}

struct CommandUnit {
    path: PathBuf,
    dir: PathBuf,
    interpreter: Option<PathBuf>,
}

#[async_trait]
impl CodeUnit for CommandUnit {
    #[instrument(skip(self), fields(exec = %self.path.display()))]
    async fn run(&self) -> Result<String, ExecError> {
        let mut cmd = match &self.interpreter {
            Some(interpreter) => {
                let mut cmd = Command::new(interpreter);
                cmd.arg(&self.path);
                cmd
            }
            None => Command::new(&self.path),
        };

        // kill_on_drop: a timed-out request drops this future
        let output = cmd
            .current_dir(&self.dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await?;

        if !output.status.success() {
            let code = output.status.code().unwrap_or(-1);
            debug!(exit_code = code, "Unit failed");
            return Err(ExecError::Exit {
                code,
                stderr: String::from_utf8_lossy(&output.stderr).trim_end().to_string(),
            });
        }

        let mut stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        if stdout.ends_with('\n') {
            stdout.pop();
        }
        debug!(output_len = stdout.len(), "Unit completed");
        Ok(stdout)
    }
}
