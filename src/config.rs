//! Configuration for both ends of the bridge.
//!
//! The worker is configured from process environment variables set by the
//! host that spawns it (`PORT` is mandatory). The host reads JSON, either from
//! the `RUNTIME_BRIDGE_CONFIG` environment variable or from a file.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::warn;

use crate::transport::DEFAULT_MAX_FRAME_LENGTH;

/// Environment variable carrying the port the worker connects to.
pub const PORT_ENV: &str = "PORT";

/// Environment variable carrying the host's JSON configuration.
pub const HOST_CONFIG_ENV: &str = "RUNTIME_BRIDGE_CONFIG";

/// Worker endpoint settings.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Address of the host listener.
    pub host: String,

    /// Port of the host listener.
    pub port: u16,

    /// Maximum number of `execute` requests running at once.
    pub max_concurrency: usize,

    /// Maximum number of accepted, unfinished `execute` requests. Beyond this
    /// the worker answers new executes with an overload error.
    pub max_queued: usize,

    /// Per-execution deadline, if any.
    pub execute_timeout: Option<Duration>,

    /// How long in-flight executions may keep running after the host closes
    /// the connection. Whatever is left is then aborted.
    pub drain_timeout: Duration,

    pub max_frame_length: usize,

    /// Base directory for relative module specifiers.
    pub module_root: PathBuf,

    /// Interpreter used to run module files (e.g. `node`). Files are
    /// executed directly when unset.
    pub interpreter: Option<PathBuf>,
}

impl WorkerConfig {
    pub fn new(port: u16) -> Self {
        Self {
            host: default_bind_addr(),
            port,
            max_concurrency: default_max_concurrency(),
            max_queued: default_max_queued(),
            execute_timeout: None,
            drain_timeout: default_drain_timeout(),
            max_frame_length: DEFAULT_MAX_FRAME_LENGTH,
            module_root: PathBuf::from("."),
            interpreter: None,
        }
    }

    /// Load from the process environment.
    ///
    /// Reads `PORT` (required), `BRIDGE_HOST`, `BRIDGE_MAX_CONCURRENCY`,
    /// `BRIDGE_MAX_QUEUED`, `BRIDGE_MODULE_ROOT`, `BRIDGE_INTERPRETER`, and
    /// the timeouts `BRIDGE_EXECUTE_TIMEOUT` and `BRIDGE_DRAIN_TIMEOUT` in seconds.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let raw_port = lookup(PORT_ENV)
            .with_context(|| format!("{PORT_ENV} not set - was this worker spawned by a host?"))?;
        let port: u16 = raw_port
            .trim()
            .parse()
            .with_context(|| format!("Invalid {PORT_ENV}: '{raw_port}'"))?;
        anyhow::ensure!(port != 0, "Invalid {PORT_ENV}: port must be nonzero");

        let mut config = Self::new(port);

        if let Some(host) = lookup("BRIDGE_HOST") {
            config.host = host;
        }
        if let Some(n) = parse_var::<usize>(&lookup, "BRIDGE_MAX_CONCURRENCY") {
            config.max_concurrency = n.max(1);
        }
        if let Some(n) = parse_var::<usize>(&lookup, "BRIDGE_MAX_QUEUED") {
            config.max_queued = n.max(1);
        }
        config.execute_timeout =
            parse_var::<u64>(&lookup, "BRIDGE_EXECUTE_TIMEOUT").map(Duration::from_secs);
        if let Some(secs) = parse_var::<u64>(&lookup, "BRIDGE_DRAIN_TIMEOUT") {
            config.drain_timeout = Duration::from_secs(secs);
        }
        if let Some(root) = lookup("BRIDGE_MODULE_ROOT") {
            config.module_root = PathBuf::from(root);
        }
        config.interpreter = lookup("BRIDGE_INTERPRETER").map(PathBuf::from);

        Ok(config)
    }

    /// `host:port` of the listener to connect to.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Parse an optional variable, ignoring (with a warning) values that do not parse.
fn parse_var<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(key, value = %raw, "Ignoring unparseable environment variable");
            None
        }
    }
}

/// Host session manager settings.
#[derive(Debug, Clone, Deserialize)]
pub struct HostConfig {
    /// Address the listener binds to.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// Listener port. `0` picks a free port.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Number of worker processes to spawn.
    #[serde(default = "default_processes")]
    pub processes: usize,

    #[serde(default = "default_request_timeout")]
    pub request_timeout_seconds: u64,

    /// How long to wait for workers to connect and announce readiness.
    #[serde(default = "default_ready_timeout")]
    pub ready_timeout_seconds: u64,

    #[serde(default = "default_max_frame_length")]
    pub max_frame_length: usize,

    /// Command that starts one worker process. Without it the host only
    /// accepts workers started by someone else.
    #[serde(default)]
    pub worker: Option<WorkerCommand>,
}

/// How to start a worker process.
#[derive(Debug, Clone, Deserialize)]
pub struct WorkerCommand {
    pub program: String,

    #[serde(default)]
    pub args: Vec<String>,

    /// Working directory of the worker.
    #[serde(default)]
    pub dir: Option<PathBuf>,

    /// Extra environment variables. `PORT` is always set by the host.
    #[serde(default)]
    pub env: HashMap<String, String>,
}

impl WorkerCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            dir: None,
            env: HashMap::new(),
        }
    }
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            port: default_port(),
            processes: default_processes(),
            request_timeout_seconds: default_request_timeout(),
            ready_timeout_seconds: default_ready_timeout(),
            max_frame_length: default_max_frame_length(),
            worker: None,
        }
    }
}

impl HostConfig {
    /// Load from `RUNTIME_BRIDGE_CONFIG` if set, defaults otherwise.
    pub fn from_env() -> Result<Self> {
        match std::env::var(HOST_CONFIG_ENV) {
            Ok(json) => {
                Self::from_json(&json).with_context(|| format!("Failed to parse {HOST_CONFIG_ENV}"))
            }
            Err(_) => Ok(Self::default()),
        }
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json).context("Failed to parse JSON")?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Self::from_json(&json).with_context(|| format!("Invalid config in {}", path.display()))
    }

    pub const fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_seconds)
    }

    pub const fn ready_timeout(&self) -> Duration {
        Duration::from_secs(self.ready_timeout_seconds)
    }
}

fn default_bind_addr() -> String {
    "127.0.0.1".into()
}

const fn default_port() -> u16 {
    6543
}

const fn default_processes() -> usize {
    5
}

const fn default_request_timeout() -> u64 {
    30
}

const fn default_ready_timeout() -> u64 {
    10
}

const fn default_max_frame_length() -> usize {
    DEFAULT_MAX_FRAME_LENGTH
}

const fn default_max_concurrency() -> usize {
    16
}

const fn default_max_queued() -> usize {
    1024
}

const fn default_drain_timeout() -> Duration {
    Duration::from_secs(30)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn worker_config_requires_port() {
        let err = WorkerConfig::from_lookup(lookup_from(&[])).unwrap_err();
        assert!(err.to_string().contains("PORT not set"));
    }

    #[test]
    fn worker_config_rejects_invalid_port() {
        assert!(WorkerConfig::from_lookup(lookup_from(&[("PORT", "http")])).is_err());
        assert!(WorkerConfig::from_lookup(lookup_from(&[("PORT", "70000")])).is_err());
        assert!(WorkerConfig::from_lookup(lookup_from(&[("PORT", "0")])).is_err());
    }

    #[test]
    fn worker_config_defaults() {
        let config = WorkerConfig::from_lookup(lookup_from(&[("PORT", "6543")])).unwrap();
        assert_eq!(config.port, 6543);
        assert_eq!(config.address(), "127.0.0.1:6543");
        assert_eq!(config.max_concurrency, 16);
        assert_eq!(config.max_queued, 1024);
        assert!(config.execute_timeout.is_none());
        assert_eq!(config.drain_timeout, Duration::from_secs(30));
        assert!(config.interpreter.is_none());
    }

    #[test]
    fn worker_config_overrides() {
        let config = WorkerConfig::from_lookup(lookup_from(&[
            ("PORT", " 7000 "),
            ("BRIDGE_HOST", "0.0.0.0"),
            ("BRIDGE_MAX_CONCURRENCY", "0"),
            ("BRIDGE_MAX_QUEUED", "8"),
            ("BRIDGE_EXECUTE_TIMEOUT", "5"),
            ("BRIDGE_DRAIN_TIMEOUT", "2"),
            ("BRIDGE_MODULE_ROOT", "/srv/dist"),
            ("BRIDGE_INTERPRETER", "node"),
        ]))
        .unwrap();
        assert_eq!(config.address(), "0.0.0.0:7000");
        assert_eq!(config.max_concurrency, 1);
        assert_eq!(config.max_queued, 8);
        assert_eq!(config.execute_timeout, Some(Duration::from_secs(5)));
        assert_eq!(config.drain_timeout, Duration::from_secs(2));
        assert_eq!(config.module_root, PathBuf::from("/srv/dist"));
        assert_eq!(config.interpreter, Some(PathBuf::from("node")));
    }

    #[test]
    fn worker_config_ignores_bad_optional_values() {
        let config = WorkerConfig::from_lookup(lookup_from(&[
            ("PORT", "7000"),
            ("BRIDGE_MAX_CONCURRENCY", "many"),
        ]))
        .unwrap();
        assert_eq!(config.max_concurrency, 16);
    }

    #[test]
    fn host_config_defaults_from_empty_json() {
        let config = HostConfig::from_json("{}").unwrap();
        assert_eq!(config.bind_addr, "127.0.0.1");
        assert_eq!(config.port, 6543);
        assert_eq!(config.processes, 5);
        assert_eq!(config.request_timeout(), Duration::from_secs(30));
        assert_eq!(config.ready_timeout(), Duration::from_secs(10));
        assert!(config.worker.is_none());
    }

    #[test]
    fn host_config_with_worker_command() {
        let json = r#"{
            "port": 0,
            "processes": 2,
            "worker": {
                "program": "runtime-bridge-worker",
                "args": ["--log-level", "debug"],
                "dir": "/srv/app",
                "env": {"BRIDGE_INTERPRETER": "node"}
            }
        }"#;
        let config = HostConfig::from_json(json).unwrap();
        assert_eq!(config.port, 0);
        assert_eq!(config.processes, 2);
        let worker = config.worker.unwrap();
        assert_eq!(worker.program, "runtime-bridge-worker");
        assert_eq!(worker.args, vec!["--log-level", "debug"]);
        assert_eq!(worker.dir, Some(PathBuf::from("/srv/app")));
        assert_eq!(worker.env.get("BRIDGE_INTERPRETER").map(String::as_str), Some("node"));
    }

    #[test]
    fn host_config_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bridge.json");
        std::fs::write(&path, r#"{"processes": 3}"#).unwrap();
        let config = HostConfig::from_file(&path).unwrap();
        assert_eq!(config.processes, 3);
    }

    #[test]
    fn host_config_rejects_invalid_json() {
        assert!(HostConfig::from_json("{not json").is_err());
    }
}
