// src/utils/config.rs
//! Pool settings
//!
//! One flat settings struct, loaded from an optional file layered under
//! `DOCPOOL_*` environment variables, and validated before any pool is built.
//!
//! ```text
//! DOCPOOL_PORTS=2002,2003
//! DOCPOOL_TASK_EXECUTION_TIMEOUT_MS=60000
//! DOCPOOL_KILL_EXISTING_PROCESS=false
//! DOCPOOL_AFTER_START_PROCESS_DELAY_MS=2000
//! ```

use crate::runtime::worker_process::office_args;
use crate::utils::errors::{EngineError, Result};
use serde::Deserialize;
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable prefix for settings overrides
pub const ENV_PREFIX: &str = "DOCPOOL";

/// Settings of a worker pool
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct PoolSettings {
    /// Host the workers listen on (default: 127.0.0.1)
    pub host: String,

    /// One port per worker; the pool size is the number of ports
    /// (default: [2002])
    pub ports: Vec<u16>,

    /// Maximum time a task may run (default: 120000)
    pub task_execution_timeout_ms: u64,

    /// Maximum time a task waits for a free worker (default: 30000)
    pub task_queue_timeout_ms: u64,

    /// Tasks a worker executes before being recycled, 0 disables
    /// recycling (default: 200)
    pub max_tasks_per_worker: u32,

    /// Fixed delay between process start/stop attempts (default: 250)
    pub process_retry_interval_ms: u64,

    /// Overall bound of a process start or stop (default: 120000)
    pub process_timeout_ms: u64,

    /// Kill a process already bound to a worker endpoint (default: true)
    pub kill_existing_process: bool,

    /// Wait after launching a worker before connecting to it (default: 0)
    pub after_start_process_delay_ms: u64,

    /// Fail `Pool::start` when a worker cannot be started. When false, the
    /// worker is left stopped and started by its first task (default: true)
    pub start_fail_fast: bool,

    /// Only disconnect from workers on shutdown, leaving them running
    /// (default: false)
    pub keep_alive_on_shutdown: bool,

    /// Worker executable, looked up in PATH when not absolute
    pub program: PathBuf,

    /// Worker arguments; `{accept}` and `{profile}` are substituted
    pub program_args: Vec<String>,

    /// Command prefix used to launch the worker, e.g. `sudo -u office`
    pub run_as_args: Vec<String>,

    /// Extra environment variables of worker processes
    pub env: BTreeMap<String, String>,

    /// Directory receiving per-worker profile directories
    pub working_dir: PathBuf,

    /// Profile copied into every fresh profile directory
    pub template_profile_dir: Option<PathBuf>,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            ports: vec![2002],
            task_execution_timeout_ms: 120_000,
            task_queue_timeout_ms: 30_000,
            max_tasks_per_worker: 200,
            process_retry_interval_ms: 250,
            process_timeout_ms: 120_000,
            kill_existing_process: true,
            after_start_process_delay_ms: 0,
            start_fail_fast: true,
            keep_alive_on_shutdown: false,
            program: PathBuf::from("soffice"),
            program_args: office_args(),
            run_as_args: vec![],
            env: BTreeMap::new(),
            working_dir: std::env::temp_dir(),
            template_profile_dir: None,
        }
    }
}

impl PoolSettings {
    /// Load settings from an optional file and the environment, then validate.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }

        let settings: PoolSettings = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("ports")
                    .with_list_parse_key("run_as_args"),
            )
            .build()?
            .try_deserialize()?;

        settings.validate()?;
        Ok(settings)
    }

    /// Settings with one worker per given port
    pub fn with_ports(ports: impl IntoIterator<Item = u16>) -> Self {
        Self {
            ports: ports.into_iter().collect(),
            ..Default::default()
        }
    }

    /// Check the settings are usable
    pub fn validate(&self) -> Result<()> {
        if self.ports.is_empty() {
            return Err(EngineError::InvalidSettings(
                "at least one worker port is required".into(),
            ));
        }

        let mut seen = HashSet::with_capacity(self.ports.len());
        if let Some(port) = self.ports.iter().find(|port| !seen.insert(**port)) {
            return Err(EngineError::InvalidSettings(format!(
                "port {} is configured more than once",
                port
            )));
        }

        if self.host.trim().is_empty() {
            return Err(EngineError::InvalidSettings("host must not be empty".into()));
        }

        if self.process_retry_interval_ms == 0 {
            return Err(EngineError::InvalidSettings(
                "process_retry_interval_ms must be greater than 0".into(),
            ));
        }

        if self.process_retry_interval_ms > self.process_timeout_ms {
            return Err(EngineError::InvalidSettings(format!(
                "process_retry_interval_ms {} must not exceed process_timeout_ms {}",
                self.process_retry_interval_ms, self.process_timeout_ms
            )));
        }

        Ok(())
    }

    pub fn pool_size(&self) -> usize {
        self.ports.len()
    }

    pub fn task_execution_timeout(&self) -> Duration {
        Duration::from_millis(self.task_execution_timeout_ms)
    }

    pub fn task_queue_timeout(&self) -> Duration {
        Duration::from_millis(self.task_queue_timeout_ms)
    }

    pub fn process_retry_interval(&self) -> Duration {
        Duration::from_millis(self.process_retry_interval_ms)
    }

    pub fn process_timeout(&self) -> Duration {
        Duration::from_millis(self.process_timeout_ms)
    }

    pub fn after_start_process_delay(&self) -> Duration {
        Duration::from_millis(self.after_start_process_delay_ms)
    }
}
