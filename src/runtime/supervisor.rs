// src/runtime/supervisor.rs
//! Supervisor of a single worker
//!
//! Owns one process and its connection, and brings them together to a
//! connected, task-ready state:
//!
//! ```text
//! start:   conflict check -> profile dir -> launch -> delay -> connect (retried)
//! stop:    terminate request -> wait for exit (retried) -> kill -> wait
//! restart: stop + start
//! ```
//!
//! With `keep_alive_on_shutdown`, `stop` only disconnects and leaves the
//! process running. Restarts always stop the process.
//!
//! Outside of `start`/`stop`, the connection is valid exactly while the
//! process runs.

use crate::runtime::connection::{ConnectError, Connection, WorkerEndpoint};
use crate::runtime::retry::{Attempt, Interrupt, RetryRunner};
use crate::runtime::sandbox::Sandbox;
use crate::runtime::worker_process::WorkerProcess;
use crate::utils::config::PoolSettings;
use crate::utils::errors::{EngineError, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Exit code of an office process asking to be launched again
const EXIT_CODE_RESTART: i32 = 81;

/// Retry and conflict policy of a supervisor
#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    /// Fixed delay between start/stop attempts
    pub retry_interval: Duration,

    /// Overall bound of a start or stop
    pub process_timeout: Duration,

    /// Kill a foreign process already bound to the endpoint
    pub kill_existing_process: bool,

    /// Wait after launching a process before the first connection attempt
    pub after_start_process_delay: Duration,

    /// Leave the process running when the supervisor is stopped
    pub keep_alive_on_shutdown: bool,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self::from(&PoolSettings::default())
    }
}

impl From<&PoolSettings> for SupervisorSettings {
    fn from(settings: &PoolSettings) -> Self {
        Self {
            retry_interval: settings.process_retry_interval(),
            process_timeout: settings.process_timeout(),
            kill_existing_process: settings.kill_existing_process,
            after_start_process_delay: settings.after_start_process_delay(),
            keep_alive_on_shutdown: settings.keep_alive_on_shutdown,
        }
    }
}

/// Owner of one worker process and its connection
pub struct WorkerSupervisor {
    endpoint: WorkerEndpoint,
    process: Box<dyn WorkerProcess>,
    connection: Arc<dyn Connection>,
    sandbox: Sandbox,
    settings: SupervisorSettings,
    interrupt: Interrupt,
}

impl WorkerSupervisor {
    pub fn new(
        endpoint: WorkerEndpoint,
        process: Box<dyn WorkerProcess>,
        connection: Arc<dyn Connection>,
        sandbox: Sandbox,
        settings: SupervisorSettings,
    ) -> Self {
        Self {
            endpoint,
            process,
            connection,
            sandbox,
            settings,
            interrupt: Interrupt::new(),
        }
    }

    pub fn endpoint(&self) -> &WorkerEndpoint {
        &self.endpoint
    }

    pub fn connection(&self) -> Arc<dyn Connection> {
        Arc::clone(&self.connection)
    }

    /// Signal aborting pending start retries, usable without holding the
    /// supervisor
    pub fn interrupt(&self) -> Interrupt {
        self.interrupt.clone()
    }

    pub fn is_running(&mut self) -> bool {
        self.process.is_running()
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }

    /// Exit code of the process if it is no longer running
    pub fn exit_code(&mut self) -> Option<i32> {
        match self.process.exit_code() {
            Ok(code) => code,
            Err(e) => {
                warn!("Cannot query worker process at {}: {}", self.endpoint, e);
                None
            }
        }
    }

    /// Start the process and connect to it
    pub fn start(&mut self) -> Result<()> {
        if self.interrupt.is_triggered() {
            return Err(EngineError::Lifecycle(format!(
                "worker at {} is shutting down",
                self.endpoint
            )));
        }
        info!("Starting worker at {}", self.endpoint);

        self.check_for_existing_process()?;
        self.sandbox.prepare()?;
        self.process.start(&self.sandbox)?;

        if let Err(e) = self.connect() {
            error!("Could not establish connection to worker at {}: {}", self.endpoint, e);
            self.connection.disconnect();
            if let Err(kill_err) = self.process.kill() {
                warn!("Cannot kill unreachable worker: {}", kill_err);
            }
            return Err(e);
        }

        info!("Worker at {} is ready", self.endpoint);
        Ok(())
    }

    /// Stop the process, gracefully first, or only disconnect from it when
    /// configured to keep it alive
    pub fn stop(&mut self) -> Result<()> {
        if self.settings.keep_alive_on_shutdown {
            info!("Disconnecting from worker at {}; keeping it alive", self.endpoint);
            self.connection.disconnect();
            self.process.detach();
            return Ok(());
        }
        self.stop_process()
    }

    pub fn restart(&mut self) -> Result<()> {
        info!("Restarting worker at {}...", self.endpoint);
        self.stop_process()?;
        self.start()
    }

    /// Kill the process without asking, then start a new one
    pub fn force_restart(&mut self) -> Result<()> {
        warn!("Forcibly restarting worker at {}", self.endpoint);
        self.connection.disconnect();
        self.kill_and_wait()?;
        self.start()
    }

    fn stop_process(&mut self) -> Result<()> {
        info!("Stopping worker at {}", self.endpoint);

        let requested = self.connection.is_connected()
            && match self.connection.terminate() {
                Ok(sent) => sent,
                Err(e) => {
                    debug!("Terminate request failed: {}", e);
                    false
                }
            };
        self.connection.disconnect();

        if requested {
            debug!("A request has been sent to terminate the worker");
        } else if let Err(e) = self.process.terminate() {
            debug!("Cannot signal worker process: {}", e);
        }

        let result = self.ensure_exited();
        self.sandbox.cleanup();
        result
    }

    fn check_for_existing_process(&mut self) -> Result<()> {
        let Some(pid) = self.process.find_conflict()? else {
            debug!("No process running with --accept '{}'", self.endpoint.accept_string());
            return Ok(());
        };

        let accept = self.endpoint.accept_string();
        if !self.settings.kill_existing_process {
            return Err(EngineError::ProcessConflict { pid, accept });
        }

        warn!(
            "A process with --accept '{}' is already running; pid {}; trying to kill it...",
            accept, pid
        );
        self.process.kill_conflict(pid)?;

        let process = &self.process;
        self.runner()
            .with_interrupt(self.interrupt.clone())
            .execute(|| match process.find_conflict() {
                Ok(None) => Ok(()),
                Ok(Some(pid)) => Err(Attempt::retry(format!("pid {} still running", pid))),
                Err(e) => Err(Attempt::Abort(e)),
            })
            .map_err(|e| match e {
                EngineError::RetryTimeout { .. } => EngineError::ProcessConflict { pid, accept },
                other => other,
            })
    }

    fn connect(&mut self) -> Result<()> {
        let runner = self
            .runner()
            .with_delay(self.settings.after_start_process_delay)
            .with_interrupt(self.interrupt.clone());
        let connection = Arc::clone(&self.connection);
        let process = &mut self.process;
        let sandbox = &self.sandbox;

        runner.execute(|| match connection.connect() {
            Ok(()) => Ok(()),
            Err(ConnectError::NotListening(endpoint)) => match process.exit_code() {
                Ok(None) => Err(Attempt::Retry(anyhow::anyhow!(
                    "worker at {} is not listening yet",
                    endpoint
                ))),
                Ok(Some(EXIT_CODE_RESTART)) => {
                    info!("Worker process died with exit code 81; restarting it");
                    process.start(sandbox)?;
                    Err(Attempt::retry("worker relaunched after exit code 81"))
                }
                Ok(Some(code)) => Err(Attempt::Abort(EngineError::ProcessExited(Some(code)))),
                Err(e) => Err(Attempt::Abort(e)),
            },
            Err(ConnectError::Failed(e)) => Err(Attempt::Abort(EngineError::Io(e))),
        })
    }

    fn ensure_exited(&mut self) -> Result<()> {
        let (interval, timeout) = (self.settings.retry_interval, self.settings.process_timeout);

        match self.process.wait_for_exit(interval, timeout) {
            Ok(code) => {
                info!("Process exited with code {}", code);
                Ok(())
            }
            Err(e) => {
                warn!("Time out ensuring process exited: {}", e);
                self.kill_and_wait()
            }
        }
    }

    fn kill_and_wait(&mut self) -> Result<()> {
        let (interval, timeout) = (self.settings.retry_interval, self.settings.process_timeout);

        self.process.kill().map_err(|e| {
            EngineError::ProcessStopFailed(format!("cannot kill worker at {}: {}", self.endpoint, e))
        })?;

        match self.process.wait_for_exit(interval, timeout) {
            Ok(code) => {
                info!("Process exited with code {}", code);
                Ok(())
            }
            Err(e) => Err(EngineError::ProcessStopFailed(format!(
                "worker at {} still running after kill: {}",
                self.endpoint, e
            ))),
        }
    }

    fn runner(&self) -> RetryRunner {
        RetryRunner::new(self.settings.retry_interval, self.settings.process_timeout)
    }
}
