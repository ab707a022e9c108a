// src/runtime/worker_process.rs
//! Worker process handles
//!
//! [`WorkerProcess`] is the capability the supervisor needs from a worker
//! process. [`CommandProcess`] implements it by launching an executable
//! with [`std::process::Command`]; its output is forwarded to the log.

use crate::runtime::connection::{Connection, SocketConnection, WorkerEndpoint};
use crate::runtime::process_manager::{ProcessManager, ProcessQuery};
use crate::runtime::retry::{Attempt, RetryRunner};
use crate::runtime::sandbox::Sandbox;
use crate::utils::config::PoolSettings;
use crate::utils::errors::{EngineError, Result};
use std::io::{BufRead, BufReader, Read};
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Placeholder replaced by the endpoint accept string in worker arguments
pub const ACCEPT_PLACEHOLDER: &str = "{accept}";

/// Placeholder replaced by the profile directory URL in worker arguments
pub const PROFILE_PLACEHOLDER: &str = "{profile}";

/// Handle on one worker process
pub trait WorkerProcess: Send {
    /// Pid of a foreign process already bound to this worker's endpoint
    fn find_conflict(&self) -> Result<Option<u32>> {
        Ok(None)
    }

    /// Kill a foreign process found by [`WorkerProcess::find_conflict`]
    fn kill_conflict(&self, pid: u32) -> Result<()>;

    /// Launch the process using the given profile directory
    fn start(&mut self, sandbox: &Sandbox) -> Result<()>;

    fn pid(&self) -> Option<u32>;

    /// Exit code if the process has exited, `None` while it runs.
    /// A process that was never started reports `Some(0)`.
    fn exit_code(&mut self) -> Result<Option<i32>>;

    fn is_running(&mut self) -> bool {
        matches!(self.exit_code(), Ok(None))
    }

    /// Politely ask the process to exit
    fn terminate(&mut self) -> Result<()> {
        self.kill()
    }

    /// Forcibly terminate the process
    fn kill(&mut self) -> Result<()>;

    /// Give up ownership of a running process, leaving it alive
    fn detach(&mut self) {}

    /// Poll until the process has exited
    fn wait_for_exit(&mut self, interval: Duration, timeout: Duration) -> Result<i32> {
        RetryRunner::new(interval, timeout).execute(|| match self.exit_code() {
            Ok(Some(code)) => Ok(code),
            Ok(None) => Err(Attempt::retry("process still running")),
            Err(e) => Err(Attempt::Abort(e)),
        })
    }
}

/// Builds the process and connection of every pool slot
pub trait WorkerFactory: Send + Sync {
    fn create(
        &self,
        endpoint: &WorkerEndpoint,
    ) -> Result<(Box<dyn WorkerProcess>, Arc<dyn Connection>)>;
}

/// Configuration for spawning a worker process
#[derive(Debug, Clone)]
pub struct SpawnConfig {
    /// Executable, looked up in PATH when not absolute
    pub program: PathBuf,

    /// Arguments, with `{accept}` and `{profile}` placeholders
    pub args: Vec<String>,

    /// Command prefix, e.g. `sudo -u office`
    pub run_as_args: Vec<String>,

    /// Extra environment variables of the worker process
    pub env_vars: Vec<(String, String)>,
}

impl Default for SpawnConfig {
    fn default() -> Self {
        Self {
            program: PathBuf::from("soffice"),
            args: office_args(),
            run_as_args: vec![],
            env_vars: vec![],
        }
    }
}

impl SpawnConfig {
    pub fn from_settings(settings: &PoolSettings) -> Self {
        Self {
            program: settings.program.clone(),
            args: settings.program_args.clone(),
            run_as_args: settings.run_as_args.clone(),
            env_vars: settings
                .env
                .iter()
                .map(|(key, value)| (key.clone(), value.clone()))
                .collect(),
        }
    }

    fn render_args(&self, endpoint: &WorkerEndpoint, sandbox: &Sandbox) -> Vec<String> {
        let accept = endpoint.accept_string();
        let profile = sandbox.profile_url();

        self.args
            .iter()
            .map(|arg| {
                arg.replace(ACCEPT_PLACEHOLDER, &accept)
                    .replace(PROFILE_PLACEHOLDER, &profile)
            })
            .collect()
    }
}

/// Default command line of a headless office worker
pub fn office_args() -> Vec<String> {
    [
        "--accept={accept}",
        "--headless",
        "--invisible",
        "--nocrashreport",
        "--nodefault",
        "--nofirststartwizard",
        "--nolockcheck",
        "--nologo",
        "--norestore",
        "-env:UserInstallation={profile}",
    ]
    .iter()
    .map(|arg| arg.to_string())
    .collect()
}

/// Worker process launched from a command line
pub struct CommandProcess {
    endpoint: WorkerEndpoint,
    config: SpawnConfig,
    manager: Arc<ProcessManager>,
    child: Option<Child>,
    exit_code: Option<i32>,
}

impl CommandProcess {
    pub fn new(endpoint: WorkerEndpoint, config: SpawnConfig, manager: Arc<ProcessManager>) -> Self {
        Self {
            endpoint,
            config,
            manager,
            child: None,
            exit_code: None,
        }
    }

    fn query(&self) -> ProcessQuery {
        let command = self
            .config
            .program
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_default();

        ProcessQuery::new(command, self.endpoint.accept_string())
    }

    fn build_command(&self, sandbox: &Sandbox) -> Result<Command> {
        let executable = self.manager.find_executable(&self.config.program)?;
        let args = self.config.render_args(&self.endpoint, sandbox);

        let mut command = match self.config.run_as_args.split_first() {
            Some((runner, runner_args)) => {
                let mut command = Command::new(runner);
                command.args(runner_args).arg(executable);
                command
            }
            None => Command::new(executable),
        };

        command.args(args);
        for (key, value) in &self.config.env_vars {
            command.env(key, value);
        }

        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        debug!("Worker command: {:?}", command);
        Ok(command)
    }
}

impl WorkerProcess for CommandProcess {
    fn find_conflict(&self) -> Result<Option<u32>> {
        self.manager.find_pid(&self.query())
    }

    fn kill_conflict(&self, pid: u32) -> Result<()> {
        if !self.manager.is_running(pid) {
            debug!("Process {} already exited", pid);
            return Ok(());
        }
        self.manager.kill(pid)
    }

    fn start(&mut self, sandbox: &Sandbox) -> Result<()> {
        let mut command = self.build_command(sandbox)?;

        info!(
            "Starting process with --accept '{}' and profileDir '{}'",
            self.endpoint.accept_string(),
            sandbox.profile_dir().display()
        );

        let mut child = command
            .spawn()
            .map_err(|e| EngineError::ProcessSpawnFailed(format!("{:?}: {}", self.config.program, e)))?;

        let pid = child.id();
        if let Some(stdout) = child.stdout.take() {
            pump_output(pid, stdout, false);
        }
        if let Some(stderr) = child.stderr.take() {
            pump_output(pid, stderr, true);
        }

        info!("Started process; pid: {}", pid);
        self.child = Some(child);
        self.exit_code = None;
        Ok(())
    }

    fn pid(&self) -> Option<u32> {
        self.child.as_ref().map(Child::id)
    }

    fn exit_code(&mut self) -> Result<Option<i32>> {
        if let Some(code) = self.exit_code {
            return Ok(Some(code));
        }

        let Some(child) = self.child.as_mut() else {
            return Ok(Some(0));
        };

        let code = child.try_wait()?.map(exit_code_of);
        self.exit_code = code;
        Ok(code)
    }

    fn terminate(&mut self) -> Result<()> {
        match self.pid() {
            Some(pid) if self.is_running() => self.manager.terminate(pid),
            _ => Ok(()),
        }
    }

    fn kill(&mut self) -> Result<()> {
        if !self.is_running() {
            return Ok(());
        }

        if let Some(child) = self.child.as_mut() {
            info!("Trying to forcibly terminate process; pid: {}", child.id());
            if let Err(e) = child.kill() {
                // Exited between the check and the signal
                if e.kind() != std::io::ErrorKind::InvalidInput {
                    return Err(e.into());
                }
            }
        }

        Ok(())
    }

    fn detach(&mut self) {
        if let Some(child) = self.child.take() {
            info!("Leaving process running; pid: {}", child.id());
        }
        self.exit_code = None;
    }
}

impl Drop for CommandProcess {
    fn drop(&mut self) {
        if self.is_running() {
            warn!("Worker process for {} dropped while running; killing it", self.endpoint);
            let _ = self.kill();
            if let Some(child) = self.child.as_mut() {
                let _ = child.wait();
            }
        }
    }
}

fn exit_code_of(status: ExitStatus) -> i32 {
    status
        .code()
        .or_else(|| status.signal().map(|signal| 128 + signal))
        .unwrap_or(-1)
}

fn pump_output<R: Read + Send + 'static>(pid: u32, stream: R, is_stderr: bool) {
    let spawned = std::thread::Builder::new()
        .name(format!("docpool-output-{}", pid))
        .spawn(move || {
            for line in BufReader::new(stream).lines().map_while(std::result::Result::ok) {
                if is_stderr {
                    warn!(target: "docpool::worker", pid, "{}", line);
                } else {
                    debug!(target: "docpool::worker", pid, "{}", line);
                }
            }
        });

    if let Err(e) = spawned {
        warn!("Cannot forward output of process {}: {}", pid, e);
    }
}

/// Factory launching [`CommandProcess`] workers reached over TCP
pub struct CommandWorkerFactory {
    config: SpawnConfig,
    manager: Arc<ProcessManager>,
}

impl CommandWorkerFactory {
    pub fn new(config: SpawnConfig) -> Self {
        Self {
            config,
            manager: Arc::new(ProcessManager::new()),
        }
    }

    pub fn from_settings(settings: &PoolSettings) -> Self {
        Self::new(SpawnConfig::from_settings(settings))
    }
}

impl WorkerFactory for CommandWorkerFactory {
    fn create(
        &self,
        endpoint: &WorkerEndpoint,
    ) -> Result<(Box<dyn WorkerProcess>, Arc<dyn Connection>)> {
        let process = CommandProcess::new(
            endpoint.clone(),
            self.config.clone(),
            Arc::clone(&self.manager),
        );
        let connection = SocketConnection::new(endpoint.clone());

        Ok((Box::new(process), Arc::new(connection)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::sandbox::SandboxConfig;
    use tempfile::tempdir;

    fn sandbox(dir: &std::path::Path) -> Sandbox {
        Sandbox::new(SandboxConfig {
            working_dir: dir.to_path_buf(),
            profile_name: "profile".to_string(),
            template_dir: None,
        })
    }

    fn sleeper(seconds: &str) -> CommandProcess {
        let config = SpawnConfig {
            program: PathBuf::from("sleep"),
            args: vec![seconds.to_string()],
            ..Default::default()
        };
        CommandProcess::new(
            WorkerEndpoint::new("127.0.0.1", 2002),
            config,
            Arc::new(ProcessManager::new()),
        )
    }

    #[test]
    fn test_office_args_placeholders() {
        let dir = tempdir().unwrap();
        let sandbox = sandbox(dir.path());
        let args = SpawnConfig::default()
            .render_args(&WorkerEndpoint::new("127.0.0.1", 2002), &sandbox);

        assert_eq!(
            args[0],
            "--accept=socket,host=127.0.0.1,port=2002,tcpNoDelay=1;urp;StarOffice.ServiceManager"
        );
        assert!(args.contains(&"--headless".to_string()));
        assert_eq!(
            args.last().unwrap(),
            &format!("-env:UserInstallation={}", sandbox.profile_url())
        );
    }

    #[test]
    fn test_never_started_process() {
        let mut process = sleeper("30");
        assert_eq!(process.pid(), None);
        assert_eq!(process.exit_code().unwrap(), Some(0));
        assert!(!process.is_running());
        assert!(process.kill().is_ok());
    }

    #[test]
    fn test_start_and_kill() {
        let dir = tempdir().unwrap();
        let mut process = sleeper("30");

        process.start(&sandbox(dir.path())).unwrap();
        assert!(process.pid().is_some());
        assert!(process.is_running());

        process.kill().unwrap();
        let code = process
            .wait_for_exit(Duration::from_millis(10), Duration::from_secs(5))
            .unwrap();
        assert_eq!(code, 128 + 9);
        assert!(!process.is_running());
    }

    #[test]
    fn test_terminate_is_graceful_signal() {
        let dir = tempdir().unwrap();
        let mut process = sleeper("30");

        process.start(&sandbox(dir.path())).unwrap();
        process.terminate().unwrap();
        let code = process
            .wait_for_exit(Duration::from_millis(10), Duration::from_secs(5))
            .unwrap();
        assert_eq!(code, 128 + 15);
    }

    #[test]
    fn test_natural_exit_code() {
        let dir = tempdir().unwrap();
        let config = SpawnConfig {
            program: PathBuf::from("sh"),
            args: vec!["-c".to_string(), "exit 3".to_string()],
            ..Default::default()
        };
        let mut process = CommandProcess::new(
            WorkerEndpoint::new("127.0.0.1", 2002),
            config,
            Arc::new(ProcessManager::new()),
        );

        process.start(&sandbox(dir.path())).unwrap();
        let code = process
            .wait_for_exit(Duration::from_millis(10), Duration::from_secs(5))
            .unwrap();
        assert_eq!(code, 3);
    }

    #[test]
    fn test_env_vars_reach_the_process() {
        let dir = tempdir().unwrap();
        let mut settings = PoolSettings {
            program: PathBuf::from("sh"),
            program_args: vec!["-c".to_string(), "exit $DOCPOOL_TEST_EXIT".to_string()],
            ..Default::default()
        };
        settings.env.insert("DOCPOOL_TEST_EXIT".to_string(), "7".to_string());

        let config = SpawnConfig::from_settings(&settings);
        assert_eq!(
            config.env_vars,
            vec![("DOCPOOL_TEST_EXIT".to_string(), "7".to_string())]
        );

        let mut process = CommandProcess::new(
            WorkerEndpoint::new("127.0.0.1", 2002),
            config,
            Arc::new(ProcessManager::new()),
        );
        process.start(&sandbox(dir.path())).unwrap();
        let code = process
            .wait_for_exit(Duration::from_millis(10), Duration::from_secs(5))
            .unwrap();
        assert_eq!(code, 7);
    }

    #[test]
    fn test_detached_process_survives_drop() {
        let dir = tempdir().unwrap();
        let manager = ProcessManager::new();
        let mut process = sleeper("30");
        process.start(&sandbox(dir.path())).unwrap();
        let pid = process.pid().unwrap();

        process.detach();
        assert_eq!(process.pid(), None);
        drop(process);

        // Still alive after the handle is gone; clean up by pid
        std::thread::sleep(Duration::from_millis(50));
        assert!(manager.is_running(pid));
        manager.kill(pid).unwrap();
    }

    #[test]
    fn test_wait_for_exit_times_out() {
        let dir = tempdir().unwrap();
        let mut process = sleeper("30");
        process.start(&sandbox(dir.path())).unwrap();

        let err = process
            .wait_for_exit(Duration::from_millis(10), Duration::from_millis(50))
            .unwrap_err();
        assert!(matches!(err, EngineError::RetryTimeout { .. }));

        process.kill().unwrap();
    }

    #[test]
    fn test_kill_conflict_that_already_exited() {
        let mut child = std::process::Command::new("sleep").arg("30").spawn().unwrap();
        let pid = child.id();
        child.kill().unwrap();
        child.wait().unwrap();

        assert!(sleeper("30").kill_conflict(pid).is_ok());
    }

    #[test]
    fn test_missing_program() {
        let dir = tempdir().unwrap();
        let config = SpawnConfig {
            program: PathBuf::from("definitely-not-a-real-binary-name"),
            ..Default::default()
        };
        let mut process = CommandProcess::new(
            WorkerEndpoint::new("127.0.0.1", 2002),
            config,
            Arc::new(ProcessManager::new()),
        );

        assert!(matches!(
            process.start(&sandbox(dir.path())),
            Err(EngineError::ProcessSpawnFailed(_))
        ));
    }
}
