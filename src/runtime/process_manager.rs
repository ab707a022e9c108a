// src/runtime/process_manager.rs
//! OS-level process helpers
//!
//! Locating executables, finding a running worker by its command line, and
//! signalling processes by pid.

use crate::utils::errors::{EngineError, Result};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{debug, info};

/// Query matching a running process by executable name and argument
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessQuery {
    /// Substring of the executable name, e.g. `soffice`
    pub command: String,

    /// Argument the process must have been launched with
    pub argument: String,
}

impl ProcessQuery {
    pub fn new(command: impl Into<String>, argument: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            argument: argument.into(),
        }
    }

    fn matches(&self, command_line: &str) -> bool {
        let mut words = command_line.split_whitespace();
        let program_matches = words
            .next()
            .map(|program| program.contains(&self.command))
            .unwrap_or(false);

        program_matches && command_line.contains(&self.argument)
    }
}

/// Process manager for locating and signalling worker processes
#[derive(Debug, Default)]
pub struct ProcessManager {
    /// Paths to executables (cached)
    executable_paths: Mutex<HashMap<PathBuf, PathBuf>>,
}

impl ProcessManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve an executable, searching PATH for bare names
    pub fn find_executable(&self, program: &Path) -> Result<PathBuf> {
        if program.is_absolute() {
            return Ok(program.to_path_buf());
        }

        if let Some(path) = self.executable_paths.lock().get(program) {
            return Ok(path.clone());
        }

        match which::which(program) {
            Ok(path) => {
                info!("Found {:?} at {:?}", program, path);
                self.executable_paths
                    .lock()
                    .insert(program.to_path_buf(), path.clone());
                Ok(path)
            }
            Err(e) => Err(EngineError::ProcessSpawnFailed(format!(
                "Executable {:?} not found in PATH: {}",
                program, e
            ))),
        }
    }

    /// Find the pid of a running process matching `query`
    pub fn find_pid(&self, query: &ProcessQuery) -> Result<Option<u32>> {
        let output = Command::new("ps").args(["-e", "-o", "pid=,args="]).output()?;

        if !output.status.success() {
            return Err(EngineError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                format!("ps exited with {}", output.status),
            )));
        }

        let listing = String::from_utf8_lossy(&output.stdout);
        Ok(parse_ps_output(&listing, query))
    }

    /// Kill a process by PID (SIGKILL)
    pub fn kill(&self, pid: u32) -> Result<()> {
        debug!("Sending SIGKILL to PID {}", pid);
        signal(pid, Signal::SIGKILL)
    }

    /// Ask a process to terminate (SIGTERM)
    pub fn terminate(&self, pid: u32) -> Result<()> {
        debug!("Sending SIGTERM to PID {}", pid);
        signal(pid, Signal::SIGTERM)
    }

    /// Check if a process is running
    pub fn is_running(&self, pid: u32) -> bool {
        kill(Pid::from_raw(pid as i32), None).is_ok()
    }
}

fn signal(pid: u32, signal: Signal) -> Result<()> {
    kill(Pid::from_raw(pid as i32), signal).map_err(|e| {
        EngineError::Io(std::io::Error::from_raw_os_error(e as i32))
    })
}

fn parse_ps_output(listing: &str, query: &ProcessQuery) -> Option<u32> {
    let own_pid = std::process::id();

    listing.lines().find_map(|line| {
        let line = line.trim_start();
        let (pid, command_line) = line.split_once(char::is_whitespace)?;
        let pid: u32 = pid.parse().ok()?;

        (pid != own_pid && query.matches(command_line.trim_start())).then_some(pid)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const ACCEPT: &str = "socket,host=127.0.0.1,port=2002,tcpNoDelay=1;urp;";

    #[test]
    fn test_parse_ps_output() {
        let listing = format!(
            "    1 /sbin/init\n  812 /usr/lib/libreoffice/program/soffice.bin --accept={ACCEPT} --headless\n  900 vim notes.txt\n"
        );
        let query = ProcessQuery::new("soffice", ACCEPT);
        assert_eq!(parse_ps_output(&listing, &query), Some(812));
    }

    #[test]
    fn test_parse_ps_output_requires_argument() {
        let listing = "  812 /usr/bin/soffice --accept=socket,host=127.0.0.1,port=2003;urp;\n";
        let query = ProcessQuery::new("soffice", ACCEPT);
        assert_eq!(parse_ps_output(listing, &query), None);
    }

    #[test]
    fn test_parse_ps_output_requires_program() {
        let listing = format!("  812 grep {ACCEPT}\n");
        let query = ProcessQuery::new("soffice", ACCEPT);
        assert_eq!(parse_ps_output(&listing, &query), None);
    }

    #[test]
    fn test_find_executable() {
        let manager = ProcessManager::new();
        assert!(manager.find_executable(Path::new("sh")).is_ok());
        assert!(manager
            .find_executable(Path::new("definitely-not-a-real-binary-name"))
            .is_err());
    }

    #[test]
    fn test_signal_lifecycle() {
        let manager = ProcessManager::new();
        let mut child = Command::new("sleep").arg("30").spawn().unwrap();
        let pid = child.id();

        assert!(manager.is_running(pid));
        manager.kill(pid).unwrap();
        child.wait().unwrap();
        assert!(!manager.is_running(pid));
    }
}
