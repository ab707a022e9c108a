// src/lib.rs
//! docpool engine library
//!
//! Keeps a bounded pool of long-lived office worker processes and runs
//! caller-supplied tasks against them, with crash detection, automatic
//! restart, and timeout enforcement.
//!
//! # Architecture
//!
//! - **runtime**: pool, workers, process supervision, retries
//! - **observability**: tracing setup
//! - **utils**: settings and error types
//!
//! # Example
//!
//! ```no_run
//! use docpool_engine::{Connection, Pool, PoolSettings};
//!
//! let pool = Pool::from_settings(PoolSettings::with_ports([2002, 2003]))?;
//! pool.start()?;
//! pool.execute(|connection: &dyn Connection| -> anyhow::Result<()> {
//!     anyhow::ensure!(connection.is_connected(), "worker is gone");
//!     Ok(())
//! })?;
//! pool.stop()?;
//! # Ok::<(), docpool_engine::EngineError>(())
//! ```

pub mod observability;
pub mod runtime;
pub mod utils;

// Re-export commonly used types
pub use runtime::connection::{Connection, WorkerEndpoint};
pub use runtime::pool::{Pool, PoolStats};
pub use runtime::task::Task;
pub use utils::config::PoolSettings;
pub use utils::errors::{EngineError, Result};

use std::fmt;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const GIT_HASH: &str = env!("GIT_HASH");

/// Build metadata logged by the binary at startup
#[derive(Debug, Clone, Copy)]
pub struct BuildInfo {
    pub version: &'static str,
    pub git_hash: &'static str,
    /// Seconds since the Unix epoch
    pub build_timestamp: &'static str,
    pub rustc_version: &'static str,
}

impl BuildInfo {
    pub fn current() -> Self {
        Self {
            version: VERSION,
            git_hash: GIT_HASH,
            build_timestamp: env!("BUILD_TIMESTAMP"),
            rustc_version: env!("RUSTC_VERSION"),
        }
    }
}

impl fmt::Display for BuildInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "docpool-engine v{} ({}, built at {}, {})",
            self.version, self.git_hash, self.build_timestamp, self.rustc_version
        )
    }
}
