// src/runtime/mod.rs
//! Worker pool runtime
//!
//! This module provides the task-execution core, including:
//!
//! - **Pool**: bounded set of long-lived workers handed out per task
//! - **Pool Entry**: one worker with its dedicated execution thread
//! - **Supervisor**: start, stop and restart of one worker process
//! - **Retry**: fixed-interval retry-until-timeout primitive
//! - **Process Manager**: OS-level process lookup and signals
//! - **Sandbox**: isolated profile directory per worker
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │                      Pool (N)                        │
//! │   ┌───────────┐   ┌───────────┐   ┌───────────┐      │
//! │   │ Entry 0   │   │ Entry 1   │   │ Entry 2   │ ...  │
//! │   │ :2002     │   │ :2003     │   │ :2004     │      │
//! │   └─────┬─────┘   └─────┬─────┘   └─────┬─────┘      │
//! │         │ supervisor    │               │            │
//! │   ┌─────┴─────┐   ┌─────┴─────┐   ┌─────┴─────┐      │
//! │   │ soffice   │   │ soffice   │   │ soffice   │      │
//! │   └───────────┘   └───────────┘   └───────────┘      │
//! │                         ▲                            │
//! │                 availability queue                   │
//! │                         │                            │
//! │                  caller threads                      │
//! └──────────────────────────────────────────────────────┘
//! ```

pub mod connection;
pub mod installed;
pub mod pool;
pub mod pool_entry;
pub mod process_manager;
pub mod retry;
pub mod sandbox;
pub mod supervisor;
pub mod task;
pub mod worker_process;

#[cfg(test)]
pub(crate) mod testing;

// Re-export commonly used types
pub use connection::{ConnectError, Connection, SocketConnection, WorkerEndpoint};
pub use pool::{Pool, PoolStats};
pub use pool_entry::{EntrySettings, EntryState, PoolEntry};
pub use process_manager::{ProcessManager, ProcessQuery};
pub use retry::{Attempt, Interrupt, RetryRunner};
pub use sandbox::{Sandbox, SandboxConfig};
pub use supervisor::{SupervisorSettings, WorkerSupervisor};
pub use task::Task;
pub use worker_process::{CommandProcess, CommandWorkerFactory, SpawnConfig, WorkerFactory, WorkerProcess};
