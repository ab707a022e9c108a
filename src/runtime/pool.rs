// src/runtime/pool.rs
//! Bounded pool of long-lived worker processes
//!
//! Instead of launching a worker per task, we keep one worker per configured
//! port alive and hand them out to tasks through a bounded queue.
//!
//! # Architecture
//!
//! ```text
//! Pool
//! ├─ Entries: [Entry0, Entry1, ...]   (one per port, never resized)
//! └─ Queue:   [slot, slot, ...]       (entries that may be handed out)
//! ```
//!
//! A task acquires a slot from the queue (bounded wait), runs on that entry,
//! and returns the slot exactly once afterwards, whatever the outcome.

use crate::runtime::connection::WorkerEndpoint;
use crate::runtime::pool_entry::{EntrySettings, EntryState, PoolEntry};
use crate::runtime::sandbox::{Sandbox, SandboxConfig};
use crate::runtime::supervisor::{SupervisorSettings, WorkerSupervisor};
use crate::runtime::task::Task;
use crate::runtime::worker_process::{CommandWorkerFactory, WorkerFactory};
use crate::utils::config::PoolSettings;
use crate::utils::errors::{EngineError, Result};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use ulid::Ulid;

const STOPPED: u8 = 0;
const STARTING: u8 = 1;
const STARTED: u8 = 2;
const SHUTDOWN: u8 = 3;

/// Pool of worker processes executing tasks
pub struct Pool {
    settings: PoolSettings,

    /// One entry per configured port
    entries: Vec<Arc<PoolEntry>>,

    /// Producer side of the availability queue, dropped on stop
    available_tx: Mutex<Option<Sender<usize>>>,

    /// Slots of the entries that may be handed out
    available_rx: Receiver<usize>,

    state: AtomicU8,

    /// Serializes start and stop
    lifecycle: Mutex<()>,
}

impl Pool {
    /// Create an unstarted pool whose workers are built by `factory`
    pub fn new(settings: PoolSettings, factory: &dyn WorkerFactory) -> Result<Self> {
        settings.validate()?;
        info!("Initializing pool with {} workers", settings.pool_size());

        let supervisor_settings = SupervisorSettings::from(&settings);
        let entry_settings = EntrySettings::from(&settings);

        let entries = settings
            .ports
            .iter()
            .enumerate()
            .map(|(slot, &port)| {
                let endpoint = WorkerEndpoint::new(settings.host.clone(), port);
                let (process, connection) = factory.create(&endpoint)?;
                let sandbox = Sandbox::new(SandboxConfig {
                    working_dir: settings.working_dir.clone(),
                    profile_name: endpoint.profile_dir_name(),
                    template_dir: settings.template_profile_dir.clone(),
                });
                let supervisor = WorkerSupervisor::new(
                    endpoint,
                    process,
                    connection,
                    sandbox,
                    supervisor_settings.clone(),
                );

                Ok(Arc::new(PoolEntry::new(slot, supervisor, entry_settings.clone())))
            })
            .collect::<Result<Vec<_>>>()?;

        let (available_tx, available_rx) = crossbeam_channel::bounded(entries.len());

        Ok(Self {
            settings,
            entries,
            available_tx: Mutex::new(Some(available_tx)),
            available_rx,
            state: AtomicU8::new(STOPPED),
            lifecycle: Mutex::new(()),
        })
    }

    /// Create an unstarted pool launching office workers from the command line
    pub fn from_settings(settings: PoolSettings) -> Result<Self> {
        let factory = CommandWorkerFactory::from_settings(&settings);
        Self::new(settings, &factory)
    }

    pub fn settings(&self) -> &PoolSettings {
        &self.settings
    }

    pub fn entries(&self) -> &[Arc<PoolEntry>] {
        &self.entries
    }

    /// Start every worker. A pool can be started once.
    ///
    /// If a worker fails to start, the workers already started are stopped
    /// and the pool is shut down for good. With `start_fail_fast` off, the
    /// worker is left stopped instead and started by its first task.
    pub fn start(&self) -> Result<()> {
        let _guard = self.lifecycle.lock();

        self.state
            .compare_exchange(STOPPED, STARTING, Ordering::SeqCst, Ordering::SeqCst)
            .map_err(|state| {
                let reason = if state == SHUTDOWN {
                    "pool is shut down and cannot be restarted"
                } else {
                    "pool is already started"
                };
                EngineError::Lifecycle(reason.to_string())
            })?;

        info!("Starting pool with {} workers", self.entries.len());

        for entry in &self.entries {
            if let Err(e) = entry.start() {
                if !self.settings.start_fail_fast {
                    warn!(
                        "Pool entry {} failed to start, will retry on its first task: {}",
                        entry.slot(),
                        e
                    );
                    continue;
                }
                error!("Pool entry {} failed to start: {}", entry.slot(), e);
                self.state.store(SHUTDOWN, Ordering::SeqCst);
                self.close_queue();
                if let Err(stop_err) = self.stop_entries() {
                    warn!("Cannot stop pool after failed start: {}", stop_err);
                }
                return Err(e);
            }
        }

        if let Some(sender) = self.available_tx.lock().as_ref() {
            for entry in &self.entries {
                if let Err(e) = sender.try_send(entry.slot()) {
                    warn!("Cannot queue pool entry {}: {}", entry.slot(), e);
                }
            }
        }
        self.record_available();

        self.state.store(STARTED, Ordering::SeqCst);
        info!("Pool started");
        Ok(())
    }

    /// Stop every worker; the pool cannot be started again. Calling it
    /// again does nothing.
    ///
    /// Every entry is stopped even if some fail; the first failure is
    /// returned.
    pub fn stop(&self) -> Result<()> {
        let _guard = self.lifecycle.lock();

        if self.state.swap(SHUTDOWN, Ordering::SeqCst) == SHUTDOWN {
            debug!("Pool is already stopped");
            return Ok(());
        }

        info!("Stopping pool...");
        self.close_queue();
        let result = self.stop_entries();
        info!("Pool stopped");
        result
    }

    pub fn is_running(&self) -> bool {
        self.state.load(Ordering::SeqCst) == STARTED
    }

    /// Execute a task on the first worker that becomes available.
    ///
    /// Waits up to `task_queue_timeout_ms` for a worker, then blocks until
    /// the task completes, times out, or its worker dies.
    pub fn execute<T: Task>(&self, task: T) -> Result<()> {
        if !self.is_running() {
            return Err(EngineError::Lifecycle("pool is not running".into()));
        }

        let span = tracing::info_span!("task", id = %Ulid::new());
        let _enter = span.enter();

        let lease = self.acquire()?;
        debug!("Acquired pool entry {}", lease.entry.slot());
        lease.entry.execute(task)
    }

    /// Get pool statistics
    pub fn stats(&self) -> PoolStats {
        let busy = self
            .entries
            .iter()
            .filter(|entry| matches!(entry.state(), EntryState::Busy | EntryState::Restarting))
            .count();

        PoolStats {
            total: self.entries.len(),
            available: self.available_rx.len(),
            busy,
        }
    }

    fn acquire(&self) -> Result<Lease<'_>> {
        let timeout = self.settings.task_queue_timeout();

        let slot = match self.available_rx.recv_timeout(timeout) {
            Ok(slot) => slot,
            Err(RecvTimeoutError::Timeout) => {
                metrics::counter!("docpool_queue_timeouts_total").increment(1);
                warn!("No worker became available within {:?}", timeout);
                return Err(EngineError::QueueTimeout(timeout));
            }
            Err(RecvTimeoutError::Disconnected) => {
                return Err(EngineError::Lifecycle(
                    "pool was stopped while waiting for a worker".into(),
                ));
            }
        };
        self.record_available();

        let entry = self.entries.get(slot).cloned().ok_or_else(|| {
            EngineError::Lifecycle(format!("unknown pool entry {} in queue", slot))
        })?;
        Ok(Lease { pool: self, entry })
    }

    fn release(&self, entry: &PoolEntry) {
        if self.state.load(Ordering::SeqCst) == SHUTDOWN || entry.state() == EntryState::Shutdown {
            debug!("Not returning pool entry {} to a stopped pool", entry.slot());
            return;
        }

        if let Some(sender) = self.available_tx.lock().as_ref() {
            if let Err(e) = sender.try_send(entry.slot()) {
                warn!("Cannot return pool entry {} to the queue: {}", entry.slot(), e);
            }
        }
        self.record_available();
    }

    /// Drop the producer side and empty the queue, waking every waiter
    fn close_queue(&self) {
        drop(self.available_tx.lock().take());
        let drained = self.available_rx.try_iter().count();
        debug!("Drained {} entries from the queue", drained);
        self.record_available();
    }

    fn stop_entries(&self) -> Result<()> {
        let mut first_error = None;

        for entry in &self.entries {
            if let Err(e) = entry.stop() {
                if first_error.is_none() {
                    first_error = Some(e);
                } else {
                    error!("Pool entry {} failed to stop: {}", entry.slot(), e);
                }
            }
        }

        first_error.map_or(Ok(()), Err)
    }

    fn record_available(&self) {
        metrics::gauge!("docpool_available_workers").set(self.available_rx.len() as f64);
    }
}

impl Drop for Pool {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            warn!("Error stopping pool on drop: {}", e);
        }
    }
}

/// An acquired entry, returned to the queue when dropped
struct Lease<'a> {
    pool: &'a Pool,
    entry: Arc<PoolEntry>,
}

impl Drop for Lease<'_> {
    fn drop(&mut self) {
        self.pool.release(&self.entry);
    }
}

/// Pool statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub total: usize,
    pub available: usize,
    pub busy: usize,
}
