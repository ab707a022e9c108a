// src/runtime/pool_entry.rs
//! One slot of the pool
//!
//! A pool entry wraps one [`WorkerSupervisor`] and runs tasks on its own
//! dedicated thread, one at a time. The calling thread waits for the task
//! reply, bounded by the execution timeout, and checks on the worker process
//! at every poll interval.
//!
//! A task that outlives its timeout keeps the thread until it returns; the
//! next task queues behind it and that wait counts against its own timeout.
//! Its connection handle is tied to the worker it started on and goes stale
//! once that worker is restarted.
//!
//!
//! ```text
//!             start                  execute
//! STOPPED ───────────▶ AVAILABLE ◀──────────▶ BUSY
//!    ▲                     ▲                    │ timeout | crash | recycle
//!    │ restart failed      └──── RESTARTING ◀───┘
//!    └─────────────────────────────┘
//!
//! any ──stop──▶ SHUTDOWN (terminal)
//! ```

use crate::runtime::connection::{ConnectError, Connection, WorkerEndpoint};
use crate::runtime::retry::Interrupt;
use crate::runtime::supervisor::WorkerSupervisor;
use crate::runtime::task::Task;
use crate::utils::config::PoolSettings;
use crate::utils::errors::{EngineError, Result};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use std::any::Any;
use std::fmt;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Lifecycle state of a pool entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    Stopped,
    Available,
    Busy,
    Restarting,
    Shutdown,
}

impl fmt::Display for EntryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EntryState::Stopped => "STOPPED",
            EntryState::Available => "AVAILABLE",
            EntryState::Busy => "BUSY",
            EntryState::Restarting => "RESTARTING",
            EntryState::Shutdown => "SHUTDOWN",
        };
        f.write_str(name)
    }
}

/// Configuration for a pool entry
#[derive(Debug, Clone)]
pub struct EntrySettings {
    /// Maximum time a task may run (default: 120s)
    pub task_execution_timeout: Duration,

    /// Tasks executed before the worker is recycled, 0 disables recycling
    /// (default: 200)
    pub max_tasks_per_worker: u32,

    /// How often the worker process is checked while a task runs
    /// (default: 250ms)
    pub poll_interval: Duration,
}

impl Default for EntrySettings {
    fn default() -> Self {
        Self::from(&PoolSettings::default())
    }
}

impl From<&PoolSettings> for EntrySettings {
    fn from(settings: &PoolSettings) -> Self {
        Self {
            task_execution_timeout: settings.task_execution_timeout(),
            max_tasks_per_worker: settings.max_tasks_per_worker,
            poll_interval: settings.process_retry_interval(),
        }
    }
}

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Dedicated thread running the jobs of one entry
struct TaskExecutor {
    sender: Sender<Job>,
    handle: JoinHandle<()>,
    busy: Arc<AtomicBool>,
}

impl TaskExecutor {
    fn spawn(slot: usize) -> Result<Self> {
        let (sender, receiver) = crossbeam_channel::unbounded::<Job>();
        let busy = Arc::new(AtomicBool::new(false));
        let thread_busy = Arc::clone(&busy);

        let handle = thread::Builder::new()
            .name(format!("docpool-worker-{}", slot))
            .spawn(move || {
                for job in receiver.iter() {
                    thread_busy.store(true, Ordering::SeqCst);
                    job();
                    thread_busy.store(false, Ordering::SeqCst);
                }
            })?;

        debug!("Spawned worker thread for pool entry {}", slot);
        Ok(Self {
            sender,
            handle,
            busy,
        })
    }

    fn submit(&self, job: Job) -> Result<()> {
        self.sender
            .send(job)
            .map_err(|_| EngineError::Lifecycle("worker thread is gone".into()))
    }

    fn is_busy(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }

    /// Let the thread finish; a thread stuck in a job is detached.
    fn shutdown(self) {
        let TaskExecutor {
            sender,
            handle,
            busy,
        } = self;
        drop(sender);

        if busy.load(Ordering::SeqCst) {
            debug!("Detaching busy worker thread {:?}", handle.thread().name());
            return;
        }
        if handle.join().is_err() {
            warn!("Worker thread terminated abnormally");
        }
    }
}

/// Connection handed to a task, valid until its worker is restarted
struct TaskConnection {
    inner: Arc<dyn Connection>,
    generation: u64,
    current: Arc<AtomicU64>,
}

impl TaskConnection {
    fn is_current(&self) -> bool {
        self.current.load(Ordering::SeqCst) == self.generation
    }
}

impl Connection for TaskConnection {
    fn endpoint(&self) -> &WorkerEndpoint {
        self.inner.endpoint()
    }

    fn connect(&self) -> std::result::Result<(), ConnectError> {
        if !self.is_current() {
            return Err(ConnectError::Failed(io::Error::new(
                io::ErrorKind::NotConnected,
                "worker was restarted",
            )));
        }
        self.inner.connect()
    }

    fn is_connected(&self) -> bool {
        self.is_current() && self.inner.is_connected()
    }

    fn terminate(&self) -> Result<bool> {
        if self.is_current() {
            self.inner.terminate()
        } else {
            Ok(false)
        }
    }

    fn disconnect(&self) {
        if self.is_current() {
            self.inner.disconnect();
        }
    }

    // A stale handle no longer downcasts to the worker's connection
    fn as_any(&self) -> &dyn Any {
        if self.is_current() {
            self.inner.as_any()
        } else {
            self
        }
    }
}

enum Outcome {
    Completed(anyhow::Result<()>),
    TimedOut,
    Crashed(Option<i32>),
    Shutdown,
}

#[derive(Debug, Clone, Copy)]
enum RestartReason {
    Recycle,
    Timeout,
    Crash,
}

impl RestartReason {
    fn as_str(self) -> &'static str {
        match self {
            RestartReason::Recycle => "recycle",
            RestartReason::Timeout => "timeout",
            RestartReason::Crash => "crash",
        }
    }
}

/// One worker of the pool with its dedicated execution thread
pub struct PoolEntry {
    slot: usize,
    settings: EntrySettings,
    state: Mutex<EntryState>,
    supervisor: Mutex<WorkerSupervisor>,
    connection: Arc<dyn Connection>,
    interrupt: Interrupt,
    executor: Mutex<Option<TaskExecutor>>,
    /// Tasks completed since the last (re)start
    task_count: AtomicU32,
    /// Cancellation flag of the job in flight
    current_job: Mutex<Option<Arc<AtomicBool>>>,
    /// Bumped whenever the worker goes away, invalidating task connections
    generation: Arc<AtomicU64>,
}

impl PoolEntry {
    pub fn new(slot: usize, supervisor: WorkerSupervisor, settings: EntrySettings) -> Self {
        Self {
            slot,
            settings,
            state: Mutex::new(EntryState::Stopped),
            connection: supervisor.connection(),
            interrupt: supervisor.interrupt(),
            supervisor: Mutex::new(supervisor),
            executor: Mutex::new(None),
            task_count: AtomicU32::new(0),
            current_job: Mutex::new(None),
            generation: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn slot(&self) -> usize {
        self.slot
    }

    pub fn state(&self) -> EntryState {
        *self.state.lock()
    }

    pub fn task_count(&self) -> u32 {
        self.task_count.load(Ordering::SeqCst)
    }

    pub fn is_running(&self) -> bool {
        matches!(self.state(), EntryState::Available | EntryState::Busy)
            && self.supervisor.lock().is_running()
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }

    /// Start the worker and make the entry available
    pub fn start(&self) -> Result<()> {
        match self.state() {
            EntryState::Stopped => self.start_worker(),
            EntryState::Shutdown => Err(self.shut_down_error()),
            state => Err(EngineError::Lifecycle(format!(
                "pool entry {} is already started ({})",
                self.slot, state
            ))),
        }
    }

    /// Execute a task on this entry's worker.
    ///
    /// Blocks until the task completes, times out, or the worker dies. The
    /// worker is restarted before returning in the last two cases.
    pub fn execute<T: Task>(&self, task: T) -> Result<()> {
        match self.state() {
            EntryState::Shutdown => return Err(self.shut_down_error()),
            EntryState::Stopped => {
                info!(
                    "Pool entry {} is not running; starting it before executing the task",
                    self.slot
                );
                self.start_worker()?;
            }
            _ => {}
        }

        if !self.transition(EntryState::Busy) {
            return Err(self.shut_down_error());
        }

        let result = self.run(task);

        // A failed restart leaves the entry STOPPED
        let mut state = self.state.lock();
        if matches!(*state, EntryState::Busy | EntryState::Restarting) {
            *state = EntryState::Available;
        }

        result
    }

    /// Shut the entry down for good. Calling it again does nothing.
    pub fn stop(&self) -> Result<()> {
        {
            let mut state = self.state.lock();
            if *state == EntryState::Shutdown {
                debug!("Pool entry {} is already shut down", self.slot);
                return Ok(());
            }
            *state = EntryState::Shutdown;
        }

        info!("Stopping pool entry {}", self.slot);
        self.interrupt.trigger();
        self.generation.fetch_add(1, Ordering::SeqCst);

        if let Some(cancelled) = self.current_job.lock().take() {
            cancelled.store(true, Ordering::SeqCst);
        }
        if let Some(executor) = self.executor.lock().take() {
            executor.shutdown();
        }

        self.supervisor.lock().stop()
    }

    fn start_worker(&self) -> Result<()> {
        self.supervisor.lock().start()?;
        self.task_count.store(0, Ordering::SeqCst);
        self.ensure_executor()?;

        if !self.transition(EntryState::Available) {
            return Err(self.shut_down_error());
        }
        info!("Pool entry {} started", self.slot);
        Ok(())
    }

    fn run<T: Task>(&self, task: T) -> Result<()> {
        let cancelled = Arc::new(AtomicBool::new(false));
        let (reply_tx, reply_rx) = crossbeam_channel::bounded(1);
        let connection = TaskConnection {
            inner: Arc::clone(&self.connection),
            generation: self.generation.load(Ordering::SeqCst),
            current: Arc::clone(&self.generation),
        };
        let flag = Arc::clone(&cancelled);

        let job: Job = Box::new(move || {
            if flag.load(Ordering::SeqCst) {
                return;
            }
            let result = panic::catch_unwind(AssertUnwindSafe(|| task.execute(&connection)))
                .unwrap_or_else(|payload| {
                    Err(anyhow::anyhow!("task panicked: {}", panic_message(payload.as_ref())))
                });
            let _ = reply_tx.send(result);
        });

        *self.current_job.lock() = Some(Arc::clone(&cancelled));
        debug!("Executing task on pool entry {}", self.slot);

        let outcome = match self.submit(job) {
            Ok(()) => self.await_outcome(&reply_rx),
            Err(e) => {
                *self.current_job.lock() = None;
                return Err(e);
            }
        };
        *self.current_job.lock() = None;

        self.handle(outcome, &cancelled)
    }

    fn await_outcome(&self, reply: &Receiver<anyhow::Result<()>>) -> Outcome {
        let deadline = Instant::now() + self.settings.task_execution_timeout;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Outcome::TimedOut;
            }

            match reply.recv_timeout(remaining.min(self.settings.poll_interval)) {
                Ok(result) => return Outcome::Completed(result),
                Err(RecvTimeoutError::Disconnected) => {
                    if self.state() == EntryState::Shutdown {
                        return Outcome::Shutdown;
                    }
                    return Outcome::Crashed(self.exit_code());
                }
                Err(RecvTimeoutError::Timeout) => {
                    if self.state() == EntryState::Shutdown {
                        return Outcome::Shutdown;
                    }
                    // The supervisor is only contended by a concurrent stop
                    if let Some(mut supervisor) = self.supervisor.try_lock() {
                        if let Some(code) = supervisor.exit_code() {
                            return Outcome::Crashed(Some(code));
                        }
                    }
                }
            }
        }
    }

    fn handle(&self, outcome: Outcome, cancelled: &AtomicBool) -> Result<()> {
        match outcome {
            Outcome::Completed(Ok(())) => {
                metrics::counter!("docpool_tasks_total", "outcome" => "completed").increment(1);
                debug!("Task executed successfully on pool entry {}", self.slot);
                self.after_success();
                Ok(())
            }
            Outcome::Completed(Err(e)) => match self.exit_code() {
                Some(code) => {
                    warn!(
                        "Task failed and worker of pool entry {} exited with code {}: {:#}",
                        self.slot, code, e
                    );
                    metrics::counter!("docpool_tasks_total", "outcome" => "crashed").increment(1);
                    self.recover(cancelled, RestartReason::Crash);
                    Err(EngineError::TaskCrashed {
                        exit_code: Some(code),
                    })
                }
                None => {
                    metrics::counter!("docpool_tasks_total", "outcome" => "failed").increment(1);
                    debug!("Task failed on pool entry {}: {:#}", self.slot, e);
                    Err(EngineError::Task(e))
                }
            },
            Outcome::TimedOut => {
                let timeout = self.settings.task_execution_timeout;
                warn!(
                    "Task did not complete within {:?} on pool entry {}; restarting worker",
                    timeout, self.slot
                );
                metrics::counter!("docpool_tasks_total", "outcome" => "timeout").increment(1);
                self.recover(cancelled, RestartReason::Timeout);
                Err(EngineError::TaskTimeout(timeout))
            }
            Outcome::Crashed(exit_code) => {
                warn!(
                    "Worker of pool entry {} died while executing a task (exit code: {:?}); restarting",
                    self.slot, exit_code
                );
                metrics::counter!("docpool_tasks_total", "outcome" => "crashed").increment(1);
                self.recover(cancelled, RestartReason::Crash);
                Err(EngineError::TaskCrashed { exit_code })
            }
            Outcome::Shutdown => {
                cancelled.store(true, Ordering::SeqCst);
                Err(EngineError::Lifecycle(format!(
                    "pool entry {} was shut down while executing a task",
                    self.slot
                )))
            }
        }
    }

    fn after_success(&self) {
        let count = self.task_count.fetch_add(1, Ordering::SeqCst) + 1;

        if let Some(code) = self.exit_code() {
            warn!(
                "Worker of pool entry {} exited with code {} after the task; restarting",
                self.slot, code
            );
            self.restart_worker(RestartReason::Crash);
            return;
        }

        let max = self.settings.max_tasks_per_worker;
        if max > 0 && count >= max {
            info!("Reached limit of {} maximum tasks per worker; restarting...", max);
            self.restart_worker(RestartReason::Recycle);
        } else {
            debug!(
                "Limit of {} maximum tasks per worker not reached yet. Task count is {}",
                max, count
            );
        }
    }

    /// Cancel the job in flight and bring up a fresh worker
    fn recover(&self, cancelled: &AtomicBool, reason: RestartReason) {
        cancelled.store(true, Ordering::SeqCst);
        self.restart_worker(reason);
    }

    fn restart_worker(&self, reason: RestartReason) {
        if !self.transition(EntryState::Restarting) {
            return;
        }
        self.generation.fetch_add(1, Ordering::SeqCst);
        metrics::counter!("docpool_worker_restarts_total", "reason" => reason.as_str())
            .increment(1);

        let result = {
            let mut supervisor = self.supervisor.lock();
            match reason {
                RestartReason::Recycle => supervisor.restart(),
                RestartReason::Timeout | RestartReason::Crash => supervisor.force_restart(),
            }
        };

        match result {
            Ok(()) => self.task_count.store(0, Ordering::SeqCst),
            Err(e) => {
                error!(
                    "Pool entry {} could not restart its worker ({}): {}",
                    self.slot,
                    reason.as_str(),
                    e
                );
                self.transition(EntryState::Stopped);
            }
        }
    }

    fn ensure_executor(&self) -> Result<()> {
        let mut executor = self.executor.lock();
        if executor.is_none() {
            *executor = Some(TaskExecutor::spawn(self.slot)?);
        }
        Ok(())
    }

    fn submit(&self, job: Job) -> Result<()> {
        self.ensure_executor()?;
        match self.executor.lock().as_ref() {
            Some(executor) => {
                if executor.is_busy() {
                    debug!(
                        "Worker thread of pool entry {} is still held by a cancelled task; queueing",
                        self.slot
                    );
                }
                executor.submit(job)
            }
            None => Err(self.shut_down_error()),
        }
    }

    fn exit_code(&self) -> Option<i32> {
        self.supervisor.lock().exit_code()
    }

    /// Move to `to` unless the entry is shut down
    fn transition(&self, to: EntryState) -> bool {
        let mut state = self.state.lock();
        if *state == EntryState::Shutdown {
            return false;
        }
        *state = to;
        true
    }

    fn shut_down_error(&self) -> EngineError {
        EngineError::Lifecycle(format!("pool entry {} is shut down", self.slot))
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}
