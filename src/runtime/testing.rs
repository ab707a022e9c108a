// src/runtime/testing.rs
//! In-memory worker doubles shared by the unit tests

use crate::runtime::connection::{ConnectError, Connection, WorkerEndpoint};
use crate::runtime::sandbox::Sandbox;
use crate::runtime::worker_process::{WorkerFactory, WorkerProcess};
use crate::utils::errors::{EngineError, Result};
use parking_lot::Mutex;
use std::any::Any;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Observable and steerable state of one fake worker
#[derive(Debug, Default)]
pub(crate) struct FakeWorker {
    pub running: AtomicBool,
    pub exit_code: Mutex<Option<i32>>,
    pub starts: AtomicUsize,
    pub kills: AtomicUsize,
    pub terminate_requests: AtomicUsize,
    pub detaches: AtomicUsize,
    /// Connection attempts refused after each start
    pub refused_connects: AtomicUsize,
    refused_left: AtomicUsize,
    /// Pid of a foreign process bound to the endpoint
    pub conflict: Mutex<Option<u32>>,
    pub ignore_terminate: AtomicBool,
    pub ignore_kill: AtomicBool,
    pub fail_start: AtomicBool,
    /// Exit code reported when the process dies right after launch
    pub die_on_start: Mutex<Option<i32>>,
}

impl FakeWorker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn kills(&self) -> usize {
        self.kills.load(Ordering::SeqCst)
    }

    /// Simulate the worker process dying on its own
    pub fn crash(&self) {
        *self.exit_code.lock() = Some(139);
        self.running.store(false, Ordering::SeqCst);
    }

    fn exit(&self, code: i32) {
        *self.exit_code.lock() = Some(code);
        self.running.store(false, Ordering::SeqCst);
    }
}

pub(crate) struct FakeProcess {
    worker: Arc<FakeWorker>,
    started: bool,
}

impl FakeProcess {
    pub fn new(worker: Arc<FakeWorker>) -> Self {
        Self {
            worker,
            started: false,
        }
    }
}

impl WorkerProcess for FakeProcess {
    fn find_conflict(&self) -> Result<Option<u32>> {
        Ok(*self.worker.conflict.lock())
    }

    fn kill_conflict(&self, pid: u32) -> Result<()> {
        let mut conflict = self.worker.conflict.lock();
        if *conflict == Some(pid) {
            *conflict = None;
        }
        Ok(())
    }

    fn start(&mut self, _sandbox: &Sandbox) -> Result<()> {
        if self.worker.fail_start.load(Ordering::SeqCst) {
            return Err(EngineError::ProcessSpawnFailed("fake start failure".into()));
        }

        self.started = true;
        self.worker.starts.fetch_add(1, Ordering::SeqCst);
        self.worker.refused_left.store(
            self.worker.refused_connects.load(Ordering::SeqCst),
            Ordering::SeqCst,
        );

        match self.worker.die_on_start.lock().take() {
            Some(code) => self.worker.exit(code),
            None => {
                *self.worker.exit_code.lock() = None;
                self.worker.running.store(true, Ordering::SeqCst);
            }
        }
        Ok(())
    }

    fn pid(&self) -> Option<u32> {
        self.started.then_some(4242)
    }

    fn exit_code(&mut self) -> Result<Option<i32>> {
        if !self.started {
            return Ok(Some(0));
        }
        if self.worker.is_running() {
            return Ok(None);
        }
        Ok(Some(self.worker.exit_code.lock().unwrap_or(0)))
    }

    fn kill(&mut self) -> Result<()> {
        self.worker.kills.fetch_add(1, Ordering::SeqCst);
        if !self.worker.ignore_kill.load(Ordering::SeqCst) {
            self.worker.exit(137);
        }
        Ok(())
    }

    fn detach(&mut self) {
        self.worker.detaches.fetch_add(1, Ordering::SeqCst);
        self.started = false;
    }
}

pub(crate) struct FakeConnection {
    endpoint: WorkerEndpoint,
    worker: Arc<FakeWorker>,
    connected: AtomicBool,
}

impl FakeConnection {
    pub fn new(endpoint: WorkerEndpoint, worker: Arc<FakeWorker>) -> Self {
        Self {
            endpoint,
            worker,
            connected: AtomicBool::new(false),
        }
    }
}

impl Connection for FakeConnection {
    fn endpoint(&self) -> &WorkerEndpoint {
        &self.endpoint
    }

    fn connect(&self) -> std::result::Result<(), ConnectError> {
        if !self.worker.is_running() {
            return Err(ConnectError::NotListening(self.endpoint.to_string()));
        }

        let refused = self
            .worker
            .refused_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1));
        if refused.is_ok() {
            return Err(ConnectError::NotListening(self.endpoint.to_string()));
        }

        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst) && self.worker.is_running()
    }

    fn terminate(&self) -> Result<bool> {
        self.worker.terminate_requests.fetch_add(1, Ordering::SeqCst);
        if !self.worker.ignore_terminate.load(Ordering::SeqCst) {
            self.worker.exit(0);
        }
        Ok(true)
    }

    fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Factory handing out fake workers, one per endpoint, in creation order
#[derive(Default)]
pub(crate) struct FakeFactory {
    workers: Mutex<Vec<Arc<FakeWorker>>>,
}

impl FakeFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn worker(&self, slot: usize) -> Arc<FakeWorker> {
        Arc::clone(&self.workers.lock()[slot])
    }
}

impl WorkerFactory for FakeFactory {
    fn create(
        &self,
        endpoint: &WorkerEndpoint,
    ) -> Result<(Box<dyn WorkerProcess>, Arc<dyn Connection>)> {
        let worker = FakeWorker::new();
        self.workers.lock().push(Arc::clone(&worker));

        Ok((
            Box::new(FakeProcess::new(Arc::clone(&worker))),
            Arc::new(FakeConnection::new(endpoint.clone(), worker)),
        ))
    }
}

/// Poll `condition` until it holds or `timeout` elapses
pub(crate) fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    condition()
}
