// src/runtime/task.rs
//! Units of work run against a worker connection

use crate::runtime::connection::Connection;

/// A unit of work executed once, on one worker, through its connection.
///
/// Any error returned here reaches the caller of `Pool::execute` as
/// `EngineError::Task`, unchanged.
///
/// The connection belongs to the worker the task was started on. Once that
/// worker is restarted (for instance after the task timed out) it reports
/// disconnected and no longer downcasts to the concrete connection type.
pub trait Task: Send + 'static {
    fn execute(self, connection: &dyn Connection) -> anyhow::Result<()>;
}

impl<F> Task for F
where
    F: FnOnce(&dyn Connection) -> anyhow::Result<()> + Send + 'static,
{
    fn execute(self, connection: &dyn Connection) -> anyhow::Result<()> {
        self(connection)
    }
}
