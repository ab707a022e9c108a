// src/runtime/installed.rs
//! Process-wide default pool
//!
//! Convenience for applications that build one pool at startup and want to
//! reach it from anywhere. The pool itself never looks at this slot.
//!
//! This is global mutable state: tests installing pools in parallel will
//! see each other's pool. Prefer passing an `Arc<Pool>` around.

use crate::runtime::pool::Pool;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::debug;

static INSTALLED: Mutex<Option<Arc<Pool>>> = parking_lot::const_mutex(None);

/// Make `pool` the default pool, returning the one it replaces
pub fn install(pool: Arc<Pool>) -> Option<Arc<Pool>> {
    debug!("Installing default pool");
    INSTALLED.lock().replace(pool)
}

/// The default pool, if one is installed
pub fn installed() -> Option<Arc<Pool>> {
    INSTALLED.lock().clone()
}

/// Remove the default pool
pub fn uninstall() -> Option<Arc<Pool>> {
    INSTALLED.lock().take()
}
