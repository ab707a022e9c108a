// src/utils/mod.rs
//! Common utilities: settings and error types

pub mod config;
pub mod errors;

pub use config::PoolSettings;
pub use errors::{EngineError, Result};
