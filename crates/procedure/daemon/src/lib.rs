//! Federation Manager procedure daemon
//!
//! This crate wires the procedure engine into a long-running service:
//! - Layered configuration (defaults, file, environment)
//! - Instance store selection (in-memory or PostgreSQL)
//! - Loading extra procedure definitions from disk
//! - Timer manager lifecycle and graceful shutdown

pub mod config;
pub mod definitions;
pub mod error;
pub mod runtime;

pub use config::DaemonConfig;
pub use error::{DaemonError, DaemonResult};
pub use runtime::Runtime;
