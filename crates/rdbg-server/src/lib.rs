//! rdbg-server
//!
//! TCP front end of the remote debugger: configuration, the readiness
//! loop on its own I/O thread, and the `RemoteDebugger` facade that
//! embedders hold.

pub mod config;
pub mod types;
pub mod server;
pub mod debugger;
pub mod engine_task;

// internal, not re-exported
mod connection;

pub use config::{Config, ConfigError};
pub use debugger::RemoteDebugger;
pub use types::TransportError;
