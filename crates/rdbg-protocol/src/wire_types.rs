//! Wire constants.
//!
//! Every message on the wire is one line:
//!
//! ```text
//! [<context id> '/'] <payload> '\n'
//! ```
//!
//! A missing prefix means "no context" (control plane). Payloads are JSON,
//! except for the plain-text [`ControlRequest`]s.

pub use rdbg_core::ControlRequest;

/// Default TCP port of the debugger server.
pub const DEFAULT_TCP_PORT: u16 = 8089;

/// Default per-connection buffer size (50 MiB).
pub const DEFAULT_BUFFER_SIZE: usize = 50 * 1024 * 1024;

/// Separates the context id from the payload.
pub const CONTEXT_SEPARATOR: u8 = b'/';

pub const LINE_FEED: u8 = b'\n';
pub const CARRIAGE_RETURN: u8 = b'\r';

/// A zero byte anywhere in the stream is treated as corruption.
pub const FORBIDDEN_BYTE: u8 = 0;
