//! Shared types for the debugger TCP server.
//!
//! This module defines:
//! - `ControlCommand`: requests other threads send to the I/O thread
//! - the control channel aliases
//! - `TransportError`: everything that can go wrong below the router

use std::io;

use rdbg_core::{ClientId, ErrorCode};
use thiserror::Error;
use tokio::sync::mpsc;

/// Request for the I/O thread, sent over the control channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlCommand {
    /// The client's output queue has data.
    Write(ClientId),
    /// Drop the client's connection.
    Disconnect(ClientId),
    /// Leave the readiness loop.
    Exit,
}

/// Channel from any thread -> I/O thread.
pub type ControlTx = mpsc::UnboundedSender<ControlCommand>;
pub type ControlRx = mpsc::UnboundedReceiver<ControlCommand>;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("server already started")]
    AlreadyStarted,

    #[error("server not started")]
    NotStarted,

    #[error("cannot resolve {addr}: {source}")]
    Resolve {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("cannot bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("cannot listen on {addr}: {source}")]
    Listen {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("cannot configure socket: {0}")]
    SocketOptions(#[source] io::Error),

    #[error("cannot start I/O thread: {0}")]
    Runtime(#[source] io::Error),

    #[error("connection closed by peer")]
    ConnectionClosed,

    #[error("NUL byte received")]
    MaliciousData,

    #[error("receive failed: {0}")]
    Recv(#[source] io::Error),

    #[error("send failed: {0}")]
    Send(#[source] io::Error),
}

impl TransportError {
    pub fn code(&self) -> ErrorCode {
        match self {
            TransportError::AlreadyStarted => ErrorCode::AlreadyStarted,
            TransportError::NotStarted => ErrorCode::NotStarted,
            TransportError::Resolve { .. } => ErrorCode::ResolveFailed,
            TransportError::Bind { .. } => ErrorCode::BindFailed,
            TransportError::Listen { .. } => ErrorCode::ListenFailed,
            TransportError::SocketOptions(_) => ErrorCode::SocketOptions,
            TransportError::Runtime(_) => ErrorCode::PipeFailed,
            TransportError::ConnectionClosed => ErrorCode::ConnectionClosed,
            TransportError::MaliciousData => ErrorCode::MaliciousData,
            TransportError::Recv(_) => ErrorCode::RecvFailed,
            TransportError::Send(_) => ErrorCode::SendFailed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_codes() {
        assert_eq!(TransportError::AlreadyStarted.code().as_i32(), 21);
        assert_eq!(TransportError::NotStarted.code().as_i32(), 22);
        assert_eq!(TransportError::MaliciousData.code().as_i32(), 23);
    }

    #[test]
    fn every_bind_failure_is_bind_failed() {
        for kind in [io::ErrorKind::AddrInUse, io::ErrorKind::PermissionDenied] {
            let err = TransportError::Bind {
                addr: "127.0.0.1:1".into(),
                source: io::Error::from(kind),
            };
            assert_eq!(err.code(), ErrorCode::BindFailed);
        }
    }

    #[test]
    fn listener_registration_is_listen_failed() {
        let err = TransportError::Listen {
            addr: "127.0.0.1:1".into(),
            source: io::Error::from(io::ErrorKind::Other),
        };
        assert_eq!(err.code(), ErrorCode::ListenFailed);
    }
}
