//! Error types for the debugger core.
//!
//! Errors never cross into embedder code as panics: every public
//! operation returns a `Result`, and each error maps onto the stable
//! integer codes of the embedding API through [`ErrorCode`].
//!
//! The one special case is [`Interrupted`](crate::queue::Interrupted),
//! which lives next to the queue and unwinds the command loop via `?`.

use thiserror::Error;

/// Stable integer codes surfaced by the embedding API.
#[repr(i32)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ErrorCode {
    None = 0,
    OutOfMemory = 1,
    UnknownProtocol = 2,
    CannotCreateSocket = 6,
    SocketOptions = 7,
    ResolveFailed = 8,
    BindFailed = 9,
    ListenFailed = 10,
    RecvFailed = 11,
    PipeFailed = 12,
    WouldBlock = 13,
    FileNotFound = 14,
    ConnectionClosed = 15,
    IllegalArgument = 16,
    CannotReadFile = 17,
    CannotRemoveConnections = 18,
    DebuggerAlreadyInstalled = 19,
    DebuggerNotInstalled = 20,
    AlreadyStarted = 21,
    NotStarted = 22,
    MaliciousData = 23,
    SendFailed = 24,

    // ------------------------------------------------------------------
    // Engine integration
    // ------------------------------------------------------------------
    CannotCreateScope = 100,
    CannotWrapObject = 101,
    CannotInitStandardLibrary = 102,
    CannotDefineFunction = 103,
    CannotSetProperty = 104,
    PendingException = 105,
    CannotEvaluateModule = 106,
    CannotRegisterDebuggee = 107,
    CannotUnregisterDebuggee = 108,
    ShutdownFailed = 109,
    CannotParseCommand = 110,
    DispatchFailed = 111,
}

impl ErrorCode {
    pub fn as_i32(self) -> i32 {
        self as i32
    }
}

/// Failure reported by an [`EngineBinding`](crate::binding::EngineBinding).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BindingError {
    /// Script code raised an exception; the message is its string form.
    #[error("script exception: {0}")]
    Exception(String),

    /// The engine refused the operation itself.
    #[error("engine failure: {0}")]
    Engine(String),

    #[error("unknown debug scope {0}")]
    UnknownScope(u64),

    #[error("module has no export named `{0}`")]
    MissingExport(String),
}

/// Errors from [`ClientManager`](crate::client_manager::ClientManager).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ManagerError {
    #[error("illegal argument: {0}")]
    IllegalArgument(String),

    #[error("client limit of {0} reached")]
    TooManyClients(usize),

    #[error("{remaining} client(s) still in use, cannot remove connections")]
    CannotRemoveConnections { remaining: usize },
}

impl ManagerError {
    pub fn code(&self) -> ErrorCode {
        match self {
            ManagerError::IllegalArgument(_) | ManagerError::TooManyClients(_) => {
                ErrorCode::IllegalArgument
            }
            ManagerError::CannotRemoveConnections { .. } => ErrorCode::CannotRemoveConnections,
        }
    }
}

/// Errors from installing, driving and removing a debugger session.
#[derive(Debug, Error)]
pub enum DebuggerError {
    #[error("debugger already installed in this context")]
    AlreadyInstalled,

    #[error("debugger is not installed in this context")]
    NotInstalled,

    #[error("cannot create debugger scope: {0}")]
    CannotCreateScope(#[source] BindingError),

    #[error("cannot initialize standard library: {0}")]
    CannotInitStandardLibrary(#[source] BindingError),

    #[error("cannot define host function `{name}`: {source}")]
    CannotDefineFunction {
        name: &'static str,
        #[source]
        source: BindingError,
    },

    #[error("cannot set property `{name}`: {source}")]
    CannotSetProperty {
        name: &'static str,
        #[source]
        source: BindingError,
    },

    #[error("cannot evaluate hosted debugger module: {0}")]
    CannotEvaluateModule(#[source] BindingError),

    #[error("cannot register debuggee: {0}")]
    CannotRegisterDebuggee(#[source] BindingError),

    #[error("cannot unregister debuggee: {0}")]
    CannotUnregisterDebuggee(#[source] BindingError),

    #[error("hosted debugger shutdown failed: {0}")]
    ShutdownFailed(#[source] BindingError),

    #[error("cannot parse command: {0}")]
    CannotParseCommand(#[from] serde_json::Error),

    #[error("command dispatch failed: {0}")]
    DispatchFailed(#[source] BindingError),

    #[error(transparent)]
    Manager(#[from] ManagerError),
}

impl DebuggerError {
    pub fn code(&self) -> ErrorCode {
        match self {
            DebuggerError::AlreadyInstalled => ErrorCode::DebuggerAlreadyInstalled,
            DebuggerError::NotInstalled => ErrorCode::DebuggerNotInstalled,
            DebuggerError::CannotCreateScope(_) => ErrorCode::CannotCreateScope,
            DebuggerError::CannotInitStandardLibrary(_) => ErrorCode::CannotInitStandardLibrary,
            DebuggerError::CannotDefineFunction { .. } => ErrorCode::CannotDefineFunction,
            DebuggerError::CannotSetProperty { .. } => ErrorCode::CannotSetProperty,
            DebuggerError::CannotEvaluateModule(_) => ErrorCode::CannotEvaluateModule,
            DebuggerError::CannotRegisterDebuggee(_) => ErrorCode::CannotRegisterDebuggee,
            DebuggerError::CannotUnregisterDebuggee(_) => ErrorCode::CannotUnregisterDebuggee,
            DebuggerError::ShutdownFailed(_) => ErrorCode::ShutdownFailed,
            DebuggerError::CannotParseCommand(_) => ErrorCode::CannotParseCommand,
            DebuggerError::DispatchFailed(_) => ErrorCode::DispatchFailed,
            DebuggerError::Manager(e) => e.code(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_match_embedding_api() {
        assert_eq!(DebuggerError::AlreadyInstalled.code().as_i32(), 19);
        assert_eq!(DebuggerError::NotInstalled.code().as_i32(), 20);
        assert_eq!(
            ManagerError::CannotRemoveConnections { remaining: 1 }.code().as_i32(),
            18
        );
        assert_eq!(
            DebuggerError::CannotEvaluateModule(BindingError::Exception("x".into()))
                .code()
                .as_i32(),
            106
        );
    }
}
