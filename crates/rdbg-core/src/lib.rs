//! rdbg-core
//!
//! Pure debugger logic, no sockets:
//! - blocking queues and client bookkeeping
//! - the engine binding and hosted-debugger installer
//! - per-context sessions with their command loop
//! - the context registry / command router
//! - a sandbox engine for demos and tests

pub mod types;
pub mod error;
pub mod queue;
pub mod command;
pub mod client;
pub mod client_manager;
pub mod messages;
pub mod control;
pub mod binding;
pub mod options;
pub mod action;
pub mod hosted;
pub mod session;
pub mod registry;
pub mod local;
pub mod sandbox;

pub use types::{ClientId, ContextId};
pub use error::{BindingError, DebuggerError, ErrorCode, ManagerError};
pub use queue::{BlockingQueue, Interrupted, QueueSignalHandler};
pub use command::Command;
pub use client::{Client, ClientTransport, DEFAULT_CLIENT_QUEUE_CAPACITY};
pub use client_manager::{
    ClientEvent,
    ClientEventHandler,
    ClientLease,
    ClientManager,
    RemoveOutcome,
    DEFAULT_MAX_CLIENTS,
};
pub use messages::{ClientErrorCode, ClientWarnCode, ContextState, InfoMessage, ServerMessage};
pub use control::ControlRequest;
pub use binding::{
    EngineBinding,
    HostFunction,
    ModuleId,
    ObjectHandle,
    OperationCallback,
    OperationTrigger,
    ScopeId,
    ScriptValue,
};
pub use options::{EngineOptions, HostedModule, ScriptLoader, SharedLoader};
pub use action::{Action, ActionOutcome, ActionResult, DebuggerStateHint};
pub use hosted::{DebuggerEvents, HostedDebugger};
pub use session::EngineSession;
pub use registry::{InputRouter, RegistrySettings, SessionRegistry, DEFAULT_QUEUE_WARN_THRESHOLD};
pub use local::{LocalDebugger, LocalDebuggerHandler, LOCAL_CLIENT_ID};
pub use sandbox::{FailurePoint, PauseReason, RunOutcome, SandboxEngine};
