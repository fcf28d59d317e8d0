//! In-process debugger: the hosted module without any network.
//!
//! The embedder plays the client. Replies from the module arrive at
//! [`LocalDebuggerHandler::handle_command`], pauses at
//! [`LocalDebuggerHandler::handle_pause`], and commands go in through
//! [`LocalDebugger::send_command`].

use std::sync::Arc;

use crate::action::DebuggerStateHint;
use crate::binding::{EngineBinding, ObjectHandle};
use crate::error::DebuggerError;
use crate::hosted::{DebuggerEvents, HostedDebugger};
use crate::options::{EngineOptions, HostedModule};
use crate::types::{ClientId, ContextId};

/// The one client of a local debugger.
pub const LOCAL_CLIENT_ID: ClientId = ClientId(1);

pub trait LocalDebuggerHandler: Send + Sync {
    /// A payload the hosted module sent to the client.
    fn handle_command(&self, payload: &str) -> bool;

    /// The script paused. Drive the debugger through `engine` (for example
    /// with [`LocalDebugger::send_command`]) and return `true` to resume or
    /// `false` to abandon the pause.
    fn handle_pause(&self, engine: &mut dyn EngineBinding, suspended: bool) -> bool;

    fn load_script(&self, _name: &str) -> Option<String> {
        None
    }
}

struct LocalEvents(Arc<dyn LocalDebuggerHandler>);

impl DebuggerEvents for LocalEvents {
    fn load_script(&self, name: &str) -> Option<String> {
        self.0.load_script(name)
    }

    fn send_command(&self, _client_id: ClientId, _context_id: ContextId, payload: String) -> bool {
        self.0.handle_command(&payload)
    }

    fn wait_for_command(&self, engine: &mut dyn EngineBinding, suspended: bool) -> bool {
        self.0.handle_pause(engine, suspended)
    }
}

pub struct LocalDebugger {
    hosted: HostedDebugger,
    handler: Arc<dyn LocalDebuggerHandler>,
}

impl LocalDebugger {
    pub fn new(options: EngineOptions, handler: Arc<dyn LocalDebuggerHandler>) -> Self {
        Self {
            hosted: HostedDebugger::new(ContextId::NONE, options),
            handler,
        }
    }

    pub fn install(
        &self,
        engine: &mut dyn EngineBinding,
        module: &HostedModule,
    ) -> Result<(), DebuggerError> {
        let events = Arc::new(LocalEvents(Arc::clone(&self.handler)));
        self.hosted.install(engine, module, events)
    }

    pub fn uninstall(&self, engine: &mut dyn EngineBinding) -> Result<(), DebuggerError> {
        self.hosted.uninstall(engine)
    }

    pub fn is_installed(&self) -> bool {
        self.hosted.is_installed()
    }

    /// Hand a JSON command to the hosted module as the local client.
    pub fn send_command(
        &self,
        engine: &mut dyn EngineBinding,
        payload: &str,
    ) -> Result<DebuggerStateHint, DebuggerError> {
        self.hosted.send_command(engine, LOCAL_CLIENT_ID, payload)
    }

    pub fn add_debuggee(
        &self,
        engine: &mut dyn EngineBinding,
        debuggee: ObjectHandle,
    ) -> Result<(), DebuggerError> {
        self.hosted.register_debuggee(engine, debuggee)
    }

    pub fn remove_debuggee(
        &self,
        engine: &mut dyn EngineBinding,
        debuggee: ObjectHandle,
    ) -> Result<(), DebuggerError> {
        self.hosted.unregister_debuggee(engine, debuggee)
    }
}

impl std::fmt::Debug for LocalDebugger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalDebugger")
            .field("installed", &self.is_installed())
            .finish()
    }
}
