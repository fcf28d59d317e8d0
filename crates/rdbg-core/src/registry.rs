//! Context registry and inbound command router.
//!
//! [`SessionRegistry`] maps `ContextId -> EngineSession` behind one mutex
//! and decides where every decoded client command goes:
//!
//! - control plane (`context_id == NONE`): `exit`, `get_available_contexts`
//!   and `get_version` are answered here; anything else is queued for
//!   every live session,
//! - known context: queued for exactly that session,
//! - unknown context: error envelope plus a fresh contexts list, back to
//!   the sender only.
//!
//! Routing runs on whatever thread enqueued into a client's input queue
//! (the I/O thread in the server) and never blocks: replies go out with
//! [`ClientManager::post_command`].

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tracing::{debug, error, info, warn};

use crate::action::Action;
use crate::binding::{EngineBinding, ObjectHandle};
use crate::client_manager::{ClientEvent, ClientEventHandler, ClientManager};
use crate::command::Command;
use crate::control::ControlRequest;
use crate::error::DebuggerError;
use crate::messages::{ClientErrorCode, ClientWarnCode, ContextState, ServerMessage};
use crate::options::{EngineOptions, HostedModule, SharedLoader};
use crate::queue::{BlockingQueue, QueueSignalHandler};
use crate::session::EngineSession;
use crate::types::{ClientId, ContextId};

/// Pending-action depth at which the sender is warned.
pub const DEFAULT_QUEUE_WARN_THRESHOLD: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistrySettings {
    /// Capacity of each session's action queue; `None` is unbounded.
    pub action_queue_capacity: Option<usize>,
    /// Warn the sender when this many actions are already pending. `0`
    /// disables the warning.
    pub queue_warn_threshold: usize,
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            action_queue_capacity: None,
            queue_warn_threshold: DEFAULT_QUEUE_WARN_THRESHOLD,
        }
    }
}

pub struct SessionRegistry {
    sessions: Mutex<BTreeMap<ContextId, Arc<EngineSession>>>,
    next_context_id: AtomicI32,
    clients: Arc<ClientManager>,
    settings: RegistrySettings,
    loader: SharedLoader,
}

impl SessionRegistry {
    /// Create a registry and subscribe it to `clients`' lifecycle events.
    pub fn new(
        clients: Arc<ClientManager>,
        settings: RegistrySettings,
        loader: SharedLoader,
    ) -> Arc<Self> {
        let registry = Arc::new(Self {
            sessions: Mutex::new(BTreeMap::new()),
            next_context_id: AtomicI32::new(1),
            clients,
            settings,
            loader,
        });
        let weak: Weak<SessionRegistry> = Arc::downgrade(&registry);
        let handler: Weak<dyn ClientEventHandler> = weak;
        registry.clients.add_event_handler(handler);
        registry
    }

    pub fn clients(&self) -> &Arc<ClientManager> {
        &self.clients
    }

    pub fn settings(&self) -> RegistrySettings {
        self.settings
    }

    /// Observer to install on every client's input queue.
    pub fn input_router(self: &Arc<Self>) -> Arc<InputRouter> {
        Arc::new(InputRouter(Arc::downgrade(self)))
    }

    // ------------------------------------------------------------------
    // Embedding API (engine thread)
    // ------------------------------------------------------------------

    /// Install a new session into `engine` under a fresh context id.
    pub fn install(
        &self,
        engine: &mut dyn EngineBinding,
        name: &str,
        options: EngineOptions,
        module: &HostedModule,
    ) -> Result<Arc<EngineSession>, DebuggerError> {
        if engine.context_tag().is_some() {
            return Err(DebuggerError::AlreadyInstalled);
        }

        let context_id = ContextId(self.next_context_id.fetch_add(1, Ordering::SeqCst));
        let session = EngineSession::new(
            context_id,
            name,
            options,
            self.settings.action_queue_capacity,
            Arc::clone(&self.clients),
            self.loader.clone(),
        );
        session.install(engine, module)?;

        self.lock().insert(context_id, Arc::clone(&session));
        info!(context_id = %context_id, name, "context registered");
        Ok(session)
    }

    /// Tear down the session installed in `engine`.
    ///
    /// The session leaves the registry even if its module's shutdown fails.
    pub fn uninstall(&self, engine: &mut dyn EngineBinding) -> Result<(), DebuggerError> {
        let session = self.session_for(engine).ok_or(DebuggerError::NotInstalled)?;
        self.lock().remove(&session.context_id());
        info!(context_id = %session.context_id(), "context unregistered");
        session.uninstall(engine)
    }

    /// Interrupt one session, or every session with `None`.
    pub fn interrupt(&self, context_id: Option<ContextId>) {
        match context_id {
            Some(id) => {
                if let Some(session) = self.session(id) {
                    session.interrupt();
                }
            }
            None => {
                for session in self.snapshot() {
                    session.interrupt();
                }
            }
        }
    }

    pub fn add_debuggee(
        &self,
        engine: &mut dyn EngineBinding,
        debuggee: ObjectHandle,
    ) -> Result<(), DebuggerError> {
        let session = self.session_for(engine).ok_or(DebuggerError::NotInstalled)?;
        session.register_debuggee(engine, debuggee)
    }

    pub fn remove_debuggee(
        &self,
        engine: &mut dyn EngineBinding,
        debuggee: ObjectHandle,
    ) -> Result<(), DebuggerError> {
        let session = self.session_for(engine).ok_or(DebuggerError::NotInstalled)?;
        session.unregister_debuggee(engine, debuggee)
    }

    /// Drain whatever is queued for `engine`'s session without blocking.
    pub fn handle_pending_commands(&self, engine: &mut dyn EngineBinding) -> Result<(), DebuggerError> {
        let session = self.session_for(engine).ok_or(DebuggerError::NotInstalled)?;
        if session.handle_pending(engine).is_err() {
            debug!(context_id = %session.context_id(), "pending commands interrupted");
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Lookup
    // ------------------------------------------------------------------

    pub fn session(&self, context_id: ContextId) -> Option<Arc<EngineSession>> {
        self.lock().get(&context_id).cloned()
    }

    /// Session installed in `engine`, found through its context tag.
    pub fn session_for(&self, engine: &dyn EngineBinding) -> Option<Arc<EngineSession>> {
        engine.context_tag().and_then(|id| self.session(id))
    }

    pub fn contexts(&self) -> Vec<ContextState> {
        self.lock()
            .values()
            .map(|s| ContextState::new(s.context_id(), s.name(), s.is_paused()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    // ------------------------------------------------------------------
    // Routing
    // ------------------------------------------------------------------

    /// Deliver one command decoded from `command.client_id`.
    pub fn route(&self, command: Command) {
        if command.context_id.is_none() {
            self.route_control(command);
            return;
        }

        match self.session(command.context_id) {
            Some(session) => self.enqueue(&session, command),
            None => {
                debug!(
                    client_id = %command.client_id,
                    context_id = %command.context_id,
                    "command for unknown context"
                );
                self.reply(
                    command.client_id,
                    ServerMessage::error(ClientErrorCode::UnknownContext, "Unknown JS Context."),
                );
                self.reply(command.client_id, ServerMessage::contexts_list(self.contexts()));
            }
        }
    }

    fn route_control(&self, command: Command) {
        let sender = command.client_id;
        match ControlRequest::parse(&command.payload) {
            Some(ControlRequest::Exit) => {
                debug!(client_id = %sender, "client asked to exit");
                if let Some(client) = self.clients.get_client(sender) {
                    client.disconnect();
                }
            }
            Some(ControlRequest::GetAvailableContexts) => {
                self.reply(sender, ServerMessage::contexts_list(self.contexts()));
            }
            Some(ControlRequest::GetVersion) => {
                self.reply(sender, ServerMessage::version(env!("CARGO_PKG_VERSION")));
            }
            None => {
                for session in self.snapshot() {
                    self.enqueue(&session, command.clone());
                }
            }
        }
    }

    fn enqueue(&self, session: &EngineSession, command: Command) {
        let sender = command.client_id;
        let pending = session.pending_actions();
        let threshold = self.settings.queue_warn_threshold;
        if threshold > 0 && pending >= threshold {
            self.reply(
                sender,
                ServerMessage::warn(
                    ClientWarnCode::QueueCongested,
                    format!(
                        "Debugger has at least {pending} pending commands for context {}; \
                         the context may be blocked outside the debugger.",
                        session.context_id()
                    ),
                ),
            );
        }

        if session.enqueue(Action::Command(command)).is_err() {
            error!(
                client_id = %sender,
                context_id = %session.context_id(),
                "action queue full, command dropped"
            );
        }
    }

    fn reply(&self, client_id: ClientId, message: ServerMessage) {
        let command = Command::control(client_id, message.to_json());
        if !self.clients.post_command(command) {
            debug!(client_id = %client_id, "reply not delivered");
        }
    }

    fn snapshot(&self) -> Vec<Arc<EngineSession>> {
        self.lock().values().cloned().collect()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<ContextId, Arc<EngineSession>>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl ClientEventHandler for SessionRegistry {
    fn handle(&self, manager: &ClientManager, event: ClientEvent) {
        match event {
            ClientEvent::Added(id) => {
                self.reply(id, ServerMessage::contexts_list(self.contexts()));
            }
            ClientEvent::Removed(id) => {
                if manager.client_count() > 0 {
                    return;
                }
                for session in self.snapshot() {
                    if session.options().continue_when_no_connections && session.is_paused() {
                        info!(
                            client_id = %id,
                            context_id = %session.context_id(),
                            "last client gone, resuming context"
                        );
                        if session.enqueue(Action::Continue).is_err() {
                            error!(context_id = %session.context_id(), "cannot queue continue");
                        }
                    }
                }
            }
            ClientEvent::MarkedToRemove(id) => {
                debug!(client_id = %id, "client marked for removal");
            }
        }
    }
}

impl std::fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("contexts", &self.lock().keys().collect::<Vec<_>>())
            .field("settings", &self.settings)
            .finish()
    }
}

/// Drains a client's input queue into the registry as soon as something
/// is enqueued.
pub struct InputRouter(Weak<SessionRegistry>);

impl QueueSignalHandler<Command> for InputRouter {
    fn handle(&self, queue: &BlockingQueue<Command>) {
        let Some(registry) = self.0.upgrade() else {
            warn!("input arrived after the registry was dropped");
            return;
        };
        while let Some(command) = queue.get() {
            registry.route(command);
        }
    }
}
