//! One remote debugger session, bound to exactly one execution context.
//!
//! The session owns the context's action queue. The network side only ever
//! *enqueues* [`Action`]s and pokes the engine's operation trigger; every
//! action is executed on the engine's own thread, either
//!
//! - inside the blocking command loop entered when the hosted module calls
//!   `waitForCommand` (a pause), or
//! - opportunistically from the engine's cooperative operation callback
//!   while the script is running normally.
//!
//! State machine: `uninstalled -> installed(idle) <-> paused -> uninstalled`.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, info, warn};

use crate::action::{Action, DebuggerStateHint};
use crate::binding::{EngineBinding, ObjectHandle, OperationCallback, OperationTrigger};
use crate::client_manager::ClientManager;
use crate::command::Command;
use crate::error::DebuggerError;
use crate::hosted::{DebuggerEvents, HostedDebugger};
use crate::messages::{ClientErrorCode, ServerMessage};
use crate::options::{EngineOptions, HostedModule, SharedLoader};
use crate::queue::{BlockingQueue, Interrupted};
use crate::types::{ClientId, ContextId};

pub struct EngineSession {
    name: String,
    hosted: HostedDebugger,
    actions: BlockingQueue<Action>,
    paused: AtomicBool,
    callback_suspensions: AtomicUsize,
    trigger: Mutex<Option<Arc<dyn OperationTrigger>>>,
    previous_callback: Mutex<Option<OperationCallback>>,
    clients: Arc<ClientManager>,
    loader: SharedLoader,
}

impl EngineSession {
    pub fn new(
        context_id: ContextId,
        name: impl Into<String>,
        options: EngineOptions,
        action_capacity: Option<usize>,
        clients: Arc<ClientManager>,
        loader: SharedLoader,
    ) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            hosted: HostedDebugger::new(context_id, options),
            actions: BlockingQueue::with_capacity(action_capacity),
            paused: AtomicBool::new(false),
            callback_suspensions: AtomicUsize::new(0),
            trigger: Mutex::new(None),
            previous_callback: Mutex::new(None),
            clients,
            loader,
        })
    }

    pub fn context_id(&self) -> ContextId {
        self.hosted.context_id()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn options(&self) -> &EngineOptions {
        self.hosted.options()
    }

    pub fn hosted(&self) -> &HostedDebugger {
        &self.hosted
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// Number of actions waiting to be executed.
    pub fn pending_actions(&self) -> usize {
        self.actions.len()
    }

    // ------------------------------------------------------------------
    // Install / uninstall (engine thread)
    // ------------------------------------------------------------------

    /// Install the hosted module and hook the operation callback.
    pub fn install(
        self: &Arc<Self>,
        engine: &mut dyn EngineBinding,
        module: &HostedModule,
    ) -> Result<(), DebuggerError> {
        let events: Arc<dyn DebuggerEvents> = Arc::clone(self) as Arc<dyn DebuggerEvents>;
        self.hosted.install(engine, module, events)?;

        *lock(&self.trigger) = Some(engine.operation_trigger());

        let session = Arc::downgrade(self);
        let callback: OperationCallback = Box::new(move |engine: &mut dyn EngineBinding| {
            match session.upgrade() {
                Some(session) => session.on_operation_callback(engine),
                None => true,
            }
        });
        *lock(&self.previous_callback) = engine.set_operation_callback(Some(callback));

        info!(context_id = %self.context_id(), name = %self.name, "session installed");
        Ok(())
    }

    /// Restore the previous operation callback and shut the module down.
    ///
    /// The action queue is interrupted first, so nothing can wait on this
    /// session again.
    pub fn uninstall(&self, engine: &mut dyn EngineBinding) -> Result<(), DebuggerError> {
        if !self.hosted.is_installed() {
            return Err(DebuggerError::NotInstalled);
        }
        self.actions.interrupt();

        let previous = lock(&self.previous_callback).take();
        drop(engine.set_operation_callback(previous));
        lock(&self.trigger).take();

        let result = self.hosted.uninstall(engine);
        info!(context_id = %self.context_id(), name = %self.name, "session uninstalled");
        result
    }

    pub fn register_debuggee(
        &self,
        engine: &mut dyn EngineBinding,
        debuggee: ObjectHandle,
    ) -> Result<(), DebuggerError> {
        let _suspended = self.suspend_callback();
        self.hosted.register_debuggee(engine, debuggee)
    }

    pub fn unregister_debuggee(
        &self,
        engine: &mut dyn EngineBinding,
        debuggee: ObjectHandle,
    ) -> Result<(), DebuggerError> {
        let _suspended = self.suspend_callback();
        self.hosted.unregister_debuggee(engine, debuggee)
    }

    // ------------------------------------------------------------------
    // Action queue (any thread)
    // ------------------------------------------------------------------

    /// Queue an action and poke the engine. A full queue returns it.
    pub fn enqueue(&self, action: Action) -> Result<(), Action> {
        self.actions.add(action)?;
        if let Some(trigger) = lock(&self.trigger).clone() {
            trigger.trigger();
        }
        Ok(())
    }

    /// Make any current or future wait on this session fail.
    pub fn interrupt(&self) {
        debug!(context_id = %self.context_id(), "session interrupted");
        self.actions.interrupt();
    }

    pub fn is_interrupted(&self) -> bool {
        self.actions.is_interrupted()
    }

    // ------------------------------------------------------------------
    // Command loop (engine thread)
    // ------------------------------------------------------------------

    /// Execute queued actions on the calling engine thread.
    ///
    /// With `block` set the loop waits for actions until one resumes
    /// execution; otherwise it only drains what is already queued. When no
    /// client is connected and the session continues without connections,
    /// nothing is drained unless `suspended` is set.
    pub fn command_loop(
        &self,
        engine: &mut dyn EngineBinding,
        block: bool,
        suspended: bool,
    ) -> Result<(), Interrupted> {
        // `paused` is published before the client count is read: a client
        // manager that removes the last client afterwards sees the pause
        // and queues a Continue.
        self.paused.store(block, Ordering::SeqCst);
        let do_not_pause =
            self.clients.client_count() == 0 && self.options().continue_when_no_connections;
        if !suspended && do_not_pause {
            self.paused.store(false, Ordering::SeqCst);
            let stale = self
                .actions
                .retain(|action| !matches!(action, Action::Continue));
            if stale > 0 {
                debug!(context_id = %self.context_id(), stale, "dropped stale continue");
            }
            return Ok(());
        }

        let _suspended = self.suspend_callback();
        let result = self.drain(engine, block);
        self.paused.store(false, Ordering::SeqCst);
        result
    }

    /// Non-blocking drain, for engines without a cooperative callback.
    pub fn handle_pending(&self, engine: &mut dyn EngineBinding) -> Result<(), Interrupted> {
        self.command_loop(engine, false, false)
    }

    fn drain(&self, engine: &mut dyn EngineBinding, mut block: bool) -> Result<(), Interrupted> {
        loop {
            let action = if block {
                self.actions.pop()?
            } else {
                match self.actions.get() {
                    Some(action) => action,
                    None => return Ok(()),
                }
            };

            if matches!(action, Action::Continue) && self.clients.client_count() > 0 {
                debug!(context_id = %self.context_id(), "client connected again, continue dropped");
                continue;
            }

            let origin = action.origin();
            let result = action.execute(self, engine);
            if !result.is_ok() {
                self.report_failure(origin);
            }

            match result.hint {
                DebuggerStateHint::Continue => {
                    block = false;
                    self.paused.store(false, Ordering::SeqCst);
                }
                DebuggerStateHint::Interrupted => return Err(Interrupted),
                DebuggerStateHint::Ignore => {}
            }
        }
    }

    fn report_failure(&self, origin: Option<ClientId>) {
        let message = ServerMessage::error(
            ClientErrorCode::CommandFailed,
            "Cannot execute debugger command.",
        );
        let recipient = origin.unwrap_or(ClientId::BROADCAST);
        let command = Command::new(recipient, self.context_id(), message.to_json());
        if !self.clients.send_command(command) {
            debug!(client_id = %recipient, "failure report not delivered");
        }
    }

    fn on_operation_callback(&self, engine: &mut dyn EngineBinding) -> bool {
        if self.callback_suspensions.load(Ordering::SeqCst) == 0 {
            if let Err(Interrupted) = self.command_loop(engine, false, false) {
                debug!(context_id = %self.context_id(), "drain interrupted");
            }
        }

        let previous = lock(&self.previous_callback).take();
        match previous {
            Some(mut callback) => {
                let keep_running = callback(engine);
                let mut slot = lock(&self.previous_callback);
                if slot.is_none() {
                    *slot = Some(callback);
                }
                keep_running
            }
            None => true,
        }
    }

    fn suspend_callback(&self) -> CallbackSuspension<'_> {
        self.callback_suspensions.fetch_add(1, Ordering::SeqCst);
        CallbackSuspension(&self.callback_suspensions)
    }
}

impl DebuggerEvents for EngineSession {
    fn load_script(&self, name: &str) -> Option<String> {
        self.loader.load(name)
    }

    fn send_command(&self, client_id: ClientId, context_id: ContextId, payload: String) -> bool {
        self.clients
            .send_command(Command::new(client_id, context_id, payload))
    }

    fn wait_for_command(&self, engine: &mut dyn EngineBinding, suspended: bool) -> bool {
        match self.command_loop(engine, true, suspended) {
            Ok(()) => true,
            Err(Interrupted) => {
                warn!(context_id = %self.context_id(), "command loop interrupted");
                false
            }
        }
    }
}

impl std::fmt::Debug for EngineSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineSession")
            .field("context_id", &self.context_id())
            .field("name", &self.name)
            .field("paused", &self.is_paused())
            .field("pending_actions", &self.pending_actions())
            .finish()
    }
}

/// Keeps the operation callback from draining while alive.
struct CallbackSuspension<'a>(&'a AtomicUsize);

impl Drop for CallbackSuspension<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::Client;
    use crate::sandbox::SandboxEngine;
    use serde_json::{json, Value};

    fn session_with_client(options: EngineOptions) -> (Arc<EngineSession>, Arc<ClientManager>, SandboxEngine) {
        let clients = Arc::new(ClientManager::new(8));
        clients.add_client(Client::new(ClientId(1), 64)).unwrap();
        let session = EngineSession::new(
            ContextId(1),
            "test",
            options,
            None,
            Arc::clone(&clients),
            SharedLoader::none(),
        );
        let mut engine = SandboxEngine::new("main.sbx", "print hello");
        session
            .install(&mut engine, &SandboxEngine::hosted_module())
            .unwrap();
        (session, clients, engine)
    }

    fn drain_replies(clients: &ClientManager, id: ClientId) -> Vec<Value> {
        let client = clients.get_client(id).unwrap();
        let mut out = Vec::new();
        while let Some(cmd) = client.out_queue().get() {
            out.push(serde_json::from_str(&cmd.payload).unwrap());
        }
        out
    }

    #[test]
    fn install_tags_context_and_rejects_second_install() {
        let (session, clients, mut engine) = session_with_client(EngineOptions::new());
        assert_eq!(engine.context_tag(), Some(ContextId(1)));
        assert!(session.hosted().is_installed());

        let again = EngineSession::new(
            ContextId(2),
            "again",
            EngineOptions::new(),
            None,
            clients,
            SharedLoader::none(),
        );
        assert!(matches!(
            again.install(&mut engine, &SandboxEngine::hosted_module()),
            Err(DebuggerError::AlreadyInstalled)
        ));
    }

    #[test]
    fn non_blocking_drain_executes_queued_commands() {
        let (session, clients, mut engine) = session_with_client(EngineOptions::new());
        session
            .enqueue(Action::Command(Command::new(
                ClientId(1),
                ContextId(1),
                json!({"command": "where"}).to_string(),
            )))
            .unwrap();

        session.handle_pending(&mut engine).unwrap();
        assert_eq!(session.pending_actions(), 0);

        let replies = drain_replies(&clients, ClientId(1));
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0]["type"], "response");
        assert_eq!(replies[0]["command"], "where");
    }

    #[test]
    fn failed_command_reports_error_to_origin() {
        let (session, clients, mut engine) = session_with_client(EngineOptions::new());
        session
            .enqueue(Action::Command(Command::new(ClientId(1), ContextId(1), "not json")))
            .unwrap();
        session.handle_pending(&mut engine).unwrap();

        let replies = drain_replies(&clients, ClientId(1));
        assert_eq!(
            replies,
            vec![json!({"type": "error", "code": 1, "message": "Cannot execute debugger command."})]
        );
    }

    #[test]
    fn blocking_loop_stops_at_continue() {
        let (session, _clients, mut engine) = session_with_client(EngineOptions::new());
        session.enqueue(Action::Command(Command::new(
            ClientId(1),
            ContextId(1),
            json!({"command": "where"}).to_string(),
        ))).unwrap();
        session.enqueue(Action::Command(Command::new(
            ClientId(1),
            ContextId(1),
            json!({"command": "continue"}).to_string(),
        ))).unwrap();

        assert!(session.wait_for_command(&mut engine, false));
        assert!(!session.is_paused());
        assert_eq!(session.pending_actions(), 0);
    }

    #[test]
    fn forced_continue_is_ignored_once_a_client_is_back() {
        let (session, clients, mut engine) =
            session_with_client(EngineOptions::new().continue_when_no_connections(true));
        session.enqueue(Action::Continue).unwrap();
        session.enqueue(Action::Command(Command::new(
            ClientId(1),
            ContextId(1),
            json!({"command": "where"}).to_string(),
        ))).unwrap();
        session.enqueue(Action::Command(Command::new(
            ClientId(1),
            ContextId(1),
            json!({"command": "continue"}).to_string(),
        ))).unwrap();

        assert!(session.wait_for_command(&mut engine, false));
        assert_eq!(session.pending_actions(), 0);

        // The loop only ended at the client's own continue.
        let replies = drain_replies(&clients, ClientId(1));
        let commands: Vec<&Value> = replies.iter().map(|r| &r["command"]).collect();
        assert_eq!(commands, [&json!("where"), &json!("continue")]);
    }

    #[test]
    fn interrupted_session_never_waits_again() {
        let (session, _clients, mut engine) = session_with_client(EngineOptions::new());
        session.interrupt();
        assert!(!session.wait_for_command(&mut engine, true));
        assert!(session.is_interrupted());
    }

    #[test]
    fn no_clients_with_continue_policy_skips_pause() {
        let clients = Arc::new(ClientManager::new(8));
        let session = EngineSession::new(
            ContextId(3),
            "lonely",
            EngineOptions::new().continue_when_no_connections(true),
            None,
            clients,
            SharedLoader::none(),
        );
        let mut engine = SandboxEngine::new("main.sbx", "");
        session
            .install(&mut engine, &SandboxEngine::hosted_module())
            .unwrap();

        // Would block forever if the policy were ignored.
        assert!(session.wait_for_command(&mut engine, false));
    }

    #[test]
    fn continue_left_behind_by_last_client_is_dropped() {
        let (session, clients, mut engine) =
            session_with_client(EngineOptions::new().continue_when_no_connections(true));
        clients.remove_client(ClientId(1));
        session.enqueue(Action::Continue).unwrap();

        assert!(session.wait_for_command(&mut engine, false));
        assert_eq!(session.pending_actions(), 0);
        assert!(!session.is_paused());
    }

    #[test]
    fn uninstall_restores_engine_state() {
        let (session, _clients, mut engine) = session_with_client(EngineOptions::new());
        session.uninstall(&mut engine).unwrap();
        assert_eq!(engine.context_tag(), None);
        assert!(!engine.has_operation_callback());
        assert!(matches!(
            session.uninstall(&mut engine),
            Err(DebuggerError::NotInstalled)
        ));
    }
}
