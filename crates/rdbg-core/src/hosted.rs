//! Installs the hosted debugger module into one execution context.
//!
//! [`HostedDebugger`] is the engine-facing half of a debugger: it builds
//! the debug scope, defines the host primitives the module relies on,
//! evaluates the module, and afterwards forwards commands to it. How
//! commands arrive and where replies go is decided by the owner through
//! [`DebuggerEvents`] (the remote [`EngineSession`](crate::session::EngineSession)
//! or the in-process [`LocalDebugger`](crate::local::LocalDebugger)).
//!
//! Host primitives defined in the scope:
//!
//! | name               | arguments              | result                          |
//! |--------------------|------------------------|---------------------------------|
//! | `print`            | any                    | undefined                       |
//! | `loadScriptSource` | name                   | source string or `null`         |
//! | `stringify`        | value                  | JSON text                       |
//! | `parse`            | JSON text              | value                           |
//! | `waitForCommand`   | suspended flag         | `2` continue, `1` interrupted   |
//! | `sendCommand`      | client id, value       | `true` or a script exception    |

use std::sync::{Arc, Mutex, PoisonError};

use serde_json::Value;
use tracing::{debug, error, info};

use crate::action::DebuggerStateHint;
use crate::binding::{
    host_function, EngineBinding, HostFunction, ModuleId, ObjectHandle, ScopeId,
    ScriptValue,
};
use crate::error::{BindingError, DebuggerError};
use crate::options::{EngineOptions, HostedModule};
use crate::types::{ClientId, ContextId};

/// `waitForCommand` result: the loop was interrupted.
pub const WAIT_RESULT_INTERRUPTED: i32 = 1;
/// `waitForCommand` result: resume execution.
pub const WAIT_RESULT_CONTINUE: i32 = 2;

pub const EXPORT_HANDLE_COMMAND: &str = "handleCommand";
pub const EXPORT_SHUTDOWN: &str = "shutdown";
pub const EXPORT_ADD_DEBUGGEE: &str = "addDebuggee";
pub const EXPORT_REMOVE_DEBUGGEE: &str = "removeDebuggee";

/// Upward interface of a hosted debugger.
pub trait DebuggerEvents: Send + Sync {
    /// Source for a script the module asked for by name.
    fn load_script(&self, name: &str) -> Option<String>;

    /// Deliver a module-authored payload to a client.
    fn send_command(&self, client_id: ClientId, context_id: ContextId, payload: String) -> bool;

    /// Block until told to resume. `false` means interrupted.
    fn wait_for_command(&self, engine: &mut dyn EngineBinding, suspended: bool) -> bool;
}

#[derive(Debug, Clone, Copy)]
struct Installed {
    scope: ScopeId,
    module: ModuleId,
}

#[derive(Debug)]
pub struct HostedDebugger {
    context_id: ContextId,
    options: EngineOptions,
    installed: Mutex<Option<Installed>>,
}

impl HostedDebugger {
    pub fn new(context_id: ContextId, options: EngineOptions) -> Self {
        Self {
            context_id,
            options,
            installed: Mutex::new(None),
        }
    }

    pub fn context_id(&self) -> ContextId {
        self.context_id
    }

    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    pub fn is_installed(&self) -> bool {
        self.current().is_some()
    }

    /// Build the debug scope and evaluate `module` inside it.
    ///
    /// Tags the context with this debugger's id on success. Any failure
    /// after the scope exists releases it again.
    pub fn install(
        &self,
        engine: &mut dyn EngineBinding,
        module: &HostedModule,
        events: Arc<dyn DebuggerEvents>,
    ) -> Result<(), DebuggerError> {
        if engine.context_tag().is_some() || self.is_installed() {
            return Err(DebuggerError::AlreadyInstalled);
        }

        let scope = engine
            .create_debug_scope()
            .map_err(DebuggerError::CannotCreateScope)?;

        let installed = self
            .populate_scope(engine, scope, module, events)
            .map(|module| Installed { scope, module });

        match installed {
            Ok(installed) => {
                *self.lock() = Some(installed);
                engine.set_context_tag(Some(self.context_id));
                info!(context_id = %self.context_id, file = %module.file_name, "hosted debugger installed");
                Ok(())
            }
            Err(err) => {
                engine.release_debug_scope(scope);
                Err(err)
            }
        }
    }

    fn populate_scope(
        &self,
        engine: &mut dyn EngineBinding,
        scope: ScopeId,
        module: &HostedModule,
        events: Arc<dyn DebuggerEvents>,
    ) -> Result<ModuleId, DebuggerError> {
        engine
            .init_standard_library(scope)
            .map_err(DebuggerError::CannotInitStandardLibrary)?;

        for (name, function) in host_functions(self.context_id, events) {
            engine
                .define_host_function(scope, name, function)
                .map_err(|source| DebuggerError::CannotDefineFunction { name, source })?;
        }

        engine
            .set_scope_property(scope, "options", self.options.to_script_value().into())
            .map_err(|source| DebuggerError::CannotSetProperty {
                name: "options",
                source,
            })?;

        engine
            .evaluate_script(scope, &module.source, &module.file_name)
            .map_err(DebuggerError::CannotEvaluateModule)
    }

    /// Run the module's shutdown export and release the scope.
    ///
    /// The scope is released and the context untagged even when shutdown
    /// raises; the error is still reported.
    pub fn uninstall(&self, engine: &mut dyn EngineBinding) -> Result<(), DebuggerError> {
        let installed = self.lock().take().ok_or(DebuggerError::NotInstalled)?;

        let shutdown = engine.call_export(installed.module, EXPORT_SHUTDOWN, &[]);
        engine.release_debug_scope(installed.scope);
        engine.set_context_tag(None);

        match shutdown {
            Ok(_) => {
                info!(context_id = %self.context_id, "hosted debugger uninstalled");
                Ok(())
            }
            Err(err) => {
                error!(context_id = %self.context_id, error = %err, "hosted debugger shutdown raised");
                Err(DebuggerError::ShutdownFailed(err))
            }
        }
    }

    /// Parse `payload` and hand it to the module's command handler.
    pub fn send_command(
        &self,
        engine: &mut dyn EngineBinding,
        client_id: ClientId,
        payload: &str,
    ) -> Result<DebuggerStateHint, DebuggerError> {
        let installed = self.current().ok_or(DebuggerError::NotInstalled)?;
        let parsed: Value = serde_json::from_str(payload)?;

        let result = engine
            .call_export(
                installed.module,
                EXPORT_HANDLE_COMMAND,
                &[ScriptValue::from(client_id.0), ScriptValue::Json(parsed)],
            )
            .map_err(|err| {
                error!(
                    context_id = %self.context_id,
                    client_id = %client_id,
                    error = %err,
                    "hosted debugger failed to handle command"
                );
                DebuggerError::DispatchFailed(err)
            })?;

        let hint = result
            .as_i64()
            .and_then(DebuggerStateHint::from_i64)
            .unwrap_or_else(|| {
                debug!(context_id = %self.context_id, result = ?result, "no state hint, ignoring");
                DebuggerStateHint::Ignore
            });
        Ok(hint)
    }

    pub fn register_debuggee(
        &self,
        engine: &mut dyn EngineBinding,
        debuggee: ObjectHandle,
    ) -> Result<(), DebuggerError> {
        let installed = self.current().ok_or(DebuggerError::NotInstalled)?;
        engine
            .call_export(installed.module, EXPORT_ADD_DEBUGGEE, &[debuggee.into()])
            .map(|_| ())
            .map_err(DebuggerError::CannotRegisterDebuggee)
    }

    pub fn unregister_debuggee(
        &self,
        engine: &mut dyn EngineBinding,
        debuggee: ObjectHandle,
    ) -> Result<(), DebuggerError> {
        let installed = self.current().ok_or(DebuggerError::NotInstalled)?;
        engine
            .call_export(installed.module, EXPORT_REMOVE_DEBUGGEE, &[debuggee.into()])
            .map(|_| ())
            .map_err(DebuggerError::CannotUnregisterDebuggee)
    }

    fn current(&self) -> Option<Installed> {
        *self.lock()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<Installed>> {
        self.installed.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

// ----------------------------------------------------------------------
// Host primitives
// ----------------------------------------------------------------------

fn host_functions(
    context_id: ContextId,
    events: Arc<dyn DebuggerEvents>,
) -> Vec<(&'static str, HostFunction)> {
    let print: HostFunction = host_function(move |_engine, args| {
        let line = args.iter().map(display_value).collect::<Vec<_>>().join(" ");
        info!(target: "rdbg::script", context_id = %context_id, "{line}");
        Ok(ScriptValue::Undefined)
    });

    let loader = Arc::clone(&events);
    let load_script_source: HostFunction = host_function(move |_engine, args| {
        let name = args
            .first()
            .and_then(ScriptValue::as_str)
            .ok_or_else(|| BindingError::Exception("loadScriptSource: expected a file name".into()))?;
        Ok(match loader.load_script(name) {
            Some(source) => ScriptValue::from(source),
            None => ScriptValue::Json(Value::Null),
        })
    });

    let stringify: HostFunction = host_function(|_engine, args| match args.first() {
        None | Some(ScriptValue::Undefined) => Ok(ScriptValue::Undefined),
        Some(value) => stringify_value(value).map(ScriptValue::from),
    });

    let parse: HostFunction = host_function(|_engine, args| {
        let text = args
            .first()
            .and_then(ScriptValue::as_str)
            .ok_or_else(|| BindingError::Exception("parse: expected a string".into()))?;
        serde_json::from_str::<Value>(text)
            .map(ScriptValue::Json)
            .map_err(|e| BindingError::Exception(format!("parse: {e}")))
    });

    let waiter = Arc::clone(&events);
    let wait_for_command: HostFunction = host_function(move |engine, args| {
        let suspended = args.first().map(ScriptValue::is_truthy).unwrap_or(false);
        let result = if waiter.wait_for_command(engine, suspended) {
            WAIT_RESULT_CONTINUE
        } else {
            WAIT_RESULT_INTERRUPTED
        };
        Ok(ScriptValue::from(result))
    });

    let sender = events;
    let send_command: HostFunction = host_function(move |_engine, args| {
        let client_id = args
            .first()
            .and_then(ScriptValue::as_i64)
            .and_then(|id| i32::try_from(id).ok())
            .map(ClientId)
            .ok_or_else(|| BindingError::Exception("sendCommand: expected a client id".into()))?;
        let payload = match args.get(1) {
            Some(ScriptValue::Json(Value::String(s))) => s.clone(),
            Some(value) => stringify_value(value)?,
            None => return Err(BindingError::Exception("sendCommand: missing command".into())),
        };
        if sender.send_command(client_id, context_id, payload) {
            Ok(ScriptValue::from(true))
        } else {
            Err(BindingError::Exception(
                "Cannot send command, probably client has already been disconnected.".into(),
            ))
        }
    });

    vec![
        ("print", print),
        ("loadScriptSource", load_script_source),
        ("stringify", stringify),
        ("parse", parse),
        ("waitForCommand", wait_for_command),
        ("sendCommand", send_command),
    ]
}

fn stringify_value(value: &ScriptValue) -> Result<String, BindingError> {
    match value {
        ScriptValue::Json(v) => Ok(v.to_string()),
        ScriptValue::Undefined => Ok("undefined".to_string()),
        ScriptValue::Object(_) => Err(BindingError::Exception(
            "stringify: engine objects have no JSON form".into(),
        )),
    }
}

fn display_value(value: &ScriptValue) -> String {
    match value {
        ScriptValue::Json(Value::String(s)) => s.clone(),
        ScriptValue::Json(v) => v.to_string(),
        ScriptValue::Undefined => "undefined".to_string(),
        ScriptValue::Object(handle) => format!("[object #{}]", handle.0),
    }
}
