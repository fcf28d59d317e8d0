//! A tiny line-oriented script engine implementing [`EngineBinding`].
//!
//! The sandbox exists so the debugger can be exercised end to end without
//! linking a real script engine: the demo server runs sandbox scripts and
//! the scenario tests drive it on real threads.
//!
//! Script language, one statement per line:
//!
//! ```text
//! # comment
//! print <text>     append <text> to the output
//! debugger         pause unconditionally (when a debugger is attached)
//! yield            run the operation callback now
//! ```
//!
//! The hosted debugger module is native (see [`module`]); the module
//! source handed to `evaluate_script` is not interpreted.

mod module;

pub use module::PauseReason;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde_json::{json, Value};
use tracing::debug;

use crate::binding::{
    EngineBinding, HostFunction, ModuleId, ObjectHandle, OperationCallback, OperationTrigger,
    ScopeId, ScriptValue,
};
use crate::error::BindingError;
use crate::hosted::{
    EXPORT_ADD_DEBUGGEE, EXPORT_HANDLE_COMMAND, EXPORT_REMOVE_DEBUGGEE, EXPORT_SHUTDOWN,
    WAIT_RESULT_CONTINUE,
};
use crate::options::HostedModule;
use crate::types::{ClientId, ContextId};

use self::module::{DebuggerModule, ScriptView};

/// Install step the sandbox should refuse, for exercising failure paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePoint {
    CreateScope,
    StandardLibrary,
    DefineFunction,
    Evaluate,
    Shutdown,
}

/// How a call to [`SandboxEngine::run`] ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Completed,
    /// A debugger wait was interrupted or the operation callback asked to stop.
    Aborted,
}

#[derive(Debug, Default)]
pub struct SandboxTrigger {
    requested: AtomicBool,
}

impl SandboxTrigger {
    fn take(&self) -> bool {
        self.requested.swap(false, Ordering::SeqCst)
    }
}

impl OperationTrigger for SandboxTrigger {
    fn trigger(&self) {
        self.requested.store(true, Ordering::SeqCst);
    }
}

#[derive(Default)]
struct SandboxScope {
    standard_library: bool,
    functions: BTreeMap<String, HostFunction>,
    properties: BTreeMap<String, ScriptValue>,
}

pub struct SandboxEngine {
    file_name: String,
    statements: Vec<String>,
    position: usize,
    output: Vec<String>,
    global: ObjectHandle,
    next_handle: u64,
    scopes: BTreeMap<ScopeId, SandboxScope>,
    modules: BTreeMap<ModuleId, DebuggerModule>,
    operation_callback: Option<OperationCallback>,
    trigger: Arc<SandboxTrigger>,
    tag: Option<ContextId>,
    failure: Option<FailurePoint>,
}

impl SandboxEngine {
    pub fn new(file_name: impl Into<String>, source: &str) -> Self {
        Self {
            file_name: file_name.into(),
            statements: source.lines().map(|l| l.trim().to_string()).collect(),
            position: 0,
            output: Vec::new(),
            global: ObjectHandle(1),
            next_handle: 2,
            scopes: BTreeMap::new(),
            modules: BTreeMap::new(),
            operation_callback: None,
            trigger: Arc::new(SandboxTrigger::default()),
            tag: None,
            failure: None,
        }
    }

    /// Make one install step fail.
    pub fn fail_at(mut self, point: FailurePoint) -> Self {
        self.failure = Some(point);
        self
    }

    /// Module descriptor to install into a sandbox.
    pub fn hosted_module() -> HostedModule {
        HostedModule::new("sandbox_dbg.js", "// native sandbox debugger")
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    /// The script's global object, to be registered as debuggee.
    pub fn global(&self) -> ObjectHandle {
        self.global
    }

    pub fn output(&self) -> &[String] {
        &self.output
    }

    /// Index of the next statement to execute.
    pub fn position(&self) -> usize {
        self.position
    }

    pub fn has_operation_callback(&self) -> bool {
        self.operation_callback.is_some()
    }

    pub fn scope_count(&self) -> usize {
        self.scopes.len()
    }

    /// Execute the remaining statements.
    pub fn run(&mut self) -> Result<RunOutcome, BindingError> {
        while self.position < self.statements.len() {
            if self.trigger.take() && !self.run_operation_callback() {
                return Ok(RunOutcome::Aborted);
            }

            let statement = self.statements[self.position].clone();
            if let Some((module, reason)) = self.pause_reason(&statement) {
                if !self.pause(module, reason)? {
                    return Ok(RunOutcome::Aborted);
                }
            }

            if !self.execute(&statement) {
                return Ok(RunOutcome::Aborted);
            }
            self.position += 1;
        }
        Ok(RunOutcome::Completed)
    }

    fn execute(&mut self, statement: &str) -> bool {
        if let Some(text) = statement.strip_prefix("print ") {
            self.output.push(text.to_string());
        } else if statement == "yield" {
            return self.run_operation_callback();
        }
        true
    }

    fn run_operation_callback(&mut self) -> bool {
        let Some(mut callback) = self.operation_callback.take() else {
            return true;
        };
        let keep_running = callback(self);
        if self.operation_callback.is_none() {
            self.operation_callback = Some(callback);
        }
        keep_running
    }

    fn pause_reason(&mut self, statement: &str) -> Option<(ModuleId, PauseReason)> {
        let position = self.position;
        self.modules
            .iter_mut()
            .find_map(|(id, module)| module.pause_reason(position, statement).map(|r| (*id, r)))
    }

    /// Report the pause to every client and wait for the debugger.
    fn pause(&mut self, module: ModuleId, reason: PauseReason) -> Result<bool, BindingError> {
        let (scope, line) = match self.modules.get(&module) {
            Some(m) => (m.scope, m.display_line(self.position)),
            None => return Ok(true),
        };
        debug!(file = %self.file_name, line, reason = reason.as_str(), "sandbox paused");

        let event = json!({
            "type": "event",
            "event": "paused",
            "reason": reason.as_str(),
            "file": self.file_name,
            "line": line,
        });
        self.call_host(
            scope,
            "sendCommand",
            &[ScriptValue::from(ClientId::BROADCAST.0), event.into()],
        )?;

        let suspended = reason == PauseReason::Suspended;
        let result = self.call_host(scope, "waitForCommand", &[suspended.into()])?;
        Ok(result.as_i64() == Some(WAIT_RESULT_CONTINUE as i64))
    }

    fn call_host(
        &mut self,
        scope: ScopeId,
        name: &str,
        args: &[ScriptValue],
    ) -> Result<ScriptValue, BindingError> {
        let function = self
            .scopes
            .get(&scope)
            .ok_or(BindingError::UnknownScope(scope.0))?
            .functions
            .get(name)
            .cloned()
            .ok_or_else(|| BindingError::Exception(format!("{name} is not defined")))?;
        function(self, args)
    }

    fn handle_command(
        &mut self,
        module: ModuleId,
        args: &[ScriptValue],
    ) -> Result<ScriptValue, BindingError> {
        let client_id = args
            .first()
            .and_then(ScriptValue::as_i64)
            .ok_or_else(|| BindingError::Exception("handleCommand: client id missing".into()))?;
        let command = args
            .get(1)
            .and_then(ScriptValue::as_json)
            .cloned()
            .unwrap_or(Value::Null);

        let view = ScriptView {
            file_name: &self.file_name,
            statements: &self.statements,
            position: self.position,
            output: &self.output,
        };
        let state = self
            .modules
            .get_mut(&module)
            .ok_or_else(|| BindingError::Exception("debugger module was released".into()))?;
        let scope = state.scope;
        let mut handled = state.handle(&command, view)?;

        if let Some(file) = handled.load_request.take() {
            let source = self.call_host(scope, "loadScriptSource", &[file.as_str().into()])?;
            if let Value::Object(reply) = &mut handled.reply {
                reply.insert(
                    "source".to_string(),
                    source.as_json().cloned().unwrap_or(Value::Null),
                );
            }
        }

        self.call_host(
            scope,
            "sendCommand",
            &[ScriptValue::from(client_id), handled.reply.into()],
        )?;
        Ok(ScriptValue::from(handled.hint as i32))
    }

    fn allocate(&mut self) -> u64 {
        let handle = self.next_handle;
        self.next_handle += 1;
        handle
    }

    fn check(&self, point: FailurePoint) -> Result<(), BindingError> {
        if self.failure == Some(point) {
            return Err(BindingError::Engine(format!("injected failure at {point:?}")));
        }
        Ok(())
    }
}

impl EngineBinding for SandboxEngine {
    fn create_debug_scope(&mut self) -> Result<ScopeId, BindingError> {
        self.check(FailurePoint::CreateScope)?;
        let scope = ScopeId(self.allocate());
        self.scopes.insert(scope, SandboxScope::default());
        Ok(scope)
    }

    fn init_standard_library(&mut self, scope: ScopeId) -> Result<(), BindingError> {
        self.check(FailurePoint::StandardLibrary)?;
        let scope = self
            .scopes
            .get_mut(&scope)
            .ok_or(BindingError::UnknownScope(scope.0))?;
        scope.standard_library = true;
        Ok(())
    }

    fn define_host_function(
        &mut self,
        scope: ScopeId,
        name: &str,
        function: HostFunction,
    ) -> Result<(), BindingError> {
        self.check(FailurePoint::DefineFunction)?;
        let scope = self
            .scopes
            .get_mut(&scope)
            .ok_or(BindingError::UnknownScope(scope.0))?;
        scope.functions.insert(name.to_string(), function);
        Ok(())
    }

    fn set_scope_property(
        &mut self,
        scope: ScopeId,
        name: &str,
        value: ScriptValue,
    ) -> Result<(), BindingError> {
        let scope = self
            .scopes
            .get_mut(&scope)
            .ok_or(BindingError::UnknownScope(scope.0))?;
        scope.properties.insert(name.to_string(), value);
        Ok(())
    }

    fn evaluate_script(
        &mut self,
        scope: ScopeId,
        _source: &str,
        file_name: &str,
    ) -> Result<ModuleId, BindingError> {
        self.check(FailurePoint::Evaluate)
            .map_err(|_| BindingError::Exception(format!("SyntaxError in {file_name}")))?;
        let state = self
            .scopes
            .get(&scope)
            .ok_or(BindingError::UnknownScope(scope.0))?;
        if !state.standard_library {
            return Err(BindingError::Exception("JSON is not defined".into()));
        }
        let options = state.properties.get("options").and_then(ScriptValue::as_json);
        let module = DebuggerModule::new(scope, options);

        let id = ModuleId(self.allocate());
        self.modules.insert(id, module);
        Ok(id)
    }

    fn call_export(
        &mut self,
        module: ModuleId,
        name: &str,
        args: &[ScriptValue],
    ) -> Result<ScriptValue, BindingError> {
        if !self.modules.contains_key(&module) {
            return Err(BindingError::Exception("debugger module was released".into()));
        }
        match name {
            EXPORT_HANDLE_COMMAND => self.handle_command(module, args),
            EXPORT_SHUTDOWN => {
                self.check(FailurePoint::Shutdown)
                    .map_err(|e| BindingError::Exception(e.to_string()))?;
                if let Some(state) = self.modules.get_mut(&module) {
                    state.shutdown();
                }
                Ok(ScriptValue::Undefined)
            }
            EXPORT_ADD_DEBUGGEE | EXPORT_REMOVE_DEBUGGEE => {
                let debuggee = args
                    .first()
                    .and_then(ScriptValue::as_object)
                    .ok_or_else(|| BindingError::Exception(format!("{name}: expected an object")))?;
                let Some(state) = self.modules.get_mut(&module) else {
                    return Ok(ScriptValue::Undefined);
                };
                if name == EXPORT_ADD_DEBUGGEE {
                    state.add_debuggee(debuggee);
                } else {
                    state.remove_debuggee(debuggee)?;
                }
                Ok(ScriptValue::Undefined)
            }
            other => Err(BindingError::MissingExport(other.to_string())),
        }
    }

    fn release_debug_scope(&mut self, scope: ScopeId) {
        self.scopes.remove(&scope);
        self.modules.retain(|_, module| module.scope != scope);
    }

    fn set_operation_callback(
        &mut self,
        callback: Option<OperationCallback>,
    ) -> Option<OperationCallback> {
        std::mem::replace(&mut self.operation_callback, callback)
    }

    fn operation_trigger(&self) -> Arc<dyn OperationTrigger> {
        Arc::clone(&self.trigger) as Arc<dyn OperationTrigger>
    }

    fn context_tag(&self) -> Option<ContextId> {
        self.tag
    }

    fn set_context_tag(&mut self, tag: Option<ContextId>) {
        self.tag = tag;
    }
}

impl std::fmt::Debug for SandboxEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SandboxEngine")
            .field("file_name", &self.file_name)
            .field("position", &self.position)
            .field("statements", &self.statements.len())
            .field("tag", &self.tag)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binding::host_function;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn runs_statements_without_debugger() {
        let mut engine = SandboxEngine::new("a.sbx", "print one\n# note\ndebugger\nprint two");
        assert_eq!(engine.run().unwrap(), RunOutcome::Completed);
        assert_eq!(engine.output(), ["one", "two"]);
    }

    #[test]
    fn yield_and_trigger_run_operation_callback() {
        let mut engine = SandboxEngine::new("a.sbx", "yield\nprint x\nprint y");
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        engine.set_operation_callback(Some(Box::new(move |_engine: &mut dyn EngineBinding| {
            counter.fetch_add(1, Ordering::SeqCst);
            true
        })));
        engine.operation_trigger().trigger();

        assert_eq!(engine.run().unwrap(), RunOutcome::Completed);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn callback_returning_false_aborts() {
        let mut engine = SandboxEngine::new("a.sbx", "print a\nyield\nprint b");
        engine.set_operation_callback(Some(Box::new(|_engine: &mut dyn EngineBinding| false)));
        assert_eq!(engine.run().unwrap(), RunOutcome::Aborted);
        assert_eq!(engine.output(), ["a"]);
    }

    #[test]
    fn release_scope_drops_functions_and_modules() {
        let mut engine = SandboxEngine::new("a.sbx", "");
        let scope = engine.create_debug_scope().unwrap();
        engine.init_standard_library(scope).unwrap();
        engine
            .define_host_function(scope, "noop", host_function(|_, _| Ok(ScriptValue::Undefined)))
            .unwrap();
        let module = engine.evaluate_script(scope, "", "dbg.js").unwrap();
        assert_eq!(engine.scope_count(), 1);

        engine.release_debug_scope(scope);
        assert_eq!(engine.scope_count(), 0);
        assert!(engine.call_export(module, EXPORT_SHUTDOWN, &[]).is_err());
    }

    #[test]
    fn evaluate_requires_standard_library() {
        let mut engine = SandboxEngine::new("a.sbx", "");
        let scope = engine.create_debug_scope().unwrap();
        assert!(engine.evaluate_script(scope, "", "dbg.js").is_err());
    }
}
