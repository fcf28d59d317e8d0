//! The narrow interface between the debugger and an embedded script engine.
//!
//! Everything the debugger needs from the engine goes through
//! [`EngineBinding`]:
//!
//! - create / release an isolated debug scope,
//! - define host functions inside that scope,
//! - evaluate the hosted debugger module and call its named exports,
//! - install the engine's cooperative operation callback and poke it from
//!   another thread,
//! - read / write a per-context tag.
//!
//! Values crossing the boundary are [`ScriptValue`]s: JSON for data, plus
//! opaque [`ObjectHandle`]s for engine objects (debuggees) that have no
//! JSON form.

use std::sync::Arc;

use serde_json::Value;

use crate::error::BindingError;
use crate::types::ContextId;

/// Handle to a debug scope created by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ScopeId(pub u64);

/// Handle to an evaluated module whose exports can be called.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ModuleId(pub u64);

/// Opaque reference to an engine object, e.g. a debuggee global.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectHandle(pub u64);

/// A value passed to or returned from script code.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum ScriptValue {
    #[default]
    Undefined,
    Json(Value),
    Object(ObjectHandle),
}

impl ScriptValue {
    pub fn as_json(&self) -> Option<&Value> {
        match self {
            ScriptValue::Json(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        self.as_json().and_then(Value::as_i64)
    }

    pub fn as_bool(&self) -> Option<bool> {
        self.as_json().and_then(Value::as_bool)
    }

    pub fn as_str(&self) -> Option<&str> {
        self.as_json().and_then(Value::as_str)
    }

    pub fn as_object(&self) -> Option<ObjectHandle> {
        match self {
            ScriptValue::Object(handle) => Some(*handle),
            _ => None,
        }
    }

    /// Loose truthiness, the way script code tests a condition.
    pub fn is_truthy(&self) -> bool {
        match self {
            ScriptValue::Undefined => false,
            ScriptValue::Object(_) => true,
            ScriptValue::Json(v) => match v {
                Value::Null => false,
                Value::Bool(b) => *b,
                Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
                Value::String(s) => !s.is_empty(),
                Value::Array(_) | Value::Object(_) => true,
            },
        }
    }
}

impl From<Value> for ScriptValue {
    fn from(value: Value) -> Self {
        ScriptValue::Json(value)
    }
}

impl From<bool> for ScriptValue {
    fn from(value: bool) -> Self {
        ScriptValue::Json(Value::Bool(value))
    }
}

impl From<i32> for ScriptValue {
    fn from(value: i32) -> Self {
        ScriptValue::Json(Value::from(value))
    }
}

impl From<i64> for ScriptValue {
    fn from(value: i64) -> Self {
        ScriptValue::Json(Value::from(value))
    }
}

impl From<&str> for ScriptValue {
    fn from(value: &str) -> Self {
        ScriptValue::Json(Value::from(value))
    }
}

impl From<String> for ScriptValue {
    fn from(value: String) -> Self {
        ScriptValue::Json(Value::String(value))
    }
}

impl From<ObjectHandle> for ScriptValue {
    fn from(value: ObjectHandle) -> Self {
        ScriptValue::Object(value)
    }
}

/// Native function callable from script code.
///
/// The engine passes itself back in, so a host function may call into the
/// engine again (the debugger's command loop does exactly that).
pub type HostFunction =
    Arc<dyn Fn(&mut dyn EngineBinding, &[ScriptValue]) -> Result<ScriptValue, BindingError> + Send + Sync>;

/// Wrap a closure as a [`HostFunction`].
pub fn host_function<F>(function: F) -> HostFunction
where
    F: Fn(&mut dyn EngineBinding, &[ScriptValue]) -> Result<ScriptValue, BindingError>
        + Send
        + Sync
        + 'static,
{
    Arc::new(function)
}

/// Cooperative callback the engine invokes periodically while running.
///
/// Returning `false` asks the engine to abort the running script.
pub type OperationCallback = Box<dyn FnMut(&mut dyn EngineBinding) -> bool + Send>;

/// Thread-safe request for the engine to run its operation callback soon.
pub trait OperationTrigger: Send + Sync {
    fn trigger(&self);
}

/// One execution context of an embedded script engine.
///
/// Every method must be called on the thread that owns the context.
pub trait EngineBinding {
    /// Create an isolated scope for the debugger's own code.
    fn create_debug_scope(&mut self) -> Result<ScopeId, BindingError>;

    /// Populate the scope with the language's standard library.
    fn init_standard_library(&mut self, scope: ScopeId) -> Result<(), BindingError>;

    fn define_host_function(
        &mut self,
        scope: ScopeId,
        name: &str,
        function: HostFunction,
    ) -> Result<(), BindingError>;

    fn set_scope_property(
        &mut self,
        scope: ScopeId,
        name: &str,
        value: ScriptValue,
    ) -> Result<(), BindingError>;

    /// Evaluate `source` inside `scope` and return the resulting module.
    fn evaluate_script(
        &mut self,
        scope: ScopeId,
        source: &str,
        file_name: &str,
    ) -> Result<ModuleId, BindingError>;

    /// Call an exported function of an evaluated module.
    fn call_export(
        &mut self,
        module: ModuleId,
        name: &str,
        args: &[ScriptValue],
    ) -> Result<ScriptValue, BindingError>;

    /// Drop the scope along with its host functions and modules.
    fn release_debug_scope(&mut self, scope: ScopeId);

    /// Replace the operation callback, returning the previous one.
    fn set_operation_callback(
        &mut self,
        callback: Option<OperationCallback>,
    ) -> Option<OperationCallback>;

    /// Handle other threads use to request an operation callback.
    fn operation_trigger(&self) -> Arc<dyn OperationTrigger>;

    fn context_tag(&self) -> Option<ContextId>;

    fn set_context_tag(&mut self, tag: Option<ContextId>);
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn truthiness_follows_script_rules() {
        assert!(!ScriptValue::Undefined.is_truthy());
        assert!(!ScriptValue::from(json!(null)).is_truthy());
        assert!(!ScriptValue::from(0).is_truthy());
        assert!(!ScriptValue::from("").is_truthy());
        assert!(ScriptValue::from(2).is_truthy());
        assert!(ScriptValue::from(json!({})).is_truthy());
        assert!(ScriptValue::from(ObjectHandle(1)).is_truthy());
    }

    #[test]
    fn accessors() {
        assert_eq!(ScriptValue::from(7).as_i64(), Some(7));
        assert_eq!(ScriptValue::from(true).as_bool(), Some(true));
        assert_eq!(ScriptValue::from("x").as_str(), Some("x"));
        assert_eq!(ScriptValue::from(ObjectHandle(3)).as_object(), Some(ObjectHandle(3)));
        assert_eq!(ScriptValue::Undefined.as_i64(), None);
    }
}
