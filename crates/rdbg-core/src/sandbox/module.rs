//! Native stand-in for the hosted debugger module.
//!
//! Understands JSON commands of the form `{"command": "<name>", ...}`:
//!
//! | command            | effect                                  | hint        |
//! |--------------------|-----------------------------------------|-------------|
//! | `continue`         | leave step mode, resume                 | Continue    |
//! | `step`             | pause again before the next statement   | Continue    |
//! | `pause`            | pause before the next statement         | Ignore      |
//! | `set_breakpoint`   | `{"line": n}` adds a breakpoint          | Ignore      |
//! | `clear_breakpoint` | `{"line": n}` removes it                 | Ignore      |
//! | `where`            | reports file and current line           | Ignore      |
//! | `source`           | reports the script (or `{"file": ..}`)  | Ignore      |
//! | `output`           | reports everything printed so far       | Ignore      |
//! | `abort`            | unwinds the command loop                | Interrupted |
//!
//! Anything else raises a script exception.

use std::collections::BTreeSet;

use serde_json::{json, Value};

use crate::action::DebuggerStateHint;
use crate::binding::{ObjectHandle, ScopeId};
use crate::error::BindingError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PauseReason {
    Suspended,
    DebuggerStatement,
    Breakpoint,
    Step,
    Requested,
}

impl PauseReason {
    pub fn as_str(self) -> &'static str {
        match self {
            PauseReason::Suspended => "suspended",
            PauseReason::DebuggerStatement => "debugger_statement",
            PauseReason::Breakpoint => "breakpoint",
            PauseReason::Step => "step",
            PauseReason::Requested => "pause",
        }
    }
}

#[derive(Debug)]
pub(crate) struct DebuggerModule {
    pub(crate) scope: ScopeId,
    suspend_on_start: bool,
    displacement: i64,
    breakpoints: BTreeSet<i64>,
    stepping: bool,
    pause_requested: bool,
    debuggees: Vec<ObjectHandle>,
    shut_down: bool,
}

/// What the engine needs to know about its own state to answer a command.
pub(crate) struct ScriptView<'a> {
    pub file_name: &'a str,
    pub statements: &'a [String],
    pub position: usize,
    pub output: &'a [String],
}

/// Reply to send back plus the resulting state hint.
pub(crate) struct Handled {
    pub reply: Value,
    pub hint: DebuggerStateHint,
    /// Extra file the module wants loaded through `loadScriptSource`.
    pub load_request: Option<String>,
}

impl DebuggerModule {
    pub(crate) fn new(scope: ScopeId, options: Option<&Value>) -> Self {
        let suspend_on_start = options
            .and_then(|o| o.get("suspended"))
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let displacement = options
            .and_then(|o| o.get("sourceDisplacement"))
            .and_then(Value::as_i64)
            .unwrap_or(0);
        Self {
            scope,
            suspend_on_start,
            displacement,
            breakpoints: BTreeSet::new(),
            stepping: false,
            pause_requested: false,
            debuggees: Vec::new(),
            shut_down: false,
        }
    }

    pub(crate) fn is_active(&self) -> bool {
        !self.shut_down && !self.debuggees.is_empty()
    }

    pub(crate) fn shutdown(&mut self) {
        self.shut_down = true;
        self.debuggees.clear();
    }

    pub(crate) fn add_debuggee(&mut self, debuggee: ObjectHandle) {
        if !self.debuggees.contains(&debuggee) {
            self.debuggees.push(debuggee);
        }
    }

    pub(crate) fn remove_debuggee(&mut self, debuggee: ObjectHandle) -> Result<(), BindingError> {
        let before = self.debuggees.len();
        self.debuggees.retain(|d| *d != debuggee);
        if self.debuggees.len() == before {
            return Err(BindingError::Exception(format!(
                "object #{} is not a debuggee",
                debuggee.0
            )));
        }
        Ok(())
    }

    /// Line number as reported to clients.
    pub(crate) fn display_line(&self, position: usize) -> i64 {
        position as i64 + 1 + self.displacement
    }

    /// Whether execution should stop before the statement at `position`.
    pub(crate) fn pause_reason(&mut self, position: usize, statement: &str) -> Option<PauseReason> {
        if !self.is_active() {
            return None;
        }
        if std::mem::take(&mut self.suspend_on_start) {
            return Some(PauseReason::Suspended);
        }
        if statement == "debugger" {
            return Some(PauseReason::DebuggerStatement);
        }
        if self.breakpoints.contains(&self.display_line(position)) {
            return Some(PauseReason::Breakpoint);
        }
        if std::mem::take(&mut self.pause_requested) {
            return Some(PauseReason::Requested);
        }
        if std::mem::take(&mut self.stepping) {
            return Some(PauseReason::Step);
        }
        None
    }

    pub(crate) fn handle(&mut self, command: &Value, view: ScriptView<'_>) -> Result<Handled, BindingError> {
        let name = command
            .get("command")
            .and_then(Value::as_str)
            .ok_or_else(|| BindingError::Exception("command field missing".into()))?;

        let mut load_request = None;
        let (body, hint) = match name {
            "continue" => {
                self.stepping = false;
                (json!({}), DebuggerStateHint::Continue)
            }
            "step" => {
                self.stepping = true;
                (json!({}), DebuggerStateHint::Continue)
            }
            "pause" => {
                self.pause_requested = true;
                (json!({}), DebuggerStateHint::Ignore)
            }
            "set_breakpoint" => {
                let line = line_argument(command)?;
                self.breakpoints.insert(line);
                (json!({ "line": line }), DebuggerStateHint::Ignore)
            }
            "clear_breakpoint" => {
                let line = line_argument(command)?;
                let removed = self.breakpoints.remove(&line);
                (json!({ "line": line, "removed": removed }), DebuggerStateHint::Ignore)
            }
            "where" => (
                json!({
                    "file": view.file_name,
                    "line": self.display_line(view.position),
                }),
                DebuggerStateHint::Ignore,
            ),
            "source" => match command.get("file").and_then(Value::as_str) {
                Some(file) if file != view.file_name => {
                    load_request = Some(file.to_string());
                    (json!({ "file": file }), DebuggerStateHint::Ignore)
                }
                _ => (
                    json!({ "file": view.file_name, "lines": view.statements }),
                    DebuggerStateHint::Ignore,
                ),
            },
            "output" => (json!({ "lines": view.output }), DebuggerStateHint::Ignore),
            "abort" => (json!({}), DebuggerStateHint::Interrupted),
            other => {
                return Err(BindingError::Exception(format!("Unknown command: {other}")));
            }
        };

        let mut reply = json!({
            "type": "response",
            "command": name,
            "success": true,
        });
        if let (Value::Object(reply), Value::Object(body)) = (&mut reply, body) {
            reply.extend(body);
        }

        Ok(Handled {
            reply,
            hint,
            load_request,
        })
    }
}

fn line_argument(command: &Value) -> Result<i64, BindingError> {
    command
        .get("line")
        .and_then(Value::as_i64)
        .ok_or_else(|| BindingError::Exception("line argument missing".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn view<'a>(statements: &'a [String]) -> ScriptView<'a> {
        ScriptView {
            file_name: "t.sbx",
            statements,
            position: 1,
            output: &[],
        }
    }

    fn active(options: Value) -> DebuggerModule {
        let mut module = DebuggerModule::new(ScopeId(1), Some(&options));
        module.add_debuggee(ObjectHandle(9));
        module
    }

    #[test]
    fn suspended_module_pauses_once_at_start() {
        let mut module = active(json!({"suspended": true}));
        assert_eq!(module.pause_reason(0, "print a"), Some(PauseReason::Suspended));
        assert_eq!(module.pause_reason(0, "print a"), None);
    }

    #[test]
    fn inactive_without_debuggee() {
        let mut module = DebuggerModule::new(ScopeId(1), None);
        assert_eq!(module.pause_reason(0, "debugger"), None);
    }

    #[test]
    fn breakpoints_use_displaced_lines() {
        let statements = vec!["print a".to_string(), "print b".to_string()];
        let mut module = active(json!({"sourceDisplacement": 10}));
        module
            .handle(&json!({"command": "set_breakpoint", "line": 12}), view(&statements))
            .unwrap();
        assert_eq!(module.pause_reason(0, "print a"), None);
        assert_eq!(module.pause_reason(1, "print b"), Some(PauseReason::Breakpoint));
    }

    #[test]
    fn where_reports_position() {
        let statements = vec!["print a".to_string(), "print b".to_string()];
        let mut module = active(json!({}));
        let handled = module.handle(&json!({"command": "where"}), view(&statements)).unwrap();
        assert_eq!(handled.hint, DebuggerStateHint::Ignore);
        assert_eq!(
            handled.reply,
            json!({"type": "response", "command": "where", "success": true, "file": "t.sbx", "line": 2})
        );
    }

    #[test]
    fn step_pauses_on_next_statement() {
        let mut module = active(json!({}));
        let handled = module.handle(&json!({"command": "step"}), view(&[])).unwrap();
        assert_eq!(handled.hint, DebuggerStateHint::Continue);
        assert_eq!(module.pause_reason(3, "print c"), Some(PauseReason::Step));
        assert_eq!(module.pause_reason(4, "print d"), None);
    }

    #[test]
    fn unknown_command_raises() {
        let mut module = active(json!({}));
        assert!(matches!(
            module.handle(&json!({"command": "fly"}), view(&[])),
            Err(BindingError::Exception(_))
        ));
        assert!(module.handle(&json!({"cmd": "step"}), view(&[])).is_err());
    }
}
