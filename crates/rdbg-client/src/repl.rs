// crates/rdbg-client/src/repl.rs

//! Turns one line typed at the prompt into something to do.
//!
//! ```text
//! contexts | version | use <ctx> | help | exit | quit
//! continue | step | pause | where | output | source [file]
//! break <line> | clear <line>
//! {...}          raw JSON for the current context
//! 3/{...}        sent verbatim
//! ```

use rdbg_core::{ContextId, ControlRequest};
use rdbg_protocol::{split_context, Frame};
use serde_json::{json, Value};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplCommand {
    /// Send a frame to the server.
    Send(Frame),
    /// Select the context later commands go to.
    Use(ContextId),
    Help,
    /// Send `exit` and leave.
    Quit,
    Nothing,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ReplError {
    #[error("no context selected (try `contexts`, then `use <id>`)")]
    NoContext,

    #[error("`{0}` expects a number")]
    NotANumber(&'static str),

    #[error("not valid JSON: {0}")]
    BadJson(String),

    #[error("unknown command `{0}` (try `help`)")]
    Unknown(String),
}

pub const HELP: &str = "\
contexts            list debuggable contexts
version             server version
use <ctx>           send later commands to <ctx>
continue | step | pause | where | output
source [file]       show the script (or load <file>)
break <line>        set a breakpoint
clear <line>        clear a breakpoint
{...}               raw JSON for the current context
<ctx>/{...}         raw line, sent as typed
exit | quit         leave";

pub fn parse(line: &str, current: Option<ContextId>) -> Result<ReplCommand, ReplError> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(ReplCommand::Nothing);
    }

    if line.starts_with('{') || line.contains("/{") {
        return raw(line, current);
    }

    let mut words = line.split_whitespace();
    let head = words.next().unwrap_or_default();
    let arg = words.next();

    let command = match head {
        "contexts" => control(ControlRequest::GetAvailableContexts),
        "version" => control(ControlRequest::GetVersion),
        "exit" | "quit" => ReplCommand::Quit,
        "help" | "?" => ReplCommand::Help,
        "use" => ReplCommand::Use(ContextId(number("use", arg)? as i32)),
        "continue" | "step" | "pause" | "where" | "output" => {
            debugger(current, json!({ "command": head }))?
        }
        "source" => match arg {
            Some(file) => debugger(current, json!({ "command": "source", "file": file }))?,
            None => debugger(current, json!({ "command": "source" }))?,
        },
        "break" => debugger(
            current,
            json!({ "command": "set_breakpoint", "line": number("break", arg)? }),
        )?,
        "clear" => debugger(
            current,
            json!({ "command": "clear_breakpoint", "line": number("clear", arg)? }),
        )?,
        other => return Err(ReplError::Unknown(other.to_string())),
    };
    Ok(command)
}

/// The frame `exit` sends before the client leaves.
pub fn exit_frame() -> Frame {
    Frame::control(ControlRequest::Exit.as_str())
}

fn control(request: ControlRequest) -> ReplCommand {
    ReplCommand::Send(Frame::control(request.as_str()))
}

fn debugger(current: Option<ContextId>, body: Value) -> Result<ReplCommand, ReplError> {
    let context = current.ok_or(ReplError::NoContext)?;
    Ok(ReplCommand::Send(Frame::new(context, body.to_string())))
}

fn raw(line: &str, current: Option<ContextId>) -> Result<ReplCommand, ReplError> {
    let (context, payload) =
        split_context(line).map_err(|e| ReplError::BadJson(e.to_string()))?;
    serde_json::from_str::<Value>(payload).map_err(|e| ReplError::BadJson(e.to_string()))?;

    let context = if context.is_none() {
        current.ok_or(ReplError::NoContext)?
    } else {
        context
    };
    Ok(ReplCommand::Send(Frame::new(context, payload)))
}

fn number(command: &'static str, arg: Option<&str>) -> Result<i64, ReplError> {
    arg.and_then(|a| a.parse().ok())
        .ok_or(ReplError::NotANumber(command))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sent(command: ReplCommand) -> Frame {
        match command {
            ReplCommand::Send(frame) => frame,
            other => panic!("expected a frame, got {other:?}"),
        }
    }

    fn body(frame: &Frame) -> Value {
        serde_json::from_str(&frame.payload).unwrap()
    }

    #[test]
    fn control_requests_have_no_context() {
        let frame = sent(parse("contexts", None).unwrap());
        assert_eq!(frame, Frame::control("get_available_contexts"));
        let frame = sent(parse(" version ", Some(ContextId(2))).unwrap());
        assert_eq!(frame, Frame::control("get_version"));
    }

    #[test]
    fn debugger_commands_need_a_context() {
        assert_eq!(parse("step", None), Err(ReplError::NoContext));

        let frame = sent(parse("break 7", Some(ContextId(3))).unwrap());
        assert_eq!(frame.context_id, ContextId(3));
        assert_eq!(body(&frame), json!({"command": "set_breakpoint", "line": 7}));

        let frame = sent(parse("source lib.sbx", Some(ContextId(1))).unwrap());
        assert_eq!(body(&frame), json!({"command": "source", "file": "lib.sbx"}));
    }

    #[test]
    fn use_and_bad_numbers() {
        assert_eq!(parse("use 4", None), Ok(ReplCommand::Use(ContextId(4))));
        assert_eq!(parse("use x", None), Err(ReplError::NotANumber("use")));
        assert_eq!(parse("clear", Some(ContextId(1))), Err(ReplError::NotANumber("clear")));
    }

    #[test]
    fn raw_lines() {
        let frame = sent(parse(r#"{"command":"where"}"#, Some(ContextId(5))).unwrap());
        assert_eq!(frame.context_id, ContextId(5));

        let frame = sent(parse(r#"2/{"command":"where"}"#, None).unwrap());
        assert_eq!(frame.context_id, ContextId(2));
        assert_eq!(frame.payload, r#"{"command":"where"}"#);

        assert!(matches!(parse("{nope", Some(ContextId(1))), Err(ReplError::BadJson(_))));
    }

    #[test]
    fn quit_and_unknown() {
        assert_eq!(parse("quit", None), Ok(ReplCommand::Quit));
        assert_eq!(parse("", None), Ok(ReplCommand::Nothing));
        assert_eq!(parse("dance", None), Err(ReplError::Unknown("dance".into())));
        assert_eq!(exit_frame(), Frame::control("exit"));
    }
}
