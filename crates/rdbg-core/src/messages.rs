//! JSON envelopes the debugger itself sends to clients.
//!
//! These are the only payloads this crate authors; everything else on the
//! wire is produced by the hosted debugger module and passed through as an
//! opaque string.
//!
//! ```text
//! {"type":"info","subtype":"contexts_list","contexts":[{"contextId":1,"contextName":"main","paused":false}]}
//! {"type":"info","subtype":"version","version":"0.1.0"}
//! {"type":"error","code":2,"message":"Unknown JS Context."}
//! {"type":"warn","code":1,"message":"..."}
//! ```

use serde::Serialize;

use crate::types::ContextId;

/// Error codes carried by `{"type":"error"}` envelopes.
#[repr(i32)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ClientErrorCode {
    CommandFailed = 1,
    UnknownContext = 2,
}

/// Warning codes carried by `{"type":"warn"}` envelopes.
#[repr(i32)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ClientWarnCode {
    QueueCongested = 1,
}

/// One row of a contexts list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextState {
    pub context_id: i32,
    pub context_name: String,
    pub paused: bool,
}

impl ContextState {
    pub fn new(context_id: ContextId, name: impl Into<String>, paused: bool) -> Self {
        Self {
            context_id: context_id.0,
            context_name: name.into(),
            paused,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "subtype", rename_all = "snake_case")]
pub enum InfoMessage {
    ContextsList { contexts: Vec<ContextState> },
    Version { version: String },
}

/// Envelope discriminated by its top-level `type` field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerMessage {
    Info(InfoMessage),
    Error { code: i32, message: String },
    Warn { code: i32, message: String },
}

impl ServerMessage {
    pub fn contexts_list(contexts: Vec<ContextState>) -> Self {
        ServerMessage::Info(InfoMessage::ContextsList { contexts })
    }

    pub fn version(version: impl Into<String>) -> Self {
        ServerMessage::Info(InfoMessage::Version {
            version: version.into(),
        })
    }

    pub fn error(code: ClientErrorCode, message: impl Into<String>) -> Self {
        ServerMessage::Error {
            code: code as i32,
            message: message.into(),
        }
    }

    pub fn warn(code: ClientWarnCode, message: impl Into<String>) -> Self {
        ServerMessage::Warn {
            code: code as i32,
            message: message.into(),
        }
    }

    /// Serialized form, ready to become a command payload.
    pub fn to_json(&self) -> String {
        // Every field is a string, integer, bool or list of those.
        serde_json::to_string(self).unwrap_or_else(|_| String::from("{}"))
    }
}
