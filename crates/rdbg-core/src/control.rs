//! Plain-text requests understood on the control plane (no context id).

/// A recognised control payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlRequest {
    /// Disconnect the issuing client.
    Exit,
    /// Reply with the list of debuggable contexts.
    GetAvailableContexts,
    /// Reply with the server version.
    GetVersion,
}

impl ControlRequest {
    pub const EXIT: &'static str = "exit";
    pub const GET_AVAILABLE_CONTEXTS: &'static str = "get_available_contexts";
    pub const GET_VERSION: &'static str = "get_version";

    /// Recognise an exact control payload. Anything else is a debugger
    /// command meant for every session.
    pub fn parse(payload: &str) -> Option<Self> {
        match payload {
            Self::EXIT => Some(ControlRequest::Exit),
            Self::GET_AVAILABLE_CONTEXTS => Some(ControlRequest::GetAvailableContexts),
            Self::GET_VERSION => Some(ControlRequest::GetVersion),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ControlRequest::Exit => Self::EXIT,
            ControlRequest::GetAvailableContexts => Self::GET_AVAILABLE_CONTEXTS,
            ControlRequest::GetVersion => Self::GET_VERSION,
        }
    }
}
