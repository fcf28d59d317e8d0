//! Identifier types shared by every layer of the debugger.
//!
//! Both ids travel over the wire as plain integers, so they are thin
//! newtypes around `i32` with a `-1` sentinel:
//! - [`ClientId::BROADCAST`] addresses every connected client.
//! - [`ContextId::NONE`] marks a control-plane command that is not bound
//!   to any scripting context.

use std::fmt;

/// Identifier for a connected debugger client.
///
/// Unique for the lifetime of the process; never reused after the
/// client disconnects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(pub i32);

impl ClientId {
    /// Sentinel recipient: fan out to every connected client.
    pub const BROADCAST: ClientId = ClientId(-1);

    pub fn is_broadcast(self) -> bool {
        self == Self::BROADCAST
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of one debugged execution context.
///
/// Allocated by the session registry, monotonically increasing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContextId(pub i32);

impl ContextId {
    /// "No context": the command belongs to the control plane.
    pub const NONE: ContextId = ContextId(-1);

    pub fn is_none(self) -> bool {
        self == Self::NONE
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
