//! The framed command value exchanged between clients and sessions.

use crate::types::{ClientId, ContextId};

/// One framed debugger command.
///
/// Created by the transport on decode (client id = sender) or by the
/// session / router layer when replying (client id = recipient, or
/// [`ClientId::BROADCAST`]).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub client_id: ClientId,
    pub context_id: ContextId,
    pub payload: String,
}

impl Command {
    pub fn new(client_id: ClientId, context_id: ContextId, payload: impl Into<String>) -> Self {
        Self {
            client_id,
            context_id,
            payload: payload.into(),
        }
    }

    /// Command addressed to every connected client.
    pub fn broadcast(context_id: ContextId, payload: impl Into<String>) -> Self {
        Self::new(ClientId::BROADCAST, context_id, payload)
    }

    /// Control-plane command (no context).
    pub fn control(client_id: ClientId, payload: impl Into<String>) -> Self {
        Self::new(client_id, ContextId::NONE, payload)
    }

    pub fn is_broadcast(&self) -> bool {
        self.client_id.is_broadcast()
    }
}
