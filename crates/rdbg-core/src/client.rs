//! One connected debugger peer.
//!
//! A [`Client`] owns two bounded queues:
//! - `in_queue`: commands decoded from the peer, waiting to be routed,
//! - `out_queue`: commands waiting to be framed and written to the peer.
//!
//! It knows nothing about sockets. Disconnection is only *requested*
//! through the [`ClientTransport`] the network layer attached; the actual
//! socket teardown always happens on the I/O thread.

use std::fmt;
use std::sync::Arc;

use crate::command::Command;
use crate::queue::BlockingQueue;
use crate::types::ClientId;

/// Default capacity of each per-client queue.
pub const DEFAULT_CLIENT_QUEUE_CAPACITY: usize = 4096;

/// Network-side hooks for a client.
pub trait ClientTransport: Send + Sync {
    /// Ask the owning I/O loop to drop this client's connection.
    fn disconnect(&self, client: ClientId);
}

pub struct Client {
    id: ClientId,
    in_queue: BlockingQueue<Command>,
    out_queue: BlockingQueue<Command>,
    transport: Option<Arc<dyn ClientTransport>>,
}

impl Client {
    /// A detached client with queues of `queue_capacity` items each.
    pub fn new(id: ClientId, queue_capacity: usize) -> Self {
        Self {
            id,
            in_queue: BlockingQueue::bounded(queue_capacity),
            out_queue: BlockingQueue::bounded(queue_capacity),
            transport: None,
        }
    }

    pub fn with_transport(mut self, transport: Arc<dyn ClientTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn id(&self) -> ClientId {
        self.id
    }

    pub fn in_queue(&self) -> &BlockingQueue<Command> {
        &self.in_queue
    }

    pub fn out_queue(&self) -> &BlockingQueue<Command> {
        &self.out_queue
    }

    /// Request disconnection. Detached clients ignore the request.
    pub fn disconnect(&self) {
        if let Some(transport) = &self.transport {
            transport.disconnect(self.id);
        }
    }

    /// Trip both queues so no thread stays blocked on a departed client.
    pub(crate) fn close(&self) {
        self.in_queue.interrupt();
        self.out_queue.interrupt();
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("id", &self.id)
            .field("in_queue", &self.in_queue)
            .field("out_queue", &self.out_queue)
            .field("attached", &self.transport.is_some())
            .finish()
    }
}
