//! The readiness loop of the I/O thread.
//!
//! One task on a current-thread runtime waits, via `tokio::select!`, on:
//! - the control channel (write / disconnect / exit requests from other
//!   threads),
//! - the listening socket,
//! - one readiness future per connection, held in a `FuturesUnordered`,
//! - a housekeeping tick.
//!
//! Each connection has at most one readiness future armed at a time,
//! waiting for exactly the interest the connection currently has: read
//! while its read buffer has room, write while output is pending.
//! Sockets are only ever touched and closed here.

use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use futures::future::{AbortHandle, Abortable, BoxFuture};
use futures::stream::{FuturesUnordered, StreamExt};
use rdbg_core::{Client, ClientId, ClientManager, RemoveOutcome, SessionRegistry};
use tokio::io::Ready;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

use crate::connection::{Connection, ConnectionSignal};
use crate::types::{ControlCommand, ControlRx, ControlTx, TransportError};

const HOUSEKEEPING_INTERVAL: Duration = Duration::from_millis(100);
const SHUTDOWN_RETRY_DELAY: Duration = Duration::from_millis(10);

type Readiness = (ClientId, io::Result<Ready>);

/// Knobs the loop needs from the server configuration.
#[derive(Debug, Clone, Copy)]
pub struct LoopSettings {
    pub buffer_size: usize,
    pub client_queue_capacity: usize,
    pub shutdown_retries: u32,
}

pub struct Multiplexer {
    listener: TcpListener,
    control_tx: ControlTx,
    control_rx: ControlRx,
    clients: Arc<ClientManager>,
    registry: Arc<SessionRegistry>,
    settings: LoopSettings,
    connections: HashMap<ClientId, Connection>,
    pending: FuturesUnordered<Abortable<BoxFuture<'static, Readiness>>>,
    next_client_id: i32,
}

impl Multiplexer {
    pub fn new(
        listener: TcpListener,
        control: (ControlTx, ControlRx),
        clients: Arc<ClientManager>,
        registry: Arc<SessionRegistry>,
        settings: LoopSettings,
    ) -> Self {
        let (control_tx, control_rx) = control;
        Self {
            listener,
            control_tx,
            control_rx,
            clients,
            registry,
            settings,
            connections: HashMap::new(),
            pending: FuturesUnordered::new(),
            next_client_id: 1,
        }
    }

    /// Run until an `Exit` control command arrives, then shut down.
    pub async fn run(mut self) {
        let mut housekeeping = tokio::time::interval(HOUSEKEEPING_INTERVAL);
        info!(addr = ?self.listener.local_addr().ok(), "readiness loop started");

        loop {
            tokio::select! {
                biased;

                command = self.control_rx.recv() => match command {
                    Some(ControlCommand::Write(id)) => self.on_write_request(id),
                    Some(ControlCommand::Disconnect(id)) => self.disconnect(id, "requested"),
                    Some(ControlCommand::Exit) | None => break,
                },

                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => self.on_accept(stream, peer),
                    Err(e) => warn!(error = %e, "accept failed"),
                },

                Some(ready) = self.pending.next(), if !self.pending.is_empty() => {
                    if let Ok((id, ready)) = ready {
                        self.on_ready(id, ready);
                    }
                },

                _ = housekeeping.tick() => self.on_housekeeping(),
            }

            self.clients.periodic_cleanup();
        }

        self.shutdown().await;
    }

    // ------------------------------------------------------------------
    // Events
    // ------------------------------------------------------------------

    fn on_accept(&mut self, stream: tokio::net::TcpStream, peer: std::net::SocketAddr) {
        let id = ClientId(self.next_client_id);
        self.next_client_id += 1;

        if let Err(e) = stream.set_nodelay(true) {
            debug!(peer = %peer, error = %e, "cannot set TCP_NODELAY");
        }

        let signal = Arc::new(ConnectionSignal::new(id, self.control_tx.clone()));
        let client = Client::new(id, self.settings.client_queue_capacity)
            .with_transport(Arc::clone(&signal) as Arc<dyn rdbg_core::ClientTransport>);
        client.out_queue().set_signal_handler(Some(Arc::clone(&signal) as _));
        client.in_queue().set_signal_handler(Some(self.registry.input_router() as _));

        self.connections.insert(
            id,
            Connection::new(stream, peer, signal, self.settings.buffer_size),
        );

        match self.clients.add_client(client) {
            Ok(_) => {
                info!(client_id = %id, peer = %peer, "connection accepted");
                self.arm(id);
            }
            Err(e) => {
                warn!(peer = %peer, error = %e, "connection rejected");
                self.connections.remove(&id);
            }
        }
    }

    fn on_ready(&mut self, id: ClientId, ready: io::Result<Ready>) {
        if let Some(conn) = self.connections.get_mut(&id) {
            conn.armed = None;
        }

        let result = match ready {
            Ok(ready) => self.service(id, ready),
            Err(e) => Err(TransportError::Recv(e)),
        };

        match result {
            Ok(()) => self.arm(id),
            Err(e) => self.drop_connection(id, e),
        }
    }

    fn on_write_request(&mut self, id: ClientId) {
        let Some(conn) = self.connections.get(&id) else {
            return;
        };
        conn.signal.clear_write();
        match self.service(id, Ready::WRITABLE) {
            Ok(()) => self.arm(id),
            Err(e) => self.drop_connection(id, e),
        }
    }

    /// Retry lines left buffered behind a full input queue.
    fn on_housekeeping(&mut self) {
        let stalled: Vec<ClientId> = self
            .connections
            .iter()
            .filter(|(_, c)| c.has_buffered_input())
            .map(|(id, _)| *id)
            .collect();
        for id in stalled {
            let result = match (self.connections.get_mut(&id), self.clients.get_client(id)) {
                (Some(conn), Some(client)) => conn.process_input(&client),
                _ => Ok(()),
            };
            match result {
                Ok(()) => self.arm(id),
                Err(e) => self.drop_connection(id, e),
            }
        }
    }

    /// Handle one readiness notification for `id`.
    fn service(&mut self, id: ClientId, ready: Ready) -> Result<(), TransportError> {
        let Some(conn) = self.connections.get_mut(&id) else {
            return Ok(());
        };
        let Some(client) = self.clients.get_client(id) else {
            return Err(TransportError::ConnectionClosed);
        };

        if ready.is_readable() || ready.is_read_closed() {
            conn.read(&client)?;
        }
        if ready.is_writable() {
            conn.flush(&client)?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Readiness futures
    // ------------------------------------------------------------------

    /// (Re)arm the readiness future of `id` with its current interest.
    fn arm(&mut self, id: ClientId) {
        let output_queued = self
            .clients
            .get_client(id)
            .map(|c| !c.out_queue().is_empty())
            .unwrap_or(false);

        let Some(conn) = self.connections.get_mut(&id) else {
            return;
        };
        conn.disarm();
        let Some(interest) = conn.interest(output_queued) else {
            return;
        };

        let stream = Arc::clone(&conn.stream);
        let (handle, registration) = AbortHandle::new_pair();
        let ready: BoxFuture<'static, Readiness> =
            Box::pin(async move { (id, stream.ready(interest).await) });
        self.pending.push(Abortable::new(ready, registration));
        conn.armed = Some(handle);
    }

    // ------------------------------------------------------------------
    // Disconnection
    // ------------------------------------------------------------------

    fn drop_connection(&mut self, id: ClientId, cause: TransportError) {
        match cause {
            TransportError::ConnectionClosed => self.disconnect(id, "closed by peer"),
            TransportError::MaliciousData => self.disconnect(id, "malicious data"),
            other => {
                let reason = other.to_string();
                self.disconnect(id, &reason)
            }
        }
    }

    fn disconnect(&mut self, id: ClientId, reason: &str) {
        let Some(conn) = self.connections.remove(&id) else {
            return;
        };
        info!(client_id = %id, peer = %conn.peer, reason, "client disconnected");
        drop(conn);

        match self.clients.remove_client(id) {
            RemoveOutcome::Removed => {}
            RemoveOutcome::MarkedForRemoval => debug!(client_id = %id, "client still borrowed"),
            RemoveOutcome::NotFound => debug!(client_id = %id, "client already gone"),
        }
    }

    async fn shutdown(mut self) {
        let ids: Vec<ClientId> = self.connections.keys().copied().collect();
        for id in ids {
            self.disconnect(id, "server stopping");
        }
        self.pending.clear();

        for attempt in 0..=self.settings.shutdown_retries {
            match self.clients.stop() {
                Ok(()) => {
                    info!("readiness loop stopped");
                    return;
                }
                Err(e) => {
                    debug!(attempt, error = %e, "clients still in use");
                    tokio::time::sleep(SHUTDOWN_RETRY_DELAY).await;
                }
            }
        }

        error!(
            remaining = self.clients.client_ids().len(),
            "connections leaked past shutdown"
        );
    }
}
