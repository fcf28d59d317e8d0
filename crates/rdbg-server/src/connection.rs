// crates/rdbg-server/src/connection.rs

//! Per-connection state owned by the I/O thread.
//!
//! A [`Connection`] only holds the socket and its two buffers. The
//! matching [`Client`](rdbg_core::Client) lives in the client manager and
//! is borrowed for each read or write pass.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::{Buf, BytesMut};
use futures::future::AbortHandle;
use rdbg_core::{BlockingQueue, Client, ClientId, ClientTransport, Command, QueueSignalHandler};
use rdbg_protocol::wire_types::LINE_FEED;
use rdbg_protocol::{check_clean, decode_line, encode_command, encoded_len, find_frame, FrameError};
use tokio::io::Interest;
use tokio::net::TcpStream;
use tracing::{debug, error, warn};

use crate::types::{ControlCommand, ControlTx, TransportError};

/// Bytes pulled from the socket per `try_read`.
const READ_CHUNK: usize = 1024;

/// Cross-thread hooks of one connection: output-queue observer and
/// disconnect requests both become control commands.
pub(crate) struct ConnectionSignal {
    id: ClientId,
    control: ControlTx,
    write_pending: AtomicBool,
}

impl ConnectionSignal {
    pub(crate) fn new(id: ClientId, control: ControlTx) -> Self {
        Self {
            id,
            control,
            write_pending: AtomicBool::new(false),
        }
    }

    /// Called by the I/O thread before it drains the output queue.
    pub(crate) fn clear_write(&self) {
        self.write_pending.store(false, Ordering::SeqCst);
    }

    fn send(&self, command: ControlCommand) {
        if self.control.send(command).is_err() {
            debug!(client_id = %self.id, ?command, "I/O thread gone, signal dropped");
        }
    }
}

impl QueueSignalHandler<Command> for ConnectionSignal {
    fn handle(&self, _queue: &BlockingQueue<Command>) {
        if !self.write_pending.swap(true, Ordering::SeqCst) {
            self.send(ControlCommand::Write(self.id));
        }
    }
}

impl ClientTransport for ConnectionSignal {
    fn disconnect(&self, client: ClientId) {
        self.send(ControlCommand::Disconnect(client));
    }
}

pub(crate) struct Connection {
    pub(crate) peer: SocketAddr,
    pub(crate) stream: Arc<TcpStream>,
    pub(crate) signal: Arc<ConnectionSignal>,
    read_buf: BytesMut,
    write_buf: BytesMut,
    capacity: usize,
    /// Set after an over-long line was cut: input is dropped up to the
    /// next line feed.
    discarding: bool,
    /// Pending readiness future, if any.
    pub(crate) armed: Option<AbortHandle>,
}

impl Connection {
    pub(crate) fn new(
        stream: TcpStream,
        peer: SocketAddr,
        signal: Arc<ConnectionSignal>,
        capacity: usize,
    ) -> Self {
        Self {
            peer,
            stream: Arc::new(stream),
            signal,
            read_buf: BytesMut::new(),
            write_buf: BytesMut::new(),
            capacity,
            discarding: false,
            armed: None,
        }
    }

    /// What to wait for next, given whether the client has queued output.
    pub(crate) fn interest(&self, output_queued: bool) -> Option<Interest> {
        let read = self.read_buf.len() < self.capacity;
        let write = !self.write_buf.is_empty() || output_queued;
        match (read, write) {
            (true, true) => Some(Interest::READABLE.add(Interest::WRITABLE)),
            (true, false) => Some(Interest::READABLE),
            (false, true) => Some(Interest::WRITABLE),
            (false, false) => None,
        }
    }

    pub(crate) fn disarm(&mut self) {
        if let Some(handle) = self.armed.take() {
            handle.abort();
        }
    }

    // ------------------------------------------------------------------
    // Read path
    // ------------------------------------------------------------------

    /// Pull whatever the socket has into the read buffer, then hand every
    /// complete line to the client's input queue.
    pub(crate) fn read(&mut self, client: &Client) -> Result<(), TransportError> {
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            let room = self.capacity.saturating_sub(self.read_buf.len());
            if room == 0 {
                break;
            }
            let want = room.min(READ_CHUNK);
            match self.stream.try_read(&mut chunk[..want]) {
                Ok(0) => return Err(TransportError::ConnectionClosed),
                Ok(n) => {
                    check_clean(&chunk[..n]).map_err(|_| TransportError::MaliciousData)?;
                    self.read_buf.extend_from_slice(&chunk[..n]);
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(TransportError::Recv(e)),
            }
        }
        self.process_input(client)
    }

    /// Emit complete lines. A line stays buffered while the input queue
    /// is full.
    pub(crate) fn process_input(&mut self, client: &Client) -> Result<(), TransportError> {
        if self.discarding {
            match self.read_buf.iter().position(|&b| b == LINE_FEED) {
                Some(end) => {
                    self.read_buf.advance(end + 1);
                    self.discarding = false;
                }
                None => {
                    self.read_buf.clear();
                    return Ok(());
                }
            }
        }

        while let Some((line_len, consumed)) = find_frame(&self.read_buf) {
            if line_len > 0 {
                match decode_line(&self.read_buf[..line_len]) {
                    Ok(frame) => {
                        let command = Command::new(client.id(), frame.context_id, frame.payload);
                        if client.in_queue().add(command).is_err() {
                            debug!(client_id = %client.id(), "input queue full, line kept");
                            return Ok(());
                        }
                    }
                    Err(FrameError::MaliciousData) => return Err(TransportError::MaliciousData),
                    Err(err) => {
                        warn!(client_id = %client.id(), peer = %self.peer, error = %err, "dropping line");
                    }
                }
            }
            self.read_buf.advance(consumed);
        }

        if self.read_buf.len() >= self.capacity {
            warn!(
                client_id = %client.id(),
                peer = %self.peer,
                size = self.read_buf.len(),
                "line exceeds buffer capacity, dropped"
            );
            self.read_buf.clear();
            self.discarding = true;
        }
        Ok(())
    }

    pub(crate) fn has_buffered_input(&self) -> bool {
        find_frame(&self.read_buf).is_some()
    }

    /// Bytes accepted for the socket but not written yet.
    pub(crate) fn has_pending_output(&self) -> bool {
        !self.write_buf.is_empty()
    }

    // ------------------------------------------------------------------
    // Write path
    // ------------------------------------------------------------------

    /// Move queued commands into the write buffer and write as much as the
    /// socket takes.
    pub(crate) fn flush(&mut self, client: &Client) -> Result<(), TransportError> {
        loop {
            self.fill_write_buffer(client);
            if self.write_buf.is_empty() {
                return Ok(());
            }

            while !self.write_buf.is_empty() {
                match self.stream.try_write(&self.write_buf) {
                    Ok(0) => return Err(TransportError::ConnectionClosed),
                    Ok(n) => self.write_buf.advance(n),
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return Ok(()),
                    Err(e) => return Err(TransportError::Send(e)),
                }
            }
        }
    }

    fn fill_write_buffer(&mut self, client: &Client) {
        let queue = client.out_queue();
        while let Some(command) = queue.peek() {
            let size = encoded_len(command.context_id, &command.payload);
            if size > self.capacity {
                error!(
                    client_id = %client.id(),
                    size,
                    capacity = self.capacity,
                    "command exceeds output buffer, dropped"
                );
                queue.pop_only();
                continue;
            }
            if self.write_buf.len() + size > self.capacity {
                break;
            }
            encode_command(command.context_id, &command.payload, &mut self.write_buf);
            queue.pop_only();
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.disarm();
    }
}
