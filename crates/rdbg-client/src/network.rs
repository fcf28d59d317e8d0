// crates/rdbg-client/src/network.rs

use anyhow::{anyhow, Result};
use futures::{SinkExt, StreamExt};
use rdbg_protocol::{Frame, FrameCodec};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, error, info, warn};

/// What the connection task reports back to the prompt.
#[derive(Debug)]
pub enum ServerEvent {
    Frame(Frame),
    Closed,
}

pub struct DebuggerConnection {
    server_addr: String,
    reader: FramedRead<OwnedReadHalf, FrameCodec>,
    writer: FramedWrite<OwnedWriteHalf, FrameCodec>,
    tx: UnboundedSender<ServerEvent>,
}

impl DebuggerConnection {
    pub async fn connect(server_addr: &str, tx: UnboundedSender<ServerEvent>) -> Result<Self> {
        info!("Connecting to {}...", server_addr);
        let stream = TcpStream::connect(server_addr)
            .await
            .map_err(|e| anyhow!("cannot connect to {server_addr}: {e}"))?;
        stream.set_nodelay(true)?;
        info!("Connected successfully");

        let (read_half, write_half) = stream.into_split();
        Ok(Self {
            server_addr: server_addr.to_string(),
            reader: FramedRead::new(read_half, FrameCodec::new()),
            writer: FramedWrite::new(write_half, FrameCodec::new()),
            tx,
        })
    }

    pub async fn send(&mut self, frame: Frame) -> Result<()> {
        debug!(context_id = %frame.context_id, payload = %frame.payload, "sending");
        self.writer.send(frame).await?;
        Ok(())
    }

    /// Pump frames both ways until either side goes away.
    pub async fn run(mut self, mut rx: UnboundedReceiver<Frame>) {
        loop {
            tokio::select! {
                outgoing = rx.recv() => match outgoing {
                    Some(frame) => {
                        if let Err(e) = self.send(frame).await {
                            error!("Failed to send: {}", e);
                            break;
                        }
                    }
                    None => break,
                },

                incoming = self.reader.next() => match incoming {
                    Some(Ok(frame)) => {
                        if self.tx.send(ServerEvent::Frame(frame)).is_err() {
                            break;
                        }
                    }
                    Some(Err(e)) => {
                        warn!("Bad line from {}: {}", self.server_addr, e);
                        break;
                    }
                    None => {
                        info!("Server {} closed the connection", self.server_addr);
                        break;
                    }
                },
            }
        }
        let _ = self.tx.send(ServerEvent::Closed);
    }
}
