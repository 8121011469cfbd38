//! Shared write half of a transfer connection.
//!
//! Several tasks send packets on the same stream: the metadata emitter and the
//! content streams on the sender, the dispatcher and content requests on the
//! receiver. Each send holds the lock for exactly one frame.

use std::sync::Arc;

use tokio::io::AsyncWrite;
use tokio::sync::Mutex;
use tracing::warn;
use treesync_core::wire::{Packet, PacketWriter};

use crate::error::{Error, Result};

type BoxWriter = Box<dyn AsyncWrite + Send + Unpin>;

#[derive(Clone)]
pub(crate) struct Conn {
    writer: Arc<Mutex<PacketWriter<BoxWriter>>>,
}

impl Conn {
    pub(crate) fn new<W>(writer: W) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            writer: Arc::new(Mutex::new(PacketWriter::new(Box::new(writer)))),
        }
    }

    /// Send one packet. Returns the number of frame bytes written.
    pub(crate) async fn send(&self, packet: Packet) -> Result<u64> {
        let mut w = self.writer.lock().await;
        let before = w.bytes_written();
        w.send(&packet).await?;
        Ok(w.bytes_written() - before)
    }

    /// Tell the peer why the transfer failed. Delivery is best effort, and
    /// errors that came from the peer are not echoed back.
    pub(crate) async fn send_error(&self, err: &Error) {
        if matches!(err, Error::Peer(_)) {
            return;
        }
        if let Err(e) = self.send(Packet::Error(err.to_string())).await {
            warn!(error = %e, "failed to deliver error to peer");
        }
    }

    pub(crate) async fn shutdown(&self) -> Result<()> {
        self.writer.lock().await.shutdown().await?;
        Ok(())
    }
}
