//! In-process transport.
//!
//! [`pair`] returns two connected [`Transport`]s backed by bounded tokio
//! channels. Closing one side's sink ends the other side's source, the same
//! way a socket shutdown does.

use crate::error::{ProtocolError, Result};
use crate::transport::{FrameSink, FrameSource, Transport};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};

/// Frames buffered per direction before senders wait
pub const DEFAULT_CAPACITY: usize = 64;

/// Channel-backed write half
pub struct MemorySink {
    tx: Mutex<Option<mpsc::Sender<Bytes>>>,
}

/// Channel-backed read half
pub struct MemorySource {
    rx: mpsc::Receiver<Bytes>,
}

#[async_trait]
impl FrameSink for MemorySink {
    async fn send(&self, frame: Bytes) -> Result<()> {
        // Clone the sender so the lock is not held while waiting for capacity.
        let tx = self
            .tx
            .lock()
            .await
            .clone()
            .ok_or(ProtocolError::ConnectionClosed)?;
        tx.send(frame)
            .await
            .map_err(|_| ProtocolError::ConnectionClosed)
    }

    async fn close(&self) -> Result<()> {
        self.tx.lock().await.take();
        Ok(())
    }
}

#[async_trait]
impl FrameSource for MemorySource {
    async fn receive(&mut self) -> Result<Option<Bytes>> {
        Ok(self.rx.recv().await)
    }
}

/// Two connected in-process transports
pub fn pair(capacity: usize) -> (Transport, Transport) {
    let (a_tx, b_rx) = mpsc::channel(capacity.max(1));
    let (b_tx, a_rx) = mpsc::channel(capacity.max(1));

    let a = Transport::new(
        Arc::new(MemorySink {
            tx: Mutex::new(Some(a_tx)),
        }),
        Box::new(MemorySource { rx: a_rx }),
    )
    .with_remote("memory:b");
    let b = Transport::new(
        Arc::new(MemorySink {
            tx: Mutex::new(Some(b_tx)),
        }),
        Box::new(MemorySource { rx: b_rx }),
    )
    .with_remote("memory:a");
    (a, b)
}
