//! # Transport Layer
//!
//! Endpoints only see frames. A transport is split into a shareable write
//! half ([`FrameSink`]) and an exclusively owned read half ([`FrameSource`])
//! that the endpoint's read loop drains.
//!
//! ## Implementations
//! - **tcp**: `tokio::net` sockets framed with [`FrameCodec`](crate::core::codec::FrameCodec)
//! - **memory**: in-process channel pair, for embedding and tests

pub mod memory;
pub mod tcp;

use crate::error::Result;
use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;
use std::sync::Arc;

/// Write half of a transport. Shared by every task that sends on the connection.
#[async_trait]
pub trait FrameSink: Send + Sync {
    /// Write one frame
    async fn send(&self, frame: Bytes) -> Result<()>;

    /// Close the write half. Further sends fail.
    async fn close(&self) -> Result<()>;
}

/// Read half of a transport, owned by the read loop.
#[async_trait]
pub trait FrameSource: Send {
    /// Wait for the next frame. `Ok(None)` means the peer closed the connection.
    async fn receive(&mut self) -> Result<Option<Bytes>>;
}

/// A connected transport, ready to be driven by an endpoint
pub struct Transport {
    pub sink: Arc<dyn FrameSink>,
    pub source: Box<dyn FrameSource>,
    /// Peer address or other transport-level label, used in logs and as a
    /// fallback connection key
    pub remote: Option<String>,
}

impl Transport {
    pub fn new(sink: Arc<dyn FrameSink>, source: Box<dyn FrameSource>) -> Self {
        Self {
            sink,
            source,
            remote: None,
        }
    }

    pub fn with_remote(mut self, remote: impl Into<String>) -> Self {
        self.remote = Some(remote.into());
        self
    }
}

impl fmt::Debug for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transport")
            .field("remote", &self.remote)
            .finish_non_exhaustive()
    }
}
