//! TCP transport.
//!
//! Streams are framed with [`FrameCodec`] and split so the read loop owns
//! the stream half while any number of tasks share the sink half.

use crate::core::codec::FrameCodec;
use crate::error::{ProtocolError, Result};
use crate::transport::{FrameSink, FrameSource, Transport};
use crate::utils::timeout::with_timeout_error;
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio_util::codec::Framed;
use tracing::{debug, instrument};

type FramedTcp = Framed<TcpStream, FrameCodec>;

/// Write half of a framed TCP stream
pub struct TcpFrameSink {
    sink: Mutex<SplitSink<FramedTcp, Bytes>>,
    send_timeout: Duration,
}

/// Read half of a framed TCP stream
pub struct TcpFrameSource {
    stream: SplitStream<FramedTcp>,
}

#[async_trait]
impl FrameSink for TcpFrameSink {
    async fn send(&self, frame: Bytes) -> Result<()> {
        let mut sink = self.sink.lock().await;
        with_timeout_error(
            async {
                sink.send(frame).await?;
                Ok(())
            },
            self.send_timeout,
        )
        .await
    }

    async fn close(&self) -> Result<()> {
        let mut sink = self.sink.lock().await;
        // SinkExt::close flushes and shuts down the write side of the socket.
        match sink.close().await {
            Ok(()) => Ok(()),
            Err(e) if e.is_connection_closed() => Ok(()),
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl FrameSource for TcpFrameSource {
    async fn receive(&mut self) -> Result<Option<Bytes>> {
        match self.stream.next().await {
            Some(Ok(frame)) => Ok(Some(frame)),
            Some(Err(e)) if e.is_connection_closed() => Ok(None),
            Some(Err(e)) => Err(e),
            None => Ok(None),
        }
    }
}

/// Wrap an established stream
pub fn from_stream(stream: TcpStream, codec: FrameCodec, send_timeout: Duration) -> Transport {
    let remote = stream.peer_addr().ok().map(|addr| addr.to_string());
    if let Err(e) = stream.set_nodelay(true) {
        debug!(error = %e, "Failed to set TCP_NODELAY");
    }

    let (sink, stream) = Framed::new(stream, codec).split();
    let transport = Transport::new(
        Arc::new(TcpFrameSink {
            sink: Mutex::new(sink),
            send_timeout,
        }),
        Box::new(TcpFrameSource { stream }),
    );
    match remote {
        Some(remote) => transport.with_remote(remote),
        None => transport,
    }
}

/// Open a framed TCP connection
#[instrument(skip(codec))]
pub async fn connect(
    address: &str,
    codec: FrameCodec,
    connect_timeout: Duration,
    send_timeout: Duration,
) -> Result<Transport> {
    let stream = with_timeout_error(
        async { TcpStream::connect(address).await.map_err(ProtocolError::Io) },
        connect_timeout,
    )
    .await?;
    debug!(address, "TCP connection established");
    Ok(from_stream(stream, codec, send_timeout))
}

/// Bind a listener
pub async fn bind(address: &str) -> Result<TcpListener> {
    TcpListener::bind(address).await.map_err(ProtocolError::Io)
}
