//! # Endpoint Read Loop
//!
//! One task per connection pulls frames off the transport and feeds them
//! through the core:
//!
//! ```text
//! receive frame -> decode -> resolve pending wait -> dispatch (awaited) -> next frame
//! ```
//!
//! A message is fully dispatched, every handler included, before the next
//! frame is processed, so handlers observe messages in arrival order. Decode
//! failures are logged and skipped; only transport closure, transport
//! errors or cancellation end the loop, and every pending wait on the
//! connection then fails with `ConnectionClosed`.
//!
//! While handlers run, the loop keeps watching the connection:
//! - an explicit close or server shutdown abandons the in-flight dispatch;
//! - at most one further frame is read ahead and held until the dispatch
//!   finishes;
//! - a peer hang-up fails pending waits at once, but the loop itself ends
//!   only after the current dispatch completes.
//!
//! Handlers that need a reply from the same peer should spawn that request
//! instead of awaiting it inline: the reply can only be read once the
//! current dispatch has finished.

use crate::core::serialization::MessageCodec;
use crate::error::{ProtocolError, Result};
use crate::protocol::correlation::{CorrelationTable, Reply};
use crate::protocol::dispatcher::Dispatcher;
use crate::protocol::message::Message;
use crate::transport::{FrameSink, FrameSource};
use crate::utils::metrics::global_metrics;
use bytes::Bytes;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Lifecycle of one connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Open,
    Closing,
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Connecting => "connecting",
            ConnectionState::Open => "open",
            ConnectionState::Closing => "closing",
            ConnectionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Why a read loop stopped
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// The peer closed the transport
    PeerClosed,
    /// Local close or server shutdown
    Cancelled,
    /// The transport failed
    TransportError(String),
}

struct PeerInner {
    id: u64,
    key: String,
    remote: Option<String>,
    sink: Arc<dyn FrameSink>,
    codec: Arc<dyn MessageCodec>,
    pending: CorrelationTable,
    cancel: CancellationToken,
}

/// Handle to one live connection.
///
/// Cheap to clone. Server handlers receive the `Peer` a message arrived on
/// and can answer through it; the server's registry keeps one per
/// connection key.
#[derive(Clone)]
pub struct Peer {
    inner: Arc<PeerInner>,
}

impl fmt::Debug for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Peer")
            .field("id", &self.inner.id)
            .field("key", &self.inner.key)
            .field("remote", &self.inner.remote)
            .finish()
    }
}

impl Peer {
    pub(crate) fn new(
        key: String,
        remote: Option<String>,
        sink: Arc<dyn FrameSink>,
        codec: Arc<dyn MessageCodec>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            inner: Arc::new(PeerInner {
                id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
                key,
                remote,
                sink,
                codec,
                pending: CorrelationTable::new(),
                cancel,
            }),
        }
    }

    /// Process-unique connection id
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Registry key of this connection
    pub fn key(&self) -> &str {
        &self.inner.key
    }

    /// Transport-level peer address, when known
    pub fn remote(&self) -> Option<&str> {
        self.inner.remote.as_deref()
    }

    /// Correlation table of this connection
    pub fn pending(&self) -> &CorrelationTable {
        &self.inner.pending
    }

    /// Whether `close` was called or the read loop was cancelled
    pub fn is_closed(&self) -> bool {
        self.inner.cancel.is_cancelled() || self.inner.pending.is_closed()
    }

    /// Fire-and-forget send
    pub async fn send(&self, msg: &Message) -> Result<()> {
        if self.is_closed() {
            return Err(ProtocolError::ConnectionClosed);
        }
        let frame = self.inner.codec.encode(msg)?;
        let len = frame.len() as u64;
        trace!(id = msg.id(), code = msg.code(), peer = %self.inner.key, "Sending message");
        self.inner.sink.send(frame).await?;
        global_metrics().message_sent(len);
        Ok(())
    }

    /// Send `msg` and wait up to `timeout` for a message carrying the same id.
    ///
    /// The wait is registered before the frame is written. If the send
    /// fails, the wait is withdrawn and the error returned.
    pub async fn send_and_wait(&self, msg: Message, timeout: Duration) -> Result<Reply> {
        let pending = self.inner.pending.register(msg.id())?;
        self.send(&msg).await?;
        pending.wait(timeout).await
    }

    /// Close the connection: stops its read loop, fails every pending wait
    /// with `ConnectionClosed` and shuts the write half.
    pub async fn close(&self) {
        self.inner.cancel.cancel();
        self.inner.pending.close_all();
        if let Err(e) = self.inner.sink.close().await {
            debug!(error = %e, peer = %self.inner.key, "Error closing transport");
        }
    }

    pub(crate) fn cancel_token(&self) -> &CancellationToken {
        &self.inner.cancel
    }
}

/// Drive one connection until it closes.
///
/// `ctx` is handed to every handler invocation. On exit the peer's pending
/// waits are failed with `ConnectionClosed`.
pub(crate) async fn run_read_loop<C>(
    peer: &Peer,
    mut source: Box<dyn FrameSource>,
    dispatcher: &Dispatcher<C>,
    ctx: C,
) -> CloseReason
where
    C: Clone + Send + 'static,
{
    let cancel = peer.cancel_token().clone();
    debug!(peer = %peer.key(), "Read loop started");

    let mut read_ahead: Option<Bytes> = None;
    let reason = loop {
        let frame = match read_ahead.take() {
            Some(frame) => frame,
            None => tokio::select! {
                _ = cancel.cancelled() => break CloseReason::Cancelled,
                received = source.receive() => match received {
                    Ok(Some(frame)) => frame,
                    Ok(None) => break CloseReason::PeerClosed,
                    Err(e) => {
                        warn!(error = %e, peer = %peer.key(), "Transport error");
                        break CloseReason::TransportError(e.to_string());
                    }
                },
            },
        };

        global_metrics().message_received(frame.len() as u64);
        let msg = match peer.inner.codec.decode(&frame) {
            Ok(msg) => Arc::new(msg),
            Err(e) => {
                global_metrics().decode_error();
                warn!(error = %e, peer = %peer.key(), bytes = frame.len(), "Dropping undecodable frame");
                continue;
            }
        };
        trace!(id = msg.id(), code = msg.code(), peer = %peer.key(), "Message received");

        // A reply still flows to the handlers registered for its code.
        peer.pending().resolve(msg.id(), &msg);

        let dispatch = dispatcher.dispatch(msg, ctx.clone());
        tokio::pin!(dispatch);
        let mut cancelled = false;
        let mut lost: Option<CloseReason> = None;
        loop {
            tokio::select! {
                _ = &mut dispatch => break,
                _ = cancel.cancelled() => {
                    cancelled = true;
                    break;
                }
                received = source.receive(), if read_ahead.is_none() && lost.is_none() => {
                    match received {
                        Ok(Some(frame)) => read_ahead = Some(frame),
                        Ok(None) => lost = Some(CloseReason::PeerClosed),
                        Err(e) => {
                            warn!(error = %e, peer = %peer.key(), "Transport error");
                            lost = Some(CloseReason::TransportError(e.to_string()));
                        }
                    }
                    if lost.is_some() {
                        // No reply can arrive any more.
                        peer.pending().close_all();
                    }
                }
            }
        }

        if cancelled {
            debug!(peer = %peer.key(), "Dispatch abandoned by close");
            break CloseReason::Cancelled;
        }
        if let Some(reason) = lost {
            break reason;
        }
    };

    let cancelled = peer.pending().close_all();
    info!(
        peer = %peer.key(),
        reason = ?reason,
        cancelled_waits = cancelled,
        "Read loop stopped"
    );
    reason
}
