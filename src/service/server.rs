use crate::config::{NetworkConfig, ServerConfig, TransportConfig};
use crate::core::codec::FrameCodec;
use crate::core::serialization::{JsonCodec, MessageCodec};
use crate::error::{constants, ProtocolError, Result};
use crate::protocol::correlation::Reply;
use crate::protocol::dispatcher::{Dispatcher, HandlerId};
use crate::protocol::handshake;
use crate::protocol::message::Message;
use crate::service::endpoint::{run_read_loop, Peer};
use crate::service::registry::{BroadcastReport, ConnectionRegistry};
use crate::transport::{tcp, FrameSink, FrameSource, Transport};
use crate::utils::metrics::global_metrics;
use crate::utils::timeout::with_timeout;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Who a server-side send goes to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// Every registered connection
    Broadcast,
    /// The connection registered under this key
    Key(String),
}

impl From<&str> for Target {
    fn from(key: &str) -> Self {
        Target::Key(key.to_string())
    }
}

struct ServerInner {
    config: ServerConfig,
    transport: TransportConfig,
    codec: Arc<dyn MessageCodec>,
    dispatcher: Arc<Dispatcher<Peer>>,
    registry: ConnectionRegistry,
    shutdown: CancellationToken,
    accept_task: Mutex<Option<JoinHandle<()>>>,
    connections: Mutex<JoinSet<()>>,
    local_addr: Mutex<Option<SocketAddr>>,
    anonymous: AtomicU64,
}

/// Server endpoint: accepts connections and routes messages by connection key.
///
/// Every accepted connection runs its own read loop; handlers receive the
/// [`Peer`] a message arrived on. A stopped server cannot be restarted.
///
/// # Example
/// ```ignore
/// let server = Server::new(ServerConfig::with_address("127.0.0.1:8765"));
/// server.on_message("PING", |msg, peer| async move {
///     peer.send(&msg.reply("PONG", Payload::new())).await
/// })?;
/// let addr = server.start().await?;
/// ```
#[derive(Clone)]
pub struct Server {
    inner: Arc<ServerInner>,
}

impl Server {
    /// Server with default transport settings and the JSON codec
    pub fn new(config: ServerConfig) -> Self {
        Self::with_codec(
            config,
            TransportConfig::default(),
            Arc::new(JsonCodec::default()),
        )
    }

    pub fn from_config(config: &NetworkConfig) -> Self {
        Self::with_codec(
            config.server.clone(),
            config.transport.clone(),
            Arc::new(JsonCodec::default()),
        )
    }

    /// Server with an explicit message codec
    pub fn with_codec(
        config: ServerConfig,
        transport: TransportConfig,
        codec: Arc<dyn MessageCodec>,
    ) -> Self {
        let registry =
            ConnectionRegistry::new(config.duplicate_key_policy, config.max_connections);
        Self {
            inner: Arc::new(ServerInner {
                config,
                transport,
                codec,
                dispatcher: Arc::new(Dispatcher::new()),
                registry,
                shutdown: CancellationToken::new(),
                accept_task: Mutex::new(None),
                connections: Mutex::new(JoinSet::new()),
                local_addr: Mutex::new(None),
                anonymous: AtomicU64::new(1),
            }),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.inner.config
    }

    /// Bind the configured address and start accepting connections.
    ///
    /// Returns the bound address, which differs from the configured one when
    /// binding port 0. Failing to bind is returned to the caller.
    #[instrument(skip(self), fields(address = %self.inner.config.address))]
    pub async fn start(&self) -> Result<SocketAddr> {
        self.ensure_not_stopped()?;
        if self.is_running() {
            return Err(ProtocolError::InvalidState(
                constants::ERR_SERVER_RUNNING.into(),
            ));
        }

        let listener = tcp::bind(&self.inner.config.address).await?;
        let addr = listener.local_addr()?;
        if let Ok(mut local) = self.inner.local_addr.lock() {
            *local = Some(addr);
        }

        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(accept_loop(inner, listener));
        if let Ok(mut task) = self.inner.accept_task.lock() {
            *task = Some(handle);
        }
        info!(%addr, "Server listening");
        Ok(addr)
    }

    /// Whether the accept loop is running
    pub fn is_running(&self) -> bool {
        self.inner
            .accept_task
            .lock()
            .map(|task| task.as_ref().is_some_and(|t| !t.is_finished()))
            .unwrap_or(false)
    }

    /// Address the listener is bound to, once started
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.local_addr.lock().ok().and_then(|addr| *addr)
    }

    /// Stop accepting, close every connection and wait for their read loops.
    ///
    /// Waits at most the configured shutdown timeout; tasks still running
    /// after that are aborted.
    #[instrument(skip(self))]
    pub async fn stop(&self) {
        info!("Shutting down server");
        self.inner.shutdown.cancel();

        for peer in self.inner.registry.drain() {
            peer.close().await;
        }

        let accept = self.inner.accept_task.lock().ok().and_then(|mut t| t.take());
        let mut connections = self
            .inner
            .connections
            .lock()
            .map(|mut set| std::mem::take(&mut *set))
            .unwrap_or_default();

        let drained = with_timeout(
            async {
                if let Some(accept) = accept {
                    if let Err(e) = accept.await {
                        warn!(error = %e, "Accept loop task failed");
                    }
                }
                while connections.join_next().await.is_some() {}
            },
            self.inner.config.shutdown_timeout,
        )
        .await;

        if drained.is_none() {
            warn!(
                remaining = connections.len(),
                "Shutdown timeout elapsed, aborting connection tasks"
            );
            connections.abort_all();
        }
        global_metrics().log_metrics();
        info!("Server stopped");
    }

    fn ensure_not_stopped(&self) -> Result<()> {
        if self.inner.shutdown.is_cancelled() {
            Err(ProtocolError::InvalidState("server has been stopped".into()))
        } else {
            Ok(())
        }
    }

    /// Register a handler for `code`, or for every message with `"ALL"`.
    pub fn on_message<F, Fut>(&self, code: &str, handler: F) -> Result<HandlerId>
    where
        F: Fn(Arc<Message>, Peer) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.inner.dispatcher.register(code, handler)
    }

    pub fn remove_handler(&self, id: HandlerId) -> Result<bool> {
        self.inner.dispatcher.unregister(id)
    }

    /// Serve an already established transport under `key`.
    ///
    /// Skips the handshake; registration follows the duplicate key policy
    /// and connection limit like any accepted connection.
    pub fn attach(&self, key: &str, transport: Transport) -> Result<Peer> {
        self.ensure_not_stopped()?;
        let Transport {
            sink,
            source,
            remote,
        } = transport;
        let peer = self.inner.new_peer(key.to_string(), remote, sink);
        if let Err(e) = self.inner.register(&peer) {
            global_metrics().connection_rejected();
            return Err(e);
        }
        self.inner.spawn_connection(peer.clone(), source);
        Ok(peer)
    }

    /// Send to one connection or to all of them.
    ///
    /// A keyed send reports `delivered: 1` or fails; a broadcast never fails
    /// as a whole and lists per-connection failures instead.
    pub async fn send(&self, msg: &Message, target: Target) -> Result<BroadcastReport> {
        match target {
            Target::Broadcast => Ok(self.broadcast(msg).await),
            Target::Key(key) => {
                self.send_to(&key, msg).await?;
                Ok(BroadcastReport {
                    delivered: 1,
                    failures: Vec::new(),
                })
            }
        }
    }

    /// Send to the connection registered under `key`.
    ///
    /// An unknown key fails with [`ProtocolError::UnknownTarget`].
    pub async fn send_to(&self, key: &str, msg: &Message) -> Result<()> {
        self.inner.registry.send_to(key, msg).await
    }

    pub async fn broadcast(&self, msg: &Message) -> BroadcastReport {
        self.inner.registry.broadcast(msg).await
    }

    /// Send `msg` to `key` and wait for the client's message with the same id
    pub async fn send_and_wait(
        &self,
        key: &str,
        msg: Message,
        timeout: Option<Duration>,
    ) -> Result<Reply> {
        let peer = self.inner.registry.get(key)?;
        let timeout = timeout.unwrap_or(crate::utils::timeout::RESPONSE_TIMEOUT);
        peer.send_and_wait(msg, timeout).await
    }

    /// Keys of every live connection
    pub fn connections(&self) -> Vec<String> {
        self.inner.registry.keys()
    }

    /// Handle of the connection registered under `key`
    pub fn connection(&self, key: &str) -> Result<Peer> {
        self.inner.registry.get(key)
    }
}

impl ServerInner {
    fn new_peer(
        &self,
        key: String,
        remote: Option<String>,
        sink: Arc<dyn FrameSink>,
    ) -> Peer {
        Peer::new(
            key,
            remote,
            sink,
            Arc::clone(&self.codec),
            self.shutdown.child_token(),
        )
    }

    /// Add `peer` to the registry, closing any connection it replaces.
    fn register(&self, peer: &Peer) -> Result<()> {
        if let Some(replaced) = self.registry.add(peer.clone())? {
            tokio::spawn(async move { replaced.close().await });
        }
        Ok(())
    }

    fn spawn_connection(self: &Arc<Self>, peer: Peer, source: Box<dyn FrameSource>) {
        let inner = Arc::clone(self);
        let Ok(mut connections) = self.connections.lock() else {
            error!(key = peer.key(), "{}", constants::ERR_LOCK_POISONED);
            return;
        };
        while connections.try_join_next().is_some() {}
        connections.spawn(async move { inner.serve(peer, source).await });
    }

    async fn serve(&self, peer: Peer, source: Box<dyn FrameSource>) {
        global_metrics().connection_established();
        info!(key = peer.key(), remote = ?peer.remote(), "Client connected");

        let reason = run_read_loop(&peer, source, &self.dispatcher, peer.clone()).await;

        self.registry.remove(peer.key(), peer.id());
        peer.close().await;
        global_metrics().connection_closed();
        info!(key = peer.key(), reason = ?reason, "Client disconnected");
    }

    /// Handshake a freshly accepted transport and start serving it
    async fn admit(self: Arc<Self>, mut transport: Transport) {
        let hello =
            handshake::server_receive_hello(transport.source.as_mut(), self.config.connection_timeout)
                .await;
        let key = match hello {
            Ok(Some(key)) => key,
            Ok(None) => transport.remote.clone().unwrap_or_else(|| {
                format!("anonymous-{}", self.anonymous.fetch_add(1, Ordering::Relaxed))
            }),
            Err(e) => {
                warn!(remote = ?transport.remote, error = %e, "Handshake failed");
                global_metrics().connection_rejected();
                let _ = transport.sink.close().await;
                return;
            }
        };

        // Answer before registering so no message can overtake the accept
        // frame; `register` rechecks in case another connection won the key.
        let verdict = if self.shutdown.is_cancelled() {
            Err(ProtocolError::ConnectionClosed)
        } else {
            self.registry.admit(&key)
        };
        if let Err(e) = handshake::server_respond(transport.sink.as_ref(), &verdict).await {
            debug!(key, error = %e, "Failed to answer handshake");
            return;
        }
        if verdict.is_err() {
            global_metrics().connection_rejected();
            return;
        }

        let Transport {
            sink,
            source,
            remote,
        } = transport;
        let peer = self.new_peer(key, remote, sink);
        if let Err(e) = self.register(&peer) {
            warn!(key = peer.key(), error = %e, "Registration lost after handshake");
            global_metrics().connection_rejected();
            peer.close().await;
            return;
        }
        self.spawn_connection(peer, source);
    }
}

async fn accept_loop(inner: Arc<ServerInner>, listener: TcpListener) {
    let codec = FrameCodec::new(inner.transport.max_payload_size);
    let send_timeout = inner.transport.send_timeout;

    loop {
        tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    debug!(%addr, "Accepted connection");
                    let transport = tcp::from_stream(stream, codec, send_timeout);
                    tokio::spawn(Arc::clone(&inner).admit(transport));
                }
                Err(e) => {
                    // Usually resource exhaustion; back off instead of spinning.
                    error!(error = %e, "Accept failed");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            },
        }
    }
    debug!("Accept loop stopped");
}
