use crate::config::{ClientConfig, NetworkConfig, TransportConfig};
use crate::core::codec::FrameCodec;
use crate::core::serialization::{JsonCodec, MessageCodec};
use crate::error::{constants, ProtocolError, Result};
use crate::protocol::correlation::Reply;
use crate::protocol::dispatcher::{Dispatcher, HandlerId};
use crate::protocol::handshake;
use crate::protocol::message::Message;
use crate::service::endpoint::{run_read_loop, ConnectionState, Peer};
use crate::transport::{tcp, FrameSink, Transport};
use crate::utils::metrics::global_metrics;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Key the client's own [`Peer`] is known by in logs
const SERVER_PEER_KEY: &str = "server";

struct ClientInner {
    config: ClientConfig,
    transport: TransportConfig,
    codec: Arc<dyn MessageCodec>,
    dispatcher: Arc<Dispatcher<Peer>>,
    state: Arc<watch::Sender<ConnectionState>>,
    connection: Mutex<Option<Peer>>,
    reader: Mutex<Option<JoinHandle<()>>>,
    // Serializes connect/disconnect transitions.
    transition: tokio::sync::Mutex<()>,
}

/// Client endpoint: one connection to one server.
///
/// A fresh client is in [`ConnectionState::Connecting`] until [`connect`]
/// succeeds. Once the connection closes the client is
/// [`ConnectionState::Closed`] for good; build a new client to reconnect.
///
/// Cloning yields another handle to the same connection.
///
/// # Example
/// ```ignore
/// let client = Client::new(ClientConfig::with_address("127.0.0.1:8765"));
/// client.on_message("PONG", |msg, _peer| async move {
///     println!("pong {}", msg.id());
///     Ok(())
/// })?;
/// client.connect().await?;
/// let reply = client.send_and_wait(Message::empty("PING"), None).await?;
/// ```
///
/// [`connect`]: Client::connect
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    /// Client with default transport settings and the JSON codec
    pub fn new(config: ClientConfig) -> Self {
        Self::with_codec(
            config,
            TransportConfig::default(),
            Arc::new(JsonCodec::default()),
        )
    }

    pub fn from_config(config: &NetworkConfig) -> Self {
        Self::with_codec(
            config.client.clone(),
            config.transport.clone(),
            Arc::new(JsonCodec::default()),
        )
    }

    /// Client with an explicit message codec
    pub fn with_codec(
        config: ClientConfig,
        transport: TransportConfig,
        codec: Arc<dyn MessageCodec>,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Connecting);
        Self {
            inner: Arc::new(ClientInner {
                config,
                transport,
                codec,
                dispatcher: Arc::new(Dispatcher::new()),
                state: Arc::new(state),
                connection: Mutex::new(None),
                reader: Mutex::new(None),
                transition: tokio::sync::Mutex::new(()),
            }),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// Current lifecycle state
    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    /// Connect over TCP to the configured address and perform the handshake.
    ///
    /// Failure to reach the server or a rejected handshake is returned to the
    /// caller; the client stays usable for another attempt.
    #[instrument(skip(self), fields(address = %self.inner.config.address))]
    pub async fn connect(&self) -> Result<()> {
        let _transition = self.inner.transition.lock().await;
        self.ensure_connectable()?;

        let config = &self.inner.config;
        let mut transport = tcp::connect(
            &config.address,
            FrameCodec::new(self.inner.transport.max_payload_size),
            config.connection_timeout,
            self.inner.transport.send_timeout,
        )
        .await?;

        let handshake = handshake::client_handshake(
            transport.sink.as_ref(),
            transport.source.as_mut(),
            config.connection_key.as_deref(),
            config.connection_timeout,
        )
        .await;
        if let Err(e) = handshake {
            let _ = transport.sink.close().await;
            return Err(e);
        }

        self.start(transport);
        info!(key = ?config.connection_key, "Connected to server");
        Ok(())
    }

    /// Start serving an already established transport.
    ///
    /// No handshake is performed; use this for in-process links such as the
    /// other half of [`Server::attach`](crate::service::server::Server::attach).
    pub async fn connect_with(&self, transport: Transport) -> Result<()> {
        let _transition = self.inner.transition.lock().await;
        self.ensure_connectable()?;
        self.start(transport);
        debug!("Connected over supplied transport");
        Ok(())
    }

    fn ensure_connectable(&self) -> Result<()> {
        match self.state() {
            ConnectionState::Connecting => Ok(()),
            ConnectionState::Open => Err(ProtocolError::InvalidState(
                constants::ERR_ALREADY_CONNECTED.into(),
            )),
            ConnectionState::Closing | ConnectionState::Closed => Err(
                ProtocolError::InvalidState(constants::ERR_CLIENT_CLOSED.into()),
            ),
        }
    }

    fn start(&self, transport: Transport) {
        let Transport {
            sink,
            source,
            remote,
        } = transport;
        let peer = Peer::new(
            SERVER_PEER_KEY.to_string(),
            remote,
            sink,
            Arc::clone(&self.inner.codec),
            CancellationToken::new(),
        );

        if let Ok(mut connection) = self.inner.connection.lock() {
            *connection = Some(peer.clone());
        }
        self.inner.state.send_replace(ConnectionState::Open);
        global_metrics().connection_established();

        let dispatcher = Arc::clone(&self.inner.dispatcher);
        let state = Arc::clone(&self.inner.state);
        let handle = tokio::spawn(async move {
            let reason = run_read_loop(&peer, source, &dispatcher, peer.clone()).await;
            peer.close().await;
            state.send_replace(ConnectionState::Closed);
            global_metrics().connection_closed();
            info!(reason = ?reason, "Disconnected from server");
        });

        if let Ok(mut reader) = self.inner.reader.lock() {
            *reader = Some(handle);
        }
    }

    /// Close the connection and wait for the read loop to finish.
    ///
    /// Pending `send_and_wait` calls fail with `ConnectionClosed`. Calling
    /// this on a client that never connected just marks it closed.
    pub async fn disconnect(&self) {
        let _transition = self.inner.transition.lock().await;
        if self.state() == ConnectionState::Closed {
            return;
        }
        self.inner.state.send_replace(ConnectionState::Closing);

        let peer = self.peer().ok();
        if let Some(peer) = peer {
            peer.close().await;
        }
        let reader = self.inner.reader.lock().ok().and_then(|mut r| r.take());
        if let Some(reader) = reader {
            if let Err(e) = reader.await {
                warn!(error = %e, "Read loop task failed");
            }
        }
        self.inner.state.send_replace(ConnectionState::Closed);
    }

    /// Wait until the connection is closed, by either side
    pub async fn wait_closed(&self) {
        let mut rx = self.inner.state.subscribe();
        let _ = rx.wait_for(|state| *state == ConnectionState::Closed).await;
    }

    fn peer(&self) -> Result<Peer> {
        self.inner
            .connection
            .lock()
            .map_err(|_| ProtocolError::Custom(constants::ERR_LOCK_POISONED.into()))?
            .clone()
            .ok_or(ProtocolError::NotConnected)
    }

    /// Fire-and-forget send.
    ///
    /// Fails with `NotConnected` before [`connect`](Client::connect) and with
    /// `ConnectionClosed` after the connection went away.
    pub async fn send(&self, msg: &Message) -> Result<()> {
        self.peer()?.send(msg).await
    }

    /// Send `msg` and wait for the server's message with the same id.
    ///
    /// `timeout` defaults to the configured response timeout. No reply in
    /// time yields [`Reply::TimedOut`].
    pub async fn send_and_wait(&self, msg: Message, timeout: Option<Duration>) -> Result<Reply> {
        let timeout = timeout.unwrap_or(self.inner.config.response_timeout);
        self.peer()?.send_and_wait(msg, timeout).await
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
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use crate::transport::{memory, FrameSource};

    #[tokio::test]
    async fn test_send_before_connect() {
        let client = Client::new(ClientConfig::default());
        assert_eq!(client.state(), ConnectionState::Connecting);
        assert!(matches!(
            client.send(&Message::empty("PING")).await,
            Err(ProtocolError::NotConnected)
        ));
        assert!(matches!(
            client.send_and_wait(Message::empty("PING"), None).await,
            Err(ProtocolError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_closed_is_terminal() {
        let client = Client::new(ClientConfig::default());
        let (local, _remote) = memory::pair(4);
        client.connect_with(local).await.unwrap();
        assert!(client.is_connected());

        client.disconnect().await;
        assert_eq!(client.state(), ConnectionState::Closed);

        let (again, _other) = memory::pair(4);
        assert!(matches!(
            client.connect_with(again).await,
            Err(ProtocolError::InvalidState(_))
        ));
        assert!(matches!(
            client.send(&Message::empty("PING")).await,
            Err(ProtocolError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_disconnect_during_handler_fails_pending_wait() {
        let client = Client::new(ClientConfig::default());
        let started = Arc::new(tokio::sync::Notify::new());
        let signal = Arc::clone(&started);
        client
            .on_message("SLOW", move |_msg, _peer| {
                let signal = Arc::clone(&signal);
                async move {
                    signal.notify_one();
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    Ok(())
                }
            })
            .unwrap();

        let (local, mut remote) = memory::pair(4);
        client.connect_with(local).await.unwrap();
        let codec = JsonCodec::default();
        remote
            .sink
            .send(codec.encode(&Message::empty("SLOW")).unwrap())
            .await
            .unwrap();
        started.notified().await;

        let waiter = {
            let client = client.clone();
            tokio::spawn(async move {
                client
                    .send_and_wait(Message::empty("QUERY"), Some(Duration::from_secs(5)))
                    .await
            })
        };
        assert!(remote.source.receive().await.unwrap().is_some());

        tokio::time::timeout(Duration::from_secs(1), client.disconnect())
            .await
            .expect("disconnect must not wait for the handler");
        let result = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(ProtocolError::ConnectionClosed)));
        assert_eq!(client.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_peer_close_fails_pending_wait() {
        let client = Client::new(ClientConfig::default());
        let (local, mut remote) = memory::pair(4);
        client.connect_with(local).await.unwrap();

        let waiter = {
            let client = client.clone();
            tokio::spawn(async move {
                client
                    .send_and_wait(Message::empty("SLOW"), Some(Duration::from_secs(5)))
                    .await
            })
        };

        // The request reaches the remote side, which then hangs up.
        assert!(remote.source.receive().await.unwrap().is_some());
        remote.sink.close().await.unwrap();

        assert!(matches!(
            waiter.await.unwrap(),
            Err(ProtocolError::ConnectionClosed)
        ));
        client.wait_closed().await;
        assert_eq!(client.state(), ConnectionState::Closed);
    }
}
