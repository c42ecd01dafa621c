//! # fastsocket
//!
//! Bidirectional, message-oriented client/server communication over
//! persistent connections.
//!
//! Peers exchange JSON envelopes of the shape `{id, code, data}`. Inbound
//! messages are dispatched to handlers registered by `code` (plus wildcard
//! `"ALL"` handlers), and any message may be sent as a request whose reply is
//! matched back to the caller by `id`. A server keeps a registry of live
//! connections keyed by the key each client announces, and can address one
//! connection or broadcast to all of them.
//!
//! ## Layers
//! ```text
//! service    Client, Server, Peer, ConnectionRegistry
//! protocol   Message, Dispatcher, CorrelationTable, handshake
//! core       FrameCodec (length-prefixed frames), MessageCodec (JSON)
//! transport  FrameSink / FrameSource over TCP or in-memory channels
//! ```
//!
//! ## Example
//! ```ignore
//! use fastsocket::{Client, ClientConfig, Message, Payload, Server, ServerConfig};
//!
//! let server = Server::new(ServerConfig::with_address("127.0.0.1:8765"));
//! server.on_message("PING", |msg, peer| async move {
//!     peer.send(&msg.reply("PONG", Payload::new())).await
//! })?;
//! server.start().await?;
//!
//! let client = Client::new(ClientConfig::with_address("127.0.0.1:8765"));
//! client.connect().await?;
//! let reply = client.send_and_wait(Message::empty("PING"), None).await?;
//! ```

#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod config;
pub mod core;
pub mod error;
pub mod protocol;
pub mod service;
pub mod transport;
pub mod utils;

pub use config::{
    ClientConfig, DuplicateKeyPolicy, LoggingConfig, NetworkConfig, ServerConfig,
    TransportConfig, WILDCARD_CODE,
};
pub use error::{ProtocolError, Result};
pub use protocol::correlation::Reply;
pub use protocol::dispatcher::{DispatchSummary, HandlerId};
pub use protocol::message::{Message, Payload};
pub use service::{BroadcastReport, Client, ConnectionState, Peer, Server, Target};
