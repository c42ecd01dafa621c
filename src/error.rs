//! # Error Types
//!
//! Error handling for the messaging layer.
//!
//! This module defines every error variant that can surface from an endpoint,
//! from low-level I/O failures to correlation and routing problems.
//!
//! ## Error Categories
//! - **I/O Errors**: Socket and file system failures
//! - **Framing Errors**: Bad magic bytes, unsupported versions, oversized frames
//! - **Message Errors**: Frames that do not decode into a valid message
//! - **Correlation Errors**: Duplicate pending ids, closed connections
//! - **Routing Errors**: Unknown server targets, rejected connections
//!
//! Only connection establishment failures are meant to reach the caller as hard
//! failures. Everything that happens after a connection is open is reported
//! through these variants and handled locally by the endpoint.
//!
//! ## Example Usage
//! ```rust
//! use fastsocket::error::{ProtocolError, Result};
//! use fastsocket::protocol::message::Message;
//! use tracing::{error, info};
//!
//! fn parse(frame: &[u8]) -> Result<Message> {
//!     Message::from_bytes(frame)
//! }
//!
//! match parse(br#"{"id":1,"code":"PING","data":{}}"#) {
//!     Ok(msg) => info!(code = msg.code(), "decoded"),
//!     Err(e) => error!(error = %e, "decode failed"),
//! }
//! ```

use std::io;
use thiserror::Error;

/// Error message constants to reduce allocations in error paths.
pub mod constants {
    /// Lock-related error messages
    pub const ERR_DISPATCHER_WRITE_LOCK: &str = "Failed to acquire write lock on dispatcher";
    pub const ERR_DISPATCHER_READ_LOCK: &str = "Failed to acquire read lock on dispatcher";
    pub const ERR_CORRELATION_LOCK: &str = "Failed to acquire lock on correlation table";
    pub const ERR_REGISTRY_LOCK: &str = "Failed to acquire lock on connection registry";
    pub const ERR_LOCK_POISONED: &str = "Synchronization primitive poisoned";

    /// Framing errors
    pub const ERR_INVALID_HEADER: &str = "Invalid frame header";

    /// Connection errors
    pub const ERR_CONNECTION_CLOSED: &str = "Connection closed";
    pub const ERR_NOT_CONNECTED: &str = "Not connected to the server";
    pub const ERR_ALREADY_CONNECTED: &str = "Client is already connected";
    pub const ERR_CLIENT_CLOSED: &str = "Client is closed; create a new client to reconnect";
    pub const ERR_SERVER_RUNNING: &str = "Server is already running";
    pub const ERR_TIMEOUT: &str = "Operation timed out";

    /// Handshake errors
    pub const ERR_HANDSHAKE_EMPTY: &str = "Empty handshake frame";
    pub const ERR_HANDSHAKE_TAG: &str = "Unexpected handshake frame tag";
    pub const ERR_HANDSHAKE_KEY: &str = "Connection key is not valid UTF-8";
    pub const ERR_HANDSHAKE_CLOSED: &str = "Connection closed during handshake";
    pub const ERR_TOO_MANY_CONNECTIONS: &str = "Maximum number of connections reached";

    /// Handler errors
    pub const ERR_HANDLER_PANICKED: &str = "Handler panicked";
}

/// ProtocolError is the primary error type for all endpoint operations
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Decode error: {0}")]
    DecodeError(String),

    #[error("Transport error: {0}")]
    TransportError(String),

    #[error("{}", constants::ERR_CONNECTION_CLOSED)]
    ConnectionClosed,

    #[error("{}", constants::ERR_NOT_CONNECTED)]
    NotConnected,

    #[error("{}", constants::ERR_INVALID_HEADER)]
    InvalidHeader,

    #[error("Unsupported protocol version: {0}")]
    UnsupportedVersion(u8),

    #[error("Frame too large: {0} bytes")]
    OversizedPacket(usize),

    #[error("Handshake failed: {0}")]
    HandshakeError(String),

    #[error("{}", constants::ERR_TIMEOUT)]
    Timeout,

    #[error("Unknown target: {0}")]
    UnknownTarget(String),

    #[error("Handler failed: {0}")]
    HandlerError(String),

    #[error("Duplicate pending request id: {0}")]
    DuplicatePendingRequest(u64),

    #[error("Duplicate connection key: {0}")]
    DuplicateConnection(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Custom error: {0}")]
    Custom(String),
}

impl ProtocolError {
    /// Whether the error means the underlying connection is gone.
    pub fn is_connection_closed(&self) -> bool {
        match self {
            ProtocolError::ConnectionClosed => true,
            ProtocolError::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::BrokenPipe
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::UnexpectedEof
            ),
            _ => false,
        }
    }
}

/// Type alias for Results using ProtocolError
pub type Result<T> = std::result::Result<T, ProtocolError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_closed_classification() {
        assert!(ProtocolError::ConnectionClosed.is_connection_closed());
        assert!(ProtocolError::Io(io::Error::from(io::ErrorKind::BrokenPipe)).is_connection_closed());
        assert!(!ProtocolError::Timeout.is_connection_closed());
        assert!(!ProtocolError::UnknownTarget("a".into()).is_connection_closed());
    }

    #[test]
    fn test_display_includes_context() {
        let err = ProtocolError::DuplicatePendingRequest(42);
        assert_eq!(err.to_string(), "Duplicate pending request id: 42");

        let err = ProtocolError::UnknownTarget("lobby".into());
        assert_eq!(err.to_string(), "Unknown target: lobby");
    }

    #[test]
    fn test_unit_variants_use_message_constants() {
        assert_eq!(
            ProtocolError::ConnectionClosed.to_string(),
            constants::ERR_CONNECTION_CLOSED
        );
        assert_eq!(
            ProtocolError::NotConnected.to_string(),
            constants::ERR_NOT_CONNECTED
        );
        assert_eq!(
            ProtocolError::InvalidHeader.to_string(),
            constants::ERR_INVALID_HEADER
        );
        assert_eq!(ProtocolError::Timeout.to_string(), constants::ERR_TIMEOUT);
    }
}
