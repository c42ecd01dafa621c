//! # Message Serialization
//!
//! Abstraction over how a [`Message`] is turned into frame bytes and back.
//! Endpoints hold an `Arc<dyn MessageCodec>` and never serialize directly,
//! so an application can swap the encoding without touching the dispatch or
//! correlation machinery.
//!
//! ## Formats
//! - **JSON** (default): the interoperable text form, `{"id", "code", "data"}`
//! - **Pretty JSON**: same shape, indented, handy when tracing raw frames
//!
//! ## Usage
//! ```
//! use fastsocket::core::serialization::{JsonCodec, MessageCodec};
//! use fastsocket::protocol::message::Message;
//!
//! let codec = JsonCodec::default();
//! let msg = Message::empty("PING");
//! let bytes = codec.encode(&msg).unwrap();
//! assert_eq!(codec.decode(&bytes).unwrap(), msg);
//! ```

use crate::error::{ProtocolError, Result};
use crate::protocol::message::Message;
use bytes::Bytes;
use std::fmt;

/// Supported serialization formats
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SerializationFormat {
    /// Compact JSON (default)
    #[default]
    Json,
    /// Indented JSON
    PrettyJson,
}

impl SerializationFormat {
    /// Get human-readable name
    pub fn name(self) -> &'static str {
        match self {
            SerializationFormat::Json => "JSON",
            SerializationFormat::PrettyJson => "Pretty JSON",
        }
    }
}

/// Encode/decode contract between endpoints and the wire.
pub trait MessageCodec: Send + Sync + fmt::Debug + 'static {
    /// Encode a message into one frame payload
    fn encode(&self, msg: &Message) -> Result<Bytes>;

    /// Decode one frame payload, failing with [`ProtocolError::DecodeError`]
    fn decode(&self, frame: &[u8]) -> Result<Message>;
}

/// JSON message codec
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec {
    format: SerializationFormat,
}

impl JsonCodec {
    pub fn new(format: SerializationFormat) -> Self {
        Self { format }
    }

    pub fn format(&self) -> SerializationFormat {
        self.format
    }
}

impl MessageCodec for JsonCodec {
    fn encode(&self, msg: &Message) -> Result<Bytes> {
        let bytes = match self.format {
            SerializationFormat::Json => serde_json::to_vec(msg),
            SerializationFormat::PrettyJson => serde_json::to_vec_pretty(msg),
        }
        .map_err(ProtocolError::Serialization)?;
        Ok(Bytes::from(bytes))
    }

    fn decode(&self, frame: &[u8]) -> Result<Message> {
        // Both formats share one parser; whitespace is irrelevant to JSON.
        Message::from_bytes(frame)
    }
}
