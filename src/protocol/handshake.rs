//! Connection handshake.
//!
//! Before any message flows, a client announces which connection key it
//! wants to be registered under, and the server answers with an accept or a
//! reject frame:
//!
//! ```text
//! client -> server   [0x01] [key bytes, UTF-8, may be empty]
//! server -> client   [0x02] [0x01]                   accepted
//! server -> client   [0x02] [0x00] [reason, UTF-8]   rejected
//! ```
//!
//! Keys look like request paths (`/lobby`); the leading separator and
//! surrounding whitespace are stripped. A client without a key is registered
//! under its transport-level address instead.

use crate::error::{constants, ProtocolError, Result};
use crate::transport::{FrameSink, FrameSource};
use crate::utils::timeout::with_timeout_error;
use bytes::{BufMut, Bytes, BytesMut};
use std::time::Duration;
use tracing::{debug, instrument, warn};

const HELLO_TAG: u8 = 0x01;
const ACK_TAG: u8 = 0x02;
const ACCEPTED: u8 = 0x01;
const REJECTED: u8 = 0x00;

/// Normalize a requested connection key. Empty keys become `None`.
pub fn normalize_key(raw: &str) -> Option<String> {
    let key = raw.trim().trim_start_matches('/').trim();
    if key.is_empty() {
        None
    } else {
        Some(key.to_string())
    }
}

/// Build the client's opening frame
pub fn hello_frame(key: Option<&str>) -> Bytes {
    let key = key.unwrap_or_default();
    let mut buf = BytesMut::with_capacity(1 + key.len());
    buf.put_u8(HELLO_TAG);
    buf.put_slice(key.as_bytes());
    buf.freeze()
}

/// Parse the client's opening frame into a normalized key
pub fn parse_hello(frame: &[u8]) -> Result<Option<String>> {
    let (tag, key) = frame
        .split_first()
        .ok_or_else(|| ProtocolError::HandshakeError(constants::ERR_HANDSHAKE_EMPTY.into()))?;
    if *tag != HELLO_TAG {
        return Err(ProtocolError::HandshakeError(
            constants::ERR_HANDSHAKE_TAG.into(),
        ));
    }
    let key = std::str::from_utf8(key)
        .map_err(|_| ProtocolError::HandshakeError(constants::ERR_HANDSHAKE_KEY.into()))?;
    Ok(normalize_key(key))
}

pub fn accept_frame() -> Bytes {
    Bytes::from_static(&[ACK_TAG, ACCEPTED])
}

pub fn reject_frame(reason: &str) -> Bytes {
    let mut buf = BytesMut::with_capacity(2 + reason.len());
    buf.put_u8(ACK_TAG);
    buf.put_u8(REJECTED);
    buf.put_slice(reason.as_bytes());
    buf.freeze()
}

/// Parse the server's answer. A rejection becomes a handshake error carrying
/// the server's reason.
pub fn parse_ack(frame: &[u8]) -> Result<()> {
    match frame {
        [ACK_TAG, ACCEPTED] => Ok(()),
        [ACK_TAG, REJECTED, reason @ ..] => Err(ProtocolError::HandshakeError(format!(
            "rejected by server: {}",
            String::from_utf8_lossy(reason)
        ))),
        [] => Err(ProtocolError::HandshakeError(
            constants::ERR_HANDSHAKE_EMPTY.into(),
        )),
        _ => Err(ProtocolError::HandshakeError(
            constants::ERR_HANDSHAKE_TAG.into(),
        )),
    }
}

/// Client side: announce `key` and wait for the server's verdict
#[instrument(skip(sink, source))]
pub async fn client_handshake(
    sink: &dyn FrameSink,
    source: &mut dyn FrameSource,
    key: Option<&str>,
    timeout: Duration,
) -> Result<()> {
    with_timeout_error(
        async {
            sink.send(hello_frame(key)).await?;
            let frame = source.receive().await?.ok_or_else(|| {
                ProtocolError::HandshakeError(constants::ERR_HANDSHAKE_CLOSED.into())
            })?;
            parse_ack(&frame)
        },
        timeout,
    )
    .await?;
    debug!("Handshake accepted");
    Ok(())
}

/// Server side: read the client's opening frame
pub async fn server_receive_hello(
    source: &mut dyn FrameSource,
    timeout: Duration,
) -> Result<Option<String>> {
    with_timeout_error(
        async {
            let frame = source.receive().await?.ok_or_else(|| {
                ProtocolError::HandshakeError(constants::ERR_HANDSHAKE_CLOSED.into())
            })?;
            parse_hello(&frame)
        },
        timeout,
    )
    .await
}

/// Server side: tell the client whether it was registered
pub async fn server_respond(sink: &dyn FrameSink, outcome: &Result<()>) -> Result<()> {
    match outcome {
        Ok(()) => sink.send(accept_frame()).await,
        Err(e) => {
            warn!(error = %e, "Rejecting connection");
            let reason = e.to_string();
            sink.send(reject_frame(&reason)).await?;
            sink.close().await
        }
    }
}
