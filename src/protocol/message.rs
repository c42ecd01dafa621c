//! # Message Envelope
//!
//! Every frame exchanged between peers carries exactly one [`Message`]:
//! an identifier used for request/response correlation, a type code used
//! for handler dispatch, and a free-form JSON object payload.
//!
//! ## Wire Format
//! ```text
//! {"id": <u64>, "code": "<string>", "data": { ... }}
//! ```
//! All three fields are required and no other field is accepted, so any
//! peer implementing the same JSON shape can interoperate.
//!
//! Messages are immutable once built. Building a reply produces a new
//! message that reuses the request's `id`.

use crate::error::{ProtocolError, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Free-form message payload.
pub type Payload = Map<String, Value>;

/// Generate a message id.
///
/// Ids are random; collisions between requests pending on one endpoint are
/// reported as `DuplicatePendingRequest` rather than silently merged.
pub fn generate_id() -> u64 {
    rand::random::<u64>()
}

/// Convert an arbitrary JSON value into a payload object.
///
/// `null` becomes an empty payload; any other non-object value is rejected.
pub fn payload_from_value(value: Value) -> Result<Payload> {
    match value {
        Value::Object(map) => Ok(map),
        Value::Null => Ok(Payload::new()),
        other => Err(ProtocolError::DecodeError(format!(
            "message data must be a JSON object, got {other}"
        ))),
    }
}

/// Message envelope exchanged over a connection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Message {
    id: u64,
    code: String,
    data: Payload,
}

impl Message {
    /// Create a message with a freshly generated id.
    pub fn new(code: impl Into<String>, data: Payload) -> Self {
        Self::with_id(generate_id(), code, data)
    }

    /// Create a message with an explicit id.
    pub fn with_id(id: u64, code: impl Into<String>, data: Payload) -> Self {
        Self {
            id,
            code: code.into(),
            data,
        }
    }

    /// Create a message with a generated id and an empty payload.
    pub fn empty(code: impl Into<String>) -> Self {
        Self::new(code, Payload::new())
    }

    /// Build a message from a JSON value payload such as `json!({"x": 1})`.
    pub fn from_value(id: Option<u64>, code: impl Into<String>, data: Value) -> Result<Self> {
        let data = payload_from_value(data)?;
        Ok(match id {
            Some(id) => Self::with_id(id, code, data),
            None => Self::new(code, data),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn code(&self) -> &str {
        &self.code
    }

    pub fn data(&self) -> &Payload {
        &self.data
    }

    /// Look up a single payload field.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }

    /// Build a reply carrying this message's id, so the sender's pending
    /// wait (if any) resolves with it.
    pub fn reply(&self, code: impl Into<String>, data: Payload) -> Message {
        Message::with_id(self.id, code, data)
    }

    /// Copy of this message under a different code.
    pub fn with_code(&self, code: impl Into<String>) -> Message {
        Message::with_id(self.id, code, self.data.clone())
    }

    /// Copy of this message under a different id.
    pub fn renumbered(&self, id: u64) -> Message {
        Message::with_id(id, self.code.clone(), self.data.clone())
    }

    /// Serialize to the JSON text form.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Serialize to UTF-8 JSON bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Parse the JSON text form.
    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| ProtocolError::DecodeError(e.to_string()))
    }

    /// Parse UTF-8 JSON bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| ProtocolError::DecodeError(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use serde_json::json;

    #[test]
    fn test_generated_ids_differ() {
        let a = Message::empty("PING");
        let b = Message::empty("PING");
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_payload_not_shared_between_constructions() {
        let a = Message::empty("A");
        let b = Message::from_value(None, "B", json!({"x": 1})).unwrap();
        assert!(a.data().is_empty());
        assert_eq!(b.get("x"), Some(&json!(1)));
        assert!(Message::empty("C").data().is_empty());
    }

    #[test]
    fn test_wire_field_names() {
        let msg = Message::from_value(Some(1), "PING", json!({"x": 1})).unwrap();
        let value: Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();
        assert_eq!(value, json!({"id": 1, "code": "PING", "data": {"x": 1}}));
    }

    #[test]
    fn test_decode_rejects_malformed_input() {
        let cases = [
            r#"{"code":"PING","data":{}}"#,
            r#"{"id":1,"data":{}}"#,
            r#"{"id":1,"code":"PING"}"#,
            r#"{"id":"1","code":"PING","data":{}}"#,
            r#"{"id":1,"code":"PING","data":[1,2]}"#,
            r#"{"id":1,"code":"PING","data":{},"extra":true}"#,
            r#"{"id":-1,"code":"PING","data":{}}"#,
            "not json",
        ];
        for case in cases {
            let result = Message::from_json(case);
            assert!(
                matches!(result, Err(ProtocolError::DecodeError(_))),
                "expected decode error for {case}"
            );
        }
    }

    #[test]
    fn test_reply_keeps_id_and_leaves_request_untouched() {
        let request = Message::from_value(Some(7), "PING", json!({"x": 1})).unwrap();
        let reply = request.reply("PONG", payload_from_value(json!({"ok": true})).unwrap());
        assert_eq!(reply.id(), 7);
        assert_eq!(reply.code(), "PONG");
        assert_eq!(request.code(), "PING");
        assert_eq!(request.get("x"), Some(&json!(1)));

        let renamed = request.with_code("ECHO");
        assert_eq!(renamed.id(), 7);
        assert_eq!(renamed.data(), request.data());

        assert_eq!(request.renumbered(9).id(), 9);
    }

    #[test]
    fn test_payload_from_value() {
        assert!(payload_from_value(Value::Null).unwrap().is_empty());
        assert!(payload_from_value(json!("text")).is_err());
    }
}
