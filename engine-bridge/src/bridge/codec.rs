//! Protocol codec: envelope validation plus NDJSON serialization.
//!
//! Outgoing commands are validated before they reach the write queue.
//! Incoming lines that fail to decode are reported, never fatal: the caller
//! logs and moves on to the next line.

use tokio_util::bytes::{BufMut, Bytes, BytesMut};

use super::protocol::Message;

/// Frames larger than this are logged at info level.
const LARGE_FRAME_BYTES: usize = 100_000;

#[derive(Debug, thiserror::Error)]
pub enum EncodingError {
    #[error("message has no type")]
    MissingType,
    #[error("message of type '{0}' has no id")]
    MissingId(String),
    #[error("failed to serialize message: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("invalid JSON: {0}")]
    InvalidJson(#[source] serde_json::Error),
    #[error("message has no type")]
    MissingType,
    #[error("malformed message: {0}")]
    Malformed(#[source] serde_json::Error),
}

/// Serialize `message` as one JSON line terminated by `\n`.
pub fn encode(message: &Message) -> Result<Bytes, EncodingError> {
    if message.kind.is_empty() {
        return Err(EncodingError::MissingType);
    }
    if message.id().is_none_or(|id| id.is_empty()) {
        return Err(EncodingError::MissingId(message.kind.to_string()));
    }

    let json = serde_json::to_vec(message)?;
    let json_len = json.len();
    tracing::trace!(kind = %message.kind, json_size_bytes = json_len, "Encoding frame");
    if json_len > LARGE_FRAME_BYTES {
        tracing::info!(
            kind = %message.kind,
            json_size_bytes = json_len,
            json_size_kb = json_len / 1024,
            "Large frame being encoded"
        );
    }

    let mut buf = BytesMut::with_capacity(json_len + 1);
    buf.put_slice(&json);
    buf.put_u8(b'\n');
    Ok(buf.freeze())
}

/// Parse one framed line into a [`Message`].
pub fn decode(line: &str) -> Result<Message, DecodeError> {
    let value: serde_json::Value = serde_json::from_str(line).map_err(DecodeError::InvalidJson)?;

    let has_type = value
        .get("type")
        .and_then(|t| t.as_str())
        .is_some_and(|t| !t.trim().is_empty());
    if !has_type {
        return Err(DecodeError::MissingType);
    }

    serde_json::from_value(value).map_err(DecodeError::Malformed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::protocol::MessageType;
    use serde_json::json;

    #[test]
    fn encode_appends_single_newline() {
        let msg = Message::with_id("update_settings", "s-1", json!({"speed": 2}));
        let bytes = encode(&msg).unwrap();
        assert_eq!(bytes.last(), Some(&b'\n'));
        assert_eq!(bytes.iter().filter(|b| **b == b'\n').count(), 1);
    }

    #[test]
    fn encode_escapes_embedded_newlines() {
        let msg = Message::with_id("load_image", "l-1", json!({"note": "two\nlines"}));
        let bytes = encode(&msg).unwrap();
        assert_eq!(bytes.iter().filter(|b| **b == b'\n').count(), 1);
        let decoded = decode(std::str::from_utf8(&bytes).unwrap().trim_end()).unwrap();
        assert_eq!(decoded.data["note"], "two\nlines");
    }

    #[test]
    fn encode_rejects_missing_id() {
        let mut msg = Message::with_id("load_image", "l-1", json!({}));
        msg.id = None;
        assert!(matches!(encode(&msg), Err(EncodingError::MissingId(kind)) if kind == "load_image"));

        msg.id = Some(String::new());
        assert!(matches!(encode(&msg), Err(EncodingError::MissingId(_))));
    }

    #[test]
    fn encode_rejects_missing_type() {
        let msg = Message::with_id(MessageType::Other(" ".to_string()), "x", json!({}));
        assert!(matches!(encode(&msg), Err(EncodingError::MissingType)));
    }

    #[test]
    fn decode_fills_defaults() {
        let msg = decode(r#"{"type":"metrics_update"}"#).unwrap();
        assert_eq!(msg.kind, MessageType::MetricsUpdate);
        assert_eq!(msg.id, None);
        assert_eq!(msg.timestamp, 0);
        assert_eq!(msg.data, json!({}));
    }

    #[test]
    fn decode_rejects_invalid_json() {
        assert!(matches!(decode("{not json"), Err(DecodeError::InvalidJson(_))));
        assert!(matches!(decode(""), Err(DecodeError::InvalidJson(_))));
    }

    #[test]
    fn decode_rejects_missing_type() {
        assert!(matches!(
            decode(r#"{"id":"x","data":{}}"#),
            Err(DecodeError::MissingType)
        ));
        assert!(matches!(decode(r#"{"type":42}"#), Err(DecodeError::MissingType)));
        assert!(matches!(decode("[1,2]"), Err(DecodeError::MissingType)));
    }

    #[test]
    fn decode_rejects_wrongly_typed_fields() {
        assert!(matches!(
            decode(r#"{"type":"status_update","timestamp":"yesterday"}"#),
            Err(DecodeError::Malformed(_))
        ));
    }

    #[test]
    fn decode_failure_does_not_affect_next_line() {
        let lines = [
            r#"{"type":"status_update","data":{"progress":0.5}}"#,
            r#"{"type": "status_upd"#,
            r#"{"type":"error","id":"load-001","data":{"message":"boom"}}"#,
        ];
        let results: Vec<_> = lines.iter().map(|l| decode(l)).collect();
        assert!(results[0].is_ok());
        assert!(results[1].is_err());
        let third = results[2].as_ref().unwrap();
        assert_eq!(third.id(), Some("load-001"));
        assert!(third.is_error());
    }

    #[test]
    fn decode_tolerates_carriage_return() {
        let msg = decode("{\"type\":\"heartbeat\",\"id\":\"hb-1\"}\r").unwrap();
        assert_eq!(msg.kind, MessageType::Heartbeat);
    }
}
