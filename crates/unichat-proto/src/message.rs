//! Hub message envelope and record framing.
//!
//! Every hub message is a JSON object with a numeric `type` discriminator,
//! terminated by [`RECORD_SEPARATOR`]. A single transport message may carry
//! several records, and a record may in principle be split across transport
//! messages, so inbound text goes through a [`RecordReader`].
//!
//! # Invariants
//!
//! - Encoded records always end with exactly one separator and never contain
//!   another one (JSON escapes control characters in strings).
//! - Decoding never panics on malformed input; everything maps to
//!   [`ProtocolError`].

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::{ProtocolError, Result};

/// ASCII record separator terminating every hub record.
pub const RECORD_SEPARATOR: char = '\u{1e}';

/// Maximum bytes buffered while waiting for a record separator.
pub const MAX_PENDING_BYTES: usize = 1024 * 1024;

/// Numeric message types of the JSON hub protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    /// Call a method on the remote side
    Invocation = 1,
    /// Item of a streaming result
    StreamItem = 2,
    /// Result (or error) of an invocation
    Completion = 3,
    /// Start a streaming invocation
    StreamInvocation = 4,
    /// Cancel a streaming invocation
    CancelInvocation = 5,
    /// Keep-alive
    Ping = 6,
    /// Connection is being closed by the sender
    Close = 7,
}

impl MessageType {
    /// Convert from the wire discriminator. `None` for unknown values.
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Invocation),
            2 => Some(Self::StreamItem),
            3 => Some(Self::Completion),
            4 => Some(Self::StreamInvocation),
            5 => Some(Self::CancelInvocation),
            6 => Some(Self::Ping),
            7 => Some(Self::Close),
            _ => None,
        }
    }

    /// Wire discriminator.
    pub const fn to_u8(self) -> u8 {
        self as u8
    }
}

/// Hub messages this client sends or understands.
///
/// Streaming message types are valid protocol but unused by the chat hub;
/// decoding them yields [`ProtocolError::UnsupportedMessageType`] so callers
/// can log and skip them.
#[derive(Debug, Clone, PartialEq)]
pub enum HubMessage {
    /// Remote procedure call. `invocation_id` is `None` for fire-and-forget
    /// calls and for server-pushed events.
    Invocation {
        /// Correlates the call with its completion
        invocation_id: Option<String>,
        /// Method or event name
        target: String,
        /// Positional arguments
        arguments: Vec<Value>,
    },

    /// Outcome of an invocation. At most one of `result` and `error` is set.
    Completion {
        /// Invocation this completes
        invocation_id: String,
        /// Return value, if any
        result: Option<Value>,
        /// Error message when the call failed
        error: Option<String>,
    },

    /// Keep-alive, no payload
    Ping,

    /// Sender is closing the connection
    Close {
        /// Reason reported by the server
        error: Option<String>,
        /// Whether the client may reconnect
        allow_reconnect: bool,
    },
}

/// Flat wire shape shared by all message types.
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireMessage {
    #[serde(rename = "type")]
    kind: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    invocation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    target: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    arguments: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    allow_reconnect: Option<bool>,
}

impl HubMessage {
    /// Message type of this variant.
    pub const fn message_type(&self) -> MessageType {
        match self {
            Self::Invocation { .. } => MessageType::Invocation,
            Self::Completion { .. } => MessageType::Completion,
            Self::Ping => MessageType::Ping,
            Self::Close { .. } => MessageType::Close,
        }
    }

    /// Encode as a single record, separator included.
    pub fn encode(&self) -> Result<String> {
        let wire = match self {
            Self::Invocation { invocation_id, target, arguments } => WireMessage {
                kind: MessageType::Invocation.to_u8(),
                invocation_id: invocation_id.clone(),
                target: Some(target.clone()),
                arguments: Some(arguments.clone()),
                ..WireMessage::default()
            },
            Self::Completion { invocation_id, result, error } => WireMessage {
                kind: MessageType::Completion.to_u8(),
                invocation_id: Some(invocation_id.clone()),
                result: result.clone(),
                error: error.clone(),
                ..WireMessage::default()
            },
            Self::Ping => WireMessage { kind: MessageType::Ping.to_u8(), ..WireMessage::default() },
            Self::Close { error, allow_reconnect } => WireMessage {
                kind: MessageType::Close.to_u8(),
                error: error.clone(),
                allow_reconnect: Some(*allow_reconnect),
                ..WireMessage::default()
            },
        };

        let mut record = serde_json::to_string(&wire)?;
        record.push(RECORD_SEPARATOR);
        Ok(record)
    }

    /// Decode one record (without its separator).
    pub fn decode(record: &str) -> Result<Self> {
        let wire: WireMessage = serde_json::from_str(record)?;

        let Some(message_type) = MessageType::from_u8(wire.kind) else {
            return Err(ProtocolError::UnsupportedMessageType(wire.kind));
        };

        match message_type {
            MessageType::Invocation => {
                let Some(target) = wire.target else {
                    return Err(ProtocolError::MissingField { message_type, field: "target" });
                };
                Ok(Self::Invocation {
                    invocation_id: wire.invocation_id,
                    target,
                    arguments: wire.arguments.unwrap_or_default(),
                })
            },
            MessageType::Completion => {
                let Some(invocation_id) = wire.invocation_id else {
                    return Err(ProtocolError::MissingField {
                        message_type,
                        field: "invocationId",
                    });
                };
                Ok(Self::Completion { invocation_id, result: wire.result, error: wire.error })
            },
            MessageType::Ping => Ok(Self::Ping),
            MessageType::Close => Ok(Self::Close {
                error: wire.error,
                allow_reconnect: wire.allow_reconnect.unwrap_or(false),
            }),
            MessageType::StreamItem |
            MessageType::StreamInvocation |
            MessageType::CancelInvocation => Err(ProtocolError::UnsupportedMessageType(wire.kind)),
        }
    }
}

/// Splits inbound text into complete records.
///
/// Text after the last separator is kept until the next [`push`]. Empty
/// records (two adjacent separators) are skipped.
///
/// [`push`]: RecordReader::push
#[derive(Debug, Clone, Default)]
pub struct RecordReader {
    buffer: String,
}

impl RecordReader {
    /// Create an empty reader.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and return every record it completes.
    ///
    /// # Errors
    ///
    /// - `ProtocolError::RecordTooLarge` if more than [`MAX_PENDING_BYTES`]
    ///   accumulate without a separator. The buffer is cleared.
    pub fn push(&mut self, chunk: &str) -> Result<Vec<String>> {
        self.buffer.push_str(chunk);

        let mut records = Vec::new();
        while let Some(end) = self.buffer.find(RECORD_SEPARATOR) {
            let record: String = self.buffer.drain(..end).collect();
            self.buffer.drain(..RECORD_SEPARATOR.len_utf8());
            if !record.is_empty() {
                records.push(record);
            }
        }

        if self.buffer.len() > MAX_PENDING_BYTES {
            let size = self.buffer.len();
            self.buffer.clear();
            return Err(ProtocolError::RecordTooLarge { size, limit: MAX_PENDING_BYTES });
        }

        Ok(records)
    }

    /// Bytes buffered without a terminating separator.
    pub fn pending_bytes(&self) -> usize {
        self.buffer.len()
    }

    /// Drop any partial record (used when the transport is replaced).
    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn invocation_wire_shape() {
        let message = HubMessage::Invocation {
            invocation_id: Some("7".to_string()),
            target: "JoinRoom".to_string(),
            arguments: vec![json!(5)],
        };

        let encoded = message.encode().unwrap();
        assert!(encoded.ends_with(RECORD_SEPARATOR));
        insta::assert_snapshot!(
            encoded.trim_end_matches(RECORD_SEPARATOR),
            @r#"{"type":1,"invocationId":"7","target":"JoinRoom","arguments":[5]}"#
        );
    }

    #[test]
    fn ping_wire_shape() {
        let encoded = HubMessage::Ping.encode().unwrap();
        insta::assert_snapshot!(encoded.trim_end_matches(RECORD_SEPARATOR), @r#"{"type":6}"#);
    }

    #[test]
    fn decode_server_event_without_invocation_id() {
        let record = r#"{"type":1,"target":"UserLeft","arguments":["mika"]}"#;
        let decoded = HubMessage::decode(record).unwrap();
        assert_eq!(decoded, HubMessage::Invocation {
            invocation_id: None,
            target: "UserLeft".to_string(),
            arguments: vec![json!("mika")],
        });
    }

    #[test]
    fn decode_completion_with_error() {
        let record = r#"{"type":3,"invocationId":"3","error":"Room not found"}"#;
        let decoded = HubMessage::decode(record).unwrap();
        assert_eq!(decoded, HubMessage::Completion {
            invocation_id: "3".to_string(),
            result: None,
            error: Some("Room not found".to_string()),
        });
    }

    #[test]
    fn decode_close_defaults_to_no_reconnect() {
        let decoded = HubMessage::decode(r#"{"type":7,"error":"Unauthorized"}"#).unwrap();
        assert_eq!(decoded, HubMessage::Close {
            error: Some("Unauthorized".to_string()),
            allow_reconnect: false,
        });
    }

    #[test]
    fn decode_rejects_streaming_types() {
        let err = HubMessage::decode(r#"{"type":2,"invocationId":"1","item":1}"#).unwrap_err();
        assert_eq!(err, ProtocolError::UnsupportedMessageType(2));

        let err = HubMessage::decode(r#"{"type":42}"#).unwrap_err();
        assert_eq!(err, ProtocolError::UnsupportedMessageType(42));
    }

    #[test]
    fn decode_invocation_requires_target() {
        let err = HubMessage::decode(r#"{"type":1,"arguments":[]}"#).unwrap_err();
        assert_eq!(err, ProtocolError::MissingField {
            message_type: MessageType::Invocation,
            field: "target",
        });
    }

    #[test]
    fn decode_garbage_is_json_error() {
        assert!(matches!(HubMessage::decode("{not json"), Err(ProtocolError::Json(_))));
    }

    #[test]
    fn reader_splits_multiple_records() {
        let mut reader = RecordReader::new();
        let text = "{\"type\":6}\u{1e}{\"type\":6}\u{1e}";
        let records = reader.push(text).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(reader.pending_bytes(), 0);
    }

    #[test]
    fn reader_keeps_partial_record() {
        let mut reader = RecordReader::new();
        assert!(reader.push("{\"type\"").unwrap().is_empty());
        assert_eq!(reader.pending_bytes(), 7);

        let records = reader.push(":6}\u{1e}").unwrap();
        assert_eq!(records, vec!["{\"type\":6}".to_string()]);
    }

    #[test]
    fn reader_skips_empty_records() {
        let mut reader = RecordReader::new();
        let records = reader.push("\u{1e}\u{1e}{}\u{1e}").unwrap();
        assert_eq!(records, vec!["{}".to_string()]);
    }

    #[test]
    fn reader_rejects_unbounded_partial() {
        let mut reader = RecordReader::new();
        let huge = "x".repeat(MAX_PENDING_BYTES + 1);
        let err = reader.push(&huge).unwrap_err();
        assert!(matches!(err, ProtocolError::RecordTooLarge { .. }));
        assert_eq!(reader.pending_bytes(), 0);
    }
}
