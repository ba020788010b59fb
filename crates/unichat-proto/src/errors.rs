//! Protocol decoding and encoding errors.

use thiserror::Error;

use crate::message::MessageType;

/// Convenience alias for protocol results.
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Errors produced while encoding or decoding hub records.
///
/// JSON errors are stored as strings so the error stays `Clone + PartialEq`
/// and can be carried inside state machine outcomes.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Record is not valid JSON or does not match the expected shape
    #[error("invalid JSON: {0}")]
    Json(String),

    /// Message `type` field is not one this client handles
    #[error("unsupported message type: {0}")]
    UnsupportedMessageType(u8),

    /// A field required by the message type is absent
    #[error("{message_type:?} message is missing field `{field}`")]
    MissingField {
        /// Message type being decoded
        message_type: MessageType,
        /// Name of the missing field
        field: &'static str,
    },

    /// Invocation arguments do not match the target's signature
    #[error("invalid arguments for {target}: {reason}")]
    InvalidArguments {
        /// Invocation target
        target: String,
        /// What was wrong with the arguments
        reason: String,
    },

    /// Too much text buffered without a record separator
    #[error("record exceeds {limit} bytes (buffered {size})")]
    RecordTooLarge {
        /// Bytes buffered when the limit was hit
        size: usize,
        /// Configured limit
        limit: usize,
    },

    /// Server rejected the protocol handshake
    #[error("handshake rejected: {0}")]
    Handshake(String),
}

impl From<serde_json::Error> for ProtocolError {
    fn from(err: serde_json::Error) -> Self {
        Self::Json(err.to_string())
    }
}
