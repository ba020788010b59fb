//! Protocol negotiation.
//!
//! The client opens with a handshake request naming the protocol; the server
//! answers with an empty object on success or an object carrying `error`.
//! Both are ordinary records terminated by the record separator.

use serde::{Deserialize, Serialize};

use crate::{
    errors::{ProtocolError, Result},
    message::RECORD_SEPARATOR,
};

/// Protocol name sent in the handshake.
pub const PROTOCOL_NAME: &str = "json";

/// Protocol version sent in the handshake.
pub const PROTOCOL_VERSION: u32 = 1;

/// First record sent by the client on a fresh transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeRequest {
    /// Protocol name
    pub protocol: String,
    /// Protocol version
    pub version: u32,
}

impl Default for HandshakeRequest {
    fn default() -> Self {
        Self { protocol: PROTOCOL_NAME.to_string(), version: PROTOCOL_VERSION }
    }
}

impl HandshakeRequest {
    /// Encode as a record, separator included.
    pub fn encode(&self) -> Result<String> {
        let mut record = serde_json::to_string(self)?;
        record.push(RECORD_SEPARATOR);
        Ok(record)
    }
}

/// Server answer to the handshake.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeResponse {
    /// Set when the server refused the handshake
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl HandshakeResponse {
    /// Decode one record (without its separator).
    pub fn decode(record: &str) -> Result<Self> {
        Ok(serde_json::from_str(record)?)
    }

    /// Encode as a record, separator included.
    pub fn encode(&self) -> Result<String> {
        let mut record = serde_json::to_string(self)?;
        record.push(RECORD_SEPARATOR);
        Ok(record)
    }

    /// Converts a refusal into [`ProtocolError::Handshake`].
    pub fn into_result(self) -> Result<()> {
        match self.error {
            Some(error) => Err(ProtocolError::Handshake(error)),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn request_wire_shape() {
        let encoded = HandshakeRequest::default().encode().unwrap();
        assert_eq!(encoded, "{\"protocol\":\"json\",\"version\":1}\u{1e}");
    }

    #[test]
    fn empty_response_is_success() {
        let response = HandshakeResponse::decode("{}").unwrap();
        assert_eq!(response.into_result(), Ok(()));
    }

    #[test]
    fn response_ignores_unknown_fields() {
        let response = HandshakeResponse::decode(r#"{"minorVersion":1}"#).unwrap();
        assert!(response.error.is_none());
    }

    #[test]
    fn error_response_is_rejection() {
        let response =
            HandshakeResponse::decode(r#"{"error":"Requested protocol 'json' is not available."}"#)
                .unwrap();
        assert!(matches!(response.into_result(), Err(ProtocolError::Handshake(_))));
    }
}
