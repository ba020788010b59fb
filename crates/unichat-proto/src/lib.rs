//! UniChat hub wire protocol.
//!
//! The realtime hub speaks a JSON message protocol: every message is a JSON
//! object terminated by the ASCII record separator (`0x1E`). A connection
//! starts with a handshake record, after which both sides exchange
//! invocations, completions, pings, and close messages.
//!
//! This crate only knows how bytes map to typed values. It performs no I/O
//! and holds no connection state; see `unichat-core` for the state machines
//! that drive it.
//!
//! # Layout
//!
//! - [`message`]: hub message envelope ([`HubMessage`]) and record framing
//! - [`handshake`]: protocol negotiation records
//! - [`payloads`]: typed chat payloads carried as invocation arguments
//! - [`methods`]: client-invoked procedures and server-pushed events

#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod errors;
pub mod handshake;
pub mod message;
pub mod methods;
pub mod payloads;

pub use errors::{ProtocolError, Result};
pub use handshake::{HandshakeRequest, HandshakeResponse};
pub use message::{HubMessage, MessageType, RECORD_SEPARATOR, RecordReader};
pub use methods::{HubMethod, ServerEvent, UserPresence};
pub use payloads::chat::{ChatUser, MessageId, RoomDetails, RoomId, SenderInfo, ServerMessage, UserId};
