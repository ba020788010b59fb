//! Chat payloads: messages, users, room details.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::timestamp;

/// Chat room identifier.
pub type RoomId = u64;

/// User identifier.
pub type UserId = u64;

/// Server-assigned message identifier.
pub type MessageId = u64;

/// Username shown when a history message names neither a sender nor a
/// known member.
pub const UNKNOWN_USERNAME: &str = "Unknown";

/// Sender summary embedded in pushed messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SenderInfo {
    /// Display name
    pub username: String,
}

/// A message as stored and broadcast by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerMessage {
    /// Server-assigned id, unique per deployment
    pub id: MessageId,
    /// Message body
    pub message_text: String,
    /// Author
    pub sender_id: UserId,
    /// Author summary; absent on some history endpoints
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<SenderInfo>,
    /// Server timestamp
    #[serde(with = "timestamp")]
    pub sent_at: DateTime<Utc>,
    /// Room the message belongs to, when the server includes it
    #[serde(default, alias = "chatroomId", skip_serializing_if = "Option::is_none")]
    pub chat_room_id: Option<RoomId>,
}

impl ServerMessage {
    /// Username from the embedded sender, if present.
    pub fn sender_username(&self) -> Option<&str> {
        self.sender.as_ref().map(|sender| sender.username.as_str())
    }
}

/// Room member as listed by the REST API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatUser {
    /// User id
    pub id: UserId,
    /// Display name
    pub username: String,
    /// Avatar reference, opaque to this crate
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile_picture: Option<String>,
}

/// `GET /api/chatroom/{id}` response body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomDetails {
    /// Room name
    pub name: String,
    /// Free-form description
    #[serde(default)]
    pub description: Option<String>,
    /// Current members
    #[serde(default)]
    pub members: Vec<ChatUser>,
    /// Message history, in whatever order the server returns it
    #[serde(default)]
    pub messages: Vec<ServerMessage>,
}

impl RoomDetails {
    /// Resolve a display name for `sender_id` from the member list.
    pub fn member_username(&self, sender_id: UserId) -> Option<&str> {
        self.members.iter().find(|member| member.id == sender_id).map(|m| m.username.as_str())
    }

    /// Username for a history message: embedded sender, then member list,
    /// then [`UNKNOWN_USERNAME`].
    pub fn username_for<'a>(&'a self, message: &'a ServerMessage) -> &'a str {
        message
            .sender_username()
            .or_else(|| self.member_username(message.sender_id))
            .unwrap_or(UNKNOWN_USERNAME)
    }
}
