//! Hub procedures and events.
//!
//! Client → server calls are [`HubMethod`]s; server → client pushes are
//! decoded into [`ServerEvent`]s. Unknown targets are preserved as
//! [`ServerEvent::Other`] so consumers can still subscribe to them by name.

use serde::Deserialize;
use serde_json::Value;

use crate::{
    errors::{ProtocolError, Result},
    payloads::chat::{RoomId, ServerMessage, UserId},
};

/// Join the caller's connection to a room group.
pub const JOIN_ROOM: &str = "JoinRoom";
/// Remove the caller's connection from a room group.
pub const LEAVE_ROOM: &str = "LeaveRoom";
/// Post a message to a room.
pub const SEND_MESSAGE: &str = "SendMessage";
/// Server push: a message was posted.
pub const RECEIVE_MESSAGE: &str = "ReceiveMessage";
/// Server push: a user joined the room.
pub const USER_JOINED: &str = "UserJoined";
/// Server push: a user left the room.
pub const USER_LEFT: &str = "UserLeft";

/// Client-invoked hub procedures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HubMethod {
    /// `JoinRoom(roomId)`
    JoinRoom {
        /// Room to join
        room_id: RoomId,
    },
    /// `LeaveRoom(roomId)`
    LeaveRoom {
        /// Room to leave
        room_id: RoomId,
    },
    /// `SendMessage(roomId, text)`
    SendMessage {
        /// Destination room
        room_id: RoomId,
        /// Message body
        text: String,
    },
}

impl HubMethod {
    /// Invocation target name.
    pub const fn target(&self) -> &'static str {
        match self {
            Self::JoinRoom { .. } => JOIN_ROOM,
            Self::LeaveRoom { .. } => LEAVE_ROOM,
            Self::SendMessage { .. } => SEND_MESSAGE,
        }
    }

    /// Positional invocation arguments.
    pub fn arguments(&self) -> Vec<Value> {
        match self {
            Self::JoinRoom { room_id } | Self::LeaveRoom { room_id } => vec![Value::from(*room_id)],
            Self::SendMessage { room_id, text } => {
                vec![Value::from(*room_id), Value::from(text.as_str())]
            },
        }
    }

    /// Room the call concerns.
    pub const fn room_id(&self) -> RoomId {
        match self {
            Self::JoinRoom { room_id } |
            Self::LeaveRoom { room_id } |
            Self::SendMessage { room_id, .. } => *room_id,
        }
    }
}

/// A user appearing in or leaving a room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserPresence {
    /// Display name
    pub username: String,
    /// User id, when the server sends a full user object
    pub user_id: Option<UserId>,
}

#[derive(Deserialize)]
struct PresenceObject {
    #[serde(default)]
    id: Option<UserId>,
    username: String,
}

/// Decoded server push.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    /// `ReceiveMessage(message)`
    ReceiveMessage(ServerMessage),
    /// `UserJoined(user)`; the server sends either a user object or a name
    UserJoined(UserPresence),
    /// `UserLeft(username)`
    UserLeft(UserPresence),
    /// Any other target, arguments left undecoded
    Other {
        /// Event name
        target: String,
        /// Raw arguments
        arguments: Vec<Value>,
    },
}

impl ServerEvent {
    /// Decode a server invocation.
    ///
    /// # Errors
    ///
    /// - `ProtocolError::InvalidArguments` if a known target carries
    ///   arguments of the wrong shape
    pub fn parse(target: &str, arguments: Vec<Value>) -> Result<Self> {
        match target {
            RECEIVE_MESSAGE => {
                let first = first_argument(target, arguments)?;
                let message = serde_json::from_value(first).map_err(|err| invalid(target, err))?;
                Ok(Self::ReceiveMessage(message))
            },
            USER_JOINED => Ok(Self::UserJoined(presence(target, first_argument(target, arguments)?)?)),
            USER_LEFT => Ok(Self::UserLeft(presence(target, first_argument(target, arguments)?)?)),
            _ => Ok(Self::Other { target: target.to_string(), arguments }),
        }
    }

    /// Event name used for handler registration.
    pub fn name(&self) -> &str {
        match self {
            Self::ReceiveMessage(_) => RECEIVE_MESSAGE,
            Self::UserJoined(_) => USER_JOINED,
            Self::UserLeft(_) => USER_LEFT,
            Self::Other { target, .. } => target,
        }
    }
}

fn first_argument(target: &str, arguments: Vec<Value>) -> Result<Value> {
    arguments.into_iter().next().ok_or_else(|| ProtocolError::InvalidArguments {
        target: target.to_string(),
        reason: "expected one argument, got none".to_string(),
    })
}

fn presence(target: &str, value: Value) -> Result<UserPresence> {
    match value {
        Value::String(username) => Ok(UserPresence { username, user_id: None }),
        Value::Object(_) => {
            let user: PresenceObject = serde_json::from_value(value).map_err(|err| invalid(target, err))?;
            Ok(UserPresence { username: user.username, user_id: user.id })
        },
        other => Err(ProtocolError::InvalidArguments {
            target: target.to_string(),
            reason: format!("expected user object or name, got {other}"),
        }),
    }
}

fn invalid(target: &str, err: serde_json::Error) -> ProtocolError {
    ProtocolError::InvalidArguments { target: target.to_string(), reason: err.to_string() }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn send_message_arguments_are_positional() {
        let method = HubMethod::SendMessage { room_id: 5, text: "moi".to_string() };
        assert_eq!(method.target(), SEND_MESSAGE);
        assert_eq!(method.arguments(), vec![json!(5), json!("moi")]);
        assert_eq!(method.room_id(), 5);
    }

    #[test]
    fn parses_receive_message() {
        let args = vec![json!({
            "id": 42, "messageText": "hi", "senderId": 7,
            "sender": {"username": "aino"}, "sentAt": "2024-05-01T10:00:00Z"
        })];
        let event = ServerEvent::parse(RECEIVE_MESSAGE, args).unwrap();
        let ServerEvent::ReceiveMessage(message) = event else {
            unreachable!("expected ReceiveMessage");
        };
        assert_eq!(message.id, 42);
    }

    #[test]
    fn user_joined_accepts_object_or_name() {
        let event = ServerEvent::parse(USER_JOINED, vec![json!({"id": 3, "username": "ida"})]).unwrap();
        assert_eq!(
            event,
            ServerEvent::UserJoined(UserPresence { username: "ida".to_string(), user_id: Some(3) })
        );

        let event = ServerEvent::parse(USER_JOINED, vec![json!("ida")]).unwrap();
        assert_eq!(event, ServerEvent::UserJoined(UserPresence { username: "ida".to_string(), user_id: None }));
    }

    #[test]
    fn missing_argument_is_rejected() {
        let err = ServerEvent::parse(USER_LEFT, vec![]).unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidArguments { .. }));
    }

    #[test]
    fn malformed_message_is_rejected() {
        let err = ServerEvent::parse(RECEIVE_MESSAGE, vec![json!({"id": "x"})]).unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidArguments { .. }));
    }

    #[test]
    fn unknown_target_is_preserved() {
        let event = ServerEvent::parse("RoomRenamed", vec![json!("new")]).unwrap();
        assert_eq!(event.name(), "RoomRenamed");
    }
}
