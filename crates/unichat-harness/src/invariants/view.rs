//! Observable session state for invariant checks.

use unichat_client::SessionHandle;
use unichat_core::{Message, SessionError};
use unichat_proto::RoomId;

/// Message list of one room.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RoomView {
    /// Room
    pub room_id: RoomId,
    /// Entries, newest first
    pub messages: Vec<Message>,
}

/// Message lists of the rooms under test.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionView {
    /// One view per open room
    pub rooms: Vec<RoomView>,
}

impl SessionView {
    /// View built from raw lists.
    pub fn from_lists(lists: impl IntoIterator<Item = (RoomId, Vec<Message>)>) -> Self {
        Self { rooms: lists.into_iter().map(|(room_id, messages)| RoomView { room_id, messages }).collect() }
    }

    /// Read the lists of `rooms` from a running session. Rooms that are not
    /// open are skipped.
    pub async fn capture(handle: &SessionHandle, rooms: &[RoomId]) -> Result<Self, SessionError> {
        let mut view = Self::default();
        for &room_id in rooms {
            if let Some(messages) = handle.messages(room_id).await? {
                view.rooms.push(RoomView { room_id, messages });
            }
        }
        Ok(view)
    }
}
