//! Message list invariants.

use std::collections::HashSet;

use unichat_core::ConfirmationState;

use super::{Invariant, InvariantResult, SessionView, Violation};

/// No two entries of a room share a server id.
///
/// A duplicate means an echo or history entry was inserted next to the
/// message it should have confirmed.
pub struct UniqueServerIds;

impl Invariant for UniqueServerIds {
    fn name(&self) -> &'static str {
        "unique_server_ids"
    }

    fn check(&self, view: &SessionView) -> InvariantResult {
        for room in &view.rooms {
            let mut seen = HashSet::new();
            for id in room.messages.iter().filter_map(|message| message.server_id) {
                if !seen.insert(id) {
                    return Err(Violation {
                        invariant: self.name(),
                        message: format!("room {}: server id {id} listed twice", room.room_id),
                    });
                }
            }
        }
        Ok(())
    }
}

/// No two entries of a room share a local id.
pub struct UniqueLocalIds;

impl Invariant for UniqueLocalIds {
    fn name(&self) -> &'static str {
        "unique_local_ids"
    }

    fn check(&self, view: &SessionView) -> InvariantResult {
        for room in &view.rooms {
            let mut seen = HashSet::new();
            for message in &room.messages {
                if !seen.insert(message.local_id) {
                    return Err(Violation {
                        invariant: self.name(),
                        message: format!("room {}: local id {} listed twice", room.room_id, message.local_id),
                    });
                }
            }
        }
        Ok(())
    }
}

/// Entries are ordered by `sent_at`, newest first.
pub struct NewestFirst;

impl Invariant for NewestFirst {
    fn name(&self) -> &'static str {
        "newest_first"
    }

    fn check(&self, view: &SessionView) -> InvariantResult {
        for room in &view.rooms {
            for pair in room.messages.windows(2) {
                if pair[0].sent_at < pair[1].sent_at {
                    return Err(Violation {
                        invariant: self.name(),
                        message: format!(
                            "room {}: {} ({}) listed before newer {} ({})",
                            room.room_id, pair[0].local_id, pair[0].sent_at, pair[1].local_id, pair[1].sent_at
                        ),
                    });
                }
            }
        }
        Ok(())
    }
}

/// Confirmed entries carry a server id; Pending and Rejected ones do not.
pub struct ConfirmedCarryServerId;

impl Invariant for ConfirmedCarryServerId {
    fn name(&self) -> &'static str {
        "confirmed_carry_server_id"
    }

    fn check(&self, view: &SessionView) -> InvariantResult {
        for room in &view.rooms {
            for message in &room.messages {
                let confirmed = message.state == ConfirmationState::Confirmed;
                if confirmed != message.server_id.is_some() {
                    return Err(Violation {
                        invariant: self.name(),
                        message: format!(
                            "room {}: {} is {:?} with server id {:?}",
                            room.room_id, message.local_id, message.state, message.server_id
                        ),
                    });
                }
            }
        }
        Ok(())
    }
}
