//! Optimistic message reconciliation.
//!
//! A room's [`MessageReconciler`] owns its message list. Local sends appear
//! immediately as Pending entries; the server later broadcasts the stored
//! message back to every member (the "echo"). The reconciler pairs echoes
//! with the Pending entries they confirm so a message is never shown twice.
//!
//! # Matching
//!
//! An echo is paired by, in order:
//!
//! 1. Server id: if an entry already carries it, the echo is a duplicate.
//! 2. Author + text: the oldest Pending entry from the session user with the
//!    same text is promoted in place if the hub already acknowledged it, or
//!    if it was (re)sent no longer than the reconciliation window ago.
//! 3. Otherwise the echo is inserted as a new Confirmed entry.
//!
//! The window restarts whenever a Pending entry's call goes out again
//! ([`MessageReconciler::restart_windows`]), so an outage longer than the
//! window does not orphan the entry.
//!
//! History loads use the same server id check and fall back to sender and
//! text with timestamps at most the dedupe granularity apart, against
//! Pending entries.
//!
//! # Invariants
//!
//! - No two entries share a server id.
//! - Entries are sorted by `sent_at` descending; equal timestamps keep the
//!   later arrival first.
//! - Rejected entries are never promoted.

use std::{collections::HashMap, fmt};

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{debug, trace};
use unichat_proto::{MessageId, RoomDetails, ServerMessage, UserId, payloads::chat::UNKNOWN_USERNAME};

use crate::{config::ReconcileConfig, credential::Identity, env::MonotonicInstant};

/// Client-assigned message id, unique within one reconciler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LocalId(u64);

impl LocalId {
    /// Wrap a raw id.
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// Raw id.
    pub const fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for LocalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "L{}", self.0)
    }
}

/// Where a message is in its delivery lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConfirmationState {
    /// Shown locally, not yet confirmed by the server
    Pending,
    /// Stored by the server
    Confirmed,
    /// Send failed; may be resent or dismissed
    Rejected,
}

/// Stable key of a list entry: server id once known, else local id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKey {
    /// Confirmed by the server
    Server(MessageId),
    /// Not (yet) confirmed
    Local(LocalId),
}

/// One entry of a room's message list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Client id, assigned to every entry
    pub local_id: LocalId,
    /// Server id, set once confirmed
    pub server_id: Option<MessageId>,
    /// Author
    pub sender_id: UserId,
    /// Author display name
    pub sender_username: String,
    /// Body
    pub text: String,
    /// Server timestamp, or local send time while Pending
    pub sent_at: DateTime<Utc>,
    /// Delivery state
    pub state: ConfirmationState,
    /// Hub acknowledged the `SendMessage` call
    pub acknowledged: bool,
}

impl Message {
    /// Stable list key.
    pub fn key(&self) -> MessageKey {
        match self.server_id {
            Some(id) => MessageKey::Server(id),
            None => MessageKey::Local(self.local_id),
        }
    }

    /// True while waiting for the server.
    pub fn is_pending(&self) -> bool {
        self.state == ConfirmationState::Pending
    }
}

/// Result of feeding an echo into the reconciler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EchoOutcome {
    /// A Pending entry was confirmed in place
    Promoted(LocalId),
    /// A new Confirmed entry was added
    Inserted(LocalId),
    /// Server id already present; nothing changed
    Duplicate,
}

impl EchoOutcome {
    /// True if the list changed.
    pub fn changed(self) -> bool {
        !matches!(self, Self::Duplicate)
    }
}

/// Operation referred to a message that cannot take it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReconcileError {
    /// No entry with this local id
    #[error("unknown message {0}")]
    UnknownMessage(LocalId),

    /// Entry is in the wrong state for the operation
    #[error("message {local_id} is {state:?}")]
    WrongState {
        /// Entry in question
        local_id: LocalId,
        /// Its current state
        state: ConfirmationState,
    },
}

#[derive(Debug, Clone)]
struct Entry<I> {
    message: Message,
    /// Monotonic creation time of Pending entries (echo window)
    created_at: Option<I>,
    /// Insertion order, used to break timestamp ties
    arrival: u64,
}

/// Message list of one room plus the logic that keeps it consistent.
///
/// Pure state: time is passed in, nothing is sent anywhere.
#[derive(Debug, Clone)]
pub struct MessageReconciler<I> {
    author: Identity,
    config: ReconcileConfig,
    /// Sorted newest-first
    entries: Vec<Entry<I>>,
    /// Server id of every confirmed entry
    server_index: HashMap<MessageId, LocalId>,
    /// Latest room details, without messages
    details: Option<RoomDetails>,
    next_local_id: u64,
    next_arrival: u64,
}

impl<I: MonotonicInstant> MessageReconciler<I> {
    /// Empty list for messages authored by `author`.
    pub fn new(author: Identity, config: ReconcileConfig) -> Self {
        Self {
            author,
            config,
            entries: Vec::new(),
            server_index: HashMap::new(),
            details: None,
            next_local_id: 1,
            next_arrival: 0,
        }
    }

    /// Session user this list sends as.
    pub fn author(&self) -> &Identity {
        &self.author
    }

    /// Entries, newest first.
    pub fn messages(&self) -> impl Iterator<Item = &Message> {
        self.entries.iter().map(|entry| &entry.message)
    }

    /// Owned snapshot, newest first.
    pub fn snapshot(&self) -> Vec<Message> {
        self.messages().cloned().collect()
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if the list is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries still waiting for the server.
    pub fn pending(&self) -> impl Iterator<Item = &Message> {
        self.messages().filter(|message| message.is_pending())
    }

    /// Look up by local id.
    pub fn get(&self, local_id: LocalId) -> Option<&Message> {
        self.messages().find(|message| message.local_id == local_id)
    }

    /// Look up by server id.
    pub fn get_by_server_id(&self, server_id: MessageId) -> Option<&Message> {
        self.get(*self.server_index.get(&server_id)?)
    }

    /// Room name, description and members from the last history load.
    pub fn details(&self) -> Option<&RoomDetails> {
        self.details.as_ref()
    }

    /// Restart the echo window of every Pending entry.
    ///
    /// Called when queued calls go out again after a reconnect.
    pub fn restart_windows(&mut self, now: I) -> usize {
        let mut restarted = 0;
        for entry in &mut self.entries {
            if entry.message.is_pending() {
                entry.created_at = Some(now);
                restarted += 1;
            }
        }
        restarted
    }

    /// Restart the echo window of one Pending entry whose send is retried.
    pub fn restart_window(&mut self, local_id: LocalId, now: I) {
        if let Ok(index) = self.index_of(local_id)
            && self.entries[index].message.is_pending()
        {
            self.entries[index].created_at = Some(now);
        }
    }

    /// Add a Pending entry for a message the session user is sending.
    ///
    /// `sent_at` is the local wall-clock send time, shown until the server's
    /// timestamp replaces it.
    pub fn send_optimistic(&mut self, text: impl Into<String>, now: I, sent_at: DateTime<Utc>) -> Message {
        let local_id = self.allocate_local_id();
        let message = Message {
            local_id,
            server_id: None,
            sender_id: self.author.user_id,
            sender_username: self.author.username.clone(),
            text: text.into(),
            sent_at,
            state: ConfirmationState::Pending,
            acknowledged: false,
        };
        trace!(%local_id, "optimistic message added");
        self.push(message.clone(), Some(now));
        message
    }

    /// Feed a server broadcast.
    pub fn on_server_echo(&mut self, echo: ServerMessage, now: I) -> EchoOutcome {
        if self.server_index.contains_key(&echo.id) {
            trace!(server_id = echo.id, "duplicate echo ignored");
            return EchoOutcome::Duplicate;
        }

        if let Some(index) = self.find_echo_match(&echo, now) {
            let local_id = self.promote(index, &echo);
            debug!(%local_id, server_id = echo.id, "optimistic message confirmed by echo");
            return EchoOutcome::Promoted(local_id);
        }

        let username = echo
            .sender_username()
            .or_else(|| self.details.as_ref().and_then(|details| details.member_username(echo.sender_id)))
            .unwrap_or(UNKNOWN_USERNAME)
            .to_string();
        let local_id = self.insert_confirmed(echo, username);
        EchoOutcome::Inserted(local_id)
    }

    /// Record that the hub acknowledged the send of `local_id`.
    ///
    /// When the acknowledgement carries the stored message the entry is
    /// confirmed immediately; a later echo is then a duplicate. If an echo
    /// for that server id was already inserted separately, the Pending entry
    /// is dropped in its favour.
    pub fn on_send_ack(&mut self, local_id: LocalId, stored: Option<ServerMessage>) -> Result<(), ReconcileError> {
        let index = self.index_of(local_id)?;
        let state = self.entries[index].message.state;
        if state != ConfirmationState::Pending {
            // Echo beat the acknowledgement
            return if state == ConfirmationState::Confirmed {
                Ok(())
            } else {
                Err(ReconcileError::WrongState { local_id, state })
            };
        }

        self.entries[index].message.acknowledged = true;

        let Some(stored) = stored else {
            return Ok(());
        };

        if self.server_index.contains_key(&stored.id) {
            self.entries.remove(index);
            debug!(%local_id, server_id = stored.id, "pending entry merged into existing echo");
            return Ok(());
        }

        self.promote(index, &stored);
        Ok(())
    }

    /// Mark a Pending send as failed. Idempotent for Rejected entries.
    pub fn on_send_failure(&mut self, local_id: LocalId) -> Result<(), ReconcileError> {
        let index = self.index_of(local_id)?;
        let message = &mut self.entries[index].message;
        match message.state {
            ConfirmationState::Pending => {
                message.state = ConfirmationState::Rejected;
                self.entries[index].created_at = None;
                debug!(%local_id, "message rejected");
                Ok(())
            },
            ConfirmationState::Rejected => Ok(()),
            state @ ConfirmationState::Confirmed => Err(ReconcileError::WrongState { local_id, state }),
        }
    }

    /// Send a Rejected message's text again as a new Pending entry.
    ///
    /// The Rejected entry stays in the list; [`dismiss`] removes it.
    ///
    /// [`dismiss`]: MessageReconciler::dismiss
    pub fn resend(&mut self, local_id: LocalId, now: I, sent_at: DateTime<Utc>) -> Result<Message, ReconcileError> {
        let message = &self.entries[self.index_of(local_id)?].message;
        if message.state != ConfirmationState::Rejected {
            return Err(ReconcileError::WrongState { local_id, state: message.state });
        }
        let text = message.text.clone();
        Ok(self.send_optimistic(text, now, sent_at))
    }

    /// Remove a Rejected entry.
    pub fn dismiss(&mut self, local_id: LocalId) -> Result<Message, ReconcileError> {
        let index = self.index_of(local_id)?;
        let state = self.entries[index].message.state;
        if state != ConfirmationState::Rejected {
            return Err(ReconcileError::WrongState { local_id, state });
        }
        Ok(self.entries.remove(index).message)
    }

    /// Bulk-insert server history without duplicates.
    ///
    /// `username` resolves display names for messages that lack an embedded
    /// sender. Returns the number of entries added or confirmed. Loading the
    /// same history twice changes nothing the second time.
    pub fn load_history<'a, F>(&mut self, history: impl IntoIterator<Item = &'a ServerMessage>, username: F) -> usize
    where
        F: Fn(&ServerMessage) -> String,
    {
        let mut changed = 0;
        for message in history {
            if self.server_index.contains_key(&message.id) {
                continue;
            }

            if let Some(index) = self.find_history_match(message) {
                let local_id = self.promote(index, message);
                debug!(%local_id, server_id = message.id, "optimistic message confirmed by history");
            } else {
                self.insert_confirmed(message.clone(), username(message));
            }
            changed += 1;
        }
        changed
    }

    /// [`load_history`] using a room's member list for display names.
    ///
    /// The room's name, description and members are kept for later echoes
    /// that arrive without an embedded sender.
    ///
    /// [`load_history`]: MessageReconciler::load_history
    pub fn load_room(&mut self, details: &RoomDetails) -> usize {
        self.details = Some(RoomDetails {
            name: details.name.clone(),
            description: details.description.clone(),
            members: details.members.clone(),
            messages: Vec::new(),
        });
        self.load_history(&details.messages, |message| details.username_for(message).to_string())
    }

    fn allocate_local_id(&mut self) -> LocalId {
        let id = LocalId(self.next_local_id);
        self.next_local_id += 1;
        id
    }

    fn index_of(&self, local_id: LocalId) -> Result<usize, ReconcileError> {
        self.entries
            .iter()
            .position(|entry| entry.message.local_id == local_id)
            .ok_or(ReconcileError::UnknownMessage(local_id))
    }

    fn find_echo_match(&self, echo: &ServerMessage, now: I) -> Option<usize> {
        if echo.sender_id != self.author.user_id {
            return None;
        }
        self.entries
            .iter()
            .enumerate()
            .filter(|(_, entry)| {
                entry.message.is_pending() &&
                    entry.message.text == echo.message_text &&
                    (entry.message.acknowledged ||
                        entry.created_at.is_some_and(|created| now - created <= self.config.window))
            })
            .min_by_key(|(_, entry)| entry.message.local_id)
            .map(|(index, _)| index)
    }

    fn find_history_match(&self, message: &ServerMessage) -> Option<usize> {
        let granularity = self.config.dedupe_granularity;
        self.entries
            .iter()
            .enumerate()
            .filter(|(_, entry)| {
                entry.message.is_pending() &&
                    entry.message.sender_id == message.sender_id &&
                    entry.message.text == message.message_text &&
                    (entry.message.sent_at - message.sent_at).abs().to_std().is_ok_and(|gap| gap <= granularity)
            })
            .min_by_key(|(_, entry)| entry.message.local_id)
            .map(|(index, _)| index)
    }

    fn promote(&mut self, index: usize, stored: &ServerMessage) -> LocalId {
        let mut entry = self.entries.remove(index);
        entry.message.server_id = Some(stored.id);
        entry.message.sent_at = stored.sent_at;
        entry.message.state = ConfirmationState::Confirmed;
        entry.message.acknowledged = true;
        entry.created_at = None;
        let local_id = entry.message.local_id;
        self.server_index.insert(stored.id, local_id);
        self.insert_sorted(entry);
        local_id
    }

    fn insert_confirmed(&mut self, stored: ServerMessage, username: String) -> LocalId {
        let local_id = self.allocate_local_id();
        let message = Message {
            local_id,
            server_id: Some(stored.id),
            sender_id: stored.sender_id,
            sender_username: username,
            text: stored.message_text,
            sent_at: stored.sent_at,
            state: ConfirmationState::Confirmed,
            acknowledged: true,
        };
        self.server_index.insert(stored.id, local_id);
        self.push(message, None);
        local_id
    }

    fn push(&mut self, message: Message, created_at: Option<I>) {
        let arrival = self.next_arrival;
        self.next_arrival += 1;
        self.insert_sorted(Entry { message, created_at, arrival });
    }

    /// Insert keeping newest-first order, later arrival first on ties.
    fn insert_sorted(&mut self, entry: Entry<I>) {
        let key = (entry.message.sent_at, entry.arrival);
        let at = self.entries.partition_point(|other| (other.message.sent_at, other.arrival) > key);
        self.entries.insert(at, entry);
    }
}
