//! In-memory chat hub.
//!
//! [`SimHub`] speaks the same record protocol as the real hub: it answers the
//! handshake, replies to pings, runs `JoinRoom`/`LeaveRoom`/`SendMessage`
//! against shared room state and broadcasts `ReceiveMessage`, `UserJoined`
//! and `UserLeft` to room members. Every connection is a [`HubLink`] handed
//! out by [`SimConnector`], so the session runtime under test is the same
//! code that runs against a WebSocket.
//!
//! Fault controls (dropping connections, revoking tokens, rejecting or
//! holding joins, failing or stalling sends, going offline) let tests script
//! outages.

use std::{
    collections::{BTreeMap, BTreeSet, HashMap, HashSet},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};
use unichat_client::{HubConnector, HubLink};
use unichat_core::{Credential, Identity, TransportFailure};
use unichat_proto::{
    ChatUser, HandshakeRequest, HandshakeResponse, HubMessage, MessageId, RecordReader, RoomDetails, RoomId,
    SenderInfo, ServerMessage, UserId,
    methods::{JOIN_ROOM, LEAVE_ROOM, RECEIVE_MESSAGE, SEND_MESSAGE, USER_JOINED, USER_LEFT},
};

/// Capacity of each simulated link direction.
pub const SIM_LINK_CAPACITY: usize = 256;

/// Server id assigned to the first stored message.
pub const FIRST_MESSAGE_ID: MessageId = 1;

/// Connection identifier inside the simulated hub.
pub type ConnectionId = u64;

/// One invocation received by the hub.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedInvocation {
    /// Connection that sent it
    pub connection: ConnectionId,
    /// Caller
    pub user_id: UserId,
    /// Method name
    pub target: String,
    /// Raw arguments
    pub arguments: Vec<Value>,
}

impl RecordedInvocation {
    /// First argument as a room id.
    pub fn room_id(&self) -> Option<RoomId> {
        self.arguments.first().and_then(Value::as_u64)
    }
}

#[derive(Debug)]
struct Peer {
    identity: Identity,
    handshaken: bool,
    reader: RecordReader,
    incoming: mpsc::Sender<Result<String, TransportFailure>>,
    rooms: BTreeSet<RoomId>,
}

#[derive(Debug)]
struct HeldJoin {
    connection: ConnectionId,
    invocation_id: String,
    room_id: RoomId,
}

#[derive(Debug, Default)]
struct HubState {
    next_connection: ConnectionId,
    next_message_id: MessageId,
    peers: BTreeMap<ConnectionId, Peer>,
    history: BTreeMap<RoomId, Vec<ServerMessage>>,
    users: BTreeMap<UserId, String>,
    invocations: Vec<RecordedInvocation>,
    revoked: HashSet<String>,
    offline: bool,
    rejected_rooms: HashMap<RoomId, String>,
    held_rooms: HashSet<RoomId>,
    held_joins: Vec<HeldJoin>,
    failing_sends: Option<String>,
    null_acks: bool,
    stalled_sends: bool,
    omit_room_id: bool,
}

/// Shared handle to the simulated hub. Clones share state.
#[derive(Debug, Clone)]
pub struct SimHub {
    state: Arc<Mutex<HubState>>,
}

impl Default for SimHub {
    fn default() -> Self {
        Self::new()
    }
}

impl SimHub {
    /// Empty hub with no rooms or users.
    pub fn new() -> Self {
        let state = HubState { next_message_id: FIRST_MESSAGE_ID, ..HubState::default() };
        Self { state: Arc::new(Mutex::new(state)) }
    }

    /// Connector opening links to this hub.
    pub fn connector(&self) -> SimConnector {
        SimConnector { hub: self.clone() }
    }

    fn lock(&self) -> MutexGuard<'_, HubState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // Fault controls

    /// Refuse new connections with a network error while `offline`.
    pub fn set_offline(&self, offline: bool) {
        self.lock().offline = offline;
    }

    /// Refuse `token` with 401 from now on.
    pub fn revoke(&self, token: &str) {
        self.lock().revoked.insert(token.to_string());
    }

    /// Whether `credential` is accepted.
    pub fn accepts(&self, credential: &Credential) -> bool {
        !self.lock().revoked.contains(credential.access_token())
    }

    /// Reset every open connection.
    pub fn drop_connections(&self) {
        let mut state = self.lock();
        let peers = std::mem::take(&mut state.peers);
        debug!(count = peers.len(), "dropping all connections");
        for (_, peer) in peers {
            // Ignored if the client already dropped its link
            let _ = peer.incoming.try_send(Err(TransportFailure::Network("connection reset by hub".into())));
        }
    }

    /// Answer `JoinRoom(room_id)` with a server error.
    pub fn reject_joins(&self, room_id: RoomId, reason: impl Into<String>) {
        self.lock().rejected_rooms.insert(room_id, reason.into());
    }

    /// Leave `JoinRoom(room_id)` unanswered until [`SimHub::release_joins`].
    pub fn hold_joins(&self, room_id: RoomId) {
        self.lock().held_rooms.insert(room_id);
    }

    /// Answer held joins of `room_id` and stop holding new ones.
    pub fn release_joins(&self, room_id: RoomId) {
        let mut state = self.lock();
        state.held_rooms.remove(&room_id);
        let (release, keep): (Vec<_>, Vec<_>) =
            std::mem::take(&mut state.held_joins).into_iter().partition(|held| held.room_id == room_id);
        state.held_joins = keep;
        for held in release {
            state.complete_join(held.connection, Some(held.invocation_id), room_id);
        }
    }

    /// Answer every `SendMessage` with `reason` until cleared with `None`.
    pub fn fail_sends(&self, reason: Option<&str>) {
        self.lock().failing_sends = reason.map(str::to_string);
    }

    /// Record `SendMessage` calls without storing or answering them.
    pub fn stall_sends(&self, on: bool) {
        self.lock().stalled_sends = on;
    }

    /// Complete `SendMessage` with a null result instead of the stored message.
    pub fn ack_sends_with_null(&self, on: bool) {
        self.lock().null_acks = on;
    }

    /// Server id given to the next stored message.
    pub fn set_next_message_id(&self, id: MessageId) {
        self.lock().next_message_id = id;
    }

    /// Broadcast messages without `chatRoomId`, like older servers.
    pub fn omit_room_id(&self, omit: bool) {
        self.lock().omit_room_id = omit;
    }

    /// Store and broadcast a message from `author`, as another client would.
    pub fn post_as(&self, author: &Identity, room_id: RoomId, text: &str) -> ServerMessage {
        let mut state = self.lock();
        state.users.insert(author.user_id, author.username.clone());
        state.store_and_broadcast(author, room_id, text)
    }

    // Inspection

    /// Every invocation received so far.
    pub fn invocations(&self) -> Vec<RecordedInvocation> {
        self.lock().invocations.clone()
    }

    /// Invocations of `target` so far.
    pub fn invocation_count(&self, target: &str) -> usize {
        self.lock().invocations.iter().filter(|call| call.target == target).count()
    }

    /// Stored messages of a room, oldest first.
    pub fn history(&self, room_id: RoomId) -> Vec<ServerMessage> {
        self.lock().history.get(&room_id).cloned().unwrap_or_default()
    }

    /// Open connections.
    pub fn connection_count(&self) -> usize {
        self.lock().peers.len()
    }

    /// Number of handshakes completed on open connections.
    pub fn handshaken_count(&self) -> usize {
        self.lock().peers.values().filter(|peer| peer.handshaken).count()
    }

    /// Usernames currently joined to `room_id`.
    pub fn members(&self, room_id: RoomId) -> BTreeSet<String> {
        self.lock()
            .peers
            .values()
            .filter(|peer| peer.rooms.contains(&room_id))
            .map(|peer| peer.identity.username.clone())
            .collect()
    }

    /// `GET /api/chatroom/{id}` as the REST API would answer it.
    pub fn room_details(&self, room_id: RoomId) -> RoomDetails {
        let state = self.lock();
        let messages = state.history.get(&room_id).cloned().unwrap_or_default();
        let members = state
            .peers
            .values()
            .filter(|peer| peer.rooms.contains(&room_id))
            .map(|peer| peer.identity.user_id)
            .chain(messages.iter().map(|message| message.sender_id))
            .collect::<BTreeSet<_>>()
            .into_iter()
            .map(|id| ChatUser {
                id,
                username: state.users.get(&id).cloned().unwrap_or_default(),
                profile_picture: None,
            })
            .collect();
        RoomDetails { name: format!("Room {room_id}"), description: None, members, messages }
    }

    fn open(&self, identity: Identity) -> Result<(ConnectionId, HubLink), TransportFailure> {
        let (outgoing_tx, mut outgoing_rx) = mpsc::channel::<String>(SIM_LINK_CAPACITY);
        let (incoming_tx, incoming_rx) = mpsc::channel(SIM_LINK_CAPACITY);

        let connection = {
            let mut state = self.lock();
            if state.offline {
                return Err(TransportFailure::Network("hub unreachable".into()));
            }
            let connection = state.next_connection;
            state.next_connection += 1;
            state.users.insert(identity.user_id, identity.username.clone());
            state.peers.insert(
                connection,
                Peer {
                    identity,
                    handshaken: false,
                    reader: RecordReader::new(),
                    incoming: incoming_tx,
                    rooms: BTreeSet::new(),
                },
            );
            connection
        };

        let hub = self.clone();
        tokio::spawn(async move {
            while let Some(text) = outgoing_rx.recv().await {
                hub.lock().receive(connection, &text);
            }
            hub.lock().disconnect(connection);
        });

        Ok((connection, HubLink::new(outgoing_tx, incoming_rx)))
    }
}

impl HubState {
    fn receive(&mut self, connection: ConnectionId, text: &str) {
        let Some(peer) = self.peers.get_mut(&connection) else {
            trace!(connection, "text for a dropped connection ignored");
            return;
        };

        let records = match peer.reader.push(text) {
            Ok(records) => records,
            Err(err) => {
                warn!(connection, %err, "corrupt client stream");
                self.disconnect(connection);
                return;
            },
        };

        for record in records {
            let Some(peer) = self.peers.get_mut(&connection) else {
                return;
            };

            if !peer.handshaken {
                match serde_json::from_str::<HandshakeRequest>(&record) {
                    Ok(_) => {
                        peer.handshaken = true;
                        let answer = HandshakeResponse::default().encode();
                        self.send_record(connection, answer.ok());
                    },
                    Err(err) => {
                        let refusal = HandshakeResponse { error: Some(err.to_string()) }.encode();
                        self.send_record(connection, refusal.ok());
                    },
                }
                continue;
            }

            match HubMessage::decode(&record) {
                Ok(HubMessage::Ping) => self.send_record(connection, HubMessage::Ping.encode().ok()),
                Ok(HubMessage::Invocation { invocation_id, target, arguments }) => {
                    self.invoke(connection, invocation_id, target, arguments);
                },
                Ok(HubMessage::Close { .. }) => self.disconnect(connection),
                Ok(HubMessage::Completion { .. }) => {},
                Err(err) => warn!(connection, %err, "undecodable client record"),
            }
        }
    }

    fn invoke(&mut self, connection: ConnectionId, invocation_id: Option<String>, target: String, arguments: Vec<Value>) {
        let Some(peer) = self.peers.get(&connection) else {
            return;
        };
        let identity = peer.identity.clone();
        let room_id = arguments.first().and_then(Value::as_u64);
        let text = arguments.get(1).and_then(Value::as_str).map(str::to_string);

        debug!(connection, user = identity.user_id, target, ?room_id, "invocation");
        self.invocations.push(RecordedInvocation {
            connection,
            user_id: identity.user_id,
            target: target.clone(),
            arguments,
        });

        let Some(room_id) = room_id else {
            self.complete(connection, invocation_id, Err("Invalid room id".into()));
            return;
        };

        match target.as_str() {
            JOIN_ROOM => {
                if let Some(reason) = self.rejected_rooms.get(&room_id).cloned() {
                    self.complete(connection, invocation_id, Err(reason));
                } else if self.held_rooms.contains(&room_id) {
                    if let Some(invocation_id) = invocation_id {
                        self.held_joins.push(HeldJoin { connection, invocation_id, room_id });
                    }
                } else {
                    self.complete_join(connection, invocation_id, room_id);
                }
            },
            LEAVE_ROOM => {
                if let Some(peer) = self.peers.get_mut(&connection) {
                    peer.rooms.remove(&room_id);
                }
                let presence = Value::from(identity.username.as_str());
                self.broadcast(room_id, Some(connection), USER_LEFT, vec![presence]);
                self.complete(connection, invocation_id, Ok(None));
            },
            SEND_MESSAGE => {
                let joined = self.peers.get(&connection).is_some_and(|peer| peer.rooms.contains(&room_id));
                if self.stalled_sends {
                    trace!(connection, "send stalled");
                } else if let Some(reason) = self.failing_sends.clone() {
                    self.complete(connection, invocation_id, Err(reason));
                } else if !joined {
                    self.complete(connection, invocation_id, Err("Not a member of this room".into()));
                } else {
                    let stored = self.store_and_broadcast(&identity, room_id, text.as_deref().unwrap_or_default());
                    let result = if self.null_acks { None } else { serde_json::to_value(&stored).ok() };
                    self.complete(connection, invocation_id, Ok(result));
                }
            },
            _ => self.complete(connection, invocation_id, Err(format!("Unknown method {target}"))),
        }
    }

    fn complete_join(&mut self, connection: ConnectionId, invocation_id: Option<String>, room_id: RoomId) {
        let Some(peer) = self.peers.get_mut(&connection) else {
            return;
        };
        peer.rooms.insert(room_id);
        let presence = serde_json::json!({ "id": peer.identity.user_id, "username": peer.identity.username });
        self.broadcast(room_id, Some(connection), USER_JOINED, vec![presence]);
        self.complete(connection, invocation_id, Ok(None));
    }

    fn store_and_broadcast(&mut self, author: &Identity, room_id: RoomId, text: &str) -> ServerMessage {
        let message = ServerMessage {
            id: self.next_message_id,
            message_text: text.to_string(),
            sender_id: author.user_id,
            sender: Some(SenderInfo { username: author.username.clone() }),
            sent_at: stored_now(),
            chat_room_id: Some(room_id),
        };
        self.next_message_id += 1;
        self.history.entry(room_id).or_default().push(message.clone());

        let mut pushed = message.clone();
        if self.omit_room_id {
            pushed.chat_room_id = None;
        }
        if let Ok(payload) = serde_json::to_value(&pushed) {
            self.broadcast(room_id, None, RECEIVE_MESSAGE, vec![payload]);
        }
        message
    }

    fn broadcast(&mut self, room_id: RoomId, except: Option<ConnectionId>, target: &str, arguments: Vec<Value>) {
        let record = HubMessage::Invocation { invocation_id: None, target: target.to_string(), arguments }.encode();
        let Ok(record) = record else {
            return;
        };

        let members: Vec<ConnectionId> = self
            .peers
            .iter()
            .filter(|(id, peer)| Some(**id) != except && peer.handshaken && peer.rooms.contains(&room_id))
            .map(|(id, _)| *id)
            .collect();
        for member in members {
            self.send_record(member, Some(record.clone()));
        }
    }

    fn complete(&mut self, connection: ConnectionId, invocation_id: Option<String>, outcome: Result<Option<Value>, String>) {
        let Some(invocation_id) = invocation_id else {
            return;
        };
        let (result, error) = match outcome {
            Ok(result) => (result, None),
            Err(error) => (None, Some(error)),
        };
        let record = HubMessage::Completion { invocation_id, result, error }.encode();
        self.send_record(connection, record.ok());
    }

    fn send_record(&mut self, connection: ConnectionId, record: Option<String>) {
        let (Some(record), Some(peer)) = (record, self.peers.get(&connection)) else {
            return;
        };
        if peer.incoming.try_send(Ok(record)).is_err() {
            warn!(connection, "client link full or closed; dropping connection");
            self.disconnect(connection);
        }
    }

    fn disconnect(&mut self, connection: ConnectionId) {
        let Some(peer) = self.peers.remove(&connection) else {
            return;
        };
        debug!(connection, user = peer.identity.user_id, "connection closed");
        self.held_joins.retain(|held| held.connection != connection);
        for room_id in peer.rooms {
            let presence = Value::from(peer.identity.username.as_str());
            self.broadcast(room_id, None, USER_LEFT, vec![presence]);
        }
    }
}

/// Whole-millisecond timestamp, matching what the hub stores.
fn stored_now() -> DateTime<Utc> {
    let now = Utc::now();
    DateTime::from_timestamp_millis(now.timestamp_millis()).unwrap_or(now)
}

/// [`HubConnector`] for a [`SimHub`].
///
/// Refuses revoked or unreadable tokens with `Unauthorized`, like the hub's
/// 401 on upgrade.
#[derive(Debug, Clone)]
pub struct SimConnector {
    hub: SimHub,
}

impl HubConnector for SimConnector {
    async fn connect(&self, url: &str, credential: &Credential) -> Result<HubLink, TransportFailure> {
        if !self.hub.accepts(credential) {
            debug!(url, "credential revoked; refusing upgrade");
            return Err(TransportFailure::Unauthorized);
        }
        let identity = Identity::from_credential(credential).map_err(|_| TransportFailure::Unauthorized)?;
        let (connection, link) = self.hub.open(identity)?;
        debug!(url, connection, "simulated transport open");
        Ok(link)
    }
}
