//! Session supervisor.
//!
//! Top-level state machine binding the hub lifecycle to authentication and
//! room lifecycle. Owns the [`HubConnection`], the [`RoomMembership`] and
//! one [`MessageReconciler`] per open room. Like the layers below it, the
//! supervisor performs no I/O: every method takes the current time and
//! returns [`SessionAction`]s for the runtime to execute.
//!
//! # State Machine
//!
//! ```text
//!             login()                token ok
//! ┌───────────┐──────>┌────────────────┐──────>┌────────────┐
//! │ LoggedOut │       │ Authenticating │       │ Connecting │<─┐
//! └───────────┘<──────└────────────────┘       └────────────┘  │ transient
//!       ^   refresh failed     ^                     │ hub up,   │ drop
//!       │                      │ refresh             v rejoined  │
//!       │               ┌────────────┐  auth lost ┌────────┐     │
//!       └── exhausted ──│ Recovering │<───────────│ Active │─────┘
//!                       └────────────┘  / closed  └────────┘
//! ```
//!
//! Every state reaches LoggedOut on `logout()`.
//!
//! # Ordering
//!
//! After the hub (re)connects, rejoins are issued before queued calls are
//! flushed, so a send queued during an outage reaches the server after the
//! room has been re-entered.

use std::{
    collections::{BTreeMap, HashMap, VecDeque},
    time::Duration,
};

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{debug, info, warn};
use unichat_proto::{HubMethod, RoomDetails, RoomId, ServerEvent, ServerMessage, UserPresence};

use crate::{
    config::SessionConfig,
    credential::{Credential, Identity},
    env::MonotonicInstant,
    error::{AuthError, InvocationError, SessionError, TransportFailure},
    hub::{ConnectionState, HubAction, HubConnection, HubNotice, InvocationId},
    membership::{JoinOutcome, JoinState, MembershipAction, RoomHandle, RoomMembership},
    reconciler::{LocalId, Message, MessageReconciler, ReconcileError},
};

/// Supervisor lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SupervisorState {
    /// No session
    LoggedOut,
    /// Waiting for the token provider
    Authenticating,
    /// Hub connecting, or rooms being rejoined
    Connecting,
    /// Hub connected and every rejoin settled
    Active,
    /// Connection lost for good or credential rejected
    Recovering,
}

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogoutReason {
    /// `logout()` was called
    UserRequested,
    /// Credential missing or rejected and refresh failed
    AuthFailed,
    /// Hub unreachable after repeated recovery attempts
    Unreachable,
}

/// Snapshot of the current session.
#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    /// Session user
    pub identity: Identity,
    /// Credential used for the hub
    pub credential: Credential,
    /// Hub connection state
    pub connection_state: ConnectionState,
}

/// Events published to session consumers.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// Supervisor state changed
    StateChanged {
        /// Previous state
        from: SupervisorState,
        /// New state
        to: SupervisorState,
    },
    /// Hub connection state changed
    ConnectionChanged(ConnectionState),
    /// Room became Joined
    RoomJoined {
        /// Room
        room_id: RoomId,
        /// True when restored after a reconnect
        rejoin: bool,
    },
    /// Room handle released
    RoomLeft {
        /// Room
        room_id: RoomId,
    },
    /// Join failed for good
    JoinFailed {
        /// Room
        room_id: RoomId,
        /// Why
        error: SessionError,
    },
    /// A room's name, description or members were refreshed
    RoomUpdated {
        /// Room
        room_id: RoomId,
    },
    /// A room's message list changed
    MessagesUpdated {
        /// Room
        room_id: RoomId,
    },
    /// A send was rejected
    SendFailed {
        /// Room
        room_id: RoomId,
        /// Rejected entry
        local_id: LocalId,
    },
    /// Someone entered a room
    UserJoined {
        /// Room, when it can be determined
        room_id: Option<RoomId>,
        /// Who
        user: UserPresence,
    },
    /// Someone left a room
    UserLeft {
        /// Room, when it can be determined
        room_id: Option<RoomId>,
        /// Who
        user: UserPresence,
    },
    /// Session ended
    LoggedOut {
        /// Why
        reason: LogoutReason,
    },
}

/// Actions for the runtime.
///
/// - `AcquireToken`/`RefreshToken`: call the token provider after `delay`
///   and report back through `token_acquired`/`token_refreshed`
/// - `OpenTransport`: open a hub transport, then report `transport_opened`
///   or `transport_failed`
/// - `FetchHistory`: load the room's history and pass it to `load_history`
#[derive(Debug)]
pub enum SessionAction<W> {
    /// Read the stored credential
    AcquireToken {
        /// Wait before asking
        delay: Duration,
    },
    /// Ask the token service for a fresh credential
    RefreshToken {
        /// Wait before asking
        delay: Duration,
    },
    /// Open a hub transport
    OpenTransport {
        /// Hub endpoint
        url: String,
        /// Credential to present
        credential: Credential,
    },
    /// Write one record to the transport
    SendFrame(String),
    /// Drop the current transport
    CloseTransport,
    /// Fetch a room's history
    FetchHistory {
        /// Room
        room_id: RoomId,
    },
    /// Settle join waiters
    ResolveJoin {
        /// Waiters
        waiters: Vec<W>,
        /// Outcome for all of them
        outcome: JoinOutcome,
    },
    /// Raw server event for registered handlers
    Dispatch(ServerEvent),
    /// Publish to consumers
    Emit(SessionEvent),
}

#[derive(Debug, Clone, Copy)]
struct PendingSend {
    room_id: RoomId,
    local_id: LocalId,
    attempts: u32,
}

enum Work<W> {
    Hub(HubAction),
    Membership(MembershipAction<W>),
}

/// Session supervisor state machine.
///
/// `I` is the monotonic instant type, `W` the join waiter type.
#[derive(Debug)]
pub struct SessionSupervisor<I, W> {
    config: SessionConfig,
    state: SupervisorState,
    identity: Option<Identity>,
    credential: Option<Credential>,
    hub: HubConnection<I>,
    membership: RoomMembership<W>,
    rooms: BTreeMap<RoomId, MessageReconciler<I>>,
    sends: HashMap<InvocationId, PendingSend>,
    token_attempts: u32,
    recovery_attempts: u32,
}

impl<I: MonotonicInstant, W> SessionSupervisor<I, W> {
    /// Logged-out supervisor.
    pub fn new(config: SessionConfig, now: I) -> Self {
        let hub = HubConnection::new(now, config.hub.clone());
        let membership = RoomMembership::new(config.join_retry_limit);
        Self {
            config,
            state: SupervisorState::LoggedOut,
            identity: None,
            credential: None,
            hub,
            membership,
            rooms: BTreeMap::new(),
            sends: HashMap::new(),
            token_attempts: 0,
            recovery_attempts: 0,
        }
    }

    /// Current state.
    pub fn state(&self) -> SupervisorState {
        self.state
    }

    /// Configuration in use.
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Hub connection state.
    pub fn connection_state(&self) -> ConnectionState {
        self.hub.state()
    }

    /// Current session, if authenticated.
    pub fn session(&self) -> Option<Session> {
        Some(Session {
            identity: self.identity.clone()?,
            credential: self.credential.clone()?,
            connection_state: self.hub.state(),
        })
    }

    /// Credential for REST calls.
    pub fn credential(&self) -> Option<&Credential> {
        self.credential.as_ref()
    }

    /// Membership of every tracked room.
    pub fn rooms(&self) -> Vec<RoomHandle> {
        self.membership.handles()
    }

    /// Membership state of one room.
    pub fn join_state(&self, room_id: RoomId) -> JoinState {
        self.membership.state(room_id)
    }

    /// Message list of an open room, newest first.
    pub fn messages(&self, room_id: RoomId) -> Option<Vec<Message>> {
        self.rooms.get(&room_id).map(MessageReconciler::snapshot)
    }

    /// Name, description and members of an open room, once fetched.
    pub fn room_details(&self, room_id: RoomId) -> Option<&RoomDetails> {
        self.rooms.get(&room_id)?.details()
    }

    /// Reconciler of an open room.
    pub fn room(&self, room_id: RoomId) -> Option<&MessageReconciler<I>> {
        self.rooms.get(&room_id)
    }

    /// Start a session.
    ///
    /// With no `identity`, the user is read from the credential's claims.
    ///
    /// # Errors
    ///
    /// - `SessionError::NotReady` unless LoggedOut
    pub fn login(&mut self, identity: Option<Identity>) -> Result<Vec<SessionAction<W>>, SessionError> {
        if self.state != SupervisorState::LoggedOut {
            return Err(SessionError::NotReady { state: self.state });
        }

        info!(user = ?identity.as_ref().map(|i| i.user_id), "login");
        self.identity = identity;
        self.token_attempts = 0;
        self.recovery_attempts = 0;

        let mut out = Vec::new();
        self.transition(SupervisorState::Authenticating, &mut out);
        out.push(SessionAction::AcquireToken { delay: Duration::ZERO });
        Ok(out)
    }

    /// Result of reading the stored credential.
    ///
    /// A missing or expired credential falls back to a refresh.
    pub fn token_acquired(
        &mut self,
        result: Result<Option<Credential>, AuthError>,
        now: I,
        wall: DateTime<Utc>,
    ) -> Vec<SessionAction<W>> {
        if self.state != SupervisorState::Authenticating {
            debug!(state = ?self.state, "stale token result ignored");
            return Vec::new();
        }

        match result {
            Ok(Some(credential)) if !credential.is_expired(wall) => self.accept_credential(credential, now),
            Ok(credential) => {
                debug!(expired = credential.is_some(), "no usable stored credential; refreshing");
                vec![SessionAction::RefreshToken { delay: Duration::ZERO }]
            },
            Err(err) if err.is_transient() && self.token_attempts < self.config.token_retry_limit => {
                self.token_attempts += 1;
                warn!(%err, attempt = self.token_attempts, "token read failed; retrying");
                vec![SessionAction::AcquireToken { delay: self.token_retry_delay() }]
            },
            Err(err) => {
                warn!(%err, "token read failed");
                self.force_logout(LogoutReason::AuthFailed)
            },
        }
    }

    /// Result of a token refresh.
    pub fn token_refreshed(&mut self, result: Result<Credential, AuthError>, now: I) -> Vec<SessionAction<W>> {
        if self.state != SupervisorState::Authenticating {
            debug!(state = ?self.state, "stale refresh result ignored");
            return Vec::new();
        }

        match result {
            Ok(credential) => self.accept_credential(credential, now),
            Err(err) if err.is_transient() && self.token_attempts < self.config.token_retry_limit => {
                self.token_attempts += 1;
                warn!(%err, attempt = self.token_attempts, "token refresh failed; retrying");
                vec![SessionAction::RefreshToken { delay: self.token_retry_delay() }]
            },
            Err(err) => {
                warn!(%err, "token refresh failed");
                self.force_logout(LogoutReason::AuthFailed)
            },
        }
    }

    /// Transport requested by `OpenTransport` is open.
    pub fn transport_opened(&mut self, now: I) -> Vec<SessionAction<W>> {
        match self.hub.transport_opened(now) {
            Ok(actions) => self.drive(actions, now),
            Err(err) => {
                debug!(%err, "unexpected transport open");
                vec![SessionAction::CloseTransport]
            },
        }
    }

    /// Transport failed to open or died.
    pub fn transport_failed(&mut self, failure: TransportFailure, now: I) -> Vec<SessionAction<W>> {
        let actions = self.hub.transport_failed(failure, now);
        self.drive(actions, now)
    }

    /// Text received from the transport.
    pub fn frame_received(&mut self, text: &str, now: I) -> Vec<SessionAction<W>> {
        let actions = self.hub.receive(text, now);
        self.drive(actions, now)
    }

    /// Periodic timer.
    pub fn tick(&mut self, now: I) -> Vec<SessionAction<W>> {
        let actions = self.hub.tick(now);
        self.drive(actions, now)
    }

    /// Join a room; `waiter` is resolved through `ResolveJoin`.
    pub fn join(&mut self, room_id: RoomId, waiter: W, now: I) -> Vec<SessionAction<W>> {
        let Some(identity) = self.identity.clone() else {
            return vec![SessionAction::ResolveJoin {
                waiters: vec![waiter],
                outcome: Err(SessionError::NotReady { state: self.state }),
            }];
        };

        let actions = self.membership.join(&mut self.hub, room_id, waiter, now);
        if self.membership.state(room_id) != JoinState::NotJoined {
            let reconcile = self.config.reconcile.clone();
            self.rooms.entry(room_id).or_insert_with(|| MessageReconciler::new(identity, reconcile));
        }
        self.drive_membership(actions, now)
    }

    /// Leave a room. Never fails.
    pub fn leave(&mut self, room_id: RoomId, now: I) -> Vec<SessionAction<W>> {
        let actions = self.membership.leave(&mut self.hub, room_id, now);
        self.sends.retain(|_, send| send.room_id != room_id);
        self.drive_membership(actions, now)
    }

    /// Send a message to a joined room.
    ///
    /// The returned Pending message is already in the room's list.
    ///
    /// # Errors
    ///
    /// - `SessionError::NotReady` unless Active
    /// - `SessionError::InvalidMessage` for blank text
    /// - `SessionError::NotJoined` if the room is not Joined
    pub fn send(
        &mut self,
        room_id: RoomId,
        text: &str,
        now: I,
        sent_at: DateTime<Utc>,
    ) -> Result<(Message, Vec<SessionAction<W>>), SessionError> {
        self.check_sendable(room_id)?;
        if text.trim().is_empty() {
            return Err(SessionError::InvalidMessage("message text is empty"));
        }

        let reconciler = self.rooms.get_mut(&room_id).ok_or(SessionError::NotJoined { room_id })?;
        let message = reconciler.send_optimistic(text, now, sent_at);
        let actions = self.dispatch_send(room_id, message.local_id, message.text.clone(), 1, now);
        Ok((message, actions))
    }

    /// Send a Rejected message again under a new local id.
    ///
    /// # Errors
    ///
    /// - `SessionError::NotReady` unless Active
    /// - `SessionError::NotJoined` if the room is not Joined
    /// - `SessionError::UnknownMessage` if `local_id` is not in the list
    /// - `SessionError::InvalidMessage` if the entry is not Rejected
    pub fn resend(
        &mut self,
        room_id: RoomId,
        local_id: LocalId,
        now: I,
        sent_at: DateTime<Utc>,
    ) -> Result<(Message, Vec<SessionAction<W>>), SessionError> {
        self.check_sendable(room_id)?;
        let reconciler = self.rooms.get_mut(&room_id).ok_or(SessionError::NotJoined { room_id })?;
        let message = reconciler
            .resend(local_id, now, sent_at)
            .map_err(|err| reconcile_error(room_id, err))?;

        debug!(room_id, %local_id, resent_as = %message.local_id, "resending message");
        let actions = self.dispatch_send(room_id, message.local_id, message.text.clone(), 1, now);
        Ok((message, actions))
    }

    /// Remove a Rejected message.
    ///
    /// # Errors
    ///
    /// - `SessionError::NotJoined` if the room is not open
    /// - `SessionError::UnknownMessage` if `local_id` is not in the list
    /// - `SessionError::InvalidMessage` if the entry is not Rejected
    pub fn dismiss(&mut self, room_id: RoomId, local_id: LocalId) -> Result<Vec<SessionAction<W>>, SessionError> {
        let reconciler = self.rooms.get_mut(&room_id).ok_or(SessionError::NotJoined { room_id })?;
        reconciler.dismiss(local_id).map_err(|err| reconcile_error(room_id, err))?;
        Ok(vec![SessionAction::Emit(SessionEvent::MessagesUpdated { room_id })])
    }

    /// Merge a fetched room history and replace the room's details.
    ///
    /// # Errors
    ///
    /// - `SessionError::NotJoined` if the room was closed meanwhile
    pub fn load_history(
        &mut self,
        room_id: RoomId,
        details: &RoomDetails,
    ) -> Result<Vec<SessionAction<W>>, SessionError> {
        let reconciler = self.rooms.get_mut(&room_id).ok_or(SessionError::NotJoined { room_id })?;
        let changed = reconciler.load_room(details);
        debug!(room_id, changed, total = reconciler.len(), members = details.members.len(), "history loaded");

        let mut out = vec![SessionAction::Emit(SessionEvent::RoomUpdated { room_id })];
        if changed > 0 {
            out.push(SessionAction::Emit(SessionEvent::MessagesUpdated { room_id }));
        }
        Ok(out)
    }

    /// End the session, closing the hub and releasing every room.
    pub fn logout(&mut self) -> Vec<SessionAction<W>> {
        self.force_logout(LogoutReason::UserRequested)
    }

    fn check_sendable(&self, room_id: RoomId) -> Result<(), SessionError> {
        if self.state != SupervisorState::Active {
            return Err(SessionError::NotReady { state: self.state });
        }
        if !self.membership.is_joined(room_id) {
            return Err(SessionError::NotJoined { room_id });
        }
        Ok(())
    }

    fn token_retry_delay(&self) -> Duration {
        self.config.token_retry_delay.saturating_mul(self.token_attempts)
    }

    fn accept_credential(&mut self, credential: Credential, now: I) -> Vec<SessionAction<W>> {
        if self.identity.is_none() {
            match Identity::from_credential(&credential) {
                Ok(identity) => self.identity = Some(identity),
                Err(err) => {
                    warn!(%err, "credential does not identify the user");
                    return self.force_logout(LogoutReason::AuthFailed);
                },
            }
        }

        self.credential = Some(credential);
        self.token_attempts = 0;

        let mut out = Vec::new();
        self.transition(SupervisorState::Connecting, &mut out);
        let actions = self.hub.connect(now);
        out.extend(self.drive(actions, now));
        out
    }

    fn dispatch_send(
        &mut self,
        room_id: RoomId,
        local_id: LocalId,
        text: String,
        attempts: u32,
        now: I,
    ) -> Vec<SessionAction<W>> {
        let method = HubMethod::SendMessage { room_id, text };
        let mut out = vec![SessionAction::Emit(SessionEvent::MessagesUpdated { room_id })];
        match self.hub.invoke(method.target(), method.arguments(), now) {
            Ok((invocation, actions)) => {
                self.sends.insert(invocation, PendingSend { room_id, local_id, attempts });
                out.extend(self.drive(actions, now));
            },
            Err(err) => {
                warn!(room_id, %local_id, %err, "send could not be issued");
                out.extend(self.send_failed(room_id, local_id));
            },
        }
        out
    }

    fn send_completed(
        &mut self,
        send: PendingSend,
        outcome: Result<Option<Value>, InvocationError>,
        now: I,
    ) -> Vec<SessionAction<W>> {
        let PendingSend { room_id, local_id, attempts } = send;
        let Some(reconciler) = self.rooms.get_mut(&room_id) else {
            return Vec::new();
        };

        match outcome {
            Ok(result) => {
                let stored = result.and_then(|value| serde_json::from_value::<ServerMessage>(value).ok());
                if let Err(err) = reconciler.on_send_ack(local_id, stored) {
                    debug!(room_id, %err, "acknowledgement for settled message");
                    return Vec::new();
                }
                vec![SessionAction::Emit(SessionEvent::MessagesUpdated { room_id })]
            },
            Err(err)
                if err.is_transient() &&
                    attempts <= self.config.send_retry_limit &&
                    self.hub.state() != ConnectionState::Disconnected =>
            {
                let Some(text) = reconciler.get(local_id).map(|message| message.text.clone()) else {
                    return Vec::new();
                };
                debug!(room_id, %local_id, %err, attempts, "retrying send");
                reconciler.restart_window(local_id, now);
                self.dispatch_send(room_id, local_id, text, attempts + 1, now)
            },
            Err(err) => {
                warn!(room_id, %local_id, %err, "send failed");
                self.send_failed(room_id, local_id)
            },
        }
    }

    fn send_failed(&mut self, room_id: RoomId, local_id: LocalId) -> Vec<SessionAction<W>> {
        let Some(reconciler) = self.rooms.get_mut(&room_id) else {
            return Vec::new();
        };
        if let Err(err) = reconciler.on_send_failure(local_id) {
            debug!(room_id, %err, "failure for settled message");
            return Vec::new();
        }
        vec![
            SessionAction::Emit(SessionEvent::SendFailed { room_id, local_id }),
            SessionAction::Emit(SessionEvent::MessagesUpdated { room_id }),
        ]
    }

    fn drive(&mut self, actions: Vec<HubAction>, now: I) -> Vec<SessionAction<W>> {
        self.run(actions.into_iter().map(Work::Hub).collect(), now)
    }

    fn drive_membership(&mut self, actions: Vec<MembershipAction<W>>, now: I) -> Vec<SessionAction<W>> {
        self.run(actions.into_iter().map(Work::Membership).collect(), now)
    }

    /// Process hub and membership actions in order until none are left.
    fn run(&mut self, mut work: VecDeque<Work<W>>, now: I) -> Vec<SessionAction<W>> {
        let mut out = Vec::new();

        while let Some(item) = work.pop_front() {
            match item {
                Work::Hub(action) => self.handle_hub(action, now, &mut work, &mut out),
                Work::Membership(action) => self.handle_membership(action, &mut out),
            }
        }

        self.check_settled(&mut out);
        out
    }

    fn handle_hub(
        &mut self,
        action: HubAction,
        now: I,
        work: &mut VecDeque<Work<W>>,
        out: &mut Vec<SessionAction<W>>,
    ) {
        match action {
            HubAction::OpenTransport => match &self.credential {
                Some(credential) => out.push(SessionAction::OpenTransport {
                    url: self.config.hub.url.clone(),
                    credential: credential.clone(),
                }),
                None => warn!("hub asked to open without a credential"),
            },
            HubAction::SendFrame(frame) => out.push(SessionAction::SendFrame(frame)),
            HubAction::CloseTransport => out.push(SessionAction::CloseTransport),
            HubAction::Notify(notice) => self.handle_notice(notice, now, work, out),
            HubAction::Dispatch(event) => self.handle_event(event, now, out),
            HubAction::Completed { invocation_id, outcome } => {
                if let Some(actions) = self.membership.on_completion(&mut self.hub, invocation_id, &outcome, now)
                {
                    work.extend(actions.into_iter().map(Work::Membership));
                } else if let Some(send) = self.sends.remove(&invocation_id) {
                    let actions = self.send_completed(send, outcome, now);
                    out.extend(actions);
                } else {
                    debug!(invocation_id, "completion with no owner");
                }
            },
        }
    }

    fn handle_notice(
        &mut self,
        notice: HubNotice,
        now: I,
        work: &mut VecDeque<Work<W>>,
        out: &mut Vec<SessionAction<W>>,
    ) {
        match notice {
            HubNotice::Connected | HubNotice::Reconnected => {
                out.push(SessionAction::Emit(SessionEvent::ConnectionChanged(ConnectionState::Connected)));
                // Rejoins go out before the queued calls
                let rejoins = self.membership.on_reconnected(&mut self.hub, now);
                work.extend(rejoins.into_iter().map(Work::Membership));
                let flushed = self.hub.flush_queued(now);
                work.extend(flushed.into_iter().map(Work::Hub));
                // Queued and requeued sends go out again from here
                for reconciler in self.rooms.values_mut() {
                    reconciler.restart_windows(now);
                }
            },
            HubNotice::RetryScheduled { attempt, delay } => {
                debug!(attempt, ?delay, "hub reconnecting");
                if self.state == SupervisorState::Active {
                    out.push(SessionAction::Emit(SessionEvent::ConnectionChanged(self.hub.state())));
                    self.transition(SupervisorState::Connecting, out);
                }
            },
            HubNotice::AuthExpired => {
                out.push(SessionAction::Emit(SessionEvent::ConnectionChanged(ConnectionState::Disconnected)));
                self.recover(out);
            },
            HubNotice::Closed { reason } => {
                warn!(%reason, "hub closed");
                out.push(SessionAction::Emit(SessionEvent::ConnectionChanged(ConnectionState::Disconnected)));
                self.recover(out);
            },
        }
    }

    fn handle_event(&mut self, event: ServerEvent, now: I, out: &mut Vec<SessionAction<W>>) {
        match &event {
            ServerEvent::ReceiveMessage(message) => match self.route(message.chat_room_id) {
                Some(room_id) => {
                    if let Some(reconciler) = self.rooms.get_mut(&room_id)
                        && reconciler.on_server_echo(message.clone(), now).changed()
                    {
                        out.push(SessionAction::Emit(SessionEvent::MessagesUpdated { room_id }));
                    }
                },
                None => debug!(server_id = message.id, room = ?message.chat_room_id, "message for no open room"),
            },
            ServerEvent::UserJoined(user) => {
                let room_id = self.route(None);
                out.push(SessionAction::Emit(SessionEvent::UserJoined { room_id, user: user.clone() }));
                out.extend(room_id.map(|room_id| SessionAction::FetchHistory { room_id }));
            },
            ServerEvent::UserLeft(user) => {
                let room_id = self.route(None);
                out.push(SessionAction::Emit(SessionEvent::UserLeft { room_id, user: user.clone() }));
                out.extend(room_id.map(|room_id| SessionAction::FetchHistory { room_id }));
            },
            ServerEvent::Other { .. } => {},
        }
        out.push(SessionAction::Dispatch(event));
    }

    /// Room an event belongs to: the named room if open, else the only
    /// open room.
    fn route(&self, named: Option<RoomId>) -> Option<RoomId> {
        match named {
            Some(room_id) => self.rooms.contains_key(&room_id).then_some(room_id),
            None if self.rooms.len() == 1 => self.rooms.keys().next().copied(),
            None => None,
        }
    }

    fn handle_membership(&mut self, action: MembershipAction<W>, out: &mut Vec<SessionAction<W>>) {
        match action {
            MembershipAction::Hub(HubAction::SendFrame(frame)) => out.push(SessionAction::SendFrame(frame)),
            MembershipAction::Hub(HubAction::OpenTransport) => {
                if let Some(credential) = &self.credential {
                    out.push(SessionAction::OpenTransport {
                        url: self.config.hub.url.clone(),
                        credential: credential.clone(),
                    });
                }
            },
            MembershipAction::Hub(other) => debug!(action = ?other, "membership hub action ignored"),
            MembershipAction::Resolve { waiters, outcome } => {
                if !waiters.is_empty() {
                    out.push(SessionAction::ResolveJoin { waiters, outcome });
                }
            },
            MembershipAction::Joined { room_id, rejoin } => {
                out.push(SessionAction::Emit(SessionEvent::RoomJoined { room_id, rejoin }));
                out.push(SessionAction::FetchHistory { room_id });
            },
            MembershipAction::Left { room_id } => {
                self.rooms.remove(&room_id);
                out.push(SessionAction::Emit(SessionEvent::RoomLeft { room_id }));
            },
            MembershipAction::JoinFailed { room_id, error } => {
                self.rooms.remove(&room_id);
                self.sends.retain(|_, send| send.room_id != room_id);
                out.push(SessionAction::Emit(SessionEvent::JoinFailed { room_id, error }));
            },
        }
    }

    /// Promote Connecting to Active once the hub is up and rejoins settled.
    fn check_settled(&mut self, out: &mut Vec<SessionAction<W>>) {
        if self.state == SupervisorState::Connecting && self.hub.is_connected() && self.membership.is_settled() {
            self.recovery_attempts = 0;
            self.transition(SupervisorState::Active, out);
        }
    }

    fn recover(&mut self, out: &mut Vec<SessionAction<W>>) {
        if matches!(self.state, SupervisorState::LoggedOut | SupervisorState::Authenticating) {
            return;
        }

        self.recovery_attempts += 1;
        if self.recovery_attempts > self.config.max_recovery_attempts {
            warn!(attempts = self.recovery_attempts, "giving up on the hub");
            out.extend(self.force_logout(LogoutReason::Unreachable));
            return;
        }

        self.transition(SupervisorState::Recovering, out);
        self.credential = None;
        self.token_attempts = 0;
        self.transition(SupervisorState::Authenticating, out);
        out.push(SessionAction::RefreshToken { delay: Duration::ZERO });
    }

    fn force_logout(&mut self, reason: LogoutReason) -> Vec<SessionAction<W>> {
        if self.state == SupervisorState::LoggedOut {
            return Vec::new();
        }

        info!(?reason, "logging out");
        let mut out = Vec::new();

        for action in self.membership.clear() {
            if let MembershipAction::Resolve { waiters, outcome } = action
                && !waiters.is_empty()
            {
                out.push(SessionAction::ResolveJoin { waiters, outcome });
            }
        }
        for room_id in std::mem::take(&mut self.rooms).into_keys() {
            out.push(SessionAction::Emit(SessionEvent::RoomLeft { room_id }));
        }
        self.sends.clear();

        // Pending calls were already released above
        if self.hub.close().contains(&HubAction::CloseTransport) {
            out.push(SessionAction::CloseTransport);
        }

        self.identity = None;
        self.credential = None;
        self.token_attempts = 0;
        self.recovery_attempts = 0;
        self.transition(SupervisorState::LoggedOut, &mut out);
        out.push(SessionAction::Emit(SessionEvent::LoggedOut { reason }));
        out
    }

    fn transition(&mut self, to: SupervisorState, out: &mut Vec<SessionAction<W>>) {
        let from = self.state;
        if from == to {
            return;
        }
        debug!(?from, ?to, "supervisor transition");
        self.state = to;
        out.push(SessionAction::Emit(SessionEvent::StateChanged { from, to }));
    }
}

fn reconcile_error(room_id: RoomId, err: ReconcileError) -> SessionError {
    match err {
        ReconcileError::UnknownMessage(local_id) => SessionError::UnknownMessage { room_id, local_id },
        ReconcileError::WrongState { .. } => SessionError::InvalidMessage("only rejected messages can be resent or dismissed"),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::time::Instant;

    use serde_json::json;
    use unichat_proto::{HubMessage, RECORD_SEPARATOR};

    use super::*;
    use crate::{
        config::DEFAULT_TOKEN_RETRY_DELAY,
        env::{Environment, test_utils::MockEnv},
        reconciler::ConfirmationState,
    };

    type Supervisor = SessionSupervisor<Instant, u32>;

    const HANDSHAKE_OK: &str = "{}\u{1e}";

    fn identity() -> Identity {
        Identity::new(7, "ana")
    }

    fn credential() -> Credential {
        Credential::new("token-1")
    }

    /// Decoded invocations in the order they were sent.
    fn invocations(actions: &[SessionAction<u32>]) -> Vec<(String, String, Vec<Value>)> {
        actions
            .iter()
            .filter_map(|action| match action {
                SessionAction::SendFrame(frame) => {
                    match HubMessage::decode(frame.trim_end_matches(RECORD_SEPARATOR)).ok()? {
                        HubMessage::Invocation { invocation_id, target, arguments } => {
                            Some((invocation_id?, target, arguments))
                        },
                        _ => None,
                    }
                },
                _ => None,
            })
            .collect()
    }

    fn events(actions: &[SessionAction<u32>]) -> Vec<SessionEvent> {
        actions
            .iter()
            .filter_map(|action| match action {
                SessionAction::Emit(event) => Some(event.clone()),
                _ => None,
            })
            .collect()
    }

    fn resolved(actions: &[SessionAction<u32>]) -> Vec<(u32, JoinOutcome)> {
        actions
            .iter()
            .flat_map(|action| match action {
                SessionAction::ResolveJoin { waiters, outcome } => {
                    waiters.iter().map(|w| (*w, outcome.clone())).collect()
                },
                _ => Vec::new(),
            })
            .collect()
    }

    fn completion(id: &str) -> String {
        format!("{{\"type\":3,\"invocationId\":\"{id}\"}}\u{1e}")
    }

    fn echo(id: u64, sender: u64, text: &str, room: RoomId) -> String {
        let message = json!({
            "type": 1,
            "target": "ReceiveMessage",
            "arguments": [{
                "id": id,
                "messageText": text,
                "senderId": sender,
                "sender": { "username": "ana" },
                "sentAt": "2024-05-01T10:00:01Z",
                "chatRoomId": room,
            }],
        });
        format!("{message}\u{1e}")
    }

    fn active(env: &MockEnv) -> Supervisor {
        let mut supervisor = Supervisor::new(SessionConfig::default(), env.now());
        supervisor.login(Some(identity())).unwrap();
        supervisor.token_acquired(Ok(Some(credential())), env.now(), env.wall_clock());
        supervisor.transport_opened(env.now());
        supervisor.frame_received(HANDSHAKE_OK, env.now());
        assert_eq!(supervisor.state(), SupervisorState::Active);
        supervisor
    }

    fn joined(env: &MockEnv, room_id: RoomId) -> Supervisor {
        let mut supervisor = active(env);
        let actions = supervisor.join(room_id, 0, env.now());
        let (id, ..) = invocations(&actions).remove(0);
        supervisor.frame_received(&completion(&id), env.now());
        assert_eq!(supervisor.join_state(room_id), JoinState::Joined);
        supervisor
    }

    #[test]
    fn login_connects_and_becomes_active() {
        let env = MockEnv::new();
        let mut supervisor = Supervisor::new(SessionConfig::default(), env.now());

        let actions = supervisor.login(Some(identity())).unwrap();
        assert!(matches!(actions.last(), Some(SessionAction::AcquireToken { .. })));

        let actions = supervisor.token_acquired(Ok(Some(credential())), env.now(), env.wall_clock());
        assert_eq!(supervisor.state(), SupervisorState::Connecting);
        assert!(actions.iter().any(|a| matches!(
            a,
            SessionAction::OpenTransport { credential, .. } if credential.access_token() == "token-1"
        )));

        supervisor.transport_opened(env.now());
        let actions = supervisor.frame_received(HANDSHAKE_OK, env.now());
        assert!(events(&actions).contains(&SessionEvent::StateChanged {
            from: SupervisorState::Connecting,
            to: SupervisorState::Active,
        }));
        assert_eq!(supervisor.session().unwrap().connection_state, ConnectionState::Connected);
    }

    #[test]
    fn missing_token_falls_back_to_refresh() {
        let env = MockEnv::new();
        let mut supervisor = Supervisor::new(SessionConfig::default(), env.now());
        supervisor.login(Some(identity())).unwrap();

        let actions = supervisor.token_acquired(Ok(None), env.now(), env.wall_clock());
        assert!(matches!(actions[..], [SessionAction::RefreshToken { delay }] if delay.is_zero()));

        supervisor.token_refreshed(Ok(credential()), env.now());
        assert_eq!(supervisor.state(), SupervisorState::Connecting);
    }

    #[test]
    fn rejected_refresh_logs_out() {
        let env = MockEnv::new();
        let mut supervisor = Supervisor::new(SessionConfig::default(), env.now());
        supervisor.login(Some(identity())).unwrap();
        supervisor.token_acquired(Ok(None), env.now(), env.wall_clock());

        let actions = supervisor.token_refreshed(Err(AuthError::Rejected("expired".into())), env.now());
        assert_eq!(supervisor.state(), SupervisorState::LoggedOut);
        assert!(events(&actions).contains(&SessionEvent::LoggedOut { reason: LogoutReason::AuthFailed }));
    }

    #[test]
    fn unavailable_token_service_is_retried_then_fails() {
        let env = MockEnv::new();
        let mut supervisor = Supervisor::new(SessionConfig::default(), env.now());
        supervisor.login(Some(identity())).unwrap();
        supervisor.token_acquired(Ok(None), env.now(), env.wall_clock());

        let unavailable = || Err(AuthError::Unavailable("503".into()));
        for attempt in 1..=2 {
            let actions = supervisor.token_refreshed(unavailable(), env.now());
            let expected = DEFAULT_TOKEN_RETRY_DELAY * attempt;
            assert!(matches!(actions[..], [SessionAction::RefreshToken { delay }] if delay == expected));
        }
        supervisor.token_refreshed(unavailable(), env.now());
        assert_eq!(supervisor.state(), SupervisorState::LoggedOut);
    }

    #[test]
    fn send_requires_active_joined_room_and_text() {
        let env = MockEnv::new();
        let mut supervisor = Supervisor::new(SessionConfig::default(), env.now());
        assert_eq!(
            supervisor.send(5, "hi", env.now(), env.wall_clock()).unwrap_err(),
            SessionError::NotReady { state: SupervisorState::LoggedOut }
        );

        let mut supervisor = active(&env);
        assert_eq!(
            supervisor.send(5, "hi", env.now(), env.wall_clock()).unwrap_err(),
            SessionError::NotJoined { room_id: 5 }
        );

        let mut supervisor = joined(&env, 5);
        assert!(matches!(
            supervisor.send(5, "   ", env.now(), env.wall_clock()),
            Err(SessionError::InvalidMessage(_))
        ));
    }

    #[test]
    fn send_then_echo_shows_one_confirmed_message() {
        let env = MockEnv::new();
        let mut supervisor = joined(&env, 5);

        let (message, actions) = supervisor.send(5, "hello", env.now(), env.wall_clock()).unwrap();
        assert_eq!(message.state, ConfirmationState::Pending);
        let (_, target, arguments) = invocations(&actions).remove(0);
        assert_eq!(target, "SendMessage");
        assert_eq!(arguments, vec![json!(5), json!("hello")]);

        let actions = supervisor.frame_received(&echo(42, 7, "hello", 5), env.now());
        assert!(events(&actions).contains(&SessionEvent::MessagesUpdated { room_id: 5 }));
        assert!(actions.iter().any(|a| matches!(a, SessionAction::Dispatch(ServerEvent::ReceiveMessage(_)))));

        let messages = supervisor.messages(5).unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].server_id, Some(42));
        assert_eq!(messages[0].local_id, message.local_id);
    }

    #[test]
    fn remote_send_error_rejects_message() {
        let env = MockEnv::new();
        let mut supervisor = joined(&env, 5);
        let (message, actions) = supervisor.send(5, "hello", env.now(), env.wall_clock()).unwrap();
        let (id, ..) = invocations(&actions).remove(0);

        let failure = format!("{{\"type\":3,\"invocationId\":\"{id}\",\"error\":\"too long\"}}\u{1e}");
        let actions = supervisor.frame_received(&failure, env.now());

        assert!(events(&actions).contains(&SessionEvent::SendFailed { room_id: 5, local_id: message.local_id }));
        assert_eq!(supervisor.messages(5).unwrap()[0].state, ConfirmationState::Rejected);
    }

    #[test]
    fn ack_with_stored_message_confirms() {
        let env = MockEnv::new();
        let mut supervisor = joined(&env, 5);
        let (_, actions) = supervisor.send(5, "hello", env.now(), env.wall_clock()).unwrap();
        let (id, ..) = invocations(&actions).remove(0);

        let ack = json!({
            "type": 3,
            "invocationId": id,
            "result": {
                "id": 42,
                "messageText": "hello",
                "senderId": 7,
                "sentAt": "2024-05-01T10:00:01",
            },
        });
        supervisor.frame_received(&format!("{ack}\u{1e}"), env.now());

        let messages = supervisor.messages(5).unwrap();
        assert_eq!(messages[0].state, ConfirmationState::Confirmed);
        assert!(messages[0].acknowledged);

        // The echo that follows is a duplicate
        supervisor.frame_received(&echo(42, 7, "hello", 5), env.now());
        assert_eq!(supervisor.messages(5).unwrap().len(), 1);
    }

    #[test]
    fn transient_drop_moves_active_to_connecting() {
        let env = MockEnv::new();
        let mut supervisor = joined(&env, 5);

        supervisor.transport_failed(TransportFailure::Network("reset".into()), env.now());
        assert_eq!(supervisor.state(), SupervisorState::Connecting);
        assert!(matches!(
            supervisor.send(5, "hi", env.now(), env.wall_clock()),
            Err(SessionError::NotReady { state: SupervisorState::Connecting })
        ));

        env.advance(Duration::from_secs(1));
        let actions = supervisor.tick(env.now());
        assert!(actions.iter().any(|a| matches!(a, SessionAction::OpenTransport { .. })));
        supervisor.transport_opened(env.now());
        let actions = supervisor.frame_received(HANDSHAKE_OK, env.now());

        // Active only after the rejoin completes
        let (id, target, _) = invocations(&actions).remove(0);
        assert_eq!(target, "JoinRoom");
        assert_eq!(supervisor.state(), SupervisorState::Connecting);

        let actions = supervisor.frame_received(&completion(&id), env.now());
        assert_eq!(supervisor.state(), SupervisorState::Active);
        assert!(events(&actions).contains(&SessionEvent::RoomJoined { room_id: 5, rejoin: true }));
    }

    #[test]
    fn auth_expiry_refreshes_rejoins_and_resends() {
        let env = MockEnv::new();
        let mut supervisor = joined(&env, 5);
        let (message, _) = supervisor.send(5, "still here?", env.now(), env.wall_clock()).unwrap();

        let actions = supervisor.transport_failed(TransportFailure::Unauthorized, env.now());
        assert_eq!(supervisor.state(), SupervisorState::Authenticating);
        assert!(actions.iter().any(|a| matches!(a, SessionAction::RefreshToken { .. })));
        let states: Vec<_> = events(&actions)
            .into_iter()
            .filter_map(|e| match e {
                SessionEvent::StateChanged { to, .. } => Some(to),
                _ => None,
            })
            .collect();
        assert_eq!(states, vec![SupervisorState::Recovering, SupervisorState::Authenticating]);

        supervisor.token_refreshed(Ok(Credential::new("token-2")), env.now());
        supervisor.transport_opened(env.now());
        let actions = supervisor.frame_received(HANDSHAKE_OK, env.now());

        let calls = invocations(&actions);
        let targets: Vec<_> = calls.iter().map(|(_, target, _)| target.as_str()).collect();
        assert_eq!(targets, vec!["JoinRoom", "SendMessage"]);
        assert_eq!(supervisor.messages(5).unwrap()[0].state, ConfirmationState::Pending);
        assert_eq!(supervisor.messages(5).unwrap()[0].local_id, message.local_id);

        supervisor.frame_received(&completion(&calls[0].0), env.now());
        assert_eq!(supervisor.state(), SupervisorState::Active);
    }

    #[test]
    fn outage_longer_than_window_still_pairs_echo() {
        let env = MockEnv::new();
        let mut supervisor = joined(&env, 5);
        let (message, _) = supervisor.send(5, "still here?", env.now(), env.wall_clock()).unwrap();

        supervisor.transport_failed(TransportFailure::Unauthorized, env.now());
        env.advance(Duration::from_secs(8));
        supervisor.token_refreshed(Ok(Credential::new("token-2")), env.now());
        supervisor.transport_opened(env.now());
        let calls = invocations(&supervisor.frame_received(HANDSHAKE_OK, env.now()));
        supervisor.frame_received(&completion(&calls[0].0), env.now());

        // Echo first, then a completion without a stored message
        supervisor.frame_received(&echo(42, 7, "still here?", 5), env.now());
        supervisor.frame_received(&completion(&calls[1].0), env.now());

        let messages = supervisor.messages(5).unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].local_id, message.local_id);
        assert_eq!(messages[0].server_id, Some(42));
        assert_eq!(messages[0].state, ConfirmationState::Confirmed);
    }

    #[test]
    fn acknowledged_message_pairs_with_late_echo() {
        let env = MockEnv::new();
        let mut supervisor = joined(&env, 5);
        let (message, actions) = supervisor.send(5, "hello", env.now(), env.wall_clock()).unwrap();
        let (id, ..) = invocations(&actions).remove(0);

        supervisor.frame_received(&completion(&id), env.now());
        env.advance(Duration::from_secs(30));
        supervisor.frame_received(&echo(42, 7, "hello", 5), env.now());

        let messages = supervisor.messages(5).unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].local_id, message.local_id);
        assert_eq!(messages[0].state, ConfirmationState::Confirmed);
    }

    #[test]
    fn presence_refreshes_room_details() {
        let env = MockEnv::new();
        let mut supervisor = joined(&env, 5);
        let details = RoomDetails {
            name: "Kitchen".into(),
            description: Some("snacks".into()),
            members: vec![unichat_proto::ChatUser { id: 9, username: "leo".into(), profile_picture: None }],
            messages: Vec::new(),
        };

        let actions = supervisor.load_history(5, &details).unwrap();
        assert_eq!(events(&actions), vec![SessionEvent::RoomUpdated { room_id: 5 }]);
        assert_eq!(supervisor.room_details(5).unwrap().members.len(), 1);
        assert_eq!(supervisor.room_details(5).unwrap().name, "Kitchen");

        let joined = json!({ "type": 1, "target": "UserJoined", "arguments": ["mia"] });
        let actions = supervisor.frame_received(&format!("{joined}\u{1e}"), env.now());
        assert!(actions.iter().any(|a| matches!(a, SessionAction::FetchHistory { room_id: 5 })));

        let left = json!({ "type": 1, "target": "UserLeft", "arguments": ["mia"] });
        let actions = supervisor.frame_received(&format!("{left}\u{1e}"), env.now());
        assert!(actions.iter().any(|a| matches!(a, SessionAction::FetchHistory { room_id: 5 })));

        // Members resolve echoes that carry no sender
        let unnamed = json!({
            "type": 1,
            "target": "ReceiveMessage",
            "arguments": [{ "id": 1, "messageText": "hi", "senderId": 9, "sentAt": "2024-05-01T10:00:00Z" }],
        });
        supervisor.frame_received(&format!("{unnamed}\u{1e}"), env.now());
        assert_eq!(supervisor.messages(5).unwrap()[0].sender_username, "leo");
    }

    #[test]
    fn repeated_unrecoverable_closes_log_out() {
        let env = MockEnv::new();
        let mut config = SessionConfig::default();
        config.max_recovery_attempts = 1;
        config.hub.backoff.max_attempts = 1;
        let mut supervisor = Supervisor::new(config, env.now());
        supervisor.login(Some(identity())).unwrap();
        supervisor.token_acquired(Ok(Some(credential())), env.now(), env.wall_clock());

        let fail = |supervisor: &mut Supervisor| {
            supervisor.transport_failed(TransportFailure::Network("refused".into()), env.now());
            env.advance(Duration::from_secs(1));
            supervisor.tick(env.now());
            supervisor.transport_failed(TransportFailure::Network("refused".into()), env.now())
        };

        fail(&mut supervisor);
        assert_eq!(supervisor.state(), SupervisorState::Authenticating);

        supervisor.token_refreshed(Ok(credential()), env.now());
        let actions = fail(&mut supervisor);
        assert_eq!(supervisor.state(), SupervisorState::LoggedOut);
        assert!(events(&actions).contains(&SessionEvent::LoggedOut { reason: LogoutReason::Unreachable }));
    }

    #[test]
    fn messages_route_by_room_or_only_open_room() {
        let env = MockEnv::new();
        let mut supervisor = joined(&env, 5);

        let unnamed = json!({
            "type": 1,
            "target": "ReceiveMessage",
            "arguments": [{ "id": 1, "messageText": "hi", "senderId": 9, "sentAt": "2024-05-01T10:00:00Z" }],
        });
        supervisor.frame_received(&format!("{unnamed}\u{1e}"), env.now());
        assert_eq!(supervisor.messages(5).unwrap().len(), 1);
        assert_eq!(supervisor.messages(5).unwrap()[0].sender_username, "Unknown");

        // Named room that is not open is dropped
        supervisor.frame_received(&echo(2, 9, "elsewhere", 6), env.now());
        assert_eq!(supervisor.messages(5).unwrap().len(), 1);
    }

    #[test]
    fn join_before_login_is_not_ready() {
        let env = MockEnv::new();
        let mut supervisor = Supervisor::new(SessionConfig::default(), env.now());
        let actions = supervisor.join(5, 1, env.now());
        assert_eq!(resolved(&actions), vec![(1, Err(SessionError::NotReady { state: SupervisorState::LoggedOut }))]);
    }

    #[test]
    fn joined_room_requests_history() {
        let env = MockEnv::new();
        let mut supervisor = active(&env);
        let actions = supervisor.join(5, 1, env.now());
        let (id, ..) = invocations(&actions).remove(0);

        let actions = supervisor.frame_received(&completion(&id), env.now());
        assert_eq!(resolved(&actions), vec![(1, Ok(crate::membership::JoinStatus::Joined))]);
        assert!(actions.iter().any(|a| matches!(a, SessionAction::FetchHistory { room_id: 5 })));
    }

    #[test]
    fn logout_releases_everything() {
        let env = MockEnv::new();
        let mut supervisor = active(&env);
        supervisor.join(5, 1, env.now());

        let actions = supervisor.logout();
        assert_eq!(resolved(&actions), vec![(1, Err(SessionError::SessionClosed))]);
        assert!(actions.iter().any(|a| matches!(a, SessionAction::CloseTransport)));
        assert!(events(&actions).contains(&SessionEvent::LoggedOut { reason: LogoutReason::UserRequested }));
        assert_eq!(supervisor.state(), SupervisorState::LoggedOut);
        assert!(supervisor.session().is_none());
        assert!(supervisor.rooms().is_empty());

        assert!(supervisor.logout().is_empty());
    }
}
