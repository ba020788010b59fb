//! Hub connection state machine.
//!
//! Owns the lifecycle of one persistent hub connection: transport open,
//! protocol handshake, keep-alive, invocation bookkeeping and automatic
//! reconnection. Uses the action pattern: methods take `now` and return
//! [`HubAction`]s for the driver to execute.
//!
//! # State Machine
//!
//! ```text
//!                 connect()                handshake ok
//! ┌──────────────┐──────────>┌────────────┐─────────────>┌───────────┐
//! │ Disconnected │           │ Connecting │              │ Connected │
//! └──────────────┘<──────────└────────────┘              └───────────┘
//!        ^  ^     401 / gave up     ^                      │      │
//!        │  │                       │ backoff              │ drop │
//!        │  │ 401 / gave up  ┌──────────────┐<─────────────┘      │
//!        │  └────────────────│ Reconnecting │                     │
//!        │                   └──────────────┘── handshake ok ────>│
//!        └──────────────── close() / 401 ───────────────────────-─┘
//! ```
//!
//! # Invocations
//!
//! Calls made while Connected are sent immediately. Calls made while not
//! Connected are queued (and a connect attempt starts if the hub is idle).
//! Calls in flight when the connection drops are re-queued once; a second
//! loss fails them with [`InvocationError::ConnectionLost`].
//!
//! Queued calls are only released by [`HubConnection::flush_queued`]. The
//! owner calls it after handling the `Connected`/`Reconnected` notice, so
//! room membership can be restored before queued sends reach the server.

use std::{
    collections::{BTreeMap, VecDeque},
    time::Duration,
};

use serde_json::Value;
use tracing::{debug, info, warn};
use unichat_proto::{HandshakeRequest, HandshakeResponse, HubMessage, RecordReader, ServerEvent};

use crate::{
    config::HubConfig,
    env::MonotonicInstant,
    error::{HubError, InvocationError, TransportFailure},
};

/// Client-assigned invocation id.
pub type InvocationId = u64;

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// No transport and no attempt scheduled
    Disconnected,
    /// First connection attempt (or attempts) in progress
    Connecting,
    /// Handshake completed
    Connected,
    /// Connection dropped, automatic reconnection in progress
    Reconnecting,
}

/// Lifecycle notifications for the hub's owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HubNotice {
    /// First successful handshake since the hub was created or closed
    Connected,
    /// Handshake completed after an earlier connection was lost
    Reconnected,
    /// An attempt failed; the next one starts after `delay`
    RetryScheduled {
        /// Attempt number about to be made (1-based)
        attempt: u32,
        /// Wait before the attempt
        delay: Duration,
    },
    /// Server refused the credential; the hub is Disconnected
    AuthExpired,
    /// Connection is gone and will not be retried
    Closed {
        /// Why the hub gave up
        reason: String,
    },
}

/// Actions returned by the hub state machine.
///
/// The driver executes these:
/// - `OpenTransport`: open a new transport with the current credential
/// - `SendFrame`: write the record to the transport
/// - `CloseTransport`: drop the current transport (idempotent)
/// - `Notify`, `Dispatch`, `Completed`: hand to the owning state machine
#[derive(Debug, Clone, PartialEq)]
pub enum HubAction {
    /// Open a new transport
    OpenTransport,
    /// Send one encoded record
    SendFrame(String),
    /// Drop the current transport
    CloseTransport,
    /// Lifecycle notification
    Notify(HubNotice),
    /// Server-pushed event
    Dispatch(ServerEvent),
    /// An invocation finished
    Completed {
        /// Invocation that finished
        invocation_id: InvocationId,
        /// Server result or failure
        outcome: Result<Option<Value>, InvocationError>,
    },
}

#[derive(Debug, Clone, Copy)]
enum Phase<I> {
    /// No attempt in progress
    Idle,
    /// Waiting for the driver to open the transport
    Opening { since: I },
    /// Handshake sent, waiting for the response
    Handshaking { since: I },
}

#[derive(Debug, Clone)]
struct Call {
    id: InvocationId,
    target: String,
    arguments: Vec<Value>,
    /// Already used its one retry
    retried: bool,
}

/// Hub connection state machine.
///
/// Pure state: no I/O, time passed in. Generic over the instant type so
/// tests can drive it with a manual clock.
#[derive(Debug)]
pub struct HubConnection<I> {
    state: ConnectionState,
    phase: Phase<I>,
    config: HubConfig,
    /// A handshake has succeeded since creation or the last `close()`
    has_connected: bool,
    /// Failed attempts since the last successful handshake
    attempt: u32,
    retry_at: Option<I>,
    last_received: I,
    last_sent: I,
    reader: RecordReader,
    next_invocation_id: InvocationId,
    in_flight: BTreeMap<InvocationId, Call>,
    queued: VecDeque<Call>,
}

impl<I: MonotonicInstant> HubConnection<I> {
    /// New hub in [`ConnectionState::Disconnected`].
    pub fn new(now: I, config: HubConfig) -> Self {
        Self {
            state: ConnectionState::Disconnected,
            phase: Phase::Idle,
            config,
            has_connected: false,
            attempt: 0,
            retry_at: None,
            last_received: now,
            last_sent: now,
            reader: RecordReader::new(),
            next_invocation_id: 1,
            in_flight: BTreeMap::new(),
            queued: VecDeque::new(),
        }
    }

    /// Current state.
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// True once the handshake has completed.
    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    /// Calls sent and awaiting completion.
    pub fn in_flight_len(&self) -> usize {
        self.in_flight.len()
    }

    /// Calls waiting for a connection.
    pub fn queued_len(&self) -> usize {
        self.queued.len()
    }

    /// Configuration in use.
    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    /// Start connecting.
    ///
    /// No-op while Connected or while an attempt is already in progress or
    /// scheduled.
    pub fn connect(&mut self, now: I) -> Vec<HubAction> {
        if self.state != ConnectionState::Disconnected {
            debug!(state = ?self.state, "connect ignored");
            return Vec::new();
        }

        self.state = ConnectionState::Connecting;
        self.attempt = 0;
        self.start_attempt(now)
    }

    /// Driver opened the transport; send the handshake.
    ///
    /// # Errors
    ///
    /// - `HubError::InvalidState` if no open was requested
    pub fn transport_opened(&mut self, now: I) -> Result<Vec<HubAction>, HubError> {
        if !matches!(self.phase, Phase::Opening { .. }) {
            return Err(HubError::InvalidState { state: self.state, operation: "transport_opened" });
        }

        let record = HandshakeRequest::default().encode()?;
        self.phase = Phase::Handshaking { since: now };
        self.last_sent = now;
        self.last_received = now;
        Ok(vec![HubAction::SendFrame(record)])
    }

    /// Transport failed to open, or an open transport died.
    pub fn transport_failed(&mut self, failure: TransportFailure, now: I) -> Vec<HubAction> {
        if self.state == ConnectionState::Disconnected {
            return Vec::new();
        }

        match failure {
            TransportFailure::Unauthorized => self.auth_expired(),
            TransportFailure::Network(reason) => match self.phase {
                Phase::Opening { .. } | Phase::Handshaking { .. } => self.attempt_failed(reason, now),
                Phase::Idle if self.state == ConnectionState::Connected => {
                    self.connection_lost(reason, now)
                },
                // Already waiting for the next attempt
                Phase::Idle => Vec::new(),
            },
        }
    }

    /// Text received from the transport.
    pub fn receive(&mut self, text: &str, now: I) -> Vec<HubAction> {
        if matches!(self.phase, Phase::Idle | Phase::Opening { .. }) &&
            self.state != ConnectionState::Connected
        {
            warn!(state = ?self.state, "dropping text received without a live transport");
            return Vec::new();
        }

        self.last_received = now;

        let records = match self.reader.push(text) {
            Ok(records) => records,
            Err(err) => {
                warn!(%err, "hub stream corrupt");
                let mut actions = vec![HubAction::CloseTransport];
                actions.extend(self.connection_lost(err.to_string(), now));
                return actions;
            },
        };

        let mut actions = Vec::new();
        for record in records {
            if matches!(self.phase, Phase::Handshaking { .. }) {
                match HandshakeResponse::decode(&record).and_then(HandshakeResponse::into_result) {
                    Ok(()) => actions.extend(self.handshake_complete()),
                    Err(err) => {
                        warn!(%err, "handshake failed");
                        actions.push(HubAction::CloseTransport);
                        actions.extend(self.attempt_failed(err.to_string(), now));
                        return actions;
                    },
                }
                continue;
            }

            // A close message earlier in this batch ended the connection
            if self.state != ConnectionState::Connected {
                break;
            }

            match HubMessage::decode(&record) {
                Ok(message) => actions.extend(self.handle_message(message, now)),
                Err(err) => warn!(%err, "dropping undecodable hub record"),
            }
        }

        actions
    }

    /// Periodic maintenance: retries, handshake timeout, keep-alive, server
    /// timeout.
    pub fn tick(&mut self, now: I) -> Vec<HubAction> {
        match self.phase {
            Phase::Opening { since } | Phase::Handshaking { since } => {
                if now - since > self.config.handshake_timeout {
                    let mut actions = vec![HubAction::CloseTransport];
                    actions.extend(self.attempt_failed("handshake timeout".to_string(), now));
                    return actions;
                }
                Vec::new()
            },
            Phase::Idle => match self.state {
                ConnectionState::Connecting | ConnectionState::Reconnecting => {
                    if self.retry_at.is_some_and(|at| now >= at) {
                        return self.start_attempt(now);
                    }
                    Vec::new()
                },
                ConnectionState::Connected => {
                    let silence = now - self.last_received;
                    if silence > self.config.server_timeout {
                        let mut actions = vec![HubAction::CloseTransport];
                        actions.extend(
                            self.connection_lost(format!("server timeout after {silence:?}"), now),
                        );
                        return actions;
                    }

                    if now - self.last_sent >= self.config.keep_alive_interval {
                        match HubMessage::Ping.encode() {
                            Ok(frame) => {
                                self.last_sent = now;
                                return vec![HubAction::SendFrame(frame)];
                            },
                            Err(err) => warn!(%err, "failed to encode ping"),
                        }
                    }
                    Vec::new()
                },
                ConnectionState::Disconnected => Vec::new(),
            },
        }
    }

    /// Invoke a hub method.
    ///
    /// Sent immediately while Connected; otherwise queued for the next
    /// connection (starting one if the hub is Disconnected).
    ///
    /// # Errors
    ///
    /// - `HubError::Protocol` if the arguments cannot be encoded
    pub fn invoke(
        &mut self,
        target: impl Into<String>,
        arguments: Vec<Value>,
        now: I,
    ) -> Result<(InvocationId, Vec<HubAction>), HubError> {
        let id = self.next_invocation_id;
        self.next_invocation_id += 1;
        let mut call = Call { id, target: target.into(), arguments, retried: false };

        match self.state {
            ConnectionState::Connected => {
                let frame = encode_call(&call)?;
                self.in_flight.insert(id, call);
                self.last_sent = now;
                Ok((id, vec![HubAction::SendFrame(frame)]))
            },
            ConnectionState::Connecting | ConnectionState::Reconnecting => {
                // Sending after the reconnect is this call's one retry
                call.retried = true;
                self.queued.push_back(call);
                Ok((id, Vec::new()))
            },
            ConnectionState::Disconnected => {
                call.retried = true;
                self.queued.push_back(call);
                Ok((id, self.connect(now)))
            },
        }
    }

    /// Send every queued call. No-op unless Connected.
    pub fn flush_queued(&mut self, now: I) -> Vec<HubAction> {
        if self.state != ConnectionState::Connected {
            return Vec::new();
        }

        let mut actions = Vec::new();
        while let Some(call) = self.queued.pop_front() {
            match encode_call(&call) {
                Ok(frame) => {
                    actions.push(HubAction::SendFrame(frame));
                    self.in_flight.insert(call.id, call);
                },
                Err(err) => actions.push(HubAction::Completed {
                    invocation_id: call.id,
                    outcome: Err(InvocationError::Encoding(err.to_string())),
                }),
            }
        }

        if !actions.is_empty() {
            self.last_sent = now;
        }
        actions
    }

    /// Close the connection on purpose (logout).
    ///
    /// Fails every pending call with `Cancelled` and forgets the previous
    /// connection, so the next successful handshake reports `Connected`.
    pub fn close(&mut self) -> Vec<HubAction> {
        let mut actions = Vec::new();
        if self.state != ConnectionState::Disconnected {
            actions.push(HubAction::CloseTransport);
        }

        actions.extend(self.fail_all(&InvocationError::Cancelled, &InvocationError::Cancelled));
        self.state = ConnectionState::Disconnected;
        self.phase = Phase::Idle;
        self.has_connected = false;
        self.attempt = 0;
        self.retry_at = None;
        self.reader.clear();
        actions
    }

    fn start_attempt(&mut self, now: I) -> Vec<HubAction> {
        self.phase = Phase::Opening { since: now };
        self.retry_at = None;
        self.reader.clear();
        debug!(state = ?self.state, attempt = self.attempt, "opening hub transport");
        vec![HubAction::OpenTransport]
    }

    fn handshake_complete(&mut self) -> Vec<HubAction> {
        self.state = ConnectionState::Connected;
        self.phase = Phase::Idle;
        self.attempt = 0;
        self.retry_at = None;

        let notice = if self.has_connected { HubNotice::Reconnected } else { HubNotice::Connected };
        self.has_connected = true;
        info!(?notice, "hub connected");
        vec![HubAction::Notify(notice)]
    }

    fn handle_message(&mut self, message: HubMessage, now: I) -> Vec<HubAction> {
        match message {
            HubMessage::Invocation { target, arguments, .. } => {
                match ServerEvent::parse(&target, arguments) {
                    Ok(event) => vec![HubAction::Dispatch(event)],
                    Err(err) => {
                        warn!(%target, %err, "dropping malformed server event");
                        Vec::new()
                    },
                }
            },
            HubMessage::Completion { invocation_id, result, error } => {
                let Some(call) =
                    invocation_id.parse::<InvocationId>().ok().and_then(|id| self.in_flight.remove(&id))
                else {
                    debug!(%invocation_id, "completion for unknown invocation");
                    return Vec::new();
                };

                let outcome = match error {
                    Some(error) => Err(InvocationError::Remote(error)),
                    None => Ok(result),
                };
                vec![HubAction::Completed { invocation_id: call.id, outcome }]
            },
            HubMessage::Ping => Vec::new(),
            HubMessage::Close { error, allow_reconnect } => {
                let reason = error.unwrap_or_else(|| "server closed the connection".to_string());
                let mut actions = vec![HubAction::CloseTransport];
                if is_unauthorized(&reason) {
                    actions.extend(self.auth_expired());
                } else if allow_reconnect {
                    actions.extend(self.connection_lost(reason, now));
                } else {
                    actions.extend(self.give_up(reason));
                }
                actions
            },
        }
    }

    fn auth_expired(&mut self) -> Vec<HubAction> {
        warn!(state = ?self.state, "hub rejected credential");
        let mut actions = self.requeue_in_flight();
        self.state = ConnectionState::Disconnected;
        self.phase = Phase::Idle;
        self.attempt = 0;
        self.retry_at = None;
        self.reader.clear();
        actions.push(HubAction::CloseTransport);
        actions.push(HubAction::Notify(HubNotice::AuthExpired));
        actions
    }

    fn connection_lost(&mut self, reason: String, now: I) -> Vec<HubAction> {
        warn!(%reason, "hub connection lost");
        let mut actions = self.requeue_in_flight();
        self.state = ConnectionState::Reconnecting;
        self.attempt = 0;
        actions.extend(self.attempt_failed(reason, now));
        actions
    }

    fn attempt_failed(&mut self, reason: String, now: I) -> Vec<HubAction> {
        self.phase = Phase::Idle;
        self.attempt += 1;

        match self.config.backoff.delay_for(self.attempt) {
            Some(delay) => {
                debug!(%reason, attempt = self.attempt, ?delay, "hub retry scheduled");
                self.retry_at = Some(now + delay);
                vec![HubAction::Notify(HubNotice::RetryScheduled { attempt: self.attempt, delay })]
            },
            None => self.give_up(reason),
        }
    }

    fn give_up(&mut self, reason: String) -> Vec<HubAction> {
        warn!(%reason, attempts = self.attempt, "hub connection closed");
        let mut actions = self.fail_all(&InvocationError::ConnectionLost, &InvocationError::NotConnected);
        self.state = ConnectionState::Disconnected;
        self.phase = Phase::Idle;
        self.attempt = 0;
        self.retry_at = None;
        self.reader.clear();
        actions.push(HubAction::Notify(HubNotice::Closed { reason }));
        actions
    }

    /// Move in-flight calls back to the front of the queue, failing those
    /// that already used their retry.
    fn requeue_in_flight(&mut self) -> Vec<HubAction> {
        let mut actions = Vec::new();
        let mut retry = Vec::new();

        for (_, mut call) in std::mem::take(&mut self.in_flight) {
            if call.retried {
                actions.push(HubAction::Completed {
                    invocation_id: call.id,
                    outcome: Err(InvocationError::ConnectionLost),
                });
            } else {
                call.retried = true;
                retry.push(call);
            }
        }

        for call in retry.into_iter().rev() {
            self.queued.push_front(call);
        }
        actions
    }

    fn fail_all(&mut self, in_flight: &InvocationError, queued: &InvocationError) -> Vec<HubAction> {
        let mut actions: Vec<HubAction> = std::mem::take(&mut self.in_flight)
            .into_keys()
            .map(|invocation_id| HubAction::Completed { invocation_id, outcome: Err(in_flight.clone()) })
            .collect();
        actions.extend(self.queued.drain(..).map(|call| HubAction::Completed {
            invocation_id: call.id,
            outcome: Err(queued.clone()),
        }));
        actions
    }
}

fn encode_call(call: &Call) -> Result<String, HubError> {
    let message = HubMessage::Invocation {
        invocation_id: Some(call.id.to_string()),
        target: call.target.clone(),
        arguments: call.arguments.clone(),
    };
    Ok(message.encode()?)
}

fn is_unauthorized(reason: &str) -> bool {
    reason.contains("401") || reason.to_ascii_lowercase().contains("unauthorized")
}
