//! Room membership protocol.
//!
//! Room membership lives on the server per connection, so it has to be
//! re-established after every reconnect. [`RoomMembership`] keeps one
//! [`RoomHandle`] per open room and drives `JoinRoom` / `LeaveRoom` calls
//! through the hub.
//!
//! Callers that want to be told when a join settles pass a waiter of type
//! `W` (a oneshot sender in the runtime, a plain tag in tests). Every waiter
//! is resolved exactly once through [`MembershipAction::Resolve`].
//!
//! # Invariants
//!
//! - At most one `JoinRoom` call is in flight per room; concurrent joins
//!   wait on the same call.
//! - A join abandoned by `leave` resolves its waiters with
//!   [`JoinStatus::Abandoned`], never with an error.
//! - Server rejections are not retried; connection failures are retried up
//!   to the configured limit.

use std::collections::{BTreeMap, HashMap};

use serde_json::Value;
use tracing::{debug, info, warn};
use unichat_proto::{HubMethod, RoomId};

use crate::{
    env::MonotonicInstant,
    error::{InvocationError, SessionError},
    hub::{ConnectionState, HubAction, HubConnection, InvocationId},
};

/// Membership state of one room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JoinState {
    /// No membership and nothing in flight
    NotJoined,
    /// `JoinRoom` in flight
    Joining,
    /// Server confirmed the join on the current connection
    Joined,
    /// `LeaveRoom` in flight
    Leaving,
}

/// Public view of a room's membership.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoomHandle {
    /// Room
    pub room_id: RoomId,
    /// Membership state
    pub join_state: JoinState,
}

/// Successful join outcomes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinStatus {
    /// Room joined
    Joined,
    /// Caller left before the join finished
    Abandoned,
}

/// What a join waiter receives.
pub type JoinOutcome = Result<JoinStatus, SessionError>;

/// Actions returned by the membership state machine.
#[derive(Debug)]
pub enum MembershipAction<W> {
    /// Forward to the hub driver
    Hub(HubAction),
    /// Deliver `outcome` to each waiter
    Resolve {
        /// Waiters to notify
        waiters: Vec<W>,
        /// Outcome for all of them
        outcome: JoinOutcome,
    },
    /// Room became Joined
    Joined {
        /// Room
        room_id: RoomId,
        /// True when restoring membership after a reconnect
        rejoin: bool,
    },
    /// Room handle was released
    Left {
        /// Room
        room_id: RoomId,
    },
    /// Join failed for good; the handle was released
    JoinFailed {
        /// Room
        room_id: RoomId,
        /// Why
        error: SessionError,
    },
}

#[derive(Debug)]
struct Slot<W> {
    state: JoinState,
    invocation: Option<InvocationId>,
    /// Join calls made for the current attempt chain
    attempts: u32,
    rejoin: bool,
    waiters: Vec<W>,
}

impl<W> Slot<W> {
    fn joining(invocation: InvocationId, attempts: u32, rejoin: bool, waiters: Vec<W>) -> Self {
        Self { state: JoinState::Joining, invocation: Some(invocation), attempts, rejoin, waiters }
    }
}

#[derive(Debug, Clone, Copy)]
enum Call {
    Join(RoomId),
    AbandonedJoin(RoomId),
    Leave(RoomId),
}

/// Room membership state machine.
#[derive(Debug)]
pub struct RoomMembership<W> {
    rooms: BTreeMap<RoomId, Slot<W>>,
    calls: HashMap<InvocationId, Call>,
    retry_limit: u32,
}

impl<W> RoomMembership<W> {
    /// Empty membership. `retry_limit` bounds extra attempts after
    /// transient join failures.
    pub fn new(retry_limit: u32) -> Self {
        Self { rooms: BTreeMap::new(), calls: HashMap::new(), retry_limit }
    }

    /// Membership state of `room_id`.
    pub fn state(&self, room_id: RoomId) -> JoinState {
        self.rooms.get(&room_id).map_or(JoinState::NotJoined, |slot| slot.state)
    }

    /// True if `room_id` is Joined.
    pub fn is_joined(&self, room_id: RoomId) -> bool {
        self.state(room_id) == JoinState::Joined
    }

    /// Every tracked room.
    pub fn handles(&self) -> Vec<RoomHandle> {
        self.rooms
            .iter()
            .map(|(room_id, slot)| RoomHandle { room_id: *room_id, join_state: slot.state })
            .collect()
    }

    /// Rooms currently Joined.
    pub fn joined_rooms(&self) -> Vec<RoomId> {
        self.rooms
            .iter()
            .filter(|(_, slot)| slot.state == JoinState::Joined)
            .map(|(room_id, _)| *room_id)
            .collect()
    }

    /// True when no post-reconnect rejoin is still in flight.
    pub fn is_settled(&self) -> bool {
        !self.rooms.values().any(|slot| slot.state == JoinState::Joining && slot.rejoin)
    }

    /// Join `room_id`, resolving `waiter` when the join settles.
    pub fn join<I: MonotonicInstant>(
        &mut self,
        hub: &mut HubConnection<I>,
        room_id: RoomId,
        waiter: W,
        now: I,
    ) -> Vec<MembershipAction<W>> {
        if let Some(slot) = self.rooms.get_mut(&room_id) {
            match slot.state {
                JoinState::Joined => {
                    return vec![MembershipAction::Resolve {
                        waiters: vec![waiter],
                        outcome: Ok(JoinStatus::Joined),
                    }];
                },
                JoinState::Joining => {
                    debug!(room_id, waiters = slot.waiters.len() + 1, "join coalesced");
                    slot.waiters.push(waiter);
                    return Vec::new();
                },
                // A pending leave is superseded; its completion is ignored
                JoinState::Leaving | JoinState::NotJoined => {},
            }
        }

        if !hub.is_connected() {
            return vec![MembershipAction::Resolve {
                waiters: vec![waiter],
                outcome: Err(SessionError::NotConnected),
            }];
        }

        self.start_join(hub, room_id, vec![waiter], 1, false, now)
    }

    /// Leave `room_id`. Best-effort: never fails.
    pub fn leave<I: MonotonicInstant>(
        &mut self,
        hub: &mut HubConnection<I>,
        room_id: RoomId,
        now: I,
    ) -> Vec<MembershipAction<W>> {
        let Some(slot) = self.rooms.remove(&room_id) else {
            return vec![MembershipAction::Left { room_id }];
        };

        match slot.state {
            JoinState::Joining => {
                if let Some(invocation) = slot.invocation {
                    self.calls.insert(invocation, Call::AbandonedJoin(room_id));
                }
                debug!(room_id, "join abandoned");
                vec![
                    MembershipAction::Resolve {
                        waiters: slot.waiters,
                        outcome: Ok(JoinStatus::Abandoned),
                    },
                    MembershipAction::Left { room_id },
                ]
            },
            JoinState::Joined => {
                let mut actions = self.send_leave(hub, room_id, true, now);
                actions.push(MembershipAction::Left { room_id });
                actions
            },
            JoinState::Leaving => {
                self.rooms.insert(room_id, slot);
                vec![MembershipAction::Left { room_id }]
            },
            JoinState::NotJoined => vec![MembershipAction::Left { room_id }],
        }
    }

    /// Route an invocation completion.
    ///
    /// Returns `None` if the invocation was not a membership call.
    pub fn on_completion<I: MonotonicInstant>(
        &mut self,
        hub: &mut HubConnection<I>,
        invocation_id: InvocationId,
        outcome: &Result<Option<Value>, InvocationError>,
        now: I,
    ) -> Option<Vec<MembershipAction<W>>> {
        let call = self.calls.remove(&invocation_id)?;

        Some(match call {
            Call::Join(room_id) => self.join_completed(hub, room_id, invocation_id, outcome, now),
            Call::AbandonedJoin(room_id) => {
                // The server added us anyway; undo it unless the room was
                // joined again in the meantime
                if outcome.is_ok() && !self.rooms.contains_key(&room_id) && hub.is_connected() {
                    self.send_leave(hub, room_id, false, now)
                } else {
                    Vec::new()
                }
            },
            Call::Leave(room_id) => {
                if let Err(err) = outcome {
                    debug!(room_id, %err, "leave failed; ignored");
                }
                if self
                    .rooms
                    .get(&room_id)
                    .is_some_and(|slot| slot.invocation == Some(invocation_id))
                {
                    self.rooms.remove(&room_id);
                }
                Vec::new()
            },
        })
    }

    /// Restore membership after the hub reconnected.
    ///
    /// Re-issues `JoinRoom` for every Joined room. Rooms already Joining
    /// keep their in-flight call (the hub retries it), so no room ends up
    /// with two joins in flight.
    pub fn on_reconnected<I: MonotonicInstant>(
        &mut self,
        hub: &mut HubConnection<I>,
        now: I,
    ) -> Vec<MembershipAction<W>> {
        // Server-side membership died with the old connection
        self.rooms.retain(|_, slot| slot.state != JoinState::Leaving);

        let mut actions = Vec::new();
        for room_id in self.joined_rooms() {
            let waiters = self.rooms.remove(&room_id).map(|slot| slot.waiters).unwrap_or_default();
            info!(room_id, "rejoining room");
            actions.extend(self.start_join(hub, room_id, waiters, 1, true, now));
        }
        actions
    }

    /// Drop every handle (logout), failing outstanding waiters.
    pub fn clear(&mut self) -> Vec<MembershipAction<W>> {
        self.calls.clear();
        std::mem::take(&mut self.rooms)
            .into_iter()
            .flat_map(|(room_id, slot)| {
                let mut actions = Vec::new();
                if !slot.waiters.is_empty() {
                    actions.push(MembershipAction::Resolve {
                        waiters: slot.waiters,
                        outcome: Err(SessionError::SessionClosed),
                    });
                }
                actions.push(MembershipAction::Left { room_id });
                actions
            })
            .collect()
    }

    fn start_join<I: MonotonicInstant>(
        &mut self,
        hub: &mut HubConnection<I>,
        room_id: RoomId,
        waiters: Vec<W>,
        attempts: u32,
        rejoin: bool,
        now: I,
    ) -> Vec<MembershipAction<W>> {
        let method = HubMethod::JoinRoom { room_id };
        match hub.invoke(method.target(), method.arguments(), now) {
            Ok((invocation, hub_actions)) => {
                debug!(room_id, invocation, attempts, rejoin, "join sent");
                self.calls.insert(invocation, Call::Join(room_id));
                self.rooms.insert(room_id, Slot::joining(invocation, attempts, rejoin, waiters));
                hub_actions.into_iter().map(MembershipAction::Hub).collect()
            },
            Err(err) => {
                self.rooms.remove(&room_id);
                let error = SessionError::from(err);
                vec![
                    MembershipAction::Resolve { waiters, outcome: Err(error.clone()) },
                    MembershipAction::JoinFailed { room_id, error },
                ]
            },
        }
    }

    fn join_completed<I: MonotonicInstant>(
        &mut self,
        hub: &mut HubConnection<I>,
        room_id: RoomId,
        invocation_id: InvocationId,
        outcome: &Result<Option<Value>, InvocationError>,
        now: I,
    ) -> Vec<MembershipAction<W>> {
        let Some(slot) = self.rooms.get_mut(&room_id) else {
            return Vec::new();
        };
        if slot.invocation != Some(invocation_id) {
            return Vec::new();
        }

        match outcome {
            Ok(_) => {
                slot.state = JoinState::Joined;
                slot.invocation = None;
                slot.attempts = 0;
                let rejoin = std::mem::replace(&mut slot.rejoin, false);
                let waiters = std::mem::take(&mut slot.waiters);
                info!(room_id, rejoin, "room joined");
                vec![
                    MembershipAction::Resolve { waiters, outcome: Ok(JoinStatus::Joined) },
                    MembershipAction::Joined { room_id, rejoin },
                ]
            },
            Err(err) if err.is_transient() && hub.state() == ConnectionState::Disconnected => {
                // Hub gave up; a rejoin happens again on the next reconnect
                let waiters = std::mem::take(&mut slot.waiters);
                if slot.rejoin {
                    slot.state = JoinState::Joined;
                    slot.invocation = None;
                    slot.rejoin = false;
                    vec![MembershipAction::Resolve { waiters, outcome: Err(SessionError::NotConnected) }]
                } else {
                    self.rooms.remove(&room_id);
                    let error = SessionError::Invocation(err.clone());
                    vec![
                        MembershipAction::Resolve { waiters, outcome: Err(error.clone()) },
                        MembershipAction::JoinFailed { room_id, error },
                    ]
                }
            },
            Err(err) if err.is_transient() && slot.attempts <= self.retry_limit => {
                let attempts = slot.attempts + 1;
                let rejoin = slot.rejoin;
                let waiters = std::mem::take(&mut slot.waiters);
                debug!(room_id, %err, attempts, "retrying join");
                self.start_join(hub, room_id, waiters, attempts, rejoin, now)
            },
            Err(err) => {
                let waiters = self.rooms.remove(&room_id).map(|slot| slot.waiters).unwrap_or_default();
                let error = match err {
                    InvocationError::Remote(reason) => SessionError::Join { room_id, reason: reason.clone() },
                    other => SessionError::Invocation(other.clone()),
                };
                warn!(room_id, %error, "join failed");
                vec![
                    MembershipAction::Resolve { waiters, outcome: Err(error.clone()) },
                    MembershipAction::JoinFailed { room_id, error },
                ]
            },
        }
    }

    fn send_leave<I: MonotonicInstant>(
        &mut self,
        hub: &mut HubConnection<I>,
        room_id: RoomId,
        track: bool,
        now: I,
    ) -> Vec<MembershipAction<W>> {
        if !hub.is_connected() {
            return Vec::new();
        }

        let method = HubMethod::LeaveRoom { room_id };
        match hub.invoke(method.target(), method.arguments(), now) {
            Ok((invocation, hub_actions)) => {
                self.calls.insert(invocation, Call::Leave(room_id));
                if track {
                    self.rooms.insert(room_id, Slot {
                        state: JoinState::Leaving,
                        invocation: Some(invocation),
                        attempts: 0,
                        rejoin: false,
                        waiters: Vec::new(),
                    });
                }
                hub_actions.into_iter().map(MembershipAction::Hub).collect()
            },
            Err(err) => {
                debug!(room_id, %err, "leave not sent");
                Vec::new()
            },
        }
    }
}
