//! Property-based tests for RoomMembership across reconnects
//!
//! Oracle: after the hub reconnects, every room that was Joined (or still
//! Joining) has exactly one `JoinRoom` call in flight, and completing those
//! calls returns every room to Joined.

use std::{
    collections::{BTreeMap, BTreeSet},
    time::{Duration, Instant},
};

use proptest::prelude::*;
use unichat_core::{
    HubAction, HubConfig, HubConnection, JoinState, MembershipAction, RoomMembership, TransportFailure,
};
use unichat_proto::{HubMessage, RECORD_SEPARATOR};

const HANDSHAKE_OK: &str = "{}\u{1e}";

/// Sent invocations: id -> (target, room).
fn sent_calls(frames: &[String]) -> BTreeMap<String, (String, u64)> {
    frames
        .iter()
        .filter_map(|frame| match HubMessage::decode(frame.trim_end_matches(RECORD_SEPARATOR)).ok()? {
            HubMessage::Invocation { invocation_id, target, arguments } => {
                Some((invocation_id?, (target, arguments.first()?.as_u64()?)))
            },
            _ => None,
        })
        .collect()
}

/// Feed hub actions through membership, returning every frame sent.
fn pump(
    hub: &mut HubConnection<Instant>,
    membership: &mut RoomMembership<u32>,
    actions: Vec<HubAction>,
    now: Instant,
) -> Vec<String> {
    let mut frames = Vec::new();
    let mut queue: Vec<HubAction> = actions;
    while !queue.is_empty() {
        let mut next = Vec::new();
        for action in queue {
            match action {
                HubAction::SendFrame(frame) => frames.push(frame),
                HubAction::Completed { invocation_id, outcome } => {
                    for action in membership.on_completion(hub, invocation_id, &outcome, now).unwrap_or_default() {
                        if let MembershipAction::Hub(action) = action {
                            next.push(action);
                        }
                    }
                },
                _ => {},
            }
        }
        queue = next;
    }
    frames
}

fn membership_frames(actions: Vec<MembershipAction<u32>>) -> Vec<String> {
    actions
        .into_iter()
        .filter_map(|action| match action {
            MembershipAction::Hub(HubAction::SendFrame(frame)) => Some(frame),
            _ => None,
        })
        .collect()
}

fn complete(
    hub: &mut HubConnection<Instant>,
    membership: &mut RoomMembership<u32>,
    invocation_id: &str,
    now: Instant,
) -> Vec<String> {
    let record = format!("{{\"type\":3,\"invocationId\":\"{invocation_id}\"}}\u{1e}");
    let actions = hub.receive(&record, now);
    pump(hub, membership, actions, now)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    /// Property: after a reconnect each previously Joined or Joining room
    /// returns to Joined with no duplicate joins in flight.
    #[test]
    fn prop_reconnect_restores_membership(
        joined in proptest::collection::btree_set(1u64..30, 0..6),
        joining in proptest::collection::btree_set(30u64..60, 0..4),
    ) {
        let start = Instant::now();
        let mut hub = HubConnection::new(start, HubConfig::default());
        let mut membership: RoomMembership<u32> = RoomMembership::new(2);

        hub.connect(start);
        hub.transport_opened(start).unwrap();
        hub.receive(HANDSHAKE_OK, start);

        let mut frames = Vec::new();
        for room in joined.iter().chain(joining.iter()) {
            frames.extend(membership_frames(membership.join(&mut hub, *room, 0, start)));
        }
        prop_assert_eq!(hub.in_flight_len(), joined.len() + joining.len());

        // Complete the joins for `joined`, leave `joining` in flight
        for (id, (_, room)) in sent_calls(&frames) {
            if joined.contains(&room) {
                complete(&mut hub, &mut membership, &id, start);
            }
        }
        for room in &joined {
            prop_assert_eq!(membership.state(*room), JoinState::Joined);
        }

        // Drop and reconnect
        let dropped = hub.transport_failed(TransportFailure::Network("reset".into()), start);
        pump(&mut hub, &mut membership, dropped, start);
        let later = start + Duration::from_secs(1);
        hub.tick(later);
        hub.transport_opened(later).unwrap();
        hub.receive(HANDSHAKE_OK, later);

        let mut frames = membership_frames(membership.on_reconnected(&mut hub, later));
        let flushed = hub.flush_queued(later);
        frames.extend(pump(&mut hub, &mut membership, flushed, later));

        let calls = sent_calls(&frames);
        let mut rooms: Vec<u64> = calls.values().map(|(_, room)| *room).collect();
        rooms.sort_unstable();
        let expected: Vec<u64> = joined.iter().chain(joining.iter()).copied().collect::<BTreeSet<_>>().into_iter().collect();
        prop_assert_eq!(rooms, expected);
        prop_assert!(calls.values().all(|(target, _)| target == "JoinRoom"));

        for id in calls.keys() {
            complete(&mut hub, &mut membership, id, later);
        }
        for room in joined.iter().chain(joining.iter()) {
            prop_assert_eq!(membership.state(*room), JoinState::Joined);
        }
        prop_assert!(membership.is_settled());
    }

    /// Property: any number of concurrent joins for one room produce one
    /// call and resolve every waiter.
    #[test]
    fn prop_concurrent_joins_coalesce(waiters in 1u32..10) {
        let start = Instant::now();
        let mut hub = HubConnection::new(start, HubConfig::default());
        let mut membership: RoomMembership<u32> = RoomMembership::new(2);
        hub.connect(start);
        hub.transport_opened(start).unwrap();
        hub.receive(HANDSHAKE_OK, start);

        let mut frames = Vec::new();
        for waiter in 0..waiters {
            frames.extend(membership_frames(membership.join(&mut hub, 5, waiter, start)));
        }
        let calls = sent_calls(&frames);
        prop_assert_eq!(calls.len(), 1);

        let (id, _) = calls.into_iter().next().unwrap();
        let record = format!("{{\"type\":3,\"invocationId\":\"{id}\"}}\u{1e}");
        let mut resolved = 0;
        for action in hub.receive(&record, start) {
            if let HubAction::Completed { invocation_id, outcome } = action {
                for action in membership.on_completion(&mut hub, invocation_id, &outcome, start).unwrap() {
                    if let MembershipAction::Resolve { waiters, outcome } = action {
                        prop_assert!(outcome.is_ok());
                        resolved += waiters.len();
                    }
                }
            }
        }
        prop_assert_eq!(resolved, waiters as usize);
    }
}
