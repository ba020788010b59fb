//! End-to-end session scenarios against the simulated hub.
//!
//! Each test drives the production session actor over in-memory links with
//! tokio's clock paused, so backoff and keep-alive timers run instantly.

#![allow(clippy::unwrap_used)]

use std::sync::{Arc, Mutex};

use unichat_core::{
    ConfirmationState, Credential, Identity, JoinState, JoinStatus, LogoutReason, SessionError, SessionEvent,
    SupervisorState,
};
use unichat_harness::{
    InvariantRegistry, ScriptedTokenProvider, SessionProbe, SessionView, SimHub, eventually, init_tracing,
    jwt_with_nonce, scenario_config,
};
use unichat_proto::{
    ServerEvent,
    methods::{JOIN_ROOM, LEAVE_ROOM, SEND_MESSAGE},
};

const ROOM: u64 = 5;

fn aino() -> Identity {
    Identity::new(7, "aino")
}

fn leo() -> Identity {
    Identity::new(12, "leo")
}

#[tokio::test(start_paused = true)]
async fn send_is_confirmed_by_its_echo() {
    init_tracing();
    let hub = SimHub::new();
    let mut session = SessionProbe::spawn(&hub, aino());
    session.login_active().await.unwrap();

    assert_eq!(session.handle.join(ROOM).await.unwrap(), JoinStatus::Joined);
    let pending = session.handle.send(ROOM, "hello").await.unwrap();
    assert_eq!(pending.state, ConfirmationState::Pending);

    let messages = session
        .wait_messages(ROOM, "echo confirms the send", |list| {
            list.iter().any(|m| m.local_id == pending.local_id && m.state == ConfirmationState::Confirmed)
        })
        .await
        .unwrap();

    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].server_id, Some(hub.history(ROOM)[0].id));
    assert_eq!(hub.invocation_count(SEND_MESSAGE), 1);

    let view = SessionView::capture(&session.handle, &[ROOM]).await.unwrap();
    InvariantRegistry::standard().assert_all(&view, "after confirmed send");
}

#[tokio::test(start_paused = true)]
async fn rejected_send_can_be_resent() {
    init_tracing();
    let hub = SimHub::new();
    let mut session = SessionProbe::spawn(&hub, aino());
    session.login_active().await.unwrap();
    session.handle.join(ROOM).await.unwrap();

    hub.fail_sends(Some("Failed to send message"));
    let first = session.handle.send(ROOM, "hi").await.unwrap();
    session
        .wait_for("send failure", |event| {
            matches!(event, SessionEvent::SendFailed { local_id, .. } if *local_id == first.local_id)
        })
        .await
        .unwrap();

    hub.fail_sends(None);
    hub.set_next_message_id(42);
    let second = session.handle.resend(ROOM, first.local_id).await.unwrap();
    assert_ne!(second.local_id, first.local_id);

    let messages = session
        .wait_messages(ROOM, "resend confirmed", |list| {
            list.iter().any(|m| m.local_id == second.local_id && m.server_id == Some(42))
        })
        .await
        .unwrap();

    assert_eq!(messages.len(), 2);
    let rejected: Vec<_> = messages.iter().filter(|m| m.state == ConfirmationState::Rejected).collect();
    let confirmed: Vec<_> = messages.iter().filter(|m| m.state == ConfirmationState::Confirmed).collect();
    assert_eq!(rejected.len(), 1);
    assert_eq!(rejected[0].local_id, first.local_id);
    assert_eq!(confirmed.len(), 1);

    session.handle.dismiss(ROOM, first.local_id).await.unwrap();
    let after = session.handle.messages(ROOM).await.unwrap().unwrap();
    assert_eq!(after.len(), 1);
    assert_eq!(after[0].server_id, Some(42));
}

#[tokio::test(start_paused = true)]
async fn expired_credential_is_refreshed_and_rooms_rejoined() {
    init_tracing();
    let hub = SimHub::new();
    let first = Credential::from_jwt(jwt_with_nonce(&aino(), None, 1));
    let second = Credential::from_jwt(jwt_with_nonce(&aino(), None, 2));
    let tokens = ScriptedTokenProvider::storing(first.clone());
    tokens.push_refresh(Ok(second.clone()));

    let mut session = SessionProbe::spawn_with(&hub, aino(), tokens.clone(), scenario_config());
    session.login_active().await.unwrap();
    session.handle.join(ROOM).await.unwrap();

    hub.revoke(first.access_token());
    hub.drop_connections();

    session.wait_state(SupervisorState::Recovering).await.unwrap();
    session
        .wait_for("rejoin", |event| matches!(event, SessionEvent::RoomJoined { room_id: ROOM, rejoin: true }))
        .await
        .unwrap();
    session.wait_state(SupervisorState::Active).await.unwrap();

    assert_eq!(tokens.refresh_calls(), 1);
    assert_eq!(hub.invocation_count(JOIN_ROOM), 2);
    assert!(hub.members(ROOM).contains("aino"));

    let snapshot = session.handle.snapshot().await.unwrap();
    assert_eq!(snapshot.session.unwrap().credential, second);
    assert_eq!(snapshot.rooms.len(), 1);
    assert_eq!(snapshot.rooms[0].join_state, JoinState::Joined);

    // Session keeps working on the new credential
    let sent = session.handle.send(ROOM, "back again").await.unwrap();
    session
        .wait_messages(ROOM, "post-recovery send confirmed", |list| {
            list.iter().any(|m| m.local_id == sent.local_id && m.state == ConfirmationState::Confirmed)
        })
        .await
        .unwrap();
}

#[tokio::test(start_paused = true)]
async fn transient_drop_reconnects_without_refresh() {
    init_tracing();
    let hub = SimHub::new();
    let mut session = SessionProbe::spawn(&hub, aino());
    session.login_active().await.unwrap();
    session.handle.join(ROOM).await.unwrap();

    hub.drop_connections();
    session.wait_state(SupervisorState::Connecting).await.unwrap();
    session.wait_state(SupervisorState::Active).await.unwrap();

    assert_eq!(session.tokens.refresh_calls(), 0);
    assert_eq!(hub.invocation_count(JOIN_ROOM), 2);
    assert_eq!(hub.connection_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn send_resent_after_long_outage_shows_once() {
    init_tracing();
    let hub = SimHub::new();
    hub.ack_sends_with_null(true);
    let mut session = SessionProbe::spawn(&hub, aino());
    session.login_active().await.unwrap();
    session.handle.join(ROOM).await.unwrap();

    // The first attempt never gets an answer
    hub.stall_sends(true);
    let sent = session.handle.send(ROOM, "still here?").await.unwrap();
    eventually("send reaches the hub", || hub.invocation_count(SEND_MESSAGE) == 1).await.unwrap();

    hub.stall_sends(false);
    hub.set_offline(true);
    hub.drop_connections();
    session.wait_state(SupervisorState::Connecting).await.unwrap();
    tokio::time::sleep(std::time::Duration::from_secs(6)).await;
    hub.set_offline(false);
    session.wait_state(SupervisorState::Active).await.unwrap();

    let messages = session
        .wait_messages(ROOM, "resent message confirmed", |list| {
            list.iter().any(|m| m.local_id == sent.local_id && m.state == ConfirmationState::Confirmed)
        })
        .await
        .unwrap();

    assert_eq!(messages.len(), 1);
    assert_eq!(hub.invocation_count(SEND_MESSAGE), 2);
    assert_eq!(hub.history(ROOM).len(), 1);
}

#[tokio::test(start_paused = true)]
async fn presence_changes_refresh_room_members() {
    init_tracing();
    let hub = SimHub::new();
    let mut session = SessionProbe::spawn(&hub, aino());
    session.login_active().await.unwrap();
    session.handle.join(ROOM).await.unwrap();
    session
        .wait_for("initial details", |event| matches!(event, SessionEvent::RoomUpdated { room_id: ROOM }))
        .await
        .unwrap();

    let mut other = SessionProbe::spawn(&hub, leo());
    other.login_active().await.unwrap();
    other.handle.join(ROOM).await.unwrap();

    let mut members = Vec::new();
    for _ in 0..10 {
        session
            .wait_for("refreshed details", |event| matches!(event, SessionEvent::RoomUpdated { room_id: ROOM }))
            .await
            .unwrap();
        let details = session.handle.room_details(ROOM).await.unwrap().unwrap();
        members = details.members.iter().map(|m| m.username.clone()).collect();
        if members.contains(&"leo".to_string()) {
            break;
        }
    }
    assert!(members.contains(&"leo".to_string()));
    assert!(members.contains(&"aino".to_string()));
}

#[tokio::test(start_paused = true)]
async fn rapid_joins_share_one_invocation() {
    init_tracing();
    let hub = SimHub::new();
    let mut session = SessionProbe::spawn(&hub, aino());
    session.login_active().await.unwrap();

    hub.hold_joins(ROOM);
    let handle = &session.handle;
    let (first, second, ()) = tokio::join!(handle.join(ROOM), handle.join(ROOM), async {
        // Both joins are queued ahead of this snapshot
        handle.snapshot().await.unwrap();
        eventually("join reaches the hub", || hub.invocation_count(JOIN_ROOM) == 1).await.unwrap();
        hub.release_joins(ROOM);
    });

    assert_eq!(first.unwrap(), JoinStatus::Joined);
    assert_eq!(second.unwrap(), JoinStatus::Joined);
    assert_eq!(hub.invocation_count(JOIN_ROOM), 1);
}

#[tokio::test(start_paused = true)]
async fn rejected_join_is_reported_not_retried() {
    init_tracing();
    let hub = SimHub::new();
    let mut session = SessionProbe::spawn(&hub, aino());
    session.login_active().await.unwrap();

    hub.reject_joins(ROOM, "Chat room not found");
    let err = session.handle.join(ROOM).await.unwrap_err();

    assert!(matches!(&err, SessionError::Join { room_id: ROOM, reason } if reason == "Chat room not found"));
    assert_eq!(hub.invocation_count(JOIN_ROOM), 1);
    assert!(session.handle.messages(ROOM).await.unwrap().is_none());
}

#[tokio::test(start_paused = true)]
async fn leaving_mid_join_abandons_it() {
    init_tracing();
    let hub = SimHub::new();
    let mut session = SessionProbe::spawn(&hub, aino());
    session.login_active().await.unwrap();

    hub.hold_joins(ROOM);
    let handle = &session.handle;
    let (joined, ()) = tokio::join!(handle.join(ROOM), async {
        eventually("join reaches the hub", || hub.invocation_count(JOIN_ROOM) == 1).await.unwrap();
        handle.leave(ROOM).await.unwrap();
    });
    assert_eq!(joined.unwrap(), JoinStatus::Abandoned);

    // The late success is undone on the server
    hub.release_joins(ROOM);
    eventually("abandoned join is left", || hub.invocation_count(LEAVE_ROOM) == 1).await.unwrap();
    eventually("membership released", || hub.members(ROOM).is_empty()).await.unwrap();

    // A fresh join is allowed right away
    assert_eq!(session.handle.join(ROOM).await.unwrap(), JoinStatus::Joined);
}

#[tokio::test(start_paused = true)]
async fn history_is_loaded_once_and_deduplicated() {
    init_tracing();
    let hub = SimHub::new();
    for text in ["one", "two", "three"] {
        hub.post_as(&leo(), ROOM, text);
    }

    let mut session = SessionProbe::spawn(&hub, aino());
    session.login_active().await.unwrap();
    session.handle.join(ROOM).await.unwrap();

    let messages = session.wait_messages(ROOM, "history loaded", |list| list.len() == 3).await.unwrap();
    assert!(messages.iter().all(|m| m.state == ConfirmationState::Confirmed && m.sender_username == "leo"));

    let live = hub.post_as(&leo(), ROOM, "four");
    let sent = session.handle.send(ROOM, "hi leo").await.unwrap();
    let messages = session
        .wait_messages(ROOM, "live traffic merged", |list| {
            list.iter().any(|m| m.local_id == sent.local_id && m.server_id.is_some())
        })
        .await
        .unwrap();

    assert_eq!(messages.len(), 5);
    assert_eq!(messages.iter().filter(|m| m.server_id == Some(live.id)).count(), 1);

    let view = SessionView::capture(&session.handle, &[ROOM]).await.unwrap();
    InvariantRegistry::standard().assert_all(&view, "after history and live traffic");
}

#[tokio::test(start_paused = true)]
async fn echo_without_room_id_goes_to_the_only_open_room() {
    init_tracing();
    let hub = SimHub::new();
    hub.omit_room_id(true);
    let mut session = SessionProbe::spawn(&hub, aino());
    session.login_active().await.unwrap();
    session.handle.join(ROOM).await.unwrap();

    let sent = session.handle.send(ROOM, "routed").await.unwrap();
    session
        .wait_messages(ROOM, "echo routed", |list| {
            list.iter().any(|m| m.local_id == sent.local_id && m.state == ConfirmationState::Confirmed)
        })
        .await
        .unwrap();
}

#[tokio::test(start_paused = true)]
async fn handlers_replace_instead_of_stacking() {
    init_tracing();
    let hub = SimHub::new();
    let mut watcher = SessionProbe::spawn(&hub, aino());
    watcher.login_active().await.unwrap();
    watcher.handle.join(ROOM).await.unwrap();

    let stale = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&stale);
    watcher
        .handle
        .on("UserJoined", move |event| sink.lock().unwrap().push(event.clone()))
        .await
        .unwrap();
    let sink = Arc::clone(&seen);
    watcher
        .handle
        .on("UserJoined", move |event| sink.lock().unwrap().push(event.clone()))
        .await
        .unwrap();

    let mut visitor = SessionProbe::spawn(&hub, leo());
    visitor.login_active().await.unwrap();
    visitor.handle.join(ROOM).await.unwrap();

    watcher
        .wait_for("presence event", |event| matches!(event, SessionEvent::UserJoined { .. }))
        .await
        .unwrap();

    assert!(stale.lock().unwrap().is_empty());
    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 1);
    assert!(matches!(&seen[0], ServerEvent::UserJoined(user) if user.username == "leo"));
}

#[tokio::test(start_paused = true)]
async fn missing_token_without_refresh_logs_out() {
    init_tracing();
    let hub = SimHub::new();
    let mut session =
        SessionProbe::spawn_with(&hub, aino(), ScriptedTokenProvider::empty(), scenario_config());

    session.handle.login(None).await.unwrap();
    let event = session
        .wait_for("logout", |event| matches!(event, SessionEvent::LoggedOut { .. }))
        .await
        .unwrap();

    assert_eq!(event, SessionEvent::LoggedOut { reason: LogoutReason::AuthFailed });
    assert_eq!(session.tokens.refresh_calls(), 1);
    assert_eq!(hub.connection_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn login_reads_identity_from_the_token() {
    init_tracing();
    let hub = SimHub::new();
    let mut session = SessionProbe::spawn(&hub, aino());

    session.handle.login(None).await.unwrap();
    session.wait_state(SupervisorState::Active).await.unwrap();

    let snapshot = session.handle.snapshot().await.unwrap();
    assert_eq!(snapshot.session.unwrap().identity, aino());
}

#[tokio::test(start_paused = true)]
async fn logout_releases_rooms_and_closes_the_hub() {
    init_tracing();
    let hub = SimHub::new();
    let mut session = SessionProbe::spawn(&hub, aino());
    session.login_active().await.unwrap();
    session.handle.join(ROOM).await.unwrap();

    session.handle.logout().await.unwrap();
    session
        .wait_for("logout", |event| {
            matches!(event, SessionEvent::LoggedOut { reason: LogoutReason::UserRequested })
        })
        .await
        .unwrap();

    eventually("hub connection closed", || hub.connection_count() == 0).await.unwrap();
    let snapshot = session.handle.snapshot().await.unwrap();
    assert_eq!(snapshot.state, SupervisorState::LoggedOut);
    assert!(snapshot.rooms.is_empty());
    assert!(matches!(session.handle.send(ROOM, "late").await, Err(SessionError::NotReady { .. })));

    // The session can start again
    session.login_active().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn unreachable_hub_eventually_logs_out() {
    init_tracing();
    let hub = SimHub::new();
    hub.set_offline(true);
    let identity = aino();
    let tokens = ScriptedTokenProvider::storing(Credential::from_jwt(jwt_with_nonce(&identity, None, 0)));
    let config = scenario_config();
    // Every recovery refreshes successfully, so only the hub is at fault
    for nonce in 1..=config.max_recovery_attempts {
        tokens.push_refresh(Ok(Credential::from_jwt(jwt_with_nonce(&identity, None, nonce))));
    }
    let mut session = SessionProbe::spawn_with(&hub, identity, tokens, config);

    session.handle.login(None).await.unwrap();
    let event = session
        .wait_for("logout", |event| matches!(event, SessionEvent::LoggedOut { .. }))
        .await
        .unwrap();

    assert_eq!(event, SessionEvent::LoggedOut { reason: LogoutReason::Unreachable });
    assert_eq!(session.tokens.refresh_calls(), scenario_config().max_recovery_attempts as usize);
}
