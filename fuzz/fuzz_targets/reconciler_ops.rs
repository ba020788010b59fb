//! Fuzz target for MessageReconciler operation sequences
//!
//! Interleaves optimistic sends, echoes, acknowledgements, failures,
//! resends, dismissals and history loads in arbitrary order and timing.
//!
//! # Strategy
//!
//! - Own echoes: server copies of our sends, possibly late or duplicated
//! - Foreign echoes: other authors posting the same text
//! - Acks: with and without the stored message, for any local id
//! - History: batches overlapping what is already in the list
//!
//! # Invariants
//!
//! - Server ids are unique in the list
//! - Local ids are unique in the list
//! - The list is ordered newest-first by `sent_at`
//! - Confirmed entries carry a server id; others do not
//! - Operations on unknown or settled ids return errors, never panic

#![no_main]

use std::{
    collections::HashSet,
    time::{Duration, Instant},
};

use arbitrary::Arbitrary;
use chrono::{DateTime, TimeZone, Utc};
use libfuzzer_sys::fuzz_target;
use unichat_core::{ConfirmationState, Identity, LocalId, MessageReconciler, ReconcileConfig};
use unichat_proto::{SenderInfo, ServerMessage};

const AUTHOR: u64 = 7;
const TEXTS: [&str; 3] = ["hi", "hello", "hi again"];

#[derive(Debug, Clone, Arbitrary)]
enum Op {
    Send { text: u8, wall_offset: u16 },
    Echo { server_id: u8, foreign: bool, text: u8, wall_offset: u16 },
    Ack { local_id: u8, stored: Option<u8> },
    Fail { local_id: u8 },
    Resend { local_id: u8 },
    Dismiss { local_id: u8 },
    History { server_ids: Vec<u8> },
    Advance { millis: u16 },
}

fn wall(offset: u16) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(1_700_000_000_000 + i64::from(offset) * 250).single().unwrap_or_default()
}

fn server_message(server_id: u8, sender_id: u64, text: u8, wall_offset: u16) -> ServerMessage {
    ServerMessage {
        id: u64::from(server_id),
        message_text: TEXTS[text as usize % TEXTS.len()].to_string(),
        sender_id,
        sender: Some(SenderInfo { username: format!("user{sender_id}") }),
        sent_at: wall(wall_offset),
        chat_room_id: Some(5),
    }
}

fuzz_target!(|ops: Vec<Op>| {
    let mut reconciler = MessageReconciler::new(Identity::new(AUTHOR, "aino"), ReconcileConfig::default());
    let mut now = Instant::now();

    for op in ops {
        match op {
            Op::Send { text, wall_offset } => {
                reconciler.send_optimistic(TEXTS[text as usize % TEXTS.len()], now, wall(wall_offset));
            },
            Op::Echo { server_id, foreign, text, wall_offset } => {
                let sender = if foreign { AUTHOR + 1 } else { AUTHOR };
                reconciler.on_server_echo(server_message(server_id, sender, text, wall_offset), now);
            },
            Op::Ack { local_id, stored } => {
                let local_id = LocalId::new(u64::from(local_id));
                let stored = stored.map(|server_id| {
                    let text = reconciler.get(local_id).map_or(0, |message| {
                        TEXTS.iter().position(|candidate| *candidate == message.text).unwrap_or(0) as u8
                    });
                    server_message(server_id, AUTHOR, text, u16::from(server_id))
                });
                let _ = reconciler.on_send_ack(local_id, stored);
            },
            Op::Fail { local_id } => {
                let _ = reconciler.on_send_failure(LocalId::new(u64::from(local_id)));
            },
            Op::Resend { local_id } => {
                let _ = reconciler.resend(LocalId::new(u64::from(local_id)), now, wall(u16::from(local_id)));
            },
            Op::Dismiss { local_id } => {
                let _ = reconciler.dismiss(LocalId::new(u64::from(local_id)));
            },
            Op::History { server_ids } => {
                let history: Vec<ServerMessage> = server_ids
                    .iter()
                    .map(|id| server_message(*id, AUTHOR + u64::from(id % 2), *id, u16::from(*id)))
                    .collect();
                let first = reconciler.load_history(&history, |message| format!("user{}", message.sender_id));
                let again = reconciler.load_history(&history, |message| format!("user{}", message.sender_id));
                assert_eq!(again, 0, "reloading history changed the list (first load {first})");
            },
            Op::Advance { millis } => now += Duration::from_millis(u64::from(millis)),
        }

        let messages = reconciler.snapshot();
        let mut server_ids = HashSet::new();
        let mut local_ids = HashSet::new();
        for message in &messages {
            if let Some(id) = message.server_id {
                assert!(server_ids.insert(id), "duplicate server id {id}");
            }
            assert!(local_ids.insert(message.local_id), "duplicate local id {}", message.local_id);
            assert_eq!(message.state == ConfirmationState::Confirmed, message.server_id.is_some());
        }
        for pair in messages.windows(2) {
            assert!(pair[0].sent_at >= pair[1].sent_at, "list out of order");
        }
    }
});
