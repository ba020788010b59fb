//! Fuzz target for hub record splitting and decoding
//!
//! Arbitrary text is pushed through a `RecordReader` in caller-chosen chunks
//! and every completed record is decoded as a `HubMessage`.
//!
//! # Invariants
//!
//! - Decoding NEVER panics; malformed records return an error
//! - Records never contain the separator
//! - A decoded message re-encodes to a record of the same type

#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use unichat_proto::{HubMessage, RECORD_SEPARATOR, RecordReader};

#[derive(Debug, Arbitrary)]
struct Input {
    text: String,
    splits: Vec<u8>,
}

fuzz_target!(|input: Input| {
    let mut reader = RecordReader::new();
    let mut rest = input.text.as_str();
    let mut chunks = Vec::new();

    for split in &input.splits {
        let mut at = (*split as usize).min(rest.len());
        while !rest.is_char_boundary(at) {
            at += 1;
        }
        let (chunk, tail) = rest.split_at(at);
        chunks.push(chunk);
        rest = tail;
    }
    chunks.push(rest);

    for chunk in chunks {
        let Ok(records) = reader.push(chunk) else {
            assert_eq!(reader.pending_bytes(), 0);
            continue;
        };
        for record in records {
            assert!(!record.contains(RECORD_SEPARATOR));
            let Ok(message) = HubMessage::decode(&record) else {
                continue;
            };
            if let Ok(encoded) = message.encode() {
                let body = encoded.trim_end_matches(RECORD_SEPARATOR);
                let decoded = HubMessage::decode(body).map(|again| again.message_type());
                assert_eq!(decoded.ok(), Some(message.message_type()));
            }
        }
    }
});
