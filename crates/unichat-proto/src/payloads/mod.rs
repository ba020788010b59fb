//! Typed payloads carried inside hub invocations and REST responses.
//!
//! The hub passes payloads as JSON invocation arguments with camelCase field
//! names. Decoding is lenient where the server is known to vary (missing
//! `sender`, timestamps without an offset) and strict everywhere else.

pub mod chat;
pub mod timestamp;
