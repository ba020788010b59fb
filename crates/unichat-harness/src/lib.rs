//! Deterministic test harness for UniChat sessions.
//!
//! An in-memory hub ([`SimHub`]) speaks the real record protocol over
//! [`HubLink`](unichat_client::HubLink)s, so tests drive the production
//! session actor end to end. Time comes from tokio's paused clock.
//!
//! # Invariant Testing
//!
//! The `invariants` module checks properties of message lists that must hold
//! after every step (unique server ids, newest-first order). Use
//! [`InvariantRegistry::standard()`] for all of them.

#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod invariants;
pub mod providers;
pub mod scenario;
pub mod sim_hub;

pub use invariants::{
    ConfirmedCarryServerId, Invariant, InvariantRegistry, InvariantResult, NewestFirst, RoomView, SessionView,
    UniqueLocalIds, UniqueServerIds, Violation,
};
pub use providers::{ScriptedTokenProvider, SimChatroomApi, jwt_for, jwt_with_nonce};
pub use scenario::{SCENARIO_TIMEOUT, ScenarioError, SessionProbe, eventually, scenario_config};
pub use sim_hub::{ConnectionId, RecordedInvocation, SimConnector, SimHub};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Install a test subscriber honouring `RUST_LOG` (default `warn`).
///
/// Safe to call from every test; only the first call installs.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    // Fails if another test already installed one
    let _ = tracing_subscriber::registry().with(fmt::layer().with_test_writer()).with(filter).try_init();
}
