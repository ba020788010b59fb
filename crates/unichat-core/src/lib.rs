//! UniChat session core.
//!
//! Pure state machines for the realtime chat session: the hub connection,
//! room membership, optimistic message reconciliation, and the supervisor
//! that ties them to authentication. Nothing here performs I/O. Every
//! operation takes the current time and returns actions for a runtime to
//! execute, so the whole session can be driven deterministically in tests.
//!
//! # Layers
//!
//! ```text
//! SessionSupervisor
//!   ├── HubConnection        (transport lifecycle, invocations, backoff)
//!   ├── RoomMembership       (JoinRoom / LeaveRoom, rejoin after reconnect)
//!   └── MessageReconciler    (one per open room)
//! ```
//!
//! Time comes from an [`Environment`]: production uses the system clock,
//! tests use `MockEnv` (feature `test-utils`).

#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod config;
pub mod credential;
pub mod env;
pub mod error;
pub mod handlers;
pub mod hub;
pub mod membership;
pub mod reconciler;
pub mod supervisor;

pub use config::{BackoffPolicy, ConfigError, HubConfig, ReconcileConfig, SessionConfig};
pub use credential::{Credential, Identity, TokenClaims};
pub use env::{Environment, MonotonicInstant};
pub use error::{AuthError, HubError, InvocationError, SessionError, TransportFailure};
pub use handlers::HandlerRegistry;
pub use hub::{ConnectionState, HubAction, HubConnection, HubNotice, InvocationId};
pub use membership::{JoinOutcome, JoinState, JoinStatus, MembershipAction, RoomHandle, RoomMembership};
pub use reconciler::{ConfirmationState, EchoOutcome, LocalId, Message, MessageKey, MessageReconciler, ReconcileError};
pub use supervisor::{
    LogoutReason, Session, SessionAction, SessionEvent, SessionSupervisor, SupervisorState,
};
