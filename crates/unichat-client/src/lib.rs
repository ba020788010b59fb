//! UniChat session runtime.
//!
//! Drives the Sans-IO [`SessionSupervisor`](unichat_core::SessionSupervisor)
//! on tokio. The runtime is an actor: [`SessionHandle`] posts commands to a
//! single task that owns all session state, executes the supervisor's actions
//! and publishes [`SessionEvent`](unichat_core::SessionEvent)s.
//!
//! Collaborators are injected:
//!
//! - [`TokenProvider`]: credential supply and refresh
//! - [`HubConnector`]: opens hub transports
//! - [`ChatroomApi`]: room history over REST
//!
//! Production implementations live behind features: `transport` provides
//! the WebSocket connector, `http` the REST API and refreshing token
//! provider.

#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod api;
pub mod auth;
pub mod connector;
pub mod env;
#[cfg(feature = "http")]
pub mod http;
mod runtime;
pub mod session;
#[cfg(feature = "transport")]
pub mod transport;

pub use api::{ApiError, ChatroomApi, NoHistory};
pub use auth::{CredentialStore, MemoryCredentialStore, StaticTokenProvider, TokenProvider};
pub use connector::{HubConnector, HubLink, hub_url};
pub use env::SystemEnv;
#[cfg(feature = "http")]
pub use http::{HttpChatroomApi, HttpTokenProvider};
pub use session::{EventHandler, SessionHandle, SessionSnapshot};
#[cfg(feature = "transport")]
pub use transport::{TransportError, WebSocketConnector};
