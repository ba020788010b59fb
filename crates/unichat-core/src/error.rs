//! Error taxonomy for the session core.
//!
//! Errors are split by the layer that produces them: credential problems
//! ([`AuthError`]), transport failures reported by drivers
//! ([`TransportFailure`]), per-call hub failures ([`InvocationError`]) and the
//! umbrella [`SessionError`] returned to consumers.
//!
//! All errors are `Clone + PartialEq`: a single outcome (say, a failed join)
//! is delivered to every waiter that coalesced onto it.

use thiserror::Error;
use unichat_proto::{ProtocolError, RoomId};

use crate::{hub::ConnectionState, reconciler::LocalId, supervisor::SupervisorState};

/// Credential acquisition or refresh failed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    /// No credential is stored and none can be refreshed
    #[error("no credential available")]
    Missing,

    /// The token service refused the credential
    #[error("credential rejected: {0}")]
    Rejected(String),

    /// Token service could not be reached
    #[error("token service unavailable: {0}")]
    Unavailable(String),
}

impl AuthError {
    /// Returns true if retrying the same request may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

/// How a transport failed, as reported by the driver.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportFailure {
    /// Server refused the credential (HTTP 401 on upgrade)
    #[error("unauthorized")]
    Unauthorized,

    /// Any other network-level failure
    #[error("network error: {0}")]
    Network(String),
}

/// Failure of a single hub invocation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InvocationError {
    /// Server method returned an error
    #[error("server error: {0}")]
    Remote(String),

    /// Connection dropped after the retry budget for this call was spent
    #[error("connection lost before the call completed")]
    ConnectionLost,

    /// Hub is not connected and could not reconnect
    #[error("hub is not connected")]
    NotConnected,

    /// Connection was closed by the client
    #[error("call cancelled")]
    Cancelled,

    /// Arguments could not be encoded
    #[error("encoding failed: {0}")]
    Encoding(String),
}

impl InvocationError {
    /// Returns true if the failure came from the connection rather than the
    /// server's answer.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::ConnectionLost | Self::NotConnected)
    }
}

/// Misuse of the hub state machine by its driver.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HubError {
    /// Operation is not valid in the current state
    #[error("invalid hub operation: cannot {operation} while {state:?}")]
    InvalidState {
        /// State when the call was made
        state: ConnectionState,
        /// Operation attempted
        operation: &'static str,
    },

    /// Record could not be encoded
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

/// Errors surfaced to session consumers.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SessionError {
    /// Authentication failed
    #[error("authentication failed: {0}")]
    Auth(#[from] AuthError),

    /// Transient network failure
    #[error("network error: {0}")]
    Network(String),

    /// Server rejected a room join
    #[error("join rejected for room {room_id}: {reason}")]
    Join {
        /// Room that was rejected
        room_id: RoomId,
        /// Server-provided reason
        reason: String,
    },

    /// A hub call failed
    #[error("invocation failed: {0}")]
    Invocation(#[from] InvocationError),

    /// Session is not in a state that accepts the operation
    #[error("session not ready (state {state:?})")]
    NotReady {
        /// Supervisor state at the time of the call
        state: SupervisorState,
    },

    /// Hub is not connected
    #[error("hub is not connected")]
    NotConnected,

    /// Operation needs a joined room
    #[error("room {room_id} is not joined")]
    NotJoined {
        /// Room in question
        room_id: RoomId,
    },

    /// Message text is not sendable
    #[error("invalid message: {0}")]
    InvalidMessage(&'static str),

    /// No such message in the room's list
    #[error("no message {local_id} in room {room_id}")]
    UnknownMessage {
        /// Room searched
        room_id: RoomId,
        /// Missing local id
        local_id: LocalId,
    },

    /// Operation was cut short by logout or shutdown
    #[error("session closed")]
    SessionClosed,

    /// Hub protocol violation
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

impl SessionError {
    /// Returns true if the error is transient and may succeed on retry.
    ///
    /// Server rejections and protocol violations are never transient.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Network(_) | Self::NotConnected => true,
            Self::Auth(err) => err.is_transient(),
            Self::Invocation(err) => err.is_transient(),
            _ => false,
        }
    }
}

impl From<TransportFailure> for SessionError {
    fn from(failure: TransportFailure) -> Self {
        match failure {
            TransportFailure::Unauthorized => Self::Auth(AuthError::Rejected("unauthorized".into())),
            TransportFailure::Network(reason) => Self::Network(reason),
        }
    }
}

impl From<HubError> for SessionError {
    fn from(err: HubError) -> Self {
        match err {
            HubError::InvalidState { .. } => Self::NotConnected,
            HubError::Protocol(err) => Self::Protocol(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(SessionError::Network("reset".into()).is_transient());
        assert!(SessionError::Invocation(InvocationError::ConnectionLost).is_transient());
        assert!(SessionError::Auth(AuthError::Unavailable("503".into())).is_transient());

        assert!(!SessionError::Join { room_id: 1, reason: "nope".into() }.is_transient());
        assert!(!SessionError::Invocation(InvocationError::Remote("boom".into())).is_transient());
        assert!(!SessionError::Auth(AuthError::Rejected("expired".into())).is_transient());
    }

    #[test]
    fn unauthorized_transport_maps_to_auth_error() {
        let err: SessionError = TransportFailure::Unauthorized.into();
        assert!(matches!(err, SessionError::Auth(AuthError::Rejected(_))));
    }
}
