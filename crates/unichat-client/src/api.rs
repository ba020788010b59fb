//! REST collaborator used to load room history.

use std::future::Future;

use thiserror::Error;
use unichat_core::Credential;
use unichat_proto::{RoomDetails, RoomId};

/// REST call failure.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ApiError {
    /// Credential refused
    #[error("unauthorized")]
    Unauthorized,

    /// Non-success HTTP status
    #[error("unexpected status {0}")]
    Status(u16),

    /// Request did not complete
    #[error("network error: {0}")]
    Network(String),

    /// Response body did not parse
    #[error("invalid response: {0}")]
    Decode(String),
}

/// Chat room REST endpoints.
pub trait ChatroomApi: Send + Sync + 'static {
    /// Room details including members and message history.
    fn fetch_room(
        &self,
        room_id: RoomId,
        credential: &Credential,
    ) -> impl Future<Output = Result<RoomDetails, ApiError>> + Send;
}

/// API for sessions that never load history.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoHistory;

impl ChatroomApi for NoHistory {
    async fn fetch_room(&self, _room_id: RoomId, _credential: &Credential) -> Result<RoomDetails, ApiError> {
        Ok(RoomDetails { name: String::new(), description: None, members: Vec::new(), messages: Vec::new() })
    }
}
