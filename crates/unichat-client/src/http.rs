//! REST collaborators over `reqwest`.
//!
//! - [`HttpChatroomApi`]: `GET {base}/api/chatroom/{id}` for room history
//! - [`HttpTokenProvider`]: reads a [`CredentialStore`] and refreshes through
//!   `POST {base}/auth/refresh`

use std::sync::Arc;

use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use unichat_core::{AuthError, Credential};
use unichat_proto::{RoomDetails, RoomId};

use crate::{
    api::{ApiError, ChatroomApi},
    auth::{CredentialStore, TokenProvider},
};

/// Chat room endpoints of the REST API.
#[derive(Debug, Clone)]
pub struct HttpChatroomApi {
    client: Client,
    base_url: String,
}

impl HttpChatroomApi {
    /// API rooted at `base_url`, e.g. `http://localhost:5222`.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(Client::new(), base_url)
    }

    /// API sharing an existing client.
    pub fn with_client(client: Client, base_url: impl Into<String>) -> Self {
        Self { client, base_url: trim_base(base_url.into()) }
    }
}

impl ChatroomApi for HttpChatroomApi {
    async fn fetch_room(&self, room_id: RoomId, credential: &Credential) -> Result<RoomDetails, ApiError> {
        let url = format!("{}/api/chatroom/{room_id}", self.base_url);
        let response = self
            .client
            .get(&url)
            .bearer_auth(credential.access_token())
            .send()
            .await
            .map_err(|err| ApiError::Network(err.to_string()))?;

        match response.status() {
            StatusCode::UNAUTHORIZED => return Err(ApiError::Unauthorized),
            status if !status.is_success() => return Err(ApiError::Status(status.as_u16())),
            _ => {},
        }

        let details: RoomDetails = response.json().await.map_err(|err| ApiError::Decode(err.to_string()))?;
        debug!(room_id, messages = details.messages.len(), "room fetched");
        Ok(details)
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RefreshRequest<'a> {
    refresh_token: &'a str,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RefreshResponse {
    access_token: String,
}

/// Token provider backed by a [`CredentialStore`] and the refresh endpoint.
///
/// A refused refresh clears the store so the next login starts clean.
#[derive(Debug)]
pub struct HttpTokenProvider<S> {
    client: Client,
    base_url: String,
    store: Arc<S>,
}

impl<S: CredentialStore> HttpTokenProvider<S> {
    /// Provider refreshing against `base_url`.
    pub fn new(base_url: impl Into<String>, store: Arc<S>) -> Self {
        Self { client: Client::new(), base_url: trim_base(base_url.into()), store }
    }

    /// Token store in use.
    pub fn store(&self) -> &Arc<S> {
        &self.store
    }
}

impl<S: CredentialStore> TokenProvider for HttpTokenProvider<S> {
    async fn get_token(&self) -> Result<Option<Credential>, AuthError> {
        let Some(token) = self.store.access_token() else {
            return Ok(None);
        };

        let credential = Credential::from_jwt(token);
        if let Err(err) = credential.claims() {
            // Unreadable tokens are treated as absent so a refresh is tried
            warn!(%err, "stored access token is not a valid JWT");
            return Ok(None);
        }
        Ok(Some(credential))
    }

    async fn refresh_token(&self) -> Result<Credential, AuthError> {
        let refresh_token = self.store.refresh_token().ok_or(AuthError::Missing)?;

        let url = format!("{}/auth/refresh", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(&RefreshRequest { refresh_token: &refresh_token })
            .send()
            .await
            .map_err(|err| AuthError::Unavailable(err.to_string()))?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            info!(status = status.as_u16(), "refresh token refused; clearing stored tokens");
            self.store.clear();
            return Err(AuthError::Rejected(format!("refresh refused with {}", status.as_u16())));
        }
        if status.is_server_error() {
            return Err(AuthError::Unavailable(format!("token service returned {}", status.as_u16())));
        }
        if !status.is_success() {
            self.store.clear();
            return Err(AuthError::Rejected(format!("refresh failed with {}", status.as_u16())));
        }

        let body: RefreshResponse = response.json().await.map_err(|err| AuthError::Rejected(err.to_string()))?;
        let credential = Credential::from_jwt(body.access_token.as_str());
        credential.claims()?;
        self.store.store_access_token(&body.access_token);
        debug!("access token refreshed");
        Ok(credential)
    }
}

fn trim_base(mut url: String) -> String {
    while url.ends_with('/') {
        url.pop();
    }
    url
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::auth::MemoryCredentialStore;

    #[test]
    fn trailing_slashes_are_trimmed() {
        assert_eq!(trim_base("http://h:5222//".into()), "http://h:5222");
        assert_eq!(trim_base("http://h".into()), "http://h");
    }

    #[test]
    fn refresh_body_is_camel_case() {
        let body = serde_json::to_string(&RefreshRequest { refresh_token: "r1" }).unwrap();
        assert_eq!(body, r#"{"refreshToken":"r1"}"#);

        let parsed: RefreshResponse = serde_json::from_str(r#"{"accessToken":"a2"}"#).unwrap();
        assert_eq!(parsed.access_token, "a2");
    }

    #[tokio::test]
    async fn refresh_without_refresh_token_is_missing() {
        let store = Arc::new(MemoryCredentialStore::new(None, None));
        let provider = HttpTokenProvider::new("http://127.0.0.1:9", store);
        assert_eq!(provider.refresh_token().await, Err(AuthError::Missing));
        assert_eq!(provider.get_token().await, Ok(None));
    }
}
