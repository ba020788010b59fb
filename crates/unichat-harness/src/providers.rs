//! Scripted collaborators for the session runtime.

use std::{
    collections::VecDeque,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::{DateTime, Utc};
use serde_json::json;
use unichat_client::{ApiError, ChatroomApi, TokenProvider};
use unichat_core::{
    AuthError, Credential, Identity,
    credential::{NAME_CLAIM, NAME_IDENTIFIER_CLAIM},
};
use unichat_proto::{RoomDetails, RoomId};

use crate::sim_hub::SimHub;

/// Unsigned JWT carrying `identity` and an optional expiry.
///
/// `nonce` makes tokens for the same user distinct, so one can be revoked
/// while a refreshed one is accepted.
pub fn jwt_with_nonce(identity: &Identity, expires_at: Option<DateTime<Utc>>, nonce: u32) -> String {
    let mut payload = json!({
        NAME_IDENTIFIER_CLAIM: identity.user_id.to_string(),
        NAME_CLAIM: identity.username,
        "jti": nonce,
    });
    if let Some(expires_at) = expires_at {
        payload["exp"] = json!(expires_at.timestamp());
    }
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"none","typ":"JWT"}"#);
    let body = URL_SAFE_NO_PAD.encode(payload.to_string());
    format!("{header}.{body}.sim")
}

/// Unsigned JWT carrying `identity`.
pub fn jwt_for(identity: &Identity, expires_at: Option<DateTime<Utc>>) -> String {
    jwt_with_nonce(identity, expires_at, 0)
}

#[derive(Debug, Default)]
struct Script {
    stored: Option<Credential>,
    reads: VecDeque<Result<Option<Credential>, AuthError>>,
    refreshes: VecDeque<Result<Credential, AuthError>>,
    read_calls: usize,
    refresh_calls: usize,
}

/// Token provider answering from a script.
///
/// `get_token` returns queued read results first, then the stored
/// credential. `refresh_token` returns queued refresh results (storing
/// successes) and `AuthError::Missing` once the queue is empty. Clones share
/// the script.
#[derive(Debug, Clone, Default)]
pub struct ScriptedTokenProvider {
    script: Arc<Mutex<Script>>,
}

impl ScriptedTokenProvider {
    /// Provider with `credential` stored.
    pub fn storing(credential: Credential) -> Self {
        let provider = Self::default();
        provider.lock().stored = Some(credential);
        provider
    }

    /// Provider with nothing stored.
    pub fn empty() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Script> {
        self.script.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue a result for the next `get_token`.
    pub fn push_read(&self, result: Result<Option<Credential>, AuthError>) {
        self.lock().reads.push_back(result);
    }

    /// Queue a result for the next `refresh_token`.
    pub fn push_refresh(&self, result: Result<Credential, AuthError>) {
        self.lock().refreshes.push_back(result);
    }

    /// Credential currently stored.
    pub fn stored(&self) -> Option<Credential> {
        self.lock().stored.clone()
    }

    /// Number of `get_token` calls so far.
    pub fn read_calls(&self) -> usize {
        self.lock().read_calls
    }

    /// Number of `refresh_token` calls so far.
    pub fn refresh_calls(&self) -> usize {
        self.lock().refresh_calls
    }
}

impl TokenProvider for ScriptedTokenProvider {
    async fn get_token(&self) -> Result<Option<Credential>, AuthError> {
        let mut script = self.lock();
        script.read_calls += 1;
        match script.reads.pop_front() {
            Some(result) => result,
            None => Ok(script.stored.clone()),
        }
    }

    async fn refresh_token(&self) -> Result<Credential, AuthError> {
        let mut script = self.lock();
        script.refresh_calls += 1;
        let result = script.refreshes.pop_front().unwrap_or(Err(AuthError::Missing));
        match &result {
            Ok(credential) => script.stored = Some(credential.clone()),
            Err(AuthError::Rejected(_)) => script.stored = None,
            Err(_) => {},
        }
        result
    }
}

/// REST API answering from a [`SimHub`]'s room state.
#[derive(Debug, Clone)]
pub struct SimChatroomApi {
    hub: SimHub,
}

impl SimChatroomApi {
    /// API backed by `hub`.
    pub fn new(hub: SimHub) -> Self {
        Self { hub }
    }
}

impl ChatroomApi for SimChatroomApi {
    async fn fetch_room(&self, room_id: RoomId, credential: &Credential) -> Result<RoomDetails, ApiError> {
        if !self.hub.accepts(credential) {
            return Err(ApiError::Unauthorized);
        }
        Ok(self.hub.room_details(room_id))
    }
}
