//! Bearer credentials and the identity they carry.
//!
//! Access tokens are JWTs issued by the chat backend. The client never
//! verifies signatures (the server does); it only reads the payload to learn
//! who it is and when the token expires.

use std::fmt;

use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::{DateTime, Utc};
use serde_json::Value;
use unichat_proto::UserId;

use crate::error::AuthError;

/// Claim holding the numeric user id.
pub const NAME_IDENTIFIER_CLAIM: &str =
    "http://schemas.xmlsoap.org/ws/2005/05/identity/claims/nameidentifier";

/// Claim holding the username.
pub const NAME_CLAIM: &str = "http://schemas.xmlsoap.org/ws/2005/05/identity/claims/name";

/// Who the session belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Identity {
    /// User id, as used in `senderId`
    pub user_id: UserId,
    /// Display name stamped on optimistic messages
    pub username: String,
}

impl Identity {
    /// Create an identity.
    pub fn new(user_id: UserId, username: impl Into<String>) -> Self {
        Self { user_id, username: username.into() }
    }

    /// Read the identity out of a token's claims.
    ///
    /// Falls back to `sub` / `unique_name` when the long-form claims are
    /// absent.
    pub fn from_credential(credential: &Credential) -> Result<Self, AuthError> {
        let claims = credential.claims()?;
        let user_id = claims.user_id.ok_or_else(|| {
            AuthError::Rejected("token carries no user id claim".to_string())
        })?;
        Ok(Self { user_id, username: claims.username.unwrap_or_default() })
    }
}

/// Decoded subset of a token payload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TokenClaims {
    /// `nameidentifier` or `sub`
    pub user_id: Option<UserId>,
    /// `name` or `unique_name`
    pub username: Option<String>,
    /// `exp`
    pub expires_at: Option<DateTime<Utc>>,
}

/// Bearer access token.
///
/// `Debug` output redacts the token.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    access_token: String,
    expires_at: Option<DateTime<Utc>>,
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("access_token", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

impl Credential {
    /// Wrap a token without inspecting it.
    pub fn new(access_token: impl Into<String>) -> Self {
        Self { access_token: access_token.into(), expires_at: None }
    }

    /// Wrap a JWT, reading its expiry when the payload is decodable.
    pub fn from_jwt(access_token: impl Into<String>) -> Self {
        let mut credential = Self::new(access_token);
        credential.expires_at = credential.claims().ok().and_then(|claims| claims.expires_at);
        credential
    }

    /// Set an explicit expiry.
    #[must_use]
    pub fn with_expiry(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    /// Raw token for `Authorization: Bearer` or `access_token=`.
    pub fn access_token(&self) -> &str {
        &self.access_token
    }

    /// Known expiry, if any.
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.expires_at
    }

    /// True if the token has a known expiry at or before `wall`.
    pub fn is_expired(&self, wall: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expiry| expiry <= wall)
    }

    /// Decode the JWT payload.
    pub fn claims(&self) -> Result<TokenClaims, AuthError> {
        let payload = self
            .access_token
            .split('.')
            .nth(1)
            .ok_or_else(|| AuthError::Rejected("token is not a JWT".to_string()))?;
        let bytes = URL_SAFE_NO_PAD
            .decode(payload.trim_end_matches('='))
            .map_err(|err| AuthError::Rejected(format!("token payload is not base64url: {err}")))?;
        let json: Value = serde_json::from_slice(&bytes)
            .map_err(|err| AuthError::Rejected(format!("token payload is not JSON: {err}")))?;

        let user_id = claim(&json, NAME_IDENTIFIER_CLAIM).or_else(|| claim(&json, "sub")).and_then(as_id);
        let username = claim(&json, NAME_CLAIM)
            .or_else(|| claim(&json, "unique_name"))
            .and_then(Value::as_str)
            .map(str::to_string);
        let expires_at = claim(&json, "exp")
            .and_then(Value::as_i64)
            .and_then(|secs| DateTime::from_timestamp(secs, 0));

        Ok(TokenClaims { user_id, username, expires_at })
    }
}

fn claim<'a>(json: &'a Value, name: &str) -> Option<&'a Value> {
    json.get(name)
}

fn as_id(value: &Value) -> Option<UserId> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use chrono::TimeZone;
    use serde_json::json;

    use super::*;

    fn jwt(payload: &Value) -> String {
        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
        let body = URL_SAFE_NO_PAD.encode(payload.to_string());
        format!("{header}.{body}.signature")
    }

    #[test]
    fn reads_dotnet_claims() {
        let token = jwt(&json!({
            NAME_IDENTIFIER_CLAIM: "7",
            NAME_CLAIM: "aino",
            "exp": 1_714_560_000
        }));
        let credential = Credential::from_jwt(token);

        let identity = Identity::from_credential(&credential).unwrap();
        assert_eq!(identity, Identity::new(7, "aino"));
        assert_eq!(
            credential.expires_at(),
            Some(Utc.with_ymd_and_hms(2024, 5, 1, 10, 40, 0).unwrap())
        );
    }

    #[test]
    fn falls_back_to_sub() {
        let credential = Credential::new(jwt(&json!({"sub": 12, "unique_name": "leo"})));
        let identity = Identity::from_credential(&credential).unwrap();
        assert_eq!(identity, Identity::new(12, "leo"));
    }

    #[test]
    fn opaque_tokens_have_no_claims() {
        let credential = Credential::from_jwt("opaque-token");
        assert!(credential.expires_at().is_none());
        assert!(matches!(credential.claims(), Err(AuthError::Rejected(_))));
    }

    #[test]
    fn expiry_check_uses_wall_clock() {
        let expiry = Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap();
        let credential = Credential::new("t").with_expiry(expiry);
        assert!(!credential.is_expired(expiry - chrono::Duration::seconds(1)));
        assert!(credential.is_expired(expiry));
    }

    #[test]
    fn debug_redacts_token() {
        let rendered = format!("{:?}", Credential::new("super-secret"));
        assert!(!rendered.contains("super-secret"));
    }
}
