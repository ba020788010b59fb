//! Credential supply.
//!
//! The session asks a [`TokenProvider`] for a credential when logging in and
//! for a fresh one whenever the hub rejects the current one. Credentials are
//! never read from ambient storage: the provider is injected.

use std::{
    future::Future,
    sync::{Mutex, PoisonError},
};

use unichat_core::{AuthError, Credential};

/// Supplies and refreshes bearer credentials.
///
/// Implementations must be cheap to share: the runtime calls them from
/// spawned tasks.
pub trait TokenProvider: Send + Sync + 'static {
    /// Stored credential, or `None` if nothing is stored.
    fn get_token(&self) -> impl Future<Output = Result<Option<Credential>, AuthError>> + Send;

    /// Exchange the stored refresh token for a new credential.
    ///
    /// # Errors
    ///
    /// - `AuthError::Missing` if there is nothing to refresh with
    /// - `AuthError::Rejected` if the token service refused
    /// - `AuthError::Unavailable` if the token service could not be reached
    fn refresh_token(&self) -> impl Future<Output = Result<Credential, AuthError>> + Send;
}

/// Provider with a fixed credential and no refresh.
#[derive(Debug, Clone)]
pub struct StaticTokenProvider {
    credential: Option<Credential>,
}

impl StaticTokenProvider {
    /// Always returns `credential`.
    pub fn new(credential: Credential) -> Self {
        Self { credential: Some(credential) }
    }

    /// Provider with nothing stored.
    pub fn empty() -> Self {
        Self { credential: None }
    }
}

impl TokenProvider for StaticTokenProvider {
    async fn get_token(&self) -> Result<Option<Credential>, AuthError> {
        Ok(self.credential.clone())
    }

    async fn refresh_token(&self) -> Result<Credential, AuthError> {
        Err(AuthError::Missing)
    }
}

/// Persistent token storage used by refreshing providers.
pub trait CredentialStore: Send + Sync + 'static {
    /// Stored access token.
    fn access_token(&self) -> Option<String>;

    /// Stored refresh token.
    fn refresh_token(&self) -> Option<String>;

    /// Replace the access token.
    fn store_access_token(&self, token: &str);

    /// Forget both tokens.
    fn clear(&self);
}

#[derive(Debug, Default)]
struct Tokens {
    access: Option<String>,
    refresh: Option<String>,
}

/// In-memory [`CredentialStore`].
#[derive(Debug, Default)]
pub struct MemoryCredentialStore {
    tokens: Mutex<Tokens>,
}

impl MemoryCredentialStore {
    /// Store holding the given tokens.
    pub fn new(access: Option<String>, refresh: Option<String>) -> Self {
        Self { tokens: Mutex::new(Tokens { access, refresh }) }
    }
}

impl CredentialStore for MemoryCredentialStore {
    fn access_token(&self) -> Option<String> {
        self.tokens.lock().unwrap_or_else(PoisonError::into_inner).access.clone()
    }

    fn refresh_token(&self) -> Option<String> {
        self.tokens.lock().unwrap_or_else(PoisonError::into_inner).refresh.clone()
    }

    fn store_access_token(&self, token: &str) {
        self.tokens.lock().unwrap_or_else(PoisonError::into_inner).access = Some(token.to_string());
    }

    fn clear(&self) {
        *self.tokens.lock().unwrap_or_else(PoisonError::into_inner) = Tokens::default();
    }
}
