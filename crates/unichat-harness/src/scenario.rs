//! Scenario helpers: a session wired to a [`SimHub`] plus event waiting.
//!
//! Run scenarios under `#[tokio::test(start_paused = true)]`: the runtime's
//! timers (backoff, keep-alive, token retry) then advance instantly and
//! deterministically whenever every task is idle.

use std::time::Duration;

use thiserror::Error;
use tokio::sync::broadcast::{self, error::RecvError};
use unichat_client::SessionHandle;
use unichat_core::{
    BackoffPolicy, Credential, Identity, Message, SessionConfig, SessionError, SessionEvent, SupervisorState,
};
use unichat_proto::RoomId;

use crate::{
    providers::{ScriptedTokenProvider, SimChatroomApi, jwt_with_nonce},
    sim_hub::SimHub,
};

/// How long a scenario waits for an event before failing.
pub const SCENARIO_TIMEOUT: Duration = Duration::from_secs(300);

/// Why a scenario step failed.
#[derive(Debug, Error)]
pub enum ScenarioError {
    /// Nothing matching arrived in time
    #[error("timed out waiting for {0}")]
    Timeout(String),

    /// Session actor stopped
    #[error("session event stream closed while waiting for {0}")]
    Closed(String),

    /// A session call failed
    #[error("session call failed: {0}")]
    Session(#[from] SessionError),
}

/// Configuration with fast, bounded retries for scenarios.
pub fn scenario_config() -> SessionConfig {
    let mut config = SessionConfig::default();
    config.hub.url = "sim://hub".to_string();
    config.hub.backoff = BackoffPolicy {
        initial_delay: Duration::from_millis(500),
        max_delay: Duration::from_secs(4),
        multiplier: 2,
        max_attempts: 4,
    };
    config
}

/// Session under test plus its event stream.
pub struct SessionProbe {
    /// User the session logs in as
    pub identity: Identity,
    /// Handle to the session actor
    pub handle: SessionHandle,
    /// Token provider script
    pub tokens: ScriptedTokenProvider,
    events: broadcast::Receiver<SessionEvent>,
}

impl SessionProbe {
    /// Spawn a session for `identity` against `hub` with a stored token.
    pub fn spawn(hub: &SimHub, identity: Identity) -> Self {
        let credential = Credential::from_jwt(jwt_with_nonce(&identity, None, 0));
        Self::spawn_with(hub, identity, ScriptedTokenProvider::storing(credential), scenario_config())
    }

    /// Spawn with an explicit token script and configuration.
    pub fn spawn_with(
        hub: &SimHub,
        identity: Identity,
        tokens: ScriptedTokenProvider,
        config: SessionConfig,
    ) -> Self {
        let handle = SessionHandle::spawn(config, tokens.clone(), hub.connector(), SimChatroomApi::new(hub.clone()));
        let events = handle.subscribe();
        Self { identity, handle, tokens, events }
    }

    /// Log in and wait for Active.
    pub async fn login_active(&mut self) -> Result<(), ScenarioError> {
        self.handle.login(Some(self.identity.clone())).await?;
        self.wait_state(SupervisorState::Active).await
    }

    /// Wait until the supervisor enters `state`.
    pub async fn wait_state(&mut self, state: SupervisorState) -> Result<(), ScenarioError> {
        self.wait_for(&format!("state {state:?}"), |event| {
            matches!(event, SessionEvent::StateChanged { to, .. } if *to == state)
        })
        .await
        .map(|_| ())
    }

    /// Wait for the first event matching `predicate`; earlier events are
    /// consumed.
    pub async fn wait_for(
        &mut self,
        what: &str,
        mut predicate: impl FnMut(&SessionEvent) -> bool,
    ) -> Result<SessionEvent, ScenarioError> {
        let search = async {
            loop {
                match self.events.recv().await {
                    Ok(event) if predicate(&event) => return Ok(event),
                    Ok(_) | Err(RecvError::Lagged(_)) => {},
                    Err(RecvError::Closed) => return Err(ScenarioError::Closed(what.to_string())),
                }
            }
        };

        tokio::time::timeout(SCENARIO_TIMEOUT, search)
            .await
            .map_err(|_| ScenarioError::Timeout(what.to_string()))?
    }

    /// Poll the room's message list until `predicate` holds.
    pub async fn wait_messages(
        &self,
        room_id: RoomId,
        what: &str,
        mut predicate: impl FnMut(&[Message]) -> bool,
    ) -> Result<Vec<Message>, ScenarioError> {
        let poll = async {
            loop {
                let messages = self.handle.messages(room_id).await?.unwrap_or_default();
                if predicate(&messages) {
                    return Ok(messages);
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        };

        tokio::time::timeout(SCENARIO_TIMEOUT, poll)
            .await
            .map_err(|_| ScenarioError::Timeout(what.to_string()))?
    }

    /// Drain events already delivered, returning them.
    pub fn drain(&mut self) -> Vec<SessionEvent> {
        let mut drained = Vec::new();
        loop {
            match self.events.try_recv() {
                Ok(event) => drained.push(event),
                Err(broadcast::error::TryRecvError::Lagged(_)) => {},
                Err(_) => return drained,
            }
        }
    }
}

/// Poll `condition` until it holds, sleeping between checks.
pub async fn eventually(what: &str, mut condition: impl FnMut() -> bool) -> Result<(), ScenarioError> {
    let poll = async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    };
    tokio::time::timeout(SCENARIO_TIMEOUT, poll).await.map_err(|_| ScenarioError::Timeout(what.to_string()))
}
