//! Session configuration.
//!
//! Every timing and retry threshold the state machines use lives here with a
//! documented default. Configs deserialize from camelCase JSON with
//! durations in milliseconds; missing fields take their defaults.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Hub endpoint used when none is configured.
pub const DEFAULT_HUB_URL: &str = "ws://localhost:5222/hub";

/// REST base URL used when none is configured.
pub const DEFAULT_API_BASE_URL: &str = "http://localhost:5222";

/// How long after an optimistic send (or its resend) a matching echo may
/// still promote it, unless the send was already acknowledged.
pub const DEFAULT_RECONCILIATION_WINDOW: Duration = Duration::from_secs(5);

/// Largest timestamp gap at which a history entry confirms a Pending one
/// without a server id match.
pub const DEFAULT_DEDUPE_GRANULARITY: Duration = Duration::from_secs(60);

/// Idle time after which the client sends a Ping.
pub const DEFAULT_KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(15);

/// Silence from the server after which the connection is considered lost.
pub const DEFAULT_SERVER_TIMEOUT: Duration = Duration::from_secs(30);

/// Time allowed for transport open plus protocol handshake.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(15);

/// First reconnect delay.
pub const DEFAULT_BACKOFF_INITIAL: Duration = Duration::from_secs(1);

/// Upper bound on any reconnect delay.
pub const DEFAULT_BACKOFF_MAX: Duration = Duration::from_secs(30);

/// Reconnect attempts before the connection is declared closed.
pub const DEFAULT_BACKOFF_ATTEMPTS: u32 = 6;

/// Extra join attempts after a transient failure.
pub const DEFAULT_JOIN_RETRY_LIMIT: u32 = 2;

/// Extra send attempts after a transient failure.
pub const DEFAULT_SEND_RETRY_LIMIT: u32 = 1;

/// Extra token requests after the token service was unreachable.
pub const DEFAULT_TOKEN_RETRY_LIMIT: u32 = 2;

/// Delay before retrying an unreachable token service.
pub const DEFAULT_TOKEN_RETRY_DELAY: Duration = Duration::from_secs(2);

/// Consecutive unrecoverable closes tolerated before forcing logout.
pub const DEFAULT_MAX_RECOVERY_ATTEMPTS: u32 = 3;

/// Runtime tick driving timers.
pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_millis(250);

/// Invalid configuration.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// Config text could not be parsed
    #[error("invalid config: {0}")]
    Parse(String),

    /// A value violates a constraint
    #[error("invalid {field}: {reason}")]
    Invalid {
        /// Offending field
        field: &'static str,
        /// Constraint that failed
        reason: &'static str,
    },
}

/// Exponential reconnect backoff.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct BackoffPolicy {
    /// Delay before the first attempt
    #[serde(with = "millis")]
    pub initial_delay: Duration,
    /// Cap applied to every delay
    #[serde(with = "millis")]
    pub max_delay: Duration,
    /// Growth factor between attempts
    pub multiplier: u32,
    /// Attempts before giving up
    pub max_attempts: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial_delay: DEFAULT_BACKOFF_INITIAL,
            max_delay: DEFAULT_BACKOFF_MAX,
            multiplier: 2,
            max_attempts: DEFAULT_BACKOFF_ATTEMPTS,
        }
    }
}

impl BackoffPolicy {
    /// Delay before `attempt` (1-based). `None` once attempts are exhausted.
    ///
    /// With defaults: 1s, 2s, 4s, 8s, 16s, 30s.
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        if attempt == 0 || attempt > self.max_attempts {
            return None;
        }
        let factor = self.multiplier.saturating_pow(attempt - 1);
        Some(self.initial_delay.saturating_mul(factor).min(self.max_delay))
    }
}

/// Hub connection settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct HubConfig {
    /// WebSocket endpoint of the hub
    pub url: String,
    /// Idle time before sending a Ping (should be < `server_timeout` / 2)
    #[serde(with = "millis")]
    pub keep_alive_interval: Duration,
    /// Silence tolerated from the server
    #[serde(with = "millis")]
    pub server_timeout: Duration,
    /// Time allowed for open + handshake
    #[serde(with = "millis")]
    pub handshake_timeout: Duration,
    /// Reconnect schedule
    pub backoff: BackoffPolicy,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_HUB_URL.to_string(),
            keep_alive_interval: DEFAULT_KEEP_ALIVE_INTERVAL,
            server_timeout: DEFAULT_SERVER_TIMEOUT,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            backoff: BackoffPolicy::default(),
        }
    }
}

/// Message reconciliation thresholds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ReconcileConfig {
    /// Echo matching window for optimistic messages
    #[serde(with = "millis")]
    pub window: Duration,
    /// Largest timestamp gap for history deduplication
    #[serde(with = "millis")]
    pub dedupe_granularity: Duration,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self { window: DEFAULT_RECONCILIATION_WINDOW, dedupe_granularity: DEFAULT_DEDUPE_GRANULARITY }
    }
}

/// Top-level configuration for one session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SessionConfig {
    /// Hub connection
    pub hub: HubConfig,
    /// REST base URL for history and token refresh
    pub api_base_url: String,
    /// Reconciliation thresholds
    pub reconcile: ReconcileConfig,
    /// Extra join attempts after transient failures
    pub join_retry_limit: u32,
    /// Extra send attempts after transient failures
    pub send_retry_limit: u32,
    /// Extra token requests while the token service is unreachable
    pub token_retry_limit: u32,
    /// Delay between token retries
    #[serde(with = "millis")]
    pub token_retry_delay: Duration,
    /// Consecutive unrecoverable closes before forced logout
    pub max_recovery_attempts: u32,
    /// Runtime timer resolution
    #[serde(with = "millis")]
    pub tick_interval: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            hub: HubConfig::default(),
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
            reconcile: ReconcileConfig::default(),
            join_retry_limit: DEFAULT_JOIN_RETRY_LIMIT,
            send_retry_limit: DEFAULT_SEND_RETRY_LIMIT,
            token_retry_limit: DEFAULT_TOKEN_RETRY_LIMIT,
            token_retry_delay: DEFAULT_TOKEN_RETRY_DELAY,
            max_recovery_attempts: DEFAULT_MAX_RECOVERY_ATTEMPTS,
            tick_interval: DEFAULT_TICK_INTERVAL,
        }
    }
}

impl SessionConfig {
    /// Parse from JSON and validate.
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_json::from_str(text).map_err(|err| ConfigError::Parse(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.hub.url.is_empty() {
            return Err(ConfigError::Invalid { field: "hub.url", reason: "must not be empty" });
        }
        if self.hub.keep_alive_interval >= self.hub.server_timeout {
            return Err(ConfigError::Invalid {
                field: "hub.keepAliveInterval",
                reason: "must be shorter than hub.serverTimeout",
            });
        }
        if self.hub.backoff.multiplier == 0 {
            return Err(ConfigError::Invalid {
                field: "hub.backoff.multiplier",
                reason: "must be at least 1",
            });
        }
        if self.hub.backoff.max_attempts == 0 {
            return Err(ConfigError::Invalid {
                field: "hub.backoff.maxAttempts",
                reason: "must be at least 1",
            });
        }
        if self.reconcile.window.is_zero() {
            return Err(ConfigError::Invalid { field: "reconcile.window", reason: "must be positive" });
        }
        if self.reconcile.dedupe_granularity.as_secs() == 0 {
            return Err(ConfigError::Invalid {
                field: "reconcile.dedupeGranularity",
                reason: "must be at least one second",
            });
        }
        if self.tick_interval.is_zero() {
            return Err(ConfigError::Invalid { field: "tickInterval", reason: "must be positive" });
        }
        Ok(())
    }
}

/// `Duration` as integer milliseconds.
mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
