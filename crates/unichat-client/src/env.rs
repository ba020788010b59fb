//! Production environment backed by tokio's clock.

use chrono::{DateTime, Utc};
use tokio::time::Instant;
use unichat_core::Environment;

/// System clocks.
///
/// Uses `tokio::time::Instant`, so a paused tokio runtime (`start_paused`)
/// controls session time in tests.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemEnv;

impl Environment for SystemEnv {
    type Instant = Instant;

    fn now(&self) -> Instant {
        Instant::now()
    }

    fn wall_clock(&self) -> DateTime<Utc> {
        Utc::now()
    }
}
