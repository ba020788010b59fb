//! Environment abstraction for deterministic testing.
//!
//! State machines in this crate never read the clock themselves: callers pass
//! `now` into every method. The [`Environment`] trait is how drivers obtain
//! those values, so production code uses the system clock while tests and
//! the simulation harness control time explicitly.

use std::{
    fmt::Debug,
    ops::{Add, Sub},
    time::Duration,
};

use chrono::{DateTime, Utc};

/// Monotonic instant usable by the state machines.
///
/// Implemented for any type with instant-like arithmetic, which covers
/// `std::time::Instant`, `tokio::time::Instant` and test clocks.
pub trait MonotonicInstant:
    Copy + Ord + Send + Sync + Debug + Sub<Output = Duration> + Add<Duration, Output = Self> + 'static
{
}

impl<T> MonotonicInstant for T where
    T: Copy
        + Ord
        + Send
        + Sync
        + Debug
        + Sub<Output = Duration>
        + Add<Duration, Output = T>
        + 'static
{
}

/// Abstract environment providing monotonic and wall-clock time.
///
/// # Invariants
///
/// - `now()` never goes backwards within one environment.
/// - `wall_clock()` is only used for display timestamps (optimistic message
///   `sentAt`); ordering and timeouts always use `now()`.
pub trait Environment: Clone + Send + Sync + 'static {
    /// Instant type used by this environment.
    type Instant: MonotonicInstant;

    /// Current monotonic time.
    fn now(&self) -> Self::Instant;

    /// Current wall-clock time.
    fn wall_clock(&self) -> DateTime<Utc>;
}

/// Manually driven environment for tests.
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils {
    use std::{
        sync::{Arc, Mutex, PoisonError},
        time::{Duration, Instant},
    };

    use chrono::{DateTime, TimeZone, Utc};

    use super::Environment;

    #[derive(Debug)]
    struct Clock {
        now: Instant,
        wall: DateTime<Utc>,
    }

    /// Environment whose clocks only move when [`MockEnv::advance`] is called.
    ///
    /// Clones share the same clock.
    #[derive(Debug, Clone)]
    pub struct MockEnv {
        clock: Arc<Mutex<Clock>>,
    }

    impl Default for MockEnv {
        fn default() -> Self {
            Self::new()
        }
    }

    impl MockEnv {
        /// Wall clock starting at 2024-05-01T10:00:00Z.
        pub fn new() -> Self {
            let wall = Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).single().unwrap_or_default();
            Self::starting_at(wall)
        }

        /// Wall clock starting at `wall`.
        pub fn starting_at(wall: DateTime<Utc>) -> Self {
            Self { clock: Arc::new(Mutex::new(Clock { now: Instant::now(), wall })) }
        }

        /// Move both clocks forward.
        pub fn advance(&self, duration: Duration) {
            let mut clock = self.clock.lock().unwrap_or_else(PoisonError::into_inner);
            clock.now += duration;
            clock.wall += chrono::Duration::from_std(duration).unwrap_or_default();
        }
    }

    impl Environment for MockEnv {
        type Instant = Instant;

        fn now(&self) -> Instant {
            self.clock.lock().unwrap_or_else(PoisonError::into_inner).now
        }

        fn wall_clock(&self) -> DateTime<Utc> {
            self.clock.lock().unwrap_or_else(PoisonError::into_inner).wall
        }
    }
}
