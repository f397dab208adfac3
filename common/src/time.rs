//! Time utilities and constants for EscrowSettle.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;

/// Protocol timing constants.
pub mod constants {
    use super::Duration;

    /// Window the client has to accept or dispute finished work (48 hours).
    pub fn client_confirmation_window() -> Duration {
        Duration::hours(48)
    }

    /// Default auto-release sweep interval for the long-running worker.
    pub fn auto_release_interval() -> Duration {
        Duration::minutes(5)
    }
}

/// Batch limits for the auto-release sweep.
pub mod limits {
    /// Default number of bookings settled per sweep.
    pub const DEFAULT_AUTO_RELEASE_BATCH: usize = 50;

    /// Hard upper bound on a single sweep.
    pub const MAX_AUTO_RELEASE_BATCH: usize = 100;
}

/// A timestamp with timezone (always UTC).
pub type Timestamp = DateTime<Utc>;

/// Source of "now" for every deadline comparison.
pub trait Clock: Send + Sync {
    fn now(&self) -> Timestamp;
}

/// Wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        Utc::now()
    }
}

/// Manually driven clock for deterministic deadline tests.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<RwLock<Timestamp>>,
}

impl ManualClock {
    /// Create a clock frozen at `start`.
    pub fn new(start: Timestamp) -> Self {
        Self {
            now: Arc::new(RwLock::new(start)),
        }
    }

    /// Move the clock forward.
    pub fn advance(&self, by: Duration) {
        let mut now = self.now.write();
        *now += by;
    }

    /// Jump to an absolute instant.
    pub fn set(&self, to: Timestamp) {
        *self.now.write() = to;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        *self.now.read()
    }
}

/// Check whether `deadline` has been reached at `now`. The deadline instant
/// itself counts as reached.
pub fn deadline_reached(deadline: Timestamp, now: Timestamp) -> bool {
    deadline <= now
}

/// Duration extensions for convenient construction.
pub trait DurationExt {
    fn as_std(&self) -> std::time::Duration;
}

impl DurationExt for Duration {
    fn as_std(&self) -> std::time::Duration {
        self.to_std().unwrap_or(std::time::Duration::ZERO)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deadline_boundary() {
        let now = Utc::now();
        assert!(deadline_reached(now, now));
        assert!(deadline_reached(now - Duration::seconds(1), now));
        assert!(!deadline_reached(now + Duration::seconds(1), now));
    }

    #[test]
    fn test_manual_clock() {
        let start = Utc::now();
        let clock = ManualClock::new(start);
        assert_eq!(clock.now(), start);

        clock.advance(Duration::hours(48));
        assert_eq!(clock.now(), start + constants::client_confirmation_window());

        let shared = clock.clone();
        shared.set(start);
        assert_eq!(clock.now(), start);
    }

    #[test]
    fn test_negative_duration_as_std() {
        assert_eq!(Duration::seconds(-5).as_std(), std::time::Duration::ZERO);
        assert_eq!(
            Duration::seconds(3).as_std(),
            std::time::Duration::from_secs(3)
        );
    }
}
