//! Time source injected into the service so evaluation does not read the wall clock ad hoc.
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};

/// UTC instant used throughout the crate.
pub type Timestamp = DateTime<Utc>;

/// Source of the current time for schedule gating and cache staleness.
pub trait Clock: Send + Sync {
    /// Current time.
    fn now(&self) -> Timestamp;
}

/// The default clock, backed by [`Utc::now`].
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        Utc::now()
    }
}

/// A clock that only moves when told to. Useful in tests and replays.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<Timestamp>,
}

impl ManualClock {
    /// Create a clock frozen at `now`.
    pub fn new(now: Timestamp) -> ManualClock {
        ManualClock {
            now: Mutex::new(now),
        }
    }

    /// Move the clock to `now`.
    pub fn set(&self, now: Timestamp) {
        if let Ok(mut slot) = self.now.lock() {
            *slot = now;
        }
    }

    /// Move the clock forward by `by`.
    pub fn advance(&self, by: Duration) {
        if let Ok(mut slot) = self.now.lock() {
            *slot += by;
        }
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        match self.now.lock() {
            Ok(now) => *now,
            // A writer can only panic between lock and assignment of a Copy value, so the
            // stored time is still valid.
            Err(poisoned) => *poisoned.into_inner(),
        }
    }
}
