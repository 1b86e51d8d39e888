//! Wall-clock access and time-of-day delay computation.

use std::sync::Mutex;
use std::time::Duration;

use chrono::{Local, NaiveDateTime, NaiveTime};

/// Source of local wall-clock time.
pub trait Clock: Send + Sync {
    /// Current local date and time.
    fn now(&self) -> NaiveDateTime;
}

/// Clock backed by the system's local time zone.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> NaiveDateTime {
        Local::now().naive_local()
    }
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<NaiveDateTime>,
}

impl ManualClock {
    /// Create a clock frozen at `now`.
    pub fn new(now: NaiveDateTime) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    /// Jump to `now`.
    pub fn set(&self, now: NaiveDateTime) {
        *self.now.lock().unwrap_or_else(|e| e.into_inner()) = now;
    }

    /// Move forward by `by`.
    pub fn advance(&self, by: chrono::Duration) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> NaiveDateTime {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Delay from `now` until `at` on the same calendar day.
///
/// Returns zero when `now` is already at or past `at`, so a daily job
/// scheduled late in the day fires immediately instead of waiting for
/// tomorrow.
pub fn delay_until(now: NaiveDateTime, at: NaiveTime) -> Duration {
    let target = now.date().and_time(at);
    (target - now).to_std().unwrap_or(Duration::ZERO)
}
