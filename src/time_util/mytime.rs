use std::sync::{Mutex, PoisonError};
use std::time::Instant;

use chrono::{DateTime, Duration, Utc};

pub trait TimeProvider: Send + Sync {
    fn get_utc_time(&self) -> DateTime<Utc>;

    /// Time that never steps backwards, for measuring how long something has lasted.
    /// Wall clock corrections do not affect it.
    fn get_monotonic(&self) -> Instant;
}

#[derive(Default)]
pub struct RealTimeProvider {}

impl TimeProvider for RealTimeProvider {
    fn get_utc_time(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn get_monotonic(&self) -> Instant {
        Instant::now()
    }
}

/// A clock that only moves when told to. Shared between a test and the
/// drivers it exercises, so it mutates through `&self`.
#[derive(Debug)]
pub struct DummyTimeProvider {
    utc_time: Mutex<DateTime<Utc>>,
    monotonic: Mutex<Instant>,
}

impl DummyTimeProvider {
    pub fn new(utc_time: DateTime<Utc>) -> Self {
        Self {
            utc_time: Mutex::new(utc_time),
            monotonic: Mutex::new(Instant::now()),
        }
    }

    /// Step the wall clock, as an NTP correction would. The monotonic clock is untouched.
    pub fn set(&self, utc_time: DateTime<Utc>) {
        *self.utc_time.lock().unwrap_or_else(PoisonError::into_inner) = utc_time;
    }

    /// Let time pass: both clocks move forward by the given duration.
    pub fn advance(&self, duration: Duration) {
        *self.utc_time.lock().unwrap_or_else(PoisonError::into_inner) += duration;
        if let Ok(elapsed) = duration.to_std() {
            *self.monotonic.lock().unwrap_or_else(PoisonError::into_inner) += elapsed;
        }
    }
}

impl TimeProvider for DummyTimeProvider {
    fn get_utc_time(&self) -> DateTime<Utc> {
        *self.utc_time.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn get_monotonic(&self) -> Instant {
        *self.monotonic.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Whole milliseconds from `since` to `now`.
pub fn millis_since(since: Instant, now: Instant) -> u64 {
    now.saturating_duration_since(since).as_millis().min(u64::MAX as u128) as u64
}
