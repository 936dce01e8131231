//! Monotonic + wall clock and ID generation (spec §2 "Clock / IDs / Paths").
//!
//! `closedAt` must be monotonic-anchored UTC wall time: two artifacts sealed back to
//! back never compare equal or out of order, even if the wall clock is adjusted
//! between them. We pair a `chrono::Utc::now()` sample with a monotonic `Instant` at
//! process start and nudge the wall sample forward if it would go backwards relative
//! to the last one handed out.

use chrono::{DateTime, Utc};
use std::sync::Mutex;
use std::time::Instant;
use uuid::Uuid;

pub struct Clock {
    started_at: Instant,
    started_wall: DateTime<Utc>,
    last_issued: Mutex<DateTime<Utc>>,
}

impl Clock {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            started_wall: Utc::now(),
            last_issued: Mutex::new(Utc::now()),
        }
    }

    /// A UTC timestamp guaranteed to be >= any previously returned by this instance,
    /// anchored off the monotonic clock so an NTP step backwards cannot un-order
    /// artifact `closedAt` values.
    pub fn now(&self) -> DateTime<Utc> {
        let elapsed = self.started_at.elapsed();
        let anchored = self.started_wall + chrono::Duration::from_std(elapsed).unwrap_or_default();
        let wall = Utc::now();
        let candidate = if wall > anchored { wall } else { anchored };

        let mut last = self.last_issued.lock().expect("clock mutex poisoned");
        let out = if candidate > *last {
            candidate
        } else {
            // Strictly monotonic even at sub-millisecond call rates.
            *last + chrono::Duration::nanoseconds(1)
        };
        *last = out;
        out
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

pub fn new_reference_id() -> Uuid {
    Uuid::new_v4()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn now_is_monotonic_across_rapid_calls() {
        let clock = Clock::new();
        let mut last = clock.now();
        for _ in 0..1000 {
            let next = clock.now();
            assert!(next > last);
            last = next;
        }
    }
}
