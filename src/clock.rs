//! Monotonic time source for the event loop.
//!
//! The loop never reads `Instant::now` directly; it goes through a `Clock`
//! so timers and idle detection can be driven deterministically in tests.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Monotonic clock used by the event loop, timers, and idle detection.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

/// The default clock, backed by `Instant::now`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// A hand-advanced clock for tests.
///
/// Clones share the same underlying time; `advance` moves every observer
/// forward.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<Instant>>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            now: Arc::new(Mutex::new(Instant::now())),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap();
        *now += by;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        *self.now.lock().unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock_advances_shared_view() {
        let clock = ManualClock::new();
        let observer = clock.clone();
        let start = clock.now();

        clock.advance(Duration::from_secs(5));

        assert_eq!(observer.now() - start, Duration::from_secs(5));
    }
}
