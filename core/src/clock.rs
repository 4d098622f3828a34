//! Monotonic time sources
//!
//! Every primitive reads time through a [`Clock`] so tests can drive
//! refills, window rollovers and open-state timers without sleeping.

use parking_lot::Mutex;
use std::time::{Duration, Instant};

/// Monotonic time source, in seconds relative to an arbitrary anchor
pub trait Clock: Send + Sync + std::fmt::Debug {
    /// Current monotonic time in seconds. Never decreases.
    fn monotonic_time(&self) -> f64;
}

/// Wall-clock backed by [`Instant`] (immune to NTP adjustments)
#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
    start_time: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn monotonic_time(&self) -> f64 {
        self.start_time.elapsed().as_secs_f64()
    }
}

/// Manually advanced clock for deterministic tests
///
/// # Example
///
/// ```rust
/// use admission_machines::{Clock, ManualClock};
/// use std::time::Duration;
///
/// let clock = ManualClock::new();
/// clock.advance(Duration::from_millis(250));
/// assert_eq!(clock.monotonic_time(), 0.25);
/// ```
#[derive(Debug, Default)]
pub struct ManualClock {
    now: Mutex<f64>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Move time forward
    pub fn advance(&self, by: Duration) {
        *self.now.lock() += by.as_secs_f64();
    }

    /// Jump to an absolute time. Ignored if it would move time backwards.
    pub fn set(&self, seconds: f64) {
        let mut now = self.now.lock();
        if seconds > *now {
            *now = seconds;
        }
    }
}

impl Clock for ManualClock {
    fn monotonic_time(&self) -> f64 {
        *self.now.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_clock_is_monotonic() {
        let clock = SystemClock::new();

        let time1 = clock.monotonic_time();
        std::thread::sleep(Duration::from_millis(10));
        let time2 = clock.monotonic_time();

        assert!(time2 > time1);
    }

    #[test]
    fn test_manual_clock_advance() {
        let clock = ManualClock::new();
        assert_eq!(clock.monotonic_time(), 0.0);

        clock.advance(Duration::from_millis(500));
        clock.advance(Duration::from_millis(500));
        assert!((clock.monotonic_time() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_manual_clock_never_goes_backwards() {
        let clock = ManualClock::new();
        clock.set(5.0);
        clock.set(2.0);

        assert_eq!(clock.monotonic_time(), 5.0);
    }
}
