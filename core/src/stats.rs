//! Sliding-window success/failure statistics
//!
//! Events are appended in call order, so each sequence is time-ordered and
//! eviction only ever trims from the oldest end. Every read and write purges
//! expired timestamps first, so counts are always a live view of the window.

use crate::clock::Clock;
use crate::errors::ConfigError;
use crate::{Event, EventKind};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Default)]
struct Events {
    successes: VecDeque<f64>,
    failures: VecDeque<f64>,
}

impl Events {
    fn purge(&mut self, cutoff: f64) {
        for events in [&mut self.successes, &mut self.failures] {
            while events.front().is_some_and(|&ts| ts < cutoff) {
                events.pop_front();
            }
        }
    }
}

/// Trailing-window success and failure counter
#[derive(Debug)]
pub struct SlidingWindowStats {
    window_secs: f64,
    events: Mutex<Events>,
    clock: Arc<dyn Clock>,
}

impl SlidingWindowStats {
    /// Rejects a zero window
    pub fn new(window: Duration, clock: Arc<dyn Clock>) -> Result<Self, ConfigError> {
        ConfigError::require_positive("window", window.as_secs_f64())?;
        Ok(Self {
            window_secs: window.as_secs_f64(),
            events: Mutex::new(Events::default()),
            clock,
        })
    }

    pub fn record_success(&self) {
        self.record(EventKind::Success);
    }

    pub fn record_failure(&self) {
        self.record(EventKind::Failure);
    }

    /// Successes within the trailing window
    pub fn successes(&self) -> usize {
        self.locked_purged().successes.len()
    }

    /// Failures within the trailing window
    pub fn failures(&self) -> usize {
        self.locked_purged().failures.len()
    }

    /// Successes and failures from a single consistent snapshot
    pub fn counts(&self) -> (usize, usize) {
        let events = self.locked_purged();
        (events.successes.len(), events.failures.len())
    }

    /// Live events in the window, oldest first, merged across both kinds
    pub fn event_log(&self) -> Vec<Event> {
        let events = self.locked_purged();
        let mut log: Vec<Event> = events
            .successes
            .iter()
            .map(|&timestamp| Event {
                kind: EventKind::Success,
                timestamp,
            })
            .chain(events.failures.iter().map(|&timestamp| Event {
                kind: EventKind::Failure,
                timestamp,
            }))
            .collect();
        log.sort_by(|a, b| a.timestamp.total_cmp(&b.timestamp));
        log
    }

    /// Drop every recorded event
    pub fn clear(&self) {
        let mut events = self.events.lock();
        events.successes.clear();
        events.failures.clear();
    }

    pub fn window(&self) -> Duration {
        Duration::from_secs_f64(self.window_secs)
    }

    fn record(&self, kind: EventKind) {
        let now = self.clock.monotonic_time();
        let mut events = self.events.lock();
        events.purge(now - self.window_secs);

        match kind {
            EventKind::Success => events.successes.push_back(now),
            EventKind::Failure => events.failures.push_back(now),
        }
    }

    fn locked_purged(&self) -> parking_lot::MutexGuard<'_, Events> {
        let cutoff = self.clock.monotonic_time() - self.window_secs;
        let mut events = self.events.lock();
        events.purge(cutoff);
        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{ManualClock, SystemClock};

    fn stats(window_ms: u64) -> (SlidingWindowStats, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new());
        let stats = SlidingWindowStats::new(Duration::from_millis(window_ms), clock.clone()).unwrap();
        (stats, clock)
    }

    #[test]
    fn test_record_and_count() {
        let (stats, _clock) = stats(60_000);

        stats.record_success();
        stats.record_success();
        stats.record_failure();

        assert_eq!(stats.successes(), 2);
        assert_eq!(stats.failures(), 1);
        assert_eq!(stats.counts(), (2, 1));
    }

    #[test]
    fn test_events_expire_after_window() {
        let (stats, clock) = stats(1_000);

        stats.record_failure();
        clock.advance(Duration::from_millis(600));
        stats.record_failure();
        stats.record_success();
        assert_eq!(stats.failures(), 2);

        clock.advance(Duration::from_millis(500));
        assert_eq!(stats.failures(), 1, "first failure should have expired");
        assert_eq!(stats.successes(), 1);

        clock.advance(Duration::from_millis(600));
        assert_eq!(stats.counts(), (0, 0));
    }

    #[test]
    fn test_purge_is_monotonic() {
        let (stats, clock) = stats(100);

        stats.record_success();
        clock.advance(Duration::from_millis(200));
        assert_eq!(stats.successes(), 0);

        // A later read never re-admits an evicted timestamp
        stats.record_failure();
        assert_eq!(stats.successes(), 0);
        assert_eq!(stats.failures(), 1);
    }

    #[test]
    fn test_event_log_is_time_ordered() {
        let (stats, clock) = stats(60_000);

        stats.record_success();
        clock.advance(Duration::from_millis(10));
        stats.record_failure();
        clock.advance(Duration::from_millis(10));
        stats.record_success();

        let log = stats.event_log();
        assert_eq!(log.len(), 3);
        assert_eq!(log[0].kind, EventKind::Success);
        assert_eq!(log[1].kind, EventKind::Failure);
        assert_eq!(log[2].kind, EventKind::Success);
    }

    #[test]
    fn test_clear() {
        let (stats, _clock) = stats(60_000);

        stats.record_success();
        stats.record_failure();
        stats.clear();

        assert_eq!(stats.counts(), (0, 0));
    }

    #[test]
    fn test_rejects_zero_window() {
        assert!(SlidingWindowStats::new(Duration::ZERO, Arc::new(SystemClock::new())).is_err());
    }

    #[test]
    fn test_concurrent_recording() {
        let (stats, _clock) = stats(60_000);
        let stats = Arc::new(stats);
        let mut handles = vec![];

        for i in 0..4 {
            let stats = Arc::clone(&stats);
            handles.push(std::thread::spawn(move || {
                for _ in 0..250 {
                    if i % 2 == 0 {
                        stats.record_success();
                    } else {
                        stats.record_failure();
                    }
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(stats.counts(), (500, 500));
    }
}
