//! Failure accrual policies
//!
//! A [`FailureAccrualPolicy`] decides when a circuit should trip. The circuit
//! breaker only calls the trait methods and never inspects a policy's counters,
//! so any implementation can be injected.

use crate::clock::Clock;
use crate::errors::ConfigError;
use crate::stats::SlidingWindowStats;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// Pluggable trip decision consumed by [`crate::CircuitBreaker`]
///
/// Methods take `&self`; implementations keep their own interior mutability
/// so the breaker can share one policy across threads.
///
/// # Examples
///
/// ```rust
/// use admission_machines::FailureAccrualPolicy;
/// use std::sync::atomic::{AtomicBool, Ordering};
///
/// /// Trips on the first failure, recovers on the first success
/// #[derive(Debug, Default)]
/// struct OneStrike(AtomicBool);
///
/// impl FailureAccrualPolicy for OneStrike {
///     fn record_success(&self) -> bool {
///         self.0.store(false, Ordering::SeqCst);
///         false
///     }
///     fn record_failure(&self) -> bool {
///         self.0.store(true, Ordering::SeqCst);
///         true
///     }
///     fn is_tripped(&self) -> bool {
///         self.0.load(Ordering::SeqCst)
///     }
///     fn reset(&self) {
///         self.0.store(false, Ordering::SeqCst);
///     }
/// }
/// ```
pub trait FailureAccrualPolicy: Send + Sync + std::fmt::Debug {
    /// Record a success. Returns whether the policy is tripped afterwards.
    fn record_success(&self) -> bool;

    /// Record a failure. Returns whether the policy is tripped afterwards.
    fn record_failure(&self) -> bool;

    fn is_tripped(&self) -> bool;

    /// Clear all accrued state
    fn reset(&self);
}

/// Trips after `threshold` failures in a row; any success clears the streak
#[derive(Debug)]
pub struct ConsecutiveFailures {
    threshold: usize,
    consecutive: AtomicUsize,
}

impl ConsecutiveFailures {
    pub fn new(threshold: usize) -> Result<Self, ConfigError> {
        ConfigError::require_positive("failure_threshold", threshold as f64)?;
        Ok(Self {
            threshold,
            consecutive: AtomicUsize::new(0),
        })
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }

    /// Current failure streak
    pub fn consecutive_failures(&self) -> usize {
        self.consecutive.load(Ordering::Acquire)
    }
}

impl Default for ConsecutiveFailures {
    /// Five failures in a row
    fn default() -> Self {
        Self {
            threshold: 5,
            consecutive: AtomicUsize::new(0),
        }
    }
}

impl FailureAccrualPolicy for ConsecutiveFailures {
    fn record_success(&self) -> bool {
        self.consecutive.store(0, Ordering::Release);
        false
    }

    fn record_failure(&self) -> bool {
        let count = self.consecutive.fetch_add(1, Ordering::AcqRel) + 1;
        count >= self.threshold
    }

    fn is_tripped(&self) -> bool {
        self.consecutive.load(Ordering::Acquire) >= self.threshold
    }

    fn reset(&self) {
        self.consecutive.store(0, Ordering::Release);
    }
}

/// Trips on an absolute failure count and/or a failure rate over a trailing window
///
/// The rate is only evaluated once at least `minimum_calls` outcomes are in
/// the window, so a handful of early failures cannot trip the circuit.
#[derive(Debug)]
pub struct FailureRateWindow {
    failure_threshold: Option<usize>,
    failure_rate_threshold: Option<f64>,
    minimum_calls: usize,
    stats: SlidingWindowStats,
}

impl FailureRateWindow {
    /// Create a policy over `window`
    ///
    /// At least one of `failure_threshold` and `failure_rate_threshold` must
    /// be set; the rate must lie within `[0, 1]`.
    pub fn new(
        window: Duration,
        failure_threshold: Option<usize>,
        failure_rate_threshold: Option<f64>,
        minimum_calls: usize,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ConfigError> {
        match (failure_threshold, failure_rate_threshold) {
            (None, None) => {
                return Err(ConfigError::NotPositive {
                    field: "failure_threshold",
                    value: 0.0,
                });
            }
            (Some(threshold), _) => {
                ConfigError::require_positive("failure_threshold", threshold as f64)?
            }
            _ => {}
        }
        if let Some(rate) = failure_rate_threshold {
            ConfigError::require_range("failure_rate_threshold", rate, 0.0, 1.0)?;
        }

        Ok(Self {
            failure_threshold,
            failure_rate_threshold,
            minimum_calls,
            stats: SlidingWindowStats::new(window, clock)?,
        })
    }

    /// Underlying window statistics
    pub fn stats(&self) -> &SlidingWindowStats {
        &self.stats
    }

    fn evaluate(&self) -> bool {
        let (successes, failures) = self.stats.counts();

        if let Some(threshold) = self.failure_threshold {
            if failures >= threshold {
                return true;
            }
        }

        if let Some(rate_threshold) = self.failure_rate_threshold {
            let total = failures + successes;
            if total > 0 && total >= self.minimum_calls {
                let failure_rate = failures as f64 / total as f64;
                if failure_rate >= rate_threshold {
                    return true;
                }
            }
        }

        false
    }
}

impl FailureAccrualPolicy for FailureRateWindow {
    fn record_success(&self) -> bool {
        self.stats.record_success();
        self.evaluate()
    }

    fn record_failure(&self) -> bool {
        self.stats.record_failure();
        self.evaluate()
    }

    fn is_tripped(&self) -> bool {
        self.evaluate()
    }

    fn reset(&self) {
        self.stats.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    #[test]
    fn test_consecutive_failures_trips_at_threshold() {
        let policy = ConsecutiveFailures::new(3).unwrap();

        assert!(!policy.record_failure());
        assert!(!policy.record_failure());
        assert!(policy.record_failure());
        assert!(policy.is_tripped());
    }

    #[test]
    fn test_success_breaks_streak() {
        let policy = ConsecutiveFailures::new(2).unwrap();

        policy.record_failure();
        policy.record_success();
        assert!(!policy.record_failure());
        assert_eq!(policy.consecutive_failures(), 1);
    }

    #[test]
    fn test_consecutive_reset() {
        let policy = ConsecutiveFailures::new(1).unwrap();
        policy.record_failure();
        assert!(policy.is_tripped());

        policy.reset();
        assert!(!policy.is_tripped());
        assert_eq!(policy.consecutive_failures(), 0);
    }

    #[test]
    fn test_consecutive_rejects_zero_threshold() {
        assert!(ConsecutiveFailures::new(0).is_err());
    }

    #[test]
    fn test_rate_based_threshold() {
        let clock = Arc::new(ManualClock::new());
        let policy =
            FailureRateWindow::new(Duration::from_secs(60), None, Some(0.5), 10, clock).unwrap();

        // First 9 calls - below minimum, never tripped
        for i in 0..9 {
            let tripped = if i % 2 == 0 {
                policy.record_success()
            } else {
                policy.record_failure()
            };
            assert!(!tripped, "tripped before minimum calls");
        }

        // 10th call: 5 failures out of 10 = 50%
        assert!(policy.record_failure());
    }

    #[test]
    fn test_absolute_threshold_in_window() {
        let clock = Arc::new(ManualClock::new());
        let policy =
            FailureRateWindow::new(Duration::from_secs(10), Some(3), None, 0, clock.clone())
                .unwrap();

        policy.record_failure();
        policy.record_failure();
        clock.advance(Duration::from_secs(11));

        // Earlier failures aged out of the window
        assert!(!policy.record_failure());
        assert!(!policy.record_failure());
        assert!(policy.record_failure());
    }

    #[test]
    fn test_minimum_calls_prevents_premature_trip() {
        let clock = Arc::new(ManualClock::new());
        let policy =
            FailureRateWindow::new(Duration::from_secs(60), None, Some(0.5), 20, clock).unwrap();

        for _ in 0..10 {
            assert!(!policy.record_failure());
        }
    }

    #[test]
    fn test_rate_window_rejects_invalid_config() {
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new());
        let window = Duration::from_secs(1);

        assert!(FailureRateWindow::new(window, None, None, 0, clock.clone()).is_err());
        assert!(FailureRateWindow::new(window, Some(0), None, 0, clock.clone()).is_err());
        assert!(FailureRateWindow::new(window, None, Some(1.5), 0, clock.clone()).is_err());
        assert!(FailureRateWindow::new(Duration::ZERO, Some(1), None, 0, clock).is_err());
    }
}
