//! Adaptive concurrency limit using AIMD (Additive Increase Multiplicative Decrease)
//!
//! The ceiling grows by one slot per successful completion and halves when the
//! caller reports that a request was dropped (timeout, 429, 503, ...). This is
//! the TCP congestion-control shape applied to in-flight requests: slow
//! growth, fast backoff, and never fewer than one slot.
//!
//! Every operation is a compare-and-swap loop; nothing here blocks.

use crate::errors::{AdmissionError, ConfigError};
use std::sync::atomic::{AtomicUsize, Ordering};

/// In-flight ceiling that adapts to success and drop signals
///
/// Callers must report each granted permit exactly once, through either
/// [`on_success`](Self::on_success) or [`on_dropped`](Self::on_dropped).
///
/// # Example
///
/// ```rust
/// use admission_machines::AimdLimiter;
///
/// let limiter = AimdLimiter::new(2, 8).unwrap();
/// assert!(limiter.try_acquire());
/// assert!(limiter.try_acquire());
/// assert!(!limiter.try_acquire());
///
/// limiter.on_success();
/// assert_eq!(limiter.limit(), 3);
/// ```
#[derive(Debug)]
pub struct AimdLimiter {
    limit: AtomicUsize,
    in_flight: AtomicUsize,
    max_limit: usize,
}

impl AimdLimiter {
    /// Requires `1 <= initial <= max_limit`
    pub fn new(initial: usize, max_limit: usize) -> Result<Self, ConfigError> {
        ConfigError::require_range(
            "initial_concurrency",
            initial as f64,
            1.0,
            max_limit as f64,
        )?;

        Ok(Self {
            limit: AtomicUsize::new(initial),
            in_flight: AtomicUsize::new(0),
            max_limit,
        })
    }

    /// Take a slot if fewer than `limit` requests are in flight
    ///
    /// Retries only when another thread changed the counter, never because
    /// the limiter is full.
    pub fn try_acquire(&self) -> bool {
        let mut current = self.in_flight.load(Ordering::Acquire);

        loop {
            if current >= self.limit.load(Ordering::Acquire) {
                return false;
            }

            match self.in_flight.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// [`try_acquire`](Self::try_acquire) with the denial as an error
    pub fn acquire_or_reject(&self) -> Result<(), AdmissionError> {
        if self.try_acquire() {
            Ok(())
        } else {
            Err(AdmissionError::ConcurrencyLimited { limit: self.limit() })
        }
    }

    /// Report a completed request: frees its slot and grows the limit by one
    pub fn on_success(&self) {
        self.release_slot();
        let grown = self
            .limit
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |limit| {
                (limit < self.max_limit).then_some(limit + 1)
            });
        if let Ok(previous) = grown {
            tracing::trace!(limit = previous + 1, "concurrency limit increased");
        }
    }

    /// Report a dropped request: frees its slot and halves the limit (floor 1)
    pub fn on_dropped(&self) {
        self.release_slot();
        let shrunk = self
            .limit
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |limit| {
                let halved = (limit / 2).max(1);
                (halved != limit).then_some(halved)
            });
        if let Ok(previous) = shrunk {
            tracing::debug!(
                from = previous,
                to = (previous / 2).max(1),
                "concurrency limit decreased"
            );
        }
    }

    /// Current ceiling
    pub fn limit(&self) -> usize {
        self.limit.load(Ordering::Acquire)
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    pub fn max_limit(&self) -> usize {
        self.max_limit
    }

    fn release_slot(&self) {
        let _ = self
            .in_flight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_initial_limit_enforced() {
        let limiter = AimdLimiter::new(5, 10).unwrap();

        for _ in 0..5 {
            assert!(limiter.try_acquire());
        }
        assert!(!limiter.try_acquire(), "6th acquire should fail");
        assert_eq!(limiter.in_flight(), 5);
    }

    #[test]
    fn test_additive_increase() {
        let limiter = AimdLimiter::new(5, 10).unwrap();
        for _ in 0..5 {
            assert!(limiter.try_acquire());
        }

        limiter.on_success();
        assert_eq!(limiter.limit(), 6);
        assert_eq!(limiter.in_flight(), 4);

        // Two free slots now: the freed one and the new one
        assert!(limiter.try_acquire());
        assert!(limiter.try_acquire());
        assert!(!limiter.try_acquire());
    }

    #[test]
    fn test_increase_capped_at_max() {
        let limiter = AimdLimiter::new(9, 10).unwrap();
        for _ in 0..5 {
            assert!(limiter.try_acquire());
            limiter.on_success();
        }
        assert_eq!(limiter.limit(), 10);
    }

    #[test]
    fn test_multiplicative_decrease() {
        let limiter = AimdLimiter::new(10, 10).unwrap();
        assert!(limiter.try_acquire());

        limiter.on_dropped();
        assert_eq!(limiter.limit(), 5);
        assert_eq!(limiter.in_flight(), 0);
    }

    #[test]
    fn test_decrease_floors_at_one() {
        let limiter = AimdLimiter::new(8, 8).unwrap();
        for _ in 0..10 {
            limiter.on_dropped();
        }
        assert_eq!(limiter.limit(), 1);
        assert!(limiter.try_acquire());
    }

    #[test]
    fn test_rejects_invalid_bounds() {
        assert!(AimdLimiter::new(0, 10).is_err());
        assert!(AimdLimiter::new(11, 10).is_err());
        assert!(AimdLimiter::new(1, 1).is_ok());
    }

    #[test]
    fn test_acquire_or_reject() {
        let limiter = AimdLimiter::new(1, 4).unwrap();
        assert!(limiter.acquire_or_reject().is_ok());
        assert_eq!(
            limiter.acquire_or_reject(),
            Err(AdmissionError::ConcurrencyLimited { limit: 1 })
        );
    }

    #[test]
    fn test_concurrent_acquire_respects_limit() {
        let limiter = Arc::new(AimdLimiter::new(4, 4).unwrap());
        let mut handles = vec![];

        for _ in 0..16 {
            let limiter = Arc::clone(&limiter);
            handles.push(thread::spawn(move || limiter.try_acquire()));
        }

        let granted = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();
        assert_eq!(granted, 4);
        assert_eq!(limiter.in_flight(), 4);
    }
}
