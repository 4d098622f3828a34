//! Continuously refilling token bucket
//!
//! The arithmetic core shared by [`crate::rate_limit::TokenBucketRateLimiter`]
//! and [`crate::rate_limit::TokenBucketRetryBudget`]. Refill is lazy: tokens
//! are accrued on access from the elapsed time, never by a background timer.

use crate::clock::Clock;
use crate::errors::ConfigError;
use parking_lot::Mutex;
use std::sync::Arc;

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: f64,
}

/// Fixed-capacity bucket refilled at `refill_per_sec` tokens per second
#[derive(Debug)]
pub struct TokenBucket {
    capacity: f64,
    refill_per_sec: f64,
    state: Mutex<BucketState>,
    clock: Arc<dyn Clock>,
}

impl TokenBucket {
    /// Create a full bucket
    ///
    /// Rejects `capacity <= 0` and `refill_per_sec < 0`. A zero refill rate
    /// gives a one-shot allowance of `capacity` tokens.
    pub fn new(
        capacity: f64,
        refill_per_sec: f64,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ConfigError> {
        Self::validate(capacity, refill_per_sec)?;
        Ok(Self::unchecked(capacity, refill_per_sec, clock))
    }

    pub(crate) fn validate(capacity: f64, refill_per_sec: f64) -> Result<(), ConfigError> {
        ConfigError::require_positive("capacity", capacity)?;
        ConfigError::require_non_negative("refill_per_sec", refill_per_sec)
    }

    pub(crate) fn unchecked(capacity: f64, refill_per_sec: f64, clock: Arc<dyn Clock>) -> Self {
        let now = clock.monotonic_time();
        Self {
            capacity,
            refill_per_sec,
            state: Mutex::new(BucketState {
                tokens: capacity,
                last_refill: now,
            }),
            clock,
        }
    }

    /// Take one token if available. Never blocks beyond the internal lock.
    pub fn try_acquire(&self) -> bool {
        self.try_acquire_n(1.0)
    }

    /// Take `n` tokens at once, or none
    ///
    /// A non-positive or non-finite `n` is refused and takes nothing.
    pub fn try_acquire_n(&self, n: f64) -> bool {
        if !(n.is_finite() && n > 0.0) {
            return false;
        }
        let mut state = self.state.lock();
        self.refill(&mut state);

        if state.tokens >= n {
            state.tokens -= n;
            true
        } else {
            false
        }
    }

    /// Tokens currently available, after applying pending refill
    pub fn available_tokens(&self) -> f64 {
        let mut state = self.state.lock();
        self.refill(&mut state);
        state.tokens
    }

    pub fn capacity(&self) -> f64 {
        self.capacity
    }

    pub fn refill_per_sec(&self) -> f64 {
        self.refill_per_sec
    }

    // Refill and the caller's test-and-decrement run under the same guard.
    fn refill(&self, state: &mut BucketState) {
        let now = self.clock.monotonic_time();
        let elapsed = now - state.last_refill;
        if elapsed > 0.0 {
            state.tokens = (state.tokens + elapsed * self.refill_per_sec).min(self.capacity);
            state.last_refill = now;
        }
    }
}
