//! Fixed-window counter
//!
//! Admits up to `limit` acquisitions per window. The window rolls over on the
//! first access after it has elapsed, inside the same critical section as the
//! admission check.

use crate::clock::Clock;
use crate::errors::ConfigError;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug)]
struct WindowState {
    used: usize,
    window_start: f64,
}

/// Counter that resets when its window elapses
#[derive(Debug)]
pub struct WindowedCounter {
    limit: usize,
    window_secs: f64,
    state: Mutex<WindowState>,
    clock: Arc<dyn Clock>,
}

impl WindowedCounter {
    /// Create a counter admitting `limit` acquisitions per `window`
    ///
    /// A `limit` of 0 is accepted and denies everything; a zero window is
    /// rejected.
    pub fn new(limit: usize, window: Duration, clock: Arc<dyn Clock>) -> Result<Self, ConfigError> {
        Self::validate(window)?;
        Ok(Self::unchecked(limit, window, clock))
    }

    pub(crate) fn validate(window: Duration) -> Result<(), ConfigError> {
        ConfigError::require_positive("window", window.as_secs_f64())
    }

    pub(crate) fn unchecked(limit: usize, window: Duration, clock: Arc<dyn Clock>) -> Self {
        let now = clock.monotonic_time();
        Self {
            limit,
            window_secs: window.as_secs_f64(),
            state: Mutex::new(WindowState {
                used: 0,
                window_start: now,
            }),
            clock,
        }
    }

    pub fn try_acquire(&self) -> bool {
        let mut state = self.state.lock();
        self.roll(&mut state);

        if state.used < self.limit {
            state.used += 1;
            true
        } else {
            false
        }
    }

    /// Acquisitions left in the current window
    pub fn remaining(&self) -> usize {
        let mut state = self.state.lock();
        self.roll(&mut state);
        self.limit - state.used
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    fn roll(&self, state: &mut WindowState) {
        let now = self.clock.monotonic_time();
        if now - state.window_start >= self.window_secs {
            state.used = 0;
            state.window_start = now;
        }
    }
}
