//! Transition callbacks for the circuit breaker
//!
//! Callbacks run after the transition has been applied and the state lock
//! released. A panicking callback unwinds into the caller that triggered the
//! transition; it cannot leave the breaker in a half-updated state.

use crate::circuit::BreakerState;
use std::sync::Arc;

/// Callback invoked with the circuit name
pub type TransitionFn = Arc<dyn Fn(&str) + Send + Sync>;

#[derive(Clone, Default)]
pub struct Callbacks {
    pub on_open: Option<TransitionFn>,
    pub on_close: Option<TransitionFn>,
    pub on_half_open: Option<TransitionFn>,
}

impl Callbacks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fire the callback registered for entering `state`, if any
    pub fn fire(&self, state: BreakerState, circuit: &str) {
        let callback = match state {
            BreakerState::Open => &self.on_open,
            BreakerState::Closed => &self.on_close,
            BreakerState::HalfOpen => &self.on_half_open,
        };
        if let Some(callback) = callback {
            callback(circuit);
        }
    }
}

impl std::fmt::Debug for Callbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Callbacks")
            .field("on_open", &self.on_open.is_some())
            .field("on_close", &self.on_close.is_some())
            .field("on_half_open", &self.on_half_open.is_some())
            .finish()
    }
}
