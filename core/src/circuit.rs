//! Circuit breaker implementation using state machines
//!
//! The breaker gates call admission on a [`FailureAccrualPolicy`] and an
//! open-duration timer. All transitions run under one per-breaker lock;
//! callbacks fire after the lock is released.

use crate::{
    bulkhead::BulkheadSemaphore,
    callbacks::Callbacks,
    classifier::{FailureClassifier, FailureContext},
    clock::{Clock, SystemClock},
    errors::{CircuitError, ConfigError},
    policy::{ConsecutiveFailures, FailureAccrualPolicy},
};
use parking_lot::{Mutex, MutexGuard};
use state_machines::state_machine;
use std::sync::Arc;
use std::time::Duration;

/// Circuit breaker configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// How long the circuit stays open before admitting a probe
    pub open_duration: Duration,

    /// Number of successes required in HalfOpen to close the circuit
    pub success_threshold: usize,

    /// Jitter factor for open_duration (0.0 = no jitter, 1.0 = full jitter)
    /// Uses chrono-machines formula: duration * (1 - jitter + rand * jitter)
    pub jitter_factor: f64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            open_duration: Duration::from_secs(30),
            success_threshold: 1,
            jitter_factor: 0.0,
        }
    }
}

impl Config {
    pub(crate) fn validate(&self) -> Result<(), ConfigError> {
        ConfigError::require_positive("open_duration", self.open_duration.as_secs_f64())?;
        ConfigError::require_positive("success_threshold", self.success_threshold as f64)?;
        ConfigError::require_range("jitter_factor", self.jitter_factor, 0.0, 1.0)
    }
}

/// Externally visible circuit state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    fn from_machine(name: &str) -> Self {
        match name {
            "Open" => BreakerState::Open,
            "HalfOpen" => BreakerState::HalfOpen,
            _ => BreakerState::Closed,
        }
    }
}

/// Circuit breaker context - shared data across all states
#[derive(Clone)]
pub struct CircuitContext {
    pub name: String,
    pub config: Config,
    pub policy: Arc<dyn FailureAccrualPolicy>,
    pub clock: Arc<dyn Clock>,
    pub failure_classifier: Option<Arc<dyn FailureClassifier>>,
    pub bulkhead: Option<Arc<BulkheadSemaphore>>,
}

impl Default for CircuitContext {
    fn default() -> Self {
        Self {
            name: String::new(),
            config: Config::default(),
            policy: Arc::new(ConsecutiveFailures::default()),
            clock: Arc::new(SystemClock::new()),
            failure_classifier: None,
            bulkhead: None,
        }
    }
}

impl std::fmt::Debug for CircuitContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitContext")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("policy", &self.policy)
            .field("failure_classifier", &self.failure_classifier)
            .field("bulkhead", &self.bulkhead)
            .finish()
    }
}

/// Data specific to the Open state
#[derive(Debug, Clone, Default)]
pub struct OpenData {
    pub opened_at: f64,
}

/// Data specific to the HalfOpen state
#[derive(Debug, Clone, Default)]
pub struct HalfOpenData {
    pub consecutive_successes: usize,
}

state_machine! {
    name: Circuit,
    context: CircuitContext,
    dynamic: true,

    initial: Closed,
    states: [
        Closed,
        Open(OpenData),
        HalfOpen(HalfOpenData),
    ],
    events {
        trip {
            guards: [should_open],
            transition: { from: [Closed, HalfOpen], to: Open }
        }
        attempt_reset {
            guards: [timeout_elapsed],
            transition: { from: Open, to: HalfOpen }
        }
        close {
            guards: [should_close],
            transition: { from: HalfOpen, to: Closed }
        }
    }
}

impl Circuit<Closed> {
    fn should_open(&self, ctx: &CircuitContext) -> bool {
        ctx.policy.is_tripped()
    }
}

impl Circuit<HalfOpen> {
    /// A failed probe always re-opens
    fn should_open(&self, _ctx: &CircuitContext) -> bool {
        true
    }

    fn should_close(&self, ctx: &CircuitContext) -> bool {
        self.state_data_half_open()
            .is_some_and(|data| data.consecutive_successes >= ctx.config.success_threshold)
    }
}

impl Circuit<Open> {
    fn timeout_elapsed(&self, ctx: &CircuitContext) -> bool {
        let Some(data) = self.state_data_open() else {
            return false;
        };
        let elapsed = ctx.clock.monotonic_time() - data.opened_at;
        let open_secs = ctx.config.open_duration.as_secs_f64();

        let timeout_secs = if ctx.config.jitter_factor > 0.0 {
            let open_ms = (open_secs * 1000.0) as u64;
            let policy = chrono_machines::Policy {
                max_attempts: 1,
                base_delay_ms: open_ms,
                multiplier: 1.0,
                max_delay_ms: open_ms,
            };
            let timeout_ms = policy.calculate_delay(1, ctx.config.jitter_factor);
            (timeout_ms as f64) / 1000.0
        } else {
            open_secs
        };

        elapsed >= timeout_secs
    }
}

/// Three-state call gate
///
/// `allow`, `on_success` and `on_failure` never block on anything but the
/// breaker's own short critical section, so the breaker can be shared
/// behind an `Arc` and driven from any number of threads.
///
/// # Example
///
/// ```rust
/// use admission_machines::{CircuitBreaker, ConsecutiveFailures, ManualClock};
/// use std::sync::Arc;
/// use std::time::Duration;
///
/// let clock = Arc::new(ManualClock::new());
/// let breaker = CircuitBreaker::new(
///     "inventory",
///     Arc::new(ConsecutiveFailures::new(2).unwrap()),
///     Duration::from_millis(100),
///     clock.clone(),
/// )
/// .unwrap();
///
/// breaker.on_failure();
/// breaker.on_failure();
/// assert!(!breaker.allow());
///
/// clock.advance(Duration::from_millis(150));
/// assert!(breaker.allow()); // probe admitted
/// breaker.on_success();
/// assert!(breaker.is_closed());
/// ```
pub struct CircuitBreaker {
    machine: Mutex<DynamicCircuit>,
    context: CircuitContext,
    callbacks: Callbacks,
}

impl CircuitBreaker {
    /// Breaker with default settings apart from the policy and open duration
    pub fn new(
        name: impl Into<String>,
        policy: Arc<dyn FailureAccrualPolicy>,
        open_duration: Duration,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ConfigError> {
        let config = Config {
            open_duration,
            ..Config::default()
        };
        config.validate()?;

        let context = CircuitContext {
            name: name.into(),
            config,
            policy,
            clock,
            failure_classifier: None,
            bulkhead: None,
        };
        Ok(Self::with_context_and_callbacks(context, Callbacks::new()))
    }

    /// Used by the builder, which validates the context itself
    pub(crate) fn with_context_and_callbacks(
        context: CircuitContext,
        callbacks: Callbacks,
    ) -> Self {
        let machine = DynamicCircuit::new(context.clone());

        Self {
            machine: Mutex::new(machine),
            context,
            callbacks,
        }
    }

    pub fn builder(name: impl Into<String>) -> crate::builder::CircuitBuilder {
        crate::builder::CircuitBuilder::new(name)
    }

    /// Whether a call may proceed now
    ///
    /// In Open, the first caller after the open duration moves the circuit to
    /// HalfOpen and is admitted as the probe; the check and the transition
    /// happen under one lock, so only one caller can perform it.
    pub fn allow(&self) -> bool {
        let mut machine = self.machine.lock();
        if BreakerState::from_machine(machine.current_state()) != BreakerState::Open {
            return true;
        }
        if machine.handle(CircuitEvent::AttemptReset).is_err() {
            return false;
        }
        drop(machine);

        tracing::info!(circuit = %self.context.name, "circuit half-open, admitting probe");
        self.callbacks.fire(BreakerState::HalfOpen, &self.context.name);
        true
    }

    /// Report a successful call
    pub fn on_success(&self) {
        let mut machine = self.machine.lock();
        self.context.policy.record_success();

        let closed = match BreakerState::from_machine(machine.current_state()) {
            BreakerState::Closed => false,
            BreakerState::HalfOpen => {
                if let Some(data) = machine.half_open_data_mut() {
                    data.consecutive_successes += 1;
                }
                machine.handle(CircuitEvent::Close).is_ok()
            }
            BreakerState::Open => {
                // A call admitted before the trip came back healthy
                *machine = DynamicCircuit::new(self.context.clone());
                true
            }
        };
        if closed {
            self.context.policy.reset();
        }
        drop(machine);

        if closed {
            tracing::info!(circuit = %self.context.name, "circuit closed");
            self.callbacks.fire(BreakerState::Closed, &self.context.name);
        }
    }

    /// Report a failed call
    ///
    /// While Open this only feeds the policy; `opened_at` is left alone.
    pub fn on_failure(&self) {
        let mut machine = self.machine.lock();
        self.context.policy.record_failure();

        let opened = match BreakerState::from_machine(machine.current_state()) {
            BreakerState::Open => false,
            BreakerState::Closed | BreakerState::HalfOpen => {
                let tripped = machine.handle(CircuitEvent::Trip).is_ok();
                if tripped {
                    self.mark_open(&mut machine);
                }
                tripped
            }
        };
        drop(machine);

        if opened {
            tracing::warn!(circuit = %self.context.name, "circuit opened");
            self.callbacks.fire(BreakerState::Open, &self.context.name);
        }
    }

    /// Execute a fallible operation with circuit breaker protection
    ///
    /// Errors the failure classifier rejects are returned to the caller but
    /// not reported to the breaker.
    pub fn call<T, E, F>(&self, f: F) -> Result<T, CircuitError<E>>
    where
        E: 'static,
        F: FnOnce() -> Result<T, E>,
    {
        let _permit = match &self.context.bulkhead {
            Some(bulkhead) => match bulkhead.try_acquire() {
                Some(guard) => Some(guard),
                None => {
                    tracing::debug!(circuit = %self.context.name, "bulkhead full");
                    return Err(CircuitError::BulkheadFull {
                        circuit: self.context.name.clone(),
                        limit: bulkhead.limit(),
                    });
                }
            },
            None => None,
        };

        if !self.allow() {
            return Err(CircuitError::Open {
                circuit: self.context.name.clone(),
                opened_at: self.opened_at().unwrap_or(0.0),
            });
        }

        let start = self.context.clock.monotonic_time();
        match f() {
            Ok(value) => {
                self.on_success();
                Ok(value)
            }
            Err(e) => {
                let duration = self.context.clock.monotonic_time() - start;
                let counts = self.context.failure_classifier.as_ref().is_none_or(|c| {
                    c.counts_as_failure(&FailureContext {
                        circuit_name: &self.context.name,
                        error: &e as &dyn std::any::Any,
                        duration,
                    })
                });

                if counts {
                    self.on_failure();
                } else {
                    tracing::trace!(circuit = %self.context.name, "error not counted as failure");
                }
                Err(CircuitError::Execution(e))
            }
        }
    }

    pub fn state(&self) -> BreakerState {
        BreakerState::from_machine(self.machine.lock().current_state())
    }

    /// Get current state name
    pub fn state_name(&self) -> &'static str {
        self.machine.lock().current_state()
    }

    pub fn is_open(&self) -> bool {
        self.state() == BreakerState::Open
    }

    pub fn is_closed(&self) -> bool {
        self.state() == BreakerState::Closed
    }

    /// Monotonic time the circuit last opened, while it is Open
    pub fn opened_at(&self) -> Option<f64> {
        self.machine.lock().open_data().map(|d| d.opened_at)
    }

    pub fn name(&self) -> &str {
        &self.context.name
    }

    pub fn config(&self) -> &Config {
        &self.context.config
    }

    /// Force Closed and clear the policy. No callback fires.
    pub fn reset(&self) {
        let mut machine = self.machine.lock();
        *machine = DynamicCircuit::new(self.context.clone());
        self.context.policy.reset();
    }

    fn mark_open(&self, machine: &mut MutexGuard<'_, DynamicCircuit>) {
        if let Some(data) = machine.open_data_mut() {
            data.opened_at = self.context.clock.monotonic_time();
        }
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.context.name)
            .field("state", &self.state())
            .field("config", &self.context.config)
            .finish()
    }
}
