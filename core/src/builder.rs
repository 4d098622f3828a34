//! Builder API for ergonomic circuit breaker configuration

use crate::{
    bulkhead::BulkheadSemaphore,
    callbacks::Callbacks,
    circuit::{CircuitBreaker, CircuitContext, Config},
    classifier::FailureClassifier,
    clock::{Clock, SystemClock},
    errors::ConfigError,
    policy::{ConsecutiveFailures, FailureAccrualPolicy, FailureRateWindow},
};
use std::sync::Arc;
use std::time::Duration;

/// Which accrual policy `build()` should construct
#[derive(Debug, Clone)]
enum PolicyChoice {
    Consecutive(usize),
    RateWindow {
        window: Duration,
        failure_threshold: Option<usize>,
        failure_rate: f64,
        minimum_calls: usize,
    },
    Custom(Arc<dyn FailureAccrualPolicy>),
}

/// Builder for creating circuit breakers with fluent API
///
/// Values are validated in [`build`](Self::build), not in the setters.
///
/// ```rust
/// use admission_machines::CircuitBreaker;
/// use std::time::Duration;
///
/// let breaker = CircuitBreaker::builder("payments")
///     .failure_threshold(3)
///     .open_duration(Duration::from_secs(5))
///     .success_threshold(2)
///     .on_open(|name| eprintln!("{name} opened"))
///     .build()
///     .unwrap();
///
/// let result = breaker.call(|| Ok::<_, String>("charged"));
/// assert!(result.is_ok());
/// ```
pub struct CircuitBuilder {
    name: String,
    config: Config,
    policy: PolicyChoice,
    clock: Option<Arc<dyn Clock>>,
    failure_classifier: Option<Arc<dyn FailureClassifier>>,
    max_concurrency: Option<usize>,
    callbacks: Callbacks,
}

impl CircuitBuilder {
    /// Create a new builder for a circuit with the given name
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            config: Config::default(),
            policy: PolicyChoice::Consecutive(5),
            clock: None,
            failure_classifier: None,
            max_concurrency: None,
            callbacks: Callbacks::new(),
        }
    }

    /// Trip after this many consecutive failures
    pub fn failure_threshold(mut self, threshold: usize) -> Self {
        self.policy = PolicyChoice::Consecutive(threshold);
        self
    }

    /// Trip when `failures / calls >= rate` over a trailing window
    ///
    /// The rate is only evaluated once `minimum_calls` calls are in the
    /// window.
    pub fn failure_rate(mut self, rate: f64, window: Duration, minimum_calls: usize) -> Self {
        let failure_threshold = match self.policy {
            PolicyChoice::Consecutive(n) => Some(n),
            PolicyChoice::RateWindow {
                failure_threshold, ..
            } => failure_threshold,
            PolicyChoice::Custom(_) => None,
        };
        self.policy = PolicyChoice::RateWindow {
            window,
            failure_threshold,
            failure_rate: rate,
            minimum_calls,
        };
        self
    }

    /// Use only the failure rate, without an absolute count
    pub fn disable_failure_threshold(mut self) -> Self {
        if let PolicyChoice::RateWindow {
            failure_threshold, ..
        } = &mut self.policy
        {
            *failure_threshold = None;
        }
        self
    }

    /// Inject any accrual policy, replacing the threshold settings
    pub fn policy(mut self, policy: Arc<dyn FailureAccrualPolicy>) -> Self {
        self.policy = PolicyChoice::Custom(policy);
        self
    }

    /// Time source, [`SystemClock`] by default
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn open_duration(mut self, duration: Duration) -> Self {
        self.config.open_duration = duration;
        self
    }

    /// Set the success threshold (successes needed to close from half-open)
    pub fn success_threshold(mut self, threshold: usize) -> Self {
        self.config.success_threshold = threshold;
        self
    }

    /// Set the jitter factor (0.0 = no jitter, 1.0 = full jitter)
    pub fn jitter_factor(mut self, factor: f64) -> Self {
        self.config.jitter_factor = factor;
        self
    }

    /// Set a failure classifier to filter which errors should trip the circuit
    ///
    /// Use this to ignore "expected" errors like validation failures or client
    /// errors (4xx), while still tripping on server errors (5xx).
    ///
    /// ```rust
    /// use admission_machines::{CircuitBreaker, FailureContext, PredicateClassifier};
    /// use std::sync::Arc;
    ///
    /// let breaker = CircuitBreaker::builder("api")
    ///     .failure_classifier(Arc::new(PredicateClassifier::new(|ctx: &FailureContext<'_>| {
    ///         // Only slow errors count
    ///         ctx.duration > 1.0
    ///     })))
    ///     .build()
    ///     .unwrap();
    /// # assert!(breaker.is_closed());
    /// ```
    pub fn failure_classifier(mut self, classifier: Arc<dyn FailureClassifier>) -> Self {
        self.failure_classifier = Some(classifier);
        self
    }

    /// Set maximum concurrency limit (bulkheading)
    ///
    /// Calls beyond the limit fail with `CircuitError::BulkheadFull` without
    /// running and without counting against the circuit.
    pub fn max_concurrency(mut self, limit: usize) -> Self {
        self.max_concurrency = Some(limit);
        self
    }

    /// Set callback for when circuit opens
    pub fn on_open<F>(mut self, f: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.callbacks.on_open = Some(Arc::new(f));
        self
    }

    /// Set callback for when circuit closes
    pub fn on_close<F>(mut self, f: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.callbacks.on_close = Some(Arc::new(f));
        self
    }

    /// Set callback for when circuit enters half-open
    pub fn on_half_open<F>(mut self, f: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.callbacks.on_half_open = Some(Arc::new(f));
        self
    }

    /// Validate the settings and build the circuit breaker
    pub fn build(self) -> Result<CircuitBreaker, ConfigError> {
        self.config.validate()?;

        let clock = self
            .clock
            .unwrap_or_else(|| Arc::new(SystemClock::new()));

        let policy: Arc<dyn FailureAccrualPolicy> = match self.policy {
            PolicyChoice::Consecutive(threshold) => Arc::new(ConsecutiveFailures::new(threshold)?),
            PolicyChoice::RateWindow {
                window,
                failure_threshold,
                failure_rate,
                minimum_calls,
            } => Arc::new(FailureRateWindow::new(
                window,
                failure_threshold,
                Some(failure_rate),
                minimum_calls,
                Arc::clone(&clock),
            )?),
            PolicyChoice::Custom(policy) => policy,
        };

        let bulkhead = self
            .max_concurrency
            .map(BulkheadSemaphore::new)
            .transpose()?
            .map(Arc::new);

        let context = CircuitContext {
            name: self.name,
            config: self.config,
            policy,
            clock,
            failure_classifier: self.failure_classifier,
            bulkhead,
        };

        Ok(CircuitBreaker::with_context_and_callbacks(
            context,
            self.callbacks,
        ))
    }
}

impl std::fmt::Debug for CircuitBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBuilder")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("policy", &self.policy)
            .field("max_concurrency", &self.max_concurrency)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit::BreakerState;
    use crate::clock::ManualClock;
    use parking_lot::Mutex;

    #[test]
    fn test_builder_defaults() {
        let circuit = CircuitBuilder::new("test").build().unwrap();

        assert_eq!(circuit.state_name(), "Closed");
        assert!(circuit.is_closed());
        assert_eq!(circuit.config().success_threshold, 1);
    }

    #[test]
    fn test_builder_rejects_invalid_values() {
        assert!(CircuitBuilder::new("t").failure_threshold(0).build().is_err());
        assert!(CircuitBuilder::new("t").jitter_factor(1.5).build().is_err());
        assert!(CircuitBuilder::new("t").success_threshold(0).build().is_err());
        assert!(CircuitBuilder::new("t").max_concurrency(0).build().is_err());
        assert!(
            CircuitBuilder::new("t")
                .open_duration(Duration::ZERO)
                .build()
                .is_err()
        );
    }

    #[test]
    fn test_builder_with_callbacks() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let (on_open, on_half_open, on_close) =
            (events.clone(), events.clone(), events.clone());
        let clock = Arc::new(ManualClock::new());

        let circuit = CircuitBuilder::new("test")
            .failure_threshold(2)
            .open_duration(Duration::from_millis(100))
            .clock(clock.clone())
            .on_open(move |name| on_open.lock().push(format!("open:{name}")))
            .on_half_open(move |name| on_half_open.lock().push(format!("half_open:{name}")))
            .on_close(move |name| on_close.lock().push(format!("close:{name}")))
            .build()
            .unwrap();

        let _ = circuit.call(|| Err::<(), _>("error 1"));
        let _ = circuit.call(|| Err::<(), _>("error 2"));
        clock.advance(Duration::from_millis(100));
        let _ = circuit.call(|| Ok::<_, &str>(()));

        assert_eq!(
            *events.lock(),
            vec!["open:test", "half_open:test", "close:test"]
        );
    }

    #[test]
    fn test_builder_failure_rate() {
        let clock = Arc::new(ManualClock::new());
        let circuit = CircuitBuilder::new("rate")
            .failure_rate(0.5, Duration::from_secs(60), 4)
            .disable_failure_threshold()
            .clock(clock)
            .build()
            .unwrap();

        let _ = circuit.call(|| Ok::<_, &str>(()));
        let _ = circuit.call(|| Err::<(), _>("e"));
        let _ = circuit.call(|| Ok::<_, &str>(()));
        assert!(circuit.is_closed(), "below minimum calls");

        let _ = circuit.call(|| Err::<(), _>("e"));
        assert_eq!(circuit.state(), BreakerState::Open);
    }

    #[test]
    fn test_builder_custom_policy_is_shared() {
        let policy = Arc::new(ConsecutiveFailures::new(1).unwrap());
        let circuit = CircuitBuilder::new("custom")
            .policy(policy.clone())
            .build()
            .unwrap();

        circuit.on_failure();
        assert!(circuit.is_open());
        circuit.reset();
        assert_eq!(policy.consecutive_failures(), 0);
    }

    #[test]
    fn test_builder_max_concurrency() {
        let circuit = CircuitBuilder::new("bulk").max_concurrency(1).build().unwrap();

        let outer = circuit.call(|| {
            // The outer call holds the only permit while it runs
            let nested = circuit.call(|| Ok::<_, &str>(()));
            Ok::<_, &str>(nested.map_err(|e| e.is_rejection()))
        });
        assert_eq!(outer.unwrap(), Err(true));
        assert!(circuit.call(|| Ok::<_, &str>(())).is_ok(), "permit released");
    }
}
