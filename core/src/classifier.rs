//! Failure classification for [`crate::CircuitBreaker::call`]
//!
//! A classifier decides whether an error returned by a protected call should
//! be reported to the failure accrual policy. Errors it rejects are treated as
//! neither success nor failure: they do not advance the policy and do not
//! close a half-open circuit.

use std::any::Any;

/// What a classifier gets to look at
#[derive(Debug)]
pub struct FailureContext<'a> {
    pub circuit_name: &'a str,
    /// The error value; downcast to inspect concrete types
    pub error: &'a dyn Any,
    /// Duration of the failed call in seconds
    pub duration: f64,
}

/// Decides which errors count against a circuit
pub trait FailureClassifier: Send + Sync + std::fmt::Debug {
    fn counts_as_failure(&self, ctx: &FailureContext<'_>) -> bool;
}

/// Counts every error
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultClassifier;

impl FailureClassifier for DefaultClassifier {
    fn counts_as_failure(&self, _ctx: &FailureContext<'_>) -> bool {
        true
    }
}

/// Closure-backed classifier
///
/// ```rust
/// use admission_machines::{FailureClassifier, FailureContext, PredicateClassifier};
///
/// // Client errors are the caller's fault and should not open the circuit
/// let classifier = PredicateClassifier::new(|ctx: &FailureContext<'_>| {
///     ctx.error
///         .downcast_ref::<u16>()
///         .map(|status| *status >= 500)
///         .unwrap_or(true)
/// });
///
/// let ctx = FailureContext { circuit_name: "api", error: &404u16, duration: 0.01 };
/// assert!(!classifier.counts_as_failure(&ctx));
/// ```
pub struct PredicateClassifier<F>
where
    F: Fn(&FailureContext<'_>) -> bool + Send + Sync,
{
    predicate: F,
}

impl<F> PredicateClassifier<F>
where
    F: Fn(&FailureContext<'_>) -> bool + Send + Sync,
{
    pub fn new(predicate: F) -> Self {
        Self { predicate }
    }
}

impl<F> FailureClassifier for PredicateClassifier<F>
where
    F: Fn(&FailureContext<'_>) -> bool + Send + Sync,
{
    fn counts_as_failure(&self, ctx: &FailureContext<'_>) -> bool {
        (self.predicate)(ctx)
    }
}

impl<F> std::fmt::Debug for PredicateClassifier<F>
where
    F: Fn(&FailureContext<'_>) -> bool + Send + Sync,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PredicateClassifier").finish_non_exhaustive()
    }
}
