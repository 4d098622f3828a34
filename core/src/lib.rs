//! AdmissionMachines - call-admission and deduplication primitives
//!
//! This crate answers two questions for code that makes repeated remote
//! calls:
//! - may this call proceed right now, given recent failures, in-flight
//!   concurrency and configured rate budgets?
//! - if many callers ask for the same unit of work at once, how is it
//!   computed exactly once and shared?
//!
//! Every primitive is safe to share across threads behind an `Arc`, takes its
//! time from an injected [`Clock`] and validates its configuration at
//! construction.
//!
//! # Example
//!
//! ```rust
//! use admission_machines::{CircuitBreaker, RateLimiter, SystemClock, TokenBucketRateLimiter};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! let clock = Arc::new(SystemClock::new());
//! let limiter = TokenBucketRateLimiter::new(10.0, 5.0, clock.clone()).unwrap();
//! let circuit = CircuitBreaker::builder("my_service")
//!     .failure_threshold(5)
//!     .open_duration(Duration::from_secs(30))
//!     .clock(clock)
//!     .on_open(|name| println!("Circuit {} opened!", name))
//!     .build()
//!     .unwrap();
//!
//! if limiter.try_acquire() {
//!     let result = circuit.call(|| Ok::<_, String>("success"));
//!     assert!(result.is_ok());
//! }
//! ```

pub mod batcher;
pub mod builder;
pub mod bulkhead;
pub mod callbacks;
pub mod circuit;
pub mod classifier;
pub mod clock;
pub mod concurrency;
pub mod errors;
pub mod idempotency;
pub mod policy;
pub mod rate_limit;
pub mod single_flight;
pub mod stats;
pub mod token_bucket;
pub mod window;

pub use batcher::RequestBatcher;
pub use builder::CircuitBuilder;
pub use bulkhead::{BulkheadGuard, BulkheadSemaphore, CancelToken, KeyedBulkhead, QueueingBulkhead};
pub use circuit::{BreakerState, CircuitBreaker, Config};
pub use classifier::{DefaultClassifier, FailureClassifier, FailureContext, PredicateClassifier};
pub use clock::{Clock, ManualClock, SystemClock};
pub use concurrency::AimdLimiter;
pub use errors::{AdmissionError, CircuitError, ConfigError};
pub use idempotency::{IdempotencyStore, TtlSingleFlight};
pub use policy::{ConsecutiveFailures, FailureAccrualPolicy, FailureRateWindow};
pub use rate_limit::{
    FixedWindowRateLimiter, Partitioned, PartitionedRateLimiter, PartitionedRetryBudget,
    RateLimiter, RetryBudget, TokenBucketRateLimiter, TokenBucketRetryBudget, WindowedRetryBudget,
};
pub use single_flight::SingleFlight;
pub use stats::SlidingWindowStats;
pub use token_bucket::TokenBucket;
pub use window::WindowedCounter;

/// Outcome kind recorded by [`SlidingWindowStats`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Success,
    Failure,
}

/// A single timestamped outcome
#[derive(Debug, Clone)]
pub struct Event {
    pub kind: EventKind,
    /// Monotonic time in seconds, from the recording [`Clock`]
    pub timestamp: f64,
}
