//! Rate limiters and retry budgets
//!
//! Both are admission gates over the same two accounting models
//! ([`TokenBucket`] and [`WindowedCounter`]). They are separate traits so the
//! budget gating retries can be swapped independently of the limiter that
//! gates first attempts.

use crate::clock::Clock;
use crate::errors::{AdmissionError, ConfigError};
use crate::token_bucket::TokenBucket;
use crate::window::WindowedCounter;
use dashmap::DashMap;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

/// Admission gate for first attempts
pub trait RateLimiter: Send + Sync + std::fmt::Debug {
    fn try_acquire(&self) -> bool;

    fn acquire_or_reject(&self) -> Result<(), AdmissionError> {
        if self.try_acquire() {
            Ok(())
        } else {
            Err(AdmissionError::RateLimited)
        }
    }
}

/// Admission gate for retry attempts
pub trait RetryBudget: Send + Sync + std::fmt::Debug {
    fn try_acquire(&self) -> bool;

    fn acquire_or_reject(&self) -> Result<(), AdmissionError> {
        if self.try_acquire() {
            Ok(())
        } else {
            Err(AdmissionError::BudgetExhausted)
        }
    }
}

macro_rules! token_bucket_gate {
    ($(#[$meta:meta])* $name:ident: $gate:ident) => {
        $(#[$meta])*
        #[derive(Debug)]
        pub struct $name {
            bucket: TokenBucket,
        }

        impl $name {
            pub fn new(
                capacity: f64,
                refill_per_sec: f64,
                clock: Arc<dyn Clock>,
            ) -> Result<Self, ConfigError> {
                Ok(Self {
                    bucket: TokenBucket::new(capacity, refill_per_sec, clock)?,
                })
            }

            pub fn available_tokens(&self) -> f64 {
                self.bucket.available_tokens()
            }
        }

        impl $gate for $name {
            fn try_acquire(&self) -> bool {
                self.bucket.try_acquire()
            }
        }
    };
}

macro_rules! windowed_gate {
    ($(#[$meta:meta])* $name:ident: $gate:ident) => {
        $(#[$meta])*
        #[derive(Debug)]
        pub struct $name {
            counter: WindowedCounter,
        }

        impl $name {
            pub fn new(
                limit: usize,
                window: Duration,
                clock: Arc<dyn Clock>,
            ) -> Result<Self, ConfigError> {
                Ok(Self {
                    counter: WindowedCounter::new(limit, window, clock)?,
                })
            }

            pub fn remaining(&self) -> usize {
                self.counter.remaining()
            }
        }

        impl $gate for $name {
            fn try_acquire(&self) -> bool {
                self.counter.try_acquire()
            }
        }
    };
}

token_bucket_gate! {
    /// Token-bucket limiter: bursts up to `capacity`, sustained `refill_per_sec`
    TokenBucketRateLimiter: RateLimiter
}

windowed_gate! {
    /// Fixed-window limiter: at most `limit` calls per window
    FixedWindowRateLimiter: RateLimiter
}

token_bucket_gate! {
    /// Retry budget backed by a token bucket
    TokenBucketRetryBudget: RetryBudget
}

windowed_gate! {
    /// Retry budget allowing `limit` retries per window
    WindowedRetryBudget: RetryBudget
}

type Factory<K, T> = Box<dyn Fn(&K) -> Arc<T> + Send + Sync>;

/// One independent gate per key, created on first use by a factory
///
/// Partitions are memoized for the life of the value; nothing evicts them.
///
/// ```rust
/// use admission_machines::{PartitionedRetryBudget, SystemClock};
/// use std::sync::Arc;
///
/// let budgets = PartitionedRetryBudget::<String>::token_bucket(
///     2.0,
///     0.0,
///     Arc::new(SystemClock::new()),
/// )
/// .unwrap();
///
/// let host = "api.example.com".to_string();
/// assert!(budgets.try_acquire(&host));
/// assert!(budgets.try_acquire(&host));
/// assert!(!budgets.try_acquire(&host));
/// assert!(budgets.try_acquire(&"other.example.com".to_string()));
/// ```
pub struct Partitioned<K, T: ?Sized> {
    partitions: DashMap<K, Arc<T>>,
    factory: Factory<K, T>,
}

impl<K, T> Partitioned<K, T>
where
    K: Eq + Hash + Clone,
    T: ?Sized,
{
    pub fn new<F>(factory: F) -> Self
    where
        F: Fn(&K) -> Arc<T> + Send + Sync + 'static,
    {
        Self {
            partitions: DashMap::new(),
            factory: Box::new(factory),
        }
    }

    /// The partition for `key`, creating it if needed
    ///
    /// Concurrent first calls for the same key all receive the same instance.
    pub fn get(&self, key: &K) -> Arc<T> {
        if let Some(existing) = self.partitions.get(key) {
            return Arc::clone(existing.value());
        }
        let entry = self
            .partitions
            .entry(key.clone())
            .or_insert_with(|| (self.factory)(key));
        Arc::clone(entry.value())
    }

    /// Number of partitions created so far
    pub fn len(&self) -> usize {
        self.partitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.partitions.is_empty()
    }
}

impl<K: Eq + Hash, T: ?Sized> std::fmt::Debug for Partitioned<K, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Partitioned")
            .field("partitions", &self.partitions.len())
            .finish_non_exhaustive()
    }
}

pub type PartitionedRateLimiter<K> = Partitioned<K, dyn RateLimiter>;
pub type PartitionedRetryBudget<K> = Partitioned<K, dyn RetryBudget>;

impl<K> Partitioned<K, dyn RateLimiter>
where
    K: Eq + Hash + Clone + 'static,
{
    /// Per-key token-bucket limiters. Configuration is validated here, once.
    pub fn token_bucket(
        capacity: f64,
        refill_per_sec: f64,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ConfigError> {
        TokenBucket::validate(capacity, refill_per_sec)?;
        Ok(Self::new(move |_key: &K| -> Arc<dyn RateLimiter> {
            Arc::new(TokenBucketRateLimiter {
                bucket: TokenBucket::unchecked(capacity, refill_per_sec, clock.clone()),
            })
        }))
    }

    /// Per-key fixed-window limiters
    pub fn fixed_window(
        limit: usize,
        window: Duration,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ConfigError> {
        WindowedCounter::validate(window)?;
        Ok(Self::new(move |_key: &K| -> Arc<dyn RateLimiter> {
            Arc::new(FixedWindowRateLimiter {
                counter: WindowedCounter::unchecked(limit, window, clock.clone()),
            })
        }))
    }

    pub fn try_acquire(&self, key: &K) -> bool {
        self.get(key).try_acquire()
    }
}

impl<K> Partitioned<K, dyn RetryBudget>
where
    K: Eq + Hash + Clone + 'static,
{
    /// Per-key token-bucket retry budgets. Configuration is validated here, once.
    pub fn token_bucket(
        capacity: f64,
        refill_per_sec: f64,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ConfigError> {
        TokenBucket::validate(capacity, refill_per_sec)?;
        Ok(Self::new(move |_key: &K| -> Arc<dyn RetryBudget> {
            Arc::new(TokenBucketRetryBudget {
                bucket: TokenBucket::unchecked(capacity, refill_per_sec, clock.clone()),
            })
        }))
    }

    /// Per-key windowed retry budgets
    pub fn windowed(
        limit: usize,
        window: Duration,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ConfigError> {
        WindowedCounter::validate(window)?;
        Ok(Self::new(move |_key: &K| -> Arc<dyn RetryBudget> {
            Arc::new(WindowedRetryBudget {
                counter: WindowedCounter::unchecked(limit, window, clock.clone()),
            })
        }))
    }

    pub fn try_acquire(&self, key: &K) -> bool {
        self.get(key).try_acquire()
    }
}
