//! Bulkheads: bounded concurrent occupancy
//!
//! Three variants:
//! - [`BulkheadSemaphore`]: one global permit pool, non-blocking
//! - [`KeyedBulkhead`]: an independent pool per key, created lazily
//! - [`QueueingBulkhead`]: waits up to a timeout for a permit, cancellable

use crate::errors::{AdmissionError, ConfigError};
use dashmap::DashMap;
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::hash::Hash;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

/// A semaphore-based bulkhead for limiting concurrent operations
///
/// Bulkheading prevents thread pool exhaustion by rejecting requests
/// when a maximum concurrency limit is reached.
#[derive(Debug)]
pub struct BulkheadSemaphore {
    limit: usize,
    acquired: AtomicUsize,
}

impl BulkheadSemaphore {
    /// Rejects a `limit` of 0
    pub fn new(limit: usize) -> Result<Self, ConfigError> {
        ConfigError::require_positive("bulkhead limit", limit as f64)?;
        Ok(Self {
            limit,
            acquired: AtomicUsize::new(0),
        })
    }

    /// Take a permit without blocking. Pair every `true` with one [`release`](Self::release).
    pub fn try_enter(&self) -> bool {
        let mut current = self.acquired.load(Ordering::Acquire);

        loop {
            if current >= self.limit {
                tracing::trace!(limit = self.limit, "bulkhead full");
                return false;
            }

            match self.acquired.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                // Another thread moved the counter; re-check against the limit
                Err(actual) => current = actual,
            }
        }
    }

    /// Return a permit. Releasing with nothing acquired is a no-op.
    pub fn release(&self) {
        let _ = self
            .acquired
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }

    /// Like [`try_enter`](Self::try_enter) but returns a guard that releases on drop
    ///
    /// The permit is returned even if the guarded operation panics.
    pub fn try_acquire(self: &Arc<Self>) -> Option<BulkheadGuard> {
        self.try_enter().then(|| BulkheadGuard {
            semaphore: Arc::clone(self),
        })
    }

    /// Like [`try_acquire`](Self::try_acquire) with the denial as an error
    pub fn acquire_or_reject(self: &Arc<Self>) -> Result<BulkheadGuard, AdmissionError> {
        self.try_acquire()
            .ok_or(AdmissionError::BulkheadFull { limit: self.limit })
    }

    pub fn acquired(&self) -> usize {
        self.acquired.load(Ordering::Acquire)
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn available(&self) -> usize {
        self.limit.saturating_sub(self.acquired())
    }
}

/// Releases a [`BulkheadSemaphore`] permit when dropped
#[derive(Debug)]
pub struct BulkheadGuard {
    semaphore: Arc<BulkheadSemaphore>,
}

impl Drop for BulkheadGuard {
    fn drop(&mut self) {
        self.semaphore.release();
    }
}

/// One independent permit pool per key
///
/// Pools are created on first use and never removed, so key cardinality is
/// expected to be bounded (hosts, tenants, endpoints).
#[derive(Debug)]
pub struct KeyedBulkhead<K>
where
    K: Eq + Hash,
{
    limit_per_key: usize,
    pools: DashMap<K, Arc<BulkheadSemaphore>>,
}

impl<K> KeyedBulkhead<K>
where
    K: Eq + Hash + Clone,
{
    pub fn new(limit_per_key: usize) -> Result<Self, ConfigError> {
        ConfigError::require_positive("bulkhead limit", limit_per_key as f64)?;
        Ok(Self {
            limit_per_key,
            pools: DashMap::new(),
        })
    }

    pub fn try_acquire(&self, key: &K) -> bool {
        self.pool(key).try_enter()
    }

    /// Guard-returning variant of [`try_acquire`](Self::try_acquire)
    pub fn try_acquire_guard(&self, key: &K) -> Option<BulkheadGuard> {
        self.pool(key).try_acquire()
    }

    /// Return a permit for `key`. Unknown keys are ignored.
    pub fn release(&self, key: &K) {
        if let Some(pool) = self.pools.get(key) {
            pool.release();
        }
    }

    /// Permits held for `key` (0 for unknown keys)
    pub fn acquired(&self, key: &K) -> usize {
        self.pools.get(key).map_or(0, |pool| pool.acquired())
    }

    /// Number of keys that have a pool
    pub fn len(&self) -> usize {
        self.pools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pools.is_empty()
    }

    fn pool(&self, key: &K) -> Arc<BulkheadSemaphore> {
        if let Some(pool) = self.pools.get(key) {
            return Arc::clone(pool.value());
        }
        let pool = self.pools.entry(key.clone()).or_insert_with(|| {
            Arc::new(BulkheadSemaphore {
                limit: self.limit_per_key,
                acquired: AtomicUsize::new(0),
            })
        });
        Arc::clone(pool.value())
    }
}

#[derive(Debug)]
struct QueueShared {
    available: Mutex<usize>,
    permit_freed: Condvar,
}

/// Cancels queueing-bulkhead waits it has been passed to
///
/// Cloning yields a handle to the same token. Once cancelled a token stays
/// cancelled.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    inner: Arc<CancelInner>,
}

#[derive(Debug, Default)]
struct CancelInner {
    cancelled: AtomicBool,
    waiting_on: Mutex<Vec<Arc<QueueShared>>>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        let waiting_on = self.inner.waiting_on.lock().clone();
        for shared in waiting_on {
            // Taking the lock orders this wake-up after the waiter's flag check
            let _available = shared.available.lock();
            shared.permit_freed.notify_all();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    fn register(&self, shared: &Arc<QueueShared>) {
        self.inner.waiting_on.lock().push(Arc::clone(shared));
    }

    fn unregister(&self, shared: &Arc<QueueShared>) {
        let mut waiting_on = self.inner.waiting_on.lock();
        if let Some(pos) = waiting_on.iter().position(|s| Arc::ptr_eq(s, shared)) {
            waiting_on.swap_remove(pos);
        }
    }
}

/// Bulkhead whose acquire waits up to a timeout for a permit
#[derive(Debug)]
pub struct QueueingBulkhead {
    limit: usize,
    shared: Arc<QueueShared>,
}

impl QueueingBulkhead {
    pub fn new(limit: usize) -> Result<Self, ConfigError> {
        ConfigError::require_positive("bulkhead limit", limit as f64)?;
        Ok(Self {
            limit,
            shared: Arc::new(QueueShared {
                available: Mutex::new(limit),
                permit_freed: Condvar::new(),
            }),
        })
    }

    /// Wait up to `timeout` for a permit. Returns `false` on expiry.
    ///
    /// A timeout too large to represent as a deadline waits without one.
    pub fn try_acquire(&self, timeout: Duration) -> bool {
        let deadline = Instant::now().checked_add(timeout);
        let mut available = self.shared.available.lock();

        while *available == 0 {
            if self.wait_for_permit(&mut available, deadline) {
                break;
            }
        }
        Self::take(&mut available, timeout)
    }

    /// Like [`try_acquire`](Self::try_acquire), aborting when `cancel` fires
    ///
    /// Cancellation is reported as [`AdmissionError::Cancelled`] and leaves no
    /// permit held. A token that is already cancelled fails immediately.
    pub fn try_acquire_cancellable(
        &self,
        timeout: Duration,
        cancel: &CancelToken,
    ) -> Result<bool, AdmissionError> {
        let deadline = Instant::now().checked_add(timeout);
        cancel.register(&self.shared);

        let result = {
            let mut available = self.shared.available.lock();
            loop {
                if cancel.is_cancelled() {
                    tracing::debug!("bulkhead wait cancelled");
                    // Pass on a release wake-up this waiter may have consumed
                    if *available > 0 {
                        self.shared.permit_freed.notify_one();
                    }
                    break Err(AdmissionError::Cancelled);
                }
                if *available > 0 {
                    break Ok(Self::take(&mut available, timeout));
                }
                if self.wait_for_permit(&mut available, deadline) {
                    // A cancel that raced with expiry still wins
                    if cancel.is_cancelled() {
                        break Err(AdmissionError::Cancelled);
                    }
                    break Ok(Self::take(&mut available, timeout));
                }
            }
        };

        cancel.unregister(&self.shared);
        result
    }

    /// Return a permit and wake one waiter. Never exceeds the configured limit.
    pub fn release(&self) {
        let mut available = self.shared.available.lock();
        if *available < self.limit {
            *available += 1;
            self.shared.permit_freed.notify_one();
        }
    }

    pub fn available(&self) -> usize {
        *self.shared.available.lock()
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Blocks until woken; true once `deadline` has passed
    fn wait_for_permit(
        &self,
        available: &mut MutexGuard<'_, usize>,
        deadline: Option<Instant>,
    ) -> bool {
        match deadline {
            Some(deadline) => self
                .shared
                .permit_freed
                .wait_until(available, deadline)
                .timed_out(),
            None => {
                self.shared.permit_freed.wait(available);
                false
            }
        }
    }

    fn take(available: &mut usize, timeout: Duration) -> bool {
        if *available > 0 {
            *available -= 1;
            true
        } else {
            tracing::debug!(?timeout, "bulkhead wait timed out");
            false
        }
    }
}
