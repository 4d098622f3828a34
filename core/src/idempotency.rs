//! Time-to-live result caching
//!
//! [`IdempotencyStore`] remembers results for a TTL without deduplicating
//! concurrent work. [`TtlSingleFlight`] puts the same cache in front of a
//! [`SingleFlight`], so hits short-circuit and misses compute once.
//!
//! Entries are never mutated in place; a fresh computation swaps in a new
//! entry. Expired entries are dropped lazily on lookup or by
//! [`IdempotencyStore::purge_expired`].

use crate::clock::Clock;
use crate::errors::ConfigError;
use crate::single_flight::SingleFlight;
use dashmap::DashMap;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone)]
struct CacheEntry<V> {
    value: V,
    expires_at: f64,
}

/// TTL cache of completed results
///
/// Absence is represented by `Option`, so a computation that produces no
/// value is simply not cached and counts as a miss next time.
#[derive(Debug)]
pub struct IdempotencyStore<K, V>
where
    K: Eq + Hash,
{
    ttl_secs: f64,
    entries: DashMap<K, CacheEntry<V>>,
    clock: Arc<dyn Clock>,
}

impl<K, V> IdempotencyStore<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    /// Rejects a zero TTL
    pub fn new(ttl: Duration, clock: Arc<dyn Clock>) -> Result<Self, ConfigError> {
        ConfigError::require_positive("ttl", ttl.as_secs_f64())?;
        Ok(Self {
            ttl_secs: ttl.as_secs_f64(),
            entries: DashMap::new(),
            clock,
        })
    }

    /// The live value for `key`, if any
    pub fn get(&self, key: &K) -> Option<V> {
        let now = self.clock.monotonic_time();
        if let Some(entry) = self.entries.get(key) {
            if entry.expires_at > now {
                return Some(entry.value.clone());
            }
        }
        // Only drop the entry we saw expire, not a replacement swapped in since
        self.entries.remove_if(key, |_, entry| entry.expires_at <= now);
        None
    }

    /// Store `value` for one TTL from now, replacing any previous entry
    pub fn put(&self, key: K, value: V) {
        let expires_at = self.clock.monotonic_time() + self.ttl_secs;
        self.entries.insert(key, CacheEntry { value, expires_at });
    }

    /// Cached value, or the result of `compute` (stored when `Some`)
    ///
    /// Concurrent misses for the same key may each run `compute`; use
    /// [`TtlSingleFlight`] when that is not acceptable.
    pub fn get_or_insert_with<F>(&self, key: K, compute: F) -> Option<V>
    where
        F: FnOnce() -> Option<V>,
    {
        if let Some(value) = self.get(&key) {
            return Some(value);
        }
        let value = compute()?;
        self.put(key, value.clone());
        Some(value)
    }

    pub fn invalidate(&self, key: &K) {
        self.entries.remove(key);
    }

    /// Drop every expired entry, returning how many were removed
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.monotonic_time();
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.expires_at > now);
        before.saturating_sub(self.entries.len())
    }

    /// Stored entries, including expired ones not yet purged
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_secs_f64(self.ttl_secs)
    }
}

/// [`SingleFlight`] behind a TTL cache
///
/// ```rust
/// use admission_machines::{SystemClock, TtlSingleFlight};
/// use std::sync::Arc;
/// use std::time::Duration;
///
/// let loader: TtlSingleFlight<u32, String, std::io::Error> =
///     TtlSingleFlight::new(Duration::from_secs(30), Arc::new(SystemClock::new())).unwrap();
///
/// let first = loader.execute(7, || Ok("profile-7".to_string())).unwrap();
/// // Served from cache; this computation never runs
/// let second = loader.execute(7, || unreachable!()).unwrap();
/// assert_eq!(first, second);
/// ```
#[derive(Debug)]
pub struct TtlSingleFlight<K, V, E>
where
    K: Eq + Hash,
{
    cache: IdempotencyStore<K, V>,
    flights: SingleFlight<K, V, E>,
}

impl<K, V, E> TtlSingleFlight<K, V, E>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new(ttl: Duration, clock: Arc<dyn Clock>) -> Result<Self, ConfigError> {
        Ok(Self {
            cache: IdempotencyStore::new(ttl, clock)?,
            flights: SingleFlight::new(),
        })
    }

    /// Cached value for `key`, or the deduplicated result of `computation`
    ///
    /// Only successful results are cached; errors are shared with concurrent
    /// waiters and then forgotten.
    pub fn execute<F>(&self, key: K, computation: F) -> Result<V, Arc<E>>
    where
        F: FnOnce() -> Result<V, E>,
    {
        if let Some(value) = self.cache.get(&key) {
            tracing::trace!("ttl cache hit");
            return Ok(value);
        }

        let cache_key = key.clone();
        self.flights.execute(key, || {
            let value = computation()?;
            // Cache before the flight resolves so late arrivals hit the cache
            self.cache.put(cache_key, value.clone());
            Ok(value)
        })
    }

    /// The cached value, without computing
    pub fn get(&self, key: &K) -> Option<V> {
        self.cache.get(key)
    }

    pub fn invalidate(&self, key: &K) {
        self.cache.invalidate(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{ManualClock, SystemClock};
    use std::sync::Barrier;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    fn store(ttl_ms: u64) -> (IdempotencyStore<String, u32>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new());
        let store = IdempotencyStore::new(Duration::from_millis(ttl_ms), clock.clone()).unwrap();
        (store, clock)
    }

    #[test]
    fn test_put_get_and_expire() {
        let (store, clock) = store(1_000);
        store.put("req-1".into(), 200);

        assert_eq!(store.get(&"req-1".into()), Some(200));

        clock.advance(Duration::from_millis(1_000));
        assert_eq!(store.get(&"req-1".into()), None);
        assert!(store.is_empty(), "expired entry dropped on lookup");
    }

    #[test]
    fn test_put_replaces_entry_and_ttl() {
        let (store, clock) = store(1_000);
        store.put("k".into(), 1);
        clock.advance(Duration::from_millis(800));
        store.put("k".into(), 2);
        clock.advance(Duration::from_millis(800));

        assert_eq!(store.get(&"k".into()), Some(2));
    }

    #[test]
    fn test_none_is_not_cached() {
        let (store, _clock) = store(1_000);
        let calls = AtomicUsize::new(0);

        for _ in 0..3 {
            let value = store.get_or_insert_with("k".into(), || {
                calls.fetch_add(1, Ordering::SeqCst);
                None
            });
            assert_eq!(value, None);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(store.is_empty());
    }

    #[test]
    fn test_get_or_insert_with_caches_some() {
        let (store, _clock) = store(1_000);

        assert_eq!(store.get_or_insert_with("k".into(), || Some(5)), Some(5));
        assert_eq!(store.get_or_insert_with("k".into(), || Some(6)), Some(5));
    }

    #[test]
    fn test_purge_expired() {
        let (store, clock) = store(100);
        store.put("a".into(), 1);
        clock.advance(Duration::from_millis(60));
        store.put("b".into(), 2);
        clock.advance(Duration::from_millis(60));

        assert_eq!(store.purge_expired(), 1);
        assert_eq!(store.len(), 1);
        assert_eq!(store.get(&"b".into()), Some(2));
    }

    #[test]
    fn test_invalidate() {
        let (store, _clock) = store(1_000);
        store.put("k".into(), 1);
        store.invalidate(&"k".into());
        assert_eq!(store.get(&"k".into()), None);
    }

    #[test]
    fn test_rejects_zero_ttl() {
        let result = IdempotencyStore::<u8, u8>::new(Duration::ZERO, Arc::new(SystemClock::new()));
        assert!(result.is_err());
    }

    #[test]
    fn test_ttl_single_flight_hits_cache() {
        let clock = Arc::new(ManualClock::new());
        let loader: TtlSingleFlight<&str, u32, String> =
            TtlSingleFlight::new(Duration::from_secs(10), clock.clone()).unwrap();
        let calls = AtomicUsize::new(0);
        let load = || {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(99)
        };

        assert_eq!(loader.execute("k", load), Ok(99));
        assert_eq!(loader.execute("k", load), Ok(99));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        clock.advance(Duration::from_secs(10));
        assert_eq!(loader.execute("k", load), Ok(99));
        assert_eq!(calls.load(Ordering::SeqCst), 2, "expired entry recomputed");
    }

    #[test]
    fn test_ttl_single_flight_errors_not_cached() {
        let loader: TtlSingleFlight<&str, u32, String> =
            TtlSingleFlight::new(Duration::from_secs(10), Arc::new(ManualClock::new())).unwrap();

        let err = loader.execute("k", || Err("boom".to_string())).unwrap_err();
        assert_eq!(*err, "boom");
        assert_eq!(loader.get(&"k"), None);
        assert_eq!(loader.execute("k", || Ok(1)), Ok(1));
    }

    #[test]
    fn test_ttl_single_flight_dedups_concurrent_misses() {
        let loader: Arc<TtlSingleFlight<&str, u32, String>> = Arc::new(
            TtlSingleFlight::new(Duration::from_secs(60), Arc::new(SystemClock::new())).unwrap(),
        );
        let calls = Arc::new(AtomicUsize::new(0));
        let barrier = Arc::new(Barrier::new(5));

        let handles: Vec<_> = (0..5)
            .map(|_| {
                let loader = Arc::clone(&loader);
                let calls = Arc::clone(&calls);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    loader.execute("k", || {
                        calls.fetch_add(1, Ordering::SeqCst);
                        thread::sleep(Duration::from_millis(100));
                        Ok(3)
                    })
                })
            })
            .collect();

        for handle in handles {
            assert_eq!(handle.join().unwrap(), Ok(3));
        }
        assert!(calls.load(Ordering::SeqCst) <= 5);

        // Everything after the first resolution is a cache hit
        assert_eq!(loader.execute("k", || Ok(0)), Ok(3));
    }
}
