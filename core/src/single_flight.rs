//! Request deduplication ("single-flight")
//!
//! Concurrent callers asking for the same key share one computation: the
//! first caller (the leader) runs it, the rest block until it resolves and
//! receive the same outcome. The key is evicted the moment the leader
//! resolves, so a later call always starts a fresh computation.
//!
//! Errors are shared as `Arc<E>`: every caller sees the very same error
//! value. A panic in the computation is re-raised in the leader with its
//! original payload and in every follower with the same message.

use parking_lot::{Condvar, Mutex};
use std::any::Any;
use std::collections::HashMap;
use std::hash::Hash;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

#[derive(Debug)]
enum Outcome<V, E> {
    Value(V),
    Error(Arc<E>),
    Panicked(String),
}

impl<V: Clone, E> Clone for Outcome<V, E> {
    fn clone(&self) -> Self {
        match self {
            Outcome::Value(v) => Outcome::Value(v.clone()),
            Outcome::Error(e) => Outcome::Error(Arc::clone(e)),
            Outcome::Panicked(msg) => Outcome::Panicked(msg.clone()),
        }
    }
}

/// Single-assignment result cell with any number of waiters
#[derive(Debug)]
struct Flight<V, E> {
    outcome: Mutex<Option<Outcome<V, E>>>,
    resolved: Condvar,
}

impl<V: Clone, E> Flight<V, E> {
    fn new() -> Self {
        Self {
            outcome: Mutex::new(None),
            resolved: Condvar::new(),
        }
    }

    fn is_resolved(&self) -> bool {
        self.outcome.lock().is_some()
    }

    fn resolve(&self, outcome: Outcome<V, E>) {
        let mut slot = self.outcome.lock();
        debug_assert!(slot.is_none(), "flight resolved twice");
        *slot = Some(outcome);
        self.resolved.notify_all();
    }

    fn wait(&self) -> Outcome<V, E> {
        let mut slot = self.outcome.lock();
        loop {
            if let Some(outcome) = slot.as_ref() {
                return outcome.clone();
            }
            self.resolved.wait(&mut slot);
        }
    }
}

enum Role<V, E> {
    Leader(Arc<Flight<V, E>>),
    Follower(Arc<Flight<V, E>>),
}

/// Deduplicates concurrent computations by key
///
/// # Example
///
/// ```rust
/// use admission_machines::SingleFlight;
///
/// let group: SingleFlight<&str, u64, String> = SingleFlight::new();
/// let value = group.execute("user:42", || Ok(42)).unwrap();
/// assert_eq!(value, 42);
/// assert_eq!(group.in_flight(), 0);
/// ```
pub struct SingleFlight<K, V, E> {
    flights: Mutex<HashMap<K, Arc<Flight<V, E>>>>,
}

impl<K, V, E> SingleFlight<K, V, E>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new() -> Self {
        Self {
            flights: Mutex::new(HashMap::new()),
        }
    }

    /// Run `computation` for `key`, or wait for the run already in progress
    ///
    /// Exactly one of any set of overlapping callers runs `computation`; the
    /// others block without spinning and receive a clone of its value or the
    /// same `Arc` of its error.
    pub fn execute<F>(&self, key: K, computation: F) -> Result<V, Arc<E>>
    where
        F: FnOnce() -> Result<V, E>,
    {
        match self.join(&key) {
            Role::Follower(flight) => {
                tracing::trace!("joining in-flight computation");
                Self::unpack(flight.wait())
            }
            Role::Leader(flight) => self.lead(key, flight, computation),
        }
    }

    /// Keys with a computation currently pending
    pub fn in_flight(&self) -> usize {
        self.flights.lock().len()
    }

    fn join(&self, key: &K) -> Role<V, E> {
        let mut flights = self.flights.lock();

        // A resolved handle still registered is stale: replace it so the
        // caller starts fresh instead of replaying an old outcome.
        if let Some(existing) = flights.get(key) {
            if !existing.is_resolved() {
                return Role::Follower(Arc::clone(existing));
            }
        }

        let flight = Arc::new(Flight::new());
        flights.insert(key.clone(), Arc::clone(&flight));
        Role::Leader(flight)
    }

    fn lead<F>(&self, key: K, flight: Arc<Flight<V, E>>, computation: F) -> Result<V, Arc<E>>
    where
        F: FnOnce() -> Result<V, E>,
    {
        let result = panic::catch_unwind(AssertUnwindSafe(computation));

        // Evict before resolving: once followers wake, the key is already free.
        {
            let mut flights = self.flights.lock();
            if flights
                .get(&key)
                .is_some_and(|current| Arc::ptr_eq(current, &flight))
            {
                flights.remove(&key);
            }
        }

        match result {
            Ok(Ok(value)) => {
                flight.resolve(Outcome::Value(value.clone()));
                Ok(value)
            }
            Ok(Err(error)) => {
                let error = Arc::new(error);
                flight.resolve(Outcome::Error(Arc::clone(&error)));
                Err(error)
            }
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                tracing::warn!(%message, "single-flight computation panicked");
                flight.resolve(Outcome::Panicked(message));
                panic::resume_unwind(payload)
            }
        }
    }

    fn unpack(outcome: Outcome<V, E>) -> Result<V, Arc<E>> {
        match outcome {
            Outcome::Value(value) => Ok(value),
            Outcome::Error(error) => Err(error),
            Outcome::Panicked(message) => panic::resume_unwind(Box::new(message)),
        }
    }
}

impl<K, V, E> Default for SingleFlight<K, V, E>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V, E> std::fmt::Debug for SingleFlight<K, V, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SingleFlight")
            .field("in_flight", &self.flights.lock().len())
            .finish()
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "computation panicked".to_string()
    }
}
