//! Size- and time-triggered request batching
//!
//! Keys are buffered until either `max_batch_size` is reached (the adding
//! call performs the flush and gets the results) or the flush interval
//! elapses (a background timer performs the flush). Every flush takes the
//! whole buffer under the buffer lock, so an item is delivered in exactly
//! one batch no matter which trigger wins.

use crate::errors::ConfigError;
use parking_lot::{Condvar, Mutex};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Sends one batch and returns one result per key, in order
pub type Transport<K, R> = Box<dyn Fn(&[K]) -> Vec<R> + Send + Sync>;

/// Observes timer-triggered flushes, which have no caller to return to
pub type FlushListener<K, R> = Arc<dyn Fn(&[K], &[R]) + Send + Sync>;

struct Inner<K, R> {
    buffer: Mutex<Vec<K>>,
    transport: Transport<K, R>,
    max_batch_size: usize,
    listener: Option<FlushListener<K, R>>,
    stopped: Mutex<bool>,
    stop_signal: Condvar,
}

impl<K, R> Inner<K, R> {
    fn take_all(&self) -> Vec<K> {
        std::mem::take(&mut *self.buffer.lock())
    }

    fn deliver(&self, batch: &[K]) -> Vec<R> {
        if batch.is_empty() {
            return Vec::new();
        }
        tracing::debug!(size = batch.len(), "flushing batch");
        (self.transport)(batch)
    }

    fn flush_on_timer(&self) {
        let batch = self.take_all();
        if batch.is_empty() {
            return;
        }
        let size = batch.len();
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            let results = self.deliver(&batch);
            if let Some(listener) = &self.listener {
                listener(&batch, &results);
            }
        }));
        if outcome.is_err() {
            tracing::error!(size, "timer flush panicked; batch dropped");
        }
    }

    /// Sleeps until the next tick; false once the batcher is stopped
    ///
    /// A `None` deadline (interval too large to represent) waits for stop only.
    fn wait_for_tick(&self, deadline: Option<Instant>) -> bool {
        let mut stopped = self.stopped.lock();
        while !*stopped {
            match deadline {
                Some(deadline) => {
                    if self.stop_signal.wait_until(&mut stopped, deadline).timed_out() {
                        break;
                    }
                }
                None => self.stop_signal.wait(&mut stopped),
            }
        }
        !*stopped
    }

    fn run_timer(&self, flush_interval: Duration) {
        let mut deadline = Instant::now().checked_add(flush_interval);
        while self.wait_for_tick(deadline) {
            self.flush_on_timer();
            // Skip ticks missed during a slow transport instead of bursting
            deadline = deadline
                .and_then(|d| d.checked_add(flush_interval))
                .map(|d| d.max(Instant::now()));
        }
    }
}

/// Buffers keys and sends them through a transport in batches
///
/// ```rust
/// use admission_machines::RequestBatcher;
/// use std::time::Duration;
///
/// let batcher = RequestBatcher::new(2, Duration::from_secs(60), |ids: &[u32]| {
///     ids.iter().map(|id| id * 10).collect()
/// })
/// .unwrap();
///
/// assert!(batcher.add_and_maybe_flush(1).is_empty());
/// assert_eq!(batcher.add_and_maybe_flush(2), vec![10, 20]);
/// ```
pub struct RequestBatcher<K, R> {
    inner: Arc<Inner<K, R>>,
    flush_interval: Duration,
    timer: Option<JoinHandle<()>>,
}

impl<K, R> RequestBatcher<K, R>
where
    K: Send + 'static,
    R: Send + 'static,
{
    /// Starts the flush timer immediately
    pub fn new<F>(
        max_batch_size: usize,
        flush_interval: Duration,
        transport: F,
    ) -> Result<Self, ConfigError>
    where
        F: Fn(&[K]) -> Vec<R> + Send + Sync + 'static,
    {
        Self::start(max_batch_size, flush_interval, Box::new(transport), None)
    }

    /// Like [`new`](Self::new), and `listener` receives `(batch, results)`
    /// for every timer-triggered flush
    ///
    /// The listener is in place before the timer starts, so no timer flush
    /// goes unobserved.
    pub fn with_flush_listener<F, L>(
        max_batch_size: usize,
        flush_interval: Duration,
        transport: F,
        listener: L,
    ) -> Result<Self, ConfigError>
    where
        F: Fn(&[K]) -> Vec<R> + Send + Sync + 'static,
        L: Fn(&[K], &[R]) + Send + Sync + 'static,
    {
        Self::start(
            max_batch_size,
            flush_interval,
            Box::new(transport),
            Some(Arc::new(listener)),
        )
    }

    fn start(
        max_batch_size: usize,
        flush_interval: Duration,
        transport: Transport<K, R>,
        listener: Option<FlushListener<K, R>>,
    ) -> Result<Self, ConfigError> {
        ConfigError::require_positive("max_batch_size", max_batch_size as f64)?;
        ConfigError::require_positive("flush_interval", flush_interval.as_secs_f64())?;

        let inner = Arc::new(Inner {
            buffer: Mutex::new(Vec::new()),
            transport,
            max_batch_size,
            listener,
            stopped: Mutex::new(false),
            stop_signal: Condvar::new(),
        });

        let timer = {
            let inner = Arc::clone(&inner);
            thread::spawn(move || inner.run_timer(flush_interval))
        };

        Ok(Self {
            inner,
            flush_interval,
            timer: Some(timer),
        })
    }

    /// Buffer `key`; flushes and returns the results if the batch is now full
    pub fn add_and_maybe_flush(&self, key: K) -> Vec<R> {
        let batch = {
            let mut buffer = self.inner.buffer.lock();
            buffer.push(key);
            if buffer.len() < self.inner.max_batch_size {
                return Vec::new();
            }
            std::mem::take(&mut *buffer)
        };
        self.inner.deliver(&batch)
    }

    /// Send whatever is buffered now; empty when nothing was buffered
    pub fn flush(&self) -> Vec<R> {
        let batch = self.inner.take_all();
        self.inner.deliver(&batch)
    }

    pub fn pending(&self) -> usize {
        self.inner.buffer.lock().len()
    }

    pub fn max_batch_size(&self) -> usize {
        self.inner.max_batch_size
    }

    pub fn flush_interval(&self) -> Duration {
        self.flush_interval
    }
}

impl<K, R> Drop for RequestBatcher<K, R> {
    /// Stops the timer. Items still buffered are not sent; call
    /// [`flush`](Self::flush) first to deliver them.
    fn drop(&mut self) {
        *self.inner.stopped.lock() = true;
        self.inner.stop_signal.notify_all();
        if let Some(timer) = self.timer.take() {
            let _ = timer.join();
        }
    }
}

impl<K, R> std::fmt::Debug for RequestBatcher<K, R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestBatcher")
            .field("max_batch_size", &self.inner.max_batch_size)
            .field("flush_interval", &self.flush_interval)
            .field("pending", &self.inner.buffer.lock().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;

    fn echo(ids: &[u32]) -> Vec<String> {
        ids.iter().map(|id| format!("r{id}")).collect()
    }

    #[test]
    fn test_size_triggered_flush_preserves_order() {
        let batcher = RequestBatcher::new(3, Duration::from_secs(60), echo).unwrap();

        assert!(batcher.add_and_maybe_flush(1).is_empty());
        assert!(batcher.add_and_maybe_flush(2).is_empty());
        assert_eq!(batcher.pending(), 2);

        assert_eq!(batcher.add_and_maybe_flush(3), vec!["r1", "r2", "r3"]);
        assert_eq!(batcher.pending(), 0);
    }

    #[test]
    fn test_timer_flushes_exactly_once() {
        let sends = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);

        let counted = Arc::clone(&sends);
        let batcher = RequestBatcher::with_flush_listener(
            10,
            Duration::from_millis(100),
            move |ids: &[u32]| {
                counted.fetch_add(1, Ordering::SeqCst);
                echo(ids)
            },
            move |batch: &[u32], results: &[String]| {
                let _ = tx.lock().send((batch.to_vec(), results.to_vec()));
            },
        )
        .unwrap();

        batcher.add_and_maybe_flush(4);
        batcher.add_and_maybe_flush(5);

        let (batch, results) = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(batch, vec![4, 5]);
        assert_eq!(results, vec!["r4", "r5"]);

        // Later ticks find an empty buffer and send nothing
        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
        assert_eq!(sends.load(Ordering::SeqCst), 1);
        assert_eq!(batcher.pending(), 0);
    }

    #[test]
    fn test_empty_flush_is_noop() {
        let sends = Arc::new(AtomicUsize::new(0));
        let counted = Arc::clone(&sends);
        let batcher = RequestBatcher::new(3, Duration::from_secs(60), move |ids: &[u32]| {
            counted.fetch_add(1, Ordering::SeqCst);
            echo(ids)
        })
        .unwrap();

        assert!(batcher.flush().is_empty());
        assert_eq!(sends.load(Ordering::SeqCst), 0);

        batcher.add_and_maybe_flush(9);
        assert_eq!(batcher.flush(), vec!["r9"]);
        assert_eq!(sends.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_concurrent_adds_delivered_once() {
        let delivered = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&delivered);
        let batcher = Arc::new(
            RequestBatcher::new(7, Duration::from_millis(5), move |ids: &[u32]| {
                sink.lock().extend_from_slice(ids);
                echo(ids)
            })
            .unwrap(),
        );

        let handles: Vec<_> = (0..8u32)
            .map(|t| {
                let batcher = Arc::clone(&batcher);
                thread::spawn(move || {
                    for i in 0..100 {
                        batcher.add_and_maybe_flush(t * 1_000 + i);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        batcher.flush();
        // Joins the timer, so no flush is still in progress
        drop(batcher);

        let delivered = delivered.lock();
        assert_eq!(delivered.len(), 800);
        let unique: HashSet<_> = delivered.iter().collect();
        assert_eq!(unique.len(), 800, "an item was sent twice");
    }

    #[test]
    fn test_rejects_invalid_config() {
        assert!(RequestBatcher::new(0, Duration::from_secs(1), echo).is_err());
        assert!(RequestBatcher::new(3, Duration::ZERO, echo).is_err());
    }

    #[test]
    fn test_timer_survives_panicking_transport() {
        let calls = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);

        let counted = Arc::clone(&calls);
        let batcher = RequestBatcher::with_flush_listener(
            10,
            Duration::from_millis(50),
            move |ids: &[u32]| {
                if counted.fetch_add(1, Ordering::SeqCst) == 0 {
                    panic!("transport down");
                }
                echo(ids)
            },
            move |batch: &[u32], _results: &[String]| {
                let _ = tx.lock().send(batch.to_vec());
            },
        )
        .unwrap();

        batcher.add_and_maybe_flush(1);
        thread::sleep(Duration::from_millis(200));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        batcher.add_and_maybe_flush(2);
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), vec![2]);
        assert_eq!(batcher.pending(), 0);
    }

    #[test]
    fn test_huge_size_and_interval_are_accepted() {
        let batcher = RequestBatcher::new(usize::MAX, Duration::MAX, echo).unwrap();

        assert!(batcher.add_and_maybe_flush(1).is_empty());
        assert!(batcher.add_and_maybe_flush(2).is_empty());
        assert_eq!(batcher.flush(), vec!["r1", "r2"]);

        // The timer waits for stop only and must still join promptly
        let start = Instant::now();
        drop(batcher);
        assert!(start.elapsed() < Duration::from_secs(1));
    }
}
