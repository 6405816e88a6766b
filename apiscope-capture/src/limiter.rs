//! Bounded worker pool for response processing.
//!
//! At most `capacity` submitted tasks execute at once; the rest queue FIFO
//! on the semaphore. Task failures surface on the task's own handle and
//! never poison the limiter. `drain` resolves once every submitted task has
//! finished, including panicked ones.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use apiscope_common::ScopeError;
use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinHandle;

pub struct ConcurrencyLimiter {
    permits: Arc<Semaphore>,
    running: Arc<AtomicUsize>,
    pending: Arc<AtomicUsize>,
    outstanding: Arc<AtomicUsize>,
    idle: Arc<Notify>,
}

/// Decrements a counter when the task ends, however it ends.
struct CountGuard {
    counter: Arc<AtomicUsize>,
    idle: Option<Arc<Notify>>,
}

impl Drop for CountGuard {
    fn drop(&mut self) {
        let prior = self.counter.fetch_sub(1, Ordering::AcqRel);
        if prior == 1 {
            if let Some(idle) = &self.idle {
                idle.notify_waiters();
            }
        }
    }
}

impl ConcurrencyLimiter {
    /// A capacity of zero is a configuration error, not a silent no-op.
    ///
    /// ```
    /// use apiscope_capture::limiter::ConcurrencyLimiter;
    ///
    /// assert!(ConcurrencyLimiter::new(0).is_err());
    /// let limiter = ConcurrencyLimiter::new(4).unwrap();
    /// assert_eq!(limiter.running(), 0);
    /// assert_eq!(limiter.pending(), 0);
    /// ```
    pub fn new(capacity: usize) -> Result<Self, ScopeError> {
        if capacity == 0 {
            return Err(ScopeError::Config(
                "maxConcurrentCaptures must be at least 1".into(),
            ));
        }
        Ok(Self {
            permits: Arc::new(Semaphore::new(capacity)),
            running: Arc::new(AtomicUsize::new(0)),
            pending: Arc::new(AtomicUsize::new(0)),
            outstanding: Arc::new(AtomicUsize::new(0)),
            idle: Arc::new(Notify::new()),
        })
    }

    /// Queue one unit of work. The returned handle resolves with the task's
    /// result; a panic inside the task surfaces there as a join error.
    pub fn submit<F, T>(&self, task: F) -> JoinHandle<T>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        self.outstanding.fetch_add(1, Ordering::AcqRel);
        self.pending.fetch_add(1, Ordering::AcqRel);

        let permits = self.permits.clone();
        let running = self.running.clone();
        let pending = self.pending.clone();
        let outstanding_guard = CountGuard {
            counter: self.outstanding.clone(),
            idle: Some(self.idle.clone()),
        };

        tokio::spawn(async move {
            let _outstanding = outstanding_guard;
            // The semaphore lives as long as the limiter and is never closed.
            let _permit = permits
                .acquire_owned()
                .await
                .expect("limiter semaphore closed");
            pending.fetch_sub(1, Ordering::AcqRel);
            running.fetch_add(1, Ordering::AcqRel);
            let _running = CountGuard {
                counter: running.clone(),
                idle: None,
            };
            task.await
        })
    }

    /// Wait until every submitted task has finished.
    pub async fn drain(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            // Register before the check so a notify between the load and the
            // await cannot be lost.
            notified.as_mut().enable();
            if self.outstanding.load(Ordering::Acquire) == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Tasks currently executing. Observers accept stale reads.
    pub fn running(&self) -> usize {
        self.running.load(Ordering::Acquire)
    }

    /// Tasks waiting for a permit.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }
}
