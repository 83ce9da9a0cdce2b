//! Bounded concurrency for one class of backend requests.
//!
//! One limiter exists per backend class (storage, orderer) and is shared
//! by every document service a factory produces, so storage-heavy load
//! cannot starve ordering traffic and vice versa.
//!
//! Admission is FIFO: the limiter is backed by a fair
//! [`tokio::sync::Semaphore`], whose wait queue hands permits out in the
//! order `acquire` was called. Work is delayed, never dropped.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::Semaphore;

use crate::error::{DriverError, Result};

/// Admission control for outbound requests.
#[derive(Debug)]
pub struct RateLimiter {
    semaphore: Arc<Semaphore>,
    max_concurrency: usize,
    waiting: AtomicUsize,
}

/// Decrements the waiting counter when the queued caller is admitted or
/// dropped while still queued.
struct WaitGuard<'a>(&'a AtomicUsize);

impl Drop for WaitGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

impl RateLimiter {
    /// Create a limiter admitting at most `max_concurrency` units at once.
    pub fn new(max_concurrency: usize) -> Result<Self> {
        if max_concurrency == 0 {
            return Err(DriverError::Configuration(
                "rate limiter concurrency must be at least 1".to_string(),
            ));
        }
        Ok(Self {
            semaphore: Arc::new(Semaphore::new(max_concurrency)),
            max_concurrency,
            waiting: AtomicUsize::new(0),
        })
    }

    /// Run `work` once a slot is free.
    ///
    /// The slot is released when `work` settles, whether it succeeded,
    /// failed, or was dropped mid-flight.
    pub async fn schedule<F, T>(&self, work: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let permit = {
            self.waiting.fetch_add(1, Ordering::Relaxed);
            let _queued = WaitGuard(&self.waiting);
            self.semaphore.acquire().await
        };
        let _permit = permit
            .map_err(|_| DriverError::Transport("request limiter closed".to_string()))?;
        work.await
    }

    /// Configured maximum concurrency.
    pub fn max_concurrency(&self) -> usize {
        self.max_concurrency
    }

    /// Units currently executing.
    pub fn active(&self) -> usize {
        self.max_concurrency - self.semaphore.available_permits()
    }

    /// Units queued for admission.
    pub fn waiting(&self) -> usize {
        self.waiting.load(Ordering::Relaxed)
    }
}
