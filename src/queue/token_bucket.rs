//! Token-bucket rate limiter shared by a queue's worker pool.
//!
//! Built on [`tokio::sync::Semaphore`] rather than a hand-rolled mutex plus
//! condvar: Tokio's semaphore already wakes waiters in FIFO order, which is
//! exactly the fairness the queue needs, and a background task tops the
//! permit count back up to `burst_size` at `rate_limit`-per-minute.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Raised when a permit acquisition is aborted by cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("rate limit permit acquisition canceled")]
pub struct AcquireCanceled;

pub struct TokenBucket {
    semaphore: Arc<Semaphore>,
    capacity: usize,
    refill_handle: Option<JoinHandle<()>>,
    waited_last_acquire: Arc<AtomicBool>,
}

impl TokenBucket {
    /// `capacity` is the burst size; `refill_per_minute` permits are added
    /// back (capped at `capacity`) every minute.
    pub fn new(capacity: usize, refill_per_minute: u32) -> Self {
        let capacity = capacity.max(1);
        let semaphore = Arc::new(Semaphore::new(capacity));
        let refill_handle = if refill_per_minute > 0 {
            let sem = semaphore.clone();
            let period = Duration::from_secs_f64(60.0 / refill_per_minute as f64);
            Some(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(period);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    ticker.tick().await;
                    if sem.available_permits() < capacity {
                        sem.add_permits(1);
                    }
                }
            }))
        } else {
            None
        };

        Self {
            semaphore,
            capacity,
            refill_handle,
            waited_last_acquire: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Acquire one permit, waiting (in FIFO order relative to other callers)
    /// until one is available or `cancel` fires.
    ///
    /// Returns whether the caller had to wait — callers use this to record
    /// the `rate_limit_waits` metric.
    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<bool, AcquireCanceled> {
        if self.semaphore.try_acquire().is_ok() {
            return Ok(false);
        }

        tokio::select! {
            permit = self.semaphore.acquire() => {
                permit.expect("semaphore never closed").forget();
                Ok(true)
            }
            _ = cancel.cancelled() => Err(AcquireCanceled),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Drop for TokenBucket {
    fn drop(&mut self) {
        if let Some(handle) = self.refill_handle.take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn acquire_does_not_wait_while_capacity_available() {
        let bucket = TokenBucket::new(2, 60);
        let cancel = CancellationToken::new();
        assert!(!bucket.acquire(&cancel).await.unwrap());
        assert!(!bucket.acquire(&cancel).await.unwrap());
    }

    #[tokio::test]
    async fn acquire_honors_cancellation_once_exhausted() {
        let bucket = TokenBucket::new(1, 0);
        let cancel = CancellationToken::new();
        assert!(!bucket.acquire(&cancel).await.unwrap());

        cancel.cancel();
        let result = bucket.acquire(&cancel).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn refill_task_replenishes_up_to_capacity() {
        let bucket = TokenBucket::new(1, 6000); // one permit every 10ms
        let cancel = CancellationToken::new();
        assert!(!bucket.acquire(&cancel).await.unwrap());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!bucket.acquire(&cancel).await.unwrap());
    }
}
