//! Rate-limited, back-pressured FIFO queue with a fixed worker pool.
//!
//! This is component E from the design: a bounded queue that owns its own
//! worker tasks, retries retryable failures with jittered exponential
//! backoff, and (optionally) throttles throughput through a [`TokenBucket`].
//! Each queue is independently lockable — there is no cross-queue locking.

mod token_bucket;

use std::cmp::Ordering as CmpOrdering;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use rand::Rng;
use thiserror::Error;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub use token_bucket::TokenBucket;

use crate::metrics::{MetricsSnapshot, QueueMetrics};

/// Priority tier for a queued item. Higher values are preferred, subject to
/// the anti-starvation aging rule in [`pick_ready_index`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum Priority {
    Low = 0,
    #[default]
    Normal = 1,
    High = 2,
}

/// Implemented by a processor's error type so the queue can decide whether
/// a failure is worth retrying.
pub trait Retryable {
    fn is_retryable(&self) -> bool;
    /// Short machine-readable kind, recorded in the job's error history.
    fn kind(&self) -> &'static str;
}

/// What a processor returned for an item it fully consumed.
pub enum Outcome<J> {
    /// The item was processed to completion (already forwarded to the next
    /// stage by the processor itself, if there is one).
    Done(J),
    /// The item was processed but deliberately not advanced (e.g. extracted
    /// text too short to classify).
    Skipped(J),
}

/// Pluggable unit of work bound to a queue at construction time. The queue
/// has no idea which pipeline stage it is serving.
#[async_trait]
pub trait Processor<J>: Send + Sync
where
    J: Send + 'static,
{
    type Error: Retryable + std::fmt::Display + Send + Sync + 'static;

    async fn process(&self, item: J) -> Result<Outcome<J>, (J, Self::Error)>;
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum QueueError {
    #[error("queue is full")]
    Full,
    #[error("queue is closed")]
    Closed,
}

/// Static configuration for a [`RateLimitedQueue`].
#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub name: String,
    pub queue_type: String,
    pub max_size: usize,
    pub worker_count: usize,
    pub process_timeout: Duration,
    pub retry_attempts: u32,
    pub retry_delay: Duration,
    pub enable_rate_limit: bool,
    /// Permits per minute, only meaningful when `enable_rate_limit` is set.
    pub rate_limit: u32,
    pub burst_size: usize,
    pub enable_metrics: bool,
}

impl QueueConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.max_size < 1 {
            return Err(format!("queue {}: max_size must be >= 1", self.name));
        }
        if self.worker_count < 1 {
            return Err(format!("queue {}: worker_count must be >= 1", self.name));
        }
        if self.enable_rate_limit && self.burst_size < 1 {
            return Err(format!(
                "queue {}: burst_size must be >= 1 when rate limiting is enabled",
                self.name
            ));
        }
        Ok(())
    }
}

struct QueueItem<J> {
    payload: J,
    priority: Priority,
    enqueued_at: Instant,
    attempt: u32,
    next_retry_at: Option<Instant>,
}

/// Pick the index of the best item to dequeue: the highest *effective*
/// priority among items whose retry delay has elapsed, breaking ties by
/// earliest enqueue time (FIFO). An item waiting more than 5x its base
/// retry delay is promoted to the top tier so low-priority work cannot
/// starve forever behind a stream of high-priority arrivals.
fn pick_ready_index<J>(items: &VecDeque<QueueItem<J>>, base_retry_delay: Duration) -> Option<usize> {
    let now = Instant::now();
    let aging_threshold = base_retry_delay.mul_f64(5.0);

    let mut best: Option<(usize, u8, Instant)> = None;
    for (idx, item) in items.iter().enumerate() {
        if let Some(next) = item.next_retry_at {
            if next > now {
                continue;
            }
        }
        let waited = now.saturating_duration_since(item.enqueued_at);
        let effective_priority = if waited > aging_threshold {
            Priority::High as u8
        } else {
            item.priority as u8
        };

        let better = match &best {
            None => true,
            Some((_, best_prio, best_time)) => {
                match effective_priority.cmp(best_prio) {
                    CmpOrdering::Greater => true,
                    CmpOrdering::Equal => item.enqueued_at < *best_time,
                    CmpOrdering::Less => false,
                }
            }
        };
        if better {
            best = Some((idx, effective_priority, item.enqueued_at));
        }
    }
    best.map(|(idx, _, _)| idx)
}

struct Shared<J> {
    items: Mutex<VecDeque<QueueItem<J>>>,
    notify: Notify,
    closed: std::sync::atomic::AtomicBool,
    in_flight: AtomicUsize,
    depth_high_water: AtomicI64,
    config: QueueConfig,
    metrics: QueueMetrics,
    bucket: Option<TokenBucket>,
}

/// A bounded FIFO queue with its own worker pool.
pub struct RateLimitedQueue<J>
where
    J: Send + 'static,
{
    shared: Arc<Shared<J>>,
    worker_handles: Mutex<Vec<JoinHandle<()>>>,
}

/// Point-in-time view of a queue's state, safe to read without blocking the
/// workers that produced it.
#[derive(Debug, Clone, serde::Serialize)]
pub struct QueueSnapshot {
    pub name: String,
    pub depth: usize,
    pub in_flight: usize,
    pub depth_high_water: i64,
    pub metrics: MetricsSnapshot,
}

impl<J> RateLimitedQueue<J>
where
    J: Send + 'static,
{
    pub fn new(config: QueueConfig) -> Result<Arc<Self>, String> {
        config.validate()?;
        let bucket = config
            .enable_rate_limit
            .then(|| TokenBucket::new(config.burst_size, config.rate_limit));

        let shared = Arc::new(Shared {
            items: Mutex::new(VecDeque::with_capacity(config.max_size.min(1024))),
            notify: Notify::new(),
            closed: std::sync::atomic::AtomicBool::new(false),
            in_flight: AtomicUsize::new(0),
            depth_high_water: AtomicI64::new(0),
            config,
            metrics: QueueMetrics::new(),
            bucket,
        });

        Ok(Arc::new(Self {
            shared,
            worker_handles: Mutex::new(Vec::new()),
        }))
    }

    pub fn name(&self) -> &str {
        &self.shared.config.name
    }

    /// Enqueue an item with normal priority. Returns `QueueFull` immediately
    /// (never blocks) if the queue is at `max_size`; `QueueClosed` after
    /// `stop` has been called.
    pub async fn enqueue(&self, payload: J) -> Result<(), QueueError> {
        self.enqueue_with_priority(payload, Priority::Normal).await
    }

    pub async fn enqueue_with_priority(
        &self,
        payload: J,
        priority: Priority,
    ) -> Result<(), QueueError> {
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(QueueError::Closed);
        }
        let mut items = self.shared.items.lock().await;
        if items.len() >= self.shared.config.max_size {
            return Err(QueueError::Full);
        }
        items.push_back(QueueItem {
            payload,
            priority,
            enqueued_at: Instant::now(),
            attempt: 0,
            next_retry_at: None,
        });
        let depth = items.len() as i64;
        drop(items);

        self.shared
            .depth_high_water
            .fetch_max(depth, Ordering::Relaxed);
        if self.shared.config.enable_metrics {
            self.shared.metrics.record_enqueued();
        }
        self.shared.notify.notify_one();
        Ok(())
    }

    /// Spawn `worker_count` worker tasks sharing this queue's FIFO.
    pub async fn start<P>(self: &Arc<Self>, processor: Arc<P>, cancel: CancellationToken)
    where
        P: Processor<J> + 'static,
    {
        let mut handles = self.worker_handles.lock().await;
        for worker_id in 0..self.shared.config.worker_count {
            let shared = self.shared.clone();
            let processor = processor.clone();
            let cancel = cancel.clone();
            handles.push(tokio::spawn(worker_loop(worker_id, shared, processor, cancel)));
        }
    }

    /// Stop accepting new work and wait up to `grace` for in-flight workers
    /// to finish. Workers still running after the grace period are aborted
    /// and counted as unresolved.
    pub async fn stop(&self, grace: Duration) -> usize {
        self.shared.closed.store(true, Ordering::Release);
        self.shared.notify.notify_waiters();

        let mut handles = self.worker_handles.lock().await;
        let deadline = tokio::time::Instant::now() + grace;
        let mut unresolved = 0;
        for handle in handles.drain(..) {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            match tokio::time::timeout(remaining, handle).await {
                Ok(_) => {}
                Err(_) => unresolved += 1,
            }
        }
        unresolved + self.shared.in_flight.load(Ordering::Acquire)
    }

    pub async fn snapshot(&self) -> QueueSnapshot {
        let depth = self.shared.items.lock().await.len();
        QueueSnapshot {
            name: self.shared.config.name.clone(),
            depth,
            in_flight: self.shared.in_flight.load(Ordering::Acquire),
            depth_high_water: self.shared.depth_high_water.load(Ordering::Relaxed),
            metrics: self.shared.metrics.snapshot().await,
        }
    }

    pub async fn is_empty(&self) -> bool {
        self.shared.items.lock().await.is_empty() && self.shared.in_flight.load(Ordering::Acquire) == 0
    }

    pub async fn live_worker_count(&self) -> usize {
        let handles = self.worker_handles.lock().await;
        handles.iter().filter(|h| !h.is_finished()).count()
    }
}

async fn worker_loop<J, P>(
    worker_id: usize,
    shared: Arc<Shared<J>>,
    processor: Arc<P>,
    cancel: CancellationToken,
) where
    J: Send + 'static,
    P: Processor<J>,
{
    loop {
        if cancel.is_cancelled() && shared.closed.load(Ordering::Acquire) {
            let items = shared.items.lock().await;
            if items.is_empty() {
                break;
            }
        }

        let item = {
            let mut items = shared.items.lock().await;
            match pick_ready_index(&items, shared.config.retry_delay) {
                Some(idx) => items.remove(idx),
                None => None,
            }
        };

        let Some(mut item) = item else {
            if shared.closed.load(Ordering::Acquire) && shared.items.lock().await.is_empty() {
                break;
            }
            tokio::select! {
                _ = shared.notify.notified() => continue,
                _ = tokio::time::sleep(Duration::from_millis(50)) => continue,
                _ = cancel.cancelled() => {
                    if shared.closed.load(Ordering::Acquire) {
                        continue;
                    }
                    break;
                }
            }
        };

        if shared.config.enable_metrics {
            shared.metrics.record_dequeued();
        }
        shared.in_flight.fetch_add(1, Ordering::AcqRel);

        if cancel.is_cancelled() {
            shared.in_flight.fetch_sub(1, Ordering::AcqRel);
            if shared.config.enable_metrics {
                shared.metrics.record_canceled();
            }
            debug!(worker_id, queue = %shared.config.name, "item canceled before running");
            continue;
        }

        if let Some(bucket) = &shared.bucket {
            match bucket.acquire(&cancel).await {
                Ok(waited) => {
                    if waited && shared.config.enable_metrics {
                        shared.metrics.record_rate_limit_wait();
                    }
                }
                Err(_) => {
                    shared.in_flight.fetch_sub(1, Ordering::AcqRel);
                    if shared.config.enable_metrics {
                        shared.metrics.record_canceled();
                    }
                    continue;
                }
            }
        }

        let started = Instant::now();
        let outcome = tokio::time::timeout(
            shared.config.process_timeout,
            processor.process(item.payload),
        )
        .await;

        shared.in_flight.fetch_sub(1, Ordering::AcqRel);

        match outcome {
            Ok(Ok(Outcome::Done(_payload))) => {
                if shared.config.enable_metrics {
                    shared.metrics.record_succeeded(started.elapsed()).await;
                }
            }
            Ok(Ok(Outcome::Skipped(_payload))) => {
                if shared.config.enable_metrics {
                    shared.metrics.record_skipped();
                }
            }
            Ok(Err((payload, error))) => {
                item.payload = payload;
                item.attempt += 1;
                if error.is_retryable() && item.attempt <= shared.config.retry_attempts {
                    let delay = backoff_with_jitter(shared.config.retry_delay, item.attempt);
                    item.next_retry_at = Some(Instant::now() + delay);
                    if shared.config.enable_metrics {
                        shared.metrics.record_retried();
                    }
                    warn!(
                        worker_id,
                        queue = %shared.config.name,
                        attempt = item.attempt,
                        delay_ms = delay.as_millis() as u64,
                        "retrying after {}",
                        error
                    );
                    shared.items.lock().await.push_back(item);
                    shared.notify.notify_one();
                } else {
                    if shared.config.enable_metrics {
                        shared.metrics.record_failed();
                    }
                    warn!(worker_id, queue = %shared.config.name, "terminal failure: {}", error);
                }
            }
            Err(_elapsed) => {
                if shared.config.enable_metrics {
                    shared.metrics.record_failed();
                }
                warn!(worker_id, queue = %shared.config.name, "item timed out");
            }
        }
    }
}

/// `delay = min(retry_delay * 1.5^attempt, 60s) * (1 + U[-0.1, 0.1])`.
fn backoff_with_jitter(base: Duration, attempt: u32) -> Duration {
    let exp = base.as_secs_f64() * 1.5f64.powi(attempt as i32);
    let capped = exp.min(60.0);
    let jitter = rand::thread_rng().gen_range(-0.1..=0.1);
    Duration::from_secs_f64((capped * (1.0 + jitter)).max(0.0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize as StdAtomicUsize;

    #[derive(Debug, thiserror::Error)]
    #[error("boom: {0}")]
    struct FakeError(String, bool);

    impl Retryable for FakeError {
        fn is_retryable(&self) -> bool {
            self.1
        }
        fn kind(&self) -> &'static str {
            "fake"
        }
    }

    struct CountingProcessor {
        seen: Arc<StdAtomicUsize>,
        fail_until: u32,
        retryable: bool,
    }

    #[async_trait]
    impl Processor<u32> for CountingProcessor {
        type Error = FakeError;
        async fn process(&self, item: u32) -> Result<Outcome<u32>, (u32, Self::Error)> {
            let count = self.seen.fetch_add(1, Ordering::SeqCst) as u32;
            if count < self.fail_until {
                return Err((item, FakeError("transient".into(), self.retryable)));
            }
            Ok(Outcome::Done(item))
        }
    }

    fn test_config(name: &str) -> QueueConfig {
        QueueConfig {
            name: name.to_string(),
            queue_type: "test".to_string(),
            max_size: 10,
            worker_count: 1,
            process_timeout: Duration::from_secs(1),
            retry_attempts: 3,
            retry_delay: Duration::from_millis(5),
            enable_rate_limit: false,
            rate_limit: 0,
            burst_size: 0,
            enable_metrics: true,
        }
    }

    #[tokio::test]
    async fn enqueue_rejects_when_full() {
        let cfg = QueueConfig {
            max_size: 1,
            ..test_config("q")
        };
        let queue = RateLimitedQueue::<u32>::new(cfg).unwrap();
        queue.enqueue(1).await.unwrap();
        assert_eq!(queue.enqueue(2).await, Err(QueueError::Full));
    }

    #[tokio::test]
    async fn enqueue_rejects_after_stop() {
        let queue = RateLimitedQueue::<u32>::new(test_config("q")).unwrap();
        let processor = Arc::new(CountingProcessor {
            seen: Arc::new(StdAtomicUsize::new(0)),
            fail_until: 0,
            retryable: false,
        });
        let cancel = CancellationToken::new();
        queue.start(processor, cancel.clone()).await;
        queue.stop(Duration::from_secs(1)).await;
        assert_eq!(queue.enqueue(1).await, Err(QueueError::Closed));
    }

    #[tokio::test]
    async fn happy_path_completes_and_counts_succeeded() {
        let queue = RateLimitedQueue::<u32>::new(test_config("q")).unwrap();
        let processor = Arc::new(CountingProcessor {
            seen: Arc::new(StdAtomicUsize::new(0)),
            fail_until: 0,
            retryable: false,
        });
        let cancel = CancellationToken::new();
        queue.start(processor, cancel.clone()).await;
        queue.enqueue(1).await.unwrap();

        for _ in 0..100 {
            if queue.is_empty().await {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let snap = queue.snapshot().await;
        assert_eq!(snap.metrics.succeeded, 1);
        assert_eq!(snap.metrics.failed, 0);
        queue.stop(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn retryable_failure_eventually_succeeds() {
        let queue = RateLimitedQueue::<u32>::new(test_config("q")).unwrap();
        let processor = Arc::new(CountingProcessor {
            seen: Arc::new(StdAtomicUsize::new(0)),
            fail_until: 2,
            retryable: true,
        });
        let cancel = CancellationToken::new();
        queue.start(processor, cancel.clone()).await;
        queue.enqueue(1).await.unwrap();

        for _ in 0..200 {
            if queue.is_empty().await {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let snap = queue.snapshot().await;
        assert_eq!(snap.metrics.succeeded, 1);
        assert_eq!(snap.metrics.retried, 2);
        queue.stop(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn terminal_failure_is_not_retried() {
        let queue = RateLimitedQueue::<u32>::new(test_config("q")).unwrap();
        let processor = Arc::new(CountingProcessor {
            seen: Arc::new(StdAtomicUsize::new(0)),
            fail_until: 100,
            retryable: false,
        });
        let cancel = CancellationToken::new();
        queue.start(processor, cancel.clone()).await;
        queue.enqueue(1).await.unwrap();

        for _ in 0..100 {
            if queue.is_empty().await {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let snap = queue.snapshot().await;
        assert_eq!(snap.metrics.failed, 1);
        assert_eq!(snap.metrics.retried, 0);
        queue.stop(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn backpressure_never_drops_items_under_concurrent_enqueue() {
        let cfg = QueueConfig {
            max_size: 2,
            worker_count: 1,
            ..test_config("q")
        };
        let queue = RateLimitedQueue::<u32>::new(cfg).unwrap();
        let processor = Arc::new(CountingProcessor {
            seen: Arc::new(StdAtomicUsize::new(0)),
            fail_until: 0,
            retryable: false,
        });
        let cancel = CancellationToken::new();
        queue.start(processor, cancel.clone()).await;

        let mut enqueued = 0;
        for i in 0..5u32 {
            loop {
                match queue.enqueue(i).await {
                    Ok(()) => {
                        enqueued += 1;
                        break;
                    }
                    Err(QueueError::Full) => {
                        tokio::time::sleep(Duration::from_millis(5)).await;
                    }
                    Err(QueueError::Closed) => panic!("unexpected close"),
                }
            }
        }
        assert_eq!(enqueued, 5);

        for _ in 0..200 {
            if queue.is_empty().await {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let snap = queue.snapshot().await;
        assert_eq!(snap.metrics.succeeded, 5);
        queue.stop(Duration::from_secs(1)).await;
    }

    #[test]
    fn backoff_is_capped_and_jittered_within_bounds() {
        let base = Duration::from_secs(2);
        for attempt in 1..10 {
            let d = backoff_with_jitter(base, attempt);
            assert!(d.as_secs_f64() <= 66.0);
        }
    }
}
