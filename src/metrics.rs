//! Queue metrics: monotonic counters plus a bounded latency/throughput window.
//!
//! Counters are lock-free atomics; the latency window is the one piece of
//! queue state that needs a lock, so it is kept small and cheap to copy out.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

/// How many recent latencies to retain for percentile estimates.
const LATENCY_WINDOW_CAPACITY: usize = 1000;

#[derive(Debug, Default)]
pub struct QueueMetrics {
    enqueued: AtomicU64,
    dequeued: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    retried: AtomicU64,
    skipped: AtomicU64,
    canceled: AtomicU64,
    rate_limit_waits: AtomicU64,
    latencies: Mutex<LatencyWindow>,
}

#[derive(Debug, Default)]
struct LatencyWindow {
    samples: VecDeque<Duration>,
    // (instant, count) pairs within the last 60s, for throughput.
    completions: VecDeque<Instant>,
}

/// An immutable copy of [`QueueMetrics`] safe to hand to external observers.
/// Readers of a snapshot never block writers of the live metrics.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct MetricsSnapshot {
    pub enqueued: u64,
    pub dequeued: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub retried: u64,
    pub skipped: u64,
    pub canceled: u64,
    pub rate_limit_waits: u64,
    pub p50_latency_ms: u64,
    pub p99_latency_ms: u64,
    pub throughput_per_60s: u64,
}

impl QueueMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_enqueued(&self) {
        self.enqueued.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dequeued(&self) {
        self.dequeued.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_retried(&self) {
        self.retried.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_skipped(&self) {
        self.skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_canceled(&self) {
        self.canceled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rate_limit_wait(&self) {
        self.rate_limit_waits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a successful completion along with its processing latency.
    pub async fn record_succeeded(&self, latency: Duration) {
        self.succeeded.fetch_add(1, Ordering::Relaxed);
        let mut window = self.latencies.lock().await;
        window.samples.push_back(latency);
        if window.samples.len() > LATENCY_WINDOW_CAPACITY {
            window.samples.pop_front();
        }
        let now = Instant::now();
        window.completions.push_back(now);
        while let Some(front) = window.completions.front() {
            if now.duration_since(*front) > Duration::from_secs(60) {
                window.completions.pop_front();
            } else {
                break;
            }
        }
    }

    pub async fn snapshot(&self) -> MetricsSnapshot {
        let (p50, p99, throughput) = {
            let window = self.latencies.lock().await;
            let mut sorted: Vec<Duration> = window.samples.iter().copied().collect();
            sorted.sort_unstable();
            let percentile = |p: f64| -> u64 {
                if sorted.is_empty() {
                    return 0;
                }
                let idx = ((sorted.len() as f64 - 1.0) * p).round() as usize;
                sorted[idx].as_millis() as u64
            };
            (
                percentile(0.50),
                percentile(0.99),
                window.completions.len() as u64,
            )
        };

        MetricsSnapshot {
            enqueued: self.enqueued.load(Ordering::Relaxed),
            dequeued: self.dequeued.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            canceled: self.canceled.load(Ordering::Relaxed),
            rate_limit_waits: self.rate_limit_waits.load(Ordering::Relaxed),
            p50_latency_ms: p50,
            p99_latency_ms: p99,
            throughput_per_60s: throughput,
        }
    }
}
