//! Component G: orchestrates the three queues end to end.

use std::collections::VecDeque;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::StreamExt;
use serde::Serialize;
use serde_json::json;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::Config;
use crate::hardware::HardwareProfile;
use crate::job::{Job, Stage};
use crate::manager::QueueManager;
use crate::queue::{Outcome, Processor, QueueError, QueueSnapshot, RateLimitedQueue, Retryable};
use crate::stages::{Classifier, ExtractionError, FileHint, Indexer, ObjectStore, TextExtractor};

const EXTRACTION_QUEUE: &str = "extraction";
const CLASSIFICATION_QUEUE: &str = "classification";
const INDEXING_QUEUE: &str = "indexing";

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);
const COMPLETION_POLL_INTERVAL: Duration = Duration::from_secs(5);
const ENQUEUE_BACKPRESSURE_RETRY: Duration = Duration::from_millis(200);
const STOP_GRACE: Duration = Duration::from_secs(10);

/// Final outcome of a `process_*` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Ok,
    Degraded,
    Canceled,
}

#[derive(Debug, Default)]
struct PipelineCounters {
    processed: AtomicU64,
    errors: AtomicU64,
    skipped: AtomicU64,
    enqueued: AtomicU64,
    recent_outcomes: Mutex<VecDeque<bool>>,
}

impl PipelineCounters {
    async fn record_terminal(&self, succeeded: bool, window: usize) {
        let mut recent = self.recent_outcomes.lock().await;
        recent.push_back(succeeded);
        while recent.len() > window {
            recent.pop_front();
        }
    }

    async fn failure_fraction(&self) -> f64 {
        let recent = self.recent_outcomes.lock().await;
        if recent.is_empty() {
            return 0.0;
        }
        let failures = recent.iter().filter(|ok| !**ok).count();
        failures as f64 / recent.len() as f64
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ProgressSnapshot {
    pub processed: u64,
    pub errors: u64,
    pub skipped: u64,
    pub canceled: u64,
    pub enqueued: u64,
    pub percent: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub healthy: bool,
    pub queues: HashMap<String, QueueSnapshot>,
}

/// Orchestrates extraction, classification, and indexing across three
/// independently rate-limited queues. Owns the processors bound to each
/// queue; callers only ever drive `process_all`/`process_batch`/`process_keys`.
pub struct PipelineCoordinator {
    object_store: Arc<dyn ObjectStore>,
    manager: Mutex<QueueManager<Job>>,
    extraction_processor: Arc<ExtractionProcessor>,
    classification_processor: Arc<ClassificationProcessor>,
    indexing_processor: Arc<IndexingProcessor>,
    counters: Arc<PipelineCounters>,
    failure_fraction_threshold: f64,
    listing_safety_cap: usize,
}

impl PipelineCoordinator {
    pub fn new(
        config: &Config,
        object_store: Arc<dyn ObjectStore>,
        classifier: Arc<dyn Classifier>,
        indexer: Arc<dyn Indexer>,
        extractor: Arc<TextExtractor>,
    ) -> Result<Arc<Self>, String> {
        let hardware = HardwareProfile::probe();
        let worker_counts = hardware.recommended_worker_counts();

        let mut manager: QueueManager<Job> = QueueManager::new();
        let extraction_queue = manager
            .create_queue(config.extraction_queue.to_queue_config(
                EXTRACTION_QUEUE,
                "extraction",
                worker_counts.extraction,
            ))
            .map_err(|e| e.to_string())?;
        let classification_queue = manager
            .create_queue(config.classification_queue.to_queue_config(
                CLASSIFICATION_QUEUE,
                "classification",
                worker_counts.classification,
            ))
            .map_err(|e| e.to_string())?;
        let indexing_queue = manager
            .create_queue(config.indexing_queue.to_queue_config(
                INDEXING_QUEUE,
                "indexing",
                worker_counts.indexing,
            ))
            .map_err(|e| e.to_string())?;

        let counters = Arc::new(PipelineCounters::default());
        let failure_window = config.failure_window;

        let indexing_processor = Arc::new(IndexingProcessor {
            indexer,
            counters: counters.clone(),
            failure_window,
        });
        let classification_processor = Arc::new(ClassificationProcessor {
            classifier,
            indexing_queue: indexing_queue.clone(),
            counters: counters.clone(),
            failure_window,
        });
        let extraction_processor = Arc::new(ExtractionProcessor {
            object_store: object_store.clone(),
            extractor,
            classification_queue: classification_queue.clone(),
            counters: counters.clone(),
            failure_window,
        });

        manager
            .bind_processor(EXTRACTION_QUEUE, extraction_processor.clone())
            .map_err(|e| e.to_string())?;
        manager
            .bind_processor(CLASSIFICATION_QUEUE, classification_processor.clone())
            .map_err(|e| e.to_string())?;
        manager
            .bind_processor(INDEXING_QUEUE, indexing_processor.clone())
            .map_err(|e| e.to_string())?;

        Ok(Arc::new(Self {
            object_store,
            manager: Mutex::new(manager),
            extraction_processor,
            classification_processor,
            indexing_processor,
            counters,
            failure_fraction_threshold: config.failure_fraction_threshold,
            listing_safety_cap: config.listing_safety_cap,
        }))
    }

    /// List everything in the store, enqueue, wait for completion.
    pub async fn process_all(self: &Arc<Self>, cancel: CancellationToken) -> RunStatus {
        self.run(cancel, None, None).await
    }

    /// Take the first `n` listings.
    pub async fn process_batch(self: &Arc<Self>, cancel: CancellationToken, n: usize) -> RunStatus {
        self.run(cancel, Some(n), None).await
    }

    /// Bypass listing entirely; use caller-supplied keys.
    pub async fn process_keys(self: &Arc<Self>, cancel: CancellationToken, keys: Vec<String>) -> RunStatus {
        self.run(cancel, None, Some(keys)).await
    }

    async fn run(
        self: &Arc<Self>,
        cancel: CancellationToken,
        limit: Option<usize>,
        explicit_keys: Option<Vec<String>>,
    ) -> RunStatus {
        {
            let mut manager = self.manager.lock().await;
            manager.start_all(cancel.clone()).await;
        }

        let started = Instant::now();
        let heartbeat = self.spawn_heartbeat(cancel.clone());

        let total_enqueued = self.feed(cancel.clone(), limit, explicit_keys).await;

        let status = self.wait_for_completion(cancel.clone()).await;
        heartbeat.abort();

        let unresolved = {
            let mut manager = self.manager.lock().await;
            manager.stop_all(STOP_GRACE).await
        };
        if unresolved > 0 {
            warn!(unresolved, "pipeline stopped with unresolved in-flight items");
        }

        let canceled = self.canceled_total().await;
        info!(
            total_enqueued,
            processed = self.counters.processed.load(Ordering::Relaxed),
            errors = self.counters.errors.load(Ordering::Relaxed),
            skipped = self.counters.skipped.load(Ordering::Relaxed),
            canceled,
            elapsed_secs = started.elapsed().as_secs_f64(),
            status = ?status,
            "pipeline run finished"
        );

        status
    }

    /// Sum of `canceled` across every queue's metrics. A worker records this
    /// when it pulls an item but finds the run already canceled before
    /// handing it to the processor — the coordinator has no other way to
    /// observe it, since a canceled item never reaches a `Processor::process`
    /// call that could bump `self.counters` directly.
    async fn canceled_total(&self) -> u64 {
        let manager = self.manager.lock().await;
        let snapshot = manager.aggregate_snapshot().await;
        drop(manager);
        snapshot.values().map(|s| s.metrics.canceled).sum()
    }

    async fn feed(
        &self,
        cancel: CancellationToken,
        limit: Option<usize>,
        explicit_keys: Option<Vec<String>>,
    ) -> u64 {
        let mut enqueued = 0usize;

        if let Some(keys) = explicit_keys {
            for key in keys {
                if cancel.is_cancelled() {
                    break;
                }
                if self.enqueue_with_backpressure(&cancel, key).await.is_ok() {
                    enqueued += 1;
                }
                if limit.map(|n| enqueued >= n).unwrap_or(false) {
                    break;
                }
            }
            return self.counters.enqueued.load(Ordering::Relaxed);
        }

        let mut stream = match self.object_store.list("").await {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "initial listing failed");
                return 0;
            }
        };

        while let Some(item) = stream.next().await {
            if cancel.is_cancelled() {
                break;
            }
            if enqueued >= self.listing_safety_cap {
                warn!(cap = self.listing_safety_cap, "listing safety cap reached; truncating run");
                break;
            }
            match item {
                Ok(meta) => {
                    if self.enqueue_with_backpressure(&cancel, meta.path).await.is_ok() {
                        enqueued += 1;
                    }
                }
                Err(e) => {
                    warn!(error = %e, "listing entry failed");
                }
            }
            if limit.map(|n| enqueued >= n).unwrap_or(false) {
                break;
            }
        }

        self.counters.enqueued.load(Ordering::Relaxed)
    }

    async fn enqueue_with_backpressure(&self, cancel: &CancellationToken, key: String) -> Result<(), ()> {
        let job = Job::new(key.clone(), key);
        loop {
            if cancel.is_cancelled() {
                return Err(());
            }
            let manager = self.manager.lock().await;
            let result = manager.enqueue(EXTRACTION_QUEUE, job.clone()).await;
            drop(manager);
            match result {
                Ok(()) => {
                    self.counters.enqueued.fetch_add(1, Ordering::Relaxed);
                    return Ok(());
                }
                Err(_) => {
                    tokio::select! {
                        _ = tokio::time::sleep(ENQUEUE_BACKPRESSURE_RETRY) => continue,
                        _ = cancel.cancelled() => return Err(()),
                    }
                }
            }
        }
    }

    fn spawn_heartbeat(self: &Arc<Self>, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let snapshot = this.progress_snapshot().await;
                        info!(
                            processed = snapshot.processed,
                            errors = snapshot.errors,
                            skipped = snapshot.skipped,
                            percent = snapshot.percent,
                            "pipeline heartbeat"
                        );
                    }
                    _ = cancel.cancelled() => break,
                }
            }
        })
    }

    async fn wait_for_completion(&self, cancel: CancellationToken) -> RunStatus {
        loop {
            if cancel.is_cancelled() {
                return RunStatus::Canceled;
            }
            let failure_fraction = self.counters.failure_fraction().await;
            if failure_fraction > self.failure_fraction_threshold {
                warn!(failure_fraction, "failure-fraction threshold exceeded; run degraded");
                return RunStatus::Degraded;
            }
            let manager = self.manager.lock().await;
            let done = manager.all_empty().await;
            drop(manager);
            if done {
                return RunStatus::Ok;
            }
            tokio::select! {
                _ = tokio::time::sleep(COMPLETION_POLL_INTERVAL) => {}
                _ = cancel.cancelled() => return RunStatus::Canceled,
            }
        }
    }

    pub async fn progress_snapshot(&self) -> ProgressSnapshot {
        let enqueued = self.counters.enqueued.load(Ordering::Relaxed);
        let processed = self.counters.processed.load(Ordering::Relaxed);
        let errors = self.counters.errors.load(Ordering::Relaxed);
        let skipped = self.counters.skipped.load(Ordering::Relaxed);
        let canceled = self.canceled_total().await;
        let done = processed + errors + skipped + canceled;
        let percent = if enqueued == 0 {
            100.0
        } else {
            (done as f64 / enqueued as f64) * 100.0
        };
        ProgressSnapshot {
            processed,
            errors,
            skipped,
            canceled,
            enqueued,
            percent,
        }
    }

    pub async fn health(&self) -> HealthReport {
        let manager = self.manager.lock().await;
        HealthReport {
            healthy: manager.is_healthy().await,
            queues: manager.aggregate_snapshot().await,
        }
    }
}

/// Component B bound to the extraction queue: reads bytes, extracts text,
/// forwards to the classification queue itself.
pub struct ExtractionProcessor {
    object_store: Arc<dyn ObjectStore>,
    extractor: Arc<TextExtractor>,
    classification_queue: Arc<RateLimitedQueue<Job>>,
    counters: Arc<PipelineCounters>,
    failure_window: usize,
}

#[async_trait]
impl Processor<Job> for ExtractionProcessor {
    type Error = ExtractionError;

    async fn process(&self, mut job: Job) -> Result<Outcome<Job>, (Job, Self::Error)> {
        job.record_attempt(Stage::Extraction);

        let bytes = match self.object_store.get(&job.document_key).await {
            Ok(bytes) => bytes,
            Err(e) => {
                job.record_error(Stage::Extraction, "object_store", e.to_string());
                if !e.is_retryable() {
                    self.counters.errors.fetch_add(1, Ordering::Relaxed);
                    self.counters.record_terminal(false, self.failure_window).await;
                    return Err((job, ExtractionError::Corrupt(e.to_string())));
                }
                return Err((job, ExtractionError::TransientIO(e.to_string())));
            }
        };

        let hint = FileHint {
            filename: job.document_key.clone(),
            content_type: None,
        };

        let result = match self.extractor.extract(&bytes, &hint).await {
            Ok(r) => r,
            Err(e) => {
                job.record_error(Stage::Extraction, e.kind(), e.to_string());
                if !e.is_retryable() {
                    self.counters.errors.fetch_add(1, Ordering::Relaxed);
                    self.counters.record_terminal(false, self.failure_window).await;
                }
                return Err((job, e));
            }
        };

        job.extracted_text = Some(result.text);
        job.extracted_metadata = result.metadata;
        job.clear_bytes();

        if !job.has_classifiable_text() {
            self.counters.skipped.fetch_add(1, Ordering::Relaxed);
            self.counters.record_terminal(true, self.failure_window).await;
            return Ok(Outcome::Skipped(job));
        }

        let job_id = job.id.clone();
        match self.classification_queue.enqueue(job).await {
            Ok(()) => Ok(Outcome::Done(Job::new(job_id.clone(), job_id))),
            Err(QueueError::Full) => Err((
                Job::new(job_id.clone(), job_id),
                ExtractionError::TransientIO("classification queue full".to_string()),
            )),
            Err(QueueError::Closed) => Err((
                Job::new(job_id.clone(), job_id),
                ExtractionError::TransientIO("classification queue closed".to_string()),
            )),
        }
    }
}

/// Component C bound to the classification queue.
pub struct ClassificationProcessor {
    classifier: Arc<dyn Classifier>,
    indexing_queue: Arc<RateLimitedQueue<Job>>,
    counters: Arc<PipelineCounters>,
    failure_window: usize,
}

#[async_trait]
impl Processor<Job> for ClassificationProcessor {
    type Error = crate::stages::classifier::ClassifierError;

    async fn process(&self, mut job: Job) -> Result<Outcome<Job>, (Job, Self::Error)> {
        job.record_attempt(Stage::Classification);

        let text = job.extracted_text.clone().unwrap_or_default();
        let classification = match self.classifier.classify(&text, &job.extracted_metadata).await {
            Ok(c) => c,
            Err(e) => {
                job.record_error(Stage::Classification, e.kind(), e.to_string());
                if !e.is_retryable() {
                    self.counters.errors.fetch_add(1, Ordering::Relaxed);
                    self.counters.record_terminal(false, self.failure_window).await;
                }
                return Err((job, e));
            }
        };

        job.classification = Some(classification);
        let job_id = job.id.clone();

        match self.indexing_queue.enqueue(job).await {
            Ok(()) => Ok(Outcome::Done(Job::new(job_id.clone(), job_id))),
            Err(_) => Err((
                Job::new(job_id.clone(), job_id),
                crate::stages::classifier::ClassifierError::Connection("indexing queue unavailable".to_string()),
            )),
        }
    }
}

/// Component D bound to the indexing queue: the pipeline's terminal stage.
pub struct IndexingProcessor {
    indexer: Arc<dyn Indexer>,
    counters: Arc<PipelineCounters>,
    failure_window: usize,
}

#[async_trait]
impl Processor<Job> for IndexingProcessor {
    type Error = crate::stages::indexer::IndexError;

    async fn process(&self, mut job: Job) -> Result<Outcome<Job>, (Job, Self::Error)> {
        job.record_attempt(Stage::Indexing);

        let doc = json!({
            "document_key": job.document_key,
            "extracted_text": job.extracted_text,
            "classification": job.classification,
        });

        match self.indexer.index(&job.id, &doc).await {
            Ok(_doc_id) => {
                self.counters.processed.fetch_add(1, Ordering::Relaxed);
                self.counters.record_terminal(true, self.failure_window).await;
                Ok(Outcome::Done(job))
            }
            Err(e) => {
                job.record_error(Stage::Indexing, e.kind(), e.to_string());
                if !e.is_retryable() {
                    self.counters.errors.fetch_add(1, Ordering::Relaxed);
                    self.counters.record_terminal(false, self.failure_window).await;
                }
                Err((job, e))
            }
        }
    }
}
