//! End-to-end pipeline scenarios driven through fake `ObjectStore`,
//! `Classifier`, and `Indexer` implementations — no real network calls.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, BoxStream};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use lexpipe::config::{ClassifierSettings, Config, IndexerSettings, ObjectStoreSettings, QueueSettings};
use lexpipe::coordinator::RunStatus;
use lexpipe::job::{Classification, ExtractedMetadata};
use lexpipe::stages::{
    Classifier, ClassifierError, IndexError, Indexer, ObjectMeta, ObjectStore, ObjectStoreError, TextExtractor,
};
use lexpipe::PipelineCoordinator;

fn test_config() -> Config {
    Config {
        object_store: ObjectStoreSettings {
            base_url: "http://fake".into(),
            bearer_token: None,
        },
        classifier: ClassifierSettings {
            endpoint: "http://fake".into(),
            model: "fake".into(),
            auth_token: None,
        },
        indexer: IndexerSettings {
            base_url: "http://fake".into(),
            index_name: "documents".into(),
            auth_token: None,
        },
        extraction_queue: small_queue(),
        classification_queue: small_queue(),
        indexing_queue: small_queue(),
        failure_fraction_threshold: 0.5,
        failure_window: 20,
        listing_safety_cap: 100_000,
    }
}

fn small_queue() -> QueueSettings {
    QueueSettings {
        worker_count: Some(2),
        process_timeout_secs: 5,
        retry_attempts: 3,
        retry_delay_secs: 0,
        ..QueueSettings::default()
    }
}

#[derive(Clone)]
struct FakeObjectStore {
    documents: Arc<HashMap<String, Vec<u8>>>,
}

impl FakeObjectStore {
    fn new(documents: Vec<(&str, &str)>) -> Self {
        let documents = documents
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.as_bytes().to_vec()))
            .collect();
        Self {
            documents: Arc::new(documents),
        }
    }
}

#[async_trait]
impl ObjectStore for FakeObjectStore {
    async fn list(
        &self,
        _prefix: &str,
    ) -> Result<BoxStream<'static, Result<ObjectMeta, ObjectStoreError>>, ObjectStoreError> {
        let entries: Vec<Result<ObjectMeta, ObjectStoreError>> = self
            .documents
            .keys()
            .map(|path| {
                Ok(ObjectMeta {
                    path: path.clone(),
                    size: self.documents[path].len() as u64,
                    modified: chrono::Utc::now(),
                })
            })
            .collect();
        Ok(Box::pin(stream::iter(entries)))
    }

    async fn get(&self, path: &str) -> Result<Vec<u8>, ObjectStoreError> {
        self.documents
            .get(path)
            .cloned()
            .ok_or_else(|| ObjectStoreError::NotFound(path.to_string()))
    }
}

struct FakeClassifier {
    calls: AtomicUsize,
    fail_calls: usize,
}

impl FakeClassifier {
    fn new(fail_calls: usize) -> Self {
        Self {
            calls: AtomicUsize::new(0),
            fail_calls,
        }
    }
}

#[async_trait]
impl Classifier for FakeClassifier {
    async fn classify(&self, text: &str, _metadata: &ExtractedMetadata) -> Result<Classification, ClassifierError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.fail_calls {
            return Err(ClassifierError::RateLimited("slow down".into()));
        }
        Ok(Classification::new(
            "order".into(),
            "civil".into(),
            format!("summary of: {}", &text[..text.len().min(20)]),
            0.9,
        ))
    }
}

/// Classifies successfully but never instantly — gives a cancellation test
/// room to land mid-run instead of racing a no-op classifier to completion.
struct SlowClassifier {
    delay: Duration,
}

#[async_trait]
impl Classifier for SlowClassifier {
    async fn classify(&self, text: &str, _metadata: &ExtractedMetadata) -> Result<Classification, ClassifierError> {
        tokio::time::sleep(self.delay).await;
        Ok(Classification::new(
            "order".into(),
            "civil".into(),
            format!("summary of: {}", &text[..text.len().min(20)]),
            0.9,
        ))
    }
}

struct RejectingClassifier;

#[async_trait]
impl Classifier for RejectingClassifier {
    async fn classify(&self, _text: &str, _metadata: &ExtractedMetadata) -> Result<Classification, ClassifierError> {
        Err(ClassifierError::BadRequest("malformed prompt".into()))
    }
}

#[derive(Default)]
struct FakeIndexer {
    indexed: Mutex<Vec<String>>,
}

#[async_trait]
impl Indexer for FakeIndexer {
    async fn index(&self, id: &str, _doc: &Value) -> Result<String, IndexError> {
        let sanitized: String = id.chars().map(|c| if c == '/' || c == '\\' { '_' } else { c }).collect();
        self.indexed.lock().unwrap().push(sanitized.clone());
        Ok(sanitized)
    }

    async fn bulk_index(&self, _docs: &[(String, Value)]) -> Result<Vec<lexpipe::stages::BulkItemResult>, IndexError> {
        unimplemented!("not exercised by these scenarios")
    }
}

#[tokio::test]
async fn happy_path_indexes_every_document() {
    let config = test_config();
    let object_store = Arc::new(FakeObjectStore::new(vec![
        ("cases/a.txt", "This is a sufficiently long legal document body."),
        ("cases/b.txt", "Another filing with enough text to classify."),
    ]));
    let classifier = Arc::new(FakeClassifier::new(0));
    let indexer = Arc::new(FakeIndexer::default());
    let extractor = Arc::new(TextExtractor::new());

    let coordinator = PipelineCoordinator::new(&config, object_store, classifier, indexer.clone(), extractor).unwrap();
    let status = coordinator.process_all(CancellationToken::new()).await;

    assert_eq!(status, RunStatus::Ok);
    let indexed = indexer.indexed.lock().unwrap();
    assert_eq!(indexed.len(), 2);
}

#[tokio::test]
async fn empty_text_is_skipped_before_classification() {
    let config = test_config();
    let object_store = Arc::new(FakeObjectStore::new(vec![("cases/empty.txt", "")]));
    let classifier = Arc::new(FakeClassifier::new(0));
    let indexer = Arc::new(FakeIndexer::default());
    let extractor = Arc::new(TextExtractor::new());

    let coordinator = PipelineCoordinator::new(&config, object_store, classifier, indexer.clone(), extractor).unwrap();
    let status = coordinator.process_all(CancellationToken::new()).await;

    assert_eq!(status, RunStatus::Ok);
    assert!(indexer.indexed.lock().unwrap().is_empty());
}

#[tokio::test]
async fn classifier_rate_limit_eventually_succeeds() {
    let config = test_config();
    let object_store = Arc::new(FakeObjectStore::new(vec![(
        "cases/a.txt",
        "Plenty of legal text to classify here, your honor.",
    )]));
    let classifier = Arc::new(FakeClassifier::new(2));
    let indexer = Arc::new(FakeIndexer::default());
    let extractor = Arc::new(TextExtractor::new());

    let coordinator = PipelineCoordinator::new(&config, object_store, classifier, indexer.clone(), extractor).unwrap();
    let status = coordinator.process_all(CancellationToken::new()).await;

    assert_eq!(status, RunStatus::Ok);
    assert_eq!(indexer.indexed.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn permanent_classifier_rejection_is_not_retried() {
    let mut config = test_config();
    config.failure_fraction_threshold = 1.1; // never degrade, just confirm nothing was indexed
    let object_store = Arc::new(FakeObjectStore::new(vec![(
        "cases/a.txt",
        "Plenty of legal text that will be rejected outright.",
    )]));
    let classifier = Arc::new(RejectingClassifier);
    let indexer = Arc::new(FakeIndexer::default());
    let extractor = Arc::new(TextExtractor::new());

    let coordinator = PipelineCoordinator::new(&config, object_store, classifier, indexer.clone(), extractor).unwrap();
    let status = coordinator.process_all(CancellationToken::new()).await;

    assert_eq!(status, RunStatus::Ok);
    assert!(indexer.indexed.lock().unwrap().is_empty());
}

#[tokio::test]
async fn slash_in_document_key_is_sanitized_before_indexing() {
    let config = test_config();
    let object_store = Arc::new(FakeObjectStore::new(vec![(
        "cases/2024/case.txt",
        "Filing text long enough to clear the classification threshold.",
    )]));
    let classifier = Arc::new(FakeClassifier::new(0));
    let indexer = Arc::new(FakeIndexer::default());
    let extractor = Arc::new(TextExtractor::new());

    let coordinator = PipelineCoordinator::new(&config, object_store, classifier, indexer.clone(), extractor).unwrap();
    coordinator.process_all(CancellationToken::new()).await;

    let indexed = indexer.indexed.lock().unwrap();
    assert_eq!(indexed.len(), 1);
    assert!(!indexed[0].contains('/'));
}

#[tokio::test]
async fn empty_object_store_completes_immediately() {
    let config = test_config();
    let object_store = Arc::new(FakeObjectStore::new(vec![]));
    let classifier = Arc::new(FakeClassifier::new(0));
    let indexer = Arc::new(FakeIndexer::default());
    let extractor = Arc::new(TextExtractor::new());

    let coordinator = PipelineCoordinator::new(&config, object_store, classifier, indexer.clone(), extractor).unwrap();
    let status = tokio::time::timeout(Duration::from_secs(5), coordinator.process_all(CancellationToken::new()))
        .await
        .expect("empty run should not hang");

    assert_eq!(status, RunStatus::Ok);
    assert!(indexer.indexed.lock().unwrap().is_empty());
}

#[tokio::test]
async fn cancellation_before_start_reports_canceled() {
    let config = test_config();
    let object_store = Arc::new(FakeObjectStore::new(vec![(
        "cases/a.txt",
        "Some filing text that never gets the chance to run.",
    )]));
    let classifier = Arc::new(FakeClassifier::new(0));
    let indexer = Arc::new(FakeIndexer::default());
    let extractor = Arc::new(TextExtractor::new());

    let coordinator = PipelineCoordinator::new(&config, object_store, classifier, indexer.clone(), extractor).unwrap();
    let cancel = CancellationToken::new();
    cancel.cancel();
    let status = coordinator.process_all(cancel).await;

    assert_eq!(status, RunStatus::Canceled);
}

#[tokio::test]
async fn explicit_key_list_bypasses_listing() {
    let config = test_config();
    let object_store = Arc::new(FakeObjectStore::new(vec![(
        "only/this/key.txt",
        "This document is reached only via the explicit key list.",
    )]));
    let classifier = Arc::new(FakeClassifier::new(0));
    let indexer = Arc::new(FakeIndexer::default());
    let extractor = Arc::new(TextExtractor::new());

    let coordinator = PipelineCoordinator::new(&config, object_store, classifier, indexer.clone(), extractor).unwrap();
    let status = coordinator
        .process_keys(CancellationToken::new(), vec!["only/this/key.txt".to_string()])
        .await;

    assert_eq!(status, RunStatus::Ok);
    assert_eq!(indexer.indexed.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn unknown_key_surfaces_as_not_found_without_blocking_the_run() {
    let mut config = test_config();
    config.failure_fraction_threshold = 1.1; // a single missing key is a 100% failure rate; don't let it read as "degraded"
    let object_store = Arc::new(FakeObjectStore::new(vec![]));
    let classifier = Arc::new(FakeClassifier::new(0));
    let indexer = Arc::new(FakeIndexer::default());
    let extractor = Arc::new(TextExtractor::new());

    let coordinator = PipelineCoordinator::new(&config, object_store, classifier, indexer.clone(), extractor).unwrap();
    let status = coordinator
        .process_keys(CancellationToken::new(), vec!["missing.txt".to_string()])
        .await;

    assert_eq!(status, RunStatus::Ok);
    assert!(indexer.indexed.lock().unwrap().is_empty());
}

#[tokio::test]
async fn backpressure_caps_queue_depth_at_max_size() {
    let mut config = test_config();
    config.extraction_queue = QueueSettings {
        max_size: 2,
        worker_count: Some(1),
        retry_delay_secs: 0,
        ..QueueSettings::default()
    };
    let documents: Vec<(String, String)> = (0..30)
        .map(|i| (format!("cases/{i}.txt"), "Enough legal text to classify here.".to_string()))
        .collect();
    let object_store = Arc::new(FakeObjectStore::new(
        documents.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect(),
    ));
    let classifier = Arc::new(FakeClassifier::new(0));
    let indexer = Arc::new(FakeIndexer::default());
    let extractor = Arc::new(TextExtractor::new());

    let coordinator = PipelineCoordinator::new(&config, object_store, classifier, indexer.clone(), extractor).unwrap();
    let status = tokio::time::timeout(Duration::from_secs(10), coordinator.process_all(CancellationToken::new()))
        .await
        .expect("run should not hang");

    let health = coordinator.health().await;
    let depth_high_water = health.queues["extraction"].depth_high_water;

    assert_eq!(status, RunStatus::Ok);
    assert_eq!(indexer.indexed.lock().unwrap().len(), 30);
    assert!(
        depth_high_water <= 2,
        "extraction queue depth reached {depth_high_water}, exceeding max_size 2"
    );
}

#[tokio::test]
async fn mid_run_cancellation_accounts_for_every_enqueued_document() {
    let mut config = test_config();
    config.failure_fraction_threshold = 1.1; // this test cancels on purpose; don't let that read as "degraded"
    let total = 100usize;
    let documents: Vec<(String, String)> = (0..total)
        .map(|i| (format!("cases/{i}.txt"), "Enough legal text to classify here.".to_string()))
        .collect();
    let object_store = Arc::new(FakeObjectStore::new(
        documents.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect(),
    ));
    let classifier = Arc::new(SlowClassifier {
        delay: Duration::from_millis(5),
    });
    let indexer = Arc::new(FakeIndexer::default());
    let extractor = Arc::new(TextExtractor::new());

    let coordinator = PipelineCoordinator::new(&config, object_store, classifier, indexer.clone(), extractor).unwrap();
    let cancel = CancellationToken::new();
    let run = tokio::spawn({
        let coordinator = coordinator.clone();
        let cancel = cancel.clone();
        async move { coordinator.process_all(cancel).await }
    });

    loop {
        let snapshot = coordinator.progress_snapshot().await;
        if snapshot.processed >= 10 && snapshot.enqueued == total as u64 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    cancel.cancel();

    // If workers were left running past `stop_all`'s grace period this join
    // would hang; a clean join is this test's evidence of no leaked workers.
    let status = tokio::time::timeout(Duration::from_secs(10), run)
        .await
        .expect("run should stop promptly after cancellation")
        .unwrap();
    assert_eq!(status, RunStatus::Canceled);

    let snapshot = coordinator.progress_snapshot().await;
    assert_eq!(snapshot.enqueued, total as u64);
    assert_eq!(
        snapshot.processed + snapshot.errors + snapshot.skipped + snapshot.canceled,
        total as u64
    );
}
