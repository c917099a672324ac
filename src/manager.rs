//! Component F: a named registry of queues with serialized lifecycle.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::queue::{Processor, QueueConfig, QueueError, QueueSnapshot, RateLimitedQueue};

#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("queue '{0}' is already registered")]
    DuplicateName(String),
    #[error("invalid queue config: {0}")]
    InvalidConfig(String),
    #[error("queue '{0}' not found")]
    NotFound(String),
}

/// Starts a queue's worker pool once bound via [`QueueManager::bind_processor`].
/// Boxing this closure is what lets queues with different concrete processor
/// types live in the same registry without a shared trait-object `Processor`.
type Starter = Box<dyn Fn(CancellationToken) -> BoxFuture<'static, ()> + Send + Sync>;

struct RegisteredQueue<J>
where
    J: Send + 'static,
{
    queue: Arc<RateLimitedQueue<J>>,
    starter: Option<Starter>,
    started: bool,
}

/// Registry keyed by unique queue name. Startup is serialized downstream
/// first (so the indexing queue is ready before extraction starts handing
/// it work); shutdown reverses that order.
pub struct QueueManager<J>
where
    J: Send + 'static,
{
    // Insertion order is the pipeline's upstream-to-downstream order
    // (e.g. extraction, classification, indexing).
    order: Vec<String>,
    queues: HashMap<String, RegisteredQueue<J>>,
}

impl<J> Default for QueueManager<J>
where
    J: Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<J> QueueManager<J>
where
    J: Send + 'static,
{
    pub fn new() -> Self {
        Self {
            order: Vec::new(),
            queues: HashMap::new(),
        }
    }

    pub fn create_queue(&mut self, cfg: QueueConfig) -> Result<Arc<RateLimitedQueue<J>>, ManagerError> {
        if self.queues.contains_key(&cfg.name) {
            return Err(ManagerError::DuplicateName(cfg.name));
        }
        let name = cfg.name.clone();
        let queue = RateLimitedQueue::new(cfg).map_err(ManagerError::InvalidConfig)?;
        self.order.push(name.clone());
        self.queues.insert(
            name,
            RegisteredQueue {
                queue: queue.clone(),
                starter: None,
                started: false,
            },
        );
        Ok(queue)
    }

    pub fn queue(&self, name: &str) -> Option<Arc<RateLimitedQueue<J>>> {
        self.queues.get(name).map(|r| r.queue.clone())
    }

    /// Bind a processor to a previously created queue. Each queue keeps its
    /// own concrete processor type; `start_all` only ever calls the stored
    /// starter closure, so no trait-object erasure of `Processor` is needed.
    pub fn bind_processor<P>(&mut self, name: &str, processor: Arc<P>) -> Result<(), ManagerError>
    where
        P: Processor<J> + 'static,
    {
        let entry = self
            .queues
            .get_mut(name)
            .ok_or_else(|| ManagerError::NotFound(name.to_string()))?;
        let queue = entry.queue.clone();
        entry.starter = Some(Box::new(move |cancel| {
            let queue = queue.clone();
            let processor = processor.clone();
            Box::pin(async move { queue.start(processor, cancel).await })
        }));
        Ok(())
    }

    /// Start every registered (and bound) queue, downstream-first.
    pub async fn start_all(&mut self, cancel: CancellationToken) {
        for name in self.order.iter().rev() {
            let entry = self.queues.get_mut(name).expect("order and queues stay in sync");
            if entry.started {
                continue;
            }
            let Some(starter) = &entry.starter else {
                warn!(queue = %name, "queue has no bound processor; skipping start");
                continue;
            };
            starter(cancel.clone()).await;
            entry.started = true;
            info!(queue = %name, "queue started");
        }
    }

    /// Stop every registered queue, upstream-first (the reverse of start
    /// order), with a shared grace period. Returns the total count of
    /// UNRESOLVED in-flight items across all queues that did not drain
    /// within the grace period.
    pub async fn stop_all(&mut self, grace: Duration) -> usize {
        let mut unresolved_total = 0;
        for name in self.order.iter() {
            let entry = self.queues.get_mut(name).expect("order and queues stay in sync");
            if !entry.started {
                continue;
            }
            let unresolved = entry.queue.stop(grace).await;
            entry.started = false;
            if unresolved > 0 {
                warn!(queue = %name, unresolved, "queue force-stopped with unresolved in-flight items");
            }
            unresolved_total += unresolved;
        }
        unresolved_total
    }

    pub async fn enqueue(&self, name: &str, item: J) -> Result<(), ManagerError> {
        let entry = self.queues.get(name).ok_or_else(|| ManagerError::NotFound(name.to_string()))?;
        entry
            .queue
            .enqueue(item)
            .await
            .map_err(|e| match e {
                QueueError::Full => ManagerError::InvalidConfig(format!("{name}: queue full")),
                QueueError::Closed => ManagerError::InvalidConfig(format!("{name}: queue closed")),
            })
    }

    /// Aggregate every queue's metrics snapshot into one map keyed by name.
    pub async fn aggregate_snapshot(&self) -> HashMap<String, QueueSnapshot> {
        let mut snapshots = HashMap::new();
        for name in &self.order {
            let entry = &self.queues[name];
            snapshots.insert(name.clone(), entry.queue.snapshot().await);
        }
        snapshots
    }

    /// Healthy iff every registered queue is running with at least one
    /// live worker.
    pub async fn is_healthy(&self) -> bool {
        if self.order.is_empty() {
            return false;
        }
        for name in &self.order {
            let entry = &self.queues[name];
            if !entry.started || entry.queue.live_worker_count().await == 0 {
                return false;
            }
        }
        true
    }

    pub async fn all_empty(&self) -> bool {
        for name in &self.order {
            if !self.queues[name].queue.is_empty().await {
                return false;
            }
        }
        true
    }
}
