//! Legal document ingestion pipeline: object-store listing, text extraction,
//! LLM-backed classification, and search indexing, wired together as three
//! independently rate-limited, back-pressured queues behind one coordinator.

pub mod config;
pub mod coordinator;
pub mod hardware;
pub mod job;
pub mod manager;
pub mod metrics;
pub mod queue;
pub mod stages;

pub use coordinator::{PipelineCoordinator, RunStatus};
pub use job::Job;
pub use manager::QueueManager;
