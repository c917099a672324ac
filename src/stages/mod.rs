//! The four external-facing components (A, B, C, D) bound to queues as
//! [`crate::queue::Processor`] implementations.

pub mod classifier;
pub mod extractor;
pub mod indexer;
pub mod object_store;

pub use classifier::{Classifier, ClassifierClient, ClassifierError};
pub use extractor::{ExtractionError, FileHint, TextExtractor};
pub use indexer::{BulkItemResult, IndexError, Indexer, SearchIndexer};
pub use object_store::{HttpObjectStore, ObjectMeta, ObjectStore, ObjectStoreError};
