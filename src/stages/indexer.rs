//! Component D: the search indexer client.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use crate::queue::Retryable;

/// Capability the indexing stage is bound to; lets tests substitute a fake
/// indexer without spinning up HTTP.
#[async_trait]
pub trait Indexer: Send + Sync {
    async fn index(&self, id: &str, doc: &Value) -> Result<String, IndexError>;
    async fn bulk_index(&self, docs: &[(String, Value)]) -> Result<Vec<BulkItemResult>, IndexError>;
}

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("indexer rate limited: {0}")]
    RateLimited(String),
    #[error("indexer server error: {0}")]
    Server(String),
    #[error("indexer request timed out")]
    Timeout,
    #[error("indexer connection error: {0}")]
    Connection(String),
    #[error("{0}")]
    Rejected(String),
}

impl Retryable for IndexError {
    fn is_retryable(&self) -> bool {
        matches!(self, Self::RateLimited(_) | Self::Server(_) | Self::Timeout | Self::Connection(_))
    }

    fn kind(&self) -> &'static str {
        match self {
            Self::RateLimited(_) => "rate_limited",
            Self::Server(_) => "server",
            Self::Timeout => "timeout",
            Self::Connection(_) => "connection",
            Self::Rejected(_) => "rejected",
        }
    }
}

/// Outcome of one document within a bulk request.
#[derive(Debug, Clone)]
pub struct BulkItemResult {
    pub id: String,
    pub success: bool,
    pub error: Option<String>,
}

/// Component D: upserts enriched documents into a search cluster.
pub struct SearchIndexer {
    client: Client,
    base_url: String,
    index_name: String,
    auth_token: Option<String>,
}

impl SearchIndexer {
    pub fn new(base_url: impl Into<String>, index_name: impl Into<String>, auth_token: Option<String>) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(120))
            .gzip(true)
            .brotli(true)
            .build()
            .expect("failed to build search-indexer HTTP client");

        Self {
            client,
            base_url: base_url.into(),
            index_name: index_name.into(),
            auth_token,
        }
    }

    /// Forward slashes and backslashes in the caller's id are replaced with
    /// underscores before upsert — the id must be URL- and path-safe.
    pub fn sanitize_id(id: &str) -> String {
        id.chars()
            .map(|c| if c == '/' || c == '\\' { '_' } else { c })
            .collect()
    }

    async fn index_impl(&self, id: &str, doc: &Value) -> Result<String, IndexError> {
        let sanitized_id = Self::sanitize_id(id);
        let url = format!("{}/{}/_doc/{}", self.base_url, self.index_name, sanitized_id);

        let mut request = self.client.put(&url).json(doc);
        if let Some(token) = &self.auth_token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                IndexError::Timeout
            } else {
                IndexError::Connection(e.to_string())
            }
        })?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| IndexError::Connection(e.to_string()))?;

        match status {
            s if s.is_success() => Ok(sanitized_id),
            StatusCode::TOO_MANY_REQUESTS => Err(IndexError::RateLimited(body)),
            s if s.is_server_error() => Err(IndexError::Server(body)),
            s if s.is_client_error() => Err(IndexError::Rejected(body)),
            s => Err(IndexError::Server(format!("unexpected status {s}"))),
        }
    }

    /// Bulk-index via NDJSON: alternating `{"index":{"_index":...,"_id":...}}`
    /// action lines and document source lines. Partial failure is reported
    /// per item, never thrown as a single error for the whole batch.
    async fn bulk_index_impl(&self, docs: &[(String, Value)]) -> Result<Vec<BulkItemResult>, IndexError> {
        if docs.is_empty() {
            return Ok(Vec::new());
        }

        let mut body = String::new();
        let mut sanitized_ids = Vec::with_capacity(docs.len());
        for (id, doc) in docs {
            let sanitized_id = Self::sanitize_id(id);
            let action = BulkAction {
                index: BulkActionMeta {
                    _index: self.index_name.clone(),
                    _id: sanitized_id.clone(),
                },
            };
            body.push_str(&serde_json::to_string(&action).expect("bulk action always serializes"));
            body.push('\n');
            body.push_str(&serde_json::to_string(doc).expect("document value always serializes"));
            body.push('\n');
            sanitized_ids.push(sanitized_id);
        }

        let url = format!("{}/_bulk", self.base_url);
        let mut request = self
            .client
            .post(&url)
            .header("Content-Type", "application/x-ndjson")
            .body(body);
        if let Some(token) = &self.auth_token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                IndexError::Timeout
            } else {
                IndexError::Connection(e.to_string())
            }
        })?;

        let status = response.status();
        let response_body = response
            .text()
            .await
            .map_err(|e| IndexError::Connection(e.to_string()))?;

        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(IndexError::RateLimited(response_body));
        }
        if status.is_server_error() {
            return Err(IndexError::Server(response_body));
        }

        let parsed: BulkResponse = serde_json::from_str(&response_body)
            .map_err(|_| IndexError::Server(format!("unparseable bulk response: {response_body}")))?;

        Ok(parsed
            .items
            .into_iter()
            .zip(sanitized_ids)
            .map(|(item, id)| {
                let inner = item.index;
                let success = (200..300).contains(&inner.status);
                BulkItemResult {
                    id,
                    success,
                    error: inner.error.map(|e| e.reason),
                }
            })
            .collect())
    }
}

#[async_trait]
impl Indexer for SearchIndexer {
    async fn index(&self, id: &str, doc: &Value) -> Result<String, IndexError> {
        self.index_impl(id, doc).await
    }

    async fn bulk_index(&self, docs: &[(String, Value)]) -> Result<Vec<BulkItemResult>, IndexError> {
        self.bulk_index_impl(docs).await
    }
}

#[derive(Serialize)]
struct BulkAction {
    index: BulkActionMeta,
}

#[derive(Serialize)]
struct BulkActionMeta {
    _index: String,
    _id: String,
}

#[derive(serde::Deserialize)]
struct BulkResponse {
    items: Vec<BulkResponseItem>,
}

#[derive(serde::Deserialize)]
struct BulkResponseItem {
    index: BulkResponseItemInner,
}

#[derive(serde::Deserialize)]
struct BulkResponseItemInner {
    status: u16,
    #[serde(default)]
    error: Option<BulkResponseError>,
}

#[derive(serde::Deserialize)]
struct BulkResponseError {
    reason: String,
}
