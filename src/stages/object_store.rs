//! Component A: the object-store contract and a thin `reqwest`-based
//! adapter. This crate ships only enough client to satisfy [`ObjectStore`] —
//! a full SDK is out of scope.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{self, BoxStream, StreamExt};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use thiserror::Error;

use crate::queue::Retryable;

#[derive(Debug, Clone)]
pub struct ObjectMeta {
    pub path: String,
    pub size: u64,
    pub modified: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum ObjectStoreError {
    #[error("object not found: {0}")]
    NotFound(String),
    #[error("unauthorized")]
    Unauthorized,
    #[error("transient object-store error: {0}")]
    Transient(String),
}

impl Retryable for ObjectStoreError {
    fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    fn kind(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::Unauthorized => "unauthorized",
            Self::Transient(_) => "transient",
        }
    }
}

/// The object-store contract consumed by the Coordinator and the extraction
/// stage. `list` is a stream so the Coordinator never has to materialize the
/// whole bucket before applying its safety cap.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn list(&self, prefix: &str) -> Result<BoxStream<'static, Result<ObjectMeta, ObjectStoreError>>, ObjectStoreError>;
    async fn get(&self, path: &str) -> Result<Vec<u8>, ObjectStoreError>;
}

/// A minimal S3-compatible (or any REST object store exposing the same
/// listing shape) adapter over `reqwest`.
pub struct HttpObjectStore {
    client: Client,
    base_url: String,
    bearer_token: Option<String>,
    page_size: usize,
}

#[derive(Debug, Deserialize)]
struct ListResponse {
    entries: Vec<ListEntry>,
    #[serde(default)]
    next_cursor: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ListEntry {
    path: String,
    size: u64,
    modified: DateTime<Utc>,
}

impl HttpObjectStore {
    pub fn new(base_url: impl Into<String>, bearer_token: Option<String>) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .gzip(true)
            .brotli(true)
            .build()
            .expect("failed to build object-store HTTP client");

        Self {
            client,
            base_url: base_url.into(),
            bearer_token,
            page_size: 1000,
        }
    }

    fn apply_auth(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.bearer_token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn list_page(
        &self,
        prefix: &str,
        cursor: Option<String>,
    ) -> Result<ListResponse, ObjectStoreError> {
        let mut request = self
            .client
            .get(format!("{}/list", self.base_url))
            .query(&[("prefix", prefix), ("limit", &self.page_size.to_string())]);
        if let Some(cursor) = &cursor {
            request = request.query(&[("cursor", cursor)]);
        }
        request = self.apply_auth(request);

        let response = request
            .send()
            .await
            .map_err(|e| ObjectStoreError::Transient(e.to_string()))?;

        match response.status() {
            StatusCode::OK => response
                .json::<ListResponse>()
                .await
                .map_err(|e| ObjectStoreError::Transient(e.to_string())),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(ObjectStoreError::Unauthorized),
            status if status.is_server_error() => {
                Err(ObjectStoreError::Transient(format!("HTTP {status}")))
            }
            status => Err(ObjectStoreError::Transient(format!("HTTP {status}"))),
        }
    }
}

#[async_trait]
impl ObjectStore for HttpObjectStore {
    async fn list(
        &self,
        prefix: &str,
    ) -> Result<BoxStream<'static, Result<ObjectMeta, ObjectStoreError>>, ObjectStoreError> {
        let client = self.client.clone();
        let base_url = self.base_url.clone();
        let bearer_token = self.bearer_token.clone();
        let page_size = self.page_size;
        let prefix = prefix.to_string();

        let store = HttpObjectStore {
            client,
            base_url,
            bearer_token,
            page_size,
        };

        let stream = stream::unfold(
            (store, prefix, None::<String>, false),
            |(store, prefix, cursor, done)| async move {
                if done {
                    return None;
                }
                match store.list_page(&prefix, cursor).await {
                    Ok(page) => {
                        let next_cursor = page.next_cursor;
                        let finished = next_cursor.is_none();
                        let entries: Vec<Result<ObjectMeta, ObjectStoreError>> = page
                            .entries
                            .into_iter()
                            .map(|e| {
                                Ok(ObjectMeta {
                                    path: e.path,
                                    size: e.size,
                                    modified: e.modified,
                                })
                            })
                            .collect();
                        Some((
                            stream::iter(entries),
                            (store, prefix, next_cursor, finished),
                        ))
                    }
                    Err(e) => Some((
                        stream::iter(vec![Err(e)]),
                        (store, prefix, None, true),
                    )),
                }
            },
        )
        .flatten();

        Ok(Box::pin(stream))
    }

    async fn get(&self, path: &str) -> Result<Vec<u8>, ObjectStoreError> {
        let request = self.apply_auth(self.client.get(format!("{}/object/{}", self.base_url, path)));
        let response = request
            .send()
            .await
            .map_err(|e| ObjectStoreError::Transient(e.to_string()))?;

        match response.status() {
            StatusCode::OK => response
                .bytes()
                .await
                .map(|b| b.to_vec())
                .map_err(|e| ObjectStoreError::Transient(e.to_string())),
            StatusCode::NOT_FOUND => Err(ObjectStoreError::NotFound(path.to_string())),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(ObjectStoreError::Unauthorized),
            status => Err(ObjectStoreError::Transient(format!("HTTP {status}"))),
        }
    }
}

impl Clone for HttpObjectStore {
    fn clone(&self) -> Self {
        Self {
            client: self.client.clone(),
            base_url: self.base_url.clone(),
            bearer_token: self.bearer_token.clone(),
            page_size: self.page_size,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transient_errors_are_retryable() {
        assert!(ObjectStoreError::Transient("x".into()).is_retryable());
        assert!(!ObjectStoreError::NotFound("x".into()).is_retryable());
        assert!(!ObjectStoreError::Unauthorized.is_retryable());
    }
}
