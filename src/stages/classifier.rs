//! Component C: the LLM classifier client.
//!
//! Retry/backoff is the queue's job (`retry_attempts = 5`,
//! `retry_delay = 2s`, matching §4.5's `min(2s * 1.5^attempt, 60s)` via the
//! shared backoff formula in [`crate::queue`]) — this module only knows how
//! to build one request and parse one response.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use crate::job::{Classification, ExtractedMetadata};
use crate::queue::Retryable;

/// Capability the classification stage is bound to; lets tests substitute
/// a fake classifier without spinning up HTTP.
#[async_trait]
pub trait Classifier: Send + Sync {
    async fn classify(&self, text: &str, metadata: &ExtractedMetadata) -> Result<Classification, ClassifierError>;
}

const BASELINE_TRUNCATE_CHARS: usize = 8_000;
const MID_LENGTH_BONUS_CHARS: usize = 2_000;
const LONG_DOC_BONUS_CHARS: usize = 4_000;
const MANY_PAGES_BONUS_CHARS: usize = 3_000;
const TEMPERATURE: f32 = 0.1;
const MAX_RESPONSE_TOKENS: u32 = 1_500;

#[derive(Debug, Error)]
pub enum ClassifierError {
    #[error("rate limited: {0}")]
    RateLimited(String),
    #[error("classifier server error: {0}")]
    Server(String),
    #[error("classifier request timed out")]
    Timeout,
    #[error("classifier connection error: {0}")]
    Connection(String),
    #[error("classifier returned no JSON object in response")]
    NoJsonObject,
    #[error("classifier response was not valid JSON: {0}")]
    InvalidJson(String),
    #[error("classifier rejected the request: {0}")]
    BadRequest(String),
}

impl Retryable for ClassifierError {
    fn is_retryable(&self) -> bool {
        matches!(self, Self::RateLimited(_) | Self::Server(_) | Self::Timeout | Self::Connection(_))
    }

    fn kind(&self) -> &'static str {
        match self {
            Self::RateLimited(_) => "rate_limited",
            Self::Server(_) => "server",
            Self::Timeout => "timeout",
            Self::Connection(_) => "connection",
            Self::NoJsonObject => "no_json_object",
            Self::InvalidJson(_) => "invalid_json",
            Self::BadRequest(_) => "bad_request",
        }
    }
}

#[derive(Serialize)]
struct ChatMessage {
    role: &'static str,
    content: String,
}

#[derive(Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    temperature: f32,
    max_tokens: u32,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
    #[serde(default)]
    error: Option<ChatApiError>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    content: String,
}

#[derive(Deserialize)]
struct ChatApiError {
    message: String,
    #[serde(rename = "type")]
    #[allow(dead_code)]
    error_type: String,
}

#[derive(Deserialize, Default)]
struct RawClassification {
    document_type: Option<String>,
    legal_category: Option<String>,
    summary: Option<String>,
    confidence: Option<f64>,
    #[serde(default)]
    keywords: Vec<String>,
    #[serde(default)]
    legal_tags: Vec<String>,
    subject: Option<String>,
}

/// The classifier client's HTTP adapter.
pub struct ClassifierClient {
    client: Client,
    endpoint: String,
    model: String,
    auth_token: Option<String>,
}

impl ClassifierClient {
    pub fn new(endpoint: impl Into<String>, model: impl Into<String>, auth_token: Option<String>) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .gzip(true)
            .brotli(true)
            .build()
            .expect("failed to build classifier HTTP client");

        Self {
            client,
            endpoint: endpoint.into(),
            model: model.into(),
            auth_token,
        }
    }

    async fn classify_impl(
        &self,
        text: &str,
        metadata: &ExtractedMetadata,
    ) -> Result<Classification, ClassifierError> {
        let word_count = text.split_whitespace().count();
        let truncated = truncate_for_classification(text, word_count, page_count_hint(metadata));
        let prompt = build_prompt(&truncated, metadata, word_count);

        let body = ChatRequest {
            model: self.model.clone(),
            messages: vec![ChatMessage {
                role: "user",
                content: prompt,
            }],
            temperature: TEMPERATURE,
            max_tokens: MAX_RESPONSE_TOKENS,
        };

        let mut request = self.client.post(&self.endpoint).json(&body);
        if let Some(token) = &self.auth_token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                ClassifierError::Timeout
            } else {
                ClassifierError::Connection(e.to_string())
            }
        })?;

        let status = response.status();
        let body_text = response
            .text()
            .await
            .map_err(|e| ClassifierError::Connection(e.to_string()))?;

        match status {
            StatusCode::OK => {}
            StatusCode::TOO_MANY_REQUESTS => return Err(ClassifierError::RateLimited(body_text)),
            s if s.is_server_error() => return Err(ClassifierError::Server(body_text)),
            s if s.is_client_error() => return Err(ClassifierError::BadRequest(body_text)),
            s => return Err(ClassifierError::Server(format!("unexpected status {s}"))),
        }

        let parsed: ChatResponse = serde_json::from_str(&body_text)
            .map_err(|e| ClassifierError::InvalidJson(e.to_string()))?;

        if let Some(api_error) = parsed.error {
            return Err(ClassifierError::Server(api_error.message));
        }

        let content = parsed
            .choices
            .first()
            .map(|c| c.message.content.clone())
            .ok_or_else(|| ClassifierError::InvalidJson("no choices in response".to_string()))?;

        debug!(chars = content.len(), "classifier raw response");
        parse_classification(&content)
    }
}

#[async_trait]
impl Classifier for ClassifierClient {
    async fn classify(&self, text: &str, metadata: &ExtractedMetadata) -> Result<Classification, ClassifierError> {
        self.classify_impl(text, metadata).await
    }
}

/// Extract the JSON object between the first `{` and the matching last
/// `}`, tolerating surrounding prose, then fill in defaults for any
/// missing or invalid field.
fn parse_classification(content: &str) -> Result<Classification, ClassifierError> {
    let start = content.find('{').ok_or(ClassifierError::NoJsonObject)?;
    let end = content.rfind('}').ok_or(ClassifierError::NoJsonObject)?;
    if end < start {
        return Err(ClassifierError::NoJsonObject);
    }
    let json_slice = &content[start..=end];

    let value: Value = serde_json::from_str(json_slice)
        .map_err(|e| ClassifierError::InvalidJson(e.to_string()))?;
    let raw: RawClassification = serde_json::from_value(value).unwrap_or_default();

    let document_type = raw.document_type.unwrap_or_else(|| crate::job::OTHER_DOCUMENT_TYPE.to_string());
    let legal_category = raw.legal_category.unwrap_or_else(|| crate::job::DEFAULT_LEGAL_CATEGORY.to_string());
    let summary = raw.summary.unwrap_or_default();
    let confidence = raw.confidence.unwrap_or(crate::job::DEFAULT_CONFIDENCE);

    let mut classification = Classification::new(document_type, legal_category, summary, confidence);
    classification.keywords = raw.keywords;
    classification.legal_tags = raw.legal_tags;
    classification.subject = raw.subject;

    classification.normalize_document_type();
    classification.fill_subject_from_summary();

    Ok(classification)
}

fn page_count_hint(metadata: &ExtractedMetadata) -> Option<i64> {
    metadata.get("page_count").and_then(|v| v.as_int())
}

/// §4.5 truncation policy: baseline 8,000 chars; for <500-word documents
/// the baseline already covers the whole thing; 500-2,000 words gets +2,000;
/// >10,000 words gets +4,000; >20 pages gets +3,000. Bonuses stack.
fn truncate_for_classification(text: &str, word_count: usize, page_count: Option<i64>) -> String {
    let mut budget = BASELINE_TRUNCATE_CHARS;
    if (500..=2_000).contains(&word_count) {
        budget += MID_LENGTH_BONUS_CHARS;
    }
    if word_count > 10_000 {
        budget += LONG_DOC_BONUS_CHARS;
    }
    if page_count.map(|p| p > 20).unwrap_or(false) {
        budget += MANY_PAGES_BONUS_CHARS;
    }

    if text.chars().count() <= budget {
        text.to_string()
    } else {
        text.chars().take(budget).collect()
    }
}

fn build_prompt(truncated_text: &str, metadata: &ExtractedMetadata, word_count: usize) -> String {
    let filename = metadata
        .get("filename")
        .and_then(|v| v.as_str())
        .unwrap_or("unknown");
    let content_type = metadata
        .get("content_type")
        .and_then(|v| v.as_str())
        .unwrap_or("unknown");
    let page_count = page_count_hint(metadata)
        .map(|p| p.to_string())
        .unwrap_or_else(|| "unknown".to_string());

    let guidance = if word_count > 10_000 {
        "This is a long document; focus the summary on its holding or operative sections."
    } else if word_count < 500 {
        "This is a short document; the full text is provided."
    } else {
        "Summarize the document's purpose and key legal content."
    };

    format!(
        "You are classifying a legal document.\n\
         Filename: {filename}\n\
         File type: {content_type}\n\
         Word count: {word_count}\n\
         Page count: {page_count}\n\
         Source system: lexpipe\n\
         {guidance}\n\n\
         Respond with a single JSON object with keys: document_type, legal_category, \
         summary, confidence (0-1), keywords (array), legal_tags (array), subject.\n\n\
         Document text:\n{truncated_text}"
    )
}
