//! The `Job` data model shared by all three pipeline stages.

use std::collections::HashMap;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A stage of the document processing pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Extraction,
    Classification,
    Indexing,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Extraction => "extraction",
            Self::Classification => "classification",
            Self::Indexing => "indexing",
        }
    }

    /// The stage that follows this one, if any.
    pub fn next(&self) -> Option<Stage> {
        match self {
            Self::Extraction => Some(Self::Classification),
            Self::Classification => Some(Self::Indexing),
            Self::Indexing => None,
        }
    }
}

/// A value in the heterogeneous `extracted_metadata` map.
///
/// Modeled as a tagged variant rather than `serde_json::Value` so stage B and
/// stage C agree on the type of e.g. `page_count` without re-parsing JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetadataValue {
    Int(i64),
    Float(f64),
    String(String),
    Bool(bool),
    Timestamp(DateTime<Utc>),
}

impl MetadataValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            Self::Float(f) => Some(*f as i64),
            _ => None,
        }
    }
}

impl From<&str> for MetadataValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for MetadataValue {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<i64> for MetadataValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<usize> for MetadataValue {
    fn from(value: usize) -> Self {
        Self::Int(value as i64)
    }
}

impl From<bool> for MetadataValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

/// Metadata extracted alongside plain text during stage B.
pub type ExtractedMetadata = HashMap<String, MetadataValue>;

/// Nested legal entities recognized by the classifier, present only when
/// the upstream model reported them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LegalEntities {
    pub case: Option<String>,
    pub court: Option<String>,
    pub parties: Vec<String>,
    pub attorneys: Vec<String>,
    pub judge: Option<String>,
    pub charges: Vec<String>,
    pub authorities: Vec<String>,
    pub filing_date: Option<DateTime<Utc>>,
    pub event_date: Option<DateTime<Utc>>,
    pub status: Option<String>,
}

/// The sentinel document type used whenever the classifier's response is
/// missing, unparseable, or names a type outside the known set.
pub const OTHER_DOCUMENT_TYPE: &str = "other";

/// Known document types the classifier is expected to emit. Anything else
/// is normalized to [`OTHER_DOCUMENT_TYPE`] with confidence discounted.
pub const KNOWN_DOCUMENT_TYPES: &[&str] = &[
    "order",
    "motion",
    "complaint",
    "brief",
    "transcript",
    "exhibit",
    "correspondence",
    "memo",
    "other",
];

pub const DEFAULT_LEGAL_CATEGORY: &str = "civil";
pub const DEFAULT_CONFIDENCE: f64 = 0.5;
/// Confidence penalty applied when the document type had to be normalized.
pub const UNKNOWN_TYPE_CONFIDENCE_PENALTY: f64 = 0.8;

/// Result of stage C classification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    pub document_type: String,
    pub legal_category: String,
    pub summary: String,
    /// Always clamped to `[0.0, 1.0]` by [`Classification::new`].
    pub confidence: f64,
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default)]
    pub legal_tags: Vec<String>,
    #[serde(default)]
    pub subject: Option<String>,
    #[serde(default)]
    pub entities: Option<LegalEntities>,
}

impl Classification {
    /// Construct a classification, clamping confidence into `[0, 1]`.
    pub fn new(
        document_type: String,
        legal_category: String,
        summary: String,
        confidence: f64,
    ) -> Self {
        Self {
            document_type,
            legal_category,
            summary,
            confidence: confidence.clamp(0.0, 1.0),
            keywords: Vec::new(),
            legal_tags: Vec::new(),
            subject: None,
            entities: None,
        }
    }

    /// Normalize an unrecognized `document_type` to the "other" sentinel,
    /// applying the standard confidence penalty. No-op if already known.
    pub fn normalize_document_type(&mut self) {
        if !KNOWN_DOCUMENT_TYPES.contains(&self.document_type.as_str()) {
            self.document_type = OTHER_DOCUMENT_TYPE.to_string();
            self.confidence = (self.confidence * UNKNOWN_TYPE_CONFIDENCE_PENALTY).clamp(0.0, 1.0);
        }
    }

    /// Derive `subject` from the first sentence of `summary` (<=12 words,
    /// ellipsis if truncated) when not already set.
    pub fn fill_subject_from_summary(&mut self) {
        if self.subject.is_some() {
            return;
        }
        let first_sentence = self
            .summary
            .split(['.', '!', '?'])
            .next()
            .unwrap_or("")
            .trim();
        if first_sentence.is_empty() {
            return;
        }
        let words: Vec<&str> = first_sentence.split_whitespace().collect();
        let subject = if words.len() > 12 {
            format!("{}...", words[..12].join(" "))
        } else {
            words.join(" ")
        };
        self.subject = Some(subject);
    }
}

/// One entry in a job's error history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub stage: Stage,
    pub kind: String,
    pub message: String,
    pub at: DateTime<Utc>,
}

/// Terminal outcome of a job, recorded once it leaves the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminalState {
    Done,
    Skipped,
    Failed,
    Canceled,
}

/// The unit that flows through all three pipeline stages.
///
/// A `Job` is owned by exactly one queue at a time (enforced by the
/// [`crate::coordinator::PipelineCoordinator`], not by this type); see the
/// crate-level invariants documented there.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub document_key: String,
    #[serde(skip, default = "Instant::now")]
    pub created_at: Instant,
    #[serde(skip)]
    pub bytes: Option<Vec<u8>>,
    pub extracted_text: Option<String>,
    #[serde(default)]
    pub extracted_metadata: ExtractedMetadata,
    pub classification: Option<Classification>,
    #[serde(default)]
    pub attempts: HashMap<Stage, u32>,
    #[serde(default)]
    pub error_history: Vec<ErrorRecord>,
}

impl Job {
    pub fn new(id: impl Into<String>, document_key: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            document_key: document_key.into(),
            created_at: Instant::now(),
            bytes: None,
            extracted_text: None,
            extracted_metadata: HashMap::new(),
            classification: None,
            attempts: HashMap::new(),
            error_history: Vec::new(),
        }
    }

    pub fn attempts_for(&self, stage: Stage) -> u32 {
        self.attempts.get(&stage).copied().unwrap_or(0)
    }

    pub fn record_attempt(&mut self, stage: Stage) {
        *self.attempts.entry(stage).or_insert(0) += 1;
    }

    pub fn record_error(&mut self, stage: Stage, kind: impl Into<String>, message: impl Into<String>) {
        self.error_history.push(ErrorRecord {
            stage,
            kind: kind.into(),
            message: message.into(),
            at: Utc::now(),
        });
    }

    /// True once extraction produced enough signal to classify: non-empty
    /// text with at least 10 non-whitespace characters.
    pub fn has_classifiable_text(&self) -> bool {
        match &self.extracted_text {
            Some(text) => text.chars().filter(|c| !c.is_whitespace()).count() >= 10,
            None => false,
        }
    }

    /// Clear the raw bytes once extraction has consumed them.
    pub fn clear_bytes(&mut self) {
        self.bytes = None;
    }
}
