//! Plain `serde`-deserializable configuration tree with env-var overrides.
//!
//! Deliberately not backed by a database loader: the source store and the
//! search index own durability, and this crate's config is just a process's
//! startup parameters.

use std::env;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::queue::QueueConfig;

fn default_max_size() -> usize {
    1_000
}

fn default_process_timeout_secs() -> u64 {
    60
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_retry_delay_secs() -> u64 {
    2
}

/// Per-queue overrides read from the environment; anything left `None`
/// falls back to the stage's hardcoded default in [`CoordinatorConfig::queue_configs`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueSettings {
    #[serde(default = "default_max_size")]
    pub max_size: usize,
    pub worker_count: Option<usize>,
    #[serde(default = "default_process_timeout_secs")]
    pub process_timeout_secs: u64,
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    #[serde(default = "default_retry_delay_secs")]
    pub retry_delay_secs: u64,
    #[serde(default)]
    pub enable_rate_limit: bool,
    #[serde(default)]
    pub rate_limit_per_minute: u32,
    #[serde(default)]
    pub burst_size: usize,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            max_size: default_max_size(),
            worker_count: None,
            process_timeout_secs: default_process_timeout_secs(),
            retry_attempts: default_retry_attempts(),
            retry_delay_secs: default_retry_delay_secs(),
            enable_rate_limit: false,
            rate_limit_per_minute: 0,
            burst_size: 0,
        }
    }
}

impl QueueSettings {
    pub fn to_queue_config(&self, name: &str, queue_type: &str, worker_count: usize) -> QueueConfig {
        QueueConfig {
            name: name.to_string(),
            queue_type: queue_type.to_string(),
            max_size: self.max_size,
            worker_count: self.worker_count.unwrap_or(worker_count),
            process_timeout: Duration::from_secs(self.process_timeout_secs),
            retry_attempts: self.retry_attempts,
            retry_delay: Duration::from_secs(self.retry_delay_secs),
            enable_rate_limit: self.enable_rate_limit,
            rate_limit: self.rate_limit_per_minute,
            burst_size: self.burst_size,
            enable_metrics: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectStoreSettings {
    pub base_url: String,
    pub bearer_token: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassifierSettings {
    pub endpoint: String,
    #[serde(default = "default_classifier_model")]
    pub model: String,
    pub auth_token: Option<String>,
}

fn default_classifier_model() -> String {
    "gpt-4o-mini".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexerSettings {
    pub base_url: String,
    #[serde(default = "default_index_name")]
    pub index_name: String,
    pub auth_token: Option<String>,
}

fn default_index_name() -> String {
    "documents".to_string()
}

fn default_failure_fraction_threshold() -> f64 {
    0.5
}

fn default_failure_window() -> usize {
    100
}

fn default_safety_cap() -> usize {
    100_000
}

/// Top-level configuration: the three external collaborators plus
/// per-queue overrides and Coordinator thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub object_store: ObjectStoreSettings,
    pub classifier: ClassifierSettings,
    pub indexer: IndexerSettings,

    #[serde(default)]
    pub extraction_queue: QueueSettings,
    #[serde(default)]
    pub classification_queue: QueueSettings,
    #[serde(default)]
    pub indexing_queue: QueueSettings,

    #[serde(default = "default_failure_fraction_threshold")]
    pub failure_fraction_threshold: f64,
    #[serde(default = "default_failure_window")]
    pub failure_window: usize,
    #[serde(default = "default_safety_cap")]
    pub listing_safety_cap: usize,
}

impl Config {
    /// Load configuration from environment variables, after loading a
    /// `.env` file if present. No dotfile formats beyond `.env` are
    /// supported and no CLI flags are parsed here — that is `main.rs`'s job.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let object_store = ObjectStoreSettings {
            base_url: env::var("OBJECT_STORE_URL").map_err(|_| ConfigError::MissingVar("OBJECT_STORE_URL"))?,
            bearer_token: env::var("OBJECT_STORE_TOKEN").ok(),
        };
        let classifier = ClassifierSettings {
            endpoint: env::var("CLASSIFIER_ENDPOINT").map_err(|_| ConfigError::MissingVar("CLASSIFIER_ENDPOINT"))?,
            model: env::var("CLASSIFIER_MODEL").unwrap_or_else(|_| default_classifier_model()),
            auth_token: env::var("CLASSIFIER_TOKEN").ok(),
        };
        let indexer = IndexerSettings {
            base_url: env::var("INDEXER_URL").map_err(|_| ConfigError::MissingVar("INDEXER_URL"))?,
            index_name: env::var("INDEXER_INDEX_NAME").unwrap_or_else(|_| default_index_name()),
            auth_token: env::var("INDEXER_TOKEN").ok(),
        };

        Ok(Self {
            object_store,
            classifier,
            indexer,
            extraction_queue: QueueSettings::default(),
            classification_queue: QueueSettings {
                enable_rate_limit: true,
                rate_limit_per_minute: env::var("CLASSIFIER_RATE_LIMIT_PER_MINUTE")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(60),
                burst_size: env::var("CLASSIFIER_BURST_SIZE")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(10),
                retry_attempts: 5,
                retry_delay_secs: 2,
                ..QueueSettings::default()
            },
            indexing_queue: QueueSettings::default(),
            failure_fraction_threshold: default_failure_fraction_threshold(),
            failure_window: default_failure_window(),
            listing_safety_cap: default_safety_cap(),
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    MissingVar(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_settings_default_worker_count_falls_back_to_profile_value() {
        let settings = QueueSettings::default();
        let cfg = settings.to_queue_config("extraction", "extraction", 4);
        assert_eq!(cfg.worker_count, 4);
    }

    #[test]
    fn explicit_worker_count_override_wins() {
        let settings = QueueSettings {
            worker_count: Some(2),
            ..QueueSettings::default()
        };
        let cfg = settings.to_queue_config("extraction", "extraction", 4);
        assert_eq!(cfg.worker_count, 2);
    }
}
