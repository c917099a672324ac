//! lexpipe - legal document ingestion pipeline.
//!
//! Lists documents from an object store, extracts text, classifies them
//! against a legal taxonomy with an LLM, and upserts the result into a
//! search index.

use std::sync::Arc;

use clap::{Parser, Subcommand};
use lexpipe::config::Config;
use lexpipe::coordinator::RunStatus;
use lexpipe::stages::{ClassifierClient, HttpObjectStore, SearchIndexer, TextExtractor};
use lexpipe::PipelineCoordinator;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "lexpipe")]
#[command(about = "Legal document ingestion pipeline")]
#[command(version)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List and process every document in the object store
    Run,
    /// Process only the first N listed documents
    Batch {
        /// Number of documents to process
        n: usize,
    },
    /// Process a caller-supplied list of object keys, bypassing listing
    Keys {
        /// Object keys to process
        keys: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present (before anything else)
    let _ = dotenvy::dotenv();

    // Parse args before initializing logging so `--verbose` can pick the filter.
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "lexpipe=info" } else { "lexpipe=warn" };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env()?;

    let object_store = Arc::new(HttpObjectStore::new(
        config.object_store.base_url.clone(),
        config.object_store.bearer_token.clone(),
    ));
    let classifier = Arc::new(ClassifierClient::new(
        config.classifier.endpoint.clone(),
        config.classifier.model.clone(),
        config.classifier.auth_token.clone(),
    ));
    let indexer = Arc::new(SearchIndexer::new(
        config.indexer.base_url.clone(),
        config.indexer.index_name.clone(),
        config.indexer.auth_token.clone(),
    ));
    let extractor = Arc::new(TextExtractor::new());

    let coordinator = PipelineCoordinator::new(&config, object_store, classifier, indexer, extractor)
        .map_err(anyhow::Error::msg)?;

    let cancel = CancellationToken::new();
    let shutdown_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("received interrupt; shutting down after in-flight work drains");
            shutdown_cancel.cancel();
        }
    });

    let status = match cli.command {
        Commands::Run => coordinator.process_all(cancel).await,
        Commands::Batch { n } => coordinator.process_batch(cancel, n).await,
        Commands::Keys { keys } => coordinator.process_keys(cancel, keys).await,
    };

    match status {
        RunStatus::Ok => Ok(()),
        RunStatus::Degraded => {
            tracing::warn!("pipeline run completed in a degraded state");
            std::process::exit(1);
        }
        RunStatus::Canceled => {
            tracing::warn!("pipeline run was canceled");
            std::process::exit(130);
        }
    }
}
