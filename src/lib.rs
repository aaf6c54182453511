pub mod config;
pub mod controllers;
pub mod database;
pub mod error;
pub mod models;
pub mod services;
pub mod store;

use anyhow::Context;
use std::sync::Arc;
use tracing::info;

use crate::services::inference::OpenAiClient;
use crate::services::ingestion::{Collaborators, IngestionService};
use crate::services::ocr::VisionClient;
use crate::services::post_source::GraphClient;
use crate::store::{EventStore, PgStore};

// Shared state для всего приложения
#[derive(Clone)]
pub struct AppState {
    pub config: config::Config,
    pub store: Arc<dyn EventStore>,
    pub ingest: Arc<IngestionService>,
}

impl AppState {
    pub fn new(config: config::Config, store: Arc<dyn EventStore>, ingest: Arc<IngestionService>) -> Arc<Self> {
        Arc::new(Self { config, store, ingest })
    }

    /// Собирает рабочее состояние: база, миграции, список источников, внешние клиенты.
    pub async fn from_config(config: config::Config) -> anyhow::Result<Arc<Self>> {
        let db = database::Database::new(&config.database)
            .await
            .context("Failed to connect to database")?;
        info!("Database connected");

        db.run_migrations().await.context("Failed to run migrations")?;

        let sources = config::load_sources(&config.ingest.sources_path)
            .with_context(|| format!("Failed to load sources from {}", config.ingest.sources_path))?;
        info!(sources = sources.len(), "Sources loaded");

        let store: Arc<dyn EventStore> = Arc::new(PgStore::new(db.pool.clone()));
        let deps = Collaborators {
            store: store.clone(),
            post_source: Arc::new(GraphClient::from_config(&config.graph, config.ingest.posts_per_source)?),
            extractor: Arc::new(VisionClient::from_config(&config.vision)?),
            model: Arc::new(OpenAiClient::from_config(&config.llm)?),
        };
        let ingest = Arc::new(IngestionService::new(sources, deps, &config.ingest));

        Ok(Self::new(config, store, ingest))
    }
}
