//! Wiring: config → repositories, providers, vector store and services.
//!
//! ```text
//! Config ─▶ SQLite (migrated)
//!        ─▶ embedding provider ──disabled──▶ RAG off (reason kept for errors)
//!        ─▶ vector store: managed Qdrant (install dir + start) | external URL
//!        ─▶ ChunkIndexer ─▶ SearchService, ScanScheduler, EnrichmentService
//! ```
//!
//! A failure to bring up the embedding provider or the vector store turns the
//! RAG subsystem off instead of failing the process; commands that need it
//! then fail with [`Runtime::rag`]'s message.

use anyhow::{anyhow, Result};
use sqlx::SqlitePool;
use std::sync::Arc;

use crate::config::Config;
use crate::db;
use crate::embedding::{create_provider, EmbeddingProvider};
use crate::enrichment::EnrichmentService;
use crate::indexer::ChunkIndexer;
use crate::llm::{create_summarizer, Summarizer};
use crate::migrate;
use crate::repository::ChunkRepository;
use crate::scanner::{ScanConfig, ScanScheduler};
use crate::search::SearchService;
use crate::session::{FsSessions, ProjectDirectory, SessionTextProvider};
use crate::vector::manager::QdrantManager;
use crate::vector::{QdrantStore, VectorStore};
use crate::watcher::TranscriptWatcher;

/// Everything the indexing and search paths need.
pub struct RagServices {
    pub store: Arc<dyn VectorStore>,
    pub indexer: Arc<ChunkIndexer>,
    pub search: SearchService,
    pub scanner: Arc<ScanScheduler>,
    pub enrichment: EnrichmentService,
}

/// Collaborators handed to [`RagServices::assemble`].
pub struct RagParts {
    pub sessions: Arc<dyn SessionTextProvider>,
    pub projects: Arc<dyn ProjectDirectory>,
    pub embedder: Arc<dyn EmbeddingProvider>,
    pub summarizer: Option<Arc<dyn Summarizer>>,
    pub store: Arc<dyn VectorStore>,
}

impl RagServices {
    /// Build the services and make sure the chunk collection exists.
    pub async fn assemble(config: &Config, pool: SqlitePool, parts: RagParts) -> Result<Self> {
        let collection = config.vector.collection.clone();
        let indexer = Arc::new(ChunkIndexer::new(
            pool.clone(),
            parts.sessions,
            parts.projects,
            parts.embedder.clone(),
            parts.store.clone(),
            collection.clone(),
        ));
        let dims = indexer.ensure_collection().await?;
        tracing::debug!(collection = %collection, dims, "collection ready");

        let search = SearchService::new(
            parts.embedder,
            parts.store.clone(),
            collection.clone(),
            ChunkRepository::new(pool.clone()),
        );
        let scanner = Arc::new(ScanScheduler::new(
            indexer.clone(),
            config.transcripts.root.clone(),
            ScanConfig::from(&config.scan),
        ));
        let enrichment = EnrichmentService::new(
            pool,
            parts.summarizer,
            parts.store.clone(),
            collection,
            &config.enrichment,
        );

        Ok(Self {
            store: parts.store,
            indexer,
            search,
            scanner,
            enrichment,
        })
    }
}

pub struct Runtime {
    pub config: Config,
    pub pool: SqlitePool,
    manager: Option<Arc<QdrantManager>>,
    rag: std::result::Result<RagServices, String>,
}

impl Runtime {
    /// Connect, migrate and bring up the RAG subsystem when it is configured.
    pub async fn build(config: Config) -> Result<Self> {
        let pool = db::connect(&config).await?;
        migrate::apply(&pool).await?;

        let mut manager = None;
        let rag = match Self::build_rag(&config, &pool, &mut manager).await {
            Ok(services) => Ok(services),
            Err(e) => {
                let reason = format!("{:#}", e);
                tracing::warn!(reason = %reason, "RAG subsystem disabled");
                Err(reason)
            }
        };

        Ok(Self {
            config,
            pool,
            manager,
            rag,
        })
    }

    /// Wrap already-built services, e.g. in-memory ones.
    pub fn from_parts(config: Config, pool: SqlitePool, rag: RagServices) -> Self {
        Self {
            config,
            pool,
            manager: None,
            rag: Ok(rag),
        }
    }

    async fn build_rag(
        config: &Config,
        pool: &SqlitePool,
        manager_slot: &mut Option<Arc<QdrantManager>>,
    ) -> Result<RagServices> {
        if !config.embedding.is_enabled() {
            return Err(anyhow!(
                "embedding provider is disabled; set [embedding] provider in the config file"
            ));
        }
        let embedder = create_provider(&config.embedding)?;
        let summarizer = create_summarizer(&config.llm)?;

        let store: Arc<dyn VectorStore> = if config.vector.managed && config.vector.url.is_none() {
            let manager = Arc::new(QdrantManager::new(&config.vector)?);
            manager.start().await?;
            *manager_slot = Some(manager.clone());
            manager.store()
        } else {
            Arc::new(QdrantStore::new(&config.vector.endpoint())?)
        };

        let sessions = Arc::new(FsSessions::new(config.transcripts.root.clone()));
        RagServices::assemble(
            config,
            pool.clone(),
            RagParts {
                sessions: sessions.clone(),
                projects: sessions,
                embedder,
                summarizer,
                store,
            },
        )
        .await
    }

    pub fn rag(&self) -> Result<&RagServices> {
        self.rag
            .as_ref()
            .map_err(|reason| anyhow!("RAG is disabled: {}", reason))
    }

    pub fn is_rag_enabled(&self) -> bool {
        self.rag.is_ok()
    }

    /// Start enrichment workers, the optional periodic scan and, when
    /// `watch` is set, the transcript watcher.
    pub fn start_background(&self, watch: bool) -> Result<Option<TranscriptWatcher>> {
        let rag = self.rag()?;
        rag.enrichment.start_workers();
        if let Some(every) = self.config.scan.interval() {
            rag.scanner.start_periodic(every);
        }
        if watch {
            return Ok(Some(TranscriptWatcher::start(rag.scanner.clone())?));
        }
        Ok(None)
    }

    /// Stop background work, the managed server and the pool.
    pub async fn shutdown(self) {
        if let Ok(rag) = &self.rag {
            rag.scanner.cancel_scan();
            rag.scanner.stop_periodic().await;
            rag.enrichment.stop_workers().await;
        }
        if let Some(manager) = &self.manager {
            manager.stop().await;
        }
        self.pool.close().await;
    }
}
