//! Background LLM enrichment of indexed chunks.
//!
//! A fixed pool of workers polls the durable queue:
//!
//! ```text
//! every poll_interval:
//!   dequeue_tasks(batch_size)           (rows flip to processing atomically)
//!   for each task:
//!     get_chunk ──missing──▶ task failed
//!     summarize ──error────▶ task + chunk failed (no automatic retry)
//!     update_chunk_enrichment, set vector payload (warn only), task completed
//! ```
//!
//! Without a summarizer the workers are never started. Stopping is
//! cooperative: a worker finishes its current task, then exits.

use anyhow::Result;
use serde_json::json;
use sqlx::SqlitePool;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::cancel::{cancel_pair, CancelHandle, CancelToken};
use crate::config::EnrichmentConfig;
use crate::llm::Summarizer;
use crate::models::{ChunkEnrichment, EnrichmentStatus, EnrichmentTask, QueueStats};
use crate::repository::{ChunkRepository, EnrichmentQueue};
use crate::vector::{Payload, VectorStore};

struct Processor {
    chunks: ChunkRepository,
    queue: EnrichmentQueue,
    summarizer: Arc<dyn Summarizer>,
    store: Arc<dyn VectorStore>,
    collection: String,
    batch_size: usize,
}

struct RunningWorkers {
    stop: CancelHandle,
    handles: Vec<JoinHandle<()>>,
}

pub struct EnrichmentService {
    queue: EnrichmentQueue,
    processor: Option<Arc<Processor>>,
    workers: usize,
    poll_interval: Duration,
    running: Mutex<Option<RunningWorkers>>,
}

impl EnrichmentService {
    pub fn new(
        pool: SqlitePool,
        summarizer: Option<Arc<dyn Summarizer>>,
        store: Arc<dyn VectorStore>,
        collection: impl Into<String>,
        config: &EnrichmentConfig,
    ) -> Self {
        let queue = EnrichmentQueue::new(pool.clone());
        let processor = summarizer.map(|summarizer| {
            Arc::new(Processor {
                chunks: ChunkRepository::new(pool),
                queue: queue.clone(),
                summarizer,
                store,
                collection: collection.into(),
                batch_size: config.batch_size.max(1),
            })
        });

        Self {
            queue,
            processor,
            workers: config.workers.clamp(1, 10),
            poll_interval: Duration::from_secs(config.poll_interval_secs.max(5)),
            running: Mutex::new(None),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.processor.is_some()
    }

    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }

    /// Spawn the worker pool. Returns `false` when no summarizer is configured
    /// or the workers are already running.
    pub fn start_workers(&self) -> bool {
        let Some(processor) = &self.processor else {
            tracing::info!("LLM not configured, enrichment workers not started");
            return false;
        };

        let mut running = self.running.lock();
        if running.is_some() {
            return false;
        }

        let (stop, token) = cancel_pair();
        let handles = (0..self.workers)
            .map(|id| {
                tokio::spawn(worker_loop(
                    id,
                    processor.clone(),
                    self.poll_interval,
                    token.clone(),
                ))
            })
            .collect();

        *running = Some(RunningWorkers { stop, handles });
        tracing::info!(count = self.workers, "enrichment workers started");
        true
    }

    /// Signal the workers and wait for them to exit.
    pub async fn stop_workers(&self) {
        let Some(workers) = self.running.lock().take() else {
            return;
        };
        workers.stop.cancel();
        for handle in workers.handles {
            let _ = handle.await;
        }
        tracing::info!("enrichment workers stopped");
    }

    /// Process one batch in the foreground. Returns the number of tasks handled.
    pub async fn process_batch(&self) -> Result<usize> {
        match &self.processor {
            Some(p) => p.process_queue(&CancelToken::never()).await,
            None => anyhow::bail!("LLM is not configured; set [llm] in the config file"),
        }
    }

    /// Drain the queue in the foreground.
    pub async fn run_until_empty(&self) -> Result<usize> {
        let mut total = 0;
        loop {
            let n = self.process_batch().await?;
            if n == 0 {
                return Ok(total);
            }
            total += n;
        }
    }

    pub async fn queue_stats(&self) -> Result<QueueStats> {
        self.queue.queue_stats().await
    }

    pub async fn reset_failed_tasks(&self) -> Result<u64> {
        let count = self.queue.reset_failed_tasks().await?;
        tracing::info!(count, "reset failed enrichment tasks");
        Ok(count)
    }
}

async fn worker_loop(id: usize, processor: Arc<Processor>, every: Duration, stop: CancelToken) {
    tracing::debug!(worker_id = id, "enrichment worker started");
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + every, every);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = stop.canceled() => break,
            _ = ticker.tick() => {
                if let Err(e) = processor.process_queue(&stop).await {
                    tracing::error!(worker_id = id, error = %e, "failed to dequeue enrichment tasks");
                }
            }
        }
    }
    tracing::debug!(worker_id = id, "enrichment worker stopping");
}

impl Processor {
    async fn process_queue(&self, stop: &CancelToken) -> Result<usize> {
        let tasks = self.queue.dequeue_tasks(self.batch_size).await?;
        let mut handled = 0;
        for task in tasks {
            if stop.is_canceled() {
                // Hand the claimed task back so it is not stuck in processing.
                let mut task = task;
                task.status = EnrichmentStatus::Pending;
                if let Err(e) = self.queue.update_task(&task).await {
                    tracing::error!(chunk_id = %task.chunk_id, error = %e, "failed to release task");
                }
                continue;
            }
            self.process_task(task).await;
            handled += 1;
        }
        Ok(handled)
    }

    async fn process_task(&self, mut task: EnrichmentTask) {
        let chunk_id = task.chunk_id.clone();

        task.status = EnrichmentStatus::Processing;
        if let Err(e) = self.queue.update_task(&task).await {
            tracing::error!(chunk_id = %chunk_id, error = %e, "failed to mark task processing");
            return;
        }

        let chunk = match self.chunks.get_chunk(&chunk_id).await {
            Ok(Some(chunk)) => chunk,
            Ok(None) => {
                tracing::error!(chunk_id = %chunk_id, "chunk not found");
                self.fail_task(&mut task, "chunk not found").await;
                return;
            }
            Err(e) => {
                tracing::error!(chunk_id = %chunk_id, error = %e, "failed to load chunk");
                self.fail_task(&mut task, &e.to_string()).await;
                return;
            }
        };

        let enrichment = match self
            .summarizer
            .summarize(&chunk.user_query, &chunk.ai_response_core)
            .await
        {
            Ok(summary) => summary.enrichment(),
            Err(e) => {
                let message = format!("{:#}", e);
                tracing::warn!(chunk_id = %chunk_id, error = %message, "failed to enrich chunk");
                self.fail_chunk(&mut task, &message).await;
                return;
            }
        };

        if let Err(e) = self.chunks.update_chunk_enrichment(&chunk_id, &enrichment).await {
            tracing::error!(chunk_id = %chunk_id, error = %e, "failed to save enrichment");
            self.fail_chunk(&mut task, &format!("{:#}", e)).await;
            return;
        }

        if let Err(e) = self
            .store
            .set_payload(&self.collection, &chunk_id, enrichment_payload(&enrichment))
            .await
        {
            tracing::warn!(chunk_id = %chunk_id, error = %e, "failed to update vector payload");
        }

        task.status = EnrichmentStatus::Completed;
        task.last_error = None;
        if let Err(e) = self.queue.update_task(&task).await {
            tracing::error!(chunk_id = %chunk_id, error = %e, "failed to mark task completed");
        }
        tracing::info!(chunk_id = %chunk_id, "chunk enriched");
    }

    /// Fail the task and, best effort, the chunk it points at.
    async fn fail_chunk(&self, task: &mut EnrichmentTask, error: &str) {
        self.fail_task(task, error).await;
        if let Err(e) = self
            .chunks
            .update_enrichment_status(&task.chunk_id, EnrichmentStatus::Failed, error)
            .await
        {
            tracing::error!(chunk_id = %task.chunk_id, error = %e, "failed to mark chunk failed");
        }
    }

    async fn fail_task(&self, task: &mut EnrichmentTask, error: &str) {
        task.status = EnrichmentStatus::Failed;
        task.last_error = Some(error.to_string());
        if let Err(e) = self.queue.update_task(task).await {
            tracing::error!(chunk_id = %task.chunk_id, error = %e, "failed to mark task failed");
        }
    }
}

/// Payload patch carrying a chunk's enrichment. Tags are a JSON string.
pub fn enrichment_payload(enrichment: &ChunkEnrichment) -> Payload {
    let mut payload = Payload::new();
    payload.insert("summary".into(), json!(enrichment.summary));
    payload.insert("main_topic".into(), json!(enrichment.main_topic));
    payload.insert(
        "tags".into(),
        json!(serde_json::to_string(&enrichment.tags).unwrap_or_default()),
    );
    payload
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::TurnSummary;
    use crate::models::KnowledgeChunk;
    use crate::vector::{MemoryStore, Point};
    use async_trait::async_trait;
    use tempfile::TempDir;

    struct FixedSummarizer;

    #[async_trait]
    impl Summarizer for FixedSummarizer {
        async fn summarize(&self, user_text: &str, _ai_text: &str) -> Result<TurnSummary> {
            if user_text.contains("explode") {
                anyhow::bail!("model refused");
            }
            Ok(TurnSummary {
                summary: format!("about {}", user_text),
                main_topic: "testing".into(),
                tags: vec!["rust".into()],
                ..TurnSummary::default()
            })
        }
    }

    fn chunk(id: &str, index: i64, query: &str) -> KnowledgeChunk {
        KnowledgeChunk {
            id: id.into(),
            session_id: "s".into(),
            chunk_index: index,
            project_id: "p".into(),
            project_name: "P".into(),
            workspace_id: String::new(),
            user_query: query.into(),
            ai_response_core: "answer".into(),
            vector_text: String::new(),
            tools_used: vec![],
            files_modified: vec![],
            code_languages: vec![],
            has_code: false,
            summary: String::new(),
            main_topic: String::new(),
            tags: vec![],
            enrichment_status: EnrichmentStatus::Pending,
            enrichment_error: String::new(),
            timestamp: 0,
            content_hash: String::new(),
            file_path: String::new(),
            indexed_at: 0,
        }
    }

    async fn setup(tmp: &TempDir) -> (SqlitePool, Arc<MemoryStore>) {
        let pool = crate::db::connect_path(&tmp.path().join("m.sqlite"))
            .await
            .unwrap();
        crate::migrate::apply(&pool).await.unwrap();
        let store = Arc::new(MemoryStore::new());
        store.create_collection("c", 2).await.unwrap();
        (pool, store)
    }

    async fn seed(pool: &SqlitePool, store: &MemoryStore, chunks: Vec<KnowledgeChunk>) {
        ChunkRepository::new(pool.clone())
            .save_chunks(&chunks)
            .await
            .unwrap();
        let tasks: Vec<_> = chunks
            .iter()
            .map(|c| EnrichmentTask::new(c.id.clone(), 1))
            .collect();
        EnrichmentQueue::new(pool.clone())
            .enqueue_tasks(&tasks)
            .await
            .unwrap();
        let points = chunks
            .iter()
            .map(|c| Point {
                id: c.id.clone(),
                vector: vec![1.0, 0.0],
                payload: Payload::new(),
            })
            .collect();
        store.upsert("c", points).await.unwrap();
    }

    #[tokio::test]
    async fn enriches_chunk_and_payload() {
        let tmp = TempDir::new().unwrap();
        let (pool, store) = setup(&tmp).await;
        seed(&pool, &store, vec![chunk("a", 0, "parsers")]).await;

        let service = EnrichmentService::new(
            pool.clone(),
            Some(Arc::new(FixedSummarizer)),
            store.clone(),
            "c",
            &EnrichmentConfig::default(),
        );
        assert_eq!(service.run_until_empty().await.unwrap(), 1);

        let stored = ChunkRepository::new(pool).get_chunk("a").await.unwrap().unwrap();
        assert_eq!(stored.summary, "about parsers");
        assert_eq!(stored.enrichment_status, EnrichmentStatus::Completed);

        let hits = store.query("c", &[1.0, 0.0], None, 1).await.unwrap();
        assert_eq!(hits[0].payload["tags"], json!("[\"rust\"]"));
        assert_eq!(service.queue_stats().await.unwrap().completed, 1);
    }

    #[tokio::test]
    async fn failure_marks_task_and_chunk_then_reset_requeues() {
        let tmp = TempDir::new().unwrap();
        let (pool, store) = setup(&tmp).await;
        seed(&pool, &store, vec![chunk("bad", 0, "explode please")]).await;

        let service = EnrichmentService::new(
            pool.clone(),
            Some(Arc::new(FixedSummarizer)),
            store,
            "c",
            &EnrichmentConfig::default(),
        );
        service.run_until_empty().await.unwrap();

        let stored = ChunkRepository::new(pool.clone())
            .get_chunk("bad")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.enrichment_status, EnrichmentStatus::Failed);
        assert!(stored.enrichment_error.contains("model refused"));

        let task = EnrichmentQueue::new(pool).get_task("bad").await.unwrap().unwrap();
        assert_eq!(task.status, EnrichmentStatus::Failed);

        assert_eq!(service.reset_failed_tasks().await.unwrap(), 1);
        assert_eq!(service.queue_stats().await.unwrap().pending, 1);
    }

    #[tokio::test]
    async fn missing_chunk_fails_task() {
        let tmp = TempDir::new().unwrap();
        let (pool, store) = setup(&tmp).await;
        EnrichmentQueue::new(pool.clone())
            .enqueue_tasks(&[EnrichmentTask::new("ghost", 1)])
            .await
            .unwrap();

        let service = EnrichmentService::new(
            pool.clone(),
            Some(Arc::new(FixedSummarizer)),
            store,
            "c",
            &EnrichmentConfig::default(),
        );
        service.process_batch().await.unwrap();
        let task = EnrichmentQueue::new(pool).get_task("ghost").await.unwrap().unwrap();
        assert_eq!(task.last_error.as_deref(), Some("chunk not found"));
    }

    #[tokio::test]
    async fn workers_need_a_summarizer() {
        let tmp = TempDir::new().unwrap();
        let (pool, store) = setup(&tmp).await;
        let service = EnrichmentService::new(pool, None, store, "c", &EnrichmentConfig::default());
        assert!(!service.start_workers());
        assert!(!service.is_running());
        assert!(service.process_batch().await.is_err());
    }

    #[tokio::test]
    async fn workers_start_and_stop() {
        let tmp = TempDir::new().unwrap();
        let (pool, store) = setup(&tmp).await;
        let service = EnrichmentService::new(
            pool,
            Some(Arc::new(FixedSummarizer)),
            store,
            "c",
            &EnrichmentConfig::default(),
        );
        assert!(service.start_workers());
        assert!(!service.start_workers());
        assert!(service.is_running());
        service.stop_workers().await;
        assert!(!service.is_running());
    }

    #[tokio::test]
    async fn failed_save_marks_chunk_failed_too() {
        let tmp = TempDir::new().unwrap();
        let (pool, store) = setup(&tmp).await;
        seed(&pool, &store, vec![chunk("a", 0, "parsers")]).await;
        sqlx::query(
            r#"
            CREATE TRIGGER reject_summary BEFORE UPDATE OF summary ON rag_knowledge_chunks
            BEGIN SELECT RAISE(ABORT, 'summary column locked'); END
            "#,
        )
        .execute(&pool)
        .await
        .unwrap();

        let service = EnrichmentService::new(
            pool.clone(),
            Some(Arc::new(FixedSummarizer)),
            store,
            "c",
            &EnrichmentConfig::default(),
        );
        service.run_until_empty().await.unwrap();

        let stored = ChunkRepository::new(pool.clone())
            .get_chunk("a")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.enrichment_status, EnrichmentStatus::Failed);
        assert!(stored.enrichment_error.contains("summary column locked"));
        let task = EnrichmentQueue::new(pool).get_task("a").await.unwrap().unwrap();
        assert_eq!(task.status, EnrichmentStatus::Failed);
    }

    #[tokio::test]
    async fn stopping_releases_every_claimed_task() {
        let tmp = TempDir::new().unwrap();
        let (pool, _store) = setup(&tmp).await;
        let queue = EnrichmentQueue::new(pool.clone());
        queue
            .enqueue_tasks(&[EnrichmentTask::new("a", 1), EnrichmentTask::new("b", 2)])
            .await
            .unwrap();
        // The first claimed task cannot be handed back.
        sqlx::query(
            r#"
            CREATE TRIGGER pin_a BEFORE UPDATE ON rag_enrichment_queue
            WHEN NEW.chunk_id = 'a' AND NEW.status = 'pending'
            BEGIN SELECT RAISE(ABORT, 'pinned'); END
            "#,
        )
        .execute(&pool)
        .await
        .unwrap();

        let service = EnrichmentService::new(
            pool,
            Some(Arc::new(FixedSummarizer)),
            Arc::new(MemoryStore::new()),
            "c",
            &EnrichmentConfig::default(),
        );
        let processor = service.processor.clone().unwrap();
        let (stop, token) = cancel_pair();
        stop.cancel();

        assert_eq!(processor.process_queue(&token).await.unwrap(), 0);
        let b = queue.get_task("b").await.unwrap().unwrap();
        assert_eq!(b.status, EnrichmentStatus::Pending);
        let a = queue.get_task("a").await.unwrap().unwrap();
        assert_eq!(a.status, EnrichmentStatus::Processing);
    }
}
