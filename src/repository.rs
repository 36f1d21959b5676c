//! SQLite repositories for the metadata store.
//!
//! The metadata store is the system of record. Three repositories share one
//! pool:
//!
//! | Repository | Table |
//! |------------|-------|
//! | [`ChunkRepository`] | `rag_knowledge_chunks` |
//! | [`IndexStatusRepository`] | `rag_index_status` |
//! | [`EnrichmentQueue`] | `rag_enrichment_queue` |
//!
//! List-valued chunk fields are stored as JSON text.

use anyhow::{Context, Result};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use crate::models::{
    ChunkEnrichment, EnrichmentStatus, EnrichmentTask, IndexStatus, KnowledgeChunk, QueueStats,
};

fn now_secs() -> i64 {
    chrono::Utc::now().timestamp()
}

fn to_json(list: &[String]) -> Result<String> {
    Ok(serde_json::to_string(list)?)
}

fn from_json(text: &str) -> Vec<String> {
    serde_json::from_str(text).unwrap_or_default()
}

// ═══════════════════════════════════════════════════════════════════════
// Chunks
// ═══════════════════════════════════════════════════════════════════════

#[derive(Clone)]
pub struct ChunkRepository {
    pool: SqlitePool,
}

impl ChunkRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert or replace chunks keyed by `(session_id, chunk_index)`.
    pub async fn save_chunks(&self, chunks: &[KnowledgeChunk]) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        for chunk in chunks {
            sqlx::query(
                r#"
                INSERT INTO rag_knowledge_chunks (
                    id, session_id, chunk_index, project_id, project_name, workspace_id,
                    user_query, ai_response_core, vector_text, tools_used, files_modified,
                    code_languages, has_code, summary, main_topic, tags, enrichment_status,
                    enrichment_error, timestamp, content_hash, file_path, indexed_at
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(session_id, chunk_index) DO UPDATE SET
                    id = excluded.id,
                    project_id = excluded.project_id,
                    project_name = excluded.project_name,
                    workspace_id = excluded.workspace_id,
                    user_query = excluded.user_query,
                    ai_response_core = excluded.ai_response_core,
                    vector_text = excluded.vector_text,
                    tools_used = excluded.tools_used,
                    files_modified = excluded.files_modified,
                    code_languages = excluded.code_languages,
                    has_code = excluded.has_code,
                    summary = excluded.summary,
                    main_topic = excluded.main_topic,
                    tags = excluded.tags,
                    enrichment_status = excluded.enrichment_status,
                    enrichment_error = excluded.enrichment_error,
                    timestamp = excluded.timestamp,
                    content_hash = excluded.content_hash,
                    file_path = excluded.file_path,
                    indexed_at = excluded.indexed_at
                "#,
            )
            .bind(&chunk.id)
            .bind(&chunk.session_id)
            .bind(chunk.chunk_index)
            .bind(&chunk.project_id)
            .bind(&chunk.project_name)
            .bind(&chunk.workspace_id)
            .bind(&chunk.user_query)
            .bind(&chunk.ai_response_core)
            .bind(&chunk.vector_text)
            .bind(to_json(&chunk.tools_used)?)
            .bind(to_json(&chunk.files_modified)?)
            .bind(to_json(&chunk.code_languages)?)
            .bind(chunk.has_code)
            .bind(&chunk.summary)
            .bind(&chunk.main_topic)
            .bind(to_json(&chunk.tags)?)
            .bind(chunk.enrichment_status.as_str())
            .bind(&chunk.enrichment_error)
            .bind(chunk.timestamp)
            .bind(&chunk.content_hash)
            .bind(&chunk.file_path)
            .bind(chunk.indexed_at)
            .execute(&mut *tx)
            .await
            .with_context(|| format!("saving chunk {}", chunk.id))?;
        }

        tx.commit().await?;
        Ok(())
    }

    pub async fn get_chunk(&self, id: &str) -> Result<Option<KnowledgeChunk>> {
        let row = sqlx::query("SELECT * FROM rag_knowledge_chunks WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| chunk_from_row(&r)).transpose()
    }

    pub async fn get_chunks_by_session(&self, session_id: &str) -> Result<Vec<KnowledgeChunk>> {
        let rows = sqlx::query(
            "SELECT * FROM rag_knowledge_chunks WHERE session_id = ? ORDER BY chunk_index",
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(chunk_from_row).collect()
    }

    /// Write summary fields and mark the chunk completed.
    pub async fn update_chunk_enrichment(
        &self,
        id: &str,
        enrichment: &ChunkEnrichment,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE rag_knowledge_chunks
            SET summary = ?, main_topic = ?, tags = ?, enrichment_status = ?, enrichment_error = ''
            WHERE id = ?
            "#,
        )
        .bind(&enrichment.summary)
        .bind(&enrichment.main_topic)
        .bind(to_json(&enrichment.tags)?)
        .bind(EnrichmentStatus::Completed.as_str())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn update_enrichment_status(
        &self,
        id: &str,
        status: EnrichmentStatus,
        error: &str,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE rag_knowledge_chunks SET enrichment_status = ?, enrichment_error = ? WHERE id = ?",
        )
        .bind(status.as_str())
        .bind(error)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Remove a session's chunks and their queue entries. Returns the chunk count.
    pub async fn delete_chunks_by_session(&self, session_id: &str) -> Result<u64> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            DELETE FROM rag_enrichment_queue WHERE chunk_id IN
                (SELECT id FROM rag_knowledge_chunks WHERE session_id = ?)
            "#,
        )
        .bind(session_id)
        .execute(&mut *tx)
        .await?;

        let deleted = sqlx::query("DELETE FROM rag_knowledge_chunks WHERE session_id = ?")
            .bind(session_id)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        tx.commit().await?;
        Ok(deleted)
    }

    pub async fn count_chunks(&self) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM rag_knowledge_chunks")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    pub async fn clear(&self) -> Result<()> {
        sqlx::query("DELETE FROM rag_knowledge_chunks")
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

fn chunk_from_row(row: &SqliteRow) -> Result<KnowledgeChunk> {
    let status: String = row.get("enrichment_status");
    Ok(KnowledgeChunk {
        id: row.get("id"),
        session_id: row.get("session_id"),
        chunk_index: row.get("chunk_index"),
        project_id: row.get("project_id"),
        project_name: row.get("project_name"),
        workspace_id: row.get("workspace_id"),
        user_query: row.get("user_query"),
        ai_response_core: row.get("ai_response_core"),
        vector_text: row.get("vector_text"),
        tools_used: from_json(row.get("tools_used")),
        files_modified: from_json(row.get("files_modified")),
        code_languages: from_json(row.get("code_languages")),
        has_code: row.get("has_code"),
        summary: row.get("summary"),
        main_topic: row.get("main_topic"),
        tags: from_json(row.get("tags")),
        enrichment_status: status.parse()?,
        enrichment_error: row.get("enrichment_error"),
        timestamp: row.get("timestamp"),
        content_hash: row.get("content_hash"),
        file_path: row.get("file_path"),
        indexed_at: row.get("indexed_at"),
    })
}

// ═══════════════════════════════════════════════════════════════════════
// Index status
// ═══════════════════════════════════════════════════════════════════════

#[derive(Clone)]
pub struct IndexStatusRepository {
    pool: SqlitePool,
}

impl IndexStatusRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn get(&self, file_path: &str) -> Result<Option<IndexStatus>> {
        let row = sqlx::query("SELECT * FROM rag_index_status WHERE file_path = ?")
            .bind(file_path)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|r| {
            let status: String = r.get("status");
            Ok(IndexStatus {
                file_path: r.get("file_path"),
                session_id: r.get("session_id"),
                project_id: r.get("project_id"),
                content_hash: r.get("content_hash"),
                chunk_count: r.get("chunk_count"),
                file_mtime: r.get("file_mtime"),
                last_indexed_at: r.get("last_indexed_at"),
                status: status.parse()?,
            })
        })
        .transpose()
    }

    pub async fn save(&self, status: &IndexStatus) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO rag_index_status (
                file_path, session_id, project_id, content_hash, chunk_count,
                file_mtime, last_indexed_at, status
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(file_path) DO UPDATE SET
                session_id = excluded.session_id,
                project_id = excluded.project_id,
                content_hash = excluded.content_hash,
                chunk_count = excluded.chunk_count,
                file_mtime = excluded.file_mtime,
                last_indexed_at = excluded.last_indexed_at,
                status = excluded.status
            "#,
        )
        .bind(&status.file_path)
        .bind(&status.session_id)
        .bind(&status.project_id)
        .bind(&status.content_hash)
        .bind(status.chunk_count)
        .bind(status.file_mtime)
        .bind(status.last_indexed_at)
        .bind(status.status.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Record a new mtime for a file whose content did not change.
    pub async fn update_file_mtime(&self, file_path: &str, mtime: i64) -> Result<()> {
        sqlx::query("UPDATE rag_index_status SET file_mtime = ? WHERE file_path = ?")
            .bind(mtime)
            .bind(file_path)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn count(&self) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM rag_index_status")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    pub async fn last_indexed_at(&self) -> Result<Option<i64>> {
        let last: Option<i64> = sqlx::query_scalar("SELECT MAX(last_indexed_at) FROM rag_index_status")
            .fetch_one(&self.pool)
            .await?;
        Ok(last)
    }

    pub async fn delete(&self, file_path: &str) -> Result<()> {
        sqlx::query("DELETE FROM rag_index_status WHERE file_path = ?")
            .bind(file_path)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn clear(&self) -> Result<()> {
        sqlx::query("DELETE FROM rag_index_status")
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Enrichment queue
// ═══════════════════════════════════════════════════════════════════════

#[derive(Clone)]
pub struct EnrichmentQueue {
    pool: SqlitePool,
}

impl EnrichmentQueue {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Queue tasks as pending. A task already being processed is left alone.
    pub async fn enqueue_tasks(&self, tasks: &[EnrichmentTask]) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        for task in tasks {
            sqlx::query(
                r#"
                INSERT INTO rag_enrichment_queue (
                    chunk_id, priority, status, retry_count, max_retries, created_at,
                    next_retry_at, last_error
                ) VALUES (?, ?, 'pending', 0, ?, ?, NULL, NULL)
                ON CONFLICT(chunk_id) DO UPDATE SET
                    priority = excluded.priority,
                    status = 'pending',
                    retry_count = 0,
                    max_retries = excluded.max_retries,
                    created_at = excluded.created_at,
                    next_retry_at = NULL,
                    last_error = NULL
                WHERE rag_enrichment_queue.status != 'processing'
                "#,
            )
            .bind(&task.chunk_id)
            .bind(task.priority)
            .bind(task.max_retries)
            .bind(task.created_at)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    /// Claim up to `limit` eligible pending tasks.
    ///
    /// Selection and the switch to `processing` happen in one statement, so
    /// no two callers can claim the same chunk.
    pub async fn dequeue_tasks(&self, limit: usize) -> Result<Vec<EnrichmentTask>> {
        let rows = sqlx::query(
            r#"
            UPDATE rag_enrichment_queue SET status = 'processing'
            WHERE chunk_id IN (
                SELECT chunk_id FROM rag_enrichment_queue
                WHERE status = 'pending' AND (next_retry_at IS NULL OR next_retry_at <= ?)
                ORDER BY priority DESC, created_at ASC
                LIMIT ?
            )
            RETURNING *
            "#,
        )
        .bind(now_secs())
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut tasks = rows.iter().map(task_from_row).collect::<Result<Vec<_>>>()?;
        tasks.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.created_at.cmp(&b.created_at))
        });
        Ok(tasks)
    }

    pub async fn get_task(&self, chunk_id: &str) -> Result<Option<EnrichmentTask>> {
        let row = sqlx::query("SELECT * FROM rag_enrichment_queue WHERE chunk_id = ?")
            .bind(chunk_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| task_from_row(&r)).transpose()
    }

    pub async fn update_task(&self, task: &EnrichmentTask) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE rag_enrichment_queue
            SET priority = ?, status = ?, retry_count = ?, max_retries = ?,
                next_retry_at = ?, last_error = ?
            WHERE chunk_id = ?
            "#,
        )
        .bind(task.priority)
        .bind(task.status.as_str())
        .bind(task.retry_count)
        .bind(task.max_retries)
        .bind(task.next_retry_at)
        .bind(&task.last_error)
        .bind(&task.chunk_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Requeue every failed task. Returns how many were reset.
    pub async fn reset_failed_tasks(&self) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE rag_enrichment_queue
            SET status = 'pending', retry_count = 0, next_retry_at = NULL, last_error = NULL
            WHERE status = 'failed'
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    pub async fn queue_stats(&self) -> Result<QueueStats> {
        let rows = sqlx::query(
            "SELECT status, COUNT(*) AS n FROM rag_enrichment_queue GROUP BY status",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut stats = QueueStats::default();
        for row in rows {
            let status: String = row.get("status");
            let n: i64 = row.get("n");
            match status.parse::<EnrichmentStatus>() {
                Ok(EnrichmentStatus::Pending) => stats.pending = n,
                Ok(EnrichmentStatus::Processing) => stats.processing = n,
                Ok(EnrichmentStatus::Completed) => stats.completed = n,
                Ok(EnrichmentStatus::Failed) => stats.failed = n,
                Err(_) => tracing::warn!(status = %status, "unknown queue status"),
            }
        }
        Ok(stats)
    }

    pub async fn clear(&self) -> Result<()> {
        sqlx::query("DELETE FROM rag_enrichment_queue")
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

fn task_from_row(row: &SqliteRow) -> Result<EnrichmentTask> {
    let status: String = row.get("status");
    Ok(EnrichmentTask {
        chunk_id: row.get("chunk_id"),
        priority: row.get("priority"),
        status: status.parse()?,
        retry_count: row.get("retry_count"),
        max_retries: row.get("max_retries"),
        created_at: row.get("created_at"),
        next_retry_at: row.get("next_retry_at"),
        last_error: row.get("last_error"),
    })
}
