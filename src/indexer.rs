//! Chunk indexer: transcript session → knowledge chunks → vectors.
//!
//! ```text
//! session_messages ─▶ pair_messages ─▶ extract_turn (complete turns only)
//!        │
//!        ▼
//!  embed vector_text (one batch) ─▶ upsert points ─▶ save chunks ─▶ save IndexStatus
//!                                                                        │
//!                                                        enqueue enrichment (best effort)
//! ```
//!
//! The stored mtime and content hash are taken before the transcript is
//! read, never after.
//!
//! Chunk IDs are a UUIDv5 of `(session_id, chunk_index)`, so reindexing a
//! session overwrites the same points and rows instead of duplicating them.

use anyhow::{bail, Context, Result};
use serde_json::json;
use sha2::{Digest, Sha256};
use sqlx::SqlitePool;
use std::path::Path;
use std::sync::Arc;
use std::time::UNIX_EPOCH;
use uuid::Uuid;

use crate::embedding::EmbeddingProvider;
use crate::extract::extract_turn;
use crate::models::{
    EnrichmentStatus, EnrichmentTask, IndexState, IndexStats, IndexStatus, KnowledgeChunk,
    ProjectInfo,
};
use crate::pairing::pair_messages;
use crate::repository::{ChunkRepository, EnrichmentQueue, IndexStatusRepository};
use crate::session::{ProjectDirectory, SessionTextProvider};
use crate::vector::{self, sanitize_utf8, Filter, Payload, Point, VectorStore};

/// Deterministic chunk ID for one turn of one session.
pub fn chunk_id(session_id: &str, chunk_index: i64) -> String {
    Uuid::new_v5(
        &Uuid::NAMESPACE_OID,
        format!("{}:{}", session_id, chunk_index).as_bytes(),
    )
    .to_string()
}

/// SHA-256 hex digest of a file's bytes.
pub async fn hash_file(path: &Path) -> Result<String> {
    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    Ok(hex::encode(Sha256::digest(&bytes)))
}

/// Modification time in Unix nanoseconds, at whatever resolution the
/// filesystem records.
pub fn mtime_nanos(path: &Path) -> Result<i64> {
    let modified = std::fs::metadata(path)
        .and_then(|m| m.modified())
        .with_context(|| format!("stat {}", path.display()))?;
    Ok(modified
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_nanos()).unwrap_or(i64::MAX))
        .unwrap_or(0))
}

/// Vector payload for a freshly indexed chunk.
pub fn chunk_payload(chunk: &KnowledgeChunk) -> Payload {
    let mut payload = Payload::new();
    payload.insert("chunk_id".into(), json!(chunk.id));
    payload.insert("session_id".into(), json!(chunk.session_id));
    payload.insert("project_id".into(), json!(sanitize_utf8(&chunk.project_id)));
    payload.insert("project_name".into(), json!(sanitize_utf8(&chunk.project_name)));
    payload.insert("timestamp".into(), json!(chunk.timestamp));
    payload.insert("has_code".into(), json!(chunk.has_code));
    payload.insert(
        "tools_used".into(),
        json!(serde_json::to_string(&chunk.tools_used).unwrap_or_default()),
    );
    payload.insert(
        "files_modified".into(),
        json!(serde_json::to_string(&chunk.files_modified).unwrap_or_default()),
    );
    payload.insert(
        "user_query_preview".into(),
        json!(sanitize_utf8(&chunk.user_query_preview())),
    );
    payload
}

pub struct ChunkIndexer {
    sessions: Arc<dyn SessionTextProvider>,
    projects: Arc<dyn ProjectDirectory>,
    embedder: Arc<dyn EmbeddingProvider>,
    store: Arc<dyn VectorStore>,
    collection: String,
    chunks: ChunkRepository,
    index_status: IndexStatusRepository,
    queue: EnrichmentQueue,
}

impl ChunkIndexer {
    pub fn new(
        pool: SqlitePool,
        sessions: Arc<dyn SessionTextProvider>,
        projects: Arc<dyn ProjectDirectory>,
        embedder: Arc<dyn EmbeddingProvider>,
        store: Arc<dyn VectorStore>,
        collection: impl Into<String>,
    ) -> Self {
        Self {
            sessions,
            projects,
            embedder,
            store,
            collection: collection.into(),
            chunks: ChunkRepository::new(pool.clone()),
            index_status: IndexStatusRepository::new(pool.clone()),
            queue: EnrichmentQueue::new(pool),
        }
    }

    pub fn chunks(&self) -> &ChunkRepository {
        &self.chunks
    }

    pub fn index_status(&self) -> &IndexStatusRepository {
        &self.index_status
    }

    pub fn queue(&self) -> &EnrichmentQueue {
        &self.queue
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    /// Create the chunk collection if missing. Returns the vector dimension.
    pub async fn ensure_collection(&self) -> Result<usize> {
        let dims = self.embedder.vector_dimension().await?;
        vector::ensure_collections(self.store.as_ref(), &[&self.collection], dims).await?;
        Ok(dims)
    }

    async fn project_info(&self, session_id: &str) -> ProjectInfo {
        match self.projects.project_for_session(session_id).await {
            Ok(Some(info)) => info,
            Ok(None) => ProjectInfo::unknown(),
            Err(e) => {
                tracing::warn!(session_id, error = %e, "project lookup failed");
                ProjectInfo::unknown()
            }
        }
    }

    /// Index every complete turn of a session. Returns the number of chunks written.
    pub async fn index_session(&self, session_id: &str, file_path: &Path) -> Result<usize> {
        tracing::debug!(session_id, file = %file_path.display(), "indexing session");

        let project = self.project_info(session_id).await;

        // Stamp the file before reading it: an append that races the read
        // leaves a stale hash behind, so the next check sees the file dirty.
        let file_mtime = mtime_nanos(file_path)?;
        let content_hash = hash_file(file_path).await?;

        let messages = self
            .sessions
            .session_messages(session_id)
            .await
            .with_context(|| format!("loading session {}", session_id))?;
        if messages.is_empty() {
            tracing::debug!(session_id, "no messages, skipping");
            return Ok(0);
        }

        let turns = pair_messages(&messages);
        let indexed_at = chrono::Utc::now().timestamp();
        let file_path_str = file_path.to_string_lossy().into_owned();

        let mut chunks = Vec::with_capacity(turns.len());
        for turn in turns.iter().filter(|t| !t.is_incomplete) {
            let content = extract_turn(turn);
            if content.is_empty() {
                continue;
            }
            let chunk_index = turn.turn_index as i64;
            chunks.push(KnowledgeChunk {
                id: chunk_id(session_id, chunk_index),
                session_id: session_id.to_string(),
                chunk_index,
                project_id: project.project_id.clone(),
                project_name: project.project_name.clone(),
                workspace_id: project.primary_workspace_id().to_string(),
                user_query: content.user_query,
                ai_response_core: content.ai_response_core,
                vector_text: content.vector_text,
                tools_used: content.tools_used,
                files_modified: content.files_modified,
                code_languages: content.code_languages,
                has_code: content.has_code,
                summary: String::new(),
                main_topic: String::new(),
                tags: Vec::new(),
                enrichment_status: EnrichmentStatus::Pending,
                enrichment_error: String::new(),
                timestamp: turn.timestamp,
                content_hash: content_hash.clone(),
                file_path: file_path_str.clone(),
                indexed_at,
            });
        }

        if chunks.is_empty() {
            tracing::info!(session_id, "no indexable turns");
            return Ok(0);
        }

        let texts: Vec<String> = chunks.iter().map(|c| c.vector_text.clone()).collect();
        let vectors = self
            .embedder
            .embed_texts(&texts)
            .await
            .with_context(|| format!("embedding session {}", session_id))?;
        if vectors.len() != chunks.len() {
            bail!(
                "embedding returned {} vectors for {} chunks",
                vectors.len(),
                chunks.len()
            );
        }

        let points: Vec<Point> = chunks
            .iter()
            .zip(vectors)
            .map(|(chunk, vector)| Point {
                id: chunk.id.clone(),
                vector,
                payload: chunk_payload(chunk),
            })
            .collect();
        self.store
            .upsert(&self.collection, points)
            .await
            .context("upserting chunk vectors")?;

        self.chunks.save_chunks(&chunks).await?;

        self.index_status
            .save(&IndexStatus {
                file_path: file_path_str,
                session_id: session_id.to_string(),
                project_id: project.project_id.clone(),
                content_hash,
                chunk_count: chunks.len() as i64,
                file_mtime,
                last_indexed_at: indexed_at,
                status: IndexState::Indexed,
            })
            .await?;

        let tasks: Vec<EnrichmentTask> = chunks
            .iter()
            .map(|c| EnrichmentTask::new(c.id.clone(), indexed_at))
            .collect();
        if let Err(e) = self.queue.enqueue_tasks(&tasks).await {
            tracing::warn!(session_id, error = %e, "failed to enqueue enrichment tasks");
        }

        tracing::info!(session_id, chunks = chunks.len(), "session indexed");
        Ok(chunks.len())
    }

    /// Remove a session from both the metadata store and the vector store.
    pub async fn delete_session_chunks(&self, session_id: &str) -> Result<u64> {
        let deleted = self.chunks.delete_chunks_by_session(session_id).await?;
        self.store
            .delete_by_filter(&self.collection, &Filter::must("session_id", session_id))
            .await?;
        tracing::info!(session_id, deleted, "session chunks deleted");
        Ok(deleted)
    }

    pub async fn index_stats(&self) -> Result<IndexStats> {
        Ok(IndexStats {
            total_files: self.index_status.count().await?,
            total_chunks: self.chunks.count_chunks().await?,
            last_scan_time: self.index_status.last_indexed_at().await?,
        })
    }

    /// Drop all indexed data and recreate an empty collection.
    pub async fn clear_all(&self) -> Result<()> {
        self.queue.clear().await?;
        self.chunks.clear().await?;
        self.index_status.clear().await?;
        vector::clear_collections(self.store.as_ref(), &[&self.collection]).await?;
        self.ensure_collection().await?;
        tracing::info!("index cleared");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_ids_are_stable_and_distinct() {
        assert_eq!(chunk_id("s", 0), chunk_id("s", 0));
        assert_ne!(chunk_id("s", 0), chunk_id("s", 1));
        assert_ne!(chunk_id("s", 0), chunk_id("t", 0));
        assert!(Uuid::parse_str(&chunk_id("s", 3)).is_ok());
    }

    #[tokio::test]
    async fn hashes_file_contents() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("f.txt");
        std::fs::write(&path, "abc").unwrap();
        assert_eq!(
            hash_file(&path).await.unwrap(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert!(mtime_nanos(&path).unwrap() > 1_000_000_000_000_000_000);
    }
}
