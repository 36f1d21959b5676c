//! Semantic search over indexed chunks.
//!
//! The read path never touches the transcript tree:
//!
//! ```text
//! query ─▶ embed ─▶ vector query (optional project filter) ─▶ ChunkSearchResult
//! chunk_id ─▶ metadata store ─▶ ChunkDetail
//! ```
//!
//! Project filtering: one ID is a `must` match, several IDs are `should`
//! (any of), none means no filter.

use anyhow::{bail, Context, Result};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;

use crate::embedding::{embed_query, EmbeddingProvider};
use crate::models::KnowledgeChunk;
use crate::repository::ChunkRepository;
use crate::vector::{Filter, Payload, ScoredPoint, VectorStore};

pub const DEFAULT_LIMIT: usize = 10;
pub const MAX_LIMIT: usize = 100;

/// One search hit, built from the vector payload alone.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ChunkSearchResult {
    pub chunk_id: String,
    pub session_id: String,
    pub score: f32,
    pub project_id: String,
    pub project_name: String,
    pub user_query_preview: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub summary: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub main_topic: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tools_used: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub files_modified: Vec<String>,
    pub has_code: bool,
    pub timestamp: i64,
    pub is_enriched: bool,
}

/// Full chunk for drill-down after a hit.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChunkDetail {
    #[serde(flatten)]
    pub result: ChunkSearchResult,
    pub user_query: String,
    pub ai_response_core: String,
    pub code_languages: Vec<String>,
    pub enrichment_status: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub enrichment_error: String,
}

impl From<KnowledgeChunk> for ChunkDetail {
    fn from(chunk: KnowledgeChunk) -> Self {
        let result = ChunkSearchResult {
            chunk_id: chunk.id.clone(),
            session_id: chunk.session_id.clone(),
            score: 0.0,
            project_id: chunk.project_id.clone(),
            project_name: chunk.project_name.clone(),
            user_query_preview: chunk.user_query_preview(),
            is_enriched: chunk.is_enriched(),
            summary: chunk.summary,
            main_topic: chunk.main_topic,
            tags: chunk.tags,
            tools_used: chunk.tools_used,
            files_modified: chunk.files_modified,
            has_code: chunk.has_code,
            timestamp: chunk.timestamp,
        };
        Self {
            result,
            user_query: chunk.user_query,
            ai_response_core: chunk.ai_response_core,
            code_languages: chunk.code_languages,
            enrichment_status: chunk.enrichment_status.as_str().to_string(),
            enrichment_error: chunk.enrichment_error,
        }
    }
}

pub struct SearchService {
    embedder: Arc<dyn EmbeddingProvider>,
    store: Arc<dyn VectorStore>,
    collection: String,
    chunks: ChunkRepository,
}

impl SearchService {
    pub fn new(
        embedder: Arc<dyn EmbeddingProvider>,
        store: Arc<dyn VectorStore>,
        collection: impl Into<String>,
        chunks: ChunkRepository,
    ) -> Self {
        Self {
            embedder,
            store,
            collection: collection.into(),
            chunks,
        }
    }

    /// Top-`limit` chunks for `query`, optionally restricted to projects.
    ///
    /// A `limit` of 0 means [`DEFAULT_LIMIT`]; anything above [`MAX_LIMIT`] is capped.
    pub async fn search(
        &self,
        query: &str,
        project_ids: &[String],
        limit: usize,
    ) -> Result<Vec<ChunkSearchResult>> {
        if query.trim().is_empty() {
            bail!("search query is empty");
        }
        let limit = clamp_limit(limit);
        tracing::info!(query, limit, projects = ?project_ids, "search");

        let vector = embed_query(self.embedder.as_ref(), query)
            .await
            .context("failed to embed query")?;
        if vector.is_empty() {
            bail!("invalid embedding result: empty vector");
        }

        let filter = project_filter(project_ids);
        let hits = self
            .store
            .query(&self.collection, &vector, filter.as_ref(), limit)
            .await
            .context("vector query failed")?;

        let results: Vec<ChunkSearchResult> = hits.iter().map(hit_to_result).collect();
        tracing::debug!(results = results.len(), "search completed");
        Ok(results)
    }

    pub async fn get_chunk_detail(&self, chunk_id: &str) -> Result<ChunkDetail> {
        match self.chunks.get_chunk(chunk_id).await? {
            Some(chunk) => Ok(chunk.into()),
            None => bail!("chunk not found: {}", chunk_id),
        }
    }
}

/// CLI entry point: run the search and print results to stdout.
pub async fn run_search(
    rt: &crate::runtime::Runtime,
    query: &str,
    project_ids: &[String],
    limit: usize,
    json: bool,
) -> Result<()> {
    let results = rt.rag()?.search.search(query, project_ids, limit).await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&results)?);
        return Ok(());
    }
    if results.is_empty() {
        println!("No results.");
        return Ok(());
    }

    for (i, r) in results.iter().enumerate() {
        println!(
            "{}. [{:.3}] {} / {}",
            i + 1,
            r.score,
            r.project_name,
            r.session_id
        );
        println!("    id: {}", r.chunk_id);
        if r.is_enriched {
            println!("    {}: {}", r.main_topic, r.summary);
        }
        println!("    > {}", r.user_query_preview.replace('\n', " "));
        if !r.tools_used.is_empty() {
            println!("    tools: {}", r.tools_used.join(", "));
        }
        if !r.files_modified.is_empty() {
            println!("    files: {}", r.files_modified.join(", "));
        }
        println!();
    }
    Ok(())
}

pub fn clamp_limit(limit: usize) -> usize {
    match limit {
        0 => DEFAULT_LIMIT,
        n => n.min(MAX_LIMIT),
    }
}

pub fn project_filter(project_ids: &[String]) -> Option<Filter> {
    match project_ids {
        [] => None,
        [one] => Some(Filter::must("project_id", one.as_str())),
        many => Some(Filter::should_any("project_id", many)),
    }
}

fn str_field(payload: &Payload, key: &str) -> String {
    payload
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

/// List fields are stored as JSON-encoded strings; arrays are accepted too.
fn list_field(payload: &Payload, key: &str) -> Vec<String> {
    match payload.get(key) {
        Some(Value::String(s)) if !s.is_empty() => serde_json::from_str(s).unwrap_or_default(),
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect(),
        _ => Vec::new(),
    }
}

fn hit_to_result(hit: &ScoredPoint) -> ChunkSearchResult {
    let p = &hit.payload;
    let summary = str_field(p, "summary");
    ChunkSearchResult {
        chunk_id: match str_field(p, "chunk_id") {
            id if id.is_empty() => hit.id.clone(),
            id => id,
        },
        session_id: str_field(p, "session_id"),
        score: hit.score,
        project_id: str_field(p, "project_id"),
        project_name: str_field(p, "project_name"),
        user_query_preview: str_field(p, "user_query_preview"),
        is_enriched: !summary.is_empty(),
        summary,
        main_topic: str_field(p, "main_topic"),
        tags: list_field(p, "tags"),
        tools_used: list_field(p, "tools_used"),
        files_modified: list_field(p, "files_modified"),
        has_code: p.get("has_code").and_then(Value::as_bool).unwrap_or(false),
        timestamp: p.get("timestamp").and_then(Value::as_i64).unwrap_or(0),
    }
}
