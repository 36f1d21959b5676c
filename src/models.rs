//! Core data models for transcripts, turns, chunks and indexing state.
//!
//! ```text
//! transcript file ──▶ Message[] ──▶ ConversationTurn[] ──▶ KnowledgeChunk[]
//!                                                             │
//!                                    IndexStatus (per file) ◀─┤
//!                                    EnrichmentTask (per chunk) ◀┘
//! ```
//!
//! Timestamps on messages, turns and chunks are Unix milliseconds.
//! Bookkeeping times (`indexed_at`, `last_indexed_at`, `created_at`) are
//! Unix seconds. `file_mtime` is Unix nanoseconds so that two writes within
//! the same second still compare as different.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// Number of characters kept in a user query preview.
pub const QUERY_PREVIEW_LEN: usize = 200;

/// Speaker of a transcript message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// A tool invocation recorded inside an assistant message.
///
/// Arguments are a loose key/value bag since the transcript format is
/// semi-structured text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCall {
    pub name: String,
    pub arguments: BTreeMap<String, String>,
}

/// A fenced code block found in an assistant message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeBlock {
    pub language: String,
    pub code: String,
}

/// One parsed transcript message. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub text: String,
    pub timestamp: i64,
    #[serde(default)]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default)]
    pub code_blocks: Vec<CodeBlock>,
}

impl Message {
    pub fn user(text: impl Into<String>, timestamp: i64) -> Self {
        Self {
            role: Role::User,
            text: text.into(),
            timestamp,
            tool_calls: Vec::new(),
            code_blocks: Vec::new(),
        }
    }

    pub fn assistant(text: impl Into<String>, timestamp: i64) -> Self {
        Self {
            role: Role::Assistant,
            text: text.into(),
            timestamp,
            tool_calls: Vec::new(),
            code_blocks: Vec::new(),
        }
    }
}

/// One logical user/assistant exchange within a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationTurn {
    /// 0-based position within the session; stable across re-parses.
    pub turn_index: usize,
    pub user_messages: Vec<Message>,
    pub ai_messages: Vec<Message>,
    pub user_text: String,
    pub ai_text: String,
    pub combined_text: String,
    pub tools: Vec<ToolCall>,
    pub timestamp: i64,
    /// No assistant reply yet. Never embedded or enriched.
    pub is_incomplete: bool,
}

/// Lifecycle of a chunk's enrichment and of its queue task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnrichmentStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl EnrichmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnrichmentStatus::Pending => "pending",
            EnrichmentStatus::Processing => "processing",
            EnrichmentStatus::Completed => "completed",
            EnrichmentStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for EnrichmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EnrichmentStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(EnrichmentStatus::Pending),
            "processing" => Ok(EnrichmentStatus::Processing),
            "completed" => Ok(EnrichmentStatus::Completed),
            "failed" => Ok(EnrichmentStatus::Failed),
            other => anyhow::bail!("unknown enrichment status: {}", other),
        }
    }
}

/// The indexable unit derived from one completed turn.
///
/// One chunk corresponds to exactly one vector point keyed by `id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeChunk {
    pub id: String,
    pub session_id: String,
    pub chunk_index: i64,
    pub project_id: String,
    pub project_name: String,
    pub workspace_id: String,
    pub user_query: String,
    pub ai_response_core: String,
    pub vector_text: String,
    pub tools_used: Vec<String>,
    pub files_modified: Vec<String>,
    pub code_languages: Vec<String>,
    pub has_code: bool,
    pub summary: String,
    pub main_topic: String,
    pub tags: Vec<String>,
    pub enrichment_status: EnrichmentStatus,
    pub enrichment_error: String,
    pub timestamp: i64,
    pub content_hash: String,
    pub file_path: String,
    pub indexed_at: i64,
}

impl KnowledgeChunk {
    /// First [`QUERY_PREVIEW_LEN`] characters of the user query, with an
    /// ellipsis when cut.
    pub fn user_query_preview(&self) -> String {
        preview(&self.user_query, QUERY_PREVIEW_LEN)
    }

    pub fn is_enriched(&self) -> bool {
        !self.summary.is_empty()
    }
}

/// Char-safe prefix of `text` with `...` appended when it was cut.
pub fn preview(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}

/// Summary fields written back onto a chunk by the enrichment worker.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkEnrichment {
    pub summary: String,
    pub main_topic: String,
    pub tags: Vec<String>,
}

/// Indexing state of one transcript file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexState {
    Indexed,
    Indexing,
    Failed,
}

impl IndexState {
    pub fn as_str(&self) -> &'static str {
        match self {
            IndexState::Indexed => "indexed",
            IndexState::Indexing => "indexing",
            IndexState::Failed => "failed",
        }
    }
}

impl FromStr for IndexState {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "indexed" => Ok(IndexState::Indexed),
            "indexing" => Ok(IndexState::Indexing),
            "failed" => Ok(IndexState::Failed),
            other => anyhow::bail!("unknown index state: {}", other),
        }
    }
}

/// Per-file record of the last successful index.
///
/// `content_hash` (SHA-256 of the raw bytes) decides whether a file needs
/// reindexing; `file_mtime` is only a cheap pre-filter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexStatus {
    pub file_path: String,
    pub session_id: String,
    pub project_id: String,
    pub content_hash: String,
    pub chunk_count: i64,
    pub file_mtime: i64,
    pub last_indexed_at: i64,
    pub status: IndexState,
}

/// A queued enrichment job. At most one per chunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnrichmentTask {
    pub chunk_id: String,
    pub priority: i64,
    pub status: EnrichmentStatus,
    pub retry_count: i64,
    pub max_retries: i64,
    pub created_at: i64,
    pub next_retry_at: Option<i64>,
    pub last_error: Option<String>,
}

impl EnrichmentTask {
    pub fn new(chunk_id: impl Into<String>, created_at: i64) -> Self {
        Self {
            chunk_id: chunk_id.into(),
            priority: 0,
            status: EnrichmentStatus::Pending,
            retry_count: 0,
            max_retries: 3,
            created_at,
            next_retry_at: None,
            last_error: None,
        }
    }
}

/// Task counts by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub pending: i64,
    pub processing: i64,
    pub completed: i64,
    pub failed: i64,
}

/// Aggregate index counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IndexStats {
    pub total_files: i64,
    pub total_chunks: i64,
    pub last_scan_time: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkspaceInfo {
    pub workspace_id: String,
    pub path: Option<PathBuf>,
}

/// Project identity as reported by the project directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectInfo {
    pub project_id: String,
    pub project_name: String,
    #[serde(default)]
    pub workspaces: Vec<WorkspaceInfo>,
}

impl ProjectInfo {
    /// Placeholder used when the directory cannot resolve a session's project.
    pub fn unknown() -> Self {
        Self {
            project_id: "unknown".to_string(),
            project_name: "Unknown".to_string(),
            workspaces: Vec::new(),
        }
    }

    pub fn primary_workspace_id(&self) -> &str {
        self.workspaces
            .first()
            .map(|w| w.workspace_id.as_str())
            .unwrap_or("")
    }
}
