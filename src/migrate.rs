use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    apply(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Create all tables and indexes. Idempotent.
pub async fn apply(pool: &SqlitePool) -> Result<()> {
    // Knowledge chunks: one row per completed turn
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS rag_knowledge_chunks (
            id TEXT PRIMARY KEY,
            session_id TEXT NOT NULL,
            chunk_index INTEGER NOT NULL,
            project_id TEXT NOT NULL DEFAULT '',
            project_name TEXT NOT NULL DEFAULT '',
            workspace_id TEXT NOT NULL DEFAULT '',
            user_query TEXT NOT NULL DEFAULT '',
            ai_response_core TEXT NOT NULL DEFAULT '',
            vector_text TEXT NOT NULL DEFAULT '',
            tools_used TEXT NOT NULL DEFAULT '[]',
            files_modified TEXT NOT NULL DEFAULT '[]',
            code_languages TEXT NOT NULL DEFAULT '[]',
            has_code INTEGER NOT NULL DEFAULT 0,
            summary TEXT NOT NULL DEFAULT '',
            main_topic TEXT NOT NULL DEFAULT '',
            tags TEXT NOT NULL DEFAULT '[]',
            enrichment_status TEXT NOT NULL DEFAULT 'pending',
            enrichment_error TEXT NOT NULL DEFAULT '',
            timestamp INTEGER NOT NULL,
            content_hash TEXT NOT NULL DEFAULT '',
            file_path TEXT NOT NULL DEFAULT '',
            indexed_at INTEGER NOT NULL,
            UNIQUE(session_id, chunk_index)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Per-file index bookkeeping
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS rag_index_status (
            file_path TEXT PRIMARY KEY,
            session_id TEXT NOT NULL,
            project_id TEXT NOT NULL DEFAULT '',
            content_hash TEXT NOT NULL DEFAULT '',
            chunk_count INTEGER NOT NULL DEFAULT 0,
            file_mtime INTEGER NOT NULL DEFAULT 0,
            last_indexed_at INTEGER NOT NULL,
            status TEXT NOT NULL DEFAULT 'indexed'
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Enrichment work queue
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS rag_enrichment_queue (
            chunk_id TEXT PRIMARY KEY,
            priority INTEGER NOT NULL DEFAULT 0,
            status TEXT NOT NULL DEFAULT 'pending',
            retry_count INTEGER NOT NULL DEFAULT 0,
            max_retries INTEGER NOT NULL DEFAULT 3,
            created_at INTEGER NOT NULL,
            next_retry_at INTEGER,
            last_error TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Create indexes
    for statement in [
        "CREATE INDEX IF NOT EXISTS idx_rag_chunks_session ON rag_knowledge_chunks(session_id)",
        "CREATE INDEX IF NOT EXISTS idx_rag_chunks_project ON rag_knowledge_chunks(project_id)",
        "CREATE INDEX IF NOT EXISTS idx_rag_chunks_enrichment ON rag_knowledge_chunks(enrichment_status)",
        "CREATE INDEX IF NOT EXISTS idx_rag_chunks_timestamp ON rag_knowledge_chunks(timestamp DESC)",
        "CREATE INDEX IF NOT EXISTS idx_rag_queue_status ON rag_enrichment_queue(status, priority DESC, created_at)",
    ] {
        sqlx::query(statement).execute(pool).await?;
    }

    Ok(())
}
