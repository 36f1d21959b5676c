//! Index statistics and health overview.
//!
//! Summarizes what is indexed: transcript files, chunks, enrichment queue
//! state and a per-project breakdown. Used by `srag stats`.

use anyhow::Result;
use serde::Serialize;
use sqlx::{Row, SqlitePool};

use crate::models::{IndexStats, QueueStats};
use crate::runtime::Runtime;

/// Per-project breakdown of chunk counts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProjectStats {
    pub project_id: String,
    pub project_name: String,
    pub chunk_count: i64,
    pub enriched_count: i64,
    pub last_indexed_at: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatsReport {
    pub index: IndexStats,
    pub queue: QueueStats,
    pub projects: Vec<ProjectStats>,
    pub vector_points: Option<u64>,
}

pub async fn project_stats(pool: &SqlitePool) -> Result<Vec<ProjectStats>> {
    let rows = sqlx::query(
        r#"
        SELECT
            project_id,
            MAX(project_name) AS project_name,
            COUNT(*) AS chunk_count,
            SUM(CASE WHEN summary != '' THEN 1 ELSE 0 END) AS enriched_count,
            MAX(indexed_at) AS last_indexed_at
        FROM rag_knowledge_chunks
        GROUP BY project_id
        ORDER BY chunk_count DESC, project_id ASC
        "#,
    )
    .fetch_all(pool)
    .await?;

    Ok(rows
        .iter()
        .map(|row| ProjectStats {
            project_id: row.get("project_id"),
            project_name: row.get("project_name"),
            chunk_count: row.get("chunk_count"),
            enriched_count: row.get("enriched_count"),
            last_indexed_at: row.get("last_indexed_at"),
        })
        .collect())
}

pub async fn collect(rt: &Runtime) -> Result<StatsReport> {
    let rag = rt.rag()?;
    let vector_points = match rag.store.count(rag.indexer.collection()).await {
        Ok(n) => Some(n),
        Err(e) => {
            tracing::warn!(error = %e, "vector count unavailable");
            None
        }
    };
    Ok(StatsReport {
        index: rag.scanner.index_stats().await?,
        queue: rag.enrichment.queue_stats().await?,
        projects: project_stats(&rt.pool).await?,
        vector_points,
    })
}

/// Run the stats command and print a summary.
pub async fn run_stats(rt: &Runtime, json: bool) -> Result<()> {
    let report = collect(rt).await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    let db_size = std::fs::metadata(&rt.config.db.path)
        .map(|m| m.len())
        .unwrap_or(0);

    println!("Session RAG — Index Stats");
    println!("=========================");
    println!();
    println!("  Database:    {}", rt.config.db.path.display());
    println!("  Size:        {}", format_bytes(db_size));
    println!();
    println!("  Files:       {}", report.index.total_files);
    println!("  Chunks:      {}", report.index.total_chunks);
    if let Some(points) = report.vector_points {
        println!("  Vectors:     {}", points);
    }
    println!(
        "  Last scan:   {}",
        report
            .index
            .last_scan_time
            .map(format_ts_relative)
            .unwrap_or_else(|| "never".to_string())
    );
    println!();
    println!(
        "  Enrichment:  {} pending, {} processing, {} completed, {} failed",
        report.queue.pending, report.queue.processing, report.queue.completed, report.queue.failed
    );

    if !report.projects.is_empty() {
        println!();
        println!("  By project:");
        println!(
            "  {:<32} {:>8} {:>9}   {}",
            "PROJECT", "CHUNKS", "ENRICHED", "LAST INDEXED"
        );
        println!("  {}", "-".repeat(70));
        for p in &report.projects {
            let name = if p.project_name.is_empty() {
                &p.project_id
            } else {
                &p.project_name
            };
            println!(
                "  {:<32} {:>8} {:>9}   {}",
                name,
                p.chunk_count,
                p.enriched_count,
                p.last_indexed_at
                    .map(format_ts_relative)
                    .unwrap_or_else(|| "never".to_string())
            );
        }
    }
    println!();
    Ok(())
}

/// Format a byte count as a human-readable string.
fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

/// Format a Unix timestamp as a relative time string (e.g. "3 hours ago").
pub fn format_ts_relative(ts: i64) -> String {
    let delta = chrono::Utc::now().timestamp() - ts;
    if delta < 0 {
        return format_ts_iso(ts);
    }
    if delta < 60 {
        "just now".to_string()
    } else if delta < 3600 {
        let mins = delta / 60;
        format!("{} min{} ago", mins, if mins == 1 { "" } else { "s" })
    } else if delta < 86400 {
        let hours = delta / 3600;
        format!("{} hour{} ago", hours, if hours == 1 { "" } else { "s" })
    } else if delta < 86400 * 30 {
        let days = delta / 86400;
        format!("{} day{} ago", days, if days == 1 { "" } else { "s" })
    } else {
        format_ts_iso(ts)
    }
}

pub fn format_ts_iso(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| ts.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bytes_are_humanized() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.0 KB");
        assert_eq!(format_bytes(3 * 1024 * 1024), "3.0 MB");
    }

    #[test]
    fn recent_timestamps_are_relative() {
        let now = chrono::Utc::now().timestamp();
        assert_eq!(format_ts_relative(now), "just now");
        assert_eq!(format_ts_relative(now - 7200), "2 hours ago");
        assert_eq!(format_ts_iso(0), "1970-01-01 00:00");
    }
}
