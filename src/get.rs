//! Chunk retrieval by ID.
//!
//! Drill-down after a search hit: prints the full turn, extracted signals
//! and enrichment state. Used by `srag get`.

use anyhow::Result;

use crate::runtime::Runtime;
use crate::search::ChunkDetail;
use crate::stats::format_ts_iso;

/// CLI entry point: fetch the chunk and print it to stdout.
pub async fn run_get(rt: &Runtime, chunk_id: &str, json: bool) -> Result<()> {
    let detail = rt.rag()?.search.get_chunk_detail(chunk_id).await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&detail)?);
    } else {
        print_detail(&detail);
    }
    Ok(())
}

fn print_detail(d: &ChunkDetail) {
    let r = &d.result;
    println!("--- Chunk ---");
    println!("id:           {}", r.chunk_id);
    println!("session:      {}", r.session_id);
    println!("project:      {} ({})", r.project_name, r.project_id);
    println!("timestamp:    {}", format_ts_iso(r.timestamp / 1000));
    println!("has_code:     {}", r.has_code);
    if !d.code_languages.is_empty() {
        println!("languages:    {}", d.code_languages.join(", "));
    }
    if !r.tools_used.is_empty() {
        println!("tools:        {}", r.tools_used.join(", "));
    }
    if !r.files_modified.is_empty() {
        println!("files:        {}", r.files_modified.join(", "));
    }
    print!("enrichment:   {}", d.enrichment_status);
    if !d.enrichment_error.is_empty() {
        print!(" ({})", d.enrichment_error);
    }
    println!();
    println!();

    if r.is_enriched {
        println!("--- Summary ---");
        println!("topic: {}", r.main_topic);
        println!("{}", r.summary);
        if !r.tags.is_empty() {
            println!("tags: {}", r.tags.join(", "));
        }
        println!();
    }

    println!("--- User ---");
    println!("{}", d.user_query);
    println!();
    println!("--- Assistant ---");
    println!("{}", d.ai_response_core);
}
