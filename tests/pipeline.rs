//! End-to-end tests for the indexing, enrichment and search pipeline.
//!
//! Everything runs against a temp SQLite database, an on-disk transcript
//! tree, a deterministic bag-of-words embedder and the in-memory vector
//! store, so no network or Qdrant process is needed.

use anyhow::Result;
use async_trait::async_trait;
use session_rag::config::{self, Config};
use session_rag::embedding::EmbeddingProvider;
use session_rag::llm::{Summarizer, TurnSummary};
use session_rag::models::{EnrichmentStatus, Message};
use session_rag::progress::{ScanProgress, ScanProgressReporter, ScanStatus};
use session_rag::runtime::{RagParts, RagServices, Runtime};
use session_rag::session::{FsSessions, SessionTextProvider};
use session_rag::vector::{MemoryStore, VectorStore};
use session_rag::{db, migrate};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tempfile::TempDir;

const DIMS: usize = 256;
const COLLECTION: &str = "test_chunks";

// ─── Test doubles ───────────────────────────────────────────────────

/// Hashes lowercase words into a fixed number of buckets.
struct BagOfWords;

fn bag_of_words(text: &str) -> Vec<f32> {
    let mut v = vec![0.01f32; DIMS];
    for word in text
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
    {
        let bucket = word
            .to_lowercase()
            .bytes()
            .fold(7usize, |h, b| h.wrapping_mul(31).wrapping_add(b as usize))
            % DIMS;
        v[bucket] += 1.0;
    }
    v
}

#[async_trait]
impl EmbeddingProvider for BagOfWords {
    fn model_name(&self) -> &str {
        "bag-of-words"
    }

    fn configured_dims(&self) -> Option<usize> {
        Some(DIMS)
    }

    async fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| bag_of_words(t)).collect())
    }
}

/// Bag of words, except that any text containing `marker` panics.
struct PanicsOn(&'static str);

#[async_trait]
impl EmbeddingProvider for PanicsOn {
    fn model_name(&self) -> &str {
        "panics-on"
    }

    fn configured_dims(&self) -> Option<usize> {
        Some(DIMS)
    }

    async fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.iter().any(|t| t.contains(self.0)) {
            panic!("embedder blew up on {}", self.0);
        }
        Ok(texts.iter().map(|t| bag_of_words(t)).collect())
    }
}

/// Reads the transcript, then appends one more turn to it, the way a
/// session that is still being written races the indexer.
struct AppendAfterRead {
    inner: FsSessions,
    path: PathBuf,
    appended: AtomicBool,
}

#[async_trait]
impl SessionTextProvider for AppendAfterRead {
    async fn session_messages(&self, session_id: &str) -> Result<Vec<Message>> {
        let messages = self.inner.session_messages(session_id).await?;
        if !self.appended.swap(true, Ordering::SeqCst) {
            let mut file = std::fs::File::options().append(true).open(&self.path)?;
            file.write_all(b"user:\nand the tests?\nassistant:\nAdded them.\n")?;
            file.set_modified(SystemTime::now() + Duration::from_secs(5))?;
        }
        Ok(messages)
    }
}

struct TopicSummarizer;

#[async_trait]
impl Summarizer for TopicSummarizer {
    async fn summarize(&self, user_text: &str, _ai_text: &str) -> Result<TurnSummary> {
        Ok(TurnSummary {
            summary: format!("Resolved: {}", user_text),
            main_topic: "debugging".into(),
            tags: vec!["bugfix".into()],
            ..TurnSummary::default()
        })
    }
}

#[derive(Default)]
struct RecordingReporter {
    snapshots: Mutex<Vec<ScanProgress>>,
}

impl ScanProgressReporter for RecordingReporter {
    fn report(&self, progress: &ScanProgress) {
        self.snapshots.lock().unwrap().push(progress.clone());
    }
}

// ─── Harness ────────────────────────────────────────────────────────

struct Harness {
    _tmp: TempDir,
    root: PathBuf,
    store: Arc<MemoryStore>,
    rag: RagServices,
}

fn test_config(tmp: &Path) -> Config {
    let toml_str = format!(
        r#"
[db]
path = {:?}

[transcripts]
root = {:?}

[vector]
managed = false
collection = "{}"

[scan]
batch_size = 2
concurrency = 2
"#,
        tmp.join("srag.sqlite").to_string_lossy(),
        tmp.join("projects").to_string_lossy(),
        COLLECTION
    );
    let mut config: Config = toml::from_str(&toml_str).unwrap();
    config::validate(&mut config).unwrap();
    config
}

async fn harness(with_llm: bool) -> Harness {
    let summarizer: Option<Arc<dyn Summarizer>> = if with_llm {
        Some(Arc::new(TopicSummarizer))
    } else {
        None
    };
    harness_with(summarizer, Arc::new(BagOfWords), |root| {
        Arc::new(FsSessions::new(root))
    })
    .await
}

async fn harness_with(
    summarizer: Option<Arc<dyn Summarizer>>,
    embedder: Arc<dyn EmbeddingProvider>,
    sessions: impl FnOnce(&Path) -> Arc<dyn SessionTextProvider>,
) -> Harness {
    let tmp = TempDir::new().unwrap();
    let config = test_config(tmp.path());
    let root = config.transcripts.root.clone();
    std::fs::create_dir_all(&root).unwrap();

    let pool = db::connect(&config).await.unwrap();
    migrate::apply(&pool).await.unwrap();

    let store = Arc::new(MemoryStore::new());
    let rag = RagServices::assemble(
        &config,
        pool,
        RagParts {
            sessions: sessions(&root),
            projects: Arc::new(FsSessions::new(root.clone())),
            embedder,
            summarizer,
            store: store.clone(),
        },
    )
    .await
    .unwrap();

    Harness {
        _tmp: tmp,
        root,
        store,
        rag,
    }
}

fn write_transcript(root: &Path, project: &str, session: &str, body: &str) -> PathBuf {
    let dir = root.join(project).join("agent-transcripts");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(format!("{}.txt", session));
    std::fs::write(&path, body).unwrap();
    path
}

fn set_mtime(path: &Path, offset_secs: u64) {
    set_mtime_at(path, SystemTime::now() + Duration::from_secs(offset_secs));
}

fn set_mtime_at(path: &Path, at: SystemTime) {
    let file = std::fs::File::options().write(true).open(path).unwrap();
    file.set_modified(at).unwrap();
}

/// Start of the current wall-clock second.
fn this_second() -> SystemTime {
    let secs = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs();
    UNIX_EPOCH + Duration::from_secs(secs)
}

const FIX_THE_BUG: &str = "user:\nFix the bug\nassistant:\nI fixed it.\n```go\nfunc X(){}\n```\n";

// ─── Indexing ───────────────────────────────────────────────────────

#[tokio::test]
async fn fixed_bug_transcript_becomes_one_pending_chunk() {
    let h = harness(false).await;
    let path = write_transcript(&h.root, "no-such-project", "s1", FIX_THE_BUG);

    let n = h.rag.indexer.index_session("s1", &path).await.unwrap();
    assert_eq!(n, 1);

    let chunks = h.rag.indexer.chunks().get_chunks_by_session("s1").await.unwrap();
    assert_eq!(chunks.len(), 1);
    let chunk = &chunks[0];
    assert_eq!(chunk.user_query, "Fix the bug");
    assert_eq!(chunk.ai_response_core, "I fixed it.");
    assert_eq!(chunk.code_languages, vec!["go".to_string()]);
    assert!(chunk.has_code);
    assert_eq!(chunk.enrichment_status, EnrichmentStatus::Pending);
    assert_eq!(chunk.project_id, "no-such-project");

    assert_eq!(h.store.count(COLLECTION).await.unwrap(), 1);
    assert_eq!(h.rag.enrichment.queue_stats().await.unwrap().pending, 1);

    let stats = h.rag.scanner.index_stats().await.unwrap();
    assert_eq!(stats.total_files, 1);
    assert_eq!(stats.total_chunks, 1);
    assert!(stats.last_scan_time.is_some());
}

#[tokio::test]
async fn reindexing_overwrites_instead_of_duplicating() {
    let h = harness(false).await;
    let path = write_transcript(&h.root, "proj", "s1", FIX_THE_BUG);

    h.rag.indexer.index_session("s1", &path).await.unwrap();
    h.rag.indexer.index_session("s1", &path).await.unwrap();

    assert_eq!(h.rag.indexer.chunks().count_chunks().await.unwrap(), 1);
    assert_eq!(h.store.count(COLLECTION).await.unwrap(), 1);
}

#[tokio::test]
async fn incomplete_trailing_turn_is_not_indexed() {
    let h = harness(false).await;
    let body = format!("{}user:\nand now the tests?\n", FIX_THE_BUG);
    let path = write_transcript(&h.root, "proj", "s1", &body);

    assert_eq!(h.rag.indexer.index_session("s1", &path).await.unwrap(), 1);
}

#[tokio::test]
async fn deleting_a_session_clears_rows_and_vectors() {
    let h = harness(false).await;
    let a = write_transcript(&h.root, "proj", "a", FIX_THE_BUG);
    let b = write_transcript(&h.root, "proj", "b", FIX_THE_BUG);
    h.rag.indexer.index_session("a", &a).await.unwrap();
    h.rag.indexer.index_session("b", &b).await.unwrap();

    assert_eq!(h.rag.indexer.delete_session_chunks("a").await.unwrap(), 1);
    assert!(h.rag.indexer.chunks().get_chunks_by_session("a").await.unwrap().is_empty());
    assert_eq!(h.store.count(COLLECTION).await.unwrap(), 1);
    assert_eq!(h.rag.enrichment.queue_stats().await.unwrap().pending, 1);
}

// ─── Change detection ───────────────────────────────────────────────

#[tokio::test]
async fn needs_reindex_tracks_content_not_just_mtime() {
    let h = harness(false).await;
    let path = write_transcript(&h.root, "proj", "s1", FIX_THE_BUG);
    let scanner = &h.rag.scanner;

    assert!(scanner.needs_reindex(&path).await.unwrap());
    assert_eq!(
        scanner.handle_session_file_event("s1", "proj", &path).await.unwrap(),
        1
    );

    // Unchanged bytes.
    assert!(!scanner.needs_reindex(&path).await.unwrap());
    assert_eq!(
        scanner.handle_session_file_event("s1", "proj", &path).await.unwrap(),
        0
    );

    // Touched but identical: mtime is refreshed, no reindex.
    set_mtime(&path, 60);
    assert!(scanner.needs_update(&path).await.unwrap());
    assert!(!scanner.needs_reindex(&path).await.unwrap());
    assert!(!scanner.needs_update(&path).await.unwrap());

    // One byte changed.
    std::fs::write(&path, FIX_THE_BUG.replace("bug", "bog")).unwrap();
    set_mtime(&path, 120);
    assert!(scanner.needs_reindex(&path).await.unwrap());
}

#[tokio::test]
async fn edit_within_the_same_second_is_reindexed() {
    let h = harness(false).await;
    let path = write_transcript(&h.root, "proj", "s1", FIX_THE_BUG);
    let scanner = &h.rag.scanner;
    let second = this_second();

    set_mtime_at(&path, second + Duration::from_millis(100));
    assert_eq!(
        scanner.handle_session_file_event("s1", "proj", &path).await.unwrap(),
        1
    );

    std::fs::write(&path, FIX_THE_BUG.replace("bug", "bog")).unwrap();
    set_mtime_at(&path, second + Duration::from_millis(700));
    assert!(scanner.needs_reindex(&path).await.unwrap());
    assert_eq!(
        scanner.handle_session_file_event("s1", "proj", &path).await.unwrap(),
        1
    );

    let chunks = h.rag.indexer.chunks().get_chunks_by_session("s1").await.unwrap();
    assert_eq!(chunks[0].user_query, "Fix the bog");
}

#[tokio::test]
async fn identical_mtime_right_after_indexing_still_checks_content() {
    let h = harness(false).await;
    let path = write_transcript(&h.root, "proj", "s1", FIX_THE_BUG);
    let scanner = &h.rag.scanner;
    // A timestamp tick shared by the indexed write and the next one.
    let tick = this_second() + Duration::from_secs(2);

    set_mtime_at(&path, tick);
    h.rag.indexer.index_session("s1", &path).await.unwrap();
    assert!(!scanner.needs_reindex(&path).await.unwrap());

    std::fs::write(&path, FIX_THE_BUG.replace("bug", "bog")).unwrap();
    set_mtime_at(&path, tick);
    assert!(scanner.needs_reindex(&path).await.unwrap());
}

#[tokio::test]
async fn append_during_indexing_leaves_the_file_dirty() {
    let h = harness_with(None, Arc::new(BagOfWords), |root| {
        Arc::new(AppendAfterRead {
            inner: FsSessions::new(root),
            path: root.join("proj").join("agent-transcripts").join("s1.txt"),
            appended: AtomicBool::new(false),
        })
    })
    .await;
    let path = write_transcript(&h.root, "proj", "s1", FIX_THE_BUG);
    let scanner = &h.rag.scanner;

    // Only the turn that was read gets indexed.
    assert_eq!(h.rag.indexer.index_session("s1", &path).await.unwrap(), 1);
    assert!(scanner.needs_reindex(&path).await.unwrap());

    assert_eq!(
        scanner.handle_session_file_event("s1", "proj", &path).await.unwrap(),
        2
    );
    assert!(!scanner.needs_reindex(&path).await.unwrap());
}

#[tokio::test]
async fn incremental_scan_only_picks_up_changed_files() {
    let h = harness(false).await;
    write_transcript(&h.root, "proj", "a", FIX_THE_BUG);
    let b = write_transcript(&h.root, "proj", "b", FIX_THE_BUG);
    let never = session_rag::cancel::CancelToken::never();

    assert_eq!(h.rag.scanner.scan_changed(&never).await.unwrap(), 2);
    assert_eq!(h.rag.scanner.scan_changed(&never).await.unwrap(), 0);

    std::fs::write(&b, FIX_THE_BUG.replace("Fix", "Find")).unwrap();
    set_mtime(&b, 60);
    assert_eq!(h.rag.scanner.scan_changed(&never).await.unwrap(), 1);
    assert_eq!(h.rag.indexer.chunks().count_chunks().await.unwrap(), 2);
}

// ─── Full scan ──────────────────────────────────────────────────────

#[tokio::test]
async fn full_scan_reports_every_file() {
    let h = harness(false).await;
    for (project, session) in [("alpha", "s1"), ("alpha", "s2"), ("beta", "s3")] {
        write_transcript(&h.root, project, session, FIX_THE_BUG);
    }
    let reporter = Arc::new(RecordingReporter::default());

    let task = h.rag.scanner.trigger_full_scan(reporter.clone()).unwrap();
    let last = task.await.unwrap();

    assert_eq!(last.status, ScanStatus::Completed);
    assert_eq!(last.total_files, 3);
    assert_eq!(last.processed_files, 3);
    assert_eq!(last.indexed_messages, 3);
    assert!(last.error_message.is_none());
    assert!(!h.rag.scanner.is_running());
    assert_eq!(h.rag.scanner.progress(), last);

    let snapshots = reporter.snapshots.lock().unwrap();
    assert_eq!(snapshots.first().unwrap().status, ScanStatus::Running);
    assert_eq!(snapshots.first().unwrap().processed_files, 0);
    // start + one per file + final
    assert_eq!(snapshots.len(), 5);
    let processed: Vec<u64> = snapshots.iter().map(|s| s.processed_files).collect();
    assert!(processed.windows(2).all(|w| w[0] <= w[1]));
}

#[tokio::test]
async fn full_scan_of_empty_tree_completes() {
    let h = harness(false).await;
    let task = h
        .rag
        .scanner
        .trigger_full_scan(Arc::new(RecordingReporter::default()))
        .unwrap();
    let last = task.await.unwrap();
    assert_eq!(last.status, ScanStatus::Completed);
    assert_eq!(last.total_files, 0);
    assert!(!h.rag.scanner.cancel_scan());
}

#[tokio::test]
async fn panicking_index_task_fails_the_scan() {
    let h = harness_with(None, Arc::new(PanicsOn("KABOOM")), |root| {
        Arc::new(FsSessions::new(root))
    })
    .await;
    write_transcript(&h.root, "alpha", "s1", FIX_THE_BUG);
    write_transcript(
        &h.root,
        "alpha",
        "s2",
        "user:\nKABOOM please\nassistant:\nok.\n",
    );
    write_transcript(&h.root, "beta", "s3", FIX_THE_BUG);

    let task = h
        .rag
        .scanner
        .trigger_full_scan(Arc::new(RecordingReporter::default()))
        .unwrap();
    let last = task.await.unwrap();

    assert_eq!(last.status, ScanStatus::Failed);
    assert_eq!(last.total_files, 3);
    assert_eq!(last.processed_files, 3);
    assert_eq!(last.indexed_messages, 2);
    assert!(last.error_message.unwrap().contains("panicked"));
    assert!(!h.rag.scanner.is_running());
}

#[tokio::test]
async fn cancelled_full_scan_ends_cancelled() {
    let h = harness(false).await;
    for (project, session) in [("alpha", "s1"), ("alpha", "s2"), ("beta", "s3")] {
        write_transcript(&h.root, project, session, FIX_THE_BUG);
    }
    let reporter = Arc::new(RecordingReporter::default());

    let task = h.rag.scanner.trigger_full_scan(reporter.clone()).unwrap();
    assert!(h.rag.scanner.is_running());
    assert!(h.rag.scanner.cancel_scan());
    let last = task.await.unwrap();

    assert_eq!(last.status, ScanStatus::Cancelled);
    assert_eq!(last.total_files, 3);
    assert!(last.processed_files < last.total_files);
    assert!(!h.rag.scanner.is_running());
    assert!(!h.rag.scanner.cancel_scan());
    assert_eq!(
        reporter.snapshots.lock().unwrap().last().unwrap().status,
        ScanStatus::Cancelled
    );
}

// ─── Search ─────────────────────────────────────────────────────────

#[tokio::test]
async fn project_filter_restricts_results() {
    let h = harness(false).await;
    let a = write_transcript(
        &h.root,
        "A",
        "sa",
        "user:\nWhy is the sqlite pool timing out?\nassistant:\nRaise the busy timeout.\n",
    );
    let b = write_transcript(
        &h.root,
        "B",
        "sb",
        "user:\nHow do I center a div?\nassistant:\nUse flexbox.\n",
    );
    h.rag.indexer.index_session("sa", &a).await.unwrap();
    h.rag.indexer.index_session("sb", &b).await.unwrap();

    let only_a = h
        .rag
        .search
        .search("sqlite pool", &["A".to_string()], 10)
        .await
        .unwrap();
    assert_eq!(only_a.len(), 1);
    assert_eq!(only_a[0].project_id, "A");
    assert_eq!(only_a[0].session_id, "sa");
    assert!(!only_a[0].is_enriched);

    let all = h.rag.search.search("sqlite pool", &[], 10).await.unwrap();
    assert_eq!(all.len(), 2);
    assert_eq!(all[0].project_id, "A");

    let both = h
        .rag
        .search
        .search("div", &["A".to_string(), "B".to_string()], 0)
        .await
        .unwrap();
    assert_eq!(both.len(), 2);

    assert!(h.rag.search.search("   ", &[], 10).await.is_err());
}

#[tokio::test]
async fn chunk_detail_is_full_and_missing_is_an_error() {
    let h = harness(false).await;
    let path = write_transcript(&h.root, "proj", "s1", FIX_THE_BUG);
    h.rag.indexer.index_session("s1", &path).await.unwrap();

    let hit = &h.rag.search.search("bug", &[], 1).await.unwrap()[0];
    let detail = h.rag.search.get_chunk_detail(&hit.chunk_id).await.unwrap();
    assert_eq!(detail.user_query, "Fix the bug");
    assert_eq!(detail.ai_response_core, "I fixed it.");
    assert_eq!(detail.enrichment_status, "pending");

    let err = h.rag.search.get_chunk_detail("nope").await.unwrap_err();
    assert!(err.to_string().contains("chunk not found"));
}

// ─── Enrichment ─────────────────────────────────────────────────────

#[tokio::test]
async fn enrichment_shows_up_in_search() {
    let h = harness(true).await;
    let path = write_transcript(&h.root, "proj", "s1", FIX_THE_BUG);
    h.rag.indexer.index_session("s1", &path).await.unwrap();

    assert!(h.rag.enrichment.is_enabled());
    assert_eq!(h.rag.enrichment.run_until_empty().await.unwrap(), 1);

    let hit = &h.rag.search.search("bug", &[], 5).await.unwrap()[0];
    assert!(hit.is_enriched);
    assert_eq!(hit.summary, "Resolved: Fix the bug");
    assert_eq!(hit.main_topic, "debugging");
    assert_eq!(hit.tags, vec!["bugfix".to_string()]);

    let detail = h.rag.search.get_chunk_detail(&hit.chunk_id).await.unwrap();
    assert_eq!(detail.enrichment_status, "completed");
    assert_eq!(h.rag.enrichment.queue_stats().await.unwrap().completed, 1);
}

#[tokio::test]
async fn dequeue_never_hands_out_a_task_twice() {
    let h = harness(false).await;
    let a = write_transcript(&h.root, "proj", "a", FIX_THE_BUG);
    let b = write_transcript(&h.root, "proj", "b", FIX_THE_BUG);
    h.rag.indexer.index_session("a", &a).await.unwrap();
    h.rag.indexer.index_session("b", &b).await.unwrap();

    let queue = h.rag.indexer.queue();
    let first = queue.dequeue_tasks(1).await.unwrap();
    let second = queue.dequeue_tasks(5).await.unwrap();
    assert_eq!(first.len(), 1);
    assert_eq!(second.len(), 1);
    assert_ne!(first[0].chunk_id, second[0].chunk_id);
    assert!(queue.dequeue_tasks(5).await.unwrap().is_empty());
    assert_eq!(queue.queue_stats().await.unwrap().processing, 2);
}

#[tokio::test]
async fn without_llm_enrichment_is_disabled() {
    let h = harness(false).await;
    assert!(!h.rag.enrichment.is_enabled());
    assert!(!h.rag.enrichment.start_workers());
    assert!(h.rag.enrichment.process_batch().await.is_err());
}

// ─── Maintenance and wiring ─────────────────────────────────────────

#[tokio::test]
async fn clear_metadata_empties_everything() {
    let h = harness(false).await;
    let path = write_transcript(&h.root, "proj", "s1", FIX_THE_BUG);
    h.rag.indexer.index_session("s1", &path).await.unwrap();

    h.rag.scanner.clear_metadata().await.unwrap();

    let stats = h.rag.scanner.index_stats().await.unwrap();
    assert_eq!(stats.total_files, 0);
    assert_eq!(stats.total_chunks, 0);
    assert_eq!(h.store.count(COLLECTION).await.unwrap(), 0);
    assert_eq!(h.rag.enrichment.queue_stats().await.unwrap().pending, 0);
    assert!(h
        .store
        .list_collections()
        .await
        .unwrap()
        .contains(&COLLECTION.to_string()));
}

#[tokio::test]
async fn disabled_embedding_disables_rag_not_the_runtime() {
    let tmp = TempDir::new().unwrap();
    let config = test_config(tmp.path());

    let rt = Runtime::build(config).await.unwrap();
    assert!(!rt.is_rag_enabled());
    let err = rt.rag().err().unwrap();
    assert!(err.to_string().contains("disabled"));
    rt.shutdown().await;
}
