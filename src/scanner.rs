//! Scan scheduler: decides which transcripts need (re)indexing and drives
//! the [`ChunkIndexer`] over them.
//!
//! Three entry points converge on the same per-file decision:
//!
//! | Entry point                     | Selection                              |
//! |---------------------------------|----------------------------------------|
//! | [`ScanScheduler::handle_session_file_event`] | watcher event, exact check |
//! | [`ScanScheduler::scan_changed`] | periodic walk, mtime then exact check  |
//! | [`ScanScheduler::trigger_full_scan`] | every file, no check, with progress |
//!
//! The exact check is two-tier: an unchanged mtime short-circuits, otherwise
//! the content hash decides. Mtimes are compared at nanosecond precision. A file whose hash still matches only gets its
//! stored mtime refreshed.
//!
//! Files are processed in batches of `batch_size`; inside a batch at most
//! `concurrency` files index in parallel behind a semaphore.

use anyhow::{bail, Result};
use std::path::{Path, PathBuf};
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::{JoinHandle, JoinSet};

use crate::cancel::{cancel_pair, CancelHandle, CancelToken};
use crate::config::ScanSettings;
use crate::indexer::{hash_file, mtime_nanos, ChunkIndexer};
use crate::models::IndexStats;
use crate::progress::{ScanProgress, ScanProgressReporter, ScanStatus};
use crate::session::{discover_transcripts, TranscriptFile};

const DEFAULT_BATCH_SIZE: usize = 10;
const DEFAULT_CONCURRENCY: usize = 3;
const NANOS_PER_SEC: i64 = 1_000_000_000;

/// Batch shape for scans. Mutable at runtime via [`ScanScheduler::update_config`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanConfig {
    pub batch_size: usize,
    pub concurrency: usize,
}

impl ScanConfig {
    fn normalized(self) -> Self {
        Self {
            batch_size: if self.batch_size == 0 {
                DEFAULT_BATCH_SIZE
            } else {
                self.batch_size
            },
            concurrency: if self.concurrency == 0 {
                DEFAULT_CONCURRENCY
            } else {
                self.concurrency
            },
        }
    }
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            concurrency: DEFAULT_CONCURRENCY,
        }
    }
}

impl From<&ScanSettings> for ScanConfig {
    fn from(s: &ScanSettings) -> Self {
        Self {
            batch_size: s.batch_size,
            concurrency: s.concurrency,
        }
        .normalized()
    }
}

/// Result of one file inside a batch.
#[derive(Debug)]
struct FileOutcome {
    chunks: usize,
    failed: bool,
    panicked: bool,
}

impl FileOutcome {
    fn indexed(chunks: usize) -> Self {
        Self {
            chunks,
            failed: false,
            panicked: false,
        }
    }

    fn failed() -> Self {
        Self {
            chunks: 0,
            failed: true,
            panicked: false,
        }
    }

    fn panicked() -> Self {
        Self {
            chunks: 0,
            failed: true,
            panicked: true,
        }
    }
}

struct Background {
    stop: CancelHandle,
    handle: JoinHandle<()>,
}

pub struct ScanScheduler {
    indexer: Arc<ChunkIndexer>,
    root: PathBuf,
    config: RwLock<ScanConfig>,
    progress: watch::Sender<ScanProgress>,
    full_scan: Mutex<Option<CancelHandle>>,
    periodic: Mutex<Option<Background>>,
}

impl ScanScheduler {
    pub fn new(indexer: Arc<ChunkIndexer>, root: impl Into<PathBuf>, config: ScanConfig) -> Self {
        let (progress, _) = watch::channel(ScanProgress::idle());
        Self {
            indexer,
            root: root.into(),
            config: RwLock::new(config.normalized()),
            progress,
            full_scan: Mutex::new(None),
            periodic: Mutex::new(None),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn indexer(&self) -> &Arc<ChunkIndexer> {
        &self.indexer
    }

    pub fn config(&self) -> ScanConfig {
        *self.config.read()
    }

    /// Replace the batch shape. Applies to the next batch of any running scan.
    pub fn update_config(&self, config: ScanConfig) {
        let config = config.normalized();
        *self.config.write() = config;
        tracing::info!(
            batch_size = config.batch_size,
            concurrency = config.concurrency,
            "scan config updated"
        );
    }

    // ============ Per-file decision ============

    /// Cheap check: no status yet, or the mtime differs from the stored one.
    pub async fn needs_update(&self, path: &Path) -> Result<bool> {
        let key = path.to_string_lossy();
        let Some(status) = self.indexer.index_status().get(&key).await? else {
            return Ok(true);
        };
        Ok(mtime_nanos(path)? != status.file_mtime)
    }

    /// Exact check: mtime first, content hash only when the mtime moved.
    ///
    /// An unchanged hash refreshes the stored mtime so the next check is cheap.
    /// A file last written no earlier than the second it was indexed is
    /// "racily clean": a later write can land on the same timestamp tick, so
    /// an equal mtime does not skip the hash.
    pub async fn needs_reindex(&self, path: &Path) -> Result<bool> {
        let key = path.to_string_lossy();
        let Some(status) = self.indexer.index_status().get(&key).await? else {
            return Ok(true);
        };

        let mtime = mtime_nanos(path)?;
        let racily_clean = mtime / NANOS_PER_SEC >= status.last_indexed_at;
        if mtime == status.file_mtime && !racily_clean {
            return Ok(false);
        }
        if status.content_hash.is_empty() {
            return Ok(true);
        }

        let current = match hash_file(path).await {
            Ok(hash) => hash,
            Err(e) => {
                tracing::warn!(file = %path.display(), error = %e, "hash failed, reindexing");
                return Ok(true);
            }
        };
        if current != status.content_hash {
            return Ok(true);
        }

        self.indexer.index_status().update_file_mtime(&key, mtime).await?;
        Ok(false)
    }

    /// Entry point for watcher events. Returns the number of chunks written.
    pub async fn handle_session_file_event(
        &self,
        session_id: &str,
        project_key: &str,
        path: &Path,
    ) -> Result<usize> {
        tracing::debug!(session_id, project_key, file = %path.display(), "session file event");
        if !self.needs_reindex(path).await? {
            return Ok(0);
        }
        let chunks = self.indexer.index_session(session_id, path).await?;
        tracing::info!(session_id, chunks, "session indexed from event");
        Ok(chunks)
    }

    async fn process_file(&self, file: &TranscriptFile, force: bool) -> Result<usize> {
        if force {
            self.indexer.index_session(&file.session_id, &file.path).await
        } else {
            self.handle_session_file_event(&file.session_id, &file.project_key, &file.path)
                .await
        }
    }

    /// Run `files` in batches. Stops between files once `cancel` fires.
    async fn process_files(
        self: &Arc<Self>,
        files: Vec<TranscriptFile>,
        force: bool,
        cancel: &CancelToken,
        outcomes: Option<mpsc::Sender<FileOutcome>>,
    ) {
        let mut remaining = files.into_iter().peekable();
        while remaining.peek().is_some() {
            if cancel.is_canceled() {
                return;
            }
            let config = self.config();
            let batch: Vec<TranscriptFile> = remaining.by_ref().take(config.batch_size).collect();
            let semaphore = Arc::new(Semaphore::new(config.concurrency));
            let mut tasks = JoinSet::new();

            for file in batch {
                let this = Arc::clone(self);
                let semaphore = Arc::clone(&semaphore);
                let cancel = cancel.clone();
                let outcomes = outcomes.clone();
                tasks.spawn(async move {
                    let Ok(_permit) = semaphore.acquire_owned().await else {
                        return;
                    };
                    if cancel.is_canceled() {
                        return;
                    }
                    let outcome = match this.process_file(&file, force).await {
                        Ok(chunks) => FileOutcome::indexed(chunks),
                        Err(e) => {
                            tracing::error!(
                                session_id = %file.session_id,
                                file = %file.path.display(),
                                error = %format!("{:#}", e),
                                "failed to index session"
                            );
                            FileOutcome::failed()
                        }
                    };
                    if let Some(tx) = outcomes {
                        let _ = tx.send(outcome).await;
                    }
                });
            }

            // A task that died never sent its outcome; count it here so the
            // processed total still reaches the file count.
            while let Some(joined) = tasks.join_next().await {
                if let Err(e) = joined {
                    tracing::error!(error = %e, "index task panicked");
                    if let Some(tx) = &outcomes {
                        let _ = tx.send(FileOutcome::panicked()).await;
                    }
                }
            }
        }
    }

    // ============ Incremental scan ============

    /// Walk the tree and index files whose content changed. Returns the
    /// number of files that passed the cheap check.
    pub async fn scan_changed(self: &Arc<Self>, cancel: &CancelToken) -> Result<usize> {
        let mut candidates = Vec::new();
        for file in discover_transcripts(&self.root)? {
            match self.needs_update(&file.path).await {
                Ok(true) => candidates.push(file),
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(file = %file.path.display(), error = %e, "skipping file")
                }
            }
        }
        let count = candidates.len();
        if count > 0 {
            tracing::info!(files = count, "incremental scan");
            self.process_files(candidates, false, cancel, None).await;
        }
        Ok(count)
    }

    /// Start a background incremental scan every `every`. Returns false if
    /// one is already running.
    pub fn start_periodic(self: &Arc<Self>, every: Duration) -> bool {
        let mut slot = self.periodic.lock();
        if slot.is_some() {
            return false;
        }
        let (stop, token) = cancel_pair();
        let this = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + every, every);
            loop {
                tokio::select! {
                    _ = token.canceled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = this.scan_changed(&token).await {
                            tracing::warn!(error = %format!("{:#}", e), "periodic scan failed");
                        }
                    }
                }
            }
        });
        tracing::info!(interval_secs = every.as_secs(), "periodic scan started");
        *slot = Some(Background { stop, handle });
        true
    }

    pub async fn stop_periodic(&self) {
        let running = self.periodic.lock().take();
        if let Some(bg) = running {
            bg.stop.cancel();
            let _ = bg.handle.await;
            tracing::info!("periodic scan stopped");
        }
    }

    // ============ Full scan ============

    pub fn is_running(&self) -> bool {
        self.full_scan.lock().is_some()
    }

    /// Latest full-scan snapshot.
    pub fn progress(&self) -> ScanProgress {
        self.progress.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ScanProgress> {
        self.progress.subscribe()
    }

    /// Cancel the running full scan. Returns false if none is running.
    pub fn cancel_scan(&self) -> bool {
        match self.full_scan.lock().as_ref() {
            Some(handle) => {
                handle.cancel();
                true
            }
            None => false,
        }
    }

    /// Index every transcript regardless of change state.
    ///
    /// `reporter` receives every snapshot. The returned task resolves to the
    /// final snapshot. Fails if a full scan is already running.
    pub fn trigger_full_scan(
        self: &Arc<Self>,
        reporter: Arc<dyn ScanProgressReporter>,
    ) -> Result<JoinHandle<ScanProgress>> {
        let token = {
            let mut slot = self.full_scan.lock();
            if slot.is_some() {
                bail!("a full scan is already running");
            }
            let (handle, token) = cancel_pair();
            *slot = Some(handle);
            token
        };

        tracing::info!(root = %self.root.display(), "full scan triggered");
        let this = Arc::clone(self);
        Ok(tokio::spawn(async move {
            let last = this.run_full_scan(&token, reporter.as_ref()).await;
            *this.full_scan.lock() = None;
            last
        }))
    }

    fn publish(&self, progress: &ScanProgress, reporter: &dyn ScanProgressReporter) {
        self.progress.send_replace(progress.clone());
        reporter.report(progress);
    }

    async fn run_full_scan(
        self: &Arc<Self>,
        cancel: &CancelToken,
        reporter: &dyn ScanProgressReporter,
    ) -> ScanProgress {
        let start_time = chrono::Utc::now().timestamp();
        let files = match discover_transcripts(&self.root) {
            Ok(files) => files,
            Err(e) => {
                let progress = ScanProgress {
                    status: ScanStatus::Failed,
                    start_time,
                    error_message: Some(format!("{:#}", e)),
                    ..ScanProgress::idle()
                };
                tracing::error!(error = %format!("{:#}", e), "full scan failed");
                self.publish(&progress, reporter);
                return progress;
            }
        };

        tracing::info!(files = files.len(), "full scan found files");
        let mut progress = ScanProgress::running(files.len() as u64, start_time);
        self.publish(&progress, reporter);

        // Workers only send outcomes; this task owns the counters.
        let (tx, mut rx) = mpsc::channel::<FileOutcome>(64);
        let this = Arc::clone(self);
        let worker_cancel = cancel.clone();
        let workers = tokio::spawn(async move {
            this.process_files(files, true, &worker_cancel, Some(tx)).await;
        });

        let mut failures = 0u64;
        let mut panics = 0u64;
        while let Some(outcome) = rx.recv().await {
            progress.processed_files += 1;
            progress.indexed_messages += outcome.chunks as u64;
            if outcome.failed {
                failures += 1;
            }
            if outcome.panicked {
                panics += 1;
            }
            self.publish(&progress, reporter);
        }

        if let Err(e) = workers.await {
            progress.status = ScanStatus::Failed;
            progress.error_message = Some(format!("scan workers aborted: {}", e));
        } else if panics > 0 {
            progress.status = ScanStatus::Failed;
            progress.error_message = Some(format!("{} index task(s) panicked", panics));
        } else if cancel.is_canceled() {
            progress.status = ScanStatus::Cancelled;
        } else {
            progress.status = ScanStatus::Completed;
            if failures > 0 {
                progress.error_message = Some(format!("{} file(s) failed to index", failures));
            }
        }

        tracing::info!(
            status = progress.status.as_str(),
            processed = progress.processed_files,
            chunks = progress.indexed_messages,
            "full scan finished"
        );
        self.publish(&progress, reporter);
        progress
    }

    // ============ Maintenance ============

    /// Drop every chunk, index status row, queued task and vector.
    pub async fn clear_metadata(&self) -> Result<()> {
        if self.is_running() {
            bail!("cannot clear the index while a full scan is running");
        }
        self.indexer.clear_all().await
    }

    pub async fn index_stats(&self) -> Result<IndexStats> {
        self.indexer.index_stats().await
    }
}
