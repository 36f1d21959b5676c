//! Transcript file watcher.
//!
//! Debounces filesystem events under the transcript root (500ms), keeps the
//! ones that look like `<projectKey>/agent-transcripts/<sessionID>.txt`, and
//! hands them to [`ScanScheduler::handle_session_file_event`] one at a time.

use anyhow::{Context, Result};
use notify::{RecommendedWatcher, RecursiveMode};
use notify_debouncer_mini::{new_debouncer, DebounceEventResult, DebouncedEventKind, Debouncer};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::scanner::ScanScheduler;
use crate::session::parse_transcript_path;

pub const DEBOUNCE: Duration = Duration::from_millis(500);

/// Running watcher. Dropping it stops event delivery.
pub struct TranscriptWatcher {
    _debouncer: Debouncer<RecommendedWatcher>,
    task: JoinHandle<()>,
}

impl TranscriptWatcher {
    /// Watch the scheduler's transcript root recursively.
    pub fn start(scheduler: Arc<ScanScheduler>) -> Result<Self> {
        let root = scheduler.root().to_path_buf();
        std::fs::create_dir_all(&root)
            .with_context(|| format!("creating transcript root {}", root.display()))?;

        let (tx, mut rx) = mpsc::channel::<PathBuf>(256);
        let mut debouncer = new_debouncer(DEBOUNCE, move |res: DebounceEventResult| match res {
            Ok(events) => {
                for event in events {
                    if event.kind == DebouncedEventKind::Any {
                        let _ = tx.blocking_send(event.path);
                    }
                }
            }
            Err(e) => tracing::warn!(error = %e, "watch error"),
        })
        .context("creating file watcher")?;

        debouncer
            .watcher()
            .watch(&root, RecursiveMode::Recursive)
            .with_context(|| format!("watching {}", root.display()))?;
        tracing::info!(root = %root.display(), "watching transcripts");

        let task = tokio::spawn(async move {
            while let Some(path) = rx.recv().await {
                handle_change(&scheduler, &path).await;
            }
        });

        Ok(Self {
            _debouncer: debouncer,
            task,
        })
    }

    pub fn stop(self) {
        self.task.abort();
        tracing::info!("transcript watcher stopped");
    }
}

async fn handle_change(scheduler: &ScanScheduler, path: &Path) {
    let Some(file) = parse_transcript_path(path) else {
        return;
    };
    if !path.is_file() {
        tracing::debug!(file = %path.display(), "transcript removed, ignoring");
        return;
    }
    if let Err(e) = scheduler
        .handle_session_file_event(&file.session_id, &file.project_key, &file.path)
        .await
    {
        tracing::error!(
            session_id = %file.session_id,
            file = %path.display(),
            error = %format!("{:#}", e),
            "failed to index session from event"
        );
    }
}
