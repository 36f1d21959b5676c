//! Retrying HTTP downloader.
//!
//! ```text
//! attempt 1 ──fail(retryable)──▶ sleep 1s ──▶ attempt 2 ──▶ sleep 2s ──▶ attempt 3
//!     │                                                                   │
//!     └── 4xx / integrity error: stop                                     └── give up
//! ```
//!
//! The body streams into `<dest>.tmp` and is renamed into place only after
//! the byte count matches `Content-Length`. Cancellation is checked between
//! attempts and between body chunks.

use futures::StreamExt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::AsyncWriteExt;

use crate::cancel::CancelToken;
use crate::error::{LifecycleError, LifecycleResult};

const USER_AGENT: &str = concat!("session-rag/", env!("CARGO_PKG_VERSION"));

/// Progress callback: `(bytes_downloaded, total_bytes_if_known)`.
pub type ProgressFn = dyn Fn(u64, Option<u64>) + Send + Sync;

pub struct Downloader {
    client: reqwest::Client,
    max_retries: u32,
    base_delay: Duration,
}

impl Downloader {
    pub fn new() -> LifecycleResult<Self> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .connect_timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            client,
            max_retries: 3,
            base_delay: Duration::from_secs(1),
        })
    }

    pub fn with_retries(mut self, max_retries: u32, base_delay: Duration) -> Self {
        self.max_retries = max_retries.max(1);
        self.base_delay = base_delay;
        self
    }

    /// Backoff before `attempt` (1-based). Zero for the first attempt.
    pub fn backoff(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            Duration::ZERO
        } else {
            self.base_delay * 2u32.pow(attempt - 2)
        }
    }

    /// Download `url` to `dest`, retrying transient failures.
    pub async fn download(
        &self,
        url: &str,
        dest: &Path,
        progress: Option<&ProgressFn>,
        cancel: &CancelToken,
    ) -> LifecycleResult<()> {
        let tmp = tmp_path(dest);
        let mut attempt = 1;

        loop {
            self.wait_before(attempt, cancel).await?;

            match self.attempt(url, &tmp, progress, cancel).await {
                Ok(()) => {
                    tokio::fs::rename(&tmp, dest).await?;
                    return Ok(());
                }
                Err(e) => {
                    let _ = tokio::fs::remove_file(&tmp).await;
                    if !e.is_retryable() || attempt >= self.max_retries {
                        return Err(e);
                    }
                    tracing::warn!(url, attempt, error = %e, "download failed, retrying");
                    attempt += 1;
                }
            }
        }
    }

    /// Fetch a small text resource (checksum files) with the same retry policy.
    pub async fn fetch_text(&self, url: &str, cancel: &CancelToken) -> LifecycleResult<String> {
        let mut attempt = 1;
        loop {
            self.wait_before(attempt, cancel).await?;

            let result = async {
                let response = self.client.get(url).send().await?;
                check_status(&response, url)?;
                Ok::<_, LifecycleError>(response.text().await?)
            }
            .await;

            match result {
                Ok(text) => return Ok(text),
                Err(e) if e.is_retryable() && attempt < self.max_retries => {
                    tracing::warn!(url, attempt, error = %e, "fetch failed, retrying");
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn wait_before(&self, attempt: u32, cancel: &CancelToken) -> LifecycleResult<()> {
        if cancel.is_canceled() {
            return Err(LifecycleError::Canceled);
        }
        let delay = self.backoff(attempt);
        if delay.is_zero() {
            return Ok(());
        }
        tokio::select! {
            _ = tokio::time::sleep(delay) => Ok(()),
            _ = cancel.canceled() => Err(LifecycleError::Canceled),
        }
    }

    async fn attempt(
        &self,
        url: &str,
        tmp: &Path,
        progress: Option<&ProgressFn>,
        cancel: &CancelToken,
    ) -> LifecycleResult<()> {
        let response = self.client.get(url).send().await?;
        check_status(&response, url)?;

        let total = response.content_length();
        let mut file = tokio::fs::File::create(tmp).await?;
        let mut downloaded: u64 = 0;
        let mut stream = response.bytes_stream();

        while let Some(chunk) = stream.next().await {
            if cancel.is_canceled() {
                return Err(LifecycleError::Canceled);
            }
            let chunk = chunk?;
            file.write_all(&chunk).await?;
            downloaded += chunk.len() as u64;
            if let Some(cb) = progress {
                cb(downloaded, total);
            }
        }
        file.flush().await?;

        if let Some(expected) = total {
            if downloaded != expected {
                return Err(LifecycleError::FileSizeMismatch {
                    expected,
                    actual: downloaded,
                });
            }
        }
        Ok(())
    }
}

fn check_status(response: &reqwest::Response, url: &str) -> LifecycleResult<()> {
    let status = response.status();
    if status.is_success() {
        Ok(())
    } else {
        Err(LifecycleError::HttpStatus {
            status: status.as_u16(),
            url: url.to_string(),
        })
    }
}

fn tmp_path(dest: &Path) -> PathBuf {
    let mut name = dest.as_os_str().to_owned();
    name.push(".tmp");
    PathBuf::from(name)
}
