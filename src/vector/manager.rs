//! Local Qdrant process management.
//!
//! ```text
//! install:  --version matches? ──yes──▶ done
//!              │ no
//!              ▼
//!           download asset ──▶ verify .sha256 (soft) ──▶ extract ──▶ copy binary (0755) ──▶ --version
//!
//! start:    already answering? ──yes──▶ reuse
//!              │ no
//!              ▼
//!           write temp config ──▶ spawn ──▶ poll list-collections every 500ms ──▶ ready | NotReady
//! ```
//!
//! The child process and its temp config file live in one [`RunningServer`]
//! and are released together on `stop`, on start failure and on drop.

use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;

use super::download::{Downloader, ProgressFn};
use super::platform::{parse_checksum, Platform};
use super::{archive, QdrantStore, VectorStore};
use crate::cancel::CancelToken;
use crate::config::VectorConfig;
use crate::error::{LifecycleError, LifecycleResult};

const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// A spawned server plus the config file it was started with.
pub struct RunningServer {
    child: Child,
    _config_file: tempfile::NamedTempFile,
}

impl RunningServer {
    async fn shutdown(mut self) {
        if let Err(e) = self.child.kill().await {
            tracing::debug!(error = %e, "qdrant process already exited");
        }
    }
}

pub struct QdrantManager {
    config: VectorConfig,
    platform: Platform,
    store: Arc<QdrantStore>,
    downloader: Downloader,
    server: Mutex<Option<RunningServer>>,
}

impl QdrantManager {
    pub fn new(config: &VectorConfig) -> anyhow::Result<Self> {
        Ok(Self {
            config: config.clone(),
            platform: Platform::current()?,
            store: Arc::new(QdrantStore::new(&config.endpoint())?),
            downloader: Downloader::new()?,
            server: Mutex::new(None),
        })
    }

    pub fn store(&self) -> Arc<QdrantStore> {
        self.store.clone()
    }

    pub fn binary_path(&self) -> PathBuf {
        self.config.install_dir.join(self.platform.binary_name())
    }

    /// Output of `qdrant --version`, or `None` if the binary is missing or fails.
    pub async fn installed_version(&self) -> Option<String> {
        binary_version(&self.binary_path()).await
    }

    pub async fn install(
        &self,
        progress: Option<&ProgressFn>,
        cancel: &CancelToken,
    ) -> LifecycleResult<PathBuf> {
        let version = &self.config.version;
        let target = self.binary_path();

        if let Some(installed) = self.installed_version().await {
            if version_matches(&installed, version) {
                tracing::info!(version = %version, "qdrant already installed");
                return Ok(target);
            }
            tracing::info!(installed = %installed.trim(), wanted = %version, "upgrading qdrant");
        }

        let work = tempfile::TempDir::new()?;
        let archive_path = work.path().join(self.platform.asset);
        let url = self.platform.download_url(version);

        tracing::info!(url = %url, "downloading qdrant");
        self.downloader
            .download(&url, &archive_path, progress, cancel)
            .await?;

        self.verify_checksum(&archive_path, cancel).await?;

        let extract_dir = work.path().join("extract");
        {
            let archive_path = archive_path.clone();
            let extract_dir = extract_dir.clone();
            tokio::task::spawn_blocking(move || archive::extract(&archive_path, &extract_dir))
                .await
                .map_err(std::io::Error::other)??;
        }

        let binary_name = self.platform.binary_name();
        let extracted = archive::find_file(&extract_dir, binary_name)
            .ok_or_else(|| LifecycleError::BinaryNotFound(extract_dir.join(binary_name)))?;

        tokio::fs::create_dir_all(&self.config.install_dir).await?;
        tokio::fs::copy(&extracted, &target).await?;
        make_executable(&target)?;

        match binary_version(&target).await {
            Some(v) => tracing::info!(version = %v.trim(), path = %target.display(), "qdrant installed"),
            None => return Err(LifecycleError::BinaryNotFound(target)),
        }
        Ok(target)
    }

    /// Compare against the published `.sha256`. A missing checksum file
    /// only warns; a mismatch fails.
    async fn verify_checksum(&self, file: &Path, cancel: &CancelToken) -> LifecycleResult<()> {
        let url = self.platform.checksum_url(&self.config.version);
        let expected = match self.downloader.fetch_text(&url, cancel).await {
            Ok(body) => parse_checksum(&body),
            Err(LifecycleError::Canceled) => return Err(LifecycleError::Canceled),
            Err(e) => {
                tracing::warn!(url = %url, error = %e, "checksum unavailable, skipping verification");
                None
            }
        };
        let Some(expected) = expected else {
            return Ok(());
        };

        let actual = sha256_file(file).await?;
        if actual != expected {
            return Err(LifecycleError::ChecksumMismatch { expected, actual });
        }
        tracing::debug!("checksum verified");
        Ok(())
    }

    pub async fn is_running(&self) -> bool {
        self.store.list_collections().await.is_ok()
    }

    pub async fn start(&self) -> LifecycleResult<()> {
        let mut guard = self.server.lock().await;

        if self.is_running().await {
            tracing::info!(url = %self.store.base_url(), "using running qdrant server");
            return Ok(());
        }

        std::fs::create_dir_all(&self.config.data_dir)?;
        let binary = self.binary_path();
        if !binary.is_file() {
            return Err(LifecycleError::BinaryNotFound(binary));
        }

        let config_file = write_server_config(&self.config)?;
        let child = Command::new(&binary)
            .arg("--config-path")
            .arg(config_file.path())
            .env("QDRANT__STORAGE__STORAGE_PATH", &self.config.data_dir)
            .env("QDRANT__SERVICE__HTTP_PORT", self.config.http_port.to_string())
            .env("QDRANT__SERVICE__GRPC_PORT", self.config.grpc_port.to_string())
            .current_dir(&self.config.data_dir)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()?;

        let mut server = RunningServer {
            child,
            _config_file: config_file,
        };
        tracing::info!(port = self.config.http_port, "starting qdrant");

        let timeout = self.config.ready_timeout();
        let deadline = Instant::now() + timeout;
        loop {
            if self.is_running().await {
                break;
            }
            if let Some(status) = server.child.try_wait()? {
                tracing::error!(%status, "qdrant exited during startup");
                return Err(LifecycleError::NotReady(timeout));
            }
            if Instant::now() >= deadline {
                server.shutdown().await;
                return Err(LifecycleError::NotReady(timeout));
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }

        tracing::info!(url = %self.store.base_url(), "qdrant ready");
        *guard = Some(server);
        Ok(())
    }

    /// Stop a server this manager started. A server started elsewhere is left alone.
    pub async fn stop(&self) {
        if let Some(server) = self.server.lock().await.take() {
            server.shutdown().await;
            tracing::info!("qdrant stopped");
        }
    }

    pub async fn ensure_collections(&self, dims: usize) -> anyhow::Result<()> {
        super::ensure_collections(self.store.as_ref(), &[&self.config.collection], dims).await
    }

    pub async fn clear_collections(&self) -> anyhow::Result<()> {
        super::clear_collections(self.store.as_ref(), &[&self.config.collection]).await
    }
}

/// Loose match: `qdrant 1.16.3` matches `v1.16.3`.
pub fn version_matches(output: &str, version: &str) -> bool {
    let wanted = version.trim_start_matches('v');
    output
        .split_whitespace()
        .any(|word| word.trim_start_matches('v') == wanted)
}

async fn binary_version(binary: &Path) -> Option<String> {
    if !binary.is_file() {
        return None;
    }
    let output = Command::new(binary).arg("--version").output().await.ok()?;
    if !output.status.success() {
        return None;
    }
    Some(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// YAML config for the server. Paths are emitted as JSON strings, which
/// YAML accepts verbatim.
pub fn server_config_yaml(config: &VectorConfig) -> String {
    let storage = serde_json::to_string(&config.data_dir.to_string_lossy())
        .unwrap_or_else(|_| "\"./storage\"".to_string());
    format!(
        "storage:\n  storage_path: {}\nservice:\n  host: 127.0.0.1\n  http_port: {}\n  grpc_port: {}\n",
        storage, config.http_port, config.grpc_port
    )
}

fn write_server_config(config: &VectorConfig) -> std::io::Result<tempfile::NamedTempFile> {
    use std::io::Write;
    let mut file = tempfile::Builder::new()
        .prefix("qdrant-config-")
        .suffix(".yaml")
        .tempfile()?;
    file.write_all(server_config_yaml(config).as_bytes())?;
    file.flush()?;
    Ok(file)
}

async fn sha256_file(path: &Path) -> std::io::Result<String> {
    let bytes = tokio::fs::read(path).await?;
    Ok(hex::encode(Sha256::digest(&bytes)))
}

#[cfg(unix)]
fn make_executable(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))
}

#[cfg(not(unix))]
fn make_executable(_path: &Path) -> std::io::Result<()> {
    Ok(())
}
