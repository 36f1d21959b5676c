//! TOML configuration.
//!
//! Every section except `[db]` is optional and falls back to defaults, so a
//! minimal file looks like:
//!
//! ```toml
//! [db]
//! path = "./data/srag.sqlite"
//!
//! [embedding]
//! provider = "openai"
//! model = "text-embedding-3-small"
//! dims = 1536
//! ```

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub transcripts: TranscriptsConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub vector: VectorConfig,
    #[serde(default)]
    pub scan: ScanSettings,
    #[serde(default)]
    pub enrichment: EnrichmentConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

// ============ Transcripts ============

#[derive(Debug, Deserialize, Clone)]
pub struct TranscriptsConfig {
    /// Directory holding `<projectKey>/agent-transcripts/<sessionID>.txt`.
    #[serde(default = "default_transcripts_root")]
    pub root: PathBuf,
}

impl Default for TranscriptsConfig {
    fn default() -> Self {
        Self {
            root: default_transcripts_root(),
        }
    }
}

fn default_transcripts_root() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".cursor")
        .join("projects")
}

// ============ Embedding ============

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    /// When unset, discovered by embedding a probe string.
    #[serde(default)]
    pub dims: Option<usize>,
    /// Base URL. Provider-specific default when unset.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            dims: None,
            url: None,
            api_key_env: default_api_key_env(),
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_api_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}
fn default_batch_size() -> usize {
    64
}
fn default_max_retries() -> u32 {
    3
}
fn default_timeout_secs() -> u64 {
    30
}

// ============ LLM ============

#[derive(Debug, Deserialize, Clone)]
pub struct LlmConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_llm_url")]
    pub url: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_llm_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            url: default_llm_url(),
            model: None,
            api_key_env: default_api_key_env(),
            timeout_secs: default_llm_timeout_secs(),
        }
    }
}

impl LlmConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

fn default_llm_url() -> String {
    "https://api.openai.com/v1".to_string()
}
fn default_llm_timeout_secs() -> u64 {
    60
}

// ============ Vector store ============

#[derive(Debug, Deserialize, Clone)]
pub struct VectorConfig {
    /// REST endpoint. For a managed server this is derived from `http_port`.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_collection")]
    pub collection: String,
    /// Download, install and supervise a local Qdrant process.
    #[serde(default = "default_true")]
    pub managed: bool,
    #[serde(default = "default_qdrant_version")]
    pub version: String,
    #[serde(default = "default_install_dir")]
    pub install_dir: PathBuf,
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default = "default_http_port")]
    pub http_port: u16,
    #[serde(default = "default_grpc_port")]
    pub grpc_port: u16,
    #[serde(default = "default_ready_timeout_secs")]
    pub ready_timeout_secs: u64,
}

impl Default for VectorConfig {
    fn default() -> Self {
        Self {
            url: None,
            collection: default_collection(),
            managed: true,
            version: default_qdrant_version(),
            install_dir: default_install_dir(),
            data_dir: default_data_dir(),
            http_port: default_http_port(),
            grpc_port: default_grpc_port(),
            ready_timeout_secs: default_ready_timeout_secs(),
        }
    }
}

impl VectorConfig {
    pub fn endpoint(&self) -> String {
        match &self.url {
            Some(url) => url.trim_end_matches('/').to_string(),
            None => format!("http://127.0.0.1:{}", self.http_port),
        }
    }

    pub fn ready_timeout(&self) -> Duration {
        Duration::from_secs(self.ready_timeout_secs)
    }
}

fn app_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".session-rag")
}

fn default_collection() -> String {
    "session_knowledge".to_string()
}
fn default_true() -> bool {
    true
}
fn default_qdrant_version() -> String {
    "v1.16.3".to_string()
}
fn default_install_dir() -> PathBuf {
    app_dir().join("bin").join("qdrant")
}
fn default_data_dir() -> PathBuf {
    app_dir().join("data").join("qdrant")
}
fn default_http_port() -> u16 {
    6333
}
fn default_grpc_port() -> u16 {
    6334
}
fn default_ready_timeout_secs() -> u64 {
    10
}

// ============ Scan ============

#[derive(Debug, Deserialize, Clone)]
pub struct ScanSettings {
    #[serde(default = "default_scan_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// `manual`, `30m`, `1h`, `2h`, `6h` or `24h`.
    #[serde(default = "default_interval")]
    pub interval: String,
    #[serde(default = "default_true")]
    pub watch: bool,
}

impl Default for ScanSettings {
    fn default() -> Self {
        Self {
            batch_size: default_scan_batch_size(),
            concurrency: default_concurrency(),
            interval: default_interval(),
            watch: true,
        }
    }
}

impl ScanSettings {
    /// Periodic rescan interval, `None` for manual mode.
    pub fn interval(&self) -> Option<Duration> {
        parse_scan_interval(&self.interval)
    }
}

fn default_scan_batch_size() -> usize {
    10
}
fn default_concurrency() -> usize {
    3
}
fn default_interval() -> String {
    "manual".to_string()
}

/// Map an interval keyword to a duration. Unknown values fall back to one hour.
pub fn parse_scan_interval(interval: &str) -> Option<Duration> {
    let secs = match interval {
        "manual" => return None,
        "30m" => 30 * 60,
        "1h" => 60 * 60,
        "2h" => 2 * 60 * 60,
        "6h" => 6 * 60 * 60,
        "24h" => 24 * 60 * 60,
        _ => 60 * 60,
    };
    Some(Duration::from_secs(secs))
}

// ============ Enrichment ============

#[derive(Debug, Deserialize, Clone)]
pub struct EnrichmentConfig {
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_enrichment_batch_size")]
    pub batch_size: usize,
}

impl Default for EnrichmentConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            poll_interval_secs: default_poll_interval_secs(),
            batch_size: default_enrichment_batch_size(),
        }
    }
}

fn default_workers() -> usize {
    2
}
fn default_poll_interval_secs() -> u64 {
    30
}
fn default_enrichment_batch_size() -> usize {
    5
}

// ============ Logging ============

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

// ============ Loading ============

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let mut config: Config =
        toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    validate(&mut config)?;
    Ok(config)
}

/// Check invariants and clamp tunables into their supported ranges.
pub fn validate(config: &mut Config) -> Result<()> {
    if config.scan.batch_size == 0 {
        bail!("scan.batch_size must be > 0");
    }
    if config.scan.concurrency == 0 {
        bail!("scan.concurrency must be > 0");
    }

    match config.embedding.provider.as_str() {
        "disabled" | "openai" | "ollama" | "local" => {}
        other => bail!(
            "Unknown embedding provider: '{}'. Must be disabled, openai, ollama, or local.",
            other
        ),
    }
    if config.embedding.is_enabled() && config.embedding.model.is_none() {
        bail!(
            "embedding.model must be specified when provider is '{}'",
            config.embedding.provider
        );
    }
    if config.embedding.dims == Some(0) {
        bail!("embedding.dims must be > 0");
    }

    match config.llm.provider.as_str() {
        "disabled" | "openai" => {}
        other => bail!(
            "Unknown llm provider: '{}'. Must be disabled or openai.",
            other
        ),
    }
    if config.llm.is_enabled() && config.llm.model.is_none() {
        bail!("llm.model must be specified when provider is 'openai'");
    }

    config.enrichment.workers = config.enrichment.workers.clamp(1, 10);
    config.enrichment.poll_interval_secs = config.enrichment.poll_interval_secs.max(5);
    if config.enrichment.batch_size == 0 {
        config.enrichment.batch_size = default_enrichment_batch_size();
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(toml_str: &str) -> Result<Config> {
        let mut config: Config = toml::from_str(toml_str)?;
        validate(&mut config)?;
        Ok(config)
    }

    #[test]
    fn minimal_config_uses_defaults() {
        let config = parse("[db]\npath = \"./x.sqlite\"\n").unwrap();
        assert!(!config.embedding.is_enabled());
        assert!(!config.llm.is_enabled());
        assert_eq!(config.scan.batch_size, 10);
        assert_eq!(config.scan.concurrency, 3);
        assert_eq!(config.enrichment.workers, 2);
        assert_eq!(config.enrichment.poll_interval_secs, 30);
        assert_eq!(config.vector.collection, "session_knowledge");
        assert_eq!(config.vector.endpoint(), "http://127.0.0.1:6333");
        assert!(config.scan.interval().is_none());
    }

    #[test]
    fn enrichment_tunables_are_clamped() {
        let config = parse(
            "[db]\npath = \"x\"\n[enrichment]\nworkers = 50\npoll_interval_secs = 1\n",
        )
        .unwrap();
        assert_eq!(config.enrichment.workers, 10);
        assert_eq!(config.enrichment.poll_interval_secs, 5);
    }

    #[test]
    fn enabled_embedding_requires_model() {
        let err = parse("[db]\npath = \"x\"\n[embedding]\nprovider = \"openai\"\n").unwrap_err();
        assert!(err.to_string().contains("embedding.model"));
    }

    #[test]
    fn unknown_provider_rejected() {
        assert!(parse("[db]\npath = \"x\"\n[embedding]\nprovider = \"magic\"\n").is_err());
    }

    #[test]
    fn scan_interval_keywords() {
        assert_eq!(parse_scan_interval("manual"), None);
        assert_eq!(
            parse_scan_interval("30m"),
            Some(Duration::from_secs(1800))
        );
        assert_eq!(
            parse_scan_interval("weird"),
            Some(Duration::from_secs(3600))
        );
    }
}
