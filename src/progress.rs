//! Full-scan progress reporting.
//!
//! The scanner publishes a [`ScanProgress`] snapshot after every file.
//! Reporters render snapshots on **stderr** so stdout stays parseable for
//! scripts:
//!
//! ```text
//! scan  running  120 / 1,532 files  (845 chunks)
//! {"event":"progress","status":"running","total_files":1532,"processed_files":120,...}
//! ```

use serde::Serialize;
use std::io::Write;
use std::str::FromStr;
use std::sync::Arc;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanStatus {
    Idle,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl ScanStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScanStatus::Idle => "idle",
            ScanStatus::Running => "running",
            ScanStatus::Completed => "completed",
            ScanStatus::Failed => "failed",
            ScanStatus::Cancelled => "cancelled",
        }
    }
}

/// Snapshot of a full scan.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct ScanProgress {
    pub status: ScanStatus,
    pub total_files: u64,
    pub processed_files: u64,
    /// Chunks written so far.
    pub indexed_messages: u64,
    /// Unix seconds.
    pub start_time: i64,
    pub error_message: Option<String>,
}

impl ScanProgress {
    pub fn idle() -> Self {
        Self {
            status: ScanStatus::Idle,
            total_files: 0,
            processed_files: 0,
            indexed_messages: 0,
            start_time: 0,
            error_message: None,
        }
    }

    pub fn running(total_files: u64, start_time: i64) -> Self {
        Self {
            status: ScanStatus::Running,
            total_files,
            start_time,
            ..Self::idle()
        }
    }

    pub fn is_finished(&self) -> bool {
        matches!(
            self.status,
            ScanStatus::Completed | ScanStatus::Failed | ScanStatus::Cancelled
        )
    }
}

/// Receives every progress snapshot of a scan.
pub trait ScanProgressReporter: Send + Sync {
    fn report(&self, progress: &ScanProgress);
}

/// Human-friendly progress on stderr.
pub struct StderrProgress;

impl ScanProgressReporter for StderrProgress {
    fn report(&self, p: &ScanProgress) {
        let mut line = format!(
            "scan  {}  {} / {} files  ({} chunks)",
            p.status.as_str(),
            format_number(p.processed_files),
            format_number(p.total_files),
            format_number(p.indexed_messages)
        );
        if let Some(err) = &p.error_message {
            line.push_str("  error: ");
            line.push_str(err);
        }
        line.push('\n');
        let mut err = std::io::stderr().lock();
        let _ = err.write_all(line.as_bytes());
        let _ = err.flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl ScanProgressReporter for JsonProgress {
    fn report(&self, p: &ScanProgress) {
        let mut obj = serde_json::to_value(p).unwrap_or_default();
        if let Some(map) = obj.as_object_mut() {
            map.insert("event".into(), serde_json::json!("progress"));
        }
        if let Ok(line) = serde_json::to_string(&obj) {
            let mut err = std::io::stderr().lock();
            let _ = writeln!(err, "{}", line);
            let _ = err.flush();
        }
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl ScanProgressReporter for NoProgress {
    fn report(&self, _progress: &ScanProgress) {}
}

pub fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + (s.len() - 1) / 3);
    let chars: Vec<char> = s.chars().rev().collect();
    for (i, c) in chars.iter().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(*c);
    }
    result.chars().rev().collect()
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Default: human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    pub fn reporter(&self) -> Arc<dyn ScanProgressReporter> {
        match self {
            ProgressMode::Off => Arc::new(NoProgress),
            ProgressMode::Human => Arc::new(StderrProgress),
            ProgressMode::Json => Arc::new(JsonProgress),
        }
    }
}

impl FromStr for ProgressMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "off" => Ok(ProgressMode::Off),
            "human" => Ok(ProgressMode::Human),
            "json" => Ok(ProgressMode::Json),
            other => anyhow::bail!("unknown progress mode '{}': use human, json or off", other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_number_comma() {
        assert_eq!(format_number(0), "0");
        assert_eq!(format_number(999), "999");
        assert_eq!(format_number(1000), "1,000");
        assert_eq!(format_number(1_234_567), "1,234,567");
    }

    #[test]
    fn progress_serializes_lowercase_status() {
        let p = ScanProgress::running(10, 5);
        let v = serde_json::to_value(&p).unwrap();
        assert_eq!(v["status"], "running");
        assert_eq!(v["total_files"], 10);
        assert!(!p.is_finished());
    }

    #[test]
    fn parses_modes() {
        assert_eq!("json".parse::<ProgressMode>().unwrap(), ProgressMode::Json);
        assert!("loud".parse::<ProgressMode>().is_err());
    }

    #[test]
    fn reporters_write_whole_lines_from_many_threads() {
        let mut p = ScanProgress::running(3, 1);
        p.error_message = Some("1 file(s) failed".into());
        std::thread::scope(|s| {
            for _ in 0..4 {
                s.spawn(|| {
                    StderrProgress.report(&p);
                    JsonProgress.report(&p);
                });
            }
        });
    }
}
