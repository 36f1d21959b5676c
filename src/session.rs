//! Session and project lookup over the on-disk transcript tree.
//!
//! ```text
//! <root>/
//!   <projectKey>/                 e.g. Users-alice-code-myapp
//!     agent-transcripts/
//!       <sessionID>.txt
//! ```
//!
//! The indexer depends on the two traits here, not on the layout, so tests
//! and other front-ends can supply their own sessions.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use crate::models::{Message, ProjectInfo, WorkspaceInfo};
use crate::transcript::parse_transcript;

pub const TRANSCRIPTS_DIR: &str = "agent-transcripts";
pub const TRANSCRIPT_EXT: &str = "txt";

/// Source of parsed messages for a session.
#[async_trait]
pub trait SessionTextProvider: Send + Sync {
    async fn session_messages(&self, session_id: &str) -> Result<Vec<Message>>;
}

/// Resolves sessions to projects.
#[async_trait]
pub trait ProjectDirectory: Send + Sync {
    async fn project_for_session(&self, session_id: &str) -> Result<Option<ProjectInfo>>;
    async fn get_project(&self, key: &str) -> Result<Option<ProjectInfo>>;
    async fn list_projects(&self) -> Result<Vec<ProjectInfo>>;
}

/// One transcript file found on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranscriptFile {
    pub session_id: String,
    pub project_key: String,
    pub path: PathBuf,
}

/// Split `<root>/<projectKey>/agent-transcripts/<sessionID>.txt` into its parts.
pub fn parse_transcript_path(path: &Path) -> Option<TranscriptFile> {
    if path.extension()? != TRANSCRIPT_EXT {
        return None;
    }
    let session_id = path.file_stem()?.to_str()?.to_string();
    let parent = path.parent()?;
    if parent.file_name()? != TRANSCRIPTS_DIR {
        return None;
    }
    let project_key = parent.parent()?.file_name()?.to_str()?.to_string();
    if session_id.is_empty() || project_key.is_empty() {
        return None;
    }
    Some(TranscriptFile {
        session_id,
        project_key,
        path: path.to_path_buf(),
    })
}

/// Every transcript under `root`, sorted by path.
pub fn discover_transcripts(root: &Path) -> Result<Vec<TranscriptFile>> {
    let mut files = Vec::new();
    let entries = match std::fs::read_dir(root) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(files),
        Err(e) => return Err(e).with_context(|| format!("reading {}", root.display())),
    };

    for entry in entries.flatten() {
        if !entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
            continue;
        }
        let transcripts = entry.path().join(TRANSCRIPTS_DIR);
        let Ok(sessions) = std::fs::read_dir(&transcripts) else {
            continue;
        };
        for session in sessions.flatten() {
            if let Some(file) = parse_transcript_path(&session.path()) {
                if session.path().is_file() {
                    files.push(file);
                }
            }
        }
    }

    files.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(files)
}

/// Modification time in Unix milliseconds, or 0 when unavailable.
pub fn mtime_millis(path: &Path) -> i64 {
    std::fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Filesystem-backed sessions and projects rooted at the transcript directory.
#[derive(Debug, Clone)]
pub struct FsSessions {
    root: PathBuf,
}

impl FsSessions {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of a session's transcript, searching every project directory.
    pub fn locate(&self, session_id: &str) -> Result<Option<PathBuf>> {
        let file_name = format!("{}.{}", session_id, TRANSCRIPT_EXT);
        let entries = match std::fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e).with_context(|| format!("reading {}", self.root.display())),
        };
        for entry in entries.flatten() {
            let candidate = entry.path().join(TRANSCRIPTS_DIR).join(&file_name);
            if candidate.is_file() {
                return Ok(Some(candidate));
            }
        }
        Ok(None)
    }

    fn project_info(&self, key: &str) -> ProjectInfo {
        let workspace = workspace_path_for_key(key);
        let project_name = workspace
            .as_ref()
            .and_then(|p| p.file_name())
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| key.rsplit('-').next().unwrap_or(key).to_string());

        ProjectInfo {
            project_id: key.to_string(),
            project_name,
            workspaces: vec![WorkspaceInfo {
                workspace_id: key.to_string(),
                path: workspace,
            }],
        }
    }
}

#[async_trait]
impl SessionTextProvider for FsSessions {
    async fn session_messages(&self, session_id: &str) -> Result<Vec<Message>> {
        let Some(path) = self.locate(session_id)? else {
            anyhow::bail!("session {} not found under {}", session_id, self.root.display());
        };
        let content = tokio::fs::read(&path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        let text = String::from_utf8_lossy(&content);
        Ok(parse_transcript(&text, mtime_millis(&path)))
    }
}

#[async_trait]
impl ProjectDirectory for FsSessions {
    async fn project_for_session(&self, session_id: &str) -> Result<Option<ProjectInfo>> {
        let Some(path) = self.locate(session_id)? else {
            return Ok(None);
        };
        Ok(parse_transcript_path(&path).map(|f| self.project_info(&f.project_key)))
    }

    async fn get_project(&self, key: &str) -> Result<Option<ProjectInfo>> {
        if self.root.join(key).join(TRANSCRIPTS_DIR).is_dir() {
            Ok(Some(self.project_info(key)))
        } else {
            Ok(None)
        }
    }

    async fn list_projects(&self) -> Result<Vec<ProjectInfo>> {
        let mut keys: Vec<String> = discover_transcripts(&self.root)?
            .into_iter()
            .map(|f| f.project_key)
            .collect();
        keys.dedup();
        Ok(keys.iter().map(|k| self.project_info(k)).collect())
    }
}

/// Reconstruct the workspace directory a project key was derived from.
///
/// Keys are absolute paths with separators replaced by `-`, which is
/// ambiguous when directory names contain dashes, so candidate splits are
/// checked against the filesystem.
pub fn workspace_path_for_key(key: &str) -> Option<PathBuf> {
    let segments: Vec<&str> = key.split('-').filter(|s| !s.is_empty()).collect();
    if segments.is_empty() {
        return None;
    }
    resolve_segments(Path::new("/"), &segments)
}

fn resolve_segments(base: &Path, segments: &[&str]) -> Option<PathBuf> {
    if segments.is_empty() {
        return Some(base.to_path_buf());
    }
    for take in 1..=segments.len() {
        let name = segments[..take].join("-");
        let candidate = base.join(&name);
        if candidate.is_dir() {
            if let Some(found) = resolve_segments(&candidate, &segments[take..]) {
                return Some(found);
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_session(root: &Path, project: &str, session: &str, body: &str) -> PathBuf {
        let dir = root.join(project).join(TRANSCRIPTS_DIR);
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(format!("{}.txt", session));
        std::fs::write(&path, body).unwrap();
        path
    }

    #[test]
    fn parses_transcript_paths() {
        let f = parse_transcript_path(Path::new(
            "/home/u/.cursor/projects/home-u-work/agent-transcripts/abc123.txt",
        ))
        .unwrap();
        assert_eq!(f.session_id, "abc123");
        assert_eq!(f.project_key, "home-u-work");

        assert!(parse_transcript_path(Path::new("/p/agent-transcripts/abc.json")).is_none());
        assert!(parse_transcript_path(Path::new("/p/other/abc.txt")).is_none());
    }

    #[test]
    fn discovers_only_transcripts() {
        let tmp = TempDir::new().unwrap();
        write_session(tmp.path(), "proj-a", "s1", "user:\nhi\n");
        write_session(tmp.path(), "proj-b", "s2", "user:\nhi\n");
        std::fs::write(tmp.path().join("proj-a/agent-transcripts/notes.md"), "x").unwrap();
        std::fs::create_dir_all(tmp.path().join("proj-c")).unwrap();

        let files = discover_transcripts(tmp.path()).unwrap();
        let ids: Vec<_> = files.iter().map(|f| f.session_id.as_str()).collect();
        assert_eq!(ids, vec!["s1", "s2"]);
    }

    #[test]
    fn missing_root_yields_nothing() {
        let tmp = TempDir::new().unwrap();
        assert!(discover_transcripts(&tmp.path().join("nope")).unwrap().is_empty());
    }

    #[tokio::test]
    async fn provides_messages_and_project() {
        let tmp = TempDir::new().unwrap();
        write_session(
            tmp.path(),
            "no-such-workspace",
            "s1",
            "user:\nFix the bug\nassistant:\nDone.\n",
        );
        let sessions = FsSessions::new(tmp.path());

        let messages = sessions.session_messages("s1").await.unwrap();
        assert_eq!(messages.len(), 2);

        let project = sessions.project_for_session("s1").await.unwrap().unwrap();
        assert_eq!(project.project_id, "no-such-workspace");
        assert_eq!(project.project_name, "workspace");

        assert!(sessions.project_for_session("missing").await.unwrap().is_none());
        assert!(sessions.session_messages("missing").await.is_err());
        assert_eq!(sessions.list_projects().await.unwrap().len(), 1);
    }

    #[test]
    fn workspace_key_resolves_dashed_names() {
        let tmp = TempDir::new().unwrap();
        let ws = tmp.path().join("my-app");
        std::fs::create_dir_all(&ws).unwrap();
        let key = ws.to_string_lossy().replace('/', "-");
        let resolved = workspace_path_for_key(&key).unwrap();
        assert_eq!(resolved, ws);
    }
}
