//! Vector store abstraction and the embedded Qdrant lifecycle.
//!
//! The [`VectorStore`] trait covers the operations the indexer, enrichment
//! workers and search service need: collection provisioning, point upsert,
//! payload patching, filtered deletion and filtered nearest-neighbor query.
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`qdrant`] | REST client for a Qdrant server |
//! | [`memory`] | brute-force in-memory store |
//! | [`manager`] | install, start and stop a local Qdrant process |
//! | [`download`] | retrying, cancellable HTTP downloader |
//! | [`archive`] | zip / tar.gz extraction with traversal checks |
//! | [`platform`] | OS/arch → release asset resolution |
//!
//! Points are keyed by chunk ID. Payload values are plain JSON scalars.

pub mod archive;
pub mod download;
pub mod manager;
pub mod memory;
pub mod platform;
pub mod qdrant;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{Map, Value};

pub use memory::MemoryStore;
pub use qdrant::QdrantStore;

/// Point payload: field name to JSON scalar.
pub type Payload = Map<String, Value>;

/// Exact-match condition on one payload field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldMatch {
    pub key: String,
    pub value: String,
}

impl FieldMatch {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// Payload filter. All `must` conditions hold and, when `should` is not
/// empty, at least one `should` condition holds.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Filter {
    pub must: Vec<FieldMatch>,
    pub should: Vec<FieldMatch>,
}

impl Filter {
    pub fn must(key: &str, value: &str) -> Self {
        Self {
            must: vec![FieldMatch::new(key, value)],
            should: Vec::new(),
        }
    }

    pub fn should_any(key: &str, values: &[String]) -> Self {
        Self {
            must: Vec::new(),
            should: values.iter().map(|v| FieldMatch::new(key, v)).collect(),
        }
    }

    /// Evaluate the filter against a payload.
    pub fn matches(&self, payload: &Payload) -> bool {
        let hit = |m: &FieldMatch| match payload.get(&m.key) {
            Some(Value::String(s)) => *s == m.value,
            Some(other) => other.to_string() == m.value,
            None => false,
        };
        self.must.iter().all(hit) && (self.should.is_empty() || self.should.iter().any(hit))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Point {
    pub id: String,
    pub vector: Vec<f32>,
    pub payload: Payload,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScoredPoint {
    pub id: String,
    pub score: f32,
    pub payload: Payload,
}

#[async_trait]
pub trait VectorStore: Send + Sync {
    async fn list_collections(&self) -> Result<Vec<String>>;

    /// Create a cosine-distance collection of `dims`-dimensional vectors.
    async fn create_collection(&self, name: &str, dims: usize) -> Result<()>;

    async fn delete_collection(&self, name: &str) -> Result<()>;

    async fn upsert(&self, collection: &str, points: Vec<Point>) -> Result<()>;

    /// Merge `payload` into an existing point's payload.
    async fn set_payload(&self, collection: &str, id: &str, payload: Payload) -> Result<()>;

    async fn delete_by_filter(&self, collection: &str, filter: &Filter) -> Result<()>;

    async fn query(
        &self,
        collection: &str,
        vector: &[f32],
        filter: Option<&Filter>,
        limit: usize,
    ) -> Result<Vec<ScoredPoint>>;

    async fn count(&self, collection: &str) -> Result<u64>;
}

/// Create any of `names` that does not exist yet. Existing collections are untouched.
pub async fn ensure_collections(
    store: &dyn VectorStore,
    names: &[&str],
    dims: usize,
) -> Result<()> {
    let existing = store.list_collections().await?;
    for name in names {
        if !existing.iter().any(|c| c == name) {
            tracing::info!(collection = %name, dims, "creating vector collection");
            store.create_collection(name, dims).await?;
        }
    }
    Ok(())
}

/// Drop every collection in `names` that exists.
pub async fn clear_collections(store: &dyn VectorStore, names: &[&str]) -> Result<()> {
    let existing = store.list_collections().await?;
    for name in names {
        if existing.iter().any(|c| c == name) {
            store.delete_collection(name).await?;
        }
    }
    Ok(())
}

/// Replace invalid UTF-8 sequences and drop NUL / control characters the
/// store rejects in string payloads.
pub fn sanitize_utf8(input: &str) -> String {
    input
        .chars()
        .filter(|c| *c == '\n' || *c == '\t' || !c.is_control())
        .collect()
}

/// Lossy conversion for bytes of unknown encoding.
pub fn sanitize_bytes(input: &[u8]) -> String {
    sanitize_utf8(&String::from_utf8_lossy(input))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn payload(project: &str) -> Payload {
        let mut p = Payload::new();
        p.insert("project_id".into(), json!(project));
        p.insert("has_code".into(), json!(true));
        p
    }

    #[test]
    fn must_filter_requires_every_condition() {
        let f = Filter::must("project_id", "A");
        assert!(f.matches(&payload("A")));
        assert!(!f.matches(&payload("B")));
    }

    #[test]
    fn should_filter_requires_any_condition() {
        let f = Filter::should_any("project_id", &["A".into(), "C".into()]);
        assert!(f.matches(&payload("A")));
        assert!(f.matches(&payload("C")));
        assert!(!f.matches(&payload("B")));
    }

    #[test]
    fn non_string_values_match_by_json_text() {
        let f = Filter::must("has_code", "true");
        assert!(f.matches(&payload("A")));
    }

    #[test]
    fn sanitize_strips_control_chars() {
        assert_eq!(sanitize_utf8("a\u{0}b\tc\n"), "ab\tc\n");
        assert_eq!(sanitize_bytes(&[b'o', 0xff, b'k']), "o\u{fffd}k");
    }
}
