//! Qdrant REST client.
//!
//! Only the handful of endpoints the engine uses are wrapped. Writes pass
//! `wait=true` so a returned call means the change is visible to queries.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;

use super::{FieldMatch, Filter, Payload, Point, ScoredPoint, VectorStore};

pub struct QdrantStore {
    base_url: String,
    client: reqwest::Client,
}

#[derive(Deserialize)]
struct Envelope<T> {
    result: T,
}

#[derive(Deserialize)]
struct CollectionList {
    collections: Vec<CollectionDescription>,
}

#[derive(Deserialize)]
struct CollectionDescription {
    name: String,
}

#[derive(Deserialize)]
struct Hit {
    id: Value,
    score: f32,
    #[serde(default)]
    payload: Option<Payload>,
}

#[derive(Deserialize)]
struct CountResult {
    count: u64,
}

impl QdrantStore {
    pub fn new(base_url: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn send(&self, request: reqwest::RequestBuilder, what: &str) -> Result<Value> {
        let response = request
            .send()
            .await
            .with_context(|| format!("qdrant {} request failed", what))?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            bail!("qdrant {} failed ({}): {}", what, status, text);
        }
        Ok(response.json().await?)
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

fn condition(m: &FieldMatch) -> Value {
    json!({"key": m.key, "match": {"value": m.value}})
}

/// Render a [`Filter`] in Qdrant's JSON filter syntax.
pub fn filter_json(filter: &Filter) -> Value {
    let mut body = serde_json::Map::new();
    if !filter.must.is_empty() {
        body.insert(
            "must".into(),
            Value::Array(filter.must.iter().map(condition).collect()),
        );
    }
    if !filter.should.is_empty() {
        body.insert(
            "should".into(),
            Value::Array(filter.should.iter().map(condition).collect()),
        );
    }
    Value::Object(body)
}

fn id_string(id: &Value) -> String {
    match id {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[async_trait]
impl VectorStore for QdrantStore {
    async fn list_collections(&self) -> Result<Vec<String>> {
        let value = self
            .send(self.client.get(self.url("/collections")), "list collections")
            .await?;
        let list: Envelope<CollectionList> = serde_json::from_value(value)?;
        Ok(list.result.collections.into_iter().map(|c| c.name).collect())
    }

    async fn create_collection(&self, name: &str, dims: usize) -> Result<()> {
        let body = json!({"vectors": {"size": dims, "distance": "Cosine"}});
        self.send(
            self.client
                .put(self.url(&format!("/collections/{}", name)))
                .json(&body),
            "create collection",
        )
        .await?;
        Ok(())
    }

    async fn delete_collection(&self, name: &str) -> Result<()> {
        self.send(
            self.client
                .delete(self.url(&format!("/collections/{}", name))),
            "delete collection",
        )
        .await?;
        Ok(())
    }

    async fn upsert(&self, collection: &str, points: Vec<Point>) -> Result<()> {
        if points.is_empty() {
            return Ok(());
        }
        let points: Vec<Value> = points
            .into_iter()
            .map(|p| json!({"id": p.id, "vector": p.vector, "payload": p.payload}))
            .collect();
        self.send(
            self.client
                .put(self.url(&format!("/collections/{}/points?wait=true", collection)))
                .json(&json!({ "points": points })),
            "upsert",
        )
        .await?;
        Ok(())
    }

    async fn set_payload(&self, collection: &str, id: &str, payload: Payload) -> Result<()> {
        self.send(
            self.client
                .post(self.url(&format!(
                    "/collections/{}/points/payload?wait=true",
                    collection
                )))
                .json(&json!({"payload": payload, "points": [id]})),
            "set payload",
        )
        .await?;
        Ok(())
    }

    async fn delete_by_filter(&self, collection: &str, filter: &Filter) -> Result<()> {
        self.send(
            self.client
                .post(self.url(&format!(
                    "/collections/{}/points/delete?wait=true",
                    collection
                )))
                .json(&json!({"filter": filter_json(filter)})),
            "delete points",
        )
        .await?;
        Ok(())
    }

    async fn query(
        &self,
        collection: &str,
        vector: &[f32],
        filter: Option<&Filter>,
        limit: usize,
    ) -> Result<Vec<ScoredPoint>> {
        let mut body = json!({
            "vector": vector,
            "limit": limit,
            "with_payload": true,
        });
        if let Some(filter) = filter {
            body["filter"] = filter_json(filter);
        }

        let value = self
            .send(
                self.client
                    .post(self.url(&format!("/collections/{}/points/search", collection)))
                    .json(&body),
                "search",
            )
            .await?;
        let hits: Envelope<Vec<Hit>> = serde_json::from_value(value)?;

        Ok(hits
            .result
            .into_iter()
            .map(|h| ScoredPoint {
                id: id_string(&h.id),
                score: h.score,
                payload: h.payload.unwrap_or_default(),
            })
            .collect())
    }

    async fn count(&self, collection: &str) -> Result<u64> {
        let value = self
            .send(
                self.client
                    .post(self.url(&format!("/collections/{}/points/count", collection)))
                    .json(&json!({"exact": true})),
                "count",
            )
            .await?;
        let count: Envelope<CountResult> = serde_json::from_value(value)?;
        Ok(count.result.count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_project_filter_uses_must() {
        let f = filter_json(&Filter::must("project_id", "A"));
        assert_eq!(
            f,
            json!({"must": [{"key": "project_id", "match": {"value": "A"}}]})
        );
    }

    #[test]
    fn multi_project_filter_uses_should() {
        let f = filter_json(&Filter::should_any(
            "project_id",
            &["A".to_string(), "B".to_string()],
        ));
        assert!(f.get("must").is_none());
        assert_eq!(f["should"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn numeric_ids_are_stringified() {
        assert_eq!(id_string(&json!(42)), "42");
        assert_eq!(id_string(&json!("abc")), "abc");
    }

    #[test]
    fn parses_search_response() {
        let value = json!({
            "result": [{"id": "x", "version": 1, "score": 0.9, "payload": {"session_id": "s"}}],
            "status": "ok",
            "time": 0.001
        });
        let hits: Envelope<Vec<Hit>> = serde_json::from_value(value).unwrap();
        assert_eq!(hits.result[0].score, 0.9);
        assert_eq!(
            hits.result[0].payload.as_ref().unwrap()["session_id"],
            json!("s")
        );
    }
}
