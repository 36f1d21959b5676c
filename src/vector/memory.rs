//! In-memory [`VectorStore`] for tests and offline use.
//!
//! Collections are `HashMap`s behind `parking_lot::RwLock`. Queries are
//! brute-force cosine similarity over every stored point.

use std::collections::HashMap;

use anyhow::{bail, Result};
use async_trait::async_trait;
use parking_lot::RwLock;

use super::{Filter, Payload, Point, ScoredPoint, VectorStore};

struct Collection {
    dims: usize,
    points: HashMap<String, (Vec<f32>, Payload)>,
}

pub struct MemoryStore {
    collections: RwLock<HashMap<String, Collection>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            collections: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn cosine_sim(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let mag_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let mag_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if mag_a < f32::EPSILON || mag_b < f32::EPSILON {
        0.0
    } else {
        dot / (mag_a * mag_b)
    }
}

#[async_trait]
impl VectorStore for MemoryStore {
    async fn list_collections(&self) -> Result<Vec<String>> {
        let collections = self.collections.read();
        let mut names: Vec<String> = collections.keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    async fn create_collection(&self, name: &str, dims: usize) -> Result<()> {
        let mut collections = self.collections.write();
        if collections.contains_key(name) {
            bail!("collection {} already exists", name);
        }
        collections.insert(
            name.to_string(),
            Collection {
                dims,
                points: HashMap::new(),
            },
        );
        Ok(())
    }

    async fn delete_collection(&self, name: &str) -> Result<()> {
        self.collections.write().remove(name);
        Ok(())
    }

    async fn upsert(&self, collection: &str, points: Vec<Point>) -> Result<()> {
        let mut collections = self.collections.write();
        let Some(coll) = collections.get_mut(collection) else {
            bail!("collection {} not found", collection);
        };
        for point in &points {
            if point.vector.len() != coll.dims {
                bail!(
                    "vector dimension mismatch: expected {}, got {}",
                    coll.dims,
                    point.vector.len()
                );
            }
        }
        for point in points {
            coll.points.insert(point.id, (point.vector, point.payload));
        }
        Ok(())
    }

    async fn set_payload(&self, collection: &str, id: &str, payload: Payload) -> Result<()> {
        let mut collections = self.collections.write();
        let Some(coll) = collections.get_mut(collection) else {
            bail!("collection {} not found", collection);
        };
        let Some((_, existing)) = coll.points.get_mut(id) else {
            bail!("point {} not found", id);
        };
        existing.extend(payload);
        Ok(())
    }

    async fn delete_by_filter(&self, collection: &str, filter: &Filter) -> Result<()> {
        let mut collections = self.collections.write();
        if let Some(coll) = collections.get_mut(collection) {
            coll.points.retain(|_, (_, payload)| !filter.matches(payload));
        }
        Ok(())
    }

    async fn query(
        &self,
        collection: &str,
        vector: &[f32],
        filter: Option<&Filter>,
        limit: usize,
    ) -> Result<Vec<ScoredPoint>> {
        let collections = self.collections.read();
        let Some(coll) = collections.get(collection) else {
            bail!("collection {} not found", collection);
        };

        let mut hits: Vec<ScoredPoint> = coll
            .points
            .iter()
            .filter(|(_, (_, payload))| filter.map_or(true, |f| f.matches(payload)))
            .map(|(id, (v, payload))| ScoredPoint {
                id: id.clone(),
                score: cosine_sim(vector, v),
                payload: payload.clone(),
            })
            .collect();

        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.id.cmp(&b.id))
        });
        hits.truncate(limit);
        Ok(hits)
    }

    async fn count(&self, collection: &str) -> Result<u64> {
        let collections = self.collections.read();
        Ok(collections
            .get(collection)
            .map(|c| c.points.len() as u64)
            .unwrap_or(0))
    }
}
