//! # Vector Store
//!
//! Vector-similarity index keyed by entity id.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::Mutex;

use crate::error::{StoreError, StoreResult};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorRecord {
    pub id: String,
    pub embedding: Vec<f32>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

/// A search hit with its cosine similarity.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoredId {
    pub id: String,
    pub score: f32,
}

#[async_trait]
pub trait VectorStore: Send + Sync {
    async fn upsert(&self, record: VectorRecord) -> StoreResult<()>;

    /// Returns true if a record was removed.
    async fn delete(&self, id: &str) -> StoreResult<bool>;

    async fn get(&self, id: &str) -> StoreResult<Option<VectorRecord>>;

    /// The `top_k` records most similar to `query`, best first.
    async fn search(&self, query: &[f32], top_k: usize) -> StoreResult<Vec<ScoredId>>;

    /// Nearest neighbours of an indexed record, excluding the record itself.
    async fn search_by_id(&self, id: &str, top_k: usize) -> StoreResult<Vec<ScoredId>> {
        let record = self
            .get(id)
            .await?
            .ok_or_else(|| StoreError::not_found("vector", id))?;
        let hits = self.search(&record.embedding, top_k + 1).await?;
        Ok(hits.into_iter().filter(|h| h.id != id).take(top_k).collect())
    }
}

/// Brute-force in-memory index.
#[derive(Debug, Default)]
pub struct MemoryVectorIndex {
    records: Mutex<HashMap<String, VectorRecord>>,
}

impl MemoryVectorIndex {
    pub fn new() -> Self {
        Self::default()
    }
}

fn cosine(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}

#[async_trait]
impl VectorStore for MemoryVectorIndex {
    async fn upsert(&self, record: VectorRecord) -> StoreResult<()> {
        self.records.lock().await.insert(record.id.clone(), record);
        Ok(())
    }

    async fn delete(&self, id: &str) -> StoreResult<bool> {
        Ok(self.records.lock().await.remove(id).is_some())
    }

    async fn get(&self, id: &str) -> StoreResult<Option<VectorRecord>> {
        Ok(self.records.lock().await.get(id).cloned())
    }

    async fn search(&self, query: &[f32], top_k: usize) -> StoreResult<Vec<ScoredId>> {
        let records = self.records.lock().await;
        let mut hits: Vec<ScoredId> = records
            .values()
            .map(|r| ScoredId {
                id: r.id.clone(),
                score: cosine(query, &r.embedding),
            })
            .collect();
        hits.sort_by(|a, b| b.score.total_cmp(&a.score).then_with(|| a.id.cmp(&b.id)));
        hits.truncate(top_k);
        Ok(hits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str, embedding: Vec<f32>) -> VectorRecord {
        VectorRecord {
            id: id.to_string(),
            embedding,
            metadata: Map::new(),
        }
    }

    #[tokio::test]
    async fn test_search_orders_by_similarity() {
        let index = MemoryVectorIndex::new();
        index.upsert(record("a", vec![1.0, 0.0])).await.unwrap();
        index.upsert(record("b", vec![0.0, 1.0])).await.unwrap();
        index.upsert(record("c", vec![0.9, 0.1])).await.unwrap();

        let hits = index.search(&[1.0, 0.0], 2).await.unwrap();
        let ids: Vec<&str> = hits.iter().map(|h| h.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "c"]);

        let neighbours = index.search_by_id("a", 1).await.unwrap();
        assert_eq!(neighbours[0].id, "c");
    }

    #[tokio::test]
    async fn test_delete() {
        let index = MemoryVectorIndex::new();
        index.upsert(record("a", vec![1.0])).await.unwrap();
        assert!(index.delete("a").await.unwrap());
        assert!(!index.delete("a").await.unwrap());
        assert!(index.search_by_id("a", 3).await.is_err());
    }
}
