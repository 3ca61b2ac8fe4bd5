//! # Graph Store
//!
//! Property-graph collaborator: labeled nodes and typed relationships, with
//! all-or-nothing execution of a mutation batch.
//!
//! ## Batch Semantics
//! ```text
//! execute([m1, m2, m3])
//!   │
//!   ├── stage every mutation against a working copy
//!   │     m1 ok ── m2 ok ── m3 fails (e.g. relationship to missing node)
//!   │                                │
//!   │                                ▼
//!   │                      discard working copy, return Err
//!   │
//!   └── all ok → swap working copy in (commit)
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::{StoreError, StoreResult};

// =============================================================================
// Graph Elements
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    pub labels: Vec<String>,
    pub properties: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Relationship {
    pub id: String,
    pub rel_type: String,
    pub start_node_id: String,
    pub end_node_id: String,
    pub properties: Map<String, Value>,
}

/// One write in a graph batch.
#[derive(Debug, Clone, PartialEq)]
pub enum GraphMutation {
    /// Fails if the id is taken.
    CreateNode {
        id: String,
        labels: Vec<String>,
        properties: Map<String, Value>,
    },
    /// Upsert; replaces the property map and adds missing labels.
    MergeNode {
        id: String,
        labels: Vec<String>,
        properties: Map<String, Value>,
    },
    /// `SET n += props`; fails if the node does not exist.
    UpdateNode {
        id: String,
        properties: Map<String, Value>,
    },
    /// Detach-delete; a missing node is a no-op.
    DeleteNode { id: String },
    /// Fails if either endpoint is missing or the id is taken.
    CreateRelationship {
        id: String,
        rel_type: String,
        start_node_id: String,
        end_node_id: String,
        properties: Map<String, Value>,
    },
    /// A missing relationship is a no-op.
    DeleteRelationship { id: String },
}

// =============================================================================
// Trait
// =============================================================================

#[async_trait]
pub trait GraphStore: Send + Sync {
    /// Applies `mutations` in order inside one native transaction.
    async fn execute(&self, mutations: Vec<GraphMutation>) -> StoreResult<()>;

    async fn get_node(&self, id: &str) -> StoreResult<Option<Node>>;

    async fn get_relationship(&self, id: &str) -> StoreResult<Option<Relationship>>;
}

// =============================================================================
// In-Memory Graph
// =============================================================================

#[derive(Debug, Clone, Default)]
struct GraphState {
    nodes: HashMap<String, Node>,
    relationships: HashMap<String, Relationship>,
}

impl GraphState {
    fn apply(&mut self, mutation: GraphMutation) -> StoreResult<()> {
        match mutation {
            GraphMutation::CreateNode {
                id,
                labels,
                properties,
            } => {
                if self.nodes.contains_key(&id) {
                    return Err(StoreError::Constraint(format!("node '{}' already exists", id)));
                }
                self.nodes.insert(
                    id.clone(),
                    Node {
                        id,
                        labels,
                        properties,
                    },
                );
            }
            GraphMutation::MergeNode {
                id,
                labels,
                properties,
            } => {
                let node = self.nodes.entry(id.clone()).or_insert_with(|| Node {
                    id,
                    labels: Vec::new(),
                    properties: Map::new(),
                });
                for label in labels {
                    if !node.labels.contains(&label) {
                        node.labels.push(label);
                    }
                }
                node.properties = properties;
            }
            GraphMutation::UpdateNode { id, properties } => {
                let node = self
                    .nodes
                    .get_mut(&id)
                    .ok_or_else(|| StoreError::not_found("node", id.clone()))?;
                node.properties.extend(properties);
            }
            GraphMutation::DeleteNode { id } => {
                if self.nodes.remove(&id).is_some() {
                    self.relationships
                        .retain(|_, r| r.start_node_id != id && r.end_node_id != id);
                }
            }
            GraphMutation::CreateRelationship {
                id,
                rel_type,
                start_node_id,
                end_node_id,
                properties,
            } => {
                if self.relationships.contains_key(&id) {
                    return Err(StoreError::Constraint(format!(
                        "relationship '{}' already exists",
                        id
                    )));
                }
                for endpoint in [&start_node_id, &end_node_id] {
                    if !self.nodes.contains_key(endpoint) {
                        return Err(StoreError::Constraint(format!(
                            "relationship '{}' references missing node '{}'",
                            id, endpoint
                        )));
                    }
                }
                self.relationships.insert(
                    id.clone(),
                    Relationship {
                        id,
                        rel_type,
                        start_node_id,
                        end_node_id,
                        properties,
                    },
                );
            }
            GraphMutation::DeleteRelationship { id } => {
                self.relationships.remove(&id);
            }
        }
        Ok(())
    }
}

/// In-memory graph with the transactional behaviour of a real graph store.
#[derive(Debug)]
pub struct MemoryGraph {
    state: Mutex<GraphState>,
    available: AtomicBool,
}

impl Default for MemoryGraph {
    fn default() -> Self {
        MemoryGraph {
            state: Mutex::new(GraphState::default()),
            available: AtomicBool::new(true),
        }
    }
}

impl MemoryGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulates an outage: every call fails with `Unavailable` while off.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub async fn node_count(&self) -> usize {
        self.state.lock().await.nodes.len()
    }

    fn check_available(&self) -> StoreResult<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::unavailable("graph", "graph store is offline"))
        }
    }
}

#[async_trait]
impl GraphStore for MemoryGraph {
    async fn execute(&self, mutations: Vec<GraphMutation>) -> StoreResult<()> {
        self.check_available()?;

        let mut state = self.state.lock().await;
        let mut staged = state.clone();
        let count = mutations.len();

        for mutation in mutations {
            staged.apply(mutation)?;
        }

        *state = staged;
        debug!(mutations = count, "Graph transaction committed");
        Ok(())
    }

    async fn get_node(&self, id: &str) -> StoreResult<Option<Node>> {
        self.check_available()?;
        Ok(self.state.lock().await.nodes.get(id).cloned())
    }

    async fn get_relationship(&self, id: &str) -> StoreResult<Option<Relationship>> {
        self.check_available()?;
        Ok(self.state.lock().await.relationships.get(id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn props(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap_or_default()
    }

    fn create(id: &str) -> GraphMutation {
        GraphMutation::CreateNode {
            id: id.to_string(),
            labels: vec!["Test".to_string()],
            properties: props(json!({ "name": id })),
        }
    }

    #[tokio::test]
    async fn test_batch_is_all_or_nothing() {
        let graph = MemoryGraph::new();
        let result = graph
            .execute(vec![
                create("a"),
                GraphMutation::CreateRelationship {
                    id: "r1".into(),
                    rel_type: "KNOWS".into(),
                    start_node_id: "a".into(),
                    end_node_id: "b".into(),
                    properties: Map::new(),
                },
            ])
            .await;

        assert!(matches!(result, Err(StoreError::Constraint(_))));
        assert!(graph.get_node("a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_update_and_merge() {
        let graph = MemoryGraph::new();
        graph.execute(vec![create("a")]).await.unwrap();
        graph
            .execute(vec![GraphMutation::UpdateNode {
                id: "a".into(),
                properties: props(json!({ "score": 1 })),
            }])
            .await
            .unwrap();

        let node = graph.get_node("a").await.unwrap().unwrap();
        assert_eq!(node.properties.get("name"), Some(&json!("a")));
        assert_eq!(node.properties.get("score"), Some(&json!(1)));

        graph
            .execute(vec![GraphMutation::MergeNode {
                id: "a".into(),
                labels: vec!["Other".into()],
                properties: props(json!({ "score": 2 })),
            }])
            .await
            .unwrap();
        let node = graph.get_node("a").await.unwrap().unwrap();
        assert_eq!(node.labels, vec!["Test".to_string(), "Other".to_string()]);
        assert_eq!(node.properties.get("name"), None);
    }

    #[tokio::test]
    async fn test_delete_node_detaches_relationships() {
        let graph = MemoryGraph::new();
        graph
            .execute(vec![
                create("a"),
                create("b"),
                GraphMutation::CreateRelationship {
                    id: "r1".into(),
                    rel_type: "KNOWS".into(),
                    start_node_id: "a".into(),
                    end_node_id: "b".into(),
                    properties: Map::new(),
                },
            ])
            .await
            .unwrap();

        graph
            .execute(vec![GraphMutation::DeleteNode { id: "b".into() }])
            .await
            .unwrap();
        assert!(graph.get_relationship("r1").await.unwrap().is_none());
        assert_eq!(graph.node_count().await, 1);
    }

    #[tokio::test]
    async fn test_offline_graph() {
        let graph = MemoryGraph::new();
        graph.set_available(false);
        let err = graph.execute(vec![create("a")]).await.unwrap_err();
        assert!(err.is_transient());
    }
}
