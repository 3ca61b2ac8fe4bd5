//! # Sync Targets
//!
//! Per-store adapters the coordinator fans change events out to.
//!
//! ```text
//! ┌──────────────┬───────────────────────────────────────────────────────────┐
//! │ cache        │ SET {type}:{id} = data with the entity type's TTL;        │
//! │              │ refresh-on-update types drop {type}:*:related:{id}        │
//! │ graph        │ MERGE node {type}:{id}, label = capitalised type,         │
//! │              │ props = data                                              │
//! │ warehouse    │ append row to table {type}; deletes append a tombstone    │
//! │ vector       │ upsert {type}:{id}, only when data carries `embeddings`   │
//! └──────────────┴───────────────────────────────────────────────────────────┘
//! ```

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Map, Value};
use tracing::debug;

use keystone_core::{CacheRules, DataSource, SyncEvent};
use keystone_store::{
    GraphMutation, GraphStore, KeyValueStore, VectorRecord, VectorStore, WarehouseStore,
};

use crate::error::{SyncError, SyncResult};

/// What a target did with an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    /// Nothing to write for this store.
    Skipped,
}

/// One store the coordinator can write to and read back from.
#[async_trait]
pub trait SyncTarget: Send + Sync {
    fn store(&self) -> DataSource;

    /// Applies the change; DELETE events remove the entity.
    async fn apply(&self, event: &SyncEvent) -> SyncResult<ApplyOutcome>;

    /// The store's current copy of the entity.
    async fn fetch(&self, entity_type: &str, entity_id: &str) -> SyncResult<Option<Value>>;
}

fn object_data(event: &SyncEvent) -> SyncResult<Map<String, Value>> {
    event.data.as_object().cloned().ok_or_else(|| {
        SyncError::InvalidOperation(format!(
            "{} {}/{} carries non-object data",
            event.operation, event.entity_type, event.entity_id
        ))
    })
}

// =============================================================================
// Cache
// =============================================================================

pub struct CacheTarget {
    store: Arc<dyn KeyValueStore>,
    rules: CacheRules,
}

impl CacheTarget {
    pub fn new(store: Arc<dyn KeyValueStore>, rules: CacheRules) -> Self {
        CacheTarget { store, rules }
    }

    async fn invalidate_related(&self, entity_type: &str, entity_id: &str) -> SyncResult<u64> {
        let pattern = CacheRules::related_pattern(entity_type, entity_id);
        let keys = self.store.scan_keys(&pattern).await?;
        if keys.is_empty() {
            return Ok(0);
        }
        let removed = self.store.delete(&keys).await?;
        debug!(pattern = %pattern, removed, "Invalidated related cache keys");
        Ok(removed)
    }
}

#[async_trait]
impl SyncTarget for CacheTarget {
    fn store(&self) -> DataSource {
        DataSource::Cache
    }

    async fn apply(&self, event: &SyncEvent) -> SyncResult<ApplyOutcome> {
        let key = event.cache_key();
        let rule = self.rules.rule_for(&event.entity_type);

        if event.operation.is_delete() {
            self.store.delete(&[key]).await?;
        } else {
            let json = serde_json::to_string(&event.data)?;
            let ttl = Duration::from_secs(rule.ttl_seconds);
            self.store.set(&key, &json, Some(ttl)).await?;
        }

        if rule.refresh_on_update {
            self.invalidate_related(&event.entity_type, &event.entity_id)
                .await?;
        }
        Ok(ApplyOutcome::Applied)
    }

    async fn fetch(&self, entity_type: &str, entity_id: &str) -> SyncResult<Option<Value>> {
        let key = format!("{}:{}", entity_type, entity_id);
        match self.store.get(&key).await? {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }
}

/// Store-side identity of an entity. Ids are only unique within a type,
/// so graph nodes and vector records are keyed by both.
pub fn scoped_id(entity_type: &str, entity_id: &str) -> String {
    format!("{}:{}", entity_type, entity_id)
}

// =============================================================================
// Graph
// =============================================================================

pub struct GraphTarget {
    graph: Arc<dyn GraphStore>,
}

impl GraphTarget {
    pub fn new(graph: Arc<dyn GraphStore>) -> Self {
        GraphTarget { graph }
    }
}

/// `knowledge` → `Knowledge`.
fn node_label(entity_type: &str) -> String {
    let mut chars = entity_type.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

#[async_trait]
impl SyncTarget for GraphTarget {
    fn store(&self) -> DataSource {
        DataSource::Graph
    }

    async fn apply(&self, event: &SyncEvent) -> SyncResult<ApplyOutcome> {
        let mutation = if event.operation.is_delete() {
            GraphMutation::DeleteNode {
                id: scoped_id(&event.entity_type, &event.entity_id),
            }
        } else {
            GraphMutation::MergeNode {
                id: scoped_id(&event.entity_type, &event.entity_id),
                labels: vec![node_label(&event.entity_type)],
                properties: object_data(event)?,
            }
        };
        self.graph.execute(vec![mutation]).await?;
        Ok(ApplyOutcome::Applied)
    }

    async fn fetch(&self, entity_type: &str, entity_id: &str) -> SyncResult<Option<Value>> {
        Ok(self
            .graph
            .get_node(&scoped_id(entity_type, entity_id))
            .await?
            .map(|node| Value::Object(node.properties)))
    }
}

// =============================================================================
// Warehouse
// =============================================================================

pub struct WarehouseTarget {
    warehouse: Arc<dyn WarehouseStore>,
}

impl WarehouseTarget {
    pub fn new(warehouse: Arc<dyn WarehouseStore>) -> Self {
        WarehouseTarget { warehouse }
    }
}

#[async_trait]
impl SyncTarget for WarehouseTarget {
    fn store(&self) -> DataSource {
        DataSource::Warehouse
    }

    async fn apply(&self, event: &SyncEvent) -> SyncResult<ApplyOutcome> {
        let row = json!({
            "entity_id": event.entity_id,
            "entity_type": event.entity_type,
            "operation": event.operation.to_string(),
            "source": event.source.to_string(),
            "version": event.version,
            "data": event.data,
            "recorded_at": Utc::now().to_rfc3339(),
        });
        let Value::Object(row) = row else {
            return Err(SyncError::Internal("warehouse row is not an object".into()));
        };
        self.warehouse
            .insert_rows(&event.entity_type, vec![row])
            .await?;
        Ok(ApplyOutcome::Applied)
    }

    async fn fetch(&self, entity_type: &str, entity_id: &str) -> SyncResult<Option<Value>> {
        let Some(row) = self
            .warehouse
            .latest_row(entity_type, "entity_id", entity_id)
            .await?
        else {
            return Ok(None);
        };
        if row.get("operation").and_then(Value::as_str) == Some("delete") {
            return Ok(None);
        }
        Ok(row.get("data").cloned())
    }
}

// =============================================================================
// Vector
// =============================================================================

pub struct VectorTarget {
    index: Arc<dyn VectorStore>,
}

impl VectorTarget {
    pub fn new(index: Arc<dyn VectorStore>) -> Self {
        VectorTarget { index }
    }
}

#[async_trait]
impl SyncTarget for VectorTarget {
    fn store(&self) -> DataSource {
        DataSource::Vector
    }

    async fn apply(&self, event: &SyncEvent) -> SyncResult<ApplyOutcome> {
        if event.operation.is_delete() {
            self.index
                .delete(&scoped_id(&event.entity_type, &event.entity_id))
                .await?;
            return Ok(ApplyOutcome::Applied);
        }

        let Some(embedding) = event.embeddings() else {
            debug!(entity_id = %event.entity_id, "No embeddings, vector sync skipped");
            return Ok(ApplyOutcome::Skipped);
        };

        let mut metadata = object_data(event)?;
        metadata.remove("embeddings");
        metadata.insert("entity_type".into(), Value::String(event.entity_type.clone()));

        self.index
            .upsert(VectorRecord {
                id: scoped_id(&event.entity_type, &event.entity_id),
                embedding,
                metadata,
            })
            .await?;
        Ok(ApplyOutcome::Applied)
    }

    async fn fetch(&self, entity_type: &str, entity_id: &str) -> SyncResult<Option<Value>> {
        Ok(self
            .index
            .get(&scoped_id(entity_type, entity_id))
            .await?
            .map(|record| Value::Object(record.metadata)))
    }
}
