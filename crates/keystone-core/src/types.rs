//! # Domain Types
//!
//! Core domain types used throughout Keystone.
//!
//! ## Type Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Domain Types                                    │
//! │                                                                         │
//! │  ┌─────────────────┐   ┌─────────────────┐   ┌─────────────────┐       │
//! │  │   SyncEvent     │   │   Operation     │   │ VersionVector   │       │
//! │  │  ─────────────  │   │  ─────────────  │   │  ─────────────  │       │
//! │  │  event_id       │   │  id             │   │  cache: 3       │       │
//! │  │  source         │   │  kind           │   │  graph: 3       │       │
//! │  │  operation      │   │  entity_kind    │   │  warehouse: 2   │       │
//! │  │  version        │   │  dependencies   │   │  (→ outdated)   │       │
//! │  │  content_hash   │   │  prior_state    │   └─────────────────┘       │
//! │  └─────────────────┘   └─────────────────┘                              │
//! │                                                                         │
//! │  ┌─────────────────┐   ┌─────────────────┐   ┌─────────────────┐       │
//! │  │   DataSource    │   │   Priority      │   │ TransactionStatus│      │
//! │  │  ─────────────  │   │  ─────────────  │   │  ─────────────  │       │
//! │  │  Cache          │   │  Critical       │   │  Pending        │       │
//! │  │  Graph          │   │  High           │   │  Committed      │       │
//! │  │  Warehouse      │   │  Normal         │   │  RolledBack     │       │
//! │  │  Vector         │   │  Low            │   │  Failed         │       │
//! │  └─────────────────┘   │  Background     │   └─────────────────┘       │
//! │                        └─────────────────┘                              │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use uuid::Uuid;

use crate::error::{CoreError, CoreResult};
use crate::hashing::content_hash;

/// Default retry budget for a transaction operation.
pub const DEFAULT_OPERATION_MAX_RETRIES: u32 = 3;

// =============================================================================
// Data Source
// =============================================================================

/// One of the stores holding a copy of a logical entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataSource {
    /// Low-latency key/value cache (the shared store).
    Cache,
    /// Property-graph store, the primary durable store.
    Graph,
    /// Append-only analytical warehouse.
    Warehouse,
    /// Vector-similarity index.
    Vector,
}

impl DataSource {
    /// Every data source, in the order copies are compared.
    pub const ALL: [DataSource; 4] = [
        DataSource::Cache,
        DataSource::Graph,
        DataSource::Warehouse,
        DataSource::Vector,
    ];

    /// Returns the stable lowercase name used in keys and config files.
    pub fn as_str(&self) -> &'static str {
        match self {
            DataSource::Cache => "cache",
            DataSource::Graph => "graph",
            DataSource::Warehouse => "warehouse",
            DataSource::Vector => "vector",
        }
    }
}

impl fmt::Display for DataSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DataSource {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "cache" | "redis" => Ok(DataSource::Cache),
            "graph" | "neo4j" => Ok(DataSource::Graph),
            "warehouse" | "bigquery" => Ok(DataSource::Warehouse),
            "vector" => Ok(DataSource::Vector),
            other => Err(CoreError::UnknownDataSource(other.to_string())),
        }
    }
}

// =============================================================================
// Sync Operation
// =============================================================================

/// The kind of change carried by a [`SyncEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncOperation {
    Create,
    Update,
    Delete,
    /// Re-read from the authoritative store; applied like an upsert.
    Refresh,
}

impl SyncOperation {
    pub fn is_delete(&self) -> bool {
        matches!(self, SyncOperation::Delete)
    }
}

impl fmt::Display for SyncOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncOperation::Create => write!(f, "create"),
            SyncOperation::Update => write!(f, "update"),
            SyncOperation::Delete => write!(f, "delete"),
            SyncOperation::Refresh => write!(f, "refresh"),
        }
    }
}

impl FromStr for SyncOperation {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "create" => Ok(SyncOperation::Create),
            "update" => Ok(SyncOperation::Update),
            "delete" => Ok(SyncOperation::Delete),
            "refresh" => Ok(SyncOperation::Refresh),
            other => Err(CoreError::UnknownSyncOperation(other.to_string())),
        }
    }
}

// =============================================================================
// Priority
// =============================================================================

/// Delivery tier on the event bus. Higher tiers are always drained first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Critical,
    High,
    #[default]
    Normal,
    Low,
    Background,
}

impl Priority {
    /// All tiers in delivery order (highest first).
    pub const ALL: [Priority; 5] = [
        Priority::Critical,
        Priority::High,
        Priority::Normal,
        Priority::Low,
        Priority::Background,
    ];

    /// Position in [`Priority::ALL`]; lower means delivered sooner.
    pub fn index(&self) -> usize {
        match self {
            Priority::Critical => 0,
            Priority::High => 1,
            Priority::Normal => 2,
            Priority::Low => 3,
            Priority::Background => 4,
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Priority::Critical => write!(f, "critical"),
            Priority::High => write!(f, "high"),
            Priority::Normal => write!(f, "normal"),
            Priority::Low => write!(f, "low"),
            Priority::Background => write!(f, "background"),
        }
    }
}

impl FromStr for Priority {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "critical" | "urgent" => Ok(Priority::Critical),
            "high" => Ok(Priority::High),
            "normal" => Ok(Priority::Normal),
            "low" => Ok(Priority::Low),
            "background" => Ok(Priority::Background),
            other => Err(CoreError::UnknownPriority(other.to_string())),
        }
    }
}

// =============================================================================
// Message Status
// =============================================================================

/// Lifecycle of a message on the event bus.
///
/// ```text
/// Pending ──► Processing ──► Completed
///                 │
///                 ├──► Retry ──► (scheduled heap) ──► Pending ...
///                 │
///                 └──► Failed (after max_retries, kept as dead letter)
///
/// Pending / Retry ──► Cancelled   (admin cancel)
/// Pending ──► Expired             (TTL elapsed before delivery)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Retry,
    Cancelled,
    Expired,
}

impl MessageStatus {
    /// Returns true once the message will never be delivered again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            MessageStatus::Completed
                | MessageStatus::Failed
                | MessageStatus::Cancelled
                | MessageStatus::Expired
        )
    }
}

impl fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageStatus::Pending => write!(f, "pending"),
            MessageStatus::Processing => write!(f, "processing"),
            MessageStatus::Completed => write!(f, "completed"),
            MessageStatus::Failed => write!(f, "failed"),
            MessageStatus::Retry => write!(f, "retry"),
            MessageStatus::Cancelled => write!(f, "cancelled"),
            MessageStatus::Expired => write!(f, "expired"),
        }
    }
}

// =============================================================================
// Transaction Status
// =============================================================================

/// State machine of a transaction.
///
/// `Pending → Committed`, `Pending → RolledBack`, or `Failed` when either the
/// dependency graph is rejected or a compensation could not be applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    Pending,
    Committed,
    RolledBack,
    Failed,
}

impl TransactionStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TransactionStatus::Pending)
    }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransactionStatus::Pending => write!(f, "pending"),
            TransactionStatus::Committed => write!(f, "committed"),
            TransactionStatus::RolledBack => write!(f, "rolled_back"),
            TransactionStatus::Failed => write!(f, "failed"),
        }
    }
}

impl FromStr for TransactionStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TransactionStatus::Pending),
            "committed" => Ok(TransactionStatus::Committed),
            "rolled_back" => Ok(TransactionStatus::RolledBack),
            "failed" => Ok(TransactionStatus::Failed),
            other => Err(CoreError::UnknownStatus {
                kind: "transaction",
                value: other.to_string(),
            }),
        }
    }
}

// =============================================================================
// Operation
// =============================================================================

/// Mutation applied by a transaction operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Create,
    Update,
    Delete,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationKind::Create => write!(f, "create"),
            OperationKind::Update => write!(f, "update"),
            OperationKind::Delete => write!(f, "delete"),
        }
    }
}

/// Graph element targeted by an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Node,
    Relationship,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityKind::Node => write!(f, "node"),
            EntityKind::Relationship => write!(f, "relationship"),
        }
    }
}

/// State of the targeted element captured right before a commit applies
/// the operation. `snapshot: None` means the element did not exist.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriorState {
    pub captured_at: DateTime<Utc>,
    pub snapshot: Option<Value>,
}

/// One mutation inside a transaction.
///
/// ## Payload Shapes
/// ```text
/// create node          { "labels": [..], "properties": {..} }
/// update node          { "properties": {..}, "original_properties": {..}? }
/// create relationship  { "type": "..", "start_node_id": "..",
///                        "end_node_id": "..", "properties": {..} }
/// delete node / rel    { }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    /// Unique within its transaction.
    pub id: String,
    pub kind: OperationKind,
    pub entity_kind: EntityKind,
    /// Id of the node or relationship being mutated.
    pub entity_id: String,
    pub payload: Value,
    /// Operation ids that must be applied before this one.
    #[serde(default)]
    pub dependencies: Vec<String>,
    pub timestamp: DateTime<Utc>,
    /// Submission order inside the transaction, assigned on `add_operation`.
    #[serde(default)]
    pub sequence: u64,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default = "default_operation_max_retries")]
    pub max_retries: u32,
    #[serde(default)]
    pub prior_state: Option<PriorState>,
}

fn default_operation_max_retries() -> u32 {
    DEFAULT_OPERATION_MAX_RETRIES
}

impl Operation {
    /// Creates an operation with a generated id.
    pub fn new(
        kind: OperationKind,
        entity_kind: EntityKind,
        entity_id: impl Into<String>,
        payload: Value,
    ) -> Self {
        Operation {
            id: Uuid::new_v4().to_string(),
            kind,
            entity_kind,
            entity_id: entity_id.into(),
            payload,
            dependencies: Vec::new(),
            timestamp: Utc::now(),
            sequence: 0,
            retry_count: 0,
            max_retries: DEFAULT_OPERATION_MAX_RETRIES,
            prior_state: None,
        }
    }

    pub fn create_node(node_id: impl Into<String>, labels: &[&str], properties: Value) -> Self {
        Self::new(
            OperationKind::Create,
            EntityKind::Node,
            node_id,
            json!({ "labels": labels, "properties": properties }),
        )
    }

    pub fn update_node(node_id: impl Into<String>, properties: Value) -> Self {
        Self::new(
            OperationKind::Update,
            EntityKind::Node,
            node_id,
            json!({ "properties": properties }),
        )
    }

    pub fn delete_node(node_id: impl Into<String>) -> Self {
        Self::new(OperationKind::Delete, EntityKind::Node, node_id, json!({}))
    }

    pub fn create_relationship(
        relationship_id: impl Into<String>,
        rel_type: &str,
        start_node_id: &str,
        end_node_id: &str,
        properties: Value,
    ) -> Self {
        Self::new(
            OperationKind::Create,
            EntityKind::Relationship,
            relationship_id,
            json!({
                "type": rel_type,
                "start_node_id": start_node_id,
                "end_node_id": end_node_id,
                "properties": properties,
            }),
        )
    }

    pub fn delete_relationship(relationship_id: impl Into<String>) -> Self {
        Self::new(
            OperationKind::Delete,
            EntityKind::Relationship,
            relationship_id,
            json!({}),
        )
    }

    /// Replaces the generated id.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Adds a dependency on another operation of the same transaction.
    pub fn depends_on(mut self, operation_id: impl Into<String>) -> Self {
        self.dependencies.push(operation_id.into());
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Records the property values an update should restore on rollback.
    pub fn with_original_properties(mut self, original: Value) -> Self {
        if let Value::Object(ref mut map) = self.payload {
            map.insert("original_properties".to_string(), original);
        }
        self
    }

    /// Labels for a node operation (empty when absent).
    pub fn labels(&self) -> Vec<String> {
        self.payload
            .get("labels")
            .and_then(Value::as_array)
            .map(|labels| {
                labels
                    .iter()
                    .filter_map(|l| l.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Properties carried by the payload (empty when absent).
    pub fn properties(&self) -> Map<String, Value> {
        object_field(&self.payload, "properties").unwrap_or_default()
    }

    pub fn original_properties(&self) -> Option<Map<String, Value>> {
        object_field(&self.payload, "original_properties")
    }

    /// Returns `(type, start_node_id, end_node_id)` of a relationship operation.
    pub fn relationship_endpoints(&self) -> CoreResult<(String, String, String)> {
        let field = |name: &str| -> CoreResult<String> {
            self.payload
                .get(name)
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or_else(|| CoreError::MissingField {
                    operation_id: self.id.clone(),
                    field: name.to_string(),
                })
        };
        Ok((field("type")?, field("start_node_id")?, field("end_node_id")?))
    }

    /// Returns true while the operation still has retry budget.
    pub fn has_retry_budget(&self) -> bool {
        self.retry_count < self.max_retries
    }
}

fn object_field(value: &Value, name: &str) -> Option<Map<String, Value>> {
    value.get(name).and_then(Value::as_object).cloned()
}

// =============================================================================
// Sync Event
// =============================================================================

/// Metadata flag set on events that republish a resolved conflict.
pub const RESOLUTION_FLAG: &str = "resolution";

/// One propagatable change to one entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncEvent {
    pub event_id: String,
    pub timestamp: DateTime<Utc>,
    /// Store the change originated in.
    pub source: DataSource,
    pub operation: SyncOperation,
    pub entity_type: String,
    pub entity_id: String,
    pub data: Value,
    /// Version stamped for `(entity_id, source)` at publish time.
    pub version: u64,
    /// SHA-256 of the canonical JSON of `data`.
    pub content_hash: String,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl SyncEvent {
    pub fn new(
        source: DataSource,
        operation: SyncOperation,
        entity_type: impl Into<String>,
        entity_id: impl Into<String>,
        data: Value,
        version: u64,
    ) -> Self {
        let content_hash = content_hash(&data);
        SyncEvent {
            event_id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            source,
            operation,
            entity_type: entity_type.into(),
            entity_id: entity_id.into(),
            data,
            version,
            content_hash,
            metadata: Map::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Returns true for events republishing a resolved conflict. These are
    /// authoritative and skip stale-write detection.
    pub fn is_resolution(&self) -> bool {
        self.metadata
            .get(RESOLUTION_FLAG)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    /// Embedding vector carried in `data.embeddings`, if any.
    pub fn embeddings(&self) -> Option<Vec<f32>> {
        let values = self.data.get("embeddings")?.as_array()?;
        if values.is_empty() {
            return None;
        }
        values
            .iter()
            .map(|v| v.as_f64().map(|f| f as f32))
            .collect()
    }

    /// Cache key of the entity: `{entity_type}:{entity_id}`.
    pub fn cache_key(&self) -> String {
        format!("{}:{}", self.entity_type, self.entity_id)
    }
}

// =============================================================================
// Version Vector
// =============================================================================

/// Per-store version counters for one logical entity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct VersionVector {
    entries: BTreeMap<DataSource, u64>,
}

impl VersionVector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, source: DataSource) -> Option<u64> {
        self.entries.get(&source).copied()
    }

    pub fn set(&mut self, source: DataSource, version: u64) {
        self.entries.insert(source, version);
    }

    /// Highest version across all stores.
    pub fn latest(&self) -> Option<u64> {
        self.entries.values().copied().max()
    }

    /// Stores whose version is behind the latest, as `(store, current, latest)`.
    pub fn outdated(&self) -> Vec<(DataSource, u64, u64)> {
        let Some(latest) = self.latest() else {
            return Vec::new();
        };
        self.entries
            .iter()
            .filter(|(_, v)| **v < latest)
            .map(|(s, v)| (*s, *v, latest))
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (DataSource, u64)> + '_ {
        self.entries.iter().map(|(s, v)| (*s, *v))
    }
}

impl FromIterator<(DataSource, u64)> for VersionVector {
    fn from_iter<I: IntoIterator<Item = (DataSource, u64)>>(iter: I) -> Self {
        VersionVector {
            entries: iter.into_iter().collect(),
        }
    }
}

// =============================================================================
// Consistency Report
// =============================================================================

/// One problem found by a consistency check.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "issue", rename_all = "snake_case")]
pub enum Discrepancy {
    /// The store's version is behind the latest version of the entity.
    OutdatedVersion {
        source: DataSource,
        current_version: u64,
        latest_version: u64,
    },
    /// The store's copy hashes differently from the reference copy.
    DataMismatch {
        source: DataSource,
        reference: DataSource,
        differences: Vec<String>,
    },
}

impl Discrepancy {
    pub fn source(&self) -> DataSource {
        match self {
            Discrepancy::OutdatedVersion { source, .. } => *source,
            Discrepancy::DataMismatch { source, .. } => *source,
        }
    }
}

/// Result of comparing every available copy of an entity.
#[derive(Debug, Clone, Serialize)]
pub struct ConsistencyReport {
    pub entity_type: String,
    pub entity_id: String,
    pub is_consistent: bool,
    pub discrepancies: Vec<Discrepancy>,
    pub recommendations: Vec<String>,
    pub versions: VersionVector,
    pub checked_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_source_parsing() {
        assert_eq!("cache".parse::<DataSource>().unwrap(), DataSource::Cache);
        assert_eq!("redis".parse::<DataSource>().unwrap(), DataSource::Cache);
        assert_eq!("neo4j".parse::<DataSource>().unwrap(), DataSource::Graph);
        assert_eq!("BigQuery".parse::<DataSource>().unwrap(), DataSource::Warehouse);
        assert!("postgres".parse::<DataSource>().is_err());
    }

    #[test]
    fn test_priority_order() {
        let indices: Vec<usize> = Priority::ALL.iter().map(Priority::index).collect();
        assert_eq!(indices, vec![0, 1, 2, 3, 4]);
        assert_eq!(Priority::default(), Priority::Normal);
    }

    #[test]
    fn test_transaction_status_round_trip() {
        for status in [
            TransactionStatus::Pending,
            TransactionStatus::Committed,
            TransactionStatus::RolledBack,
            TransactionStatus::Failed,
        ] {
            assert_eq!(status.to_string().parse::<TransactionStatus>().unwrap(), status);
        }
    }

    #[test]
    fn test_relationship_endpoints() {
        let op = Operation::create_relationship("r1", "KNOWS", "a", "b", json!({}));
        let (rel_type, start, end) = op.relationship_endpoints().unwrap();
        assert_eq!(rel_type, "KNOWS");
        assert_eq!(start, "a");
        assert_eq!(end, "b");

        let broken = Operation::new(
            OperationKind::Create,
            EntityKind::Relationship,
            "r2",
            json!({ "type": "KNOWS" }),
        );
        assert!(matches!(
            broken.relationship_endpoints(),
            Err(CoreError::MissingField { .. })
        ));
    }

    #[test]
    fn test_original_properties_are_recorded() {
        let op = Operation::update_node("n1", json!({ "score": 2 }))
            .with_original_properties(json!({ "score": 1 }));
        assert_eq!(op.properties().get("score"), Some(&json!(2)));
        assert_eq!(op.original_properties().unwrap().get("score"), Some(&json!(1)));
    }

    #[test]
    fn test_event_embeddings() {
        let event = SyncEvent::new(
            DataSource::Cache,
            SyncOperation::Create,
            "knowledge",
            "k1",
            json!({ "embeddings": [0.5, 1.0] }),
            1,
        );
        assert_eq!(event.embeddings(), Some(vec![0.5, 1.0]));
        assert_eq!(event.cache_key(), "knowledge:k1");

        let plain = SyncEvent::new(
            DataSource::Cache,
            SyncOperation::Create,
            "knowledge",
            "k2",
            json!({ "title": "x" }),
            1,
        );
        assert_eq!(plain.embeddings(), None);
        assert!(!plain.is_resolution());
    }

    #[test]
    fn test_version_vector_outdated() {
        let vector: VersionVector = [
            (DataSource::Cache, 3),
            (DataSource::Graph, 3),
            (DataSource::Warehouse, 2),
        ]
        .into_iter()
        .collect();

        assert_eq!(vector.latest(), Some(3));
        assert_eq!(vector.outdated(), vec![(DataSource::Warehouse, 2, 3)]);
        assert!(VersionVector::new().outdated().is_empty());
    }
}
