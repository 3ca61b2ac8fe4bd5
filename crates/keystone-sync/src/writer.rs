//! # Transactional Writer
//!
//! Groups graph operations into transactions, validates their dependency
//! graph, and applies them under resource locks in one native graph
//! transaction.
//!
//! ## Commit Flow
//! ```text
//! begin(tx) ──► add_operation(tx, op)* ──► commit(tx)
//!                                            │
//!                                            ├─ 1. load ops, oldest first
//!                                            ├─ 2. DAG check ─► cycle / unknown id ─► FAILED
//!                                            ├─ 3. lock every entity id
//!                                            ├─ 4. snapshot prior state
//!                                            ├─ 5. one graph transaction
//!                                            │      ok   ─► COMMITTED, records cleared
//!                                            │      fail ─► compensate ─► ROLLED_BACK
//!                                            │                 └─► requeue ops with budget
//!                                            └─ 6. release locks
//! ```
//!
//! ## Key Layout
//! ```text
//! transaction:{tx}        hash: status, started_at, operations_count, retry_count
//! operation:{tx}:{op}     hash: id, kind, entity_kind, entity_id, sequence, data
//! retry:transaction:{..}  requeued operations (see retry.rs)
//! ```

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use keystone_core::dag;
use keystone_core::{EntityKind, Operation, OperationKind, PriorState, TransactionStatus};
use keystone_store::{GraphMutation, GraphStore, KeyValueStore, Node, Relationship};

use crate::config::TransactionSettings;
use crate::dead_letter::DeadLetterQueue;
use crate::error::{SyncError, SyncResult};
use crate::lock::LockService;
use crate::retry::{RetryItem, RetryOutcome, RetryPolicy, RetryQueue, RetryReport};

fn transaction_key(transaction_id: &str) -> String {
    format!("transaction:{}", transaction_id)
}

fn operation_key(transaction_id: &str, operation_id: &str) -> String {
    format!("operation:{}:{}", transaction_id, operation_id)
}

/// Status view of one transaction.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransactionInfo {
    pub transaction_id: String,
    pub status: TransactionStatus,
    pub operations_count: u64,
    pub retry_count: u64,
    pub started_at: Option<DateTime<Utc>>,
}

// =============================================================================
// Writer
// =============================================================================

/// Dependency-validated, rollback-capable writer over the graph store.
/// Cheap to clone.
#[derive(Clone)]
pub struct TransactionalWriter {
    inner: Arc<WriterInner>,
}

struct WriterInner {
    settings: TransactionSettings,
    store: Arc<dyn KeyValueStore>,
    graph: Arc<dyn GraphStore>,
    locks: LockService,
    retries: RetryQueue,
    /// Transactions begun here and not yet terminal.
    active: Mutex<HashSet<String>>,
}

impl TransactionalWriter {
    pub fn new(
        settings: TransactionSettings,
        store: Arc<dyn KeyValueStore>,
        graph: Arc<dyn GraphStore>,
        locks: LockService,
        dead_letters: DeadLetterQueue,
    ) -> Self {
        let retries = RetryQueue::for_transactions(
            store.clone(),
            RetryPolicy::for_transactions(
                Duration::from_secs(settings.max_retry_delay_seconds),
                settings.max_retries,
            ),
            settings.ttl(),
            dead_letters,
        );

        TransactionalWriter {
            inner: Arc::new(WriterInner {
                settings,
                store,
                graph,
                locks,
                retries,
                active: Mutex::new(HashSet::new()),
            }),
        }
    }

    pub fn retry_queue(&self) -> &RetryQueue {
        &self.inner.retries
    }

    // =========================================================================
    // Building a Transaction
    // =========================================================================

    /// Opens a transaction. Ids must be unique while the record lives.
    pub async fn begin(&self, transaction_id: &str) -> SyncResult<()> {
        let key = transaction_key(transaction_id);
        if self.inner.store.exists(&key).await? {
            return Err(SyncError::InvalidOperation(format!(
                "Transaction {} already exists",
                transaction_id
            )));
        }

        let fields = vec![
            ("status".to_string(), TransactionStatus::Pending.to_string()),
            ("started_at".to_string(), Utc::now().to_rfc3339()),
            ("operations_count".to_string(), "0".to_string()),
            ("retry_count".to_string(), "0".to_string()),
        ];
        self.inner.store.hset(&key, &fields).await?;
        self.inner.store.expire(&key, self.inner.settings.ttl()).await?;
        self.inner
            .active
            .lock()
            .await
            .insert(transaction_id.to_string());

        info!(transaction_id = %transaction_id, "Transaction started");
        Ok(())
    }

    /// Adds `operation` to a pending transaction and returns its id.
    pub async fn add_operation(
        &self,
        transaction_id: &str,
        mut operation: Operation,
    ) -> SyncResult<String> {
        self.expect_status(transaction_id, TransactionStatus::Pending)
            .await?;
        check_operation(&operation)?;

        let op_key = operation_key(transaction_id, &operation.id);
        if self.inner.store.exists(&op_key).await? {
            return Err(SyncError::InvalidOperation(format!(
                "Operation {} already added to transaction {}",
                operation.id, transaction_id
            )));
        }

        let sequence = self
            .inner
            .store
            .hincr_by(&transaction_key(transaction_id), "operations_count", 1)
            .await?;
        operation.sequence = sequence as u64;
        operation.max_retries = operation.max_retries.min(self.inner.settings.max_retries);

        self.write_operation(transaction_id, &operation).await?;

        debug!(
            transaction_id = %transaction_id,
            operation_id = %operation.id,
            kind = %operation.kind,
            entity_kind = %operation.entity_kind,
            entity_id = %operation.entity_id,
            "Operation added"
        );
        Ok(operation.id)
    }

    async fn write_operation(&self, transaction_id: &str, operation: &Operation) -> SyncResult<()> {
        let key = operation_key(transaction_id, &operation.id);
        let fields = vec![
            ("id".to_string(), operation.id.clone()),
            ("kind".to_string(), operation.kind.to_string()),
            ("entity_kind".to_string(), operation.entity_kind.to_string()),
            ("entity_id".to_string(), operation.entity_id.clone()),
            ("sequence".to_string(), operation.sequence.to_string()),
            ("data".to_string(), serde_json::to_string(operation)?),
        ];
        self.inner.store.hset(&key, &fields).await?;
        self.inner.store.expire(&key, self.inner.settings.ttl()).await?;
        Ok(())
    }

    /// Operations of a transaction in submission order.
    async fn load_operations(&self, transaction_id: &str) -> SyncResult<Vec<Operation>> {
        let pattern = operation_key(transaction_id, "*");
        let mut operations = Vec::new();
        for key in self.inner.store.scan_keys(&pattern).await? {
            let Some(data) = self.inner.store.hget(&key, "data").await? else {
                continue;
            };
            operations.push(serde_json::from_str::<Operation>(&data)?);
        }
        operations.sort_by(|a, b| {
            a.timestamp
                .cmp(&b.timestamp)
                .then_with(|| a.sequence.cmp(&b.sequence))
        });
        Ok(operations)
    }

    async fn clear_operations(&self, transaction_id: &str) -> SyncResult<u64> {
        let keys = self
            .inner
            .store
            .scan_keys(&operation_key(transaction_id, "*"))
            .await?;
        if keys.is_empty() {
            return Ok(0);
        }
        Ok(self.inner.store.delete(&keys).await?)
    }

    // =========================================================================
    // Status
    // =========================================================================

    pub async fn get_status(&self, transaction_id: &str) -> SyncResult<TransactionInfo> {
        let fields = self
            .inner
            .store
            .hget_all(&transaction_key(transaction_id))
            .await?;
        if fields.is_empty() {
            return Err(SyncError::TransactionNotFound(transaction_id.to_string()));
        }

        let number = |name: &str| {
            fields
                .get(name)
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(0)
        };
        let status = fields
            .get("status")
            .map(|s| s.parse::<TransactionStatus>())
            .transpose()?
            .unwrap_or(TransactionStatus::Pending);
        let started_at = fields
            .get("started_at")
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|t| t.with_timezone(&Utc));

        Ok(TransactionInfo {
            transaction_id: transaction_id.to_string(),
            status,
            operations_count: number("operations_count"),
            retry_count: number("retry_count"),
            started_at,
        })
    }

    async fn expect_status(
        &self,
        transaction_id: &str,
        expected: TransactionStatus,
    ) -> SyncResult<TransactionInfo> {
        let info = self.get_status(transaction_id).await?;
        if info.status != expected {
            return Err(SyncError::InvalidTransactionState {
                transaction_id: transaction_id.to_string(),
                status: info.status,
            });
        }
        Ok(info)
    }

    async fn set_status(&self, transaction_id: &str, status: TransactionStatus) -> SyncResult<()> {
        self.inner
            .store
            .hset(
                &transaction_key(transaction_id),
                &[("status".to_string(), status.to_string())],
            )
            .await?;
        if status.is_terminal() {
            self.inner.active.lock().await.remove(transaction_id);
        }
        Ok(())
    }

    // =========================================================================
    // Commit
    // =========================================================================

    /// Validates and applies every operation of the transaction at once.
    ///
    /// Dependency errors mark the transaction FAILED before anything is
    /// touched. A failed graph write rolls back and requeues the operations
    /// that still have retry budget; the write error is returned.
    pub async fn commit(&self, transaction_id: &str) -> SyncResult<()> {
        self.expect_status(transaction_id, TransactionStatus::Pending)
            .await?;
        let operations = self.load_operations(transaction_id).await?;

        if operations.is_empty() {
            self.set_status(transaction_id, TransactionStatus::Committed)
                .await?;
            info!(transaction_id = %transaction_id, "Empty transaction committed");
            return Ok(());
        }

        let ordered: Vec<Operation> = match dag::execution_order(&operations) {
            Ok(order) => order.into_iter().cloned().collect(),
            Err(e) => {
                let err = SyncError::dependency(transaction_id, e);
                warn!(
                    transaction_id = %transaction_id,
                    error_kind = %err.kind(),
                    "{}",
                    err
                );
                self.set_status(transaction_id, TransactionStatus::Failed)
                    .await?;
                return Err(err);
            }
        };

        let resources = lock_resources(&ordered);
        self.lock_all(transaction_id, &resources).await?;

        let result = self.apply(transaction_id, ordered).await;
        self.unlock_all(transaction_id, &resources).await;
        result
    }

    async fn apply(&self, transaction_id: &str, mut ordered: Vec<Operation>) -> SyncResult<()> {
        for operation in ordered.iter_mut() {
            operation.prior_state = Some(self.capture(operation).await?);
            self.write_operation(transaction_id, operation).await?;
        }

        let mutations = ordered
            .iter()
            .map(mutation_for)
            .collect::<SyncResult<Vec<_>>>()?;

        match self.inner.graph.execute(mutations).await {
            Ok(()) => {
                self.set_status(transaction_id, TransactionStatus::Committed)
                    .await?;
                self.clear_operations(transaction_id).await?;
                info!(
                    transaction_id = %transaction_id,
                    operations = ordered.len(),
                    "Transaction committed"
                );
                Ok(())
            }
            Err(e) => {
                let err = SyncError::from(e);
                warn!(
                    transaction_id = %transaction_id,
                    error_kind = %err.kind(),
                    ?err,
                    "Transaction failed, rolling back"
                );
                self.roll_back(transaction_id, &ordered, Some(&err.to_string()))
                    .await?;
                Err(err)
            }
        }
    }

    async fn capture(&self, operation: &Operation) -> SyncResult<PriorState> {
        let snapshot = match operation.entity_kind {
            EntityKind::Node => self
                .inner
                .graph
                .get_node(&operation.entity_id)
                .await?
                .map(serde_json::to_value)
                .transpose()?,
            EntityKind::Relationship => self
                .inner
                .graph
                .get_relationship(&operation.entity_id)
                .await?
                .map(serde_json::to_value)
                .transpose()?,
        };
        Ok(PriorState {
            captured_at: Utc::now(),
            snapshot,
        })
    }

    async fn lock_all(&self, transaction_id: &str, resources: &[String]) -> SyncResult<()> {
        let started = tokio::time::Instant::now();
        for (i, resource) in resources.iter().enumerate() {
            let acquired = match self
                .inner
                .locks
                .acquire(resource, transaction_id, None, true)
                .await
            {
                Ok(acquired) => acquired,
                Err(e) => {
                    self.unlock_all(transaction_id, &resources[..i]).await;
                    return Err(e);
                }
            };
            if !acquired {
                self.unlock_all(transaction_id, &resources[..i]).await;
                return Err(SyncError::LockTimeout {
                    resource_id: resource.clone(),
                    waited_ms: started.elapsed().as_millis() as u64,
                });
            }
        }
        Ok(())
    }

    async fn unlock_all(&self, transaction_id: &str, resources: &[String]) {
        for resource in resources {
            if let Err(e) = self.inner.locks.release(resource, transaction_id).await {
                error!(
                    transaction_id = %transaction_id,
                    resource_id = %resource,
                    error_kind = %e.kind(),
                    ?e,
                    "Failed to release lock"
                );
            }
        }
    }

    // =========================================================================
    // Rollback
    // =========================================================================

    /// Rolls back a pending transaction. Operations are not requeued.
    pub async fn rollback(&self, transaction_id: &str) -> SyncResult<()> {
        self.expect_status(transaction_id, TransactionStatus::Pending)
            .await?;
        let operations = self.load_operations(transaction_id).await?;
        self.roll_back(transaction_id, &operations, None).await
    }

    /// Compensates `applied` in reverse order and marks the transaction
    /// ROLLED_BACK. With `failure` set, the operations are requeued.
    async fn roll_back(
        &self,
        transaction_id: &str,
        applied: &[Operation],
        failure: Option<&str>,
    ) -> SyncResult<()> {
        let mut compensations = Vec::new();
        for operation in applied.iter().rev() {
            if let Some(mutation) = self.compensation(operation).await? {
                compensations.push(mutation);
            }
        }

        if !compensations.is_empty() {
            if let Err(e) = self.inner.graph.execute(compensations).await {
                let err = SyncError::TransactionRollbackFailed {
                    transaction_id: transaction_id.to_string(),
                    operations: applied.iter().map(|op| op.id.clone()).collect(),
                    reason: e.to_string(),
                };
                error!(
                    transaction_id = %transaction_id,
                    error_kind = %err.kind(),
                    operations = ?applied,
                    "{}",
                    err
                );
                self.set_status(transaction_id, TransactionStatus::Failed)
                    .await?;
                return Err(err);
            }
        }

        self.set_status(transaction_id, TransactionStatus::RolledBack)
            .await?;

        if let Some(reason) = failure {
            self.inner
                .store
                .hincr_by(&transaction_key(transaction_id), "retry_count", 1)
                .await?;
            for operation in applied {
                self.requeue(transaction_id, operation.clone(), reason)
                    .await?;
            }
        }

        info!(
            transaction_id = %transaction_id,
            operations = applied.len(),
            requeued = failure.is_some(),
            "Transaction rolled back"
        );
        Ok(())
    }

    /// The inverse of an applied operation. Only operations whose prior state
    /// was captured at commit are compensated.
    async fn compensation(&self, operation: &Operation) -> SyncResult<Option<GraphMutation>> {
        let Some(prior) = &operation.prior_state else {
            return Ok(None);
        };

        let mutation = match (operation.kind, operation.entity_kind, &prior.snapshot) {
            (OperationKind::Create, EntityKind::Node, None) => Some(GraphMutation::DeleteNode {
                id: operation.entity_id.clone(),
            }),
            (OperationKind::Create, EntityKind::Relationship, None) => {
                Some(GraphMutation::DeleteRelationship {
                    id: operation.entity_id.clone(),
                })
            }
            (OperationKind::Update, EntityKind::Node, Some(snapshot)) => {
                let node: Node = serde_json::from_value(snapshot.clone())?;
                match operation.original_properties() {
                    Some(original) => Some(GraphMutation::UpdateNode {
                        id: node.id,
                        properties: original,
                    }),
                    None => Some(GraphMutation::MergeNode {
                        id: node.id,
                        labels: node.labels,
                        properties: node.properties,
                    }),
                }
            }
            (OperationKind::Delete, EntityKind::Node, Some(snapshot)) => {
                let node: Node = serde_json::from_value(snapshot.clone())?;
                Some(GraphMutation::MergeNode {
                    id: node.id,
                    labels: node.labels,
                    properties: node.properties,
                })
            }
            (OperationKind::Delete, EntityKind::Relationship, Some(snapshot)) => {
                let rel: Relationship = serde_json::from_value(snapshot.clone())?;
                if self.inner.graph.get_relationship(&rel.id).await?.is_some() {
                    None
                } else {
                    Some(GraphMutation::CreateRelationship {
                        id: rel.id,
                        rel_type: rel.rel_type,
                        start_node_id: rel.start_node_id,
                        end_node_id: rel.end_node_id,
                        properties: rel.properties,
                    })
                }
            }
            _ => None,
        };
        Ok(mutation)
    }

    async fn requeue(
        &self,
        transaction_id: &str,
        operation: Operation,
        reason: &str,
    ) -> SyncResult<RetryOutcome> {
        let item = RetryItem::Operation {
            transaction_id: transaction_id.to_string(),
            operation,
        };
        self.inner.retries.schedule(item, reason).await
    }

    // =========================================================================
    // Retries & Cleanup
    // =========================================================================

    /// Replays due requeued operations one at a time.
    pub async fn retry_failed_operations(&self) -> SyncResult<RetryReport> {
        self.retry_failed_operations_at(Utc::now()).await
    }

    pub async fn retry_failed_operations_at(&self, now: DateTime<Utc>) -> SyncResult<RetryReport> {
        let mut due: Vec<(String, Operation)> = self
            .inner
            .retries
            .due(now)
            .await?
            .into_iter()
            .filter_map(|record| match record.item {
                RetryItem::Operation {
                    transaction_id,
                    operation,
                } => Some((transaction_id, operation)),
                RetryItem::SyncEvent { .. } => None,
            })
            .collect();
        due.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.sequence.cmp(&b.1.sequence)));

        let mut report = RetryReport::default();
        for (transaction_id, operation) in due {
            report.attempted += 1;
            match self.replay(&transaction_id, &operation).await {
                Ok(()) => {
                    self.inner
                        .retries
                        .complete(&RetryItem::Operation {
                            transaction_id,
                            operation,
                        })
                        .await?;
                    report.succeeded += 1;
                }
                Err(e) => {
                    debug!(operation_id = %operation.id, error_kind = %e.kind(), "Operation retry failed");
                    match self
                        .requeue(&transaction_id, operation, &e.to_string())
                        .await?
                    {
                        RetryOutcome::Scheduled { .. } => report.rescheduled += 1,
                        RetryOutcome::DeadLettered { .. } => report.dead_lettered += 1,
                    }
                }
            }
        }

        if report.attempted > 0 {
            info!(
                attempted = report.attempted,
                succeeded = report.succeeded,
                rescheduled = report.rescheduled,
                dead_lettered = report.dead_lettered,
                "Processed transaction retry queue"
            );
        }
        Ok(report)
    }

    async fn replay(&self, transaction_id: &str, operation: &Operation) -> SyncResult<()> {
        let holder = format!("retry:{}", transaction_id);
        let resources = lock_resources(std::slice::from_ref(operation));
        for (i, resource) in resources.iter().enumerate() {
            if !self
                .inner
                .locks
                .acquire(resource, &holder, None, false)
                .await?
            {
                self.unlock_all(&holder, &resources[..i]).await;
                return Err(SyncError::LockTimeout {
                    resource_id: resource.clone(),
                    waited_ms: 0,
                });
            }
        }

        let result = match mutation_for(operation) {
            Ok(mutation) => self
                .inner
                .graph
                .execute(vec![mutation])
                .await
                .map_err(SyncError::from),
            Err(e) => Err(e),
        };
        self.unlock_all(&holder, &resources).await;
        result
    }

    /// Rolls back pending transactions older than the record TTL and drops
    /// operation records whose transaction is gone. Returns how many
    /// transactions were cleaned.
    pub async fn cleanup_expired_transactions(&self) -> SyncResult<usize> {
        self.cleanup_expired_transactions_at(Utc::now()).await
    }

    pub async fn cleanup_expired_transactions_at(&self, now: DateTime<Utc>) -> SyncResult<usize> {
        let ttl = chrono::Duration::seconds(self.inner.settings.ttl_seconds as i64);
        let mut cleaned = 0;

        for key in self.inner.store.scan_keys("transaction:*").await? {
            let Some(transaction_id) = key.strip_prefix("transaction:") else {
                continue;
            };
            let info = match self.get_status(transaction_id).await {
                Ok(info) => info,
                Err(SyncError::TransactionNotFound(_)) => continue,
                Err(e) => return Err(e),
            };
            let expired = info.started_at.is_some_and(|at| at + ttl <= now);
            if !expired {
                continue;
            }

            if info.status == TransactionStatus::Pending {
                warn!(transaction_id = %transaction_id, "Rolling back expired transaction");
                let operations = self.load_operations(transaction_id).await?;
                self.roll_back(transaction_id, &operations, None).await?;
            }
            self.clear_operations(transaction_id).await?;
            self.inner.store.delete(&[key.clone()]).await?;
            self.inner.active.lock().await.remove(transaction_id);
            cleaned += 1;
        }

        for key in self.inner.store.scan_keys("operation:*").await? {
            let orphaned = match key.split(':').nth(1) {
                Some(transaction_id) => !self
                    .inner
                    .store
                    .exists(&transaction_key(transaction_id))
                    .await?,
                None => true,
            };
            if orphaned {
                self.inner.store.delete(&[key]).await?;
            }
        }

        if cleaned > 0 {
            info!(cleaned, "Cleaned up expired transactions");
        }
        Ok(cleaned)
    }

    /// Rolls back every transaction this writer still has open.
    pub async fn shutdown(&self) -> SyncResult<usize> {
        let active: Vec<String> = self.inner.active.lock().await.drain().collect();
        let mut rolled_back = 0;

        for transaction_id in active {
            match self.rollback(&transaction_id).await {
                Ok(()) => rolled_back += 1,
                Err(SyncError::TransactionNotFound(_))
                | Err(SyncError::InvalidTransactionState { .. }) => {}
                Err(e) => {
                    error!(transaction_id = %transaction_id, error_kind = %e.kind(), ?e, "Rollback on shutdown failed");
                }
            }
            self.inner.locks.release_all(&transaction_id).await?;
        }

        info!(rolled_back, "Transactional writer stopped");
        Ok(rolled_back)
    }
}

// =============================================================================
// Operation Helpers
// =============================================================================

/// Rejects payloads the graph cannot apply.
fn check_operation(operation: &Operation) -> SyncResult<()> {
    match (operation.kind, operation.entity_kind) {
        (OperationKind::Create, EntityKind::Relationship) => {
            operation.relationship_endpoints()?;
            Ok(())
        }
        (OperationKind::Update, EntityKind::Relationship) => Err(SyncError::InvalidOperation(
            format!("Operation {}: relationships cannot be updated", operation.id),
        )),
        _ => Ok(()),
    }
}

fn mutation_for(operation: &Operation) -> SyncResult<GraphMutation> {
    let id = operation.entity_id.clone();
    let mutation = match (operation.kind, operation.entity_kind) {
        (OperationKind::Create, EntityKind::Node) => GraphMutation::CreateNode {
            id,
            labels: operation.labels(),
            properties: operation.properties(),
        },
        (OperationKind::Update, EntityKind::Node) => GraphMutation::UpdateNode {
            id,
            properties: operation.properties(),
        },
        (OperationKind::Delete, EntityKind::Node) => GraphMutation::DeleteNode { id },
        (OperationKind::Create, EntityKind::Relationship) => {
            let (rel_type, start_node_id, end_node_id) = operation.relationship_endpoints()?;
            GraphMutation::CreateRelationship {
                id,
                rel_type,
                start_node_id,
                end_node_id,
                properties: operation.properties(),
            }
        }
        (OperationKind::Delete, EntityKind::Relationship) => {
            GraphMutation::DeleteRelationship { id }
        }
        (OperationKind::Update, EntityKind::Relationship) => {
            return Err(SyncError::InvalidOperation(format!(
                "Operation {}: relationships cannot be updated",
                operation.id
            )))
        }
    };
    Ok(mutation)
}

/// Sorted, deduplicated entity ids touched by `operations`.
fn lock_resources(operations: &[Operation]) -> Vec<String> {
    let mut resources: Vec<String> = operations
        .iter()
        .map(|op| op.entity_id.clone())
        .collect();
    resources.sort();
    resources.dedup();
    resources
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LockSettings;
    use crate::error::ErrorKind;
    use keystone_store::{MemoryGraph, MemoryStore};
    use serde_json::json;

    struct Harness {
        writer: TransactionalWriter,
        graph: Arc<MemoryGraph>,
        locks: LockService,
        dead_letters: DeadLetterQueue,
    }

    fn harness() -> Harness {
        let store = Arc::new(MemoryStore::new());
        let graph = Arc::new(MemoryGraph::new());
        let locks = LockService::new(store.clone(), LockSettings::default());
        let dead_letters = DeadLetterQueue::new(store.clone());
        let writer = TransactionalWriter::new(
            TransactionSettings::default(),
            store,
            graph.clone(),
            locks.clone(),
            dead_letters.clone(),
        );
        Harness {
            writer,
            graph,
            locks,
            dead_letters,
        }
    }

    #[tokio::test]
    async fn test_commit_applies_in_dependency_order() {
        let h = harness();
        h.writer.begin("tx1").await.unwrap();

        h.writer
            .add_operation(
                "tx1",
                Operation::create_relationship("r1", "KNOWS", "a", "b", json!({}))
                    .with_id("rel")
                    .depends_on("node-b")
                    .depends_on("node-a"),
            )
            .await
            .unwrap();
        h.writer
            .add_operation(
                "tx1",
                Operation::create_node("b", &["Agent"], json!({ "name": "b" })).with_id("node-b"),
            )
            .await
            .unwrap();
        h.writer
            .add_operation(
                "tx1",
                Operation::create_node("a", &["Agent"], json!({ "name": "a" })).with_id("node-a"),
            )
            .await
            .unwrap();

        assert_eq!(h.writer.get_status("tx1").await.unwrap().operations_count, 3);
        h.writer.commit("tx1").await.unwrap();

        let info = h.writer.get_status("tx1").await.unwrap();
        assert_eq!(info.status, TransactionStatus::Committed);
        assert!(h.graph.get_relationship("r1").await.unwrap().is_some());
        assert_eq!(h.graph.node_count().await, 2);
        assert!(!h.locks.is_locked("a").await.unwrap());
        assert!(h.writer.load_operations("tx1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failed_commit_leaves_no_partial_effects() {
        let h = harness();
        h.writer.begin("tx1").await.unwrap();
        h.writer
            .add_operation("tx1", Operation::create_node("A", &["Task"], json!({})).with_id("op-a"))
            .await
            .unwrap();
        h.writer
            .add_operation(
                "tx1",
                Operation::create_relationship("r1", "NEEDS", "A", "B", json!({}))
                    .with_id("op-r")
                    .depends_on("op-a"),
            )
            .await
            .unwrap();

        let err = h.writer.commit("tx1").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Store);

        assert!(h.graph.get_node("A").await.unwrap().is_none());
        let info = h.writer.get_status("tx1").await.unwrap();
        assert_eq!(info.status, TransactionStatus::RolledBack);
        assert_eq!(info.retry_count, 1);
        assert_eq!(h.writer.retry_queue().len().await.unwrap(), 2);
        assert!(!h.locks.is_locked("A").await.unwrap());
    }

    #[tokio::test]
    async fn test_cycle_is_rejected_before_any_write() {
        let h = harness();
        h.writer.begin("tx1").await.unwrap();
        h.writer
            .add_operation(
                "tx1",
                Operation::create_node("a", &[], json!({})).with_id("a").depends_on("b"),
            )
            .await
            .unwrap();
        h.writer
            .add_operation(
                "tx1",
                Operation::create_node("b", &[], json!({})).with_id("b").depends_on("a"),
            )
            .await
            .unwrap();

        let err = h.writer.commit("tx1").await.unwrap_err();
        assert!(matches!(err, SyncError::DependencyCycle { .. }));
        assert!(err.is_structural());
        assert_eq!(h.graph.node_count().await, 0);
        assert_eq!(
            h.writer.get_status("tx1").await.unwrap().status,
            TransactionStatus::Failed
        );
    }

    #[tokio::test]
    async fn test_unknown_dependency_even_if_committed_elsewhere() {
        let h = harness();
        h.writer.begin("tx1").await.unwrap();
        h.writer
            .add_operation("tx1", Operation::create_node("a", &[], json!({})).with_id("op-a"))
            .await
            .unwrap();
        h.writer.commit("tx1").await.unwrap();

        h.writer.begin("tx2").await.unwrap();
        h.writer
            .add_operation(
                "tx2",
                Operation::create_node("b", &[], json!({})).with_id("op-b").depends_on("op-a"),
            )
            .await
            .unwrap();

        match h.writer.commit("tx2").await.unwrap_err() {
            SyncError::UnknownDependency {
                transaction_id,
                operation_id,
                dependency_id,
            } => {
                assert_eq!(transaction_id, "tx2");
                assert_eq!(operation_id, "op-b");
                assert_eq!(dependency_id, "op-a");
            }
            other => panic!("unexpected error {:?}", other),
        }
        assert!(h.graph.get_node("b").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_compensation_restores_prior_state() {
        let h = harness();
        h.graph
            .execute(vec![
                GraphMutation::CreateNode {
                    id: "keep".into(),
                    labels: vec!["Agent".into()],
                    properties: json!({ "score": 1 }).as_object().cloned().unwrap(),
                },
                GraphMutation::CreateNode {
                    id: "gone".into(),
                    labels: vec!["Agent".into()],
                    properties: json!({ "name": "gone" }).as_object().cloned().unwrap(),
                },
            ])
            .await
            .unwrap();

        let mut operations = vec![
            Operation::create_node("new", &["Agent"], json!({})),
            Operation::update_node("keep", json!({ "score": 2 })),
            Operation::delete_node("gone"),
        ];
        for op in operations.iter_mut() {
            op.prior_state = Some(h.writer.capture(op).await.unwrap());
        }
        let applied: Vec<GraphMutation> = operations.iter().map(|op| mutation_for(op).unwrap()).collect();
        h.graph.execute(applied).await.unwrap();
        assert!(h.graph.get_node("gone").await.unwrap().is_none());

        h.writer.begin("tx1").await.unwrap();
        h.writer.roll_back("tx1", &operations, None).await.unwrap();

        assert!(h.graph.get_node("new").await.unwrap().is_none());
        let keep = h.graph.get_node("keep").await.unwrap().unwrap();
        assert_eq!(keep.properties["score"], 1);
        let gone = h.graph.get_node("gone").await.unwrap().unwrap();
        assert_eq!(gone.properties["name"], "gone");
        assert_eq!(
            h.writer.get_status("tx1").await.unwrap().status,
            TransactionStatus::RolledBack
        );
        assert_eq!(h.writer.retry_queue().len().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_requeued_operation_dead_letters_when_budget_spent() {
        let h = harness();
        h.writer.begin("tx1").await.unwrap();
        h.writer
            .add_operation(
                "tx1",
                Operation::create_relationship("r1", "NEEDS", "x", "y", json!({}))
                    .with_id("op-r")
                    .with_max_retries(1),
            )
            .await
            .unwrap();
        assert!(h.writer.commit("tx1").await.is_err());

        let later = Utc::now() + chrono::Duration::hours(1);
        let report = h.writer.retry_failed_operations_at(later).await.unwrap();
        assert_eq!(report.attempted, 1);
        assert_eq!(report.dead_lettered, 1);
        assert_eq!(h.writer.retry_queue().len().await.unwrap(), 0);

        let letters = h.dead_letters.find_by_reference("op-r").await.unwrap();
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].attempts, 1);
    }

    #[tokio::test]
    async fn test_retry_succeeds_once_dependency_exists() {
        let h = harness();
        h.writer.begin("tx1").await.unwrap();
        h.writer
            .add_operation(
                "tx1",
                Operation::create_relationship("r1", "NEEDS", "x", "y", json!({})).with_id("op-r"),
            )
            .await
            .unwrap();
        assert!(h.writer.commit("tx1").await.is_err());

        for id in ["x", "y"] {
            h.graph
                .execute(vec![GraphMutation::CreateNode {
                    id: id.into(),
                    labels: vec![],
                    properties: Default::default(),
                }])
                .await
                .unwrap();
        }

        let later = Utc::now() + chrono::Duration::hours(1);
        let report = h.writer.retry_failed_operations_at(later).await.unwrap();
        assert_eq!(report.succeeded, 1);
        assert!(h.graph.get_relationship("r1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_state_checks() {
        let h = harness();
        assert!(matches!(
            h.writer.get_status("missing").await,
            Err(SyncError::TransactionNotFound(_))
        ));

        h.writer.begin("tx1").await.unwrap();
        assert!(h.writer.begin("tx1").await.is_err());
        assert!(matches!(
            h.writer
                .add_operation(
                    "tx1",
                    Operation::new(OperationKind::Update, EntityKind::Relationship, "r", json!({})),
                )
                .await,
            Err(SyncError::InvalidOperation(_))
        ));

        h.writer.commit("tx1").await.unwrap();
        assert_eq!(
            h.writer.get_status("tx1").await.unwrap().status,
            TransactionStatus::Committed
        );
        assert!(matches!(
            h.writer.rollback("tx1").await,
            Err(SyncError::InvalidTransactionState { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_commit_times_out_on_held_resource() {
        let h = harness();
        assert!(h
            .locks
            .acquire("a", "someone-else", Some(Duration::from_secs(600)), false)
            .await
            .unwrap());

        h.writer.begin("tx1").await.unwrap();
        h.writer
            .add_operation("tx1", Operation::create_node("a", &[], json!({})))
            .await
            .unwrap();

        let err = h.writer.commit("tx1").await.unwrap_err();
        assert!(matches!(err, SyncError::LockTimeout { .. }));
        assert!(err.is_retryable());
        assert_eq!(
            h.writer.get_status("tx1").await.unwrap().status,
            TransactionStatus::Pending
        );
        assert_eq!(h.graph.node_count().await, 0);
    }

    #[tokio::test]
    async fn test_cleanup_and_shutdown() {
        let h = harness();
        h.writer.begin("old").await.unwrap();
        h.writer
            .add_operation("old", Operation::create_node("n", &[], json!({})))
            .await
            .unwrap();
        h.writer.begin("open").await.unwrap();

        let later = Utc::now() + chrono::Duration::hours(2);
        assert_eq!(h.writer.cleanup_expired_transactions_at(later).await.unwrap(), 2);
        assert!(matches!(
            h.writer.get_status("old").await,
            Err(SyncError::TransactionNotFound(_))
        ));

        h.writer.begin("fresh").await.unwrap();
        assert_eq!(h.writer.cleanup_expired_transactions().await.unwrap(), 0);
        assert_eq!(h.writer.shutdown().await.unwrap(), 1);
        assert_eq!(
            h.writer.get_status("fresh").await.unwrap().status,
            TransactionStatus::RolledBack
        );
    }
}
