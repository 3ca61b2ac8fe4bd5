//! # Consistency Coordinator
//!
//! Fans change events out to the stores that hold copies of an entity,
//! tracks per-store versions, and routes diverging copies to the resolver.
//!
//! ## Sync Flow
//! ```text
//! publish_change(source, op, type, id, data)
//!   │  stamp version[source] (reused when the content hash is unchanged)
//!   ▼
//! EventBus topic "data_sync"
//!   │
//!   ▼
//! process_event ── manual hold on entity? ──► skip until an operator resolves
//!   │
//!   └── for target in routing[type][source]
//!         │
//!         ├── same hash, version ≥ event  ──► already applied
//!         ├── target newer and different  ──► conflict ──► resolver
//!         ├── apply ok                    ──► version[target], hash[target]
//!         └── apply failed                ──► retry:{target}:{type}:{id}
//! ```
//!
//! ## Key Layout
//! ```text
//! version:{type}:{id}         hash store → version
//! content_hash:{type}:{id}    hash store → last applied content hash
//! conflict:{id}               JSON ConflictRecord
//! conflict:hold:{type}:{id}   id of the manual conflict blocking the entity
//! conflicts:manual            set of pending manual conflict ids
//! ```
//!
//! The sync path takes no locks; it relies on version stamps and on
//! targets being idempotent.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use keystone_core::resolver::{has_conflict, resolve};
use keystone_core::{
    content_hash, find_differences, AuthoritativeSources, ConflictCopy, ConflictRecord,
    ConflictStatus, ConflictStrategy, ConsistencyReport, DataSource, Discrepancy, Resolution,
    RoutingTable, SyncEvent, SyncOperation, VersionVector, RESOLUTION_FLAG,
};
use keystone_store::KeyValueStore;

use crate::bus::{EventBus, EventHandler, Message};
use crate::config::SyncSettings;
use crate::dead_letter::{DeadLetterOrigin, DeadLetterQueue};
use crate::error::{SyncError, SyncResult};
use crate::retry::{RetryItem, RetryOutcome, RetryPolicy, RetryQueue, RetryReport};
use crate::targets::{ApplyOutcome, SyncTarget};

const MANUAL_CONFLICTS_KEY: &str = "conflicts:manual";

fn version_key(entity_type: &str, entity_id: &str) -> String {
    format!("version:{}:{}", entity_type, entity_id)
}

fn hash_key(entity_type: &str, entity_id: &str) -> String {
    format!("content_hash:{}:{}", entity_type, entity_id)
}

fn hold_key(entity_type: &str, entity_id: &str) -> String {
    format!("conflict:hold:{}:{}", entity_type, entity_id)
}

fn conflict_key(id: &str) -> String {
    format!("conflict:{}", id)
}

// =============================================================================
// Reports
// =============================================================================

/// What happened to one target for one event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetResult {
    Applied,
    AlreadyApplied,
    /// The adapter had nothing to write (e.g. no embeddings).
    Skipped,
    /// A stale event lost to the target's newer copy.
    KeptNewer,
    /// A manual conflict is blocking the entity.
    Held,
    Queued,
    DeadLettered,
    NoAdapter,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncLogEntry {
    pub event_id: String,
    pub entity_type: String,
    pub entity_id: String,
    pub source: DataSource,
    pub operation: SyncOperation,
    pub version: u64,
    pub results: Vec<(DataSource, TargetResult)>,
    pub processed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize)]
struct Counters {
    events_published: u64,
    events_processed: u64,
    target_applies: u64,
    target_failures: u64,
    conflicts_detected: u64,
    conflicts_resolved: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CoordinatorStats {
    pub events_published: u64,
    pub events_processed: u64,
    pub target_applies: u64,
    pub target_failures: u64,
    pub conflicts_detected: u64,
    pub conflicts_resolved: u64,
    pub pending_manual_conflicts: usize,
    pub pending_retries: usize,
    pub sync_log_entries: usize,
    pub targets: Vec<DataSource>,
}

// =============================================================================
// Coordinator
// =============================================================================

/// Cross-store consistency coordinator. Cheap to clone.
#[derive(Clone)]
pub struct ConsistencyCoordinator {
    inner: Arc<CoordinatorInner>,
}

struct CoordinatorInner {
    settings: SyncSettings,
    store: Arc<dyn KeyValueStore>,
    bus: EventBus,
    targets: BTreeMap<DataSource, Arc<dyn SyncTarget>>,
    routing: RoutingTable,
    authoritative: AuthoritativeSources,
    retries: RetryQueue,
    dead_letters: DeadLetterQueue,
    log: Mutex<VecDeque<SyncLogEntry>>,
    counters: Mutex<Counters>,
    subscribed: AtomicBool,
}

impl ConsistencyCoordinator {
    pub fn new(
        settings: SyncSettings,
        store: Arc<dyn KeyValueStore>,
        bus: EventBus,
        targets: Vec<Arc<dyn SyncTarget>>,
        dead_letters: DeadLetterQueue,
    ) -> SyncResult<Self> {
        let routing = settings.routing_table()?;
        let authoritative = settings.authoritative();
        let retries = RetryQueue::for_targets(
            store.clone(),
            RetryPolicy::for_targets(
                Duration::from_secs(settings.retry_base_delay_seconds),
                settings.retry_max_attempts,
            ),
            Duration::from_secs(settings.retry_record_ttl_seconds),
            dead_letters.clone(),
        );
        let targets = targets
            .into_iter()
            .map(|target| (target.store(), target))
            .collect();

        Ok(ConsistencyCoordinator {
            inner: Arc::new(CoordinatorInner {
                settings,
                store,
                bus,
                targets,
                routing,
                authoritative,
                retries,
                dead_letters,
                log: Mutex::new(VecDeque::new()),
                counters: Mutex::new(Counters::default()),
                subscribed: AtomicBool::new(false),
            }),
        })
    }

    pub fn routing(&self) -> &RoutingTable {
        &self.inner.routing
    }

    pub fn retry_queue(&self) -> &RetryQueue {
        &self.inner.retries
    }

    /// Subscribes the coordinator to its bus topic. Idempotent.
    pub async fn start(&self) {
        if self.inner.subscribed.swap(true, Ordering::SeqCst) {
            return;
        }
        let handler = Arc::new(SyncEventHandler {
            coordinator: self.clone(),
        });
        self.inner
            .bus
            .subscribe(&self.inner.settings.topic, handler)
            .await;
        info!(
            topic = %self.inner.settings.topic,
            targets = ?self.inner.targets.keys().collect::<Vec<_>>(),
            "Consistency coordinator started"
        );
    }

    // =========================================================================
    // Publishing
    // =========================================================================

    /// Stamps the change with the next version for `(entity, source)` and
    /// queues it for fan-out. Returns the event id without waiting.
    pub async fn publish_change(
        &self,
        source: DataSource,
        operation: SyncOperation,
        entity_type: &str,
        entity_id: &str,
        data: Value,
    ) -> SyncResult<String> {
        let event = self
            .stamp(source, operation, entity_type, entity_id, data)
            .await?;
        self.publish_event(event).await
    }

    async fn stamp(
        &self,
        source: DataSource,
        operation: SyncOperation,
        entity_type: &str,
        entity_id: &str,
        data: Value,
    ) -> SyncResult<SyncEvent> {
        let store = &self.inner.store;
        let vkey = version_key(entity_type, entity_id);
        let hkey = hash_key(entity_type, entity_id);
        let hash = content_hash(&data);

        let versions = self.version_vector(entity_type, entity_id).await?;
        let current = versions.get(source);
        let last_hash = store.hget(&hkey, source.as_str()).await?;

        let version = match current {
            Some(version) if last_hash.as_deref() == Some(hash.as_str()) => version,
            _ => {
                let latest = versions.latest().unwrap_or(0);
                let step = latest - current.unwrap_or(0) + 1;
                store.hincr_by(&vkey, source.as_str(), step as i64).await? as u64
            }
        };
        store
            .hset(&hkey, &[(source.as_str().to_string(), hash)])
            .await?;

        Ok(SyncEvent::new(
            source,
            operation,
            entity_type,
            entity_id,
            data,
            version,
        ))
    }

    async fn publish_event(&self, event: SyncEvent) -> SyncResult<String> {
        let payload = serde_json::to_value(&event)?;
        self.inner
            .bus
            .publish(
                &self.inner.settings.topic,
                payload,
                self.inner.settings.event_priority,
                None,
                None,
            )
            .await?;
        self.inner.counters.lock().await.events_published += 1;

        info!(
            event_id = %event.event_id,
            entity_type = %event.entity_type,
            entity_id = %event.entity_id,
            source = %event.source,
            operation = %event.operation,
            version = event.version,
            "Change published"
        );
        Ok(event.event_id)
    }

    // =========================================================================
    // Processing
    // =========================================================================

    /// Applies one event to every target routed from its source.
    pub async fn process_event(
        &self,
        event: &SyncEvent,
    ) -> SyncResult<Vec<(DataSource, TargetResult)>> {
        let targets = self
            .inner
            .routing
            .targets(&event.entity_type, event.source)
            .to_vec();

        let held = !event.is_resolution()
            && self
                .inner
                .store
                .exists(&hold_key(&event.entity_type, &event.entity_id))
                .await?;

        let mut results = Vec::with_capacity(targets.len());
        if held {
            info!(
                entity_type = %event.entity_type,
                entity_id = %event.entity_id,
                "Entity is waiting for manual conflict resolution, event held"
            );
            results.extend(targets.iter().map(|t| (*t, TargetResult::Held)));
        } else {
            for target in targets {
                let result = match self.sync_target(event, target).await {
                    Ok(result) => result,
                    Err(e) => self.requeue(target, event, e).await?,
                };
                results.push((target, result));
            }
        }

        debug!(event_id = %event.event_id, results = ?results, "Event processed");
        self.inner.counters.lock().await.events_processed += 1;
        self.append_log(event, &results).await;
        Ok(results)
    }

    async fn sync_target(&self, event: &SyncEvent, target: DataSource) -> SyncResult<TargetResult> {
        let Some(adapter) = self.inner.targets.get(&target).cloned() else {
            debug!(target = %target, "No adapter registered for target");
            return Ok(TargetResult::NoAdapter);
        };

        let store = &self.inner.store;
        let vkey = version_key(&event.entity_type, &event.entity_id);
        let hkey = hash_key(&event.entity_type, &event.entity_id);
        let applied_version = store
            .hget(&vkey, target.as_str())
            .await?
            .and_then(|v| v.parse::<u64>().ok());
        let applied_hash = store.hget(&hkey, target.as_str()).await?;

        let same_content = applied_hash.as_deref() == Some(event.content_hash.as_str());
        if same_content && applied_version.is_some_and(|v| v >= event.version) {
            return Ok(TargetResult::AlreadyApplied);
        }

        let stale = applied_version.is_some_and(|v| v > event.version)
            && applied_hash.is_some()
            && !same_content;
        if stale && !event.is_resolution() {
            if let Some(result) = self.handle_stale_write(event, target, adapter.as_ref()).await? {
                return Ok(result);
            }
        }

        match adapter.apply(event).await? {
            ApplyOutcome::Applied => {
                let version = applied_version.unwrap_or(0).max(event.version);
                store
                    .hset(&vkey, &[(target.as_str().to_string(), version.to_string())])
                    .await?;
                store
                    .hset(&hkey, &[(target.as_str().to_string(), event.content_hash.clone())])
                    .await?;
                self.inner.counters.lock().await.target_applies += 1;
                debug!(
                    target = %target,
                    entity_id = %event.entity_id,
                    version,
                    "Target synced"
                );
                Ok(TargetResult::Applied)
            }
            ApplyOutcome::Skipped => Ok(TargetResult::Skipped),
        }
    }

    /// A stale event would overwrite a newer, different copy. Returns the
    /// final result, or `None` when the event won and should be applied.
    async fn handle_stale_write(
        &self,
        event: &SyncEvent,
        target: DataSource,
        adapter: &dyn SyncTarget,
    ) -> SyncResult<Option<TargetResult>> {
        self.inner.counters.lock().await.conflicts_detected += 1;
        let detected = SyncError::ConflictDetected {
            entity_type: event.entity_type.clone(),
            entity_id: event.entity_id.clone(),
            sources: vec![event.source, target],
        };
        warn!(error_kind = %detected.kind(), "{}", detected);

        let Some(current) = adapter
            .fetch(&event.entity_type, &event.entity_id)
            .await?
        else {
            return Ok(None);
        };

        let mut copies = vec![
            ConflictCopy::new(event.source, event.data.clone()),
            ConflictCopy::new(target, current),
        ];
        copies.sort_by_key(|c| c.source);

        let strategy = self.inner.settings.conflict_resolution_strategy;
        let Some(resolution) = resolve(strategy, &copies) else {
            return Ok(None);
        };
        let record = ConflictRecord::new(
            &event.entity_type,
            &event.entity_id,
            copies,
            strategy,
            &resolution,
        );
        self.save_conflict(&record).await?;

        match resolution {
            Resolution::Manual { .. } => Ok(Some(TargetResult::Held)),
            Resolution::Resolved { winner, .. } => {
                self.inner.counters.lock().await.conflicts_resolved += 1;
                info!(
                    conflict_id = %record.id,
                    winner = %winner,
                    strategy = %strategy,
                    "Sync conflict resolved"
                );
                if winner == target {
                    Ok(Some(TargetResult::KeptNewer))
                } else {
                    Ok(None)
                }
            }
        }
    }

    async fn requeue(
        &self,
        target: DataSource,
        event: &SyncEvent,
        err: SyncError,
    ) -> SyncResult<TargetResult> {
        self.inner.counters.lock().await.target_failures += 1;
        warn!(
            target = %target,
            entity_type = %event.entity_type,
            entity_id = %event.entity_id,
            error_kind = %err.kind(),
            ?err,
            "Target sync failed"
        );

        let retryable = err.is_retryable() || matches!(err, SyncError::StoreFailed(_));
        if !retryable {
            let payload = serde_json::to_value(event)?;
            self.inner
                .dead_letters
                .add(
                    DeadLetterOrigin::SyncTarget,
                    &event.event_id,
                    payload,
                    &err.to_string(),
                    1,
                )
                .await?;
            return Ok(TargetResult::DeadLettered);
        }

        let item = RetryItem::SyncEvent {
            target,
            event: event.clone(),
        };
        match self.inner.retries.schedule(item, &err.to_string()).await? {
            RetryOutcome::Scheduled { .. } => Ok(TargetResult::Queued),
            RetryOutcome::DeadLettered { .. } => Ok(TargetResult::DeadLettered),
        }
    }

    /// Replays due per-target retries.
    pub async fn process_retry_queue(&self) -> SyncResult<RetryReport> {
        self.process_retry_queue_at(Utc::now()).await
    }

    /// Replays retries due at `now`.
    pub async fn process_retry_queue_at(&self, now: DateTime<Utc>) -> SyncResult<RetryReport> {
        let mut report = RetryReport::default();

        for record in self.inner.retries.due(now).await? {
            let RetryItem::SyncEvent { target, event } = &record.item else {
                continue;
            };
            report.attempted += 1;

            let applied = self
                .version_vector(&event.entity_type, &event.entity_id)
                .await?
                .get(*target);
            if applied.is_some_and(|v| v > event.version) {
                self.inner.retries.complete(&record.item).await?;
                report.superseded += 1;
                continue;
            }

            match self.sync_target(event, *target).await {
                Ok(_) => {
                    self.inner.retries.complete(&record.item).await?;
                    report.succeeded += 1;
                }
                Err(e) => match self.requeue(*target, event, e).await? {
                    TargetResult::DeadLettered => report.dead_lettered += 1,
                    _ => report.rescheduled += 1,
                },
            }
        }

        if report.attempted > 0 {
            info!(
                attempted = report.attempted,
                succeeded = report.succeeded,
                rescheduled = report.rescheduled,
                dead_lettered = report.dead_lettered,
                "Processed sync retry queue"
            );
        }
        Ok(report)
    }

    // =========================================================================
    // Consistency
    // =========================================================================

    pub async fn version_vector(
        &self,
        entity_type: &str,
        entity_id: &str,
    ) -> SyncResult<VersionVector> {
        let fields = self
            .inner
            .store
            .hget_all(&version_key(entity_type, entity_id))
            .await?;

        let mut versions = VersionVector::new();
        for (name, raw) in fields {
            match (name.parse::<DataSource>(), raw.parse::<u64>()) {
                (Ok(source), Ok(version)) => versions.set(source, version),
                _ => warn!(field = %name, value = %raw, "Ignoring malformed version entry"),
            }
        }
        Ok(versions)
    }

    /// Compares versions and content of every copy of an entity.
    pub async fn check_consistency(
        &self,
        entity_type: &str,
        entity_id: &str,
    ) -> SyncResult<ConsistencyReport> {
        let routing_set = self.inner.routing.routing_set(entity_type);
        let versions: VersionVector = self
            .version_vector(entity_type, entity_id)
            .await?
            .iter()
            .filter(|(source, _)| routing_set.is_empty() || routing_set.contains(source))
            .collect();

        let mut discrepancies = Vec::new();
        let mut recommendations = Vec::new();

        for (source, current_version, latest_version) in versions.outdated() {
            discrepancies.push(Discrepancy::OutdatedVersion {
                source,
                current_version,
                latest_version,
            });
            recommendations.push(format!("Sync {} to latest version", source));
        }

        let copies = self.gather_copies(entity_type, entity_id).await?;
        let authoritative = self.inner.authoritative.for_entity_type(entity_type);
        let reference = copies
            .iter()
            .find(|c| c.source == authoritative)
            .or_else(|| copies.first());

        if let Some(reference) = reference {
            for copy in &copies {
                if copy.source == reference.source || copy.content_hash == reference.content_hash {
                    continue;
                }
                discrepancies.push(Discrepancy::DataMismatch {
                    source: copy.source,
                    reference: reference.source,
                    differences: find_differences(&reference.data, &copy.data),
                });
                recommendations.push(format!(
                    "Reconcile {} with {}",
                    copy.source, reference.source
                ));
            }
        }

        let is_consistent = discrepancies.is_empty();
        if is_consistent {
            debug!(entity_type = %entity_type, entity_id = %entity_id, "Entity consistent");
        } else {
            warn!(
                entity_type = %entity_type,
                entity_id = %entity_id,
                discrepancies = discrepancies.len(),
                "Entity inconsistent across stores"
            );
        }

        Ok(ConsistencyReport {
            entity_type: entity_type.to_string(),
            entity_id: entity_id.to_string(),
            is_consistent,
            discrepancies,
            recommendations,
            versions,
            checked_at: Utc::now(),
        })
    }

    /// Copies held by every routed store except the vector index, whose
    /// metadata is not a full copy.
    async fn gather_copies(
        &self,
        entity_type: &str,
        entity_id: &str,
    ) -> SyncResult<Vec<ConflictCopy>> {
        let mut stores = self.inner.routing.routing_set(entity_type);
        if stores.is_empty() {
            stores = self.inner.targets.keys().copied().collect();
        }

        let mut copies = Vec::new();
        for source in stores {
            if source == DataSource::Vector {
                continue;
            }
            let Some(adapter) = self.inner.targets.get(&source) else {
                continue;
            };
            if let Some(data) = adapter.fetch(entity_type, entity_id).await? {
                copies.push(ConflictCopy::new(source, data));
            }
        }
        Ok(copies)
    }

    // =========================================================================
    // Conflicts
    // =========================================================================

    /// Gathers every copy and, when they diverge, resolves them. The winner
    /// is written to the cache and republished from there as UPDATE.
    ///
    /// Returns `None` when the copies agree.
    pub async fn resolve_conflict(
        &self,
        entity_type: &str,
        entity_id: &str,
        strategy: Option<ConflictStrategy>,
    ) -> SyncResult<Option<ConflictRecord>> {
        let strategy = strategy.unwrap_or(self.inner.settings.conflict_resolution_strategy);
        let copies = self.gather_copies(entity_type, entity_id).await?;
        if !has_conflict(&copies) {
            debug!(entity_type = %entity_type, entity_id = %entity_id, "No conflict to resolve");
            return Ok(None);
        }
        self.inner.counters.lock().await.conflicts_detected += 1;

        let Some(resolution) = resolve(strategy, &copies) else {
            return Ok(None);
        };
        let record = ConflictRecord::new(entity_type, entity_id, copies, strategy, &resolution);
        self.save_conflict(&record).await?;

        if let Resolution::Resolved { winner, value } = &resolution {
            self.publish_resolution(entity_type, entity_id, value.clone())
                .await?;
            self.inner.counters.lock().await.conflicts_resolved += 1;
            info!(
                conflict_id = %record.id,
                entity_type = %entity_type,
                entity_id = %entity_id,
                winner = %winner,
                strategy = %strategy,
                "Conflict resolved"
            );
        }
        Ok(Some(record))
    }

    /// Closes a pending manual conflict with an operator-supplied value and
    /// lifts the hold on the entity.
    pub async fn resolve_manual(&self, conflict_id: &str, value: Value) -> SyncResult<ConflictRecord> {
        let mut record = self.get_conflict(conflict_id).await?.ok_or_else(|| {
            SyncError::InvalidOperation(format!("Conflict {} not found", conflict_id))
        })?;
        if record.status != ConflictStatus::PendingManual {
            return Err(SyncError::InvalidOperation(format!(
                "Conflict {} is not waiting for manual resolution",
                conflict_id
            )));
        }

        record.close_manually(value.clone());
        self.write_conflict(&record).await?;
        self.inner
            .store
            .srem(MANUAL_CONFLICTS_KEY, &record.id)
            .await?;
        self.inner
            .store
            .delete(&[hold_key(&record.entity_type, &record.entity_id)])
            .await?;

        self.publish_resolution(&record.entity_type, &record.entity_id, value)
            .await?;
        self.inner.counters.lock().await.conflicts_resolved += 1;
        info!(conflict_id = %record.id, "Manual conflict resolved");
        Ok(record)
    }

    /// Manual conflicts waiting for an operator, oldest first.
    pub async fn pending_manual_conflicts(&self) -> SyncResult<Vec<ConflictRecord>> {
        let mut records = Vec::new();
        for id in self.inner.store.smembers(MANUAL_CONFLICTS_KEY).await? {
            if let Some(record) = self.get_conflict(&id).await? {
                records.push(record);
            }
        }
        records.sort_by(|a, b| a.detected_at.cmp(&b.detected_at));
        Ok(records)
    }

    pub async fn get_conflict(&self, conflict_id: &str) -> SyncResult<Option<ConflictRecord>> {
        match self.inner.store.get(&conflict_key(conflict_id)).await? {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    async fn write_conflict(&self, record: &ConflictRecord) -> SyncResult<()> {
        let json = serde_json::to_string(record)?;
        self.inner
            .store
            .set(&conflict_key(&record.id), &json, None)
            .await?;
        Ok(())
    }

    async fn save_conflict(&self, record: &ConflictRecord) -> SyncResult<()> {
        self.write_conflict(record).await?;

        if record.status == ConflictStatus::PendingManual {
            self.inner
                .store
                .sadd(MANUAL_CONFLICTS_KEY, &record.id)
                .await?;
            self.inner
                .store
                .set(
                    &hold_key(&record.entity_type, &record.entity_id),
                    &record.id,
                    None,
                )
                .await?;
            warn!(
                conflict_id = %record.id,
                entity_type = %record.entity_type,
                entity_id = %record.entity_id,
                "Conflict queued for manual resolution"
            );
        }
        Ok(())
    }

    /// Writes `value` to the cache and republishes it as an authoritative
    /// UPDATE.
    async fn publish_resolution(
        &self,
        entity_type: &str,
        entity_id: &str,
        value: Value,
    ) -> SyncResult<String> {
        let event = self
            .stamp(
                DataSource::Cache,
                SyncOperation::Update,
                entity_type,
                entity_id,
                value,
            )
            .await?
            .with_metadata(RESOLUTION_FLAG, Value::Bool(true));

        self.cache_target()?.apply(&event).await?;
        self.publish_event(event).await
    }

    // =========================================================================
    // Cache Refresh
    // =========================================================================

    /// Reloads the cached copy from the entity type's authoritative store.
    /// Returns false when that store has no copy.
    pub async fn refresh_cache(&self, entity_type: &str, entity_id: &str) -> SyncResult<bool> {
        let source = self.inner.authoritative.for_entity_type(entity_type);
        let adapter = self.inner.targets.get(&source).cloned().ok_or_else(|| {
            SyncError::InvalidConfig(format!("No adapter registered for {}", source))
        })?;

        let Some(data) = adapter.fetch(entity_type, entity_id).await? else {
            debug!(entity_type = %entity_type, entity_id = %entity_id, source = %source, "Nothing to refresh");
            return Ok(false);
        };

        let versions = self.version_vector(entity_type, entity_id).await?;
        let source_version = versions.get(source).unwrap_or(0);
        let event = SyncEvent::new(
            source,
            SyncOperation::Refresh,
            entity_type,
            entity_id,
            data,
            source_version,
        );
        self.cache_target()?.apply(&event).await?;

        let cache_version = versions.get(DataSource::Cache).unwrap_or(0).max(source_version);
        let cache = DataSource::Cache.as_str().to_string();
        self.inner
            .store
            .hset(
                &version_key(entity_type, entity_id),
                &[(cache.clone(), cache_version.to_string())],
            )
            .await?;
        self.inner
            .store
            .hset(&hash_key(entity_type, entity_id), &[(cache, event.content_hash)])
            .await?;

        info!(entity_type = %entity_type, entity_id = %entity_id, source = %source, "Cache refreshed");
        Ok(true)
    }

    fn cache_target(&self) -> SyncResult<Arc<dyn SyncTarget>> {
        self.inner
            .targets
            .get(&DataSource::Cache)
            .cloned()
            .ok_or_else(|| SyncError::InvalidConfig("No cache target registered".into()))
    }

    // =========================================================================
    // Log & Statistics
    // =========================================================================

    async fn append_log(&self, event: &SyncEvent, results: &[(DataSource, TargetResult)]) {
        let mut log = self.inner.log.lock().await;
        log.push_back(SyncLogEntry {
            event_id: event.event_id.clone(),
            entity_type: event.entity_type.clone(),
            entity_id: event.entity_id.clone(),
            source: event.source,
            operation: event.operation,
            version: event.version,
            results: results.to_vec(),
            processed_at: Utc::now(),
        });
        while log.len() > self.inner.settings.sync_log_capacity {
            log.pop_front();
        }
    }

    /// Most recent processed events, newest first.
    pub async fn sync_log(&self, limit: usize) -> Vec<SyncLogEntry> {
        self.inner
            .log
            .lock()
            .await
            .iter()
            .rev()
            .take(limit)
            .cloned()
            .collect()
    }

    pub async fn statistics(&self) -> SyncResult<CoordinatorStats> {
        let counters = self.inner.counters.lock().await.clone();
        let pending_manual_conflicts = self
            .inner
            .store
            .smembers(MANUAL_CONFLICTS_KEY)
            .await?
            .len();
        let pending_retries = self.inner.retries.len().await?;
        let sync_log_entries = self.inner.log.lock().await.len();

        Ok(CoordinatorStats {
            events_published: counters.events_published,
            events_processed: counters.events_processed,
            target_applies: counters.target_applies,
            target_failures: counters.target_failures,
            conflicts_detected: counters.conflicts_detected,
            conflicts_resolved: counters.conflicts_resolved,
            pending_manual_conflicts,
            pending_retries,
            sync_log_entries,
            targets: self.inner.targets.keys().copied().collect(),
        })
    }
}

// =============================================================================
// Bus Handler
// =============================================================================

struct SyncEventHandler {
    coordinator: ConsistencyCoordinator,
}

#[async_trait]
impl EventHandler for SyncEventHandler {
    async fn handle(&self, message: &Message) -> SyncResult<()> {
        let event: SyncEvent = serde_json::from_value(message.payload.clone())?;
        if let Err(e) = self.coordinator.process_event(&event).await {
            error!(event_id = %event.event_id, error_kind = %e.kind(), ?e, "Sync event processing failed");
            return Err(e);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BusSettings;
    use crate::targets::{scoped_id, CacheTarget, GraphTarget, VectorTarget, WarehouseTarget};
    use keystone_store::{
        GraphMutation, GraphStore, MemoryGraph, MemoryStore, MemoryVectorIndex, MemoryWarehouse,
    };
    use serde_json::json;

    struct Harness {
        coordinator: ConsistencyCoordinator,
        bus: EventBus,
        store: Arc<MemoryStore>,
        graph: Arc<MemoryGraph>,
        warehouse: Arc<MemoryWarehouse>,
    }

    async fn harness(settings: SyncSettings) -> Harness {
        let store = Arc::new(MemoryStore::new());
        let graph = Arc::new(MemoryGraph::new());
        let warehouse = Arc::new(MemoryWarehouse::new());
        let dead_letters = DeadLetterQueue::new(store.clone());
        let bus = EventBus::new(
            BusSettings {
                scheduler_interval_ms: 5,
                ..BusSettings::default()
            },
            dead_letters.clone(),
        );

        let targets: Vec<Arc<dyn SyncTarget>> = vec![
            Arc::new(CacheTarget::new(store.clone(), settings.cache_rules())),
            Arc::new(GraphTarget::new(graph.clone())),
            Arc::new(WarehouseTarget::new(warehouse.clone())),
            Arc::new(VectorTarget::new(Arc::new(MemoryVectorIndex::new()))),
        ];
        let coordinator =
            ConsistencyCoordinator::new(settings, store.clone(), bus.clone(), targets, dead_letters)
                .unwrap();
        coordinator.start().await;
        bus.start().await;

        Harness {
            coordinator,
            bus,
            store,
            graph,
            warehouse,
        }
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(200)).await;
    }

    async fn put_graph_node(graph: &MemoryGraph, id: &str, data: Value) {
        graph
            .execute(vec![GraphMutation::MergeNode {
                id: scoped_id("knowledge", id),
                labels: vec!["Knowledge".to_string()],
                properties: data.as_object().cloned().unwrap(),
            }])
            .await
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_replayed_change_applies_once() {
        let h = harness(SyncSettings::default()).await;
        let data = json!({ "title": "ownership" });

        for _ in 0..2 {
            h.coordinator
                .publish_change(DataSource::Cache, SyncOperation::Create, "knowledge", "k1", data.clone())
                .await
                .unwrap();
        }
        settle().await;

        let versions = h.coordinator.version_vector("knowledge", "k1").await.unwrap();
        assert_eq!(versions.get(DataSource::Cache), Some(1));
        assert_eq!(versions.get(DataSource::Graph), Some(1));
        assert_eq!(versions.get(DataSource::Warehouse), Some(1));
        assert_eq!(h.warehouse.row_count("knowledge").await, 1);

        let log = h.coordinator.sync_log(10).await;
        assert_eq!(log.len(), 2);
        assert!(log[0]
            .results
            .iter()
            .all(|(_, r)| matches!(r, TargetResult::AlreadyApplied | TargetResult::Skipped)));

        h.bus.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_entity_types_sharing_an_id_sync_independently() {
        let h = harness(SyncSettings::default()).await;

        h.coordinator
            .publish_change(DataSource::Cache, SyncOperation::Create, "knowledge", "x1", json!({ "title": "rust" }))
            .await
            .unwrap();
        h.coordinator
            .publish_change(DataSource::Cache, SyncOperation::Create, "task", "x1", json!({ "status": "open" }))
            .await
            .unwrap();
        settle().await;

        let knowledge = h.graph.get_node("knowledge:x1").await.unwrap().unwrap();
        assert_eq!(knowledge.labels, vec!["Knowledge".to_string()]);
        assert_eq!(Value::Object(knowledge.properties), json!({ "title": "rust" }));

        let task = h.graph.get_node("task:x1").await.unwrap().unwrap();
        assert_eq!(task.labels, vec!["Task".to_string()]);
        assert_eq!(Value::Object(task.properties), json!({ "status": "open" }));

        for entity_type in ["knowledge", "task"] {
            let report = h.coordinator.check_consistency(entity_type, "x1").await.unwrap();
            assert!(report.is_consistent, "{}: {:?}", entity_type, report.discrepancies);
        }

        h.bus.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_consistency_check_reports_stale_store() {
        let h = harness(SyncSettings::default()).await;
        let data = json!({ "title": "borrowing", "score": 7 });

        put_graph_node(&h.graph, "k1", data.clone()).await;
        h.coordinator
            .publish_change(DataSource::Graph, SyncOperation::Create, "knowledge", "k1", data)
            .await
            .unwrap();
        settle().await;

        let report = h.coordinator.check_consistency("knowledge", "k1").await.unwrap();
        assert!(report.is_consistent, "{:?}", report.discrepancies);
        assert!(report.discrepancies.is_empty());
        assert_eq!(report.versions.len(), 3);

        h.store
            .hset("version:knowledge:k1", &[("warehouse".to_string(), "0".to_string())])
            .await
            .unwrap();

        let report = h.coordinator.check_consistency("knowledge", "k1").await.unwrap();
        assert!(!report.is_consistent);
        assert_eq!(report.discrepancies.len(), 1);
        assert_eq!(report.discrepancies[0].source(), DataSource::Warehouse);
        assert_eq!(report.recommendations, vec!["Sync warehouse to latest version"]);

        h.bus.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_data_mismatch_is_reported() {
        let h = harness(SyncSettings::default()).await;

        put_graph_node(&h.graph, "k1", json!({ "title": "a" })).await;
        h.store
            .set("knowledge:k1", &json!({ "title": "b" }).to_string(), None)
            .await
            .unwrap();

        let report = h.coordinator.check_consistency("knowledge", "k1").await.unwrap();
        assert_eq!(report.discrepancies.len(), 1);
        match &report.discrepancies[0] {
            Discrepancy::DataMismatch {
                source,
                reference,
                differences,
            } => {
                assert_eq!(*source, DataSource::Cache);
                assert_eq!(*reference, DataSource::Graph);
                assert_eq!(differences, &vec!["Different values for 'title'".to_string()]);
            }
            other => panic!("unexpected discrepancy {:?}", other),
        }

        h.bus.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_last_write_wins_republishes_winner() {
        let h = harness(SyncSettings::default()).await;
        let t1 = Utc::now();
        let t2 = t1 + chrono::Duration::seconds(1);

        h.store
            .set(
                "knowledge:k1",
                &json!({ "value": 10, "updated_at": t1.to_rfc3339() }).to_string(),
                None,
            )
            .await
            .unwrap();
        put_graph_node(&h.graph, "k1", json!({ "value": 20, "updated_at": t2.to_rfc3339() })).await;

        let record = h
            .coordinator
            .resolve_conflict("knowledge", "k1", Some(ConflictStrategy::LastWriteWins))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.status, ConflictStatus::Resolved);
        assert_eq!(record.winner, Some(DataSource::Graph));
        assert_eq!(record.resolved_value.as_ref().unwrap()["value"], 20);
        settle().await;

        let cached: Value =
            serde_json::from_str(&h.store.get("knowledge:k1").await.unwrap().unwrap()).unwrap();
        assert_eq!(cached["value"], 20);
        let report = h.coordinator.check_consistency("knowledge", "k1").await.unwrap();
        assert!(report.is_consistent, "{:?}", report.discrepancies);

        h.bus.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_conflict_holds_entity_until_resolved() {
        let h = harness(SyncSettings {
            conflict_resolution_strategy: ConflictStrategy::Manual,
            ..SyncSettings::default()
        })
        .await;

        h.store
            .set("knowledge:k1", &json!({ "value": 1 }).to_string(), None)
            .await
            .unwrap();
        put_graph_node(&h.graph, "k1", json!({ "value": 2 })).await;

        let record = h
            .coordinator
            .resolve_conflict("knowledge", "k1", None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.status, ConflictStatus::PendingManual);
        assert_eq!(h.coordinator.pending_manual_conflicts().await.unwrap().len(), 1);

        h.coordinator
            .publish_change(DataSource::Cache, SyncOperation::Update, "knowledge", "k1", json!({ "value": 3 }))
            .await
            .unwrap();
        settle().await;
        let node = h.graph.get_node("knowledge:k1").await.unwrap().unwrap();
        assert_eq!(node.properties["value"], 2);

        let closed = h
            .coordinator
            .resolve_manual(&record.id, json!({ "value": 99 }))
            .await
            .unwrap();
        assert_eq!(closed.status, ConflictStatus::ResolvedManually);
        settle().await;

        let node = h.graph.get_node("knowledge:k1").await.unwrap().unwrap();
        assert_eq!(node.properties["value"], 99);
        assert!(h.coordinator.pending_manual_conflicts().await.unwrap().is_empty());

        h.bus.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_event_keeps_newer_copy() {
        let h = harness(SyncSettings::default()).await;
        let now = Utc::now();
        let newer = json!({ "value": "newer", "updated_at": (now + chrono::Duration::seconds(10)).to_rfc3339() });

        put_graph_node(&h.graph, "k1", newer.clone()).await;
        h.store
            .hset("version:knowledge:k1", &[("graph".to_string(), "5".to_string())])
            .await
            .unwrap();
        h.store
            .hset("content_hash:knowledge:k1", &[("graph".to_string(), content_hash(&newer))])
            .await
            .unwrap();

        let stale = SyncEvent::new(
            DataSource::Cache,
            SyncOperation::Update,
            "knowledge",
            "k1",
            json!({ "value": "older", "updated_at": now.to_rfc3339() }),
            1,
        );
        let results = h.coordinator.process_event(&stale).await.unwrap();
        assert!(results.contains(&(DataSource::Graph, TargetResult::KeptNewer)));

        let node = h.graph.get_node("knowledge:k1").await.unwrap().unwrap();
        assert_eq!(node.properties["value"], "newer");
        assert_eq!(h.coordinator.statistics().await.unwrap().conflicts_detected, 1);

        h.bus.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_unavailable_target_is_retried() {
        let h = harness(SyncSettings::default()).await;
        h.graph.set_available(false);

        h.coordinator
            .publish_change(DataSource::Cache, SyncOperation::Create, "knowledge", "k1", json!({ "title": "traits" }))
            .await
            .unwrap();
        settle().await;

        assert_eq!(h.coordinator.retry_queue().len().await.unwrap(), 1);
        assert!(h.graph.get_node("knowledge:k1").await.is_err());

        h.graph.set_available(true);
        let report = h
            .coordinator
            .process_retry_queue_at(Utc::now() + chrono::Duration::seconds(60))
            .await
            .unwrap();
        assert_eq!(report.succeeded, 1);
        assert_eq!(h.coordinator.retry_queue().len().await.unwrap(), 0);
        assert!(h.graph.get_node("knowledge:k1").await.unwrap().is_some());

        let stats = h.coordinator.statistics().await.unwrap();
        assert_eq!(stats.target_failures, 1);
        assert_eq!(stats.pending_retries, 0);

        h.bus.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_cache_from_authoritative_store() {
        let h = harness(SyncSettings::default()).await;
        put_graph_node(&h.graph, "k9", json!({ "title": "lifetimes" })).await;

        assert!(h.coordinator.refresh_cache("knowledge", "k9").await.unwrap());
        assert!(!h.coordinator.refresh_cache("knowledge", "missing").await.unwrap());

        let cached: Value =
            serde_json::from_str(&h.store.get("knowledge:k9").await.unwrap().unwrap()).unwrap();
        assert_eq!(cached["title"], "lifetimes");

        h.bus.shutdown().await;
    }
}
