//! # Retry Queue
//!
//! Store-backed requeueing of failed work with exponential backoff, shared by
//! the coordinator (one record per failed target) and the transactional
//! writer (one record per failed operation).
//!
//! ## Record Lifecycle
//! ```text
//! failure ──► schedule() ──► attempts ≤ budget ──► retry:{..} { next_retry }
//!                 │                                      │
//!                 │                             due(now) │ worker replays
//!                 │                                      ▼
//!                 │                          success ──► complete()
//!                 │                          failure ──► schedule() again
//!                 │
//!                 └──► attempts > budget ──► dead_letter:{id}
//! ```
//!
//! ## Key Layout
//! ```text
//! retry:{target}:{entity_type}:{entity_id}   failed sync to one target
//! retry:transaction:{tx}:{op}                failed transaction operation
//! ```

use std::sync::Arc;
use std::time::Duration;

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use keystone_core::{DataSource, Operation, SyncEvent};
use keystone_store::KeyValueStore;

use crate::dead_letter::{DeadLetterOrigin, DeadLetterQueue};
use crate::error::SyncResult;

// =============================================================================
// Policy
// =============================================================================

/// Exponential delay schedule with a retry budget.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub initial_interval: Duration,
    pub max_interval: Duration,
    /// Retries allowed before an item is dead-lettered.
    pub max_attempts: u32,
}

impl RetryPolicy {
    /// Per-target sync retries: `base * 2^(attempt-1)`.
    pub fn for_targets(base: Duration, max_attempts: u32) -> Self {
        RetryPolicy {
            initial_interval: base,
            max_interval: Duration::from_secs(24 * 3600),
            max_attempts,
        }
    }

    /// Transaction operations: `min(2^attempt, max_delay)` seconds.
    pub fn for_transactions(max_delay: Duration, max_attempts: u32) -> Self {
        RetryPolicy {
            initial_interval: Duration::from_secs(2),
            max_interval: max_delay,
            max_attempts,
        }
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let mut backoff = self.create_backoff();
        let mut delay = self.initial_interval;
        for _ in 0..attempt.max(1) {
            delay = backoff.next_backoff().unwrap_or(self.max_interval);
        }
        // Whole milliseconds; the jitter-free backoff can still add a nanosecond.
        Duration::from_millis(delay.as_millis() as u64).min(self.max_interval)
    }

    fn create_backoff(&self) -> ExponentialBackoff {
        let mut backoff = ExponentialBackoff {
            initial_interval: self.initial_interval,
            max_interval: self.max_interval,
            randomization_factor: 0.0,
            multiplier: 2.0,
            max_elapsed_time: None,
            ..Default::default()
        };
        backoff.reset();
        backoff
    }
}

// =============================================================================
// Records
// =============================================================================

/// Work item waiting for another attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RetryItem {
    /// An event that failed to apply to one target store.
    SyncEvent { target: DataSource, event: SyncEvent },
    /// An operation of a rolled back transaction.
    Operation {
        transaction_id: String,
        operation: Operation,
    },
}

impl RetryItem {
    pub fn key(&self) -> String {
        match self {
            RetryItem::SyncEvent { target, event } => {
                format!("retry:{}:{}:{}", target, event.entity_type, event.entity_id)
            }
            RetryItem::Operation {
                transaction_id,
                operation,
            } => format!("retry:transaction:{}:{}", transaction_id, operation.id),
        }
    }

    fn reference_id(&self) -> &str {
        match self {
            RetryItem::SyncEvent { event, .. } => &event.event_id,
            RetryItem::Operation { operation, .. } => &operation.id,
        }
    }

    fn origin(&self) -> DeadLetterOrigin {
        match self {
            RetryItem::SyncEvent { .. } => DeadLetterOrigin::SyncTarget,
            RetryItem::Operation { .. } => DeadLetterOrigin::Transaction,
        }
    }
}

/// Persisted retry bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryRecord {
    pub item: RetryItem,
    pub attempts: u32,
    pub next_retry: DateTime<Utc>,
    pub last_error: String,
    pub first_failed_at: DateTime<Utc>,
}

/// What `schedule` did with an item.
#[derive(Debug, Clone, PartialEq)]
pub enum RetryOutcome {
    Scheduled {
        attempts: u32,
        next_retry: DateTime<Utc>,
    },
    DeadLettered {
        dead_letter_id: String,
    },
}

/// Outcome of one pass over a retry queue.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RetryReport {
    pub attempted: usize,
    pub succeeded: usize,
    /// Dropped because the target already holds a newer version.
    pub superseded: usize,
    pub rescheduled: usize,
    pub dead_lettered: usize,
}

// =============================================================================
// Queue
// =============================================================================

/// Store-backed retry queue.
#[derive(Clone)]
pub struct RetryQueue {
    store: Arc<dyn KeyValueStore>,
    policy: RetryPolicy,
    record_ttl: Duration,
    dead_letters: DeadLetterQueue,
    patterns: Vec<String>,
}

impl RetryQueue {
    /// Queue of failed per-target syncs.
    pub fn for_targets(
        store: Arc<dyn KeyValueStore>,
        policy: RetryPolicy,
        record_ttl: Duration,
        dead_letters: DeadLetterQueue,
    ) -> Self {
        let patterns = DataSource::ALL
            .iter()
            .map(|target| format!("retry:{}:*", target))
            .collect();
        RetryQueue {
            store,
            policy,
            record_ttl,
            dead_letters,
            patterns,
        }
    }

    /// Queue of failed transaction operations. The budget of each item is
    /// the operation's own `max_retries`.
    pub fn for_transactions(
        store: Arc<dyn KeyValueStore>,
        policy: RetryPolicy,
        record_ttl: Duration,
        dead_letters: DeadLetterQueue,
    ) -> Self {
        RetryQueue {
            store,
            policy,
            record_ttl,
            dead_letters,
            patterns: vec!["retry:transaction:*".to_string()],
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Records a failure of `item`, either scheduling another attempt or
    /// dead-lettering it once the budget is spent.
    pub async fn schedule(&self, item: RetryItem, last_error: &str) -> SyncResult<RetryOutcome> {
        let key = item.key();
        let previous = self.get(&key).await?;

        let (item, attempts, budget) = match item {
            RetryItem::Operation {
                transaction_id,
                mut operation,
            } => {
                operation.retry_count += 1;
                let attempts = operation.retry_count;
                let budget = operation.max_retries;
                (
                    RetryItem::Operation {
                        transaction_id,
                        operation,
                    },
                    attempts,
                    budget,
                )
            }
            event @ RetryItem::SyncEvent { .. } => {
                let attempts = previous.as_ref().map_or(0, |r| r.attempts) + 1;
                (event, attempts, self.policy.max_attempts)
            }
        };

        if attempts > budget {
            let payload = serde_json::to_value(&item)?;
            let dead_letter_id = self
                .dead_letters
                .add(item.origin(), item.reference_id(), payload, last_error, attempts - 1)
                .await?;
            self.store.delete(&[key]).await?;
            return Ok(RetryOutcome::DeadLettered { dead_letter_id });
        }

        let now = Utc::now();
        let delay = self.policy.delay_for(attempts);
        let next_retry = now + chrono::Duration::milliseconds(delay.as_millis() as i64);
        let record = RetryRecord {
            item,
            attempts,
            next_retry,
            last_error: last_error.to_string(),
            first_failed_at: previous.map_or(now, |r| r.first_failed_at),
        };

        let json = serde_json::to_string(&record)?;
        self.store.set(&key, &json, Some(self.record_ttl)).await?;

        info!(
            retry_key = %key,
            attempts,
            delay_secs = delay.as_secs_f64(),
            last_error = %last_error,
            "Scheduled retry"
        );
        Ok(RetryOutcome::Scheduled {
            attempts,
            next_retry,
        })
    }

    pub async fn get(&self, key: &str) -> SyncResult<Option<RetryRecord>> {
        match self.store.get(key).await? {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    /// Every record in this queue, oldest `next_retry` first.
    pub async fn pending(&self) -> SyncResult<Vec<RetryRecord>> {
        let mut records = Vec::new();
        for pattern in &self.patterns {
            for key in self.store.scan_keys(pattern).await? {
                match self.get(&key).await {
                    Ok(Some(record)) => records.push(record),
                    Ok(None) => {}
                    Err(e) => {
                        warn!(retry_key = %key, error_kind = %e.kind(), ?e, "Skipping unreadable retry record");
                    }
                }
            }
        }
        records.sort_by(|a, b| a.next_retry.cmp(&b.next_retry));
        Ok(records)
    }

    /// Records whose `next_retry` is at or before `now`.
    pub async fn due(&self, now: DateTime<Utc>) -> SyncResult<Vec<RetryRecord>> {
        let mut records = self.pending().await?;
        records.retain(|r| r.next_retry <= now);
        debug!(due = records.len(), "Collected due retries");
        Ok(records)
    }

    /// Drops the record after a successful replay.
    pub async fn complete(&self, item: &RetryItem) -> SyncResult<bool> {
        Ok(self.store.delete(&[item.key()]).await? > 0)
    }

    pub async fn len(&self) -> SyncResult<usize> {
        let mut count = 0;
        for pattern in &self.patterns {
            count += self.store.scan_keys(pattern).await?.len();
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keystone_core::SyncOperation;
    use keystone_store::MemoryStore;
    use serde_json::json;

    fn event() -> SyncEvent {
        SyncEvent::new(
            DataSource::Cache,
            SyncOperation::Update,
            "knowledge",
            "k1",
            json!({ "value": 1 }),
            1,
        )
    }

    #[test]
    fn test_target_policy_doubles() {
        let policy = RetryPolicy::for_targets(Duration::from_secs(30), 5);
        assert_eq!(policy.delay_for(1), Duration::from_secs(30));
        assert_eq!(policy.delay_for(2), Duration::from_secs(60));
        assert_eq!(policy.delay_for(3), Duration::from_secs(120));
    }

    #[test]
    fn test_transaction_policy_is_capped() {
        let policy = RetryPolicy::for_transactions(Duration::from_secs(300), 3);
        assert_eq!(policy.delay_for(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for(2), Duration::from_secs(4));
        assert_eq!(policy.delay_for(8), Duration::from_secs(256));
        assert_eq!(policy.delay_for(9), Duration::from_secs(300));
        assert_eq!(policy.delay_for(20), Duration::from_secs(300));
    }

    #[tokio::test]
    async fn test_schedule_until_dead_letter() {
        let store = Arc::new(MemoryStore::new());
        let dlq = DeadLetterQueue::new(store.clone());
        let queue = RetryQueue::for_targets(
            store,
            RetryPolicy::for_targets(Duration::from_secs(30), 2),
            Duration::from_secs(3600),
            dlq.clone(),
        );

        let item = RetryItem::SyncEvent {
            target: DataSource::Graph,
            event: event(),
        };
        assert_eq!(item.key(), "retry:graph:knowledge:k1");

        let first = queue.schedule(item.clone(), "graph offline").await.unwrap();
        assert!(matches!(first, RetryOutcome::Scheduled { attempts: 1, .. }));
        assert!(queue.due(Utc::now()).await.unwrap().is_empty());
        assert_eq!(
            queue
                .due(Utc::now() + chrono::Duration::seconds(31))
                .await
                .unwrap()
                .len(),
            1
        );

        let second = queue.schedule(item.clone(), "graph offline").await.unwrap();
        assert!(matches!(second, RetryOutcome::Scheduled { attempts: 2, .. }));

        let third = queue.schedule(item, "still offline").await.unwrap();
        assert!(matches!(third, RetryOutcome::DeadLettered { .. }));
        assert_eq!(queue.len().await.unwrap(), 0);

        let letters = dlq.list(10).await.unwrap();
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].error_message, "still offline");
        assert_eq!(letters[0].origin, DeadLetterOrigin::SyncTarget);
    }

    #[tokio::test]
    async fn test_operation_budget_comes_from_operation() {
        let store = Arc::new(MemoryStore::new());
        let dlq = DeadLetterQueue::new(store.clone());
        let queue = RetryQueue::for_transactions(
            store,
            RetryPolicy::for_transactions(Duration::from_secs(300), 3),
            Duration::from_secs(3600),
            dlq.clone(),
        );

        let operation = Operation::delete_node("n1").with_id("op-1").with_max_retries(1);
        let item = RetryItem::Operation {
            transaction_id: "tx-1".into(),
            operation,
        };

        let first = queue.schedule(item.clone(), "boom").await.unwrap();
        assert!(matches!(first, RetryOutcome::Scheduled { attempts: 1, .. }));

        let record = queue.get("retry:transaction:tx-1:op-1").await.unwrap().unwrap();
        let RetryItem::Operation { operation, .. } = record.item else {
            panic!("expected an operation record");
        };
        assert_eq!(operation.retry_count, 1);

        let again = RetryItem::Operation {
            transaction_id: "tx-1".into(),
            operation,
        };
        let second = queue.schedule(again, "boom").await.unwrap();
        assert!(matches!(second, RetryOutcome::DeadLettered { .. }));
        assert_eq!(dlq.count().await.unwrap(), 1);
    }
}
