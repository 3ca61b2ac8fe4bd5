//! # Dead Letter Queue
//!
//! Terminal failures kept in the shared store for operators to inspect,
//! replay by hand, or clear.
//!
//! ## Key Layout
//! ```text
//! dead_letter:{id}     JSON DeadLetter
//! dead_letter:index    set of ids
//! ```

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use keystone_store::KeyValueStore;

use crate::error::{ErrorKind, SyncResult};

const INDEX_KEY: &str = "dead_letter:index";

fn entry_key(id: &str) -> String {
    format!("dead_letter:{}", id)
}

/// Which subsystem gave up on the item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeadLetterOrigin {
    /// A bus message whose handler kept failing.
    Bus,
    /// A sync event that could not be applied to one target store.
    SyncTarget,
    /// A transaction operation out of retry budget.
    Transaction,
}

/// Failed item record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub id: String,
    pub origin: DeadLetterOrigin,
    /// Message, event or operation id the entry refers to.
    pub reference_id: String,
    pub payload: Value,
    pub error_message: String,
    pub attempts: u32,
    pub failed_at: DateTime<Utc>,
}

/// Store-backed dead letter queue.
#[derive(Clone)]
pub struct DeadLetterQueue {
    store: Arc<dyn KeyValueStore>,
}

impl DeadLetterQueue {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        DeadLetterQueue { store }
    }

    /// Records a terminal failure and returns the entry id.
    pub async fn add(
        &self,
        origin: DeadLetterOrigin,
        reference_id: &str,
        payload: Value,
        error_message: &str,
        attempts: u32,
    ) -> SyncResult<String> {
        let entry = DeadLetter {
            id: Uuid::new_v4().to_string(),
            origin,
            reference_id: reference_id.to_string(),
            payload,
            error_message: error_message.to_string(),
            attempts,
            failed_at: Utc::now(),
        };

        let json = serde_json::to_string(&entry)?;
        self.store.set(&entry_key(&entry.id), &json, None).await?;
        self.store.sadd(INDEX_KEY, &entry.id).await?;

        error!(
            dead_letter_id = %entry.id,
            origin = ?origin,
            reference_id = %reference_id,
            attempts,
            error_kind = %ErrorKind::MaxRetriesExceeded,
            last_error = %error_message,
            "Moved to dead letter queue"
        );
        Ok(entry.id)
    }

    pub async fn get(&self, id: &str) -> SyncResult<Option<DeadLetter>> {
        match self.store.get(&entry_key(id)).await? {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    /// Entries newest first, at most `limit`.
    pub async fn list(&self, limit: usize) -> SyncResult<Vec<DeadLetter>> {
        let mut entries = Vec::new();
        for id in self.store.smembers(INDEX_KEY).await? {
            match self.get(&id).await? {
                Some(entry) => entries.push(entry),
                None => {
                    debug!(dead_letter_id = %id, "Dropping stale index entry");
                    self.store.srem(INDEX_KEY, &id).await?;
                }
            }
        }

        entries.sort_by(|a, b| b.failed_at.cmp(&a.failed_at).then_with(|| a.id.cmp(&b.id)));
        entries.truncate(limit);
        Ok(entries)
    }

    /// Entries that refer to `reference_id`.
    pub async fn find_by_reference(&self, reference_id: &str) -> SyncResult<Vec<DeadLetter>> {
        Ok(self
            .list(usize::MAX)
            .await?
            .into_iter()
            .filter(|e| e.reference_id == reference_id)
            .collect())
    }

    pub async fn count(&self) -> SyncResult<usize> {
        Ok(self.store.smembers(INDEX_KEY).await?.len())
    }

    pub async fn remove(&self, id: &str) -> SyncResult<bool> {
        let removed = self.store.delete(&[entry_key(id)]).await? > 0;
        self.store.srem(INDEX_KEY, id).await?;
        if removed {
            info!(dead_letter_id = %id, "Dead letter removed");
        } else {
            warn!(dead_letter_id = %id, "Dead letter not found");
        }
        Ok(removed)
    }

    /// Removes every entry. Returns how many were removed.
    pub async fn clear(&self) -> SyncResult<usize> {
        let ids = self.store.smembers(INDEX_KEY).await?;
        let mut keys: Vec<String> = ids.iter().map(|id| entry_key(id)).collect();
        keys.push(INDEX_KEY.to_string());
        self.store.delete(&keys).await?;
        info!(cleared = ids.len(), "Dead letter queue cleared");
        Ok(ids.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keystone_store::MemoryStore;
    use serde_json::json;

    #[tokio::test]
    async fn test_add_list_remove() {
        let dlq = DeadLetterQueue::new(Arc::new(MemoryStore::new()));

        let first = dlq
            .add(DeadLetterOrigin::Bus, "msg-1", json!({ "n": 1 }), "boom", 4)
            .await
            .unwrap();
        dlq.add(DeadLetterOrigin::Transaction, "op-1", json!({}), "graph down", 3)
            .await
            .unwrap();

        assert_eq!(dlq.count().await.unwrap(), 2);

        let entry = dlq.get(&first).await.unwrap().unwrap();
        assert_eq!(entry.reference_id, "msg-1");
        assert_eq!(entry.error_message, "boom");
        assert_eq!(entry.attempts, 4);

        assert_eq!(dlq.find_by_reference("op-1").await.unwrap().len(), 1);
        assert_eq!(dlq.list(1).await.unwrap().len(), 1);

        assert!(dlq.remove(&first).await.unwrap());
        assert!(!dlq.remove(&first).await.unwrap());
        assert_eq!(dlq.clear().await.unwrap(), 1);
        assert_eq!(dlq.count().await.unwrap(), 0);
    }
}
