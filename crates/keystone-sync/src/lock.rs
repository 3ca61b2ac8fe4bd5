//! # Lock Service
//!
//! Short-lived, renewable, uniquely-tokened mutual-exclusion locks over
//! abstract resource ids, backed by the shared cache store.
//!
//! ## Key Layout
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  lock:{resource_id}        "{holder_id}:{uuid}"     SET NX PX ttl      │
//! │  lock:meta:{resource_id}   hash                      same ttl          │
//! │                            ├── holder_id                               │
//! │                            ├── acquired_at (RFC 3339)                  │
//! │                            └── ttl (seconds)                           │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Acquire Flow
//! ```text
//! acquire(rid, holder, ttl?, wait)
//!   │
//!   ├── SET NX PX ──► ok ──► write meta ──► remember token locally ──► true
//!   │
//!   └── taken ──► wait=false ──► false
//!                 wait=true  ──► poll every 100 ms until max_wait ──► false
//! ```
//!
//! Release and extend only act when the stored value still equals the token
//! this process received, so a lock that expired and was re-acquired by
//! someone else is never touched. The TTL is the safety net for crashed
//! holders.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use keystone_store::KeyValueStore;

use crate::config::LockSettings;
use crate::error::{ErrorKind, SyncError, SyncResult};

fn lock_key(resource_id: &str) -> String {
    format!("lock:{}", resource_id)
}

fn meta_key(resource_id: &str) -> String {
    format!("lock:meta:{}", resource_id)
}

// =============================================================================
// Types
// =============================================================================

/// Metadata stored alongside a live lock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockInfo {
    pub holder_id: String,
    pub acquired_at: DateTime<Utc>,
    pub ttl_seconds: u64,
}

/// A lock this process holds.
#[derive(Debug, Clone)]
struct LocalLock {
    holder_id: String,
    token: String,
    acquired_at: DateTime<Utc>,
    expires_at: Instant,
    ttl: Duration,
}

/// One entry of [`LockStatistics`].
#[derive(Debug, Clone, Serialize)]
pub struct ActiveLock {
    pub resource_id: String,
    pub holder_id: String,
    pub age_seconds: i64,
    pub ttl_seconds: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct LockStatistics {
    pub active_locks: usize,
    pub locks: Vec<ActiveLock>,
}

/// What one sweep found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub expired_purged: usize,
    pub live_locks: usize,
}

// =============================================================================
// Lock Service
// =============================================================================

/// Distributed lock service. Cheap to clone.
#[derive(Clone)]
pub struct LockService {
    inner: Arc<LockInner>,
}

struct LockInner {
    store: Arc<dyn KeyValueStore>,
    settings: LockSettings,
    local: RwLock<HashMap<String, LocalLock>>,
    sweeper: Mutex<Option<(watch::Sender<bool>, JoinHandle<()>)>>,
}

impl LockService {
    pub fn new(store: Arc<dyn KeyValueStore>, settings: LockSettings) -> Self {
        LockService {
            inner: Arc::new(LockInner {
                store,
                settings,
                local: RwLock::new(HashMap::new()),
                sweeper: Mutex::new(None),
            }),
        }
    }

    pub fn settings(&self) -> &LockSettings {
        &self.inner.settings
    }

    /// Tries to take the lock on `resource_id` for `holder_id`.
    ///
    /// With `wait = true` the call polls until `max_wait_time_seconds` has
    /// elapsed. A timeout returns `Ok(false)`; it is never retried here.
    pub async fn acquire(
        &self,
        resource_id: &str,
        holder_id: &str,
        ttl: Option<Duration>,
        wait: bool,
    ) -> SyncResult<bool> {
        let max_wait = wait.then(|| self.inner.settings.max_wait());
        self.acquire_within(resource_id, holder_id, ttl, max_wait).await
    }

    /// Like [`acquire`](Self::acquire) with an explicit wait budget.
    /// `None` means a single attempt.
    pub async fn acquire_within(
        &self,
        resource_id: &str,
        holder_id: &str,
        ttl: Option<Duration>,
        max_wait: Option<Duration>,
    ) -> SyncResult<bool> {
        let ttl = ttl.unwrap_or_else(|| self.inner.settings.default_ttl());
        let token = format!("{}:{}", holder_id, Uuid::new_v4());
        let key = lock_key(resource_id);
        let started = Instant::now();

        loop {
            if self.inner.store.set_nx_ex(&key, &token, ttl).await? {
                self.record_acquired(resource_id, holder_id, &token, ttl)
                    .await?;
                info!(
                    resource_id = %resource_id,
                    holder_id = %holder_id,
                    ttl_secs = ttl.as_secs(),
                    "Lock acquired"
                );
                return Ok(true);
            }

            let Some(max_wait) = max_wait else {
                debug!(resource_id = %resource_id, holder_id = %holder_id, "Lock busy");
                return Ok(false);
            };

            let elapsed = started.elapsed();
            if elapsed >= max_wait {
                warn!(
                    resource_id = %resource_id,
                    holder_id = %holder_id,
                    waited_ms = elapsed.as_millis() as u64,
                    error_kind = %ErrorKind::LockTimeout,
                    "Timed out waiting for lock"
                );
                return Ok(false);
            }

            let poll = self.inner.settings.poll_interval();
            tokio::time::sleep(poll.min(max_wait - elapsed)).await;
        }
    }

    async fn record_acquired(
        &self,
        resource_id: &str,
        holder_id: &str,
        token: &str,
        ttl: Duration,
    ) -> SyncResult<()> {
        let acquired_at = Utc::now();
        let meta = meta_key(resource_id);
        let fields = vec![
            ("holder_id".to_string(), holder_id.to_string()),
            ("acquired_at".to_string(), acquired_at.to_rfc3339()),
            ("ttl".to_string(), ttl.as_secs().to_string()),
        ];

        let written = async {
            self.inner.store.hset(&meta, &fields).await?;
            self.inner.store.expire(&meta, ttl).await?;
            Ok::<(), keystone_store::StoreError>(())
        }
        .await;

        if let Err(e) = written {
            // Don't leave a lock behind that nobody can describe.
            let _ = self
                .inner
                .store
                .delete_if_equals(&lock_key(resource_id), token, &[meta])
                .await;
            return Err(e.into());
        }

        self.inner.local.write().await.insert(
            resource_id.to_string(),
            LocalLock {
                holder_id: holder_id.to_string(),
                token: token.to_string(),
                acquired_at,
                expires_at: Instant::now() + ttl,
                ttl,
            },
        );
        Ok(())
    }

    /// Releases the lock if `holder_id` holds it through this process.
    ///
    /// Returns `Ok(false)` when the lock is absent or held under another token.
    pub async fn release(&self, resource_id: &str, holder_id: &str) -> SyncResult<bool> {
        let token = {
            let mut local = self.inner.local.write().await;
            let owned = matches!(local.get(resource_id), Some(lock) if lock.holder_id == holder_id);
            if owned {
                local.remove(resource_id).map(|lock| lock.token)
            } else {
                None
            }
        };

        let Some(token) = token else {
            warn!(
                resource_id = %resource_id,
                holder_id = %holder_id,
                error_kind = %ErrorKind::LockNotHeld,
                "Release attempted on a lock this holder does not own"
            );
            return Ok(false);
        };

        let released = self
            .inner
            .store
            .delete_if_equals(&lock_key(resource_id), &token, &[meta_key(resource_id)])
            .await
            .map_err(|e| {
                let err = SyncError::from(e);
                error!(resource_id = %resource_id, error_kind = %err.kind(), ?err, "Lock release failed");
                err
            })?;

        if released {
            info!(resource_id = %resource_id, holder_id = %holder_id, "Lock released");
        } else {
            warn!(
                resource_id = %resource_id,
                holder_id = %holder_id,
                error_kind = %ErrorKind::LockNotHeld,
                "Lock expired or was taken over before release"
            );
        }
        Ok(released)
    }

    /// Resets the expiry of both keys to `additional_ttl`, only while the
    /// stored token still matches.
    pub async fn extend(
        &self,
        resource_id: &str,
        holder_id: &str,
        additional_ttl: Duration,
    ) -> SyncResult<bool> {
        let token = {
            let local = self.inner.local.read().await;
            match local.get(resource_id) {
                Some(lock) if lock.holder_id == holder_id => Some(lock.token.clone()),
                _ => None,
            }
        };

        let Some(token) = token else {
            warn!(
                resource_id = %resource_id,
                holder_id = %holder_id,
                error_kind = %ErrorKind::LockNotHeld,
                "Extend attempted on a lock this holder does not own"
            );
            return Ok(false);
        };

        let meta = meta_key(resource_id);
        let extended = self
            .inner
            .store
            .expire_if_equals(&lock_key(resource_id), &token, additional_ttl, &[meta.clone()])
            .await?;

        if !extended {
            self.inner.local.write().await.remove(resource_id);
            warn!(
                resource_id = %resource_id,
                error_kind = %ErrorKind::LockNotHeld,
                "Lock expired before it could be extended"
            );
            return Ok(false);
        }

        if let Some(lock) = self.inner.local.write().await.get_mut(resource_id) {
            lock.ttl = additional_ttl;
            lock.expires_at = Instant::now() + additional_ttl;
        }
        // Expiry now counts from this call, so the stored ttl is the one just applied.
        self.inner
            .store
            .hset(&meta, &[("ttl".to_string(), additional_ttl.as_secs().to_string())])
            .await?;

        debug!(
            resource_id = %resource_id,
            additional_secs = additional_ttl.as_secs(),
            "Lock extended"
        );
        Ok(true)
    }

    /// Releases every lock `holder_id` holds through this process.
    pub async fn release_all(&self, holder_id: &str) -> SyncResult<usize> {
        let resources: Vec<String> = self
            .inner
            .local
            .read()
            .await
            .iter()
            .filter(|(_, lock)| lock.holder_id == holder_id)
            .map(|(rid, _)| rid.clone())
            .collect();

        let mut released = 0;
        for resource_id in resources {
            if self.release(&resource_id, holder_id).await? {
                released += 1;
            }
        }

        info!(holder_id = %holder_id, released, "Released all locks for holder");
        Ok(released)
    }

    pub async fn is_locked(&self, resource_id: &str) -> SyncResult<bool> {
        Ok(self.inner.store.exists(&lock_key(resource_id)).await?)
    }

    pub async fn get_lock_info(&self, resource_id: &str) -> SyncResult<Option<LockInfo>> {
        let fields = self.inner.store.hget_all(&meta_key(resource_id)).await?;
        let Some(holder_id) = fields.get("holder_id") else {
            return Ok(None);
        };

        let acquired_at = fields
            .get("acquired_at")
            .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
            .map(|t| t.with_timezone(&Utc))
            .ok_or_else(|| {
                SyncError::SerializationFailed(format!(
                    "lock metadata for {} has no valid acquired_at",
                    resource_id
                ))
            })?;

        Ok(Some(LockInfo {
            holder_id: holder_id.clone(),
            acquired_at,
            ttl_seconds: fields
                .get("ttl")
                .and_then(|raw| raw.parse().ok())
                .unwrap_or(0),
        }))
    }

    /// Locks this process currently holds.
    pub async fn statistics(&self) -> LockStatistics {
        let now = Utc::now();
        let local = self.inner.local.read().await;
        let mut locks: Vec<ActiveLock> = local
            .iter()
            .map(|(rid, lock)| ActiveLock {
                resource_id: rid.clone(),
                holder_id: lock.holder_id.clone(),
                age_seconds: (now - lock.acquired_at).num_seconds(),
                ttl_seconds: lock.ttl.as_secs(),
            })
            .collect();
        locks.sort_by(|a, b| a.resource_id.cmp(&b.resource_id));

        LockStatistics {
            active_locks: locks.len(),
            locks,
        }
    }

    // =========================================================================
    // Sweeper
    // =========================================================================

    /// One pass: forget expired local locks and count live ones in the store.
    pub async fn sweep(&self) -> SyncResult<SweepReport> {
        let now = Instant::now();
        let expired_purged = {
            let mut local = self.inner.local.write().await;
            let before = local.len();
            local.retain(|_, lock| lock.expires_at > now);
            before - local.len()
        };
        if expired_purged > 0 {
            debug!(expired_purged, "Purged expired local locks");
        }

        let live_locks = self.inner.store.scan_keys("lock:meta:*").await?.len();
        if live_locks > self.inner.settings.high_lock_count_threshold {
            warn!(
                live_locks,
                threshold = self.inner.settings.high_lock_count_threshold,
                "High number of live locks, possible deadlock risk"
            );
        }

        Ok(SweepReport {
            expired_purged,
            live_locks,
        })
    }

    /// Starts the background sweep. Calling it twice is a no-op.
    pub async fn start_sweeper(&self) {
        let mut slot = self.inner.sweeper.lock().await;
        if slot.is_some() {
            return;
        }

        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let service = self.clone();
        let period = self.inner.settings.sweep_interval();

        let handle = tokio::spawn(async move {
            info!(interval_secs = period.as_secs(), "Lock sweeper starting");
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = service.sweep().await {
                            error!(error_kind = %e.kind(), ?e, "Lock sweep failed");
                        }
                    }
                    _ = shutdown_rx.changed() => break,
                }
            }
            info!("Lock sweeper stopped");
        });

        *slot = Some((shutdown_tx, handle));
    }

    pub async fn stop_sweeper(&self) {
        let running = self.inner.sweeper.lock().await.take();
        if let Some((shutdown_tx, handle)) = running {
            let _ = shutdown_tx.send(true);
            if let Err(e) = handle.await {
                error!(?e, "Lock sweeper task panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keystone_store::MemoryStore;

    fn service(settings: LockSettings) -> LockService {
        LockService::new(Arc::new(MemoryStore::new()), settings)
    }

    #[tokio::test]
    async fn test_concurrent_acquires_have_one_winner() {
        let locks = service(LockSettings::default());

        let mut tasks = Vec::new();
        for i in 0..10 {
            let locks = locks.clone();
            tasks.push(tokio::spawn(async move {
                locks
                    .acquire("orders", &format!("holder-{}", i), None, false)
                    .await
                    .unwrap()
            }));
        }

        let mut winners = 0;
        for task in tasks {
            if task.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
        assert!(locks.is_locked("orders").await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_lock_expires_after_ttl() {
        let locks = service(LockSettings::default());
        let ttl = Some(Duration::from_secs(2));

        assert!(locks.acquire("r", "a", ttl, false).await.unwrap());
        assert!(!locks.acquire("r", "b", None, false).await.unwrap());

        tokio::time::sleep(Duration::from_millis(2100)).await;
        assert!(locks.acquire("r", "b", None, false).await.unwrap());
        assert_eq!(locks.get_lock_info("r").await.unwrap().unwrap().holder_id, "b");
    }

    #[tokio::test(start_paused = true)]
    async fn test_waiting_acquire_times_out() {
        let locks = service(LockSettings {
            max_wait_time_seconds: 1,
            ..LockSettings::default()
        });
        assert!(locks.acquire("r", "a", None, false).await.unwrap());

        let started = Instant::now();
        assert!(!locks.acquire("r", "b", None, true).await.unwrap());
        assert!(started.elapsed() >= Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_waiting_acquire_succeeds_after_expiry() {
        let locks = service(LockSettings::default());
        assert!(locks
            .acquire("r", "a", Some(Duration::from_secs(1)), false)
            .await
            .unwrap());
        assert!(locks.acquire("r", "b", None, true).await.unwrap());
    }

    #[tokio::test]
    async fn test_release_requires_holder() {
        let locks = service(LockSettings::default());
        assert!(locks.acquire("r", "a", None, false).await.unwrap());

        assert!(!locks.release("r", "b").await.unwrap());
        assert!(locks.is_locked("r").await.unwrap());

        assert!(locks.release("r", "a").await.unwrap());
        assert!(!locks.is_locked("r").await.unwrap());
        assert!(locks.get_lock_info("r").await.unwrap().is_none());
        assert!(!locks.release("r", "a").await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_extend_keeps_lock_alive() {
        let locks = service(LockSettings::default());
        assert!(locks
            .acquire("r", "a", Some(Duration::from_secs(2)), false)
            .await
            .unwrap());

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(locks.extend("r", "a", Duration::from_secs(5)).await.unwrap());
        assert!(!locks.extend("r", "b", Duration::from_secs(5)).await.unwrap());

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(locks.is_locked("r").await.unwrap());
        assert_eq!(locks.get_lock_info("r").await.unwrap().unwrap().ttl_seconds, 5);
        assert_eq!(locks.statistics().await.locks[0].ttl_seconds, 5);

        tokio::time::sleep(Duration::from_millis(2100)).await;
        assert!(!locks.is_locked("r").await.unwrap());
    }

    #[tokio::test]
    async fn test_release_all_and_statistics() {
        let locks = service(LockSettings::default());
        for rid in ["a", "b", "c"] {
            assert!(locks.acquire(rid, "worker", None, false).await.unwrap());
        }
        assert!(locks.acquire("d", "other", None, false).await.unwrap());

        let stats = locks.statistics().await;
        assert_eq!(stats.active_locks, 4);

        assert_eq!(locks.release_all("worker").await.unwrap(), 3);
        assert_eq!(locks.statistics().await.active_locks, 1);
        assert!(locks.is_locked("d").await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_purges_expired_and_counts_live() {
        let locks = service(LockSettings {
            high_lock_count_threshold: 1,
            ..LockSettings::default()
        });
        assert!(locks
            .acquire("short", "a", Some(Duration::from_secs(1)), false)
            .await
            .unwrap());
        assert!(locks.acquire("long-1", "a", None, false).await.unwrap());
        assert!(locks.acquire("long-2", "a", None, false).await.unwrap());

        tokio::time::sleep(Duration::from_secs(2)).await;
        let report = locks.sweep().await.unwrap();
        assert_eq!(report.expired_purged, 1);
        assert_eq!(report.live_locks, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_lifecycle() {
        let locks = service(LockSettings::default());
        locks.start_sweeper().await;
        locks.start_sweeper().await;
        tokio::time::sleep(Duration::from_secs(6)).await;
        locks.stop_sweeper().await;
    }
}
