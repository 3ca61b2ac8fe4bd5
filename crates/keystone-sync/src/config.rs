//! # Engine Configuration
//!
//! Configuration management for the coordination engine.
//!
//! ## Configuration Sources
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Configuration Priority                               │
//! │                                                                         │
//! │  1. Environment Variables (highest priority)                           │
//! │     KEYSTONE_STORE_BACKEND=redis                                       │
//! │     KEYSTONE_REDIS_URL=redis://cache:6379                              │
//! │                                                                         │
//! │  2. TOML Config File                                                   │
//! │     ~/.config/keystone/keystone.toml (Linux)                           │
//! │     ~/Library/Application Support/com.keystone.keystone/... (macOS)    │
//! │                                                                         │
//! │  3. Default Values (lowest priority)                                   │
//! │     In-memory store, last-write-wins, default routing matrix           │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Configuration File Format
//! ```toml
//! [node]
//! id = "coordinator-1"
//!
//! [store]
//! backend = "redis"          # memory | redis
//! redis_url = "redis://127.0.0.1:6379"
//! in_memory_collaborators = false
//!
//! [locks]
//! default_ttl_seconds = 30
//! max_wait_time_seconds = 60
//! deadlock_detection_interval = 5
//!
//! [bus]
//! max_retries = 3
//! retry_delay = 1.0
//! max_retry_delay = 300.0
//! exponential_backoff = true
//! max_batch_size = 100
//! max_batch_wait_time = 5.0
//!
//! [sync]
//! conflict_resolution_strategy = "last_write_wins"
//!
//! [sync.cache_ttl_by_entity_type.knowledge]
//! ttl_seconds = 3600
//! refresh_on_update = true
//! ```

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use keystone_core::{
    AuthoritativeSources, CacheRule, CacheRules, ConflictStrategy, DataSource, Priority,
    RoutingSpec, RoutingTable,
};

use crate::error::{SyncError, SyncResult};

// =============================================================================
// Store Backend
// =============================================================================

/// Backend of the shared cache store. Picked once at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    /// In-process store. Single node only; state dies with the process.
    #[default]
    Memory,

    /// Redis. Required for more than one coordinator process.
    Redis,
}

impl std::fmt::Display for StoreBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreBackend::Memory => write!(f, "memory"),
            StoreBackend::Redis => write!(f, "redis"),
        }
    }
}

impl std::str::FromStr for StoreBackend {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "memory" | "in-memory" | "inmemory" => Ok(StoreBackend::Memory),
            "redis" => Ok(StoreBackend::Redis),
            other => Err(SyncError::InvalidConfig(format!(
                "Unknown store backend: '{}'. Valid options: memory, redis",
                other
            ))),
        }
    }
}

// =============================================================================
// Node Configuration
// =============================================================================

/// Identity of this coordinator process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Reported in status and logs. Auto-generated if not provided.
    pub id: String,

    #[serde(default = "default_node_name")]
    pub name: String,
}

fn default_node_name() -> String {
    "keystone-node".to_string()
}

impl Default for NodeConfig {
    fn default() -> Self {
        NodeConfig {
            id: Uuid::new_v4().to_string(),
            name: default_node_name(),
        }
    }
}

// =============================================================================
// Store Settings
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreSettings {
    #[serde(default)]
    pub backend: StoreBackend,

    /// Only read when `backend = "redis"`.
    #[serde(default = "default_redis_url")]
    pub redis_url: String,

    /// Lets a redis-backed engine fall back to process-local graph,
    /// warehouse and vector stores. Off by default: with redis every
    /// collaborator must be injected unless this is set.
    #[serde(default)]
    pub in_memory_collaborators: bool,
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

impl Default for StoreSettings {
    fn default() -> Self {
        StoreSettings {
            backend: StoreBackend::default(),
            redis_url: default_redis_url(),
            in_memory_collaborators: false,
        }
    }
}

// =============================================================================
// Lock Settings
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockSettings {
    /// TTL applied when `acquire` is called without one.
    #[serde(default = "default_lock_ttl")]
    pub default_ttl_seconds: u64,

    /// Upper bound on a waiting `acquire`.
    #[serde(default = "default_max_wait")]
    pub max_wait_time_seconds: u64,

    /// Period of the background sweep (seconds).
    #[serde(default = "default_deadlock_interval")]
    pub deadlock_detection_interval: u64,

    #[serde(default = "default_lock_poll_interval")]
    pub poll_interval_ms: u64,

    /// Live lock count above which the sweep warns.
    #[serde(default = "default_high_lock_count")]
    pub high_lock_count_threshold: usize,
}

fn default_lock_ttl() -> u64 {
    30
}
fn default_max_wait() -> u64 {
    60
}
fn default_deadlock_interval() -> u64 {
    5
}
fn default_lock_poll_interval() -> u64 {
    100
}
fn default_high_lock_count() -> usize {
    10
}

impl Default for LockSettings {
    fn default() -> Self {
        LockSettings {
            default_ttl_seconds: default_lock_ttl(),
            max_wait_time_seconds: default_max_wait(),
            deadlock_detection_interval: default_deadlock_interval(),
            poll_interval_ms: default_lock_poll_interval(),
            high_lock_count_threshold: default_high_lock_count(),
        }
    }
}

impl LockSettings {
    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.default_ttl_seconds)
    }

    pub fn max_wait(&self) -> Duration {
        Duration::from_secs(self.max_wait_time_seconds)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.deadlock_detection_interval)
    }
}

// =============================================================================
// Bus Settings
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusSettings {
    /// Retries after the first failed delivery.
    #[serde(default = "default_bus_max_retries")]
    pub max_retries: u32,

    /// Base retry delay (seconds).
    #[serde(default = "default_retry_delay")]
    pub retry_delay: f64,

    /// Ceiling on the backed-off delay (seconds).
    #[serde(default = "default_bus_max_retry_delay")]
    pub max_retry_delay: f64,

    #[serde(default = "default_true")]
    pub exponential_backoff: bool,

    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,

    /// Longest a partial batch waits before flushing (seconds).
    #[serde(default = "default_max_batch_wait")]
    pub max_batch_wait_time: f64,

    #[serde(default = "default_max_concurrent_batches")]
    pub max_concurrent_batches: usize,

    /// Tick of the scheduled-message loop.
    #[serde(default = "default_scheduler_interval")]
    pub scheduler_interval_ms: u64,

    /// Messages older than this are expired instead of delivered. 0 disables.
    #[serde(default = "default_message_ttl")]
    pub message_ttl_seconds: u64,

    /// Queued depth above which publishers are warned.
    #[serde(default = "default_backpressure_threshold")]
    pub backpressure_threshold: usize,
}

fn default_true() -> bool {
    true
}
fn default_bus_max_retries() -> u32 {
    3
}
fn default_retry_delay() -> f64 {
    1.0
}
fn default_bus_max_retry_delay() -> f64 {
    300.0
}
fn default_max_batch_size() -> usize {
    100
}
fn default_max_batch_wait() -> f64 {
    5.0
}
fn default_max_concurrent_batches() -> usize {
    5
}
fn default_scheduler_interval() -> u64 {
    100
}
fn default_message_ttl() -> u64 {
    3600
}
fn default_backpressure_threshold() -> usize {
    10_000
}

impl Default for BusSettings {
    fn default() -> Self {
        BusSettings {
            max_retries: default_bus_max_retries(),
            retry_delay: default_retry_delay(),
            max_retry_delay: default_bus_max_retry_delay(),
            exponential_backoff: true,
            max_batch_size: default_max_batch_size(),
            max_batch_wait_time: default_max_batch_wait(),
            max_concurrent_batches: default_max_concurrent_batches(),
            scheduler_interval_ms: default_scheduler_interval(),
            message_ttl_seconds: default_message_ttl(),
            backpressure_threshold: default_backpressure_threshold(),
        }
    }
}

/// Upper bound accepted for `bus.max_retries`.
pub const MAX_BUS_RETRIES: u32 = 20;

/// Upper bound accepted for `bus.max_retry_delay` (seconds).
pub const MAX_BUS_RETRY_DELAY: f64 = 86_400.0;

impl BusSettings {
    /// Delay before retry number `attempt` (1-based), never above
    /// `max_retry_delay`.
    pub fn retry_delay_for(&self, attempt: u32) -> Duration {
        let ceiling = Duration::try_from_secs_f64(self.max_retry_delay.max(0.0))
            .unwrap_or(Duration::MAX);
        let base = self.retry_delay.max(0.0);
        let secs = if self.exponential_backoff {
            let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
            base * 2f64.powi(exponent)
        } else {
            base
        };
        Duration::try_from_secs_f64(secs)
            .unwrap_or(ceiling)
            .min(ceiling)
    }

    pub fn batch_wait(&self) -> Duration {
        Duration::from_secs_f64(self.max_batch_wait_time.max(0.0))
    }

    pub fn scheduler_interval(&self) -> Duration {
        Duration::from_millis(self.scheduler_interval_ms.max(1))
    }

    pub fn message_ttl(&self) -> Option<Duration> {
        (self.message_ttl_seconds > 0).then(|| Duration::from_secs(self.message_ttl_seconds))
    }
}

// =============================================================================
// Sync Settings
// =============================================================================

/// Coordinator behaviour.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncSettings {
    #[serde(default)]
    pub conflict_resolution_strategy: ConflictStrategy,

    /// Bus topic carrying sync events.
    #[serde(default = "default_topic")]
    pub topic: String,

    #[serde(default)]
    pub event_priority: Priority,

    /// Cache TTL for entity types without a rule.
    #[serde(default = "default_cache_ttl")]
    pub default_cache_ttl_seconds: u64,

    /// Base delay of the per-target retry queue (seconds).
    #[serde(default = "default_target_retry_delay")]
    pub retry_base_delay_seconds: u64,

    #[serde(default = "default_target_retry_attempts")]
    pub retry_max_attempts: u32,

    #[serde(default = "default_retry_record_ttl")]
    pub retry_record_ttl_seconds: u64,

    /// Entries kept in the in-memory sync log.
    #[serde(default = "default_sync_log_capacity")]
    pub sync_log_capacity: usize,

    #[serde(default = "default_cache_rules")]
    pub cache_ttl_by_entity_type: BTreeMap<String, CacheRule>,

    #[serde(default = "default_authoritative_sources")]
    pub authoritative_sources: BTreeMap<String, DataSource>,

    /// entity type → source → targets
    #[serde(default = "default_routing")]
    pub routing: RoutingSpec,
}

fn default_topic() -> String {
    "data_sync".to_string()
}
fn default_cache_ttl() -> u64 {
    3600
}
fn default_target_retry_delay() -> u64 {
    30
}
fn default_target_retry_attempts() -> u32 {
    5
}
fn default_retry_record_ttl() -> u64 {
    3600
}
fn default_sync_log_capacity() -> usize {
    1000
}
fn default_cache_rules() -> BTreeMap<String, CacheRule> {
    CacheRules::default().rules
}
fn default_authoritative_sources() -> BTreeMap<String, DataSource> {
    AuthoritativeSources::default().by_entity_type
}
fn default_routing() -> RoutingSpec {
    RoutingTable::default().to_spec()
}

impl Default for SyncSettings {
    fn default() -> Self {
        SyncSettings {
            conflict_resolution_strategy: ConflictStrategy::default(),
            topic: default_topic(),
            event_priority: Priority::default(),
            default_cache_ttl_seconds: default_cache_ttl(),
            retry_base_delay_seconds: default_target_retry_delay(),
            retry_max_attempts: default_target_retry_attempts(),
            retry_record_ttl_seconds: default_retry_record_ttl(),
            sync_log_capacity: default_sync_log_capacity(),
            cache_ttl_by_entity_type: default_cache_rules(),
            authoritative_sources: default_authoritative_sources(),
            routing: default_routing(),
        }
    }
}

impl SyncSettings {
    pub fn cache_rules(&self) -> CacheRules {
        CacheRules {
            rules: self.cache_ttl_by_entity_type.clone(),
            default_ttl_seconds: self.default_cache_ttl_seconds,
        }
    }

    pub fn routing_table(&self) -> SyncResult<RoutingTable> {
        Ok(RoutingTable::from_spec(&self.routing)?)
    }

    pub fn authoritative(&self) -> AuthoritativeSources {
        AuthoritativeSources {
            by_entity_type: self.authoritative_sources.clone(),
            fallback: DataSource::Graph,
        }
    }
}

// =============================================================================
// Transaction Settings
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionSettings {
    /// Lifetime of `transaction:{id}` and `operation:{tx}:{op}` records.
    #[serde(default = "default_transaction_ttl")]
    pub ttl_seconds: u64,

    /// Upper bound on the retry budget of any operation.
    #[serde(default = "default_operation_retries")]
    pub max_retries: u32,

    /// Cap on the requeue backoff (seconds).
    #[serde(default = "default_max_retry_delay")]
    pub max_retry_delay_seconds: u64,
}

fn default_transaction_ttl() -> u64 {
    3600
}
fn default_operation_retries() -> u32 {
    3
}
fn default_max_retry_delay() -> u64 {
    300
}

impl Default for TransactionSettings {
    fn default() -> Self {
        TransactionSettings {
            ttl_seconds: default_transaction_ttl(),
            max_retries: default_operation_retries(),
            max_retry_delay_seconds: default_max_retry_delay(),
        }
    }
}

impl TransactionSettings {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_seconds)
    }
}

// =============================================================================
// Maintenance Settings
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MaintenanceSettings {
    /// Period of the retry-processing loop (seconds).
    #[serde(default = "default_maintenance_interval")]
    pub interval_seconds: u64,

    /// Period of the expired-transaction cleanup (seconds).
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_seconds: u64,

    #[serde(default = "default_retry_backlog_warning")]
    pub retry_backlog_warning: usize,

    #[serde(default = "default_conflict_backlog_warning")]
    pub conflict_backlog_warning: usize,
}

fn default_maintenance_interval() -> u64 {
    30
}
fn default_cleanup_interval() -> u64 {
    300
}
fn default_retry_backlog_warning() -> usize {
    100
}
fn default_conflict_backlog_warning() -> usize {
    10
}

impl Default for MaintenanceSettings {
    fn default() -> Self {
        MaintenanceSettings {
            interval_seconds: default_maintenance_interval(),
            cleanup_interval_seconds: default_cleanup_interval(),
            retry_backlog_warning: default_retry_backlog_warning(),
            conflict_backlog_warning: default_conflict_backlog_warning(),
        }
    }
}

// =============================================================================
// Main Engine Configuration
// =============================================================================

/// Complete engine configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub node: NodeConfig,

    #[serde(default)]
    pub store: StoreSettings,

    #[serde(default)]
    pub locks: LockSettings,

    #[serde(default)]
    pub bus: BusSettings,

    #[serde(default)]
    pub sync: SyncSettings,

    #[serde(default)]
    pub transactions: TransactionSettings,

    #[serde(default)]
    pub maintenance: MaintenanceSettings,
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads configuration from file, environment, and defaults.
    ///
    /// ## Load Order (later overrides earlier)
    /// 1. Default values
    /// 2. Config file (keystone.toml)
    /// 3. Environment variables
    pub fn load(config_path: Option<PathBuf>) -> SyncResult<Self> {
        let mut config = Self::default();

        if let Some(path) = config_path.or_else(Self::default_config_path) {
            if path.exists() {
                info!(?path, "Loading engine config from file");
                let contents = std::fs::read_to_string(&path)
                    .map_err(|e| SyncError::ConfigLoadFailed(e.to_string()))?;
                config = toml::from_str(&contents)?;
            } else {
                debug!(?path, "Config file not found, using defaults");
            }
        }

        config.apply_env_overrides();
        config.validate()?;

        Ok(config)
    }

    /// Loads config or returns default if load fails.
    pub fn load_or_default(config_path: Option<PathBuf>) -> Self {
        Self::load(config_path).unwrap_or_else(|e| {
            warn!(error_kind = %e.kind(), "Failed to load engine config: {}. Using defaults.", e);
            Self::default()
        })
    }

    /// Saves configuration to file.
    pub fn save(&self, config_path: Option<PathBuf>) -> SyncResult<()> {
        let path = config_path
            .or_else(Self::default_config_path)
            .ok_or_else(|| SyncError::ConfigSaveFailed("No config path available".into()))?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| SyncError::ConfigSaveFailed(e.to_string()))?;
        }

        let contents = toml::to_string_pretty(self)?;
        std::fs::write(&path, contents).map_err(|e| SyncError::ConfigSaveFailed(e.to_string()))?;

        info!(?path, "Engine config saved");
        Ok(())
    }

    /// Validates the configuration.
    pub fn validate(&self) -> SyncResult<()> {
        if self.node.id.is_empty() {
            return Err(SyncError::InvalidConfig("node.id must not be empty".into()));
        }

        if self.store.backend == StoreBackend::Redis
            && !self.store.redis_url.starts_with("redis://")
            && !self.store.redis_url.starts_with("rediss://")
        {
            return Err(SyncError::InvalidConfig(format!(
                "store.redis_url must start with redis:// or rediss://, got: {}",
                self.store.redis_url
            )));
        }

        if self.locks.default_ttl_seconds == 0 {
            return Err(SyncError::InvalidConfig(
                "locks.default_ttl_seconds must be greater than 0".into(),
            ));
        }

        if self.locks.poll_interval_ms == 0 || self.locks.deadlock_detection_interval == 0 {
            return Err(SyncError::InvalidConfig(
                "locks.poll_interval_ms and locks.deadlock_detection_interval must be greater than 0"
                    .into(),
            ));
        }

        if !self.bus.retry_delay.is_finite() || self.bus.retry_delay < 0.0 {
            return Err(SyncError::InvalidConfig(
                "bus.retry_delay must be a non-negative number".into(),
            ));
        }

        if !(self.bus.retry_delay..=MAX_BUS_RETRY_DELAY).contains(&self.bus.max_retry_delay) {
            return Err(SyncError::InvalidConfig(format!(
                "bus.max_retry_delay must be between bus.retry_delay and {}",
                MAX_BUS_RETRY_DELAY
            )));
        }

        if self.bus.max_retries > MAX_BUS_RETRIES {
            return Err(SyncError::InvalidConfig(format!(
                "bus.max_retries must be at most {}, got: {}",
                MAX_BUS_RETRIES, self.bus.max_retries
            )));
        }

        if !self.bus.max_batch_wait_time.is_finite() || self.bus.max_batch_wait_time < 0.0 {
            return Err(SyncError::InvalidConfig(
                "bus.max_batch_wait_time must be a non-negative number".into(),
            ));
        }

        if self.bus.max_batch_size == 0 || self.bus.max_concurrent_batches == 0 {
            return Err(SyncError::InvalidConfig(
                "bus.max_batch_size and bus.max_concurrent_batches must be greater than 0".into(),
            ));
        }

        if self.sync.topic.is_empty() {
            return Err(SyncError::InvalidConfig("sync.topic must not be empty".into()));
        }

        self.sync.routing_table()?;

        Ok(())
    }

    /// Applies environment variable overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(id) = std::env::var("KEYSTONE_NODE_ID") {
            debug!(node_id = %id, "Overriding node ID from environment");
            self.node.id = id;
        }

        if let Ok(backend) = std::env::var("KEYSTONE_STORE_BACKEND") {
            match backend.parse() {
                Ok(parsed) => {
                    debug!(backend = %backend, "Overriding store backend from environment");
                    self.store.backend = parsed;
                }
                Err(_) => warn!(backend = %backend, "Unknown store backend in environment"),
            }
        }

        if let Ok(url) = std::env::var("KEYSTONE_REDIS_URL") {
            self.store.redis_url = url;
        }

        if let Ok(strategy) = std::env::var("KEYSTONE_CONFLICT_STRATEGY") {
            match strategy.parse() {
                Ok(parsed) => self.sync.conflict_resolution_strategy = parsed,
                Err(_) => warn!(strategy = %strategy, "Unknown conflict strategy in environment"),
            }
        }

        if let Ok(ttl) = std::env::var("KEYSTONE_LOCK_TTL") {
            if let Ok(secs) = ttl.parse::<u64>() {
                self.locks.default_ttl_seconds = secs;
            }
        }

        if let Ok(wait) = std::env::var("KEYSTONE_LOCK_MAX_WAIT") {
            if let Ok(secs) = wait.parse::<u64>() {
                self.locks.max_wait_time_seconds = secs;
            }
        }
    }

    /// Returns the default config file path.
    fn default_config_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("com", "keystone", "keystone")
            .map(|dirs| dirs.config_dir().join("keystone.toml"))
    }

    /// Returns the node ID.
    pub fn node_id(&self) -> &str {
        &self.node.id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_parsing() {
        assert_eq!("memory".parse::<StoreBackend>().unwrap(), StoreBackend::Memory);
        assert_eq!("REDIS".parse::<StoreBackend>().unwrap(), StoreBackend::Redis);
        assert!("etcd".parse::<StoreBackend>().is_err());
    }

    #[test]
    fn test_default_config() {
        let config = EngineConfig::default();
        assert!(!config.node.id.is_empty());
        assert_eq!(config.locks.default_ttl_seconds, 30);
        assert_eq!(config.locks.high_lock_count_threshold, 10);
        assert_eq!(config.bus.max_batch_size, 100);
        assert_eq!(config.transactions.max_retry_delay_seconds, 300);
        assert_eq!(
            config.sync.conflict_resolution_strategy,
            ConflictStrategy::LastWriteWins
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = EngineConfig::default();
        config.store.backend = StoreBackend::Redis;
        config.store.redis_url = "http://localhost".into();
        assert!(config.validate().is_err());

        config.store.redis_url = "redis://localhost:6379".into();
        assert!(config.validate().is_ok());

        config.bus.max_concurrent_batches = 0;
        assert!(config.validate().is_err());

        config.bus.max_concurrent_batches = 5;
        config
            .sync
            .routing
            .entry("note".into())
            .or_default()
            .insert("mainframe".into(), vec![DataSource::Cache]);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_retry_delay_for() {
        let mut bus = BusSettings {
            retry_delay: 0.5,
            ..BusSettings::default()
        };
        assert_eq!(bus.retry_delay_for(1), Duration::from_millis(500));
        assert_eq!(bus.retry_delay_for(3), Duration::from_secs(2));

        bus.exponential_backoff = false;
        assert_eq!(bus.retry_delay_for(3), Duration::from_millis(500));
    }

    #[test]
    fn test_retry_delay_is_capped_for_large_attempts() {
        let bus = BusSettings {
            retry_delay: 1.0,
            max_retry_delay: 120.0,
            ..BusSettings::default()
        };
        assert_eq!(bus.retry_delay_for(7), Duration::from_secs(64));
        assert_eq!(bus.retry_delay_for(8), Duration::from_secs(120));
        assert_eq!(bus.retry_delay_for(80), Duration::from_secs(120));
        assert_eq!(bus.retry_delay_for(u32::MAX), Duration::from_secs(120));
    }

    #[test]
    fn test_unbounded_bus_retries_are_rejected() {
        let mut config = EngineConfig::default();
        config.bus.max_retries = 80;
        assert!(matches!(config.validate(), Err(SyncError::InvalidConfig(_))));

        config.bus.max_retries = MAX_BUS_RETRIES;
        assert!(config.validate().is_ok());

        config.bus.max_retry_delay = 0.5;
        assert!(config.validate().is_err());

        config.bus.max_retry_delay = f64::INFINITY;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("keystone.toml");

        let mut config = EngineConfig::default();
        config.node.id = "coordinator-7".into();
        config.sync.conflict_resolution_strategy = ConflictStrategy::Manual;
        config.bus.retry_delay = 0.25;
        config.save(Some(path.clone())).unwrap();

        let loaded = EngineConfig::load(Some(path)).unwrap();
        assert_eq!(loaded.sync.conflict_resolution_strategy, ConflictStrategy::Manual);
        assert_eq!(loaded.bus.retry_delay, 0.25);
        assert_eq!(loaded.sync.routing, config.sync.routing);
        assert_eq!(
            loaded.sync.cache_ttl_by_entity_type.get("agent").map(|r| r.ttl_seconds),
            Some(300)
        );
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let config: EngineConfig = toml::from_str(
            r#"
            [node]
            id = "n1"

            [bus]
            max_retries = 7
            "#,
        )
        .unwrap();
        assert_eq!(config.bus.max_retries, 7);
        assert_eq!(config.bus.max_batch_size, 100);
        assert_eq!(config.sync.topic, "data_sync");
        assert!(config.sync.routing_table().is_ok());
    }
}
