//! # keystone-sync: Cross-Store Coordination Engine
//!
//! Keeps one logical entity consistent across the cache, the graph, the
//! warehouse and the vector index.
//!
//! ## Architecture Overview
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Coordination Engine                              │
//! │                                                                         │
//! │  ┌──────────────────────────────────────────────────────────────────┐  │
//! │  │                   Engine (Main Orchestrator)                     │  │
//! │  │                                                                  │  │
//! │  │  Built from EngineConfig, owns every component below            │  │
//! │  └────────────────────────────┬─────────────────────────────────────┘  │
//! │                               │                                         │
//! │         ┌─────────────────────┼─────────────────────┐                  │
//! │         ▼                     ▼                     ▼                   │
//! │  ┌────────────────┐  ┌────────────────┐  ┌────────────────────────┐    │
//! │  │  LockService   │  │   EventBus     │  │ ConsistencyCoordinator │    │
//! │  │                │  │                │  │                        │    │
//! │  │ TTL locks in   │  │ Priority queue │  │ Version vectors        │    │
//! │  │ the shared     │  │ Delayed/batch  │  │ Fan-out to targets     │    │
//! │  │ store, sweeper │  │ Retry + DLQ    │  │ Conflict resolution    │    │
//! │  └────────────────┘  └────────────────┘  └────────────────────────┘    │
//! │                                                                         │
//! │  ┌────────────────┐  ┌────────────────┐  ┌────────────────────────┐    │
//! │  │ Transactional  │  │  RetryQueue    │  │  MaintenanceWorker     │    │
//! │  │ Writer         │  │                │  │                        │    │
//! │  │                │  │ Exponential    │  │ Drains retry queues    │    │
//! │  │ DAG-ordered    │  │ backoff, dead  │  │ Expires transactions   │    │
//! │  │ graph commits  │  │ letters        │  │ Backlog warnings       │    │
//! │  └────────────────┘  └────────────────┘  └────────────────────────┘    │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Organization
//! - [`engine`] - Main `Engine` orchestrator and builder
//! - [`config`] - Engine configuration (TOML + environment)
//! - [`error`] - Sync error types
//! - [`lock`] - Distributed lock service
//! - [`bus`] - Event bus with priorities, batching and dead letters
//! - [`coordinator`] - Consistency coordinator
//! - [`targets`] - Per-store sync adapters
//! - [`writer`] - Transactional graph writer
//! - [`retry`] - Retry queues and backoff policy
//! - [`dead_letter`] - Dead-letter store
//! - [`maintenance`] - Periodic housekeeping
//!
//! ## Usage
//!
//! ```rust,ignore
//! use keystone_sync::{EngineBuilder, EngineConfig};
//!
//! let config = EngineConfig::load_or_default(None);
//! let mut engine = EngineBuilder::new(config).build().await?;
//! engine.start().await?;
//!
//! engine
//!     .coordinator()
//!     .publish_change(DataSource::Cache, SyncOperation::Update, "task", "t1", data)
//!     .await?;
//!
//! let status = engine.status().await?;
//! println!("Pending retries: {}", status.coordinator.pending_retries);
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod bus;
pub mod config;
pub mod coordinator;
pub mod dead_letter;
pub mod engine;
pub mod error;
pub mod lock;
pub mod maintenance;
pub mod retry;
pub mod targets;
pub mod writer;

// =============================================================================
// Re-exports
// =============================================================================

pub use bus::{
    batch_handler_fn, handler_fn, BatchHandler, BusStats, EventBus, EventHandler, Message,
    QueueStatus,
};
pub use config::{
    BusSettings, EngineConfig, LockSettings, MaintenanceSettings, NodeConfig, StoreBackend,
    StoreSettings, SyncSettings, TransactionSettings,
};
pub use coordinator::{ConsistencyCoordinator, CoordinatorStats, SyncLogEntry, TargetResult};
pub use dead_letter::{DeadLetter, DeadLetterOrigin, DeadLetterQueue};
pub use engine::{connect_store, Engine, EngineBuilder, EngineStatus};
pub use error::{ErrorKind, SyncError, SyncResult};
pub use lock::{ActiveLock, LockInfo, LockService, LockStatistics, SweepReport};
pub use maintenance::{MaintenanceHandle, MaintenanceReport, MaintenanceWorker};
pub use retry::{RetryItem, RetryPolicy, RetryQueue, RetryRecord, RetryReport};
pub use targets::{
    scoped_id, ApplyOutcome, CacheTarget, GraphTarget, SyncTarget, VectorTarget, WarehouseTarget,
};
pub use writer::{TransactionInfo, TransactionalWriter};
