//! # keystone-store: Store Adapters for Keystone
//!
//! Traits for the four collaborator stores plus their adapters.
//!
//! ## Modules
//! - [`kv`] - Shared cache store (`RedisStore`, `MemoryStore`)
//! - [`graph`] - Property graph with transactional batches
//! - [`warehouse`] - Append-only row store
//! - [`vector`] - Similarity index
//! - [`error`] - Store error types
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use keystone_store::{KeyValueStore, RedisStore};
//! use std::time::Duration;
//!
//! # async fn example() -> keystone_store::StoreResult<()> {
//! let store = RedisStore::connect("redis://127.0.0.1:6379").await?;
//! let acquired = store
//!     .set_nx_ex("lock:orders", "node-1:token", Duration::from_secs(30))
//!     .await?;
//! # Ok(())
//! # }
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod graph;
pub mod kv;
pub mod vector;
pub mod warehouse;

// =============================================================================
// Re-exports
// =============================================================================

pub use error::{StoreError, StoreResult};
pub use graph::{GraphMutation, GraphStore, MemoryGraph, Node, Relationship};
pub use kv::{KeyValueStore, MemoryStore, RedisStore};
pub use vector::{MemoryVectorIndex, ScoredId, VectorRecord, VectorStore};
pub use warehouse::{MemoryWarehouse, Row, WarehouseStore};
