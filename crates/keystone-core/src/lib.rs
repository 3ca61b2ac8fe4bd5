//! # keystone-core: Pure Coordination Logic for Keystone
//!
//! This crate holds the rules every Keystone process agrees on, as pure
//! functions with zero I/O dependencies.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Keystone Architecture                            │
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                    Producers                                    │   │
//! │  │    publish_change ──► begin / add_operation / commit           │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │               keystone-sync (engine services)                   │   │
//! │  │    locks, event bus, coordinator, writer, retries               │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │               ★ keystone-core (THIS CRATE) ★                    │   │
//! │  │                                                                 │   │
//! │  │   ┌───────────┐  ┌───────────┐  ┌───────────┐  ┌───────────┐  │   │
//! │  │   │   types   │  │    dag    │  │  routing  │  │ resolver  │  │   │
//! │  │   │ SyncEvent │  │ validate  │  │ matrix    │  │ LWW       │  │   │
//! │  │   │ Operation │  │ ordering  │  │ cache TTL │  │ confidence│  │   │
//! │  │   └───────────┘  └───────────┘  └───────────┘  └───────────┘  │   │
//! │  │                                                                 │   │
//! │  │   NO I/O • NO STORES • NO TIMERS • PURE FUNCTIONS              │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │                    keystone-store (adapters)                    │   │
//! │  │          cache (Redis / memory), graph, warehouse, vector       │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`types`] - Domain types (SyncEvent, Operation, VersionVector, etc.)
//! - [`dag`] - Dependency validation and execution order of operations
//! - [`hashing`] - Canonical content hashes and field diffs
//! - [`routing`] - Routing matrix, cache rules, authoritative sources
//! - [`resolver`] - Conflict detection and resolution strategies
//! - [`error`] - Domain error types
//!
//! ## Example Usage
//!
//! ```rust
//! use keystone_core::routing::RoutingTable;
//! use keystone_core::DataSource;
//!
//! let routes = RoutingTable::default();
//! let targets = routes.targets("context", DataSource::Cache);
//! assert_eq!(targets, &[DataSource::Warehouse]);
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod dag;
pub mod error;
pub mod hashing;
pub mod resolver;
pub mod routing;
pub mod types;

// =============================================================================
// Re-exports for Convenience
// =============================================================================

pub use error::{CoreError, CoreResult, DependencyError};
pub use hashing::{content_hash, find_differences};
pub use resolver::{ConflictCopy, ConflictRecord, ConflictStatus, ConflictStrategy, Resolution};
pub use routing::{AuthoritativeSources, CacheRule, CacheRules, RoutingSpec, RoutingTable};
pub use types::*;
