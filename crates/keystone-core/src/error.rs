//! # Error Types
//!
//! Domain-specific error types for keystone-core.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Error Types                                     │
//! │                                                                         │
//! │  keystone-core errors (this file)                                      │
//! │  ├── CoreError        - Parsing and validation of domain values        │
//! │  └── DependencyError  - Structural problems in a transaction's DAG     │
//! │                                                                         │
//! │  keystone-store errors (separate crate)                                │
//! │  └── StoreError       - Cache / graph / warehouse / vector failures    │
//! │                                                                         │
//! │  keystone-sync errors (separate crate)                                 │
//! │  └── SyncError        - What callers of the engine see                 │
//! │                                                                         │
//! │  Flow: DependencyError → SyncError::DependencyCycle / UnknownDependency│
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use thiserror::Error;

// =============================================================================
// Core Error
// =============================================================================

/// Errors raised while parsing or validating domain values.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// A store name did not match any known data source.
    #[error("Unknown data source: '{0}'. Valid options: cache, graph, warehouse, vector")]
    UnknownDataSource(String),

    /// A sync operation name was not recognized.
    #[error("Unknown sync operation: '{0}'. Valid options: create, update, delete, refresh")]
    UnknownSyncOperation(String),

    /// A priority name was not recognized.
    #[error("Unknown priority: '{0}'. Valid options: critical, high, normal, low, background")]
    UnknownPriority(String),

    /// A conflict strategy name was not recognized.
    #[error("Unknown conflict strategy: '{0}'. Valid options: last_write_wins, highest_confidence, manual")]
    UnknownStrategy(String),

    /// A persisted status string could not be parsed.
    #[error("Unknown {kind} status: '{value}'")]
    UnknownStatus { kind: &'static str, value: String },

    /// An operation payload is missing a required field.
    ///
    /// ## When This Occurs
    /// - A relationship operation without `start_node_id` / `end_node_id`
    /// - A relationship operation without a `type`
    #[error("Operation {operation_id} is missing field '{field}'")]
    MissingField { operation_id: String, field: String },
}

// =============================================================================
// Dependency Error
// =============================================================================

/// Structural problems in a transaction's dependency graph.
///
/// Both variants are detected before any operation is applied, so a
/// transaction rejected with one of these has no partial effects.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DependencyError {
    /// The dependency edges contain a cycle.
    ///
    /// ## Example
    /// ```text
    /// op-a ──depends on──► op-b ──depends on──► op-a
    ///
    /// Cycle { path: ["op-a", "op-b", "op-a"] }
    /// ```
    #[error("Dependency cycle detected: {}", path.join(" -> "))]
    Cycle { path: Vec<String> },

    /// An operation depends on an id that is not part of the same transaction.
    #[error("Operation {operation_id} depends on unknown operation {dependency_id}")]
    Unknown {
        operation_id: String,
        dependency_id: String,
    },
}

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycle_display_lists_path() {
        let err = DependencyError::Cycle {
            path: vec!["a".into(), "b".into(), "a".into()],
        };
        assert_eq!(err.to_string(), "Dependency cycle detected: a -> b -> a");
    }

    #[test]
    fn test_unknown_dependency_display() {
        let err = DependencyError::Unknown {
            operation_id: "op-2".into(),
            dependency_id: "op-9".into(),
        };
        assert!(err.to_string().contains("op-2"));
        assert!(err.to_string().contains("op-9"));
    }
}
