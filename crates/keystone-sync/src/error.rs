//! # Sync Error Types
//!
//! Error types for the coordination engine.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       Engine Error Categories                           │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────┐ │
//! │  │  Configuration  │  │     Locks       │  │     Stores              │ │
//! │  │                 │  │                 │  │                         │ │
//! │  │  InvalidConfig  │  │  LockTimeout    │  │  SyncTargetUnavailable  │ │
//! │  │  ConfigLoad/Save│  │  LockNotHeld    │  │  StoreFailed            │ │
//! │  └─────────────────┘  └─────────────────┘  └─────────────────────────┘ │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────┐ │
//! │  │  Transactions   │  │     Retry       │  │      Internal           │ │
//! │  │                 │  │                 │  │                         │ │
//! │  │  DependencyCycle│  │  MaxRetries     │  │  SerializationFailed    │ │
//! │  │  UnknownDep     │  │  Exceeded       │  │  HandlerFailed          │ │
//! │  │  RollbackFailed │  │  MessageExpired │  │  ChannelError           │ │
//! │  └─────────────────┘  └─────────────────┘  └─────────────────────────┘ │
//! │                                                                         │
//! │  ConflictDetected is routed to the resolver rather than surfaced.      │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::fmt;

use serde::Serialize;
use thiserror::Error;

use keystone_core::{CoreError, DataSource, DependencyError, TransactionStatus};
use keystone_store::StoreError;

/// Result type alias for engine operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Engine error type covering every failure a caller can observe.
#[derive(Debug, Error)]
pub enum SyncError {
    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Invalid engine configuration.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Failed to load config file.
    #[error("Failed to load config: {0}")]
    ConfigLoadFailed(String),

    /// Failed to save config file.
    #[error("Failed to save config: {0}")]
    ConfigSaveFailed(String),

    // =========================================================================
    // Lock Errors
    // =========================================================================
    /// The lock could not be obtained within the wait budget.
    #[error("Timed out after {waited_ms} ms waiting for lock on {resource_id}")]
    LockTimeout { resource_id: String, waited_ms: u64 },

    /// A release or extend was attempted by someone not holding the lock.
    #[error("Lock on {resource_id} is not held by {holder_id}")]
    LockNotHeld {
        resource_id: String,
        holder_id: String,
    },

    // =========================================================================
    // Store Errors
    // =========================================================================
    /// A target store is temporarily unreachable.
    #[error("Sync target {target} unavailable: {message}")]
    SyncTargetUnavailable { target: String, message: String },

    /// A store rejected a request.
    #[error("Store error: {0}")]
    StoreFailed(String),

    // =========================================================================
    // Conflict Errors
    // =========================================================================
    /// Copies of an entity diverged.
    #[error("Conflict detected for {entity_type}/{entity_id} across {sources:?}")]
    ConflictDetected {
        entity_type: String,
        entity_id: String,
        sources: Vec<DataSource>,
    },

    // =========================================================================
    // Transaction Errors
    // =========================================================================
    /// The operations' dependencies form a cycle.
    #[error("Transaction {transaction_id}: dependency cycle {}", path.join(" -> "))]
    DependencyCycle {
        transaction_id: String,
        path: Vec<String>,
    },

    /// An operation depends on an id outside its transaction.
    #[error("Transaction {transaction_id}: operation {operation_id} depends on unknown operation {dependency_id}")]
    UnknownDependency {
        transaction_id: String,
        operation_id: String,
        dependency_id: String,
    },

    #[error("Transaction not found: {0}")]
    TransactionNotFound(String),

    /// The transaction is not in a state that allows the call.
    #[error("Transaction {transaction_id} is {status}")]
    InvalidTransactionState {
        transaction_id: String,
        status: TransactionStatus,
    },

    /// A compensation failed; the graph may hold partial effects.
    #[error("Rollback of transaction {transaction_id} failed ({reason}); operations: {operations:?}")]
    TransactionRollbackFailed {
        transaction_id: String,
        operations: Vec<String>,
        reason: String,
    },

    /// An operation payload is malformed.
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    // =========================================================================
    // Retry Errors
    // =========================================================================
    /// Retry budget exhausted; the item was dead-lettered.
    #[error("Max retries exceeded for {id} after {attempts} attempts: {last_error}")]
    MaxRetriesExceeded {
        id: String,
        attempts: u32,
        last_error: String,
    },

    /// A message outlived its TTL before delivery.
    #[error("Message {id} expired before delivery")]
    MessageExpired { id: String },

    // =========================================================================
    // Internal Errors
    // =========================================================================
    /// Failed to serialize or deserialize a persisted record.
    #[error("Serialization failed: {0}")]
    SerializationFailed(String),

    /// A subscriber handler returned an error.
    #[error("Handler failed: {0}")]
    HandlerFailed(String),

    /// Channel send/receive failed.
    #[error("Channel error: {0}")]
    ChannelError(String),

    #[error("Internal error: {0}")]
    Internal(String),

    /// The engine is shutting down.
    #[error("Engine is shutting down")]
    ShuttingDown,
}

// =============================================================================
// Error Kind
// =============================================================================

/// Stable, machine-readable error kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Configuration,
    LockTimeout,
    LockNotHeld,
    SyncTargetUnavailable,
    Store,
    ConflictDetected,
    DependencyCycle,
    UnknownDependency,
    TransactionNotFound,
    InvalidTransactionState,
    TransactionRollbackFailed,
    InvalidOperation,
    MaxRetriesExceeded,
    MessageExpired,
    Serialization,
    HandlerFailed,
    Internal,
    ShuttingDown,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Configuration => "configuration",
            ErrorKind::LockTimeout => "lock_timeout",
            ErrorKind::LockNotHeld => "lock_not_held",
            ErrorKind::SyncTargetUnavailable => "sync_target_unavailable",
            ErrorKind::Store => "store",
            ErrorKind::ConflictDetected => "conflict_detected",
            ErrorKind::DependencyCycle => "dependency_cycle",
            ErrorKind::UnknownDependency => "unknown_dependency",
            ErrorKind::TransactionNotFound => "transaction_not_found",
            ErrorKind::InvalidTransactionState => "invalid_transaction_state",
            ErrorKind::TransactionRollbackFailed => "transaction_rollback_failed",
            ErrorKind::InvalidOperation => "invalid_operation",
            ErrorKind::MaxRetriesExceeded => "max_retries_exceeded",
            ErrorKind::MessageExpired => "message_expired",
            ErrorKind::Serialization => "serialization",
            ErrorKind::HandlerFailed => "handler_failed",
            ErrorKind::Internal => "internal",
            ErrorKind::ShuttingDown => "shutting_down",
        };
        f.write_str(name)
    }
}

impl SyncError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SyncError::InvalidConfig(_)
            | SyncError::ConfigLoadFailed(_)
            | SyncError::ConfigSaveFailed(_) => ErrorKind::Configuration,
            SyncError::LockTimeout { .. } => ErrorKind::LockTimeout,
            SyncError::LockNotHeld { .. } => ErrorKind::LockNotHeld,
            SyncError::SyncTargetUnavailable { .. } => ErrorKind::SyncTargetUnavailable,
            SyncError::StoreFailed(_) => ErrorKind::Store,
            SyncError::ConflictDetected { .. } => ErrorKind::ConflictDetected,
            SyncError::DependencyCycle { .. } => ErrorKind::DependencyCycle,
            SyncError::UnknownDependency { .. } => ErrorKind::UnknownDependency,
            SyncError::TransactionNotFound(_) => ErrorKind::TransactionNotFound,
            SyncError::InvalidTransactionState { .. } => ErrorKind::InvalidTransactionState,
            SyncError::TransactionRollbackFailed { .. } => ErrorKind::TransactionRollbackFailed,
            SyncError::InvalidOperation(_) => ErrorKind::InvalidOperation,
            SyncError::MaxRetriesExceeded { .. } => ErrorKind::MaxRetriesExceeded,
            SyncError::MessageExpired { .. } => ErrorKind::MessageExpired,
            SyncError::SerializationFailed(_) => ErrorKind::Serialization,
            SyncError::HandlerFailed(_) => ErrorKind::HandlerFailed,
            SyncError::ChannelError(_) | SyncError::Internal(_) => ErrorKind::Internal,
            SyncError::ShuttingDown => ErrorKind::ShuttingDown,
        }
    }

    /// Transient failures that the retry machinery handles locally.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncError::SyncTargetUnavailable { .. }
                | SyncError::LockTimeout { .. }
                | SyncError::HandlerFailed(_)
        )
    }

    /// Failures rejected before any mutation is applied.
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            SyncError::DependencyCycle { .. }
                | SyncError::UnknownDependency { .. }
                | SyncError::InvalidOperation(_)
        )
    }

    /// Attaches the transaction id to a dependency graph error.
    pub fn dependency(transaction_id: &str, err: DependencyError) -> Self {
        match err {
            DependencyError::Cycle { path } => SyncError::DependencyCycle {
                transaction_id: transaction_id.to_string(),
                path,
            },
            DependencyError::Unknown {
                operation_id,
                dependency_id,
            } => SyncError::UnknownDependency {
                transaction_id: transaction_id.to_string(),
                operation_id,
                dependency_id,
            },
        }
    }
}

// =============================================================================
// Error Conversions
// =============================================================================

impl From<StoreError> for SyncError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Unavailable { store, message } => SyncError::SyncTargetUnavailable {
                target: store,
                message,
            },
            StoreError::Connection(message) => SyncError::SyncTargetUnavailable {
                target: "cache".to_string(),
                message,
            },
            StoreError::Serialization(message) => SyncError::SerializationFailed(message),
            other => SyncError::StoreFailed(other.to_string()),
        }
    }
}

impl From<CoreError> for SyncError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::MissingField { .. } => SyncError::InvalidOperation(err.to_string()),
            other => SyncError::InvalidConfig(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::SerializationFailed(err.to_string())
    }
}

impl From<toml::de::Error> for SyncError {
    fn from(err: toml::de::Error) -> Self {
        SyncError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::ser::Error> for SyncError {
    fn from(err: toml::ser::Error) -> Self {
        SyncError::ConfigSaveFailed(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_unavailable_is_retryable() {
        let err: SyncError = StoreError::unavailable("graph", "offline").into();
        assert_eq!(err.kind(), ErrorKind::SyncTargetUnavailable);
        assert!(err.is_retryable());
        assert!(!err.is_structural());
    }

    #[test]
    fn test_dependency_errors_are_structural() {
        let err = SyncError::dependency(
            "tx-1",
            DependencyError::Unknown {
                operation_id: "a".into(),
                dependency_id: "b".into(),
            },
        );
        assert_eq!(err.kind(), ErrorKind::UnknownDependency);
        assert!(err.is_structural());
        assert_eq!(err.kind().to_string(), "unknown_dependency");
    }
}
