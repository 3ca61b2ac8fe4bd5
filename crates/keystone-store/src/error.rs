//! # Store Error Types
//!
//! Error types for store operations.
//!
//! ## Error Flow
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Error Propagation                                    │
//! │                                                                         │
//! │  redis::RedisError / in-memory double failure                          │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  StoreError (this module) ← Adds context and categorization            │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  SyncError (keystone-sync) ← Decides retry vs. surface                 │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use thiserror::Error;

/// Store operation errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Could not open a connection at construction time.
    #[error("Connection failed: {0}")]
    Connection(String),

    /// The store is temporarily unreachable.
    ///
    /// ## When This Occurs
    /// - Network I/O failure or timeout
    /// - Connection dropped or refused
    /// - A test double switched offline
    #[error("{store} unavailable: {message}")]
    Unavailable { store: String, message: String },

    /// Entity not found in the store.
    #[error("{entity} not found: {id}")]
    NotFound { entity: String, id: String },

    /// A write violated a store constraint.
    ///
    /// ## When This Occurs
    /// - Creating a node whose id already exists
    /// - Creating a relationship to a missing node
    /// - Updating a node that does not exist
    #[error("Constraint violation: {0}")]
    Constraint(String),

    /// A stored value could not be encoded or decoded.
    #[error("Serialization failed: {0}")]
    Serialization(String),

    /// The store rejected a command.
    #[error("Command failed: {0}")]
    Command(String),
}

impl StoreError {
    pub fn unavailable(store: impl Into<String>, message: impl Into<String>) -> Self {
        StoreError::Unavailable {
            store: store.into(),
            message: message.into(),
        }
    }

    pub fn not_found(entity: impl Into<String>, id: impl Into<String>) -> Self {
        StoreError::NotFound {
            entity: entity.into(),
            id: id.into(),
        }
    }

    /// Returns true for failures worth retrying later.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable { .. } | StoreError::Connection(_))
    }
}

/// Convert redis errors to StoreError.
///
/// ## Error Mapping
/// ```text
/// I/O, timeout, dropped or refused connection → StoreError::Unavailable
/// Type mismatch on a reply                    → StoreError::Serialization
/// Other                                       → StoreError::Command
/// ```
impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_io_error()
            || err.is_timeout()
            || err.is_connection_dropped()
            || err.is_connection_refusal()
        {
            StoreError::unavailable("cache", err.to_string())
        } else if err.kind() == redis::ErrorKind::TypeError {
            StoreError::Serialization(err.to_string())
        } else {
            StoreError::Command(err.to_string())
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(StoreError::unavailable("graph", "offline").is_transient());
        assert!(!StoreError::Constraint("dup".into()).is_transient());
        assert_eq!(
            StoreError::not_found("node", "n1").to_string(),
            "node not found: n1"
        );
    }
}
