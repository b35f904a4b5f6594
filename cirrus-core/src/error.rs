use thiserror::Error;

use crate::network_state::NetworkState;

#[derive(Error, Debug)]
pub enum CirrusError {
    #[error("No transition from {from:?} on {action}")]
    InvalidStateTransition { from: NetworkState, action: String },

    #[error("Network {network} changed concurrently: expected {expected:?}, found {actual:?}")]
    ConcurrentStateConflict {
        network: String,
        expected: NetworkState,
        actual: NetworkState,
    },

    #[error("Provider '{provider}' cannot supply services [{}]", .services.join(", "))]
    UnsupportedServiceCombination {
        provider: String,
        services: Vec<String>,
    },

    #[error("Conflicting definition for {kind} '{name}'")]
    DuplicateDefinition { kind: String, name: String },

    #[error("Write contention during {operation}")]
    StorageContention { operation: String },

    #[error("Resource not found: {resource}")]
    NotFound { resource: String },

    #[error("Invalid input for {field}: {message}")]
    InvalidInput { field: String, message: String },

    #[error("Storage error: {0}")]
    StorageError(#[from] redb::Error),

    #[error("Storage transaction error: {0}")]
    StorageTransactionError(String),

    #[error("Storage table error: {0}")]
    StorageTableError(String),

    #[error("Storage operation '{operation}' failed")]
    Storage {
        operation: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("Serialization operation '{operation}' failed")]
    Serialization {
        operation: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Push to agent for VM {vm} failed: {reason}")]
    Dispatch { vm: String, reason: String },

    #[error("Network element '{provider}' failed during {operation}: {reason}")]
    ElementFailure {
        provider: String,
        operation: String,
        reason: String,
    },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

pub type CirrusResult<T> = std::result::Result<T, CirrusError>;

impl CirrusError {
    /// Whether the failure is write contention that a bounded retry can absorb.
    pub fn is_transient(&self) -> bool {
        matches!(self, CirrusError::StorageContention { .. })
    }
}

impl From<redb::TransactionError> for CirrusError {
    fn from(err: redb::TransactionError) -> Self {
        CirrusError::StorageTransactionError(err.to_string())
    }
}

impl From<redb::TableError> for CirrusError {
    fn from(err: redb::TableError) -> Self {
        CirrusError::StorageTableError(err.to_string())
    }
}

impl From<redb::StorageError> for CirrusError {
    fn from(err: redb::StorageError) -> Self {
        CirrusError::StorageError(err.into())
    }
}

impl From<redb::DatabaseError> for CirrusError {
    fn from(err: redb::DatabaseError) -> Self {
        CirrusError::StorageError(err.into())
    }
}

impl From<redb::CommitError> for CirrusError {
    fn from(err: redb::CommitError) -> Self {
        CirrusError::StorageError(err.into())
    }
}

impl From<bincode::Error> for CirrusError {
    fn from(err: bincode::Error) -> Self {
        CirrusError::Serialization {
            operation: "bincode".to_string(),
            source: err,
        }
    }
}

impl From<toml::de::Error> for CirrusError {
    fn from(err: toml::de::Error) -> Self {
        CirrusError::ConfigError(err.to_string())
    }
}

/// Attach an operation name to storage and serialization failures
pub trait StorageContext<T> {
    fn storage_context(self, operation: &str) -> CirrusResult<T>;
}

impl<T, E> StorageContext<T> for std::result::Result<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn storage_context(self, operation: &str) -> CirrusResult<T> {
        self.map_err(|e| CirrusError::Storage {
            operation: operation.to_string(),
            source: Box::new(e),
        })
    }
}

/// Attach an operation name to bincode failures
pub trait BincodeContext<T> {
    fn bincode_context(self, operation: &str) -> CirrusResult<T>;
}

impl<T> BincodeContext<T> for std::result::Result<T, bincode::Error> {
    fn bincode_context(self, operation: &str) -> CirrusResult<T> {
        self.map_err(|e| CirrusError::Serialization {
            operation: operation.to_string(),
            source: e,
        })
    }
}
