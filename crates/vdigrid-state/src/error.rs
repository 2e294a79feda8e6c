//! Error types for the vdigrid record store.

use thiserror::Error;

use crate::types::InstanceState;

/// Result type alias for record store operations.
pub type StateResult<T> = Result<T, StateError>;

/// Errors that can occur during record store operations.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("failed to open database: {0}")]
    Open(String),

    #[error("database {0} is locked by another process")]
    Locked(String),

    #[error("transaction error: {0}")]
    Transaction(String),

    #[error("table error: {0}")]
    Table(String),

    #[error("read error: {0}")]
    Read(String),

    #[error("write error: {0}")]
    Write(String),

    #[error("serialization error: {0}")]
    Serialize(String),

    #[error("deserialization error: {0}")]
    Deserialize(String),

    #[error("invalid application id {0:?}: must be non-empty and contain no ':'")]
    InvalidApplicationId(String),

    #[error("instance {instance_id}: illegal transition {from:?} -> {to:?}")]
    InvalidTransition {
        instance_id: String,
        from: InstanceState,
        to: InstanceState,
    },

    #[error("instance {0}: address already recorded")]
    AddressAlreadySet(String),
}
