//! Error types for the flowgrid data model and state store.

use thiserror::Error;

/// Result type alias for state store operations.
pub type StateResult<T> = Result<T, StateError>;

/// Errors that can occur during state store operations.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("failed to open database: {0}")]
    Open(String),

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

    #[error("not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Validation(#[from] ValidationError),
}

/// Synchronous rejections. The entity is left unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("Minimum cardinality is {min}")]
    BelowMinimum { min: u32 },

    #[error("Maximum cardinality is {max}")]
    AboveMaximum { max: u32 },

    #[error("unknown state ordinal {0}")]
    UnknownState(u32),

    #[error("malformed elasticity expression {expression:?}: {reason}")]
    MalformedExpression { expression: String, reason: String },

    #[error("duplicate role name {0:?}")]
    DuplicateRole(String),

    #[error("role {role:?} lists unknown parent {parent:?}")]
    UnknownParent { role: String, parent: String },

    #[error("role {0:?} lists itself as a parent")]
    SelfParent(String),

    #[error("role {role:?}: min_vms {min} exceeds max_vms {max}")]
    InvertedBounds { role: String, min: u32, max: u32 },

    #[error("role {role:?}: cardinality {cardinality} outside [{min}, {max}]")]
    CardinalityOutOfBounds {
        role: String,
        cardinality: u32,
        min: u32,
        max: u32,
    },
}
