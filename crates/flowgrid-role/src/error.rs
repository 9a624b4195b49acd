//! Role operation error types.

use std::time::Duration;

use thiserror::Error;

use flowgrid_core::http::HttpError;
use flowgrid_state::{NodeId, RoleState, ValidationError};

/// Failure of a single VM driver call.
#[derive(Debug, Error)]
pub enum DriverError {
    #[error("{op} timed out after {after:?}")]
    Timeout { op: &'static str, after: Duration },

    #[error("vm {0} not found")]
    NotFound(NodeId),

    #[error("{op} rejected: {reason}")]
    Rejected { op: &'static str, reason: String },

    #[error("driver transport error: {0}")]
    Transport(#[from] HttpError),

    #[error("malformed driver response: {0}")]
    Decode(String),
}

impl DriverError {
    /// Timeouts and transport failures may succeed on a later attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, DriverError::Timeout { .. } | DriverError::Transport(_))
    }
}

pub type DriverResult<T> = Result<T, DriverError>;

/// A batch that stopped or finished with errors. `completed` lists the nodes
/// the batch did act on; that progress is kept.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{reason}")]
pub struct PartialFailure {
    pub completed: Vec<NodeId>,
    pub reason: String,
}

/// Errors returned by [`crate::RoleOperator`].
#[derive(Debug, Error)]
pub enum RoleError {
    #[error("role {0:?} not found")]
    RoleNotFound(String),

    /// A recovery guard refused the operation. Callers treat this as a no-op.
    #[error("role {role:?} cannot recover from {state}")]
    Blocked { role: String, state: RoleState },

    #[error("role {0:?} is DONE")]
    RoleDone(String),

    #[error("role {0:?} has no scale direction recorded")]
    NoScaleWay(String),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Partial(#[from] PartialFailure),
}

pub type RoleResult<T> = Result<T, RoleError>;
