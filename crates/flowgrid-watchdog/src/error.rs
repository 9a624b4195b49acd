//! Watchdog error types.

use thiserror::Error;

/// Event bus transport failures.
#[derive(Debug, Error)]
pub enum BusError {
    #[error("invalid bus endpoint {0:?}")]
    Endpoint(String),

    #[error("failed to connect to {endpoint}: {reason}")]
    Connect { endpoint: String, reason: String },

    #[error("bus transport error: {0}")]
    Transport(String),

    #[error("bus connection closed")]
    Closed,
}

pub type BusResult<T> = Result<T, BusError>;

/// A topic/payload pair that does not follow the VM event format.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("topic {0:?} is not a VM event topic")]
    Topic(String),

    #[error("malformed event body {0:?}")]
    Body(String),

    #[error("topic names vm {topic} but payload names vm {payload}")]
    IdMismatch { topic: u64, payload: u64 },
}

#[derive(Debug, Error)]
pub enum WatchdogError {
    #[error(transparent)]
    Bus(#[from] BusError),
}

pub type WatchdogResult<T> = Result<T, WatchdogError>;
