//! LCM and dispatch error types.

use thiserror::Error;

use flowgrid_core::http::HttpError;
use flowgrid_state::ServiceId;

/// A failed call into the life cycle manager.
#[derive(Debug, Error)]
pub enum LcmError {
    #[error("lcm transport error: {0}")]
    Transport(#[from] HttpError),

    #[error("lcm rejected the request ({status}): {body}")]
    Rejected { status: u16, body: String },

    #[error("credentials unavailable: {0}")]
    Credentials(String),
}

pub type LcmResult<T> = Result<T, LcmError>;

/// Reasons an intent was not handed to the LCM.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    #[error("role {role:?} of service {service_id} already has an intent in flight")]
    RoleBusy { service_id: ServiceId, role: String },

    #[error("intent dispatcher is not running")]
    Closed,
}
