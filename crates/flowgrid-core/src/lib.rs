//! flowgrid-core: shared configuration and plumbing.
//!
//! Holds the `flowgrid.toml` schema, duration parsing, the shutdown
//! action vocabulary shared by roles and services, and a minimal
//! JSON-over-HTTP client used to talk to the external driver and LCM.

pub mod config;
pub mod duration;
pub mod http;
pub mod types;

pub use config::{ConfigError, FlowConfig, RoleDefaults};
pub use duration::parse_duration;
pub use types::*;
