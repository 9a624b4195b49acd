//! redb table definitions for the flowgrid state store.
//!
//! Keys are `&str`, values are JSON-encoded domain types.

use redb::TableDefinition;

/// Service documents keyed by the zero-padded service id.
pub const SERVICES: TableDefinition<&str, &[u8]> = TableDefinition::new("services");

/// Latest metric values keyed by `{service_id}/{role}`.
pub const ROLE_METRICS: TableDefinition<&str, &[u8]> = TableDefinition::new("role_metrics");
