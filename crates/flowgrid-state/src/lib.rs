//! flowgrid-state: the service pool and its data model.
//!
//! A `Service` owns an ordered list of `Role`s forming a dependency DAG; each
//! role owns its `Node`s and `ElasticityPolicy`s. Transitions that need no
//! hypervisor access (state changes, cardinality updates, recovery
//! predicates, DAG ordering) are implemented here directly on the types.
//!
//! # Storage
//!
//! `StateStore` persists services and per-role metric snapshots in
//! [redb](https://docs.rs/redb) as JSON values. It is `Clone` + `Send` +
//! `Sync` (backed by `Arc<Database>`). Role state changes that race between
//! the auto-scaler and the watchdog go through `StateStore::transition_role`,
//! which checks and writes inside one write transaction. External writers
//! use the same path through `POST .../roles/{role}/state`; a whole-document
//! `put_service` compares each role against the stored copy and applies
//! changed states through `Role::set_state`, so entering SCALING always
//! clears the policy windows.

pub mod error;
pub mod policy;
pub mod role;
pub mod service;
pub mod store;
pub mod tables;
pub mod types;
pub mod vm;

pub use error::{StateError, StateResult, ValidationError};
pub use policy::{Comparison, ElasticityPolicy, Expression, PolicyKind};
pub use store::StateStore;
pub use types::*;
pub use vm::{HealthEvent, LcmState, VmState, classify, vm_failure};
