//! flowgrid-role: the VM driver boundary and role operations that use it.
//!
//! [`RoleOperator`] implements deploy, the shutdown cascade, recovery, batch
//! scheduled actions and chown against a [`VmDriver`]. Transitions that do
//! not touch VMs (`Role::update`, `Role::set_state`, the recovery predicates)
//! live on the types in `flowgrid-state`.

pub mod driver;
pub mod error;
pub mod http_driver;
pub mod memory;
pub mod naming;
pub mod operator;

pub use driver::{Instantiate, SchedAction, VmDriver, VmInfo};
pub use error::{DriverError, DriverResult, PartialFailure, RoleError, RoleResult};
pub use http_driver::HttpVmDriver;
pub use memory::{DriverOp, MemoryDriver};
pub use operator::{Recovery, RoleOperator, stagger_offset};
