//! VM driver capability consumed by role operations.
//!
//! The driver is the hypervisor boundary: every call acts on one VM and may
//! fail independently. Implementations: [`crate::HttpVmDriver`] for a remote
//! driver service and [`crate::MemoryDriver`] for tests and dry runs.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use flowgrid_state::{LcmState, NodeId, RecoverMode, ScheduleAction, VmSnapshot, VmState};

use crate::error::DriverResult;

/// Current view of one VM as reported by the driver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmInfo {
    pub id: NodeId,
    pub uid: u32,
    pub gid: u32,
    pub uname: String,
    pub gname: String,
    pub name: String,
    pub state: VmState,
    pub lcm_state: LcmState,
    /// Ids of scheduled actions already attached to the VM.
    #[serde(default)]
    pub sched_action_ids: Vec<u64>,
}

impl VmInfo {
    /// Identity fields cached on the role's node.
    pub fn snapshot(&self) -> VmSnapshot {
        VmSnapshot {
            id: self.id,
            uid: self.uid,
            gid: self.gid,
            uname: self.uname.clone(),
            gname: self.gname.clone(),
            name: self.name.clone(),
        }
    }

    pub fn is_running(&self) -> bool {
        self.state == VmState::Active && self.lcm_state == LcmState::Running
    }

    /// Id for the next scheduled action: one past the highest existing id.
    pub fn next_sched_action_id(&self) -> u64 {
        self.sched_action_ids
            .iter()
            .max()
            .map(|max| max + 1)
            .unwrap_or(0)
    }
}

/// A lifecycle action scheduled to run on a VM at `time` (Unix seconds).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedAction {
    pub id: u64,
    pub action: ScheduleAction,
    pub time: u64,
}

/// Request to create one VM from a template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instantiate {
    pub template_id: u64,
    pub name: String,
    /// Template attributes appended to the template, one `KEY = value` per line.
    pub extra_template: String,
}

#[async_trait]
pub trait VmDriver: Send + Sync {
    async fn info(&self, id: NodeId) -> DriverResult<VmInfo>;

    /// Create a VM and return its id.
    async fn instantiate(&self, request: &Instantiate) -> DriverResult<NodeId>;

    async fn terminate(&self, id: NodeId, hard: bool) -> DriverResult<()>;

    async fn delete(&self, id: NodeId) -> DriverResult<()>;

    async fn recover(&self, id: NodeId, mode: RecoverMode) -> DriverResult<()>;

    async fn resume(&self, id: NodeId) -> DriverResult<()>;

    async fn chown(&self, id: NodeId, uid: u32, gid: u32) -> DriverResult<()>;

    /// Attach a scheduled action to the VM.
    async fn schedule(&self, id: NodeId, action: &SchedAction) -> DriverResult<()>;
}
