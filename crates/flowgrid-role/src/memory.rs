//! In-memory VM driver.
//!
//! Keeps VMs in a map and applies driver calls to them directly. Faults can
//! be injected per operation and node, which is what the role and watchdog
//! tests use it for. `flowd` selects it with `driver.endpoint = "memory://"`.

use std::collections::{BTreeMap, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::debug;

use flowgrid_state::{LcmState, NodeId, RecoverMode, VmState};

use crate::driver::{Instantiate, SchedAction, VmDriver, VmInfo};
use crate::error::{DriverError, DriverResult};

/// First id handed out by [`MemoryDriver::instantiate`].
const FIRST_VM_ID: NodeId = 100;

/// Driver operations, used to inject faults and inspect the call log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DriverOp {
    Info,
    Instantiate,
    Terminate,
    TerminateHard,
    Delete,
    Recover,
    Resume,
    Chown,
    Schedule,
}

impl DriverOp {
    fn name(&self) -> &'static str {
        match self {
            DriverOp::Info => "info",
            DriverOp::Instantiate => "instantiate",
            DriverOp::Terminate => "terminate",
            DriverOp::TerminateHard => "terminate-hard",
            DriverOp::Delete => "delete",
            DriverOp::Recover => "recover",
            DriverOp::Resume => "resume",
            DriverOp::Chown => "chown",
            DriverOp::Schedule => "schedule",
        }
    }
}

#[derive(Default)]
struct Inner {
    next_id: NodeId,
    vms: BTreeMap<NodeId, VmInfo>,
    scheduled: BTreeMap<NodeId, Vec<SchedAction>>,
    /// `(op, None)` fails the op for every node.
    faults: HashSet<(DriverOp, Option<NodeId>)>,
    /// Successful instantiations left before instantiate starts failing.
    instantiate_budget: Option<usize>,
    /// Delay applied before each instantiation.
    instantiate_latency: Duration,
    calls: Vec<(DriverOp, NodeId)>,
}

impl Inner {
    fn check(&mut self, op: DriverOp, id: NodeId) -> DriverResult<()> {
        self.calls.push((op, id));
        if self.faults.contains(&(op, Some(id))) || self.faults.contains(&(op, None)) {
            return Err(DriverError::Rejected {
                op: op.name(),
                reason: format!("injected fault on vm {id}"),
            });
        }
        Ok(())
    }

    fn vm_mut(&mut self, id: NodeId) -> DriverResult<&mut VmInfo> {
        self.vms.get_mut(&id).ok_or(DriverError::NotFound(id))
    }
}

pub struct MemoryDriver {
    inner: Mutex<Inner>,
}

impl Default for MemoryDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryDriver {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                next_id: FIRST_VM_ID,
                ..Inner::default()
            }),
        }
    }

    /// Register an existing VM.
    pub async fn insert_vm(&self, vm: VmInfo) {
        let mut inner = self.inner.lock().await;
        inner.next_id = inner.next_id.max(vm.id + 1);
        inner.vms.insert(vm.id, vm);
    }

    pub async fn set_state(&self, id: NodeId, state: VmState, lcm_state: LcmState) {
        if let Some(vm) = self.inner.lock().await.vms.get_mut(&id) {
            vm.state = state;
            vm.lcm_state = lcm_state;
        }
    }

    /// Make `op` fail for `id`, or for every node when `id` is `None`.
    pub async fn fail(&self, op: DriverOp, id: Option<NodeId>) {
        self.inner.lock().await.faults.insert((op, id));
    }

    /// Let `n` more instantiations succeed, then fail the rest.
    pub async fn fail_instantiate_after(&self, n: usize) {
        self.inner.lock().await.instantiate_budget = Some(n);
    }

    /// Slow every later instantiation down by `latency`.
    pub async fn set_instantiate_latency(&self, latency: Duration) {
        self.inner.lock().await.instantiate_latency = latency;
    }

    /// Ids of every VM the driver knows about.
    pub async fn vm_ids(&self) -> Vec<NodeId> {
        self.inner.lock().await.vms.keys().copied().collect()
    }

    pub async fn vm(&self, id: NodeId) -> Option<VmInfo> {
        self.inner.lock().await.vms.get(&id).cloned()
    }

    pub async fn scheduled(&self, id: NodeId) -> Vec<SchedAction> {
        self.inner
            .lock()
            .await
            .scheduled
            .get(&id)
            .cloned()
            .unwrap_or_default()
    }

    /// Every call made so far, in order.
    pub async fn calls(&self) -> Vec<(DriverOp, NodeId)> {
        self.inner.lock().await.calls.clone()
    }
}

#[async_trait]
impl VmDriver for MemoryDriver {
    async fn info(&self, id: NodeId) -> DriverResult<VmInfo> {
        let mut inner = self.inner.lock().await;
        inner.check(DriverOp::Info, id)?;
        inner.vms.get(&id).cloned().ok_or(DriverError::NotFound(id))
    }

    async fn instantiate(&self, request: &Instantiate) -> DriverResult<NodeId> {
        let latency = self.inner.lock().await.instantiate_latency;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        let mut inner = self.inner.lock().await;
        let id = inner.next_id;
        inner.check(DriverOp::Instantiate, id)?;
        match inner.instantiate_budget {
            Some(0) => {
                return Err(DriverError::Rejected {
                    op: "instantiate",
                    reason: "template quota exceeded".to_string(),
                });
            }
            Some(n) => inner.instantiate_budget = Some(n - 1),
            None => {}
        }
        inner.next_id += 1;
        inner.vms.insert(
            id,
            VmInfo {
                id,
                uid: 0,
                gid: 0,
                uname: "flowgrid".to_string(),
                gname: "flowgrid".to_string(),
                name: request.name.clone(),
                state: VmState::Pending,
                lcm_state: LcmState::LcmInit,
                sched_action_ids: Vec::new(),
            },
        );
        debug!(vm_id = id, name = %request.name, template = request.template_id, "memory vm created");
        Ok(id)
    }

    async fn terminate(&self, id: NodeId, hard: bool) -> DriverResult<()> {
        let op = if hard {
            DriverOp::TerminateHard
        } else {
            DriverOp::Terminate
        };
        let mut inner = self.inner.lock().await;
        inner.check(op, id)?;
        let vm = inner.vm_mut(id)?;
        vm.state = VmState::Done;
        vm.lcm_state = LcmState::LcmInit;
        Ok(())
    }

    async fn delete(&self, id: NodeId) -> DriverResult<()> {
        let mut inner = self.inner.lock().await;
        inner.check(DriverOp::Delete, id)?;
        inner.vms.remove(&id).map(|_| ()).ok_or(DriverError::NotFound(id))
    }

    async fn recover(&self, id: NodeId, mode: RecoverMode) -> DriverResult<()> {
        let mut inner = self.inner.lock().await;
        inner.check(DriverOp::Recover, id)?;
        let vm = inner.vm_mut(id)?;
        match mode {
            RecoverMode::Retry | RecoverMode::Success => {
                vm.state = VmState::Active;
                vm.lcm_state = LcmState::Running;
            }
            RecoverMode::Failure => vm.state = VmState::Failed,
            RecoverMode::Delete | RecoverMode::DeleteDb => vm.state = VmState::Done,
            RecoverMode::DeleteRecreate => {
                vm.state = VmState::Pending;
                vm.lcm_state = LcmState::LcmInit;
            }
        }
        Ok(())
    }

    async fn resume(&self, id: NodeId) -> DriverResult<()> {
        let mut inner = self.inner.lock().await;
        inner.check(DriverOp::Resume, id)?;
        let vm = inner.vm_mut(id)?;
        vm.state = VmState::Active;
        vm.lcm_state = LcmState::Running;
        Ok(())
    }

    async fn chown(&self, id: NodeId, uid: u32, gid: u32) -> DriverResult<()> {
        let mut inner = self.inner.lock().await;
        inner.check(DriverOp::Chown, id)?;
        let vm = inner.vm_mut(id)?;
        vm.uid = uid;
        vm.gid = gid;
        Ok(())
    }

    async fn schedule(&self, id: NodeId, action: &SchedAction) -> DriverResult<()> {
        let mut inner = self.inner.lock().await;
        inner.check(DriverOp::Schedule, id)?;
        inner.vm_mut(id)?.sched_action_ids.push(action.id);
        inner.scheduled.entry(id).or_default().push(action.clone());
        Ok(())
    }
}
