//! Driver-backed role operations.
//!
//! Every operation takes the owning `Service` mutably and a role name: the
//! role's node list and sequence counter are updated in place and failures
//! are written to the service log. Individual VM calls are bounded by
//! `call_timeout`; a node whose call fails does not stop the others except
//! in `deploy`, which aborts the batch on the first failed instantiation.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use flowgrid_core::RoleDefaults;
use flowgrid_state::{
    Node, NodeId, RecoverMode, RoleState, ScaleWay, ScheduleAction, Service, ShutdownAction,
    VmState, vm_failure,
};

use crate::driver::{Instantiate, SchedAction, VmDriver};
use crate::error::{DriverError, DriverResult, PartialFailure, RoleError, RoleResult};
use crate::naming::{extra_template, render_vm_name};

/// What a [`RoleOperator::recover`] call retried.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "recovered", rename_all = "snake_case")]
pub enum Recovery {
    Deploy { nodes: Vec<NodeId> },
    Undeploy { nodes: Vec<NodeId> },
    Scale { way: ScaleWay, nodes: Vec<NodeId> },
}

/// Seconds to delay node `index` when a batch is staggered `per_period`
/// nodes every `period` seconds.
pub fn stagger_offset(index: usize, period: Option<u64>, per_period: Option<u32>) -> u64 {
    match (period, per_period) {
        (Some(period), Some(n)) if n > 0 => (index as u64 / u64::from(n)) * period,
        _ => 0,
    }
}

fn batch_result(role: &str, completed: Vec<NodeId>, errors: Vec<String>) -> RoleResult<Vec<NodeId>> {
    if errors.is_empty() {
        Ok(completed)
    } else {
        debug!(role, failed = errors.len(), "batch finished with errors");
        Err(PartialFailure {
            completed,
            reason: errors.join("; "),
        }
        .into())
    }
}

pub struct RoleOperator {
    driver: Arc<dyn VmDriver>,
    defaults: RoleDefaults,
    call_timeout: Duration,
}

impl RoleOperator {
    pub fn new(driver: Arc<dyn VmDriver>, defaults: RoleDefaults, call_timeout: Duration) -> Self {
        Self {
            driver,
            defaults,
            call_timeout,
        }
    }

    pub fn defaults(&self) -> &RoleDefaults {
        &self.defaults
    }

    pub fn driver(&self) -> &Arc<dyn VmDriver> {
        &self.driver
    }

    async fn call<T>(
        &self,
        op: &'static str,
        fut: impl Future<Output = DriverResult<T>>,
    ) -> DriverResult<T> {
        match tokio::time::timeout(self.call_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(DriverError::Timeout {
                op,
                after: self.call_timeout,
            }),
        }
    }

    fn role_index(service: &Service, role: &str) -> RoleResult<usize> {
        service
            .roles
            .iter()
            .position(|r| r.name == role)
            .ok_or_else(|| RoleError::RoleNotFound(role.to_string()))
    }

    // ── Deploy ─────────────────────────────────────────────────────

    /// Create the nodes missing between `cardinality` and the node list.
    ///
    /// Every parent role must be RUNNING and the role itself must not be
    /// DONE or on its way down. Returns the created ids. A failed
    /// instantiation aborts the remaining batch with a [`PartialFailure`]
    /// listing the nodes created so far.
    pub async fn deploy(&self, service: &mut Service, role: &str) -> RoleResult<Vec<NodeId>> {
        let idx = Self::role_index(service, role)?;
        let r = &service.roles[idx];
        match r.state {
            RoleState::Done => return Err(RoleError::RoleDone(role.to_string())),
            RoleState::Undeploying | RoleState::FailedUndeploying => {
                return Err(RoleError::Blocked {
                    role: role.to_string(),
                    state: r.state,
                });
            }
            _ => {}
        }
        if !r.parents_running(service) {
            return Err(RoleError::Blocked {
                role: role.to_string(),
                state: r.state,
            });
        }
        self.create_missing(service, idx, role).await
    }

    async fn create_missing(
        &self,
        service: &mut Service,
        idx: usize,
        role: &str,
    ) -> RoleResult<Vec<NodeId>> {
        let r = &service.roles[idx];
        let missing = (r.cardinality as usize).saturating_sub(r.nodes.len());
        if missing == 0 {
            debug!(service_id = service.id, role, "deploy: nothing to create");
            return Ok(Vec::new());
        }

        let template_id = r.vm_template;
        let extra = extra_template(service, r);
        info!(service_id = service.id, role, missing, "deploying nodes");

        let mut created = Vec::with_capacity(missing);
        for _ in 0..missing {
            // The sequence number is consumed even if instantiation fails.
            let vm_number = service.roles[idx].last_vmname;
            service.roles[idx].last_vmname += 1;

            let request = Instantiate {
                template_id,
                name: render_vm_name(&self.defaults.vm_name_template, service, role, vm_number),
                extra_template: extra.clone(),
            };
            let id = match self
                .call("instantiate", self.driver.instantiate(&request))
                .await
            {
                Ok(id) => id,
                Err(e) => {
                    let reason =
                        format!("Role {role} : Instantiate failed for template {template_id}; {e}");
                    service.log_error(reason.clone());
                    return Err(PartialFailure {
                        completed: created,
                        reason,
                    }
                    .into());
                }
            };

            let vm_info = match self.call("info", self.driver.info(id)).await {
                Ok(vm) => Some(vm.snapshot()),
                Err(e) => {
                    service.log_error(format!("Role {role} : Info failed for VM {id}; {e}"));
                    None
                }
            };
            debug!(service_id = service.id, role, vm_id = id, name = %request.name, "node created");
            service.roles[idx].nodes.push(Node::new(id, vm_info));
            created.push(id);
        }
        Ok(created)
    }

    // ── Shutdown ───────────────────────────────────────────────────

    /// Remove surplus nodes, oldest first: `len(nodes) - cardinality` of
    /// them, or every node when the two are equal.
    ///
    /// With `recover`, a node stuck in a failure state is re-submitted
    /// instead of terminated. Nodes disposed of successfully leave the node
    /// list; the others stay and are reported in the [`PartialFailure`].
    pub async fn shutdown(
        &self,
        service: &mut Service,
        role: &str,
        recover: bool,
    ) -> RoleResult<Vec<NodeId>> {
        let idx = Self::role_index(service, role)?;
        let r = &service.roles[idx];
        let len = r.nodes.len();
        let cardinality = r.cardinality as usize;
        let count = if len != cardinality {
            len.saturating_sub(cardinality)
        } else {
            len
        };
        let targets: Vec<NodeId> = r.nodes.iter().take(count).map(|n| n.deploy_id).collect();
        let action = service.shutdown_action_for(r, self.defaults.shutdown_action);
        info!(service_id = service.id, role, count, %action, recover, "shutting down nodes");

        let mut removed = Vec::new();
        let mut errors = Vec::new();
        for id in targets {
            match self.dispose(id, action, recover).await {
                Ok(()) => removed.push(id),
                Err(e) => {
                    let msg = format!("Role {role} : Shutdown failed for VM {id}; {e}");
                    service.log_error(msg.clone());
                    errors.push(msg);
                }
            }
        }
        service.roles[idx]
            .nodes
            .retain(|n| !removed.contains(&n.deploy_id));
        batch_result(role, removed, errors)
    }

    async fn dispose(&self, id: NodeId, action: ShutdownAction, recover: bool) -> DriverResult<()> {
        if recover {
            match self.call("info", self.driver.info(id)).await {
                Ok(vm) if vm_failure(&vm.state, &vm.lcm_state) => {
                    debug!(vm_id = id, lcm_state = %vm.lcm_state, "recovering failed vm");
                    match self
                        .call("recover", self.driver.recover(id, RecoverMode::Retry))
                        .await
                    {
                        Ok(()) => return Ok(()),
                        Err(e) => warn!(vm_id = id, error = %e, "recover failed, terminating"),
                    }
                }
                Ok(_) => {}
                Err(e) => warn!(vm_id = id, error = %e, "status read failed, terminating"),
            }
        }
        self.terminate_cascade(id, action).await
    }

    /// terminate, then terminate-hard, then delete (when forced deletion is
    /// enabled). The first tier that succeeds wins.
    async fn terminate_cascade(&self, id: NodeId, action: ShutdownAction) -> DriverResult<()> {
        let mut last = match self
            .call(action.as_str(), self.driver.terminate(id, action.is_hard()))
            .await
        {
            Ok(()) => return Ok(()),
            Err(e) => e,
        };
        warn!(vm_id = id, %action, error = %last, "terminate failed");

        if !action.is_hard() {
            last = match self
                .call("terminate-hard", self.driver.terminate(id, true))
                .await
            {
                Ok(()) => return Ok(()),
                Err(e) => e,
            };
            warn!(vm_id = id, error = %last, "terminate-hard failed");
        }

        if self.defaults.force_deletion {
            return self.call("delete", self.driver.delete(id)).await;
        }
        Err(last)
    }

    // ── Recovery ───────────────────────────────────────────────────

    /// Re-examine existing nodes, then deploy whatever is still missing.
    pub async fn recover_deploy(&self, service: &mut Service, role: &str) -> RoleResult<Vec<NodeId>> {
        let idx = Self::role_index(service, role)?;
        let r = &service.roles[idx];
        if !r.can_recover_deploy(service) {
            return Err(RoleError::Blocked {
                role: role.to_string(),
                state: r.state,
            });
        }
        self.redeploy(service, idx, role).await
    }

    /// Retry the shutdown, recovering failed VMs.
    pub async fn recover_undeploy(
        &self,
        service: &mut Service,
        role: &str,
    ) -> RoleResult<Vec<NodeId>> {
        let idx = Self::role_index(service, role)?;
        let r = &service.roles[idx];
        if !r.can_recover_undeploy(service) {
            return Err(RoleError::Blocked {
                role: role.to_string(),
                state: r.state,
            });
        }
        self.shutdown(service, role, true).await
    }

    /// Retry the scale in the direction recorded on the role.
    pub async fn recover_scale(
        &self,
        service: &mut Service,
        role: &str,
    ) -> RoleResult<(ScaleWay, Vec<NodeId>)> {
        let idx = Self::role_index(service, role)?;
        let r = &service.roles[idx];
        if !r.can_recover_scale() {
            return Err(RoleError::Blocked {
                role: role.to_string(),
                state: r.state,
            });
        }
        let way = r.scale_way;
        match way {
            Some(ScaleWay::Up) => {
                let nodes = self.redeploy(service, idx, role).await?;
                Ok((ScaleWay::Up, nodes))
            }
            Some(ScaleWay::Down) => {
                let nodes = self.shutdown(service, role, true).await?;
                Ok((ScaleWay::Down, nodes))
            }
            None => Err(RoleError::NoScaleWay(role.to_string())),
        }
    }

    /// Pick the recovery matching the role's state.
    pub async fn recover(&self, service: &mut Service, role: &str) -> RoleResult<Recovery> {
        let idx = Self::role_index(service, role)?;
        let state = service.roles[idx].state;
        if RoleState::RECOVER_SCALE.contains(&state) {
            let (way, nodes) = self.recover_scale(service, role).await?;
            Ok(Recovery::Scale { way, nodes })
        } else if RoleState::RECOVER_UNDEPLOY.contains(&state) {
            let nodes = self.recover_undeploy(service, role).await?;
            Ok(Recovery::Undeploy { nodes })
        } else {
            let nodes = self.recover_deploy(service, role).await?;
            Ok(Recovery::Deploy { nodes })
        }
    }

    async fn redeploy(
        &self,
        service: &mut Service,
        idx: usize,
        role: &str,
    ) -> RoleResult<Vec<NodeId>> {
        let mut errors = self.revive_nodes(service, idx, role).await;
        match self.create_missing(service, idx, role).await {
            Ok(created) => batch_result(role, created, errors),
            Err(RoleError::Partial(mut failure)) => {
                errors.push(failure.reason);
                failure.reason = errors.join("; ");
                Err(failure.into())
            }
            Err(e) => Err(e),
        }
    }

    /// Leave running nodes alone, drop nodes whose VM is gone, recover
    /// failed VMs and resume the rest. Returns the per-node errors.
    async fn revive_nodes(&self, service: &mut Service, idx: usize, role: &str) -> Vec<String> {
        let ids = service.roles[idx].node_ids();
        let mut gone = Vec::new();
        let mut errors = Vec::new();

        for id in ids {
            let vm = match self.call("info", self.driver.info(id)).await {
                Ok(vm) => vm,
                Err(DriverError::NotFound(_)) => {
                    gone.push(id);
                    continue;
                }
                Err(e) => {
                    let msg = format!("Role {role} : Info failed for VM {id}; {e}");
                    service.log_error(msg.clone());
                    errors.push(msg);
                    continue;
                }
            };

            if vm.is_running() {
                continue;
            }
            if vm.state == VmState::Done {
                gone.push(id);
                continue;
            }

            let (op, result) = if vm_failure(&vm.state, &vm.lcm_state) {
                (
                    "Recover",
                    self.call("recover", self.driver.recover(id, RecoverMode::Retry))
                        .await,
                )
            } else {
                ("Resume", self.call("resume", self.driver.resume(id)).await)
            };
            if let Err(e) = result {
                let msg = format!("Role {role} : {op} failed for VM {id}; {e}");
                service.log_error(msg.clone());
                errors.push(msg);
            }
        }

        if !gone.is_empty() {
            debug!(service_id = service.id, role, ?gone, "dropping finished nodes");
            service.roles[idx]
                .nodes
                .retain(|n| !gone.contains(&n.deploy_id));
        }
        errors
    }

    // ── Batch actions ──────────────────────────────────────────────

    /// Schedule `action` on every node, staggered `per_period` nodes every
    /// `period` seconds from `now` when both are given.
    pub async fn batch_action(
        &self,
        service: &mut Service,
        role: &str,
        action: ScheduleAction,
        period: Option<u64>,
        per_period: Option<u32>,
        now: u64,
    ) -> RoleResult<Vec<NodeId>> {
        let idx = Self::role_index(service, role)?;
        if service.roles[idx].state == RoleState::Done {
            return Err(RoleError::RoleDone(role.to_string()));
        }

        let ids = service.roles[idx].node_ids();
        let mut scheduled = Vec::new();
        let mut errors = Vec::new();
        for (i, id) in ids.into_iter().enumerate() {
            let time = now + stagger_offset(i, period, per_period);
            match self.schedule_one(id, action, time).await {
                Ok(()) => scheduled.push(id),
                Err(e) => {
                    let msg = format!("Role {role} : {action} failed for VM {id}; {e}");
                    service.log_error(msg.clone());
                    errors.push(msg);
                }
            }
        }
        if errors.is_empty() {
            service.log_info(format!(
                "Action {action} scheduled on {} VMs of role {role}",
                scheduled.len()
            ));
        }
        batch_result(role, scheduled, errors)
    }

    async fn schedule_one(&self, id: NodeId, action: ScheduleAction, time: u64) -> DriverResult<()> {
        let vm = self.call("info", self.driver.info(id)).await?;
        let sched = SchedAction {
            id: vm.next_sched_action_id(),
            action,
            time,
        };
        self.call("schedule", self.driver.schedule(id, &sched)).await
    }

    // ── Ownership ──────────────────────────────────────────────────

    /// Change the owner of every node. Best effort.
    pub async fn chown(
        &self,
        service: &mut Service,
        role: &str,
        uid: u32,
        gid: u32,
    ) -> RoleResult<Vec<NodeId>> {
        let idx = Self::role_index(service, role)?;
        let ids = service.roles[idx].node_ids();
        let mut changed = Vec::new();
        let mut errors = Vec::new();
        for id in ids {
            match self.call("chown", self.driver.chown(id, uid, gid)).await {
                Ok(()) => changed.push(id),
                Err(e) => {
                    let msg = format!("Role {role} : Chown failed for VM {id}; {e}");
                    service.log_error(msg.clone());
                    errors.push(msg);
                }
            }
        }

        for node in &mut service.roles[idx].nodes {
            if let Some(vm) = node.vm_info.as_mut() {
                if changed.contains(&node.deploy_id) {
                    vm.uid = uid;
                    vm.gid = gid;
                }
            }
        }
        batch_result(role, changed, errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::VmInfo;
    use crate::memory::{DriverOp, MemoryDriver};
    use flowgrid_core::FlowConfig;
    use flowgrid_state::{LcmState, Role};

    fn operator(driver: Arc<MemoryDriver>) -> RoleOperator {
        let defaults = FlowConfig::default().role_defaults().unwrap();
        RoleOperator::new(driver, defaults, Duration::from_secs(5))
    }

    fn service_with(role: Role) -> Service {
        Service::new(7, "shop", vec![role])
    }

    async fn seed(driver: &MemoryDriver, id: NodeId, state: VmState, lcm: LcmState) {
        driver
            .insert_vm(VmInfo {
                id,
                uid: 0,
                gid: 0,
                uname: "u".into(),
                gname: "g".into(),
                name: format!("vm-{id}"),
                state,
                lcm_state: lcm,
                sched_action_ids: Vec::new(),
            })
            .await;
    }

    async fn role_with_nodes(driver: &MemoryDriver, ids: &[NodeId], cardinality: u32) -> Role {
        let mut role = Role::new("web", 3, cardinality);
        for id in ids {
            seed(driver, *id, VmState::Active, LcmState::Running).await;
            role.nodes.push(Node::new(*id, None));
        }
        role
    }

    #[tokio::test]
    async fn deploy_fills_the_gap_with_named_nodes() {
        let driver = Arc::new(MemoryDriver::new());
        let op = operator(driver.clone());
        let mut svc = service_with(Role::new("web", 3, 2));

        let created = op.deploy(&mut svc, "web").await.unwrap();
        assert_eq!(created, vec![100, 101]);

        let web = svc.role("web").unwrap();
        assert_eq!(web.nodes.len(), 2);
        assert_eq!(web.last_vmname, 2);
        let snapshot = web.nodes[1].vm_info.as_ref().unwrap();
        assert_eq!(snapshot.name, "web_1_(service_7)");
    }

    #[tokio::test]
    async fn deploy_waits_for_parents() {
        let driver = Arc::new(MemoryDriver::new());
        let op = operator(driver.clone());
        let mut db = Role::new("db", 1, 1);
        db.state = RoleState::Deploying;
        let mut web = Role::new("web", 3, 1);
        web.parents.push("db".to_string());
        let mut svc = Service::new(7, "shop", vec![db, web]);

        let err = op.deploy(&mut svc, "web").await.unwrap_err();
        assert!(matches!(err, RoleError::Blocked { .. }));
        assert!(driver.calls().await.is_empty());

        svc.roles[0].state = RoleState::Running;
        assert_eq!(op.deploy(&mut svc, "web").await.unwrap(), vec![100]);
    }

    #[tokio::test]
    async fn deploy_refuses_done_and_undeploying_roles() {
        let driver = Arc::new(MemoryDriver::new());
        let op = operator(driver.clone());
        let mut role = Role::new("web", 3, 2);
        role.state = RoleState::Done;
        let mut svc = service_with(role);

        let err = op.deploy(&mut svc, "web").await.unwrap_err();
        assert!(matches!(err, RoleError::RoleDone(_)));

        for state in [RoleState::Undeploying, RoleState::FailedUndeploying] {
            svc.roles[0].state = state;
            let err = op.deploy(&mut svc, "web").await.unwrap_err();
            assert!(matches!(err, RoleError::Blocked { .. }));
        }
        assert!(driver.calls().await.is_empty());
        assert!(svc.roles[0].nodes.is_empty());
    }

    #[tokio::test]
    async fn deploy_is_idempotent_when_full() {
        let driver = Arc::new(MemoryDriver::new());
        let op = operator(driver.clone());
        let role = role_with_nodes(&driver, &[1, 2], 2).await;
        let mut svc = service_with(role);

        assert!(op.deploy(&mut svc, "web").await.unwrap().is_empty());
        assert!(driver.calls().await.is_empty());
    }

    #[tokio::test]
    async fn deploy_aborts_batch_on_first_failure() {
        let driver = Arc::new(MemoryDriver::new());
        driver.fail_instantiate_after(2).await;
        let op = operator(driver.clone());
        let mut svc = service_with(Role::new("web", 3, 5));

        let err = op.deploy(&mut svc, "web").await.unwrap_err();
        let RoleError::Partial(failure) = err else {
            panic!("expected partial failure, got {err}");
        };
        // Node 3 of 5 failed: exactly two were added.
        assert_eq!(failure.completed, vec![100, 101]);
        let web = svc.role("web").unwrap();
        assert_eq!(web.nodes.len(), 2);
        assert_eq!(web.last_vmname, 3);
        assert_eq!(svc.log.len(), 1);
    }

    #[tokio::test]
    async fn deploy_keeps_node_when_info_fails() {
        let driver = Arc::new(MemoryDriver::new());
        driver.fail(DriverOp::Info, Some(100)).await;
        let op = operator(driver.clone());
        let mut svc = service_with(Role::new("web", 3, 1));

        op.deploy(&mut svc, "web").await.unwrap();
        let web = svc.role("web").unwrap();
        assert_eq!(web.nodes, vec![Node::new(100, None)]);
    }

    #[tokio::test]
    async fn shutdown_removes_surplus_oldest_first() {
        let driver = Arc::new(MemoryDriver::new());
        let op = operator(driver.clone());
        let role = role_with_nodes(&driver, &[1, 2, 3], 1).await;
        let mut svc = service_with(role);

        let removed = op.shutdown(&mut svc, "web", false).await.unwrap();
        assert_eq!(removed, vec![1, 2]);
        assert_eq!(svc.role("web").unwrap().node_ids(), vec![3]);
    }

    #[tokio::test]
    async fn shutdown_at_cardinality_removes_everything() {
        let driver = Arc::new(MemoryDriver::new());
        let op = operator(driver.clone());
        let role = role_with_nodes(&driver, &[1, 2], 2).await;
        let mut svc = service_with(role);

        let removed = op.shutdown(&mut svc, "web", false).await.unwrap();
        assert_eq!(removed, vec![1, 2]);
        assert!(svc.role("web").unwrap().nodes.is_empty());
    }

    #[tokio::test]
    async fn cascade_falls_through_to_delete() {
        let driver = Arc::new(MemoryDriver::new());
        driver.fail(DriverOp::Terminate, Some(1)).await;
        driver.fail(DriverOp::TerminateHard, Some(1)).await;
        let op = operator(driver.clone());
        let role = role_with_nodes(&driver, &[1], 1).await;
        let mut svc = service_with(role);

        let removed = op.shutdown(&mut svc, "web", false).await.unwrap();
        assert_eq!(removed, vec![1]);
        assert!(svc.role("web").unwrap().nodes.is_empty());
        assert!(driver.vm(1).await.is_none());

        let ops: Vec<_> = driver.calls().await.into_iter().map(|(op, _)| op).collect();
        assert_eq!(
            ops,
            vec![DriverOp::Terminate, DriverOp::TerminateHard, DriverOp::Delete]
        );
    }

    #[tokio::test]
    async fn failed_recover_falls_back_to_the_cascade() {
        let driver = Arc::new(MemoryDriver::new());
        driver.fail(DriverOp::Recover, Some(1)).await;
        driver.fail(DriverOp::Terminate, Some(1)).await;
        driver.fail(DriverOp::TerminateHard, Some(1)).await;
        let op = operator(driver.clone());
        let mut role = Role::new("web", 3, 1);
        seed(&driver, 1, VmState::Active, LcmState::BootFailure).await;
        role.nodes.push(Node::new(1, None));
        let mut svc = service_with(role);

        let removed = op.shutdown(&mut svc, "web", true).await.unwrap();
        assert_eq!(removed, vec![1]);
        assert!(svc.role("web").unwrap().nodes.is_empty());
        assert!(driver.vm(1).await.is_none());

        let ops: Vec<_> = driver.calls().await.into_iter().map(|(op, _)| op).collect();
        assert_eq!(
            ops,
            vec![
                DriverOp::Info,
                DriverOp::Recover,
                DriverOp::Terminate,
                DriverOp::TerminateHard,
                DriverOp::Delete
            ]
        );
    }

    #[tokio::test]
    async fn cascade_failure_keeps_node_and_reports_others() {
        let driver = Arc::new(MemoryDriver::new());
        driver.fail(DriverOp::Terminate, Some(2)).await;
        driver.fail(DriverOp::TerminateHard, Some(2)).await;
        driver.fail(DriverOp::Delete, Some(2)).await;
        let op = operator(driver.clone());
        let role = role_with_nodes(&driver, &[1, 2, 3], 3).await;
        let mut svc = service_with(role);

        let err = op.shutdown(&mut svc, "web", false).await.unwrap_err();
        let RoleError::Partial(failure) = err else {
            panic!("expected partial failure");
        };
        assert_eq!(failure.completed, vec![1, 3]);
        assert_eq!(svc.role("web").unwrap().node_ids(), vec![2]);
    }

    #[tokio::test]
    async fn hard_shutdown_action_skips_soft_terminate() {
        let driver = Arc::new(MemoryDriver::new());
        let op = operator(driver.clone());
        let mut role = role_with_nodes(&driver, &[1], 1).await;
        role.shutdown_action = Some(ShutdownAction::TerminateHard);
        let mut svc = service_with(role);

        op.shutdown(&mut svc, "web", false).await.unwrap();
        assert_eq!(driver.calls().await, vec![(DriverOp::TerminateHard, 1)]);
    }

    #[tokio::test]
    async fn recover_undeploy_resubmits_failed_vms() {
        let driver = Arc::new(MemoryDriver::new());
        let op = operator(driver.clone());
        let mut role = role_with_nodes(&driver, &[1, 2], 2).await;
        role.state = RoleState::FailedUndeploying;
        driver
            .set_state(1, VmState::Active, LcmState::EpilogFailure)
            .await;
        let mut svc = service_with(role);

        let removed = op.recover_undeploy(&mut svc, "web").await.unwrap();
        assert_eq!(removed, vec![1, 2]);
        let calls = driver.calls().await;
        assert!(calls.contains(&(DriverOp::Recover, 1)));
        assert!(calls.contains(&(DriverOp::Terminate, 2)));
        assert!(!calls.contains(&(DriverOp::Terminate, 1)));
    }

    #[tokio::test]
    async fn recover_undeploy_blocked_by_running_dependent() {
        let driver = Arc::new(MemoryDriver::new());
        let op = operator(driver.clone());
        let mut db = role_with_nodes(&driver, &[1], 1).await;
        db.name = "db".to_string();
        db.state = RoleState::FailedUndeploying;
        let mut web = Role::new("web", 3, 1);
        web.parents.push("db".to_string());
        web.state = RoleState::Running;
        let mut svc = Service::new(7, "shop", vec![db, web]);

        let err = op.recover_undeploy(&mut svc, "db").await.unwrap_err();
        assert!(matches!(err, RoleError::Blocked { .. }));
        assert!(driver.calls().await.is_empty());
    }

    #[tokio::test]
    async fn recover_deploy_revives_and_fills() {
        let driver = Arc::new(MemoryDriver::new());
        let op = operator(driver.clone());
        let mut role = role_with_nodes(&driver, &[1, 2, 3, 4], 4).await;
        role.state = RoleState::FailedDeploying;
        driver.set_state(2, VmState::Done, LcmState::LcmInit).await;
        driver
            .set_state(3, VmState::Active, LcmState::BootFailure)
            .await;
        driver.set_state(4, VmState::Poweroff, LcmState::LcmInit).await;
        let mut svc = service_with(role);

        let created = op.recover_deploy(&mut svc, "web").await.unwrap();
        // Node 2 was DONE and got replaced.
        assert_eq!(created.len(), 1);
        let calls = driver.calls().await;
        assert!(calls.contains(&(DriverOp::Recover, 3)));
        assert!(calls.contains(&(DriverOp::Resume, 4)));
        assert!(!calls.contains(&(DriverOp::Resume, 1)));

        let ids = svc.role("web").unwrap().node_ids();
        assert_eq!(ids.len(), 4);
        assert!(!ids.contains(&2));
    }

    #[tokio::test]
    async fn recover_deploy_requires_running_parents_when_pending() {
        let driver = Arc::new(MemoryDriver::new());
        let op = operator(driver.clone());
        let db = Role::new("db", 1, 1);
        let mut web = Role::new("web", 3, 1);
        web.parents.push("db".to_string());
        let mut svc = Service::new(7, "shop", vec![db, web]);

        let err = op.recover_deploy(&mut svc, "web").await.unwrap_err();
        assert!(matches!(err, RoleError::Blocked { state: RoleState::Pending, .. }));
    }

    #[tokio::test]
    async fn recover_scale_follows_scale_way() {
        let driver = Arc::new(MemoryDriver::new());
        let op = operator(driver.clone());
        let mut role = role_with_nodes(&driver, &[1, 2, 3], 1).await;
        role.state = RoleState::FailedScaling;
        role.set_scale_way(ScaleWay::Down);
        let mut svc = service_with(role);

        let (way, nodes) = op.recover_scale(&mut svc, "web").await.unwrap();
        assert_eq!(way, ScaleWay::Down);
        assert_eq!(nodes, vec![1, 2]);

        svc.role_mut("web").unwrap().cardinality = 3;
        svc.role_mut("web").unwrap().set_scale_way(ScaleWay::Up);
        let recovery = op.recover(&mut svc, "web").await.unwrap();
        assert_eq!(
            recovery,
            Recovery::Scale {
                way: ScaleWay::Up,
                nodes: vec![100, 101]
            }
        );
    }

    #[tokio::test]
    async fn recover_scale_rejected_outside_scaling() {
        let driver = Arc::new(MemoryDriver::new());
        let op = operator(driver);
        let mut svc = service_with(Role::new("web", 3, 1));
        svc.roles[0].state = RoleState::Running;
        assert!(matches!(
            op.recover_scale(&mut svc, "web").await,
            Err(RoleError::Blocked { .. })
        ));
    }

    #[tokio::test]
    async fn batch_action_staggers_and_numbers() {
        let driver = Arc::new(MemoryDriver::new());
        let op = operator(driver.clone());
        let mut role = role_with_nodes(&driver, &[1, 2, 3, 4, 5], 5).await;
        role.state = RoleState::Running;
        let mut svc = service_with(role);

        // An existing scheduled action on node 1 bumps its next id.
        driver
            .schedule(
                1,
                &SchedAction {
                    id: 4,
                    action: ScheduleAction::Hold,
                    time: 0,
                },
            )
            .await
            .unwrap();

        let done = op
            .batch_action(&mut svc, "web", ScheduleAction::Reboot, Some(60), Some(2), 1000)
            .await
            .unwrap();
        assert_eq!(done.len(), 5);

        let times: Vec<u64> = {
            let mut t = Vec::new();
            for id in 1..=5 {
                t.push(driver.scheduled(id).await.last().unwrap().time);
            }
            t
        };
        assert_eq!(times, vec![1000, 1000, 1060, 1060, 1120]);
        assert_eq!(driver.scheduled(1).await.last().unwrap().id, 5);
        assert_eq!(driver.scheduled(2).await.last().unwrap().id, 0);
    }

    #[tokio::test]
    async fn batch_action_aggregates_errors() {
        let driver = Arc::new(MemoryDriver::new());
        driver.fail(DriverOp::Schedule, Some(2)).await;
        let op = operator(driver.clone());
        let role = role_with_nodes(&driver, &[1, 2, 3], 3).await;
        let mut svc = service_with(role);

        let err = op
            .batch_action(&mut svc, "web", ScheduleAction::Stop, None, None, 50)
            .await
            .unwrap_err();
        let RoleError::Partial(failure) = err else {
            panic!("expected partial failure");
        };
        assert_eq!(failure.completed, vec![1, 3]);
        assert!(failure.reason.contains("VM 2"));
    }

    #[tokio::test]
    async fn batch_action_rejected_on_done_role() {
        let driver = Arc::new(MemoryDriver::new());
        let op = operator(driver.clone());
        let mut role = role_with_nodes(&driver, &[1], 1).await;
        role.state = RoleState::Done;
        let mut svc = service_with(role);

        let err = op
            .batch_action(&mut svc, "web", ScheduleAction::Stop, None, None, 0)
            .await
            .unwrap_err();
        assert!(matches!(err, RoleError::RoleDone(_)));
        assert!(driver.calls().await.is_empty());
    }

    #[tokio::test]
    async fn chown_updates_cached_owner() {
        let driver = Arc::new(MemoryDriver::new());
        let op = operator(driver.clone());
        let mut svc = service_with(Role::new("web", 3, 2));
        op.deploy(&mut svc, "web").await.unwrap();

        let changed = op.chown(&mut svc, "web", 12, 34).await.unwrap();
        assert_eq!(changed, vec![100, 101]);
        let snapshot = svc.role("web").unwrap().nodes[0].vm_info.clone().unwrap();
        assert_eq!((snapshot.uid, snapshot.gid), (12, 34));
        assert_eq!(driver.vm(101).await.unwrap().uid, 12);
    }

    #[test]
    fn stagger_needs_both_period_and_count() {
        assert_eq!(stagger_offset(5, Some(30), None), 0);
        assert_eq!(stagger_offset(5, None, Some(2)), 0);
        assert_eq!(stagger_offset(5, Some(30), Some(0)), 0);
        assert_eq!(stagger_offset(5, Some(30), Some(2)), 60);
    }

    #[tokio::test]
    async fn unknown_role_is_reported() {
        let driver = Arc::new(MemoryDriver::new());
        let op = operator(driver);
        let mut svc = service_with(Role::new("web", 3, 1));
        assert!(matches!(
            op.deploy(&mut svc, "cache").await,
            Err(RoleError::RoleNotFound(_))
        ));
    }
}
