//! Driver-free role transitions and recovery predicates.
//!
//! Everything here mutates only the in-memory `Role`; operations that talk
//! to the hypervisor live in `flowgrid-role`.

use tracing::{debug, info};

use crate::error::ValidationError;
use crate::types::*;

impl Role {
    /// A PENDING role with no nodes, policies, or bounds.
    pub fn new(name: &str, vm_template: u64, cardinality: u32) -> Self {
        Self {
            name: name.to_string(),
            state: RoleState::Pending,
            cardinality,
            min_vms: None,
            max_vms: None,
            parents: Vec::new(),
            vm_template,
            vm_template_contents: None,
            nodes: Vec::new(),
            elasticity_policies: Vec::new(),
            cooldown: None,
            cooldown_end: None,
            scale_way: None,
            shutdown_action: None,
            last_vmname: 0,
        }
    }

    /// Lower cardinality bound; 0 when unset.
    pub fn min_cardinality(&self) -> u32 {
        self.min_vms.unwrap_or(0)
    }

    pub fn max_cardinality(&self) -> Option<u32> {
        self.max_vms
    }

    pub fn node_ids(&self) -> Vec<NodeId> {
        self.nodes.iter().map(|n| n.deploy_id).collect()
    }

    /// Move to `state`. Entering SCALING starts a fresh evaluation window on
    /// every policy.
    pub fn set_state(&mut self, state: RoleState) {
        if state == RoleState::Scaling {
            for policy in &mut self.elasticity_policies {
                policy.clear_evals();
            }
        }
        if self.state != state {
            debug!(role = %self.name, from = %self.state, to = %state, "role state change");
        }
        self.state = state;
    }

    /// Like [`Role::set_state`], taking a raw ordinal.
    pub fn set_state_ordinal(&mut self, ordinal: u32) -> Result<(), ValidationError> {
        let state = RoleState::try_from(ordinal)?;
        self.set_state(state);
        Ok(())
    }

    /// Request a new cardinality. Unless `force` is set, the request must
    /// fall within `[min_vms, max_vms]`. Does not deploy or shut down nodes.
    pub fn update(&mut self, cardinality: u32, force: bool) -> Result<(), ValidationError> {
        if !force {
            let min = self.min_cardinality();
            if cardinality < min {
                return Err(ValidationError::BelowMinimum { min });
            }
            match self.max_vms {
                Some(max) if cardinality > max => {
                    return Err(ValidationError::AboveMaximum { max });
                }
                _ => {}
            }
        }
        self.set_cardinality(cardinality);
        Ok(())
    }

    pub fn set_cardinality(&mut self, cardinality: u32) {
        let old = self.cardinality;
        if cardinality != old {
            let direction = if cardinality > old { "up" } else { "down" };
            info!(role = %self.name, old, new = cardinality, direction, "role cardinality changed");
        }
        self.cardinality = cardinality;
    }

    pub fn set_scale_way(&mut self, way: ScaleWay) {
        self.scale_way = Some(way);
    }

    pub fn clean_scale_way(&mut self) {
        self.scale_way = None;
    }

    /// Role override, else `fallback`.
    pub fn shutdown_action_or(&self, fallback: ShutdownAction) -> ShutdownAction {
        self.shutdown_action.unwrap_or(fallback)
    }

    /// Seconds of cooldown left at `now`, 0 when none is active.
    pub fn cooldown_remaining(&self, now: u64) -> u64 {
        self.cooldown_end
            .map(|end| end.saturating_sub(now))
            .unwrap_or(0)
    }

    /// Every parent role exists in `service` and is RUNNING.
    pub fn parents_running(&self, service: &Service) -> bool {
        self.parents.iter().all(|parent| {
            service
                .role(parent)
                .is_some_and(|r| r.state == RoleState::Running)
        })
    }

    /// Roles of `service` that list this role as a parent.
    pub fn dependents<'a>(&'a self, service: &'a Service) -> impl Iterator<Item = &'a Role> + 'a {
        service
            .roles
            .iter()
            .filter(move |r| r.parents.iter().any(|p| *p == self.name))
    }

    pub fn can_recover_deploy(&self, service: &Service) -> bool {
        if !RoleState::RECOVER_DEPLOY.contains(&self.state) {
            return false;
        }
        self.state != RoleState::Pending || self.parents_running(service)
    }

    /// False while any dependent role has not reached DONE.
    pub fn can_recover_undeploy(&self, service: &Service) -> bool {
        self.dependents(service).all(|r| r.state == RoleState::Done)
    }

    pub fn can_recover_scale(&self) -> bool {
        RoleState::RECOVER_SCALE.contains(&self.state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::{ElasticityPolicy, PolicyKind};

    fn service(roles: Vec<Role>) -> Service {
        Service::new(1, "svc", roles)
    }

    fn child_of(name: &str, parent: &str) -> Role {
        let mut role = Role::new(name, 0, 1);
        role.parents.push(parent.to_string());
        role
    }

    #[test]
    fn update_enforces_bounds() {
        let mut role = Role::new("web", 0, 2);
        role.min_vms = Some(1);
        role.max_vms = Some(4);

        assert_eq!(
            role.update(0, false),
            Err(ValidationError::BelowMinimum { min: 1 })
        );
        assert_eq!(
            role.update(5, false),
            Err(ValidationError::AboveMaximum { max: 4 })
        );
        assert_eq!(role.cardinality, 2);

        role.update(4, false).unwrap();
        assert_eq!(role.cardinality, 4);
    }

    #[test]
    fn forced_update_skips_bounds() {
        let mut role = Role::new("web", 0, 2);
        role.max_vms = Some(3);
        role.update(10, true).unwrap();
        assert_eq!(role.cardinality, 10);
    }

    #[test]
    fn error_messages_name_the_bound() {
        assert_eq!(
            ValidationError::BelowMinimum { min: 2 }.to_string(),
            "Minimum cardinality is 2"
        );
        assert_eq!(
            ValidationError::AboveMaximum { max: 5 }.to_string(),
            "Maximum cardinality is 5"
        );
    }

    #[test]
    fn entering_scaling_clears_true_evals() {
        let mut role = Role::new("web", 0, 1);
        let mut policy = ElasticityPolicy::new(PolicyKind::Change { adjust: 1 }, "CPU > 80");
        policy.record(true, 10);
        role.elasticity_policies.push(policy);

        role.set_state(RoleState::Cooldown);
        assert_eq!(role.elasticity_policies[0].true_evals.len(), 1);

        role.set_state(RoleState::Scaling);
        assert!(role.elasticity_policies[0].true_evals.is_empty());
        assert!(role.elasticity_policies[0].last_eval.is_none());
    }

    #[test]
    fn unknown_ordinal_leaves_state_unchanged() {
        let mut role = Role::new("web", 0, 1);
        role.state = RoleState::Running;
        assert_eq!(
            role.set_state_ordinal(99),
            Err(ValidationError::UnknownState(99))
        );
        assert_eq!(role.state, RoleState::Running);
        role.set_state_ordinal(5).unwrap();
        assert_eq!(role.state, RoleState::Done);
    }

    #[test]
    fn pending_deploy_requires_running_parents() {
        let mut db = Role::new("db", 0, 1);
        let web = child_of("web", "db");
        let svc = service(vec![db.clone(), web.clone()]);
        assert!(!web.can_recover_deploy(&svc));

        db.state = RoleState::Running;
        let svc = service(vec![db, web.clone()]);
        assert!(web.can_recover_deploy(&svc));
    }

    #[test]
    fn failed_deploy_recovers_regardless_of_parents() {
        let db = Role::new("db", 0, 1);
        let mut web = child_of("web", "db");
        web.state = RoleState::FailedDeploying;
        let svc = service(vec![db, web.clone()]);
        assert!(web.can_recover_deploy(&svc));

        web.state = RoleState::Running;
        assert!(!web.can_recover_deploy(&svc));
    }

    #[test]
    fn undeploy_blocked_by_live_dependents() {
        let mut db = Role::new("db", 0, 1);
        db.state = RoleState::FailedUndeploying;
        let mut web = child_of("web", "db");
        web.state = RoleState::Running;

        let svc = service(vec![db.clone(), web.clone()]);
        assert!(!db.can_recover_undeploy(&svc));

        web.state = RoleState::Done;
        let svc = service(vec![db.clone(), web]);
        assert!(db.can_recover_undeploy(&svc));
    }

    #[test]
    fn scale_recovery_only_from_scaling_states() {
        let mut role = Role::new("web", 0, 1);
        for state in RoleState::ALL {
            role.state = *state;
            let expected = matches!(state, RoleState::Scaling | RoleState::FailedScaling);
            assert_eq!(role.can_recover_scale(), expected, "{state}");
        }
    }

    #[test]
    fn cooldown_remaining_saturates() {
        let mut role = Role::new("web", 0, 1);
        assert_eq!(role.cooldown_remaining(100), 0);
        role.cooldown_end = Some(160);
        assert_eq!(role.cooldown_remaining(100), 60);
        assert_eq!(role.cooldown_remaining(200), 0);
    }
}
