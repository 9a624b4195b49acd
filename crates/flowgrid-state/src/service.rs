//! Service-level helpers over the role DAG.

use std::collections::HashSet;

use tracing::{error, info};

use crate::error::ValidationError;
use crate::types::*;

/// Entries kept in a service's log; older ones are dropped.
pub const MAX_LOG_ENTRIES: usize = 100;

impl Service {
    pub fn new(id: ServiceId, name: &str, roles: Vec<Role>) -> Self {
        Self {
            id,
            name: name.to_string(),
            state: ServiceState::Pending,
            roles,
            shutdown_action: None,
            owner: Owner::default(),
            log: Vec::new(),
        }
    }

    pub fn role(&self, name: &str) -> Option<&Role> {
        self.roles.iter().find(|r| r.name == name)
    }

    pub fn role_mut(&mut self, name: &str) -> Option<&mut Role> {
        self.roles.iter_mut().find(|r| r.name == name)
    }

    /// Check the role set before admitting the service into the pool.
    ///
    /// Cycles in the parent graph are not detected.
    pub fn validate(&self) -> Result<(), ValidationError> {
        let mut names = HashSet::new();
        for role in &self.roles {
            if !names.insert(role.name.as_str()) {
                return Err(ValidationError::DuplicateRole(role.name.clone()));
            }
        }

        for role in &self.roles {
            for parent in &role.parents {
                if *parent == role.name {
                    return Err(ValidationError::SelfParent(role.name.clone()));
                }
                if !names.contains(parent.as_str()) {
                    return Err(ValidationError::UnknownParent {
                        role: role.name.clone(),
                        parent: parent.clone(),
                    });
                }
            }

            let min = role.min_cardinality();
            if let Some(max) = role.max_vms {
                if min > max {
                    return Err(ValidationError::InvertedBounds {
                        role: role.name.clone(),
                        min,
                        max,
                    });
                }
                if role.cardinality < min || role.cardinality > max {
                    return Err(ValidationError::CardinalityOutOfBounds {
                        role: role.name.clone(),
                        cardinality: role.cardinality,
                        min,
                        max,
                    });
                }
            } else if role.cardinality < min {
                return Err(ValidationError::CardinalityOutOfBounds {
                    role: role.name.clone(),
                    cardinality: role.cardinality,
                    min,
                    max: u32::MAX,
                });
            }

            for policy in &role.elasticity_policies {
                policy.parse_expression()?;
            }
        }
        Ok(())
    }

    /// PENDING roles whose parents are all RUNNING.
    pub fn roles_ready_to_deploy(&self) -> Vec<&Role> {
        self.roles
            .iter()
            .filter(|r| r.state == RoleState::Pending && r.parents_running(self))
            .collect()
    }

    /// Roles not yet DONE whose dependents have all reached DONE.
    pub fn roles_ready_to_undeploy(&self) -> Vec<&Role> {
        self.roles
            .iter()
            .filter(|r| r.state != RoleState::Done && r.can_recover_undeploy(self))
            .collect()
    }

    /// The role currently SCALING or FAILED_SCALING, if any.
    pub fn scaling_role(&self) -> Option<&Role> {
        self.roles
            .iter()
            .find(|r| matches!(r.state, RoleState::Scaling | RoleState::FailedScaling))
    }

    /// A new scale may start: the service is RUNNING and no role is in a
    /// transition.
    pub fn can_scale(&self) -> bool {
        self.state == ServiceState::Running
            && !self.roles.iter().any(|r| {
                matches!(
                    r.state,
                    RoleState::Scaling
                        | RoleState::FailedScaling
                        | RoleState::Deploying
                        | RoleState::Undeploying
                )
            })
    }

    pub fn all_roles_in(&self, states: &[RoleState]) -> bool {
        self.roles.iter().all(|r| states.contains(&r.state))
    }

    pub fn any_role_failed(&self) -> bool {
        self.roles.iter().any(|r| r.state.is_failed())
    }

    /// Every node id across all roles.
    pub fn node_ids(&self) -> Vec<NodeId> {
        self.roles.iter().flat_map(|r| r.node_ids()).collect()
    }

    /// Effective shutdown action for `role`: role override, then service
    /// default, then `fallback`.
    pub fn shutdown_action_for(&self, role: &Role, fallback: ShutdownAction) -> ShutdownAction {
        role.shutdown_action_or(self.shutdown_action.unwrap_or(fallback))
    }

    pub fn log_info(&mut self, message: impl Into<String>) {
        let message = message.into();
        info!(service_id = self.id, "{message}");
        self.push_log(LogSeverity::Info, message);
    }

    pub fn log_error(&mut self, message: impl Into<String>) {
        let message = message.into();
        error!(service_id = self.id, "{message}");
        self.push_log(LogSeverity::Error, message);
    }

    fn push_log(&mut self, severity: LogSeverity, message: String) {
        self.log.push(LogEntry {
            timestamp: epoch_secs(),
            severity,
            message,
        });
        if self.log.len() > MAX_LOG_ENTRIES {
            let excess = self.log.len() - MAX_LOG_ENTRIES;
            self.log.drain(..excess);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::{ElasticityPolicy, PolicyKind};

    fn tiered() -> Service {
        let db = Role::new("db", 0, 1);
        let mut web = Role::new("web", 0, 2);
        web.parents.push("db".to_string());
        let mut lb = Role::new("lb", 0, 1);
        lb.parents.push("web".to_string());
        Service::new(3, "shop", vec![db, web, lb])
    }

    #[test]
    fn validate_accepts_well_formed_dag() {
        assert!(tiered().validate().is_ok());
    }

    #[test]
    fn validate_rejects_duplicates_and_bad_parents() {
        let mut svc = tiered();
        svc.roles.push(Role::new("db", 0, 1));
        assert_eq!(
            svc.validate(),
            Err(ValidationError::DuplicateRole("db".to_string()))
        );

        let mut svc = tiered();
        svc.roles[0].parents.push("cache".to_string());
        assert!(matches!(
            svc.validate(),
            Err(ValidationError::UnknownParent { .. })
        ));

        let mut svc = tiered();
        svc.roles[0].parents.push("db".to_string());
        assert_eq!(
            svc.validate(),
            Err(ValidationError::SelfParent("db".to_string()))
        );
    }

    #[test]
    fn validate_checks_bounds_and_expressions() {
        let mut svc = tiered();
        svc.roles[1].min_vms = Some(3);
        svc.roles[1].max_vms = Some(2);
        assert!(matches!(
            svc.validate(),
            Err(ValidationError::InvertedBounds { .. })
        ));

        let mut svc = tiered();
        svc.roles[1].max_vms = Some(1);
        assert!(matches!(
            svc.validate(),
            Err(ValidationError::CardinalityOutOfBounds { .. })
        ));

        let mut svc = tiered();
        svc.roles[1]
            .elasticity_policies
            .push(ElasticityPolicy::new(PolicyKind::Change { adjust: 1 }, "CPU >"));
        assert!(matches!(
            svc.validate(),
            Err(ValidationError::MalformedExpression { .. })
        ));
    }

    #[test]
    fn deploy_order_follows_parents() {
        let mut svc = tiered();
        let ready: Vec<_> = svc.roles_ready_to_deploy().iter().map(|r| r.name.clone()).collect();
        assert_eq!(ready, vec!["db"]);

        svc.roles[0].state = RoleState::Running;
        let ready: Vec<_> = svc.roles_ready_to_deploy().iter().map(|r| r.name.clone()).collect();
        assert_eq!(ready, vec!["web"]);
    }

    #[test]
    fn undeploy_order_is_reversed() {
        let mut svc = tiered();
        for role in &mut svc.roles {
            role.state = RoleState::Running;
        }
        let ready: Vec<_> = svc.roles_ready_to_undeploy().iter().map(|r| r.name.clone()).collect();
        assert_eq!(ready, vec!["lb"]);

        svc.roles[2].state = RoleState::Done;
        let ready: Vec<_> = svc.roles_ready_to_undeploy().iter().map(|r| r.name.clone()).collect();
        assert_eq!(ready, vec!["web"]);
    }

    #[test]
    fn can_scale_requires_quiet_running_service() {
        let mut svc = tiered();
        assert!(!svc.can_scale());

        svc.state = ServiceState::Running;
        for role in &mut svc.roles {
            role.state = RoleState::Running;
        }
        assert!(svc.can_scale());

        svc.roles[1].state = RoleState::FailedScaling;
        assert!(!svc.can_scale());
        assert_eq!(svc.scaling_role().map(|r| r.name.as_str()), Some("web"));
        assert!(svc.any_role_failed());
    }

    #[test]
    fn all_roles_in_checks_every_role() {
        let mut svc = tiered();
        assert!(svc.all_roles_in(&[RoleState::Pending]));
        svc.roles[0].state = RoleState::Done;
        assert!(!svc.all_roles_in(&[RoleState::Pending]));
        assert!(svc.all_roles_in(&[RoleState::Pending, RoleState::Done]));
    }

    #[test]
    fn shutdown_action_resolution_order() {
        let mut svc = tiered();
        let fallback = ShutdownAction::Terminate;
        assert_eq!(svc.shutdown_action_for(&svc.roles[0], fallback), ShutdownAction::Terminate);

        svc.shutdown_action = Some(ShutdownAction::TerminateHard);
        assert_eq!(
            svc.shutdown_action_for(&svc.roles[0], fallback),
            ShutdownAction::TerminateHard
        );

        svc.roles[0].shutdown_action = Some(ShutdownAction::Terminate);
        assert_eq!(svc.shutdown_action_for(&svc.roles[0], fallback), ShutdownAction::Terminate);
    }

    #[test]
    fn log_is_bounded() {
        let mut svc = tiered();
        for i in 0..(MAX_LOG_ENTRIES + 5) {
            svc.log_info(format!("entry {i}"));
        }
        svc.log_error("boom");
        assert_eq!(svc.log.len(), MAX_LOG_ENTRIES);
        assert_eq!(svc.log[0].message, "entry 6");
        assert_eq!(svc.log.last().map(|e| e.severity), Some(LogSeverity::Error));
    }
}
