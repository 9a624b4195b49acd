//! Which nodes the watchdog follows, grouped by service and role.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use flowgrid_state::{NodeId, Service, ServiceId};

pub type RoleNodes = BTreeMap<String, BTreeSet<NodeId>>;

#[derive(Debug, Default)]
pub struct MonitorIndex {
    services: HashMap<ServiceId, RoleNodes>,
}

impl MonitorIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the entry for `service` with its current role nodes.
    /// Roles without nodes are left out. Returns the node count.
    pub fn insert_service(&mut self, service: &Service) -> usize {
        let roles: RoleNodes = service
            .roles
            .iter()
            .filter(|r| !r.nodes.is_empty())
            .map(|r| (r.name.clone(), r.node_ids().into_iter().collect()))
            .collect();
        let count = roles.values().map(BTreeSet::len).sum();
        if roles.is_empty() {
            self.services.remove(&service.id);
        } else {
            self.services.insert(service.id, roles);
        }
        count
    }

    pub fn remove_service(&mut self, service_id: ServiceId) -> Option<RoleNodes> {
        self.services.remove(&service_id)
    }

    /// Returns false if the node was already present.
    pub fn add_node(&mut self, service_id: ServiceId, role: &str, node_id: NodeId) -> bool {
        self.services
            .entry(service_id)
            .or_default()
            .entry(role.to_string())
            .or_default()
            .insert(node_id)
    }

    /// Drop one node. Empty roles, then empty services, are dropped with it.
    pub fn remove_node(&mut self, service_id: ServiceId, role: &str, node_id: NodeId) -> bool {
        let Some(roles) = self.services.get_mut(&service_id) else {
            return false;
        };
        let Some(nodes) = roles.get_mut(role) else {
            return false;
        };
        let removed = nodes.remove(&node_id);
        if nodes.is_empty() {
            roles.remove(role);
        }
        if roles.is_empty() {
            self.services.remove(&service_id);
        }
        removed
    }

    /// Role a monitored node belongs to.
    pub fn role_of(&self, service_id: ServiceId, node_id: NodeId) -> Option<String> {
        self.services.get(&service_id).and_then(|roles| {
            roles
                .iter()
                .find(|(_, nodes)| nodes.contains(&node_id))
                .map(|(role, _)| role.clone())
        })
    }

    pub fn nodes_of(&self, service_id: ServiceId) -> BTreeSet<NodeId> {
        self.services
            .get(&service_id)
            .map(|roles| roles.values().flatten().copied().collect())
            .unwrap_or_default()
    }

    pub fn roles_of(&self, service_id: ServiceId) -> Option<&RoleNodes> {
        self.services.get(&service_id)
    }

    pub fn contains(&self, service_id: ServiceId) -> bool {
        self.services.contains_key(&service_id)
    }

    pub fn services(&self) -> Vec<ServiceId> {
        let mut ids: Vec<_> = self.services.keys().copied().collect();
        ids.sort_unstable();
        ids
    }
}
