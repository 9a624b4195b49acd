//! Domain types for services, roles, and nodes.
//!
//! These types are the persisted documents of the service pool. All of them
//! serialize to JSON for storage in redb tables and for the REST API.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

pub use flowgrid_core::ShutdownAction;

use crate::error::ValidationError;
use crate::policy::ElasticityPolicy;

/// Service (document) identifier.
pub type ServiceId = u64;

/// Hypervisor VM identifier; doubles as the node's deploy id.
pub type NodeId = u64;

// ── States ────────────────────────────────────────────────────────

/// Declare a state enum that is stored as its ordinal.
macro_rules! ordinal_states {
    ($(#[$meta:meta])* $name:ident { $($variant:ident = $ord:literal => $label:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "SCREAMING_SNAKE_CASE")]
        pub enum $name {
            $($variant,)+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant,)+];

            pub fn ordinal(&self) -> u32 {
                match self {
                    $($name::$variant => $ord,)+
                }
            }

            pub fn from_ordinal(ordinal: u32) -> Option<Self> {
                match ordinal {
                    $($ord => Some($name::$variant),)+
                    _ => None,
                }
            }

            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $label,)+
                }
            }
        }

        impl TryFrom<u32> for $name {
            type Error = ValidationError;

            fn try_from(ordinal: u32) -> Result<Self, Self::Error> {
                $name::from_ordinal(ordinal).ok_or(ValidationError::UnknownState(ordinal))
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

ordinal_states! {
    /// Life-cycle state of a role.
    RoleState {
        Pending = 0 => "PENDING",
        Deploying = 1 => "DEPLOYING",
        Running = 2 => "RUNNING",
        Undeploying = 3 => "UNDEPLOYING",
        Warning = 4 => "WARNING",
        Done = 5 => "DONE",
        FailedUndeploying = 6 => "FAILED_UNDEPLOYING",
        FailedDeploying = 7 => "FAILED_DEPLOYING",
        Scaling = 8 => "SCALING",
        FailedScaling = 9 => "FAILED_SCALING",
        Cooldown = 10 => "COOLDOWN",
    }
}

ordinal_states! {
    /// Life-cycle state of a service.
    ServiceState {
        Pending = 0 => "PENDING",
        Deploying = 1 => "DEPLOYING",
        Running = 2 => "RUNNING",
        Undeploying = 3 => "UNDEPLOYING",
        Warning = 4 => "WARNING",
        Done = 5 => "DONE",
        FailedUndeploying = 6 => "FAILED_UNDEPLOYING",
        FailedDeploying = 7 => "FAILED_DEPLOYING",
        Scaling = 8 => "SCALING",
        FailedScaling = 9 => "FAILED_SCALING",
        Cooldown = 10 => "COOLDOWN",
    }
}

impl RoleState {
    /// States from which a deploy may be (re)attempted.
    pub const RECOVER_DEPLOY: &'static [RoleState] = &[
        RoleState::FailedDeploying,
        RoleState::Deploying,
        RoleState::Pending,
    ];

    /// States from which an undeploy may be retried.
    pub const RECOVER_UNDEPLOY: &'static [RoleState] =
        &[RoleState::FailedUndeploying, RoleState::Undeploying];

    /// States from which a scale may be retried.
    pub const RECOVER_SCALE: &'static [RoleState] =
        &[RoleState::FailedScaling, RoleState::Scaling];

    /// A transition is in progress; no new intent may target the role.
    pub fn is_transitional(&self) -> bool {
        matches!(
            self,
            RoleState::Deploying
                | RoleState::Undeploying
                | RoleState::Scaling
                | RoleState::FailedScaling
        )
    }

    pub fn is_failed(&self) -> bool {
        matches!(
            self,
            RoleState::FailedDeploying | RoleState::FailedUndeploying | RoleState::FailedScaling
        )
    }
}

/// Direction of the scale operation in progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ScaleWay {
    Up,
    Down,
}

/// Recover operation requested from the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RecoverMode {
    Failure,
    Success,
    Retry,
    Delete,
    DeleteRecreate,
    DeleteDb,
}

/// Lifecycle actions that can be scheduled on every VM of a role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ScheduleAction {
    Terminate,
    TerminateHard,
    Undeploy,
    UndeployHard,
    Hold,
    Release,
    Stop,
    Suspend,
    Resume,
    Reboot,
    RebootHard,
    Poweroff,
    PoweroffHard,
    SnapshotCreate,
}

impl ScheduleAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScheduleAction::Terminate => "terminate",
            ScheduleAction::TerminateHard => "terminate-hard",
            ScheduleAction::Undeploy => "undeploy",
            ScheduleAction::UndeployHard => "undeploy-hard",
            ScheduleAction::Hold => "hold",
            ScheduleAction::Release => "release",
            ScheduleAction::Stop => "stop",
            ScheduleAction::Suspend => "suspend",
            ScheduleAction::Resume => "resume",
            ScheduleAction::Reboot => "reboot",
            ScheduleAction::RebootHard => "reboot-hard",
            ScheduleAction::Poweroff => "poweroff",
            ScheduleAction::PoweroffHard => "poweroff-hard",
            ScheduleAction::SnapshotCreate => "snapshot-create",
        }
    }
}

impl fmt::Display for ScheduleAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Node ──────────────────────────────────────────────────────────

/// Identity fields of a VM cached at creation time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmSnapshot {
    pub id: NodeId,
    pub uid: u32,
    pub gid: u32,
    pub uname: String,
    pub gname: String,
    pub name: String,
}

/// A VM owned by a role.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub deploy_id: NodeId,
    /// `None` when the post-create info call failed.
    #[serde(default)]
    pub vm_info: Option<VmSnapshot>,
}

impl Node {
    pub fn new(deploy_id: NodeId, vm_info: Option<VmSnapshot>) -> Self {
        Self { deploy_id, vm_info }
    }
}

// ── Role ──────────────────────────────────────────────────────────

/// A named, independently scalable group of homogeneous VMs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Role {
    pub name: String,
    pub state: RoleState,
    /// Desired VM count.
    pub cardinality: u32,
    #[serde(default)]
    pub min_vms: Option<u32>,
    #[serde(default)]
    pub max_vms: Option<u32>,
    /// Names of roles that must be RUNNING before this one deploys.
    #[serde(default)]
    pub parents: Vec<String>,
    /// Template instantiated for every node.
    pub vm_template: u64,
    /// Extra template attributes merged into each instantiation.
    #[serde(default)]
    pub vm_template_contents: Option<String>,
    #[serde(default)]
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub elasticity_policies: Vec<ElasticityPolicy>,
    /// Role-level cooldown override in seconds.
    #[serde(default)]
    pub cooldown: Option<u64>,
    /// Unix timestamp at which the current cooldown expires.
    #[serde(default)]
    pub cooldown_end: Option<u64>,
    /// Set only while SCALING.
    #[serde(default)]
    pub scale_way: Option<ScaleWay>,
    #[serde(default)]
    pub shutdown_action: Option<ShutdownAction>,
    /// Sequence number substituted for `$VM_NUMBER`.
    #[serde(default)]
    pub last_vmname: u64,
}

// ── Service ───────────────────────────────────────────────────────

/// Owner of a service document.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Owner {
    pub uid: u32,
    pub gid: u32,
    pub uname: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogSeverity {
    Info,
    Error,
}

/// One line of the per-service log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: u64,
    pub severity: LogSeverity,
    pub message: String,
}

/// A DAG of roles deployed, undeployed, and scaled as a unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Service {
    pub id: ServiceId,
    pub name: String,
    pub state: ServiceState,
    /// Roles in declaration order.
    pub roles: Vec<Role>,
    /// Service-wide shutdown action, overridden per role.
    #[serde(default)]
    pub shutdown_action: Option<ShutdownAction>,
    #[serde(default)]
    pub owner: Owner,
    #[serde(default)]
    pub log: Vec<LogEntry>,
}

// ── Metrics ───────────────────────────────────────────────────────

/// Latest metric values observed for one role, fed to the evaluator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoleMetrics {
    pub service_id: ServiceId,
    pub role: String,
    /// Unix timestamp of the observation.
    pub epoch: u64,
    /// Attribute name → value, e.g. `"CPU" → 83.5`.
    pub values: HashMap<String, f64>,
}

impl RoleMetrics {
    /// Build the composite key for the metrics table.
    pub fn table_key(&self) -> String {
        role_key(self.service_id, &self.role)
    }

    pub fn value(&self, attribute: &str) -> Option<f64> {
        self.values.get(attribute).copied()
    }
}

/// Composite `{service_id}/{role}` key.
pub fn role_key(service_id: ServiceId, role: &str) -> String {
    format!("{service_id}/{role}")
}

impl Service {
    /// Build the key for the services table. Zero-padded so lexical order
    /// matches numeric order.
    pub fn table_key(&self) -> String {
        service_key(self.id)
    }
}

pub fn service_key(id: ServiceId) -> String {
    format!("{id:020}")
}

/// Seconds since the Unix epoch.
pub fn epoch_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
