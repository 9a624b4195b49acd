//! VM state vocabulary reported by the hypervisor driver and event bus.
//!
//! Names are the upper-case strings used on the wire. Names this crate does
//! not recognize are preserved verbatim in the `Other` variant so events from
//! a newer publisher still round-trip.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Declare a state enum with canonical wire names and an `Other` fallback.
macro_rules! wire_states {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $wire:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(from = "String", into = "String")]
        pub enum $name {
            $($variant,)+
            Other(String),
        }

        impl $name {
            pub fn as_str(&self) -> &str {
                match self {
                    $($name::$variant => $wire,)+
                    $name::Other(s) => s.as_str(),
                }
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                match s {
                    $($wire => $name::$variant,)+
                    other => $name::Other(other.to_string()),
                }
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                $name::from(s.as_str())
            }
        }

        impl From<$name> for String {
            fn from(state: $name) -> Self {
                state.as_str().to_string()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

wire_states! {
    /// Top-level VM state.
    VmState {
        Init => "INIT",
        Pending => "PENDING",
        Hold => "HOLD",
        Active => "ACTIVE",
        Stopped => "STOPPED",
        Suspended => "SUSPENDED",
        Done => "DONE",
        Failed => "FAILED",
        Poweroff => "POWEROFF",
        Undeployed => "UNDEPLOYED",
        Cloning => "CLONING",
        CloningFailure => "CLONING_FAILURE",
    }
}

wire_states! {
    /// Life-cycle sub-state of an ACTIVE VM.
    LcmState {
        LcmInit => "LCM_INIT",
        Prolog => "PROLOG",
        Boot => "BOOT",
        Running => "RUNNING",
        Migrate => "MIGRATE",
        SaveStop => "SAVE_STOP",
        SaveSuspend => "SAVE_SUSPEND",
        SaveMigrate => "SAVE_MIGRATE",
        PrologMigrate => "PROLOG_MIGRATE",
        PrologResume => "PROLOG_RESUME",
        EpilogStop => "EPILOG_STOP",
        Epilog => "EPILOG",
        Shutdown => "SHUTDOWN",
        CleanupResubmit => "CLEANUP_RESUBMIT",
        Unknown => "UNKNOWN",
        Hotplug => "HOTPLUG",
        ShutdownPoweroff => "SHUTDOWN_POWEROFF",
        BootUnknown => "BOOT_UNKNOWN",
        BootPoweroff => "BOOT_POWEROFF",
        BootSuspended => "BOOT_SUSPENDED",
        BootStopped => "BOOT_STOPPED",
        CleanupDelete => "CLEANUP_DELETE",
        HotplugSnapshot => "HOTPLUG_SNAPSHOT",
        HotplugNic => "HOTPLUG_NIC",
        HotplugSaveas => "HOTPLUG_SAVEAS",
        ShutdownUndeploy => "SHUTDOWN_UNDEPLOY",
        EpilogUndeploy => "EPILOG_UNDEPLOY",
        PrologUndeploy => "PROLOG_UNDEPLOY",
        BootUndeploy => "BOOT_UNDEPLOY",
        BootFailure => "BOOT_FAILURE",
        BootMigrateFailure => "BOOT_MIGRATE_FAILURE",
        PrologMigrateFailure => "PROLOG_MIGRATE_FAILURE",
        PrologFailure => "PROLOG_FAILURE",
        EpilogFailure => "EPILOG_FAILURE",
        EpilogStopFailure => "EPILOG_STOP_FAILURE",
        EpilogUndeployFailure => "EPILOG_UNDEPLOY_FAILURE",
        PrologMigratePoweroffFailure => "PROLOG_MIGRATE_POWEROFF_FAILURE",
        PrologMigrateSuspendFailure => "PROLOG_MIGRATE_SUSPEND_FAILURE",
        PrologMigrateUnknownFailure => "PROLOG_MIGRATE_UNKNOWN_FAILURE",
        BootUndeployFailure => "BOOT_UNDEPLOY_FAILURE",
        BootStoppedFailure => "BOOT_STOPPED_FAILURE",
        PrologResumeFailure => "PROLOG_RESUME_FAILURE",
        PrologUndeployFailure => "PROLOG_UNDEPLOY_FAILURE",
    }
}

impl VmState {
    /// Whether this VM state alone puts the node in the watchdog's warning set.
    pub fn is_warning(&self) -> bool {
        matches!(self, VmState::Poweroff)
    }
}

impl LcmState {
    /// One of the recognized `*_FAILURE` life-cycle states.
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            LcmState::BootFailure
                | LcmState::BootMigrateFailure
                | LcmState::PrologMigrateFailure
                | LcmState::PrologFailure
                | LcmState::EpilogFailure
                | LcmState::EpilogStopFailure
                | LcmState::EpilogUndeployFailure
                | LcmState::PrologMigratePoweroffFailure
                | LcmState::PrologMigrateSuspendFailure
                | LcmState::PrologMigrateUnknownFailure
                | LcmState::BootUndeployFailure
                | LcmState::BootStoppedFailure
                | LcmState::PrologResumeFailure
                | LcmState::PrologUndeployFailure
        )
    }

    /// UNKNOWN or any recognized failure.
    pub fn is_warning(&self) -> bool {
        matches!(self, LcmState::Unknown) || self.is_failure()
    }
}

/// True when the VM is ACTIVE but stuck in a recognized failure state, i.e.
/// it can be re-submitted through a recover call.
pub fn vm_failure(state: &VmState, lcm_state: &LcmState) -> bool {
    *state == VmState::Active && lcm_state.is_failure()
}

/// Health signal derived from a VM state pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthEvent {
    Error,
    Done,
    Running,
}

impl HealthEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthEvent::Error => "error",
            HealthEvent::Done => "done",
            HealthEvent::Running => "running",
        }
    }
}

impl fmt::Display for HealthEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn in_warning_set(name: &str) -> bool {
    VmState::from(name).is_warning() || LcmState::from(name).is_warning()
}

/// Classify a VM state pair. First match wins: warning set, then DONE, then
/// RUNNING; anything else carries no signal.
pub fn classify(state: &VmState, lcm_state: &LcmState) -> Option<HealthEvent> {
    // The warning set is matched by name against both fields.
    let warning = in_warning_set(state.as_str()) || in_warning_set(lcm_state.as_str());

    if warning {
        Some(HealthEvent::Error)
    } else if *state == VmState::Done {
        Some(HealthEvent::Done)
    } else if *lcm_state == LcmState::Running {
        Some(HealthEvent::Running)
    } else {
        None
    }
}
