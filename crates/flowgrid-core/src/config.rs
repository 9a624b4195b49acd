//! flowgrid.toml configuration parser.
//!
//! Every section and field has a default, so an empty file (or no file at
//! all) yields a usable configuration. Durations are kept as strings in the
//! file and resolved through [`parse_duration`].

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::duration::parse_duration;
use crate::types::ShutdownAction;

/// Default VM name template; tokens are substituted per instantiation.
pub const DEFAULT_VM_NAME_TEMPLATE: &str = "$ROLE_NAME_$VM_NUMBER_(service_$SERVICE_ID)";

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid duration for {field}: {value:?}")]
    Duration { field: &'static str, value: String },

    #[error("invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FlowConfig {
    pub autoscaler: AutoscalerConfig,
    pub watchdog: WatchdogConfig,
    pub roles: RolesConfig,
    pub driver: DriverConfig,
    pub lcm: LcmConfig,
    pub auth: AuthConfig,
    pub state: StateConfig,
    pub api: ApiConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoscalerConfig {
    /// Poll interval between control-loop ticks.
    pub interval: String,
    /// Cooldown applied when neither the policy nor the role sets one.
    pub default_cooldown: String,
}

impl Default for AutoscalerConfig {
    fn default() -> Self {
        Self {
            interval: "30s".to_string(),
            default_cooldown: "300s".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchdogConfig {
    pub subscriber_endpoint: String,
    /// Bounded receive timeout on the subscriber socket.
    pub timeout: String,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            subscriber_endpoint: "tcp://localhost:2101".to_string(),
            timeout: "30s".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RolesConfig {
    pub default_shutdown_action: ShutdownAction,
    /// Whether the shutdown cascade may fall back to deleting the VM.
    pub force_deletion: bool,
    pub vm_name_template: String,
    /// Upper bound on any single driver call.
    pub driver_timeout: String,
}

impl Default for RolesConfig {
    fn default() -> Self {
        Self {
            default_shutdown_action: ShutdownAction::Terminate,
            force_deletion: true,
            vm_name_template: DEFAULT_VM_NAME_TEMPLATE.to_string(),
            driver_timeout: "60s".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverConfig {
    pub endpoint: String,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://127.0.0.1:2633".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LcmConfig {
    pub endpoint: String,
    /// Capacity of the intent channel feeding the dispatcher.
    pub queue_depth: usize,
}

impl Default for LcmConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://127.0.0.1:2474".to_string(),
            queue_depth: 256,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub user: String,
    pub token: String,
    /// File holding `user:token`; takes precedence over the inline values.
    pub token_file: Option<PathBuf>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            user: "flowgrid".to_string(),
            token: String::new(),
            token_file: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StateConfig {
    pub path: PathBuf,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("/var/lib/flowgrid/flowgrid.redb"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub listen: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:2475".to_string(),
        }
    }
}

/// Defaults handed to role operations at construction time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoleDefaults {
    pub shutdown_action: ShutdownAction,
    pub force_deletion: bool,
    pub vm_name_template: String,
    pub cooldown: Duration,
}

impl Default for RoleDefaults {
    fn default() -> Self {
        Self {
            shutdown_action: ShutdownAction::Terminate,
            force_deletion: true,
            vm_name_template: DEFAULT_VM_NAME_TEMPLATE.to_string(),
            cooldown: Duration::from_secs(300),
        }
    }
}

impl FlowConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: FlowConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Check that every duration parses and the numeric knobs are sane.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.poll_interval()?;
        self.default_cooldown()?;
        self.watchdog_timeout()?;
        self.driver_timeout()?;

        if self.poll_interval()?.is_zero() {
            return Err(ConfigError::Invalid {
                field: "autoscaler.interval",
                reason: "must be positive".to_string(),
            });
        }
        if self.lcm.queue_depth == 0 {
            return Err(ConfigError::Invalid {
                field: "lcm.queue_depth",
                reason: "must be positive".to_string(),
            });
        }
        if self.roles.vm_name_template.trim().is_empty() {
            return Err(ConfigError::Invalid {
                field: "roles.vm_name_template",
                reason: "must not be empty".to_string(),
            });
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Result<Duration, ConfigError> {
        duration_field("autoscaler.interval", &self.autoscaler.interval)
    }

    pub fn default_cooldown(&self) -> Result<Duration, ConfigError> {
        duration_field("autoscaler.default_cooldown", &self.autoscaler.default_cooldown)
    }

    pub fn watchdog_timeout(&self) -> Result<Duration, ConfigError> {
        duration_field("watchdog.timeout", &self.watchdog.timeout)
    }

    pub fn driver_timeout(&self) -> Result<Duration, ConfigError> {
        duration_field("roles.driver_timeout", &self.roles.driver_timeout)
    }

    /// Collect the role-operation defaults into an explicit value.
    pub fn role_defaults(&self) -> Result<RoleDefaults, ConfigError> {
        Ok(RoleDefaults {
            shutdown_action: self.roles.default_shutdown_action,
            force_deletion: self.roles.force_deletion,
            vm_name_template: self.roles.vm_name_template.clone(),
            cooldown: self.default_cooldown()?,
        })
    }

    pub fn to_toml_string(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }
}

fn duration_field(field: &'static str, value: &str) -> Result<Duration, ConfigError> {
    parse_duration(value).ok_or_else(|| ConfigError::Duration {
        field,
        value: value.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_uses_defaults() {
        let config = FlowConfig::from_toml("").unwrap();
        assert_eq!(config.poll_interval().unwrap(), Duration::from_secs(30));
        assert_eq!(config.default_cooldown().unwrap(), Duration::from_secs(300));
        assert_eq!(config.watchdog.subscriber_endpoint, "tcp://localhost:2101");
        assert_eq!(config.roles.vm_name_template, DEFAULT_VM_NAME_TEMPLATE);
        assert!(config.roles.force_deletion);
    }

    #[test]
    fn parse_partial_sections() {
        let toml_str = r#"
[autoscaler]
interval = "5s"

[roles]
default_shutdown_action = "terminate-hard"
force_deletion = false
"#;
        let config = FlowConfig::from_toml(toml_str).unwrap();
        assert_eq!(config.poll_interval().unwrap(), Duration::from_secs(5));
        // Unset fields in a present section still default.
        assert_eq!(config.default_cooldown().unwrap(), Duration::from_secs(300));

        let defaults = config.role_defaults().unwrap();
        assert_eq!(defaults.shutdown_action, ShutdownAction::TerminateHard);
        assert!(!defaults.force_deletion);
    }

    #[test]
    fn bad_duration_is_rejected() {
        let err = FlowConfig::from_toml("[watchdog]\ntimeout = \"forever\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::Duration { field: "watchdog.timeout", .. }));
    }

    #[test]
    fn zero_interval_is_rejected() {
        let err = FlowConfig::from_toml("[autoscaler]\ninterval = \"0s\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "autoscaler.interval", .. }));
    }

    #[test]
    fn from_file_reads_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("flowgrid.toml");
        std::fs::write(&path, "[lcm]\nqueue_depth = 8\n").unwrap();

        let config = FlowConfig::from_file(&path).unwrap();
        assert_eq!(config.lcm.queue_depth, 8);
    }

    #[test]
    fn missing_file_reports_path() {
        let err = FlowConfig::from_file(Path::new("/nonexistent/flowgrid.toml")).unwrap_err();
        assert!(err.to_string().contains("/nonexistent/flowgrid.toml"));
    }

    #[test]
    fn defaults_render_back_to_toml() {
        let rendered = FlowConfig::default().to_toml_string().unwrap();
        let reparsed = FlowConfig::from_toml(&rendered).unwrap();
        assert_eq!(reparsed.api.listen, "0.0.0.0:2475");
    }
}
