//! Shared types used across flowgrid crates.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// How the nodes of a role are torn down on shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ShutdownAction {
    #[default]
    Terminate,
    TerminateHard,
}

impl ShutdownAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            ShutdownAction::Terminate => "terminate",
            ShutdownAction::TerminateHard => "terminate-hard",
        }
    }

    /// Whether the first tier of the cascade is already the hard variant.
    pub fn is_hard(&self) -> bool {
        matches!(self, ShutdownAction::TerminateHard)
    }
}

impl fmt::Display for ShutdownAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ShutdownAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "terminate" => Ok(ShutdownAction::Terminate),
            "terminate-hard" => Ok(ShutdownAction::TerminateHard),
            other => Err(format!("unknown shutdown action: {other}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shutdown_action_round_trips_through_str() {
        for action in [ShutdownAction::Terminate, ShutdownAction::TerminateHard] {
            assert_eq!(action.as_str().parse::<ShutdownAction>(), Ok(action));
        }
        assert!("poweroff".parse::<ShutdownAction>().is_err());
    }

    #[test]
    fn shutdown_action_serializes_kebab_case() {
        let json = serde_json::to_string(&ShutdownAction::TerminateHard).unwrap();
        assert_eq!(json, "\"terminate-hard\"");
    }
}
