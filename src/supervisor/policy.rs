//! Supervisor policies.
//!
//! | Policy    | Values                         | Default |
//! |-----------|--------------------------------|---------|
//! | failure   | `stop`, `continue`             | `stop`  |
//! | gate      | `off`, `best-effort`, `required` | `off` |
//! | landing   | `off`, `commit`                | `off`   |

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::errors::ConfigError;

/// What the loop does after a cycle exhausts its attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailurePolicy {
    #[default]
    Stop,
    Continue,
}

/// Whether the gate script's failure blocks a cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum GatePolicy {
    #[default]
    Off,
    /// Run the script, warn on failure.
    BestEffort,
    /// A missing or failing script fails the cycle.
    Required,
}

/// Whether a successful cycle is committed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LandingPolicy {
    #[default]
    Off,
    Commit,
}

fn normalized(s: &str) -> String {
    s.trim().to_lowercase().replace('_', "-")
}

impl FromStr for FailurePolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match normalized(s).as_str() {
            "stop" => Ok(FailurePolicy::Stop),
            "continue" => Ok(FailurePolicy::Continue),
            _ => Err(ConfigError::InvalidPolicy {
                kind: "failure policy",
                value: s.to_string(),
                valid: "stop, continue",
            }),
        }
    }
}

impl FromStr for GatePolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match normalized(s).as_str() {
            "off" => Ok(GatePolicy::Off),
            "best-effort" => Ok(GatePolicy::BestEffort),
            "required" => Ok(GatePolicy::Required),
            _ => Err(ConfigError::InvalidPolicy {
                kind: "gate policy",
                value: s.to_string(),
                valid: "off, best-effort, required",
            }),
        }
    }
}

impl FromStr for LandingPolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match normalized(s).as_str() {
            "off" => Ok(LandingPolicy::Off),
            "commit" => Ok(LandingPolicy::Commit),
            _ => Err(ConfigError::InvalidPolicy {
                kind: "landing policy",
                value: s.to_string(),
                valid: "off, commit",
            }),
        }
    }
}

impl fmt::Display for FailurePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailurePolicy::Stop => write!(f, "stop"),
            FailurePolicy::Continue => write!(f, "continue"),
        }
    }
}

impl fmt::Display for GatePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GatePolicy::Off => write!(f, "off"),
            GatePolicy::BestEffort => write!(f, "best-effort"),
            GatePolicy::Required => write!(f, "required"),
        }
    }
}

impl fmt::Display for LandingPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LandingPolicy::Off => write!(f, "off"),
            LandingPolicy::Commit => write!(f, "commit"),
        }
    }
}
