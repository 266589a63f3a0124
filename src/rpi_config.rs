//! File-backed configuration layers for the RPI orchestrator.
//!
//! Two TOML files are read, highest precedence first:
//! - project: `.agents/rpi/config.toml`
//! - user: `<config_dir>/forge-rpi/config.toml`
//!
//! Every field is optional so a higher layer only overrides what it sets.
//! Environment variables and CLI flags are applied on top by `config`.
//!
//! # Configuration File Format
//!
//! ```toml
//! [runtime]
//! mode = "auto"            # auto | direct | stream
//! command = "claude"
//! tmux_command = "tmux"
//! tracker_command = "bd"
//!
//! [run]
//! max_retries = 3
//! phase_timeout = "90m"
//! stall_timeout = "10m"
//! stream_startup_timeout = "45s"
//! stall_check_interval = "30s"
//! swarm_first = true
//! live_status = false
//! heartbeat_freshness = "5m"
//!
//! [supervisor]
//! failure_policy = "stop"  # stop | continue
//! gate_policy = "off"      # off | best-effort | required
//! gate_script = "scripts/validate.sh"
//! landing_policy = "off"   # off | commit
//! commit_template = "chore(rpi): land cycle {cycle} - {goal}"
//! kill_switch = ".agents/rpi/KILL"
//! lease_ttl = "2m"
//! cleanup_after_cycle = false
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// `[runtime]` section.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuntimeSection {
    #[serde(default)]
    pub mode: Option<String>,
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub tmux_command: Option<String>,
    #[serde(default)]
    pub tracker_command: Option<String>,
}

/// `[run]` section. Durations are humane strings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunSection {
    #[serde(default)]
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub phase_timeout: Option<String>,
    #[serde(default)]
    pub stall_timeout: Option<String>,
    #[serde(default)]
    pub stream_startup_timeout: Option<String>,
    #[serde(default)]
    pub stall_check_interval: Option<String>,
    #[serde(default)]
    pub swarm_first: Option<bool>,
    #[serde(default)]
    pub live_status: Option<bool>,
    #[serde(default)]
    pub heartbeat_freshness: Option<String>,
}

/// `[supervisor]` section.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SupervisorSection {
    #[serde(default)]
    pub failure_policy: Option<String>,
    #[serde(default)]
    pub gate_policy: Option<String>,
    #[serde(default)]
    pub gate_script: Option<String>,
    #[serde(default)]
    pub landing_policy: Option<String>,
    #[serde(default)]
    pub commit_template: Option<String>,
    #[serde(default)]
    pub kill_switch: Option<String>,
    #[serde(default)]
    pub lease_ttl: Option<String>,
    #[serde(default)]
    pub cleanup_after_cycle: Option<bool>,
}

/// One parsed `config.toml` layer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RpiToml {
    #[serde(default)]
    pub runtime: RuntimeSection,
    #[serde(default)]
    pub run: RunSection,
    #[serde(default)]
    pub supervisor: SupervisorSection,
}

impl RpiToml {
    /// Load a layer from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content).with_context(|| format!("In config file: {}", path.display()))
    }

    /// Parse a layer from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse config.toml")
    }

    /// Load a layer, or the empty layer when the file does not exist.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Fill every unset field of `self` from `lower`.
    pub fn layered_over(self, lower: RpiToml) -> RpiToml {
        RpiToml {
            runtime: RuntimeSection {
                mode: self.runtime.mode.or(lower.runtime.mode),
                command: self.runtime.command.or(lower.runtime.command),
                tmux_command: self.runtime.tmux_command.or(lower.runtime.tmux_command),
                tracker_command: self
                    .runtime
                    .tracker_command
                    .or(lower.runtime.tracker_command),
            },
            run: RunSection {
                max_retries: self.run.max_retries.or(lower.run.max_retries),
                phase_timeout: self.run.phase_timeout.or(lower.run.phase_timeout),
                stall_timeout: self.run.stall_timeout.or(lower.run.stall_timeout),
                stream_startup_timeout: self
                    .run
                    .stream_startup_timeout
                    .or(lower.run.stream_startup_timeout),
                stall_check_interval: self
                    .run
                    .stall_check_interval
                    .or(lower.run.stall_check_interval),
                swarm_first: self.run.swarm_first.or(lower.run.swarm_first),
                live_status: self.run.live_status.or(lower.run.live_status),
                heartbeat_freshness: self
                    .run
                    .heartbeat_freshness
                    .or(lower.run.heartbeat_freshness),
            },
            supervisor: SupervisorSection {
                failure_policy: self
                    .supervisor
                    .failure_policy
                    .or(lower.supervisor.failure_policy),
                gate_policy: self.supervisor.gate_policy.or(lower.supervisor.gate_policy),
                gate_script: self.supervisor.gate_script.or(lower.supervisor.gate_script),
                landing_policy: self
                    .supervisor
                    .landing_policy
                    .or(lower.supervisor.landing_policy),
                commit_template: self
                    .supervisor
                    .commit_template
                    .or(lower.supervisor.commit_template),
                kill_switch: self.supervisor.kill_switch.or(lower.supervisor.kill_switch),
                lease_ttl: self.supervisor.lease_ttl.or(lower.supervisor.lease_ttl),
                cleanup_after_cycle: self
                    .supervisor
                    .cleanup_after_cycle
                    .or(lower.supervisor.cleanup_after_cycle),
            },
        }
    }
}

/// Project layer location.
pub fn project_config_path(project_dir: &Path) -> PathBuf {
    project_dir.join(".agents").join("rpi").join("config.toml")
}

/// User layer location, when the platform has a config directory.
pub fn user_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("forge-rpi").join("config.toml"))
}

/// Load project and user layers merged, project first.
pub fn load_layers(project_dir: &Path, user_path: Option<&Path>) -> Result<RpiToml> {
    let project = RpiToml::load_or_default(&project_config_path(project_dir))?;
    let user = match user_path {
        Some(path) => RpiToml::load_or_default(path)?,
        None => RpiToml::default(),
    };
    Ok(project.layered_over(user))
}
