use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::errors::ConfigError;
use crate::executor::RuntimeMode;
use crate::rpi_config::{self, RpiToml};
use crate::supervisor::policy::{FailurePolicy, GatePolicy, LandingPolicy};
use crate::util::parse_duration;

pub const DEFAULT_RUNTIME_COMMAND: &str = "claude";
pub const DEFAULT_TMUX_COMMAND: &str = "tmux";
pub const DEFAULT_TRACKER_COMMAND: &str = "bd";
pub const DEFAULT_COMMIT_TEMPLATE: &str = "chore(rpi): land cycle {cycle} - {goal}";
pub const DEFAULT_KILL_SWITCH: &str = ".agents/rpi/KILL";

/// Agent runtime and external tool commands.
#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeSettings {
    pub mode: RuntimeMode,
    pub command: String,
    pub tmux_command: String,
    pub tracker_command: String,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            mode: RuntimeMode::Auto,
            command: DEFAULT_RUNTIME_COMMAND.to_string(),
            tmux_command: DEFAULT_TMUX_COMMAND.to_string(),
            tracker_command: DEFAULT_TRACKER_COMMAND.to_string(),
        }
    }
}

/// Engine tuning that can come from files before CLI flags apply.
#[derive(Debug, Clone, PartialEq)]
pub struct RunSettings {
    pub max_retries: u32,
    pub phase_timeout: Duration,
    pub stall_timeout: Duration,
    pub stream_startup_timeout: Duration,
    pub stall_check_interval: Duration,
    pub swarm_first: bool,
    pub live_status: bool,
    pub heartbeat_freshness: Duration,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            max_retries: 3,
            phase_timeout: Duration::from_secs(90 * 60),
            stall_timeout: Duration::from_secs(10 * 60),
            stream_startup_timeout: Duration::from_secs(45),
            stall_check_interval: Duration::from_secs(30),
            swarm_first: true,
            live_status: false,
            heartbeat_freshness: Duration::from_secs(5 * 60),
        }
    }
}

/// Supervisor policies before CLI flags apply.
#[derive(Debug, Clone, PartialEq)]
pub struct SupervisorSettings {
    pub failure_policy: FailurePolicy,
    pub gate_policy: GatePolicy,
    pub gate_script: Option<String>,
    pub landing_policy: LandingPolicy,
    pub commit_template: String,
    pub kill_switch: PathBuf,
    pub lease_ttl: Duration,
    pub cleanup_after_cycle: bool,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            failure_policy: FailurePolicy::Stop,
            gate_policy: GatePolicy::Off,
            gate_script: None,
            landing_policy: LandingPolicy::Off,
            commit_template: DEFAULT_COMMIT_TEMPLATE.to_string(),
            kill_switch: PathBuf::from(DEFAULT_KILL_SWITCH),
            lease_ttl: Duration::from_secs(120),
            cleanup_after_cycle: false,
        }
    }
}

/// Resolved configuration for one invocation.
///
/// Layers, highest first: CLI flags (applied by the command modules),
/// environment, project file, user file, built-in defaults.
#[derive(Debug, Clone)]
pub struct Config {
    pub project_dir: PathBuf,
    pub verbose: bool,
    pub yes: bool,
    pub runtime: RuntimeSettings,
    pub run: RunSettings,
    pub supervisor: SupervisorSettings,
}

impl Config {
    /// Load file layers for `project_dir` and apply the process environment.
    pub fn load(project_dir: &Path, verbose: bool, yes: bool) -> Result<Self> {
        let project_dir = project_dir
            .canonicalize()
            .context("Failed to resolve project directory")?;
        let user_path = rpi_config::user_config_path();
        let toml = rpi_config::load_layers(&project_dir, user_path.as_deref())?;
        let mut config = Self::resolve(project_dir, toml, &|key| std::env::var(key).ok())?;
        config.verbose = verbose;
        config.yes = yes;
        Ok(config)
    }

    /// Build a config from merged file layers and an environment lookup.
    pub fn resolve(
        project_dir: PathBuf,
        toml: RpiToml,
        env: &dyn Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let defaults = RuntimeSettings::default();
        let mode_raw = env("RPI_RUNTIME")
            .or_else(|| env("RPI_RUNTIME_MODE"))
            .or(toml.runtime.mode);
        let mode = match mode_raw {
            Some(raw) => raw.parse::<RuntimeMode>()?,
            None => RuntimeMode::Auto,
        };
        let runtime = RuntimeSettings {
            mode,
            command: non_empty(env("RPI_RUNTIME_COMMAND"))
                .or(toml.runtime.command)
                .unwrap_or(defaults.command),
            tmux_command: non_empty(env("RPI_TMUX_COMMAND"))
                .or(toml.runtime.tmux_command)
                .unwrap_or(defaults.tmux_command),
            tracker_command: non_empty(env("RPI_TRACKER_COMMAND"))
                .or(toml.runtime.tracker_command)
                .unwrap_or(defaults.tracker_command),
        };

        let d = RunSettings::default();
        let r = toml.run;
        let run = RunSettings {
            max_retries: r.max_retries.unwrap_or(d.max_retries),
            phase_timeout: duration_or(r.phase_timeout, d.phase_timeout)?,
            stall_timeout: duration_or(r.stall_timeout, d.stall_timeout)?,
            stream_startup_timeout: duration_or(r.stream_startup_timeout, d.stream_startup_timeout)?,
            stall_check_interval: duration_or(r.stall_check_interval, d.stall_check_interval)?,
            swarm_first: r.swarm_first.unwrap_or(d.swarm_first),
            live_status: r.live_status.unwrap_or(d.live_status),
            heartbeat_freshness: duration_or(r.heartbeat_freshness, d.heartbeat_freshness)?,
        };

        let sd = SupervisorSettings::default();
        let s = toml.supervisor;
        let supervisor = SupervisorSettings {
            failure_policy: match s.failure_policy {
                Some(v) => v.parse()?,
                None => sd.failure_policy,
            },
            gate_policy: match s.gate_policy {
                Some(v) => v.parse()?,
                None => sd.gate_policy,
            },
            gate_script: non_empty(s.gate_script),
            landing_policy: match s.landing_policy {
                Some(v) => v.parse()?,
                None => sd.landing_policy,
            },
            commit_template: non_empty(s.commit_template).unwrap_or(sd.commit_template),
            kill_switch: non_empty(s.kill_switch)
                .map(PathBuf::from)
                .unwrap_or(sd.kill_switch),
            lease_ttl: duration_or(s.lease_ttl, sd.lease_ttl)?,
            cleanup_after_cycle: s.cleanup_after_cycle.unwrap_or(sd.cleanup_after_cycle),
        };

        Ok(Self {
            project_dir,
            verbose: false,
            yes: false,
            runtime,
            run,
            supervisor,
        })
    }

    /// `.agents/rpi` under the project directory.
    pub fn rpi_dir(&self) -> PathBuf {
        self.project_dir.join(".agents").join("rpi")
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn duration_or(value: Option<String>, default: Duration) -> Result<Duration, ConfigError> {
    match value {
        Some(v) => parse_duration(&v),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_without_layers() {
        let cfg = Config::resolve(PathBuf::from("/repo"), RpiToml::default(), &env_from(&[]))
            .unwrap();
        assert_eq!(cfg.runtime, RuntimeSettings::default());
        assert_eq!(cfg.run, RunSettings::default());
        assert_eq!(cfg.run.phase_timeout, Duration::from_secs(5400));
        assert_eq!(cfg.supervisor.commit_template, DEFAULT_COMMIT_TEMPLATE);
        assert_eq!(cfg.rpi_dir(), PathBuf::from("/repo/.agents/rpi"));
    }

    #[test]
    fn test_env_overrides_file() {
        let toml = RpiToml::parse("[runtime]\nmode = \"direct\"\ncommand = \"from-file\"\n").unwrap();
        let env = env_from(&[("RPI_RUNTIME", "Stream"), ("RPI_RUNTIME_COMMAND", "from-env")]);
        let cfg = Config::resolve(PathBuf::from("/repo"), toml, &env).unwrap();
        assert_eq!(cfg.runtime.mode, RuntimeMode::Stream);
        assert_eq!(cfg.runtime.command, "from-env");
    }

    #[test]
    fn test_runtime_mode_alias_env() {
        let env = env_from(&[("RPI_RUNTIME_MODE", "direct")]);
        let cfg = Config::resolve(PathBuf::from("/repo"), RpiToml::default(), &env).unwrap();
        assert_eq!(cfg.runtime.mode, RuntimeMode::Direct);
    }

    #[test]
    fn test_invalid_runtime_rejected() {
        let env = env_from(&[("RPI_RUNTIME", "tmux")]);
        let err = Config::resolve(PathBuf::from("/repo"), RpiToml::default(), &env).unwrap_err();
        assert_eq!(
            err.to_string(),
            "invalid runtime \"tmux\" (valid: auto|direct|stream)"
        );
    }

    #[test]
    fn test_file_durations_and_policies() {
        let toml = RpiToml::parse(
            "[run]\nstall_timeout = \"2m\"\n[supervisor]\ngate_policy = \"best-effort\"\nlanding_policy = \"commit\"\nlease_ttl = \"30s\"\n",
        )
        .unwrap();
        let cfg = Config::resolve(PathBuf::from("/repo"), toml, &env_from(&[])).unwrap();
        assert_eq!(cfg.run.stall_timeout, Duration::from_secs(120));
        assert_eq!(cfg.supervisor.gate_policy, GatePolicy::BestEffort);
        assert_eq!(cfg.supervisor.landing_policy, LandingPolicy::Commit);
        assert_eq!(cfg.supervisor.lease_ttl, Duration::from_secs(30));
    }

    #[test]
    fn test_invalid_policy_in_file() {
        let toml = RpiToml::parse("[supervisor]\ngate_policy = \"sometimes\"\n").unwrap();
        let err = Config::resolve(PathBuf::from("/repo"), toml, &env_from(&[])).unwrap_err();
        assert!(err.to_string().contains("Invalid gate policy 'sometimes'"));
    }

    #[test]
    fn test_invalid_duration_in_file() {
        let toml = RpiToml::parse("[run]\nphase_timeout = \"forever\"\n").unwrap();
        assert!(Config::resolve(PathBuf::from("/repo"), toml, &env_from(&[])).is_err());
    }

    #[test]
    fn test_load_from_project_dir() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = Config::load(dir.path(), true, false).unwrap();
        assert!(cfg.verbose);
        assert_eq!(cfg.project_dir, dir.path().canonicalize().unwrap());
    }
}
