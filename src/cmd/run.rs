//! Single orchestrated run: `forge-rpi run [GOAL]`.

use std::path::{Path, PathBuf};

use anyhow::Result;

use forge_rpi::config::Config;
use forge_rpi::errors::ConfigError;
use forge_rpi::executor::RuntimeMode;
use forge_rpi::orchestrator::{Engine, RunOptions};
use forge_rpi::phase::phase_name_to_num;
use forge_rpi::util::parse_duration;
use forge_rpi::worktree::discover_repo_root;

use super::super::{Cli, RunFlags};

/// Apply CLI flags over the layered config. Invalid values fail here,
/// before anything is spawned or written.
pub fn build_run_options(config: &Config, flags: &RunFlags) -> Result<RunOptions, ConfigError> {
    let mut opts = RunOptions::from_config(config);
    if let Some(from) = flags.from.as_deref() {
        phase_name_to_num(from)?;
        opts.from = from.to_string();
    }
    if let Some(n) = flags.max_retries {
        opts.max_retries = n;
    }
    if let Some(raw) = flags.phase_timeout.as_deref() {
        opts.phase_timeout = parse_duration(raw)?;
    }
    if let Some(raw) = flags.stall_timeout.as_deref() {
        opts.stall_timeout = parse_duration(raw)?;
    }
    if let Some(raw) = flags.stream_startup_timeout.as_deref() {
        opts.stream_startup_timeout = parse_duration(raw)?;
    }
    if let Some(raw) = flags.runtime.as_deref() {
        opts.runtime_mode = raw.parse::<RuntimeMode>()?;
    }
    if let Some(cmd) = flags.runtime_cmd.as_deref().map(str::trim).filter(|c| !c.is_empty()) {
        opts.runtime_command = cmd.to_string();
    }
    opts.live_status |= flags.live_status;
    opts.no_worktree |= flags.no_worktree;
    opts.fast_path |= flags.fast_path;
    opts.test_first |= flags.test_first;
    if flags.no_swarm_first {
        opts.swarm_first = false;
    }
    opts.dry_run |= flags.dry_run;
    Ok(opts)
}

/// The repository root when `dir` is inside one. Outside a repository only
/// `--no-worktree` and dry runs can proceed; the engine reports the rest.
pub fn resolve_run_root(dir: &Path) -> PathBuf {
    discover_repo_root(dir).unwrap_or_else(|e| {
        tracing::debug!(dir = %dir.display(), error = %e, "not inside a git repository");
        dir.to_path_buf()
    })
}

pub async fn cmd_run(cli: &Cli, project_dir: &Path, goal: Option<&str>, flags: &RunFlags) -> Result<()> {
    let config = Config::load(project_dir, cli.verbose, cli.yes)?;
    let opts = build_run_options(&config, flags)?;
    let root = resolve_run_root(&config.project_dir);
    tracing::debug!(root = %root.display(), from = %opts.from, "starting run");

    Engine::new(root, opts)
        .with_progress_bars(console::user_attended())
        .run(goal.unwrap_or_default())
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn config() -> Config {
        Config {
            project_dir: PathBuf::from("/repo"),
            verbose: false,
            yes: false,
            runtime: Default::default(),
            run: Default::default(),
            supervisor: Default::default(),
        }
    }

    #[test]
    fn flags_override_config() {
        let flags = RunFlags {
            from: Some("implementation".to_string()),
            max_retries: Some(5),
            phase_timeout: Some("2h".to_string()),
            runtime: Some("Stream".to_string()),
            runtime_cmd: Some("  codex ".to_string()),
            no_swarm_first: true,
            dry_run: true,
            ..Default::default()
        };
        let opts = build_run_options(&config(), &flags).unwrap();
        assert_eq!(opts.from, "implementation");
        assert_eq!(opts.max_retries, 5);
        assert_eq!(opts.phase_timeout, Duration::from_secs(2 * 3600));
        assert_eq!(opts.runtime_mode, RuntimeMode::Stream);
        assert_eq!(opts.runtime_command, "codex");
        assert!(!opts.swarm_first);
        assert!(opts.dry_run);
    }

    #[test]
    fn defaults_come_from_config() {
        let opts = build_run_options(&config(), &RunFlags::default()).unwrap();
        assert_eq!(opts.from, "discovery");
        assert_eq!(opts.max_retries, 3);
        assert_eq!(opts.runtime_command, "claude");
        assert!(opts.swarm_first);
        assert!(!opts.no_worktree);
    }

    #[test]
    fn invalid_flags_are_config_errors() {
        let bad_runtime = RunFlags {
            runtime: Some("tmux".to_string()),
            ..Default::default()
        };
        assert!(matches!(
            build_run_options(&config(), &bad_runtime),
            Err(ConfigError::InvalidRuntime(_))
        ));

        let bad_phase = RunFlags {
            from: Some("deploy".to_string()),
            ..Default::default()
        };
        assert!(matches!(
            build_run_options(&config(), &bad_phase),
            Err(ConfigError::UnknownPhase(_))
        ));

        let bad_timeout = RunFlags {
            stall_timeout: Some("soon".to_string()),
            ..Default::default()
        };
        assert!(build_run_options(&config(), &bad_timeout).is_err());
    }

    #[test]
    fn non_repo_dir_is_its_own_root() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(resolve_run_root(dir.path()), dir.path());
    }
}
