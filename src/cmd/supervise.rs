//! Supervisor loop: `forge-rpi loop <GOAL>`.

use std::path::Path;

use anyhow::Result;
use console::style;

use forge_rpi::config::Config;
use forge_rpi::errors::ConfigError;
use forge_rpi::supervisor::{LoopSummary, Supervisor, SupervisorOptions};
use forge_rpi::util::parse_duration;

use super::super::{Cli, LoopArgs};
use super::run::{build_run_options, resolve_run_root};

/// Loop flags over the configured supervisor settings.
pub fn build_supervisor_options(config: &Config, args: &LoopArgs) -> Result<SupervisorOptions, ConfigError> {
    let mut opts = SupervisorOptions::from_config(config);
    opts.max_cycles = args.max_cycles.max(1);
    opts.cycle_retries = args.cycle_retries;
    if let Some(raw) = args.cycle_delay.as_deref() {
        opts.cycle_delay = parse_duration(raw)?;
    }
    if let Some(raw) = args.failure_policy.as_deref() {
        opts.failure_policy = raw.parse()?;
    }
    if let Some(raw) = args.gate_policy.as_deref() {
        opts.gate_policy = raw.parse()?;
    }
    if let Some(script) = &args.gate_script {
        opts.gate_script = Some(script.clone());
    }
    if let Some(raw) = args.landing_policy.as_deref() {
        opts.landing_policy = raw.parse()?;
    }
    if let Some(template) = args.commit_template.as_deref().filter(|t| !t.trim().is_empty()) {
        opts.commit_template = template.to_string();
    }
    if let Some(path) = &args.kill_switch {
        opts.kill_switch = path.clone();
    }
    if let Some(raw) = args.lease_ttl.as_deref() {
        opts.lease_ttl = parse_duration(raw)?;
    }
    opts.cleanup_after_cycle |= args.cleanup_after_cycle;
    Ok(opts)
}

fn print_summary(summary: &LoopSummary) {
    println!(
        "{} {} succeeded, {} failed, {} commit(s){}",
        style("Loop summary:").bold(),
        summary.succeeded,
        summary.failed,
        summary.commits,
        if summary.stopped_by_kill_switch {
            " (stopped by kill switch)"
        } else {
            ""
        }
    );
}

pub async fn cmd_loop(cli: &Cli, project_dir: &Path, args: &LoopArgs) -> Result<()> {
    let config = Config::load(project_dir, cli.verbose, cli.yes)?;
    let run_opts = build_run_options(&config, &args.run)?;
    let opts = build_supervisor_options(&config, args)?;
    let root = resolve_run_root(&config.project_dir);
    tracing::debug!(
        root = %root.display(),
        max_cycles = opts.max_cycles,
        failure = %opts.failure_policy,
        gate = %opts.gate_policy,
        landing = %opts.landing_policy,
        "starting supervisor"
    );

    let summary = Supervisor::new(root, opts, run_opts)
        .with_progress_bars(console::user_attended())
        .run(&args.goal)
        .await?;
    print_summary(&summary);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RunFlags;
    use forge_rpi::supervisor::policy::{FailurePolicy, GatePolicy, LandingPolicy};
    use std::path::PathBuf;
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

    fn args() -> LoopArgs {
        LoopArgs {
            goal: "add auth".to_string(),
            run: RunFlags::default(),
            max_cycles: 1,
            cycle_retries: 0,
            cycle_delay: None,
            failure_policy: None,
            gate_policy: None,
            gate_script: None,
            landing_policy: None,
            commit_template: None,
            kill_switch: None,
            lease_ttl: None,
            cleanup_after_cycle: false,
        }
    }

    #[test]
    fn loop_flags_override_settings() {
        let a = LoopArgs {
            max_cycles: 3,
            cycle_retries: 2,
            cycle_delay: Some("30s".to_string()),
            failure_policy: Some("continue".to_string()),
            gate_policy: Some("required".to_string()),
            gate_script: Some(PathBuf::from("scripts/gate.sh")),
            landing_policy: Some("commit".to_string()),
            lease_ttl: Some("5m".to_string()),
            ..args()
        };
        let opts = build_supervisor_options(&config(), &a).unwrap();
        assert_eq!(opts.max_cycles, 3);
        assert_eq!(opts.max_attempts(), 3);
        assert_eq!(opts.cycle_delay, Duration::from_secs(30));
        assert_eq!(opts.failure_policy, FailurePolicy::Continue);
        assert_eq!(opts.gate_policy, GatePolicy::Required);
        assert_eq!(opts.landing_policy, LandingPolicy::Commit);
        assert_eq!(opts.lease_ttl, Duration::from_secs(300));
    }

    #[test]
    fn defaults_are_conservative() {
        let opts = build_supervisor_options(&config(), &args()).unwrap();
        assert_eq!(opts.failure_policy, FailurePolicy::Stop);
        assert_eq!(opts.gate_policy, GatePolicy::Off);
        assert_eq!(opts.landing_policy, LandingPolicy::Off);
        assert_eq!(opts.kill_switch, PathBuf::from(".agents/rpi/KILL"));
    }

    #[test]
    fn invalid_policy_is_rejected() {
        let a = LoopArgs {
            landing_policy: Some("push".to_string()),
            ..args()
        };
        let err = build_supervisor_options(&config(), &a).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Invalid landing policy 'push'. Valid values: off, commit"
        );
    }
}
