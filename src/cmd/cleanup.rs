//! Stale run cleanup: `forge-rpi cleanup`.

use std::path::Path;

use anyhow::{Context, Result};

use forge_rpi::config::Config;
use forge_rpi::registry::RegistryOptions;
use forge_rpi::registry::cleanup::{self, CleanupOptions};
use forge_rpi::util::parse_duration;

use super::super::Cli;

#[derive(Debug, Clone, Default)]
pub struct CleanupArgs {
    pub run_id: Option<String>,
    pub all: bool,
    pub dry_run: bool,
    pub prune_worktrees: bool,
    pub prune_branches: bool,
    pub stale_after: Option<String>,
}

pub fn build_cleanup_options(args: &CleanupArgs, registry: RegistryOptions) -> Result<CleanupOptions> {
    let stale_after = args
        .stale_after
        .as_deref()
        .map(parse_duration)
        .transpose()
        .context("invalid --stale-after")?;
    Ok(CleanupOptions {
        run_id: args.run_id.clone(),
        all: args.all,
        dry_run: args.dry_run,
        prune_worktrees: args.prune_worktrees,
        prune_branches: args.prune_branches,
        stale_after,
        registry,
    })
}

pub async fn cmd_cleanup(cli: &Cli, project_dir: &Path, args: &CleanupArgs) -> Result<()> {
    let config = Config::load(project_dir, cli.verbose, cli.yes)?;
    let opts = build_cleanup_options(args, RegistryOptions::from_config(&config))?;
    let report = cleanup::execute(&config.project_dir, &opts).await?;
    tracing::debug!(
        marked = report.marked.len(),
        worktrees = report.removed_worktrees.len(),
        branches = report.deleted_branches.len(),
        "cleanup finished"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use forge_rpi::errors::{EXIT_USAGE, exit_code};
    use std::time::Duration;

    #[test]
    fn stale_after_is_parsed() {
        let args = CleanupArgs {
            all: true,
            stale_after: Some("2h".to_string()),
            ..Default::default()
        };
        let opts = build_cleanup_options(&args, RegistryOptions::default()).unwrap();
        assert_eq!(opts.stale_after, Some(Duration::from_secs(7200)));
        assert!(opts.all);
    }

    #[test]
    fn bad_stale_after_is_a_usage_error() {
        let args = CleanupArgs {
            stale_after: Some("whenever".to_string()),
            ..Default::default()
        };
        let err = build_cleanup_options(&args, RegistryOptions::default()).unwrap_err();
        assert_eq!(exit_code(&err), EXIT_USAGE);
    }
}
