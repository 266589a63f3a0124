//! Stale-run detection and cleanup.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Result, bail};
use chrono::{DateTime, Utc};
use console::style;

use super::{RegistryOptions, collect_search_roots, determine_liveness, registry_entries};
use crate::orchestrator::state::{
    RunState, TerminalStatus, flat_state_path, load_state_file, mark_terminal,
};
use crate::phase::COMPLETED_PHASE;
use crate::worktree::WorktreeManager;

/// A run cleanup may act on.
#[derive(Debug, Clone, PartialEq)]
pub struct StaleRun {
    pub run_id: String,
    pub root: PathBuf,
    pub state_path: PathBuf,
    pub reason: String,
    pub worktree: Option<PathBuf>,
    /// Existing terminal status; `None` means the run still needs marking.
    pub terminal: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct CleanupOptions {
    pub run_id: Option<String>,
    pub all: bool,
    pub dry_run: bool,
    pub prune_worktrees: bool,
    pub prune_branches: bool,
    pub stale_after: Option<Duration>,
    pub registry: RegistryOptions,
}

#[derive(Debug, Default)]
pub struct CleanupReport {
    pub marked: Vec<String>,
    pub removed_worktrees: Vec<PathBuf>,
    pub deleted_branches: Vec<String>,
}

fn older_than(timestamp: &str, min_age: Duration, now: DateTime<Utc>) -> bool {
    DateTime::parse_from_rfc3339(timestamp)
        .ok()
        .and_then(|t| (now - t.with_timezone(&Utc)).to_std().ok())
        .is_some_and(|age| age >= min_age)
}

fn terminal_candidate(state: &RunState, min_age: Option<Duration>, now: DateTime<Utc>) -> bool {
    if state.terminal_status == TerminalStatus::Completed.as_str() {
        return false;
    }
    if !state.worktree().is_some_and(|wt| wt.exists()) {
        return false;
    }
    let at = if state.terminated_at.is_empty() {
        &state.started_at
    } else {
        &state.terminated_at
    };
    min_age.is_none_or(|min| older_than(at, min, now))
}

/// Runs under `root` that cleanup should act on.
///
/// Non-terminal runs qualify when they fail liveness and have not reached the
/// last phase. Terminal runs other than `completed` qualify only while their
/// worktree still exists, without a liveness check. With `min_age`, runs
/// younger than that (or with an unparseable timestamp) are left alone.
pub async fn find_stale_runs(
    root: &Path,
    min_age: Option<Duration>,
    now: DateTime<Utc>,
    opts: &RegistryOptions,
) -> Vec<StaleRun> {
    let min_age = min_age.filter(|d| !d.is_zero());
    let mut stale = Vec::new();
    for (state_path, state) in registry_entries(root) {
        if !state.terminal_status.is_empty() {
            if !terminal_candidate(&state, min_age, now) {
                continue;
            }
            let reason = if state.terminal_reason.is_empty() {
                format!("terminal status: {}", state.terminal_status)
            } else {
                state.terminal_reason.clone()
            };
            stale.push(StaleRun {
                run_id: state.run_id.clone(),
                root: root.to_path_buf(),
                state_path,
                reason,
                worktree: state.worktree(),
                terminal: Some(state.terminal_status.clone()),
            });
            continue;
        }

        if determine_liveness(root, &state, opts).await.active {
            continue;
        }
        if state.phase >= COMPLETED_PHASE {
            continue;
        }
        if let Some(min) = min_age
            && !older_than(&state.started_at, min, now)
        {
            continue;
        }

        let worktree = state.worktree();
        let reason = if worktree.as_ref().is_some_and(|wt| !wt.exists()) {
            "worktree missing"
        } else {
            "no heartbeat/session"
        };
        tracing::debug!(run_id = %state.run_id, reason, "stale run");
        stale.push(StaleRun {
            run_id: state.run_id.clone(),
            root: root.to_path_buf(),
            state_path,
            reason: reason.to_string(),
            worktree,
            terminal: None,
        });
    }
    stale
}

/// Mark the registry copy stale, and the flat copy when it belongs to the same run.
pub fn mark_stale(run: &StaleRun) -> Result<()> {
    mark_terminal(&run.state_path, TerminalStatus::Stale, &run.reason)?;
    let flat = flat_state_path(&run.root);
    if let Ok(state) = load_state_file(&flat)
        && state.run_id == run.run_id
        && let Err(e) = mark_terminal(&flat, TerminalStatus::Stale, &run.reason)
    {
        tracing::warn!(run_id = %run.run_id, error = %e, "could not mark flat state stale");
    }
    Ok(())
}

/// Prefer a search root that is a sibling of the target, so the removal is
/// never issued from inside the worktree being removed.
fn controller_root(roots: &[PathBuf], cwd: &Path, target: &Path) -> PathBuf {
    roots
        .iter()
        .find(|root| root.as_path() != target && root.parent() == target.parent())
        .cloned()
        .unwrap_or_else(|| cwd.to_path_buf())
}

async fn remove_orphaned_worktree(controller: &Path, worktree: &Path, run_id: &str) -> Result<()> {
    let manager = WorktreeManager::new(controller)?;
    manager.remove(worktree, run_id).await?;
    Ok(())
}

async fn prune_worktrees(cwd: &Path) -> Result<()> {
    println!("Running: git worktree prune");
    WorktreeManager::new(cwd)?.prune().await?;
    Ok(())
}

async fn prune_legacy_branches(cwd: &Path, opts: &CleanupOptions, report: &mut CleanupReport) -> Result<()> {
    let manager = WorktreeManager::new(cwd)?;
    let candidates = manager.rpi_branches(opts.run_id.as_deref()).await?;
    if candidates.is_empty() {
        println!("No legacy RPI branches found for cleanup.");
        return Ok(());
    }
    let active = manager.checked_out_branches().await?;
    for branch in candidates {
        if active.contains(&branch) {
            println!("Skipping active branch: {branch}");
            continue;
        }
        if opts.dry_run {
            println!("[dry-run] Would delete branch: {branch}");
            continue;
        }
        match manager.delete_branch(&branch).await {
            Ok(()) => {
                println!("Deleted branch: {branch}");
                report.deleted_branches.push(branch);
            }
            Err(e) => tracing::warn!(branch, error = %e, "failed to delete branch"),
        }
    }
    Ok(())
}

/// Mark stale runs, remove their orphaned worktrees, and optionally prune
/// worktree records and legacy branches. Safe to repeat.
pub async fn execute(cwd: &Path, opts: &CleanupOptions) -> Result<CleanupReport> {
    let run_filter = opts.run_id.as_deref().map(str::trim).filter(|id| !id.is_empty());
    if !opts.all && run_filter.is_none() {
        bail!("specify --all or --run-id <id>");
    }

    let roots = collect_search_roots(cwd).await;
    let now = Utc::now();
    let mut seen = HashSet::new();
    let mut stale = Vec::new();
    for root in &roots {
        for run in find_stale_runs(root, opts.stale_after, now, &opts.registry).await {
            if !seen.insert(run.run_id.clone()) {
                continue;
            }
            if run_filter.is_some_and(|id| id != run.run_id) {
                continue;
            }
            stale.push(run);
        }
    }

    let mut report = CleanupReport::default();
    if stale.is_empty() {
        println!("No stale runs found.");
    }

    for run in &stale {
        let existing_worktree = run.worktree.as_ref().filter(|wt| wt.exists());
        if opts.dry_run {
            match &run.terminal {
                None => println!(
                    "[dry-run] Would mark run {} as stale (reason: {})",
                    run.run_id, run.reason
                ),
                Some(_) => println!("[dry-run] Would clean terminal run {} ({})", run.run_id, run.reason),
            }
            if let Some(wt) = existing_worktree {
                println!("[dry-run] Would remove worktree: {}", wt.display());
            }
            continue;
        }

        if run.terminal.is_none() {
            if let Err(e) = mark_stale(run) {
                eprintln!(
                    "{} failed to mark run {} as stale: {e:#}",
                    style("Warning:").yellow(),
                    run.run_id
                );
                continue;
            }
            println!("Marked run {} as stale (reason: {})", run.run_id, run.reason);
            report.marked.push(run.run_id.clone());
        } else {
            println!("Cleaning terminal run {} ({})", run.run_id, run.reason);
        }

        if let Some(wt) = existing_worktree {
            let controller = controller_root(&roots, cwd, wt);
            match remove_orphaned_worktree(&controller, wt, &run.run_id).await {
                Ok(()) => {
                    println!("Removed worktree: {}", wt.display());
                    report.removed_worktrees.push(wt.clone());
                }
                Err(e) => eprintln!(
                    "{} could not remove worktree {}: {e:#}",
                    style("Warning:").yellow(),
                    wt.display()
                ),
            }
        }
    }

    if opts.prune_worktrees && !opts.dry_run {
        if let Err(e) = prune_worktrees(cwd).await {
            if stale.is_empty() {
                return Err(e);
            }
            eprintln!("{} git worktree prune failed: {e:#}", style("Warning:").yellow());
        }
    }

    if opts.prune_branches
        && let Err(e) = prune_legacy_branches(cwd, opts, &mut report).await
    {
        eprintln!("{} legacy branch cleanup failed: {e:#}", style("Warning:").yellow());
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::state::{RunOptionsSnapshot, save_state, update_heartbeat};
    use crate::registry::tests::{quiet_opts, seed_run};
    use tempfile::tempdir;

    fn registry_path(root: &Path, run_id: &str) -> PathBuf {
        crate::orchestrator::state::run_registry_dir(root, run_id)
            .unwrap()
            .join(crate::orchestrator::state::STATE_FILE)
    }

    #[tokio::test]
    async fn test_fresh_heartbeat_is_never_stale() {
        let dir = tempdir().unwrap();
        seed_run(dir.path(), "aaaaaaaaaaaa", 1);
        update_heartbeat(dir.path(), "aaaaaaaaaaaa");
        let found = find_stale_runs(dir.path(), None, Utc::now(), &quiet_opts()).await;
        assert!(found.is_empty());
    }

    #[tokio::test]
    async fn test_missing_worktree_reason() {
        let dir = tempdir().unwrap();
        let mut state = RunState::new("g", 1, RunOptionsSnapshot::default());
        state.run_id = "bbbbbbbbbbbb".to_string();
        state.worktree_path = dir.path().join("gone").to_string_lossy().into_owned();
        save_state(dir.path(), &state).unwrap();
        seed_run(dir.path(), "cccccccccccc", 2);

        let found = find_stale_runs(dir.path(), None, Utc::now(), &quiet_opts()).await;
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].run_id, "bbbbbbbbbbbb");
        assert_eq!(found[0].reason, "worktree missing");
        assert_eq!(found[1].reason, "no heartbeat/session");
        assert!(found.iter().all(|r| r.terminal.is_none()));
    }

    #[tokio::test]
    async fn test_terminal_runs() {
        let dir = tempdir().unwrap();
        let live_wt = dir.path().join("wt");
        std::fs::create_dir_all(&live_wt).unwrap();

        let mut completed = RunState::new("g", 1, RunOptionsSnapshot::default());
        completed.run_id = "aaaaaaaaaaaa".to_string();
        completed.worktree_path = live_wt.to_string_lossy().into_owned();
        completed.set_terminal(TerminalStatus::Completed, "all phases completed");
        save_state(dir.path(), &completed).unwrap();

        let mut failed_gone = completed.clone();
        failed_gone.run_id = "bbbbbbbbbbbb".to_string();
        failed_gone.worktree_path = dir.path().join("gone").to_string_lossy().into_owned();
        failed_gone.set_terminal(TerminalStatus::Failed, "boom");
        save_state(dir.path(), &failed_gone).unwrap();

        let mut failed_live = completed.clone();
        failed_live.run_id = "cccccccccccc".to_string();
        failed_live.set_terminal(TerminalStatus::Failed, "");
        save_state(dir.path(), &failed_live).unwrap();

        let found = find_stale_runs(dir.path(), None, Utc::now(), &quiet_opts()).await;
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].run_id, "cccccccccccc");
        assert_eq!(found[0].reason, "terminal status: failed");
        assert_eq!(found[0].terminal.as_deref(), Some("failed"));
    }

    #[tokio::test]
    async fn test_min_age_filter() {
        let dir = tempdir().unwrap();
        let mut state = seed_run(dir.path(), "aaaaaaaaaaaa", 1);
        state.started_at = Utc::now().to_rfc3339();
        save_state(dir.path(), &state).unwrap();

        let hour = Some(Duration::from_secs(3600));
        let now = Utc::now();
        assert!(find_stale_runs(dir.path(), hour, now, &quiet_opts()).await.is_empty());

        let later = now + chrono::Duration::hours(2);
        assert_eq!(find_stale_runs(dir.path(), hour, later, &quiet_opts()).await.len(), 1);
    }

    #[tokio::test]
    async fn test_mark_stale_is_idempotent() {
        let dir = tempdir().unwrap();
        seed_run(dir.path(), "aaaaaaaaaaaa", 1);
        let found = find_stale_runs(dir.path(), None, Utc::now(), &quiet_opts()).await;
        assert_eq!(found.len(), 1);
        mark_stale(&found[0]).unwrap();

        let registry = load_state_file(&registry_path(dir.path(), "aaaaaaaaaaaa")).unwrap();
        assert_eq!(registry.terminal_status, "stale");
        assert_eq!(registry.terminal_reason, "no heartbeat/session");
        let flat = load_state_file(&flat_state_path(dir.path())).unwrap();
        assert_eq!(flat.terminal_status, "stale");

        // Stale, no worktree: not a candidate any more.
        assert!(find_stale_runs(dir.path(), None, Utc::now(), &quiet_opts()).await.is_empty());
    }

    #[tokio::test]
    async fn test_execute_requires_scope() {
        let dir = tempdir().unwrap();
        let err = execute(dir.path(), &CleanupOptions::default()).await.unwrap_err();
        assert!(err.to_string().contains("specify --all or --run-id"));
    }

    #[tokio::test]
    async fn test_execute_dry_run_changes_nothing() {
        let dir = tempdir().unwrap();
        seed_run(dir.path(), "aaaaaaaaaaaa", 1);
        let opts = CleanupOptions {
            all: true,
            dry_run: true,
            registry: quiet_opts(),
            ..Default::default()
        };
        let report = execute(dir.path(), &opts).await.unwrap();
        assert!(report.marked.is_empty());
        let state = load_state_file(&registry_path(dir.path(), "aaaaaaaaaaaa")).unwrap();
        assert!(state.terminal_status.is_empty());
    }

    #[tokio::test]
    async fn test_execute_marks_selected_run() {
        let dir = tempdir().unwrap();
        seed_run(dir.path(), "aaaaaaaaaaaa", 1);
        seed_run(dir.path(), "bbbbbbbbbbbb", 1);
        let opts = CleanupOptions {
            run_id: Some("bbbbbbbbbbbb".to_string()),
            registry: quiet_opts(),
            ..Default::default()
        };
        let report = execute(dir.path(), &opts).await.unwrap();
        assert_eq!(report.marked, vec!["bbbbbbbbbbbb".to_string()]);
        let untouched = load_state_file(&registry_path(dir.path(), "aaaaaaaaaaaa")).unwrap();
        assert!(untouched.terminal_status.is_empty());
    }
}
