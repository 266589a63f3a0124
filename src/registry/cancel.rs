//! Cancel live runs and supervisors by signalling the processes they own.

use std::collections::{BTreeSet, HashSet};
use std::path::{Path, PathBuf};

use anyhow::{Result, bail};
use chrono::Utc;
use nix::sys::signal::Signal;

use super::process::{
    ProcessInfo, descendant_pids, filter_killable_pids, list_processes, process_exists,
    send_signal,
};
use super::{RegistryOptions, collect_search_roots, determine_liveness, registry_entries};
use crate::orchestrator::state::{
    RunState, TerminalStatus, flat_state_path, load_state_file, mark_terminal,
};
use crate::supervisor::lease::{default_lease_path, lease_expired, read_lease};

pub const CANCEL_REASON: &str = "cancelled by forge-rpi cancel";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TargetKind {
    Phased,
    Supervisor,
}

impl TargetKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TargetKind::Phased => "phased",
            TargetKind::Supervisor => "supervisor",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CancelTarget {
    pub kind: TargetKind,
    pub run_id: String,
    pub root: PathBuf,
    pub state_path: Option<PathBuf>,
    pub lease_path: Option<PathBuf>,
    pub worktree: Option<PathBuf>,
    pub pids: Vec<i32>,
}

#[derive(Debug, Clone)]
pub struct CancelOptions {
    pub run_id: Option<String>,
    pub all: bool,
    pub signal: Signal,
    pub dry_run: bool,
    pub registry: RegistryOptions,
}

impl Default for CancelOptions {
    fn default() -> Self {
        Self {
            run_id: None,
            all: false,
            signal: Signal::SIGTERM,
            dry_run: false,
            registry: RegistryOptions::default(),
        }
    }
}

/// The orchestrator PID and its descendants, plus any process whose command
/// line names the run's tmux session or worktree, each with descendants.
pub fn collect_run_pids(state: &RunState, procs: &[ProcessInfo]) -> Vec<i32> {
    let mut set = BTreeSet::new();
    let mut add_tree = |pid: i32| {
        if pid <= 1 || !process_exists(pid, procs) {
            return;
        }
        set.insert(pid);
        set.extend(descendant_pids(pid, procs));
    };

    add_tree(state.orchestrator_pid as i32);

    let session_needle = format!("rpi-{}-p", state.run_id);
    for proc in procs {
        let matches_session = !state.run_id.is_empty() && proc.command.contains(&session_needle);
        let matches_worktree =
            !state.worktree_path.is_empty() && proc.command.contains(&state.worktree_path);
        if matches_session || matches_worktree {
            add_tree(proc.pid);
        }
    }
    set.into_iter().collect()
}

async fn registry_targets(
    root: &Path,
    run_id: Option<&str>,
    procs: &[ProcessInfo],
    opts: &RegistryOptions,
    seen: &mut HashSet<String>,
) -> Vec<CancelTarget> {
    let mut targets = Vec::new();
    for (state_path, state) in registry_entries(root) {
        if run_id.is_some_and(|id| id != state.run_id) {
            continue;
        }
        if !state.terminal_status.is_empty() {
            continue;
        }
        let key = format!("run:{}", state.run_id);
        if seen.contains(&key) {
            continue;
        }
        if !determine_liveness(root, &state, opts).await.active {
            continue;
        }
        seen.insert(key);
        targets.push(CancelTarget {
            kind: TargetKind::Phased,
            run_id: state.run_id.clone(),
            root: root.to_path_buf(),
            state_path: Some(state_path),
            lease_path: None,
            worktree: state.worktree(),
            pids: collect_run_pids(&state, procs),
        });
    }
    targets
}

fn lease_target(
    root: &Path,
    run_id: Option<&str>,
    procs: &[ProcessInfo],
    seen: &mut HashSet<String>,
) -> Option<CancelTarget> {
    let lease_path = default_lease_path(root);
    let meta = read_lease(&lease_path)?;
    if meta.run_id.is_empty() || meta.pid <= 0 {
        return None;
    }
    if run_id.is_some_and(|id| id != meta.run_id) {
        return None;
    }
    if lease_expired(&meta, Utc::now()) || !process_exists(meta.pid, procs) {
        return None;
    }
    if !seen.insert(format!("lease:{}", meta.run_id)) {
        return None;
    }

    let mut pids: BTreeSet<i32> = descendant_pids(meta.pid, procs).into_iter().collect();
    pids.insert(meta.pid);
    Some(CancelTarget {
        kind: TargetKind::Supervisor,
        run_id: meta.run_id,
        root: root.to_path_buf(),
        state_path: None,
        lease_path: Some(lease_path),
        worktree: None,
        pids: pids.into_iter().collect(),
    })
}

/// One target per live, non-terminal registry run plus one per held,
/// unexpired supervisor lease, sorted by kind then run ID.
pub async fn discover_targets(
    roots: &[PathBuf],
    run_id: Option<&str>,
    procs: &[ProcessInfo],
    opts: &RegistryOptions,
) -> Vec<CancelTarget> {
    let mut seen = HashSet::new();
    let mut targets = Vec::new();
    for root in roots {
        targets.extend(registry_targets(root, run_id, procs, opts, &mut seen).await);
        targets.extend(lease_target(root, run_id, procs, &mut seen));
    }
    targets.sort_by(|a, b| a.kind.cmp(&b.kind).then_with(|| a.run_id.cmp(&b.run_id)));
    targets
}

/// Write `interrupted` to the registry copy and to the flat copy when it
/// belongs to the same run.
pub fn mark_cancelled(target: &CancelTarget) -> Result<()> {
    let Some(state_path) = &target.state_path else {
        return Ok(());
    };
    if target.run_id.is_empty() {
        return Ok(());
    }
    mark_terminal(state_path, TerminalStatus::Interrupted, CANCEL_REASON)?;

    let flat = flat_state_path(&target.root);
    if let Ok(state) = load_state_file(&flat)
        && state.run_id == target.run_id
    {
        mark_terminal(&flat, TerminalStatus::Interrupted, CANCEL_REASON)?;
    }
    Ok(())
}

fn signal_name(signal: Signal) -> &'static str {
    signal.as_str().trim_start_matches("SIG")
}

/// Signal every matched target and record the interruption. Returns the
/// targets acted on; individual kill failures are collected into one error.
pub async fn execute(cwd: &Path, opts: &CancelOptions) -> Result<Vec<CancelTarget>> {
    let run_filter = opts.run_id.as_deref().map(str::trim).filter(|id| !id.is_empty());
    if !opts.all && run_filter.is_none() {
        bail!("specify --all or --run-id <id>");
    }

    let procs = list_processes().await?;
    let roots = collect_search_roots(cwd).await;
    let targets = discover_targets(&roots, run_filter, &procs, &opts.registry).await;
    if targets.is_empty() {
        println!("No active runs matched cancel criteria.");
        return Ok(targets);
    }

    let self_pid = std::process::id() as i32;
    let mut failures = Vec::new();
    for target in &targets {
        let pids = filter_killable_pids(&target.pids, self_pid);
        println!(
            "Cancel target: kind={} run={} signal={} pids={:?}",
            target.kind.as_str(),
            target.run_id,
            signal_name(opts.signal),
            pids
        );
        if opts.dry_run {
            continue;
        }
        for pid in pids {
            if let Err(e) = send_signal(pid, opts.signal) {
                failures.push(e.to_string());
            }
        }
        if let Err(e) = mark_cancelled(target) {
            failures.push(format!("run {} state update: {e:#}", target.run_id));
        }
        tracing::info!(run_id = %target.run_id, kind = target.kind.as_str(), "cancel signalled");
    }

    if !failures.is_empty() {
        bail!("cancel completed with errors: {}", failures.join("; "));
    }
    Ok(targets)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::state::{save_state, update_heartbeat};
    use crate::registry::process::parse_process_table;
    use crate::registry::tests::{quiet_opts, seed_run};
    use crate::supervisor::lease::LeaseMetadata;
    use tempfile::tempdir;

    fn procs() -> Vec<ProcessInfo> {
        parse_process_table(
            "1 0 /sbin/init\n500 1 forge-rpi run add auth\n501 500 claude -p discovery\n600 1 tmux new -s rpi-aaaaaaaaaaaa-p2\n601 600 bash\n700 1 vim /work/repo-rpi-aaaaaaaaaaaa/src/main.rs\n800 1 unrelated\n900 1 forge-rpi loop\n901 900 forge-rpi run\n",
        )
    }

    #[test]
    fn test_collect_run_pids() {
        let mut state = RunState::default();
        state.run_id = "aaaaaaaaaaaa".to_string();
        state.orchestrator_pid = 500;
        state.worktree_path = "/work/repo-rpi-aaaaaaaaaaaa".to_string();
        assert_eq!(collect_run_pids(&state, &procs()), vec![500, 501, 600, 601, 700]);
    }

    #[test]
    fn test_collect_run_pids_skips_missing_and_init() {
        let mut state = RunState::default();
        state.run_id = "ffffffffffff".to_string();
        state.orchestrator_pid = 1;
        assert!(collect_run_pids(&state, &procs()).is_empty());
        state.orchestrator_pid = 4242;
        assert!(collect_run_pids(&state, &procs()).is_empty());
    }

    fn write_lease(root: &Path, pid: i32, expires_in: chrono::Duration) {
        let now = Utc::now();
        let meta = LeaseMetadata {
            run_id: "loop00000001".to_string(),
            pid,
            host: "test".to_string(),
            cwd: String::new(),
            acquired_at: now.to_rfc3339(),
            renewed_at: now.to_rfc3339(),
            expires_at: (now + expires_in).to_rfc3339(),
        };
        let path = default_lease_path(root);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, serde_json::to_vec(&meta).unwrap()).unwrap();
    }

    #[tokio::test]
    async fn test_discover_targets() {
        let dir = tempdir().unwrap();
        let mut live = seed_run(dir.path(), "aaaaaaaaaaaa", 2);
        live.orchestrator_pid = 500;
        save_state(dir.path(), &live).unwrap();
        update_heartbeat(dir.path(), "aaaaaaaaaaaa");
        // Inactive and terminal runs are ignored.
        seed_run(dir.path(), "bbbbbbbbbbbb", 1);
        let mut done = seed_run(dir.path(), "cccccccccccc", 3);
        done.set_terminal(TerminalStatus::Completed, "all phases completed");
        save_state(dir.path(), &done).unwrap();
        update_heartbeat(dir.path(), "cccccccccccc");
        write_lease(dir.path(), 900, chrono::Duration::minutes(2));

        let roots = vec![dir.path().to_path_buf()];
        let targets = discover_targets(&roots, None, &procs(), &quiet_opts()).await;
        assert_eq!(targets.len(), 2);
        assert_eq!(targets[0].kind, TargetKind::Phased);
        assert_eq!(targets[0].run_id, "aaaaaaaaaaaa");
        assert_eq!(targets[0].pids, vec![500, 501, 600, 601]);
        assert_eq!(targets[1].kind, TargetKind::Supervisor);
        assert_eq!(targets[1].pids, vec![900, 901]);

        let only = discover_targets(&roots, Some("loop00000001"), &procs(), &quiet_opts()).await;
        assert_eq!(only.len(), 1);
        assert_eq!(only[0].kind, TargetKind::Supervisor);
    }

    #[tokio::test]
    async fn test_expired_or_dead_lease_is_no_target() {
        let dir = tempdir().unwrap();
        let roots = vec![dir.path().to_path_buf()];

        write_lease(dir.path(), 900, chrono::Duration::minutes(-1));
        assert!(discover_targets(&roots, None, &procs(), &quiet_opts()).await.is_empty());

        write_lease(dir.path(), 4242, chrono::Duration::minutes(2));
        assert!(discover_targets(&roots, None, &procs(), &quiet_opts()).await.is_empty());

        std::fs::write(default_lease_path(dir.path()), "not json").unwrap();
        assert!(discover_targets(&roots, None, &procs(), &quiet_opts()).await.is_empty());
    }

    #[tokio::test]
    async fn test_mark_cancelled_updates_both_copies() {
        let dir = tempdir().unwrap();
        seed_run(dir.path(), "aaaaaaaaaaaa", 2);
        update_heartbeat(dir.path(), "aaaaaaaaaaaa");
        let roots = vec![dir.path().to_path_buf()];
        let targets = discover_targets(&roots, None, &[], &quiet_opts()).await;
        assert_eq!(targets.len(), 1);
        assert!(targets[0].pids.is_empty());

        mark_cancelled(&targets[0]).unwrap();
        let flat = load_state_file(&flat_state_path(dir.path())).unwrap();
        assert_eq!(flat.terminal_status, "interrupted");
        assert_eq!(flat.terminal_reason, CANCEL_REASON);
        let registry = load_state_file(targets[0].state_path.as_ref().unwrap()).unwrap();
        assert_eq!(registry.terminal_status, "interrupted");
    }

    #[test]
    fn test_signal_names() {
        assert_eq!(signal_name(Signal::SIGTERM), "TERM");
        assert_eq!(signal_name(Signal::SIGKILL), "KILL");
    }
}
