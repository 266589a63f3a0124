//! Repository-wide run registry.
//!
//! Every run keeps its state under `.agents/rpi/runs/<runID>/` in the root it
//! was started from. Discovery scans the current directory plus every
//! worktree attached to the same repository, so runs started from sibling
//! worktrees show up too. Liveness comes from the heartbeat first and a
//! bounded tmux probe second.

pub mod cancel;
pub mod cleanup;
pub mod process;

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use anyhow::{Result, anyhow};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::process::Command;

use crate::config::Config;
use crate::orchestrator::artifacts::LIVE_STATUS_FILE;
use crate::orchestrator::state::{
    RunState, STATE_FILE, flat_state_path, load_state_file, read_heartbeat, rpi_dir,
    run_registry_dir,
};
use crate::phase::{COMPLETED_PHASE, PHASES};
use crate::util::format_duration;
use crate::worktree::{parse_porcelain_worktrees, run_git};

const TMUX_PROBE_TIMEOUT: Duration = Duration::from_secs(2);
const ROOT_DISCOVERY_TIMEOUT: Duration = Duration::from_secs(10);

/// Knobs shared by status, cleanup and cancel.
#[derive(Debug, Clone)]
pub struct RegistryOptions {
    /// A heartbeat younger than this marks a run alive without probing tmux.
    pub heartbeat_freshness: Duration,
    pub tmux_command: String,
}

impl Default for RegistryOptions {
    fn default() -> Self {
        Self {
            heartbeat_freshness: Duration::from_secs(5 * 60),
            tmux_command: "tmux".to_string(),
        }
    }
}

impl RegistryOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            heartbeat_freshness: config.run.heartbeat_freshness,
            tmux_command: config.runtime.tmux_command.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Liveness {
    pub active: bool,
    pub last_heartbeat: Option<DateTime<Utc>>,
}

/// One registry entry, as shown by `status`.
#[derive(Debug, Clone, Serialize)]
pub struct RunInfo {
    pub run_id: String,
    pub goal: String,
    pub phase: u32,
    pub phase_name: String,
    pub status: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub reason: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub epic_id: String,
    /// Search root the run was found under.
    pub worktree: PathBuf,
    pub started_at: String,
    pub elapsed: String,
    pub is_active: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_heartbeat: Option<DateTime<Utc>>,
}

/// Contents of a `live-status.md` found in a search root.
#[derive(Debug, Clone, Serialize)]
pub struct LiveStatusSnapshot {
    pub path: PathBuf,
    pub content: String,
}

fn normalize_root(path: &Path) -> PathBuf {
    path.canonicalize().unwrap_or_else(|_| {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            std::env::current_dir()
                .map(|cwd| cwd.join(path))
                .unwrap_or_else(|_| path.to_path_buf())
        }
    })
}

fn push_root(path: &Path, seen: &mut HashSet<PathBuf>, roots: &mut Vec<PathBuf>) {
    if path.as_os_str().is_empty() {
        return;
    }
    let normalized = normalize_root(path);
    if !normalized.is_dir() || !seen.insert(normalized.clone()) {
        return;
    }
    roots.push(normalized);
}

async fn attached_worktree_roots(cwd: &Path) -> Vec<PathBuf> {
    match run_git(cwd, &["worktree", "list", "--porcelain"], ROOT_DISCOVERY_TIMEOUT).await {
        Ok(out) if out.success => parse_porcelain_worktrees(&out.stdout),
        Ok(out) => {
            tracing::debug!(stderr = %out.stderr.trim(), "git worktree list failed");
            Vec::new()
        }
        Err(e) => {
            tracing::debug!(error = %e, "git worktree list unavailable");
            Vec::new()
        }
    }
}

fn sibling_rpi_dirs(cwd: &Path) -> Vec<PathBuf> {
    let Some(parent) = cwd.parent() else {
        return Vec::new();
    };
    let pattern = parent.join("*-rpi-*");
    let Some(pattern) = pattern.to_str() else {
        return Vec::new();
    };
    glob::glob(pattern)
        .map(|paths| paths.flatten().collect())
        .unwrap_or_default()
}

/// `cwd` plus every worktree attached to the same repository. When git
/// cannot list worktrees, sibling `*-rpi-*` directories are used instead.
pub async fn collect_search_roots(cwd: &Path) -> Vec<PathBuf> {
    let mut roots = Vec::new();
    let mut seen = HashSet::new();
    push_root(cwd, &mut seen, &mut roots);

    let attached = attached_worktree_roots(cwd).await;
    let extra = if attached.is_empty() {
        sibling_rpi_dirs(&normalize_root(cwd))
    } else {
        attached
    };
    for root in extra {
        push_root(&root, &mut seen, &mut roots);
    }
    roots
}

/// Every parseable registry state under `root`, with the path it came from.
/// Entries without a run ID are skipped.
pub fn registry_entries(root: &Path) -> Vec<(PathBuf, RunState)> {
    let Ok(entries) = std::fs::read_dir(rpi_dir(root).join("runs")) else {
        return Vec::new();
    };
    let mut out: Vec<(PathBuf, RunState)> = entries
        .flatten()
        .filter(|e| e.path().is_dir())
        .filter_map(|e| {
            let path = e.path().join(STATE_FILE);
            let state = load_state_file(&path).ok()?;
            (!state.run_id.is_empty()).then_some((path, state))
        })
        .collect();
    out.sort_by(|a, b| a.1.run_id.cmp(&b.1.run_id));
    out
}

pub fn tmux_session_name(run_id: &str, phase_num: u32) -> String {
    format!("rpi-{run_id}-p{phase_num}")
}

async fn tmux_session_alive(tmux: &str, run_id: &str) -> bool {
    if run_id.is_empty() {
        return false;
    }
    for phase in PHASES {
        let session = tmux_session_name(run_id, phase.num);
        let probe = Command::new(tmux)
            .args(["has-session", "-t", &session])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .status();
        if let Ok(Ok(status)) = tokio::time::timeout(TMUX_PROBE_TIMEOUT, probe).await
            && status.success()
        {
            return true;
        }
    }
    false
}

fn worktree_missing(state: &RunState) -> bool {
    state.worktree().is_some_and(|wt| !wt.exists())
}

/// A run whose recorded worktree is gone is never alive. Otherwise a fresh
/// heartbeat wins, and tmux is probed only when the heartbeat is stale.
pub async fn determine_liveness(root: &Path, state: &RunState, opts: &RegistryOptions) -> Liveness {
    let last_heartbeat = read_heartbeat(root, &state.run_id);
    if worktree_missing(state) {
        return Liveness {
            active: false,
            last_heartbeat,
        };
    }

    let fresh = last_heartbeat.is_some_and(|hb| {
        (Utc::now() - hb)
            .to_std()
            .map(|age| age < opts.heartbeat_freshness)
            .unwrap_or(true)
    });
    let active = fresh || tmux_session_alive(&opts.tmux_command, &state.run_id).await;
    Liveness {
        active,
        last_heartbeat,
    }
}

pub fn classify_status(state: &RunState, active: bool) -> String {
    if !state.terminal_status.is_empty() {
        return state.terminal_status.clone();
    }
    let status = if active {
        "running"
    } else if state.phase >= COMPLETED_PHASE {
        "completed"
    } else if worktree_missing(state) {
        "stale"
    } else {
        "unknown"
    };
    status.to_string()
}

pub fn classify_reason(state: &RunState, active: bool) -> String {
    if !state.terminal_reason.is_empty() {
        return state.terminal_reason.clone();
    }
    if !active && worktree_missing(state) {
        return "worktree missing".to_string();
    }
    String::new()
}

pub fn display_phase_name(phase: u32) -> String {
    PHASES
        .iter()
        .find(|p| p.num == phase)
        .map(|p| p.name.to_string())
        .unwrap_or_else(|| format!("phase-{phase}"))
}

fn elapsed_since(started_at: &str) -> String {
    DateTime::parse_from_rfc3339(started_at)
        .ok()
        .and_then(|t| (Utc::now() - t.with_timezone(&Utc)).to_std().ok())
        .map(|d| format_duration(Duration::from_secs(d.as_secs())))
        .unwrap_or_default()
}

async fn run_info(root: &Path, state: &RunState, opts: &RegistryOptions) -> RunInfo {
    let liveness = determine_liveness(root, state, opts).await;
    RunInfo {
        run_id: state.run_id.clone(),
        goal: state.goal.clone(),
        phase: state.phase,
        phase_name: display_phase_name(state.phase),
        status: classify_status(state, liveness.active),
        reason: classify_reason(state, liveness.active),
        epic_id: state.epic_id.clone(),
        worktree: root.to_path_buf(),
        started_at: state.started_at.clone(),
        elapsed: elapsed_since(&state.started_at),
        is_active: liveness.active,
        last_heartbeat: liveness.last_heartbeat,
    }
}

pub async fn scan_runs(root: &Path, opts: &RegistryOptions) -> Vec<RunInfo> {
    let mut runs = Vec::new();
    for (_, state) in registry_entries(root) {
        runs.push(run_info(root, &state, opts).await);
    }
    runs
}

/// Registry-first discovery across all search roots, split into active and
/// historical runs. The first root that reports a run ID wins.
pub async fn discover_runs(cwd: &Path, opts: &RegistryOptions) -> (Vec<RunInfo>, Vec<RunInfo>) {
    let mut active = Vec::new();
    let mut historical = Vec::new();
    let mut seen = HashSet::new();
    for root in collect_search_roots(cwd).await {
        for run in scan_runs(&root, opts).await {
            if !seen.insert(run.run_id.clone()) {
                continue;
            }
            if run.is_active {
                active.push(run);
            } else {
                historical.push(run);
            }
        }
    }
    (active, historical)
}

/// Find a run's state by ID: registry copies in every search root first,
/// then the flat copy in `cwd`.
pub async fn locate_run(cwd: &Path, run_id: &str) -> Result<(RunState, PathBuf)> {
    for root in collect_search_roots(cwd).await {
        let Some(dir) = run_registry_dir(&root, run_id) else {
            continue;
        };
        if let Ok(state) = load_state_file(&dir.join(STATE_FILE))
            && state.run_id == run_id
        {
            return Ok((state, root));
        }
    }

    let flat = flat_state_path(cwd);
    let state = load_state_file(&flat)
        .map_err(|_| anyhow!("run {run_id} not found in registry or flat state"))?;
    if state.run_id != run_id {
        return Err(anyhow!(
            "run {run_id} not found (flat state contains run {})",
            state.run_id
        ));
    }
    Ok((state, cwd.to_path_buf()))
}

/// Live status files in `cwd` and sibling run worktrees.
pub fn discover_live_statuses(cwd: &Path) -> Vec<LiveStatusSnapshot> {
    let mut candidates = vec![rpi_dir(cwd).join(LIVE_STATUS_FILE)];
    candidates.extend(
        sibling_rpi_dirs(&normalize_root(cwd))
            .into_iter()
            .map(|dir| rpi_dir(&dir).join(LIVE_STATUS_FILE)),
    );

    let mut seen = HashSet::new();
    candidates
        .into_iter()
        .filter(|path| seen.insert(normalize_root(path)))
        .filter_map(|path| {
            let content = std::fs::read_to_string(&path).ok()?;
            Some(LiveStatusSnapshot { path, content })
        })
        .collect()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::orchestrator::state::{RunOptionsSnapshot, save_state, update_heartbeat};
    use tempfile::tempdir;

    pub(crate) fn quiet_opts() -> RegistryOptions {
        RegistryOptions {
            heartbeat_freshness: Duration::from_secs(300),
            tmux_command: "/nonexistent/forge-rpi-tmux".to_string(),
        }
    }

    pub(crate) fn seed_run(root: &Path, run_id: &str, phase: u32) -> RunState {
        let mut state = RunState::new("add auth", 1, RunOptionsSnapshot::default());
        state.run_id = run_id.to_string();
        state.phase = phase;
        save_state(root, &state).unwrap();
        state
    }

    #[tokio::test]
    async fn test_fresh_heartbeat_is_alive() {
        let dir = tempdir().unwrap();
        let state = seed_run(dir.path(), "aaaaaaaaaaaa", 2);
        update_heartbeat(dir.path(), "aaaaaaaaaaaa");

        let live = determine_liveness(dir.path(), &state, &quiet_opts()).await;
        assert!(live.active);
        assert!(live.last_heartbeat.is_some());
        assert_eq!(classify_status(&state, live.active), "running");
    }

    #[tokio::test]
    async fn test_missing_worktree_is_never_alive() {
        let dir = tempdir().unwrap();
        let mut state = seed_run(dir.path(), "bbbbbbbbbbbb", 2);
        state.worktree_path = dir.path().join("gone").to_string_lossy().into_owned();
        update_heartbeat(dir.path(), "bbbbbbbbbbbb");

        let live = determine_liveness(dir.path(), &state, &quiet_opts()).await;
        assert!(!live.active);
        assert_eq!(classify_status(&state, false), "stale");
        assert_eq!(classify_reason(&state, false), "worktree missing");
    }

    #[tokio::test]
    async fn test_no_heartbeat_without_session_is_inactive() {
        let dir = tempdir().unwrap();
        let state = seed_run(dir.path(), "cccccccccccc", 1);
        let live = determine_liveness(dir.path(), &state, &quiet_opts()).await;
        assert!(!live.active);
        assert_eq!(classify_status(&state, false), "unknown");
        assert_eq!(classify_reason(&state, false), "");
    }

    #[test]
    fn test_terminal_status_takes_precedence() {
        let mut state = RunState::default();
        state.phase = 3;
        assert_eq!(classify_status(&state, false), "completed");
        state.terminal_status = "failed".to_string();
        state.terminal_reason = "phase validation: boom".to_string();
        assert_eq!(classify_status(&state, true), "failed");
        assert_eq!(classify_reason(&state, true), "phase validation: boom");
    }

    #[tokio::test]
    async fn test_discover_splits_active_and_historical() {
        let dir = tempdir().unwrap();
        seed_run(dir.path(), "aaaaaaaaaaaa", 2);
        seed_run(dir.path(), "bbbbbbbbbbbb", 3);
        update_heartbeat(dir.path(), "aaaaaaaaaaaa");
        std::fs::create_dir_all(rpi_dir(dir.path()).join("runs").join("empty")).unwrap();

        let (active, historical) = discover_runs(dir.path(), &quiet_opts()).await;
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].run_id, "aaaaaaaaaaaa");
        assert_eq!(active[0].phase_name, "implementation");
        assert_eq!(historical.len(), 1);
        assert_eq!(historical[0].status, "completed");
    }

    #[tokio::test]
    async fn test_locate_run() {
        let dir = tempdir().unwrap();
        seed_run(dir.path(), "dddddddddddd", 2);
        let (state, root) = locate_run(dir.path(), "dddddddddddd").await.unwrap();
        assert_eq!(state.phase, 2);
        assert_eq!(root, normalize_root(dir.path()));

        let err = locate_run(dir.path(), "eeeeeeeeeeee").await.unwrap_err();
        assert!(err.to_string().contains("flat state contains run dddddddddddd"));
    }

    #[test]
    fn test_live_status_discovery() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("repo");
        let sibling = dir.path().join("repo-rpi-aaaaaaaaaaaa");
        for d in [&root, &sibling] {
            std::fs::create_dir_all(rpi_dir(d)).unwrap();
        }
        std::fs::write(rpi_dir(&sibling).join(LIVE_STATUS_FILE), "| Phase |").unwrap();

        let found = discover_live_statuses(&root);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].content, "| Phase |");
    }

    #[test]
    fn test_display_phase_name() {
        assert_eq!(display_phase_name(1), "discovery");
        assert_eq!(display_phase_name(7), "phase-7");
    }
}
