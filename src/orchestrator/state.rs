//! Persisted run state.
//!
//! Every run writes `.agents/rpi/phased-state.json` (the "current" copy) and
//! `.agents/rpi/runs/<run_id>/phased-state.json` (the registry copy). Both
//! are rewritten atomically after every transition.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Local, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::complexity::ComplexityLevel;
use crate::executor::RuntimeMode;
use crate::util::atomic_write;

pub const STATE_FILE: &str = "phased-state.json";
pub const HEARTBEAT_FILE: &str = "heartbeat.txt";
pub const STATE_SCHEMA_VERSION: u32 = 1;

/// Terminal outcome of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalStatus {
    Completed,
    Failed,
    Interrupted,
    Stale,
}

impl TerminalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TerminalStatus::Completed => "completed",
            TerminalStatus::Failed => "failed",
            TerminalStatus::Interrupted => "interrupted",
            TerminalStatus::Stale => "stale",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "completed" => Some(TerminalStatus::Completed),
            "failed" => Some(TerminalStatus::Failed),
            "interrupted" => Some(TerminalStatus::Interrupted),
            "stale" => Some(TerminalStatus::Stale),
            _ => None,
        }
    }
}

/// Snapshot of the options a run was started with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunOptionsSnapshot {
    pub from: String,
    pub fast_path: bool,
    pub test_first: bool,
    pub swarm_first: bool,
    pub live_status: bool,
    pub no_worktree: bool,
    pub max_retries: u32,
    pub phase_timeout_secs: u64,
    pub stall_timeout_secs: u64,
    pub stream_startup_timeout_secs: u64,
    pub runtime_mode: RuntimeMode,
    pub runtime_command: String,
    pub tracker_command: String,
    pub tmux_command: String,
}

impl Default for RunOptionsSnapshot {
    fn default() -> Self {
        Self {
            from: "discovery".to_string(),
            fast_path: false,
            test_first: false,
            swarm_first: true,
            live_status: false,
            no_worktree: false,
            max_retries: 3,
            phase_timeout_secs: 90 * 60,
            stall_timeout_secs: 10 * 60,
            stream_startup_timeout_secs: 45,
            runtime_mode: RuntimeMode::Auto,
            runtime_command: "claude".to_string(),
            tracker_command: "bd".to_string(),
            tmux_command: "tmux".to_string(),
        }
    }
}

fn is_zero(v: &u32) -> bool {
    *v == 0
}

/// Orchestrator state for one run. Legacy documents missing any field load
/// with empty defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunState {
    pub schema_version: u32,
    pub goal: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub epic_id: String,
    pub phase: u32,
    pub start_phase: u32,
    pub cycle: u32,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub parent_epic: String,
    pub fast_path: bool,
    pub test_first: bool,
    pub swarm_first: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub complexity: Option<ComplexityLevel>,
    pub verdicts: BTreeMap<String, String>,
    pub attempts: BTreeMap<String, u32>,
    pub started_at: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub worktree_path: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub run_id: String,
    #[serde(skip_serializing_if = "is_zero")]
    pub orchestrator_pid: u32,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub backend: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub terminal_status: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub terminal_reason: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub terminated_at: String,
    pub opts: RunOptionsSnapshot,
}

impl Default for RunState {
    fn default() -> Self {
        Self {
            schema_version: STATE_SCHEMA_VERSION,
            goal: String::new(),
            epic_id: String::new(),
            phase: 1,
            start_phase: 1,
            cycle: 1,
            parent_epic: String::new(),
            fast_path: false,
            test_first: false,
            swarm_first: false,
            complexity: None,
            verdicts: BTreeMap::new(),
            attempts: BTreeMap::new(),
            started_at: String::new(),
            worktree_path: String::new(),
            run_id: String::new(),
            orchestrator_pid: 0,
            backend: String::new(),
            terminal_status: String::new(),
            terminal_reason: String::new(),
            terminated_at: String::new(),
            opts: RunOptionsSnapshot::default(),
        }
    }
}

impl RunState {
    pub fn new(goal: &str, start_phase: u32, opts: RunOptionsSnapshot) -> Self {
        Self {
            goal: goal.to_string(),
            phase: start_phase,
            start_phase,
            fast_path: opts.fast_path,
            test_first: opts.test_first,
            swarm_first: opts.swarm_first,
            started_at: now_rfc3339(),
            opts,
            ..Self::default()
        }
    }

    pub fn attempt_key(phase_num: u32) -> String {
        format!("phase_{phase_num}")
    }

    pub fn attempts_for(&self, phase_num: u32) -> u32 {
        self.attempts
            .get(&Self::attempt_key(phase_num))
            .copied()
            .unwrap_or(0)
    }

    pub fn terminal(&self) -> Option<TerminalStatus> {
        TerminalStatus::parse(&self.terminal_status)
    }

    pub fn set_terminal(&mut self, status: TerminalStatus, reason: impl Into<String>) {
        self.terminal_status = status.as_str().to_string();
        self.terminal_reason = reason.into();
        self.terminated_at = now_rfc3339();
    }

    pub fn worktree(&self) -> Option<PathBuf> {
        (!self.worktree_path.is_empty()).then(|| PathBuf::from(&self.worktree_path))
    }
}

pub fn now_rfc3339() -> String {
    Local::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

pub fn rpi_dir(root: &Path) -> PathBuf {
    root.join(".agents").join("rpi")
}

pub fn run_registry_dir(root: &Path, run_id: &str) -> Option<PathBuf> {
    (!run_id.is_empty()).then(|| rpi_dir(root).join("runs").join(run_id))
}

pub fn flat_state_path(root: &Path) -> PathBuf {
    rpi_dir(root).join(STATE_FILE)
}

fn encode(state: &RunState) -> Result<Vec<u8>> {
    let mut data = serde_json::to_vec_pretty(state).context("Failed to serialize run state")?;
    data.push(b'\n');
    Ok(data)
}

/// Write the current copy, then the registry copy when the run has an id.
/// A failed registry write is logged, not returned.
pub fn save_state(root: &Path, state: &RunState) -> Result<()> {
    let data = encode(state)?;
    let flat = flat_state_path(root);
    atomic_write(&flat, &data).context("Failed to write run state")?;

    if let Some(dir) = run_registry_dir(root, &state.run_id)
        && let Err(e) = atomic_write(&dir.join(STATE_FILE), &data)
    {
        tracing::warn!(run_id = %state.run_id, error = %e, "could not write run registry state");
    }
    tracing::debug!(path = %flat.display(), "state saved");
    Ok(())
}

pub fn parse_state(data: &[u8]) -> Result<RunState> {
    serde_json::from_slice(data).context("Failed to parse run state")
}

pub fn load_state_file(path: &Path) -> Result<RunState> {
    let data = std::fs::read(path)
        .with_context(|| format!("Failed to read run state {}", path.display()))?;
    parse_state(&data)
}

fn latest_registry_state(root: &Path) -> Option<(PathBuf, std::time::SystemTime)> {
    let runs = rpi_dir(root).join("runs");
    std::fs::read_dir(runs)
        .ok()?
        .flatten()
        .filter(|e| e.path().is_dir())
        .filter_map(|e| {
            let path = e.path().join(STATE_FILE);
            let modified = std::fs::metadata(&path).ok()?.modified().ok()?;
            Some((path, modified))
        })
        .max_by_key(|(_, modified)| *modified)
}

/// Most recent registry copy when it is at least as new as the current
/// copy, otherwise the current copy.
pub fn load_state(root: &Path) -> Result<RunState> {
    let flat = flat_state_path(root);
    if let Some((registry, registry_mtime)) = latest_registry_state(root) {
        let flat_mtime = std::fs::metadata(&flat).and_then(|m| m.modified()).ok();
        let prefer_registry = match flat_mtime {
            None => true,
            Some(flat_mtime) => registry_mtime >= flat_mtime,
        };
        if prefer_registry && let Ok(state) = load_state_file(&registry) {
            return Ok(state);
        }
    }
    load_state_file(&flat)
}

/// Best-effort heartbeat refresh.
pub fn update_heartbeat(root: &Path, run_id: &str) {
    let Some(dir) = run_registry_dir(root, run_id) else {
        return;
    };
    let ts = format!("{}\n", Utc::now().to_rfc3339_opts(SecondsFormat::Nanos, true));
    if let Err(e) = atomic_write(&dir.join(HEARTBEAT_FILE), ts.as_bytes()) {
        tracing::warn!(run_id, error = %e, "could not update heartbeat");
    }
}

/// Missing or unparseable heartbeats read as `None`.
pub fn read_heartbeat(root: &Path, run_id: &str) -> Option<DateTime<Utc>> {
    let path = run_registry_dir(root, run_id)?.join(HEARTBEAT_FILE);
    let raw = std::fs::read_to_string(path).ok()?;
    DateTime::parse_from_rfc3339(raw.trim())
        .ok()
        .map(|ts| ts.with_timezone(&Utc))
}

/// Set terminal metadata on a state file in place, preserving any fields
/// this version does not know about.
pub fn mark_terminal(path: &Path, status: TerminalStatus, reason: &str) -> Result<()> {
    let data =
        std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
    let mut doc: Value = serde_json::from_slice(&data)
        .with_context(|| format!("Failed to parse {}", path.display()))?;
    let Some(obj) = doc.as_object_mut() else {
        bail!("{} is not a JSON object", path.display());
    };
    obj.insert("terminal_status".into(), Value::from(status.as_str()));
    obj.insert("terminal_reason".into(), Value::from(reason));
    obj.insert("terminated_at".into(), Value::from(now_rfc3339()));

    let mut out = serde_json::to_vec_pretty(&doc)?;
    out.push(b'\n');
    atomic_write(path, &out)
}
