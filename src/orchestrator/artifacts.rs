//! On-disk run artifacts: phase results, phase summaries, handoff markers
//! and the orchestration log with its ledger mirror.

use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use chrono::{Local, SecondsFormat};
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::state::{RunState, rpi_dir};
use crate::ledger::{LedgerEvent, action_from_details, append_event, materialize_run_cache};
use crate::phase::PHASES;
use crate::util::atomic_write;

pub const ORCHESTRATION_LOG: &str = "phased-orchestration.log";
pub const LIVE_STATUS_FILE: &str = "live-status.md";

/// `.agents/rpi/phase-N-result.json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseResult {
    pub schema_version: u32,
    pub run_id: String,
    pub phase: u32,
    pub phase_name: String,
    pub status: String,
    #[serde(default)]
    pub retries: u32,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub backend: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub verdicts: BTreeMap<String, String>,
    pub started_at: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub completed_at: String,
    #[serde(default)]
    pub duration_seconds: f64,
}

pub fn phase_result_path(root: &Path, phase_num: u32) -> PathBuf {
    rpi_dir(root).join(format!("phase-{phase_num}-result.json"))
}

pub fn summary_path(root: &Path, phase_num: u32) -> PathBuf {
    rpi_dir(root).join(format!("phase-{phase_num}-summary.md"))
}

pub fn handoff_path(root: &Path, phase_num: u32) -> PathBuf {
    rpi_dir(root).join(format!("phase-{phase_num}-handoff.md"))
}

pub fn write_phase_result(root: &Path, result: &PhaseResult) -> Result<()> {
    let data = serde_json::to_vec_pretty(result).context("Failed to serialize phase result")?;
    let path = phase_result_path(root, result.phase);
    atomic_write(&path, &data)?;
    tracing::debug!(path = %path.display(), "phase result written");
    Ok(())
}

/// The prior phase must have left a `completed` result.
pub fn validate_prior_phase_result(root: &Path, expected_phase: u32) -> Result<()> {
    let path = phase_result_path(root, expected_phase);
    let data = std::fs::read(&path).with_context(|| {
        format!(
            "prior phase {expected_phase} result not found at {}",
            path.display()
        )
    })?;
    let result: PhaseResult = serde_json::from_slice(&data)
        .with_context(|| format!("prior phase {expected_phase} result is malformed"))?;
    if result.status != "completed" {
        bail!(
            "prior phase {expected_phase} has status {:?} (expected \"completed\")",
            result.status
        );
    }
    Ok(())
}

/// Remove summaries, handoffs and results left by an earlier run.
pub fn clean_phase_artifacts(root: &Path) {
    for phase in PHASES {
        for path in [
            summary_path(root, phase.num),
            handoff_path(root, phase.num),
            phase_result_path(root, phase.num),
        ] {
            let _ = std::fs::remove_file(path);
        }
    }
}

pub fn handoff_detected(root: &Path, phase_num: u32) -> bool {
    handoff_path(root, phase_num).exists()
}

/// Mechanical summary used when the agent did not write one.
pub fn fallback_summary(state: &RunState, phase_num: u32) -> String {
    match phase_num {
        1 => {
            let mut s = format!("Discovery completed for goal: {}\n", state.goal);
            s.push_str("Research: see .agents/research/ for findings.\n");
            if !state.epic_id.is_empty() {
                s.push_str(&format!("Plan: epic {}", state.epic_id));
                if state.fast_path {
                    s.push_str(" (micro-epic, fast path)");
                }
                s.push('\n');
            }
            if let Some(v) = state.verdicts.get("pre_mortem") {
                s.push_str(&format!(
                    "Pre-mortem verdict: {v}\nSee .agents/council/*pre-mortem*.md for details."
                ));
            }
            s
        }
        2 => format!(
            "Implementation completed for epic {}.\nCheck the tracker children of {} for issue statuses.",
            state.epic_id, state.epic_id
        ),
        3 => {
            let mut s = String::new();
            if let Some(v) = state.verdicts.get("vibe") {
                s.push_str(&format!(
                    "Vibe verdict: {v}\nSee .agents/council/*vibe*.md for details.\n"
                ));
            }
            if let Some(v) = state.verdicts.get("post_mortem") {
                s.push_str(&format!("Post-mortem verdict: {v}\n"));
            }
            s.push_str("See .agents/council/*post-mortem*.md and .agents/learnings/ for extracted knowledge.");
            s
        }
        _ => String::new(),
    }
}

/// Returns true when a fallback was written.
pub fn write_phase_summary(root: &Path, state: &RunState, phase_num: u32) -> Result<bool> {
    let path = summary_path(root, phase_num);
    if path.exists() {
        return Ok(false);
    }
    let summary = fallback_summary(state, phase_num);
    if summary.is_empty() {
        return Ok(false);
    }
    atomic_write(&path, summary.as_bytes())?;
    Ok(true)
}

/// Human-readable transition log, mirrored into the ledger.
#[derive(Debug, Clone)]
pub struct OrchestrationLog {
    ledger_root: PathBuf,
    path: PathBuf,
}

impl OrchestrationLog {
    pub fn new(root: &Path) -> Self {
        Self {
            ledger_root: root.to_path_buf(),
            path: rpi_dir(root).join(ORCHESTRATION_LOG),
        }
    }

    /// Keep the ledger in the main checkout while the log follows the worktree.
    pub fn with_ledger_root(mut self, root: &Path) -> Self {
        self.ledger_root = root.to_path_buf();
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append `[ts] [run] phase: details`. Failures are logged and swallowed
    /// so bookkeeping never aborts a phase.
    pub fn transition(&self, run_id: &str, phase: &str, details: &str) {
        let ts = Local::now().to_rfc3339_opts(SecondsFormat::Secs, true);
        let entry = if run_id.is_empty() {
            format!("[{ts}] {phase}: {details}\n")
        } else {
            format!("[{ts}] [{run_id}] {phase}: {details}\n")
        };
        if let Err(e) = self.append(&entry) {
            tracing::warn!(path = %self.path.display(), error = %e, "could not write orchestration log");
            return;
        }
        self.mirror(run_id, phase, details);
    }

    fn append(&self, entry: &str) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(entry.as_bytes())?;
        Ok(())
    }

    fn mirror(&self, run_id: &str, phase: &str, details: &str) {
        if run_id.is_empty() {
            return;
        }
        let event = LedgerEvent {
            run_id: run_id.to_string(),
            phase: phase.to_string(),
            action: action_from_details(details),
            details: json!({ "details": details }),
        };
        if let Err(e) = append_event(&self.ledger_root, event) {
            tracing::warn!(run_id, error = %e, "could not append ledger event");
            return;
        }
        if let Err(e) = materialize_run_cache(&self.ledger_root, run_id) {
            tracing::warn!(run_id, error = %e, "could not refresh run cache");
        }
    }

    pub fn failure_context(&self, run_id: &str, phase: &str, err: &dyn std::fmt::Display) {
        self.transition(
            run_id,
            phase,
            &format!(
                "FAILURE_CONTEXT: {err} | action: check .agents/rpi/ for phase artifacts, review .agents/council/ for verdicts"
            ),
        );
    }
}
