//! Live status snapshot: a Markdown table rewritten atomically after every
//! stream event so external watchers can tail it.

use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Local};

use super::events::summarize_message;
use crate::phase::PHASES;
use crate::util::{atomic_write, truncate_str};

const FIELD_MAX: usize = 72;

/// Per-phase progress counters.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PhaseProgress {
    pub name: String,
    pub session_id: String,
    pub model: String,
    pub last_tool: String,
    pub current_action: String,
    pub retry_count: u32,
    pub last_error: String,
    pub tool_count: u32,
    pub turn_count: u32,
    pub tokens: u64,
    pub cost_usd: f64,
    pub elapsed: Duration,
    pub last_update: Option<DateTime<Local>>,
}

impl PhaseProgress {
    /// Fold a freshly parsed snapshot into this slot; empty fields never erase.
    pub fn merge_from(&mut self, src: &PhaseProgress) {
        if !src.name.is_empty() {
            self.name = src.name.clone();
        }
        if !src.session_id.is_empty() {
            self.session_id = src.session_id.clone();
        }
        if !src.model.is_empty() {
            self.model = src.model.clone();
        }
        if !src.last_tool.is_empty() {
            self.last_tool = src.last_tool.clone();
        }
        if !src.current_action.is_empty() {
            self.current_action = src.current_action.clone();
        }
        if src.retry_count != 0 {
            self.retry_count = src.retry_count;
        }
        if !src.last_error.is_empty() {
            self.last_error = src.last_error.clone();
        }
        self.tool_count = self.tool_count.max(src.tool_count);
        self.turn_count = self.turn_count.max(src.turn_count);
        self.tokens = self.tokens.max(src.tokens);
        if src.cost_usd > 0.0 {
            self.cost_usd = src.cost_usd;
        }
        if src.elapsed > Duration::ZERO {
            self.elapsed = src.elapsed;
        }
        if src.last_update.is_some() {
            self.last_update = src.last_update;
        }
    }
}

/// One slot per phase, named and marked pending.
pub fn build_all_phases() -> Vec<PhaseProgress> {
    PHASES
        .iter()
        .map(|p| PhaseProgress {
            name: p.name.to_string(),
            current_action: "pending".to_string(),
            ..PhaseProgress::default()
        })
        .collect()
}

fn normalize_field(s: &str) -> String {
    let v = s.replace('|', "/");
    let v = v.trim();
    if v.is_empty() {
        "-".to_string()
    } else {
        truncate_str(v, FIELD_MAX)
    }
}

fn format_elapsed(d: Duration) -> String {
    let secs = d.as_secs();
    let (h, m, s) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    if h > 0 {
        format!("{h}h{m}m{s}s")
    } else if m > 0 {
        format!("{m}m{s}s")
    } else {
        format!("{s}s")
    }
}

/// Render the table. `current_index` is the 0-based running phase; earlier
/// rows are `done`, later rows `pending`.
pub fn render_live_status(phases: &[PhaseProgress], current_index: usize) -> String {
    let mut out = String::from("# Live Status\n\n");
    out.push_str("| Phase | Status | Elapsed | Tools | Tokens | Cost | Action | Retries | Last Error | Updated |\n");
    out.push_str("|-------|--------|---------|-------|--------|------|--------|---------|------------|---------|\n");

    for (i, p) in phases.iter().enumerate() {
        let status = match i.cmp(&current_index) {
            std::cmp::Ordering::Less => "done",
            std::cmp::Ordering::Equal => "running",
            std::cmp::Ordering::Greater => "pending",
        };
        let updated = p
            .last_update
            .map(|t| t.format("%H:%M:%S").to_string())
            .unwrap_or_else(|| "-".to_string());
        out.push_str(&format!(
            "| {} | {} | {} | {} | {} | ${:.4} | {} | {} | {} | {} |\n",
            p.name,
            status,
            format_elapsed(p.elapsed),
            p.tool_count,
            p.tokens,
            p.cost_usd,
            normalize_field(&p.current_action),
            p.retry_count,
            normalize_field(&p.last_error),
            updated
        ));
    }
    out
}

/// Atomically rewrite the status file.
pub fn write_live_status(path: &Path, phases: &[PhaseProgress], current_index: usize) -> Result<()> {
    atomic_write(path, render_live_status(phases, current_index).as_bytes())
}

/// Shared per-run progress slots plus the file they render to.
///
/// The orchestrator and the stream executor both write through this; every
/// write re-renders the whole file.
#[derive(Debug)]
pub struct LiveStatus {
    path: PathBuf,
    slots: Mutex<Vec<PhaseProgress>>,
}

impl LiveStatus {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            slots: Mutex::new(build_all_phases()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn snapshot(&self) -> Vec<PhaseProgress> {
        self.slots
            .lock()
            .map(|s| s.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }

    fn with_slots<R>(&self, f: impl FnOnce(&mut Vec<PhaseProgress>) -> R) -> R {
        let mut guard = self
            .slots
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut guard)
    }

    /// Render with `current_index` as the running row.
    pub fn write(&self, current_index: usize) {
        let phases = self.snapshot();
        if let Err(e) = write_live_status(&self.path, &phases, current_index) {
            tracing::warn!(error = %e, "could not write live status");
        }
    }

    /// Merge parsed stream progress into the slot for `phase_num` and re-render.
    pub fn merge_progress(&self, phase_num: u32, progress: &PhaseProgress) {
        let Some(idx) = (phase_num as usize).checked_sub(1) else {
            return;
        };
        self.with_slots(|slots| {
            if let Some(slot) = slots.get_mut(idx) {
                slot.merge_from(progress);
            }
        });
        self.write(idx);
    }

    /// Set action, retry count and last error for a phase, then re-render.
    pub fn update_phase_status(&self, phase_num: u32, action: &str, retries: u32, error: &str) {
        let Some(idx) = (phase_num as usize).checked_sub(1) else {
            return;
        };
        let found = self.with_slots(|slots| match slots.get_mut(idx) {
            Some(slot) => {
                if !action.is_empty() {
                    slot.current_action = summarize_message(action);
                }
                slot.retry_count = retries;
                slot.last_error = summarize_message(error);
                slot.last_update = Some(Local::now());
                true
            }
            None => false,
        });
        if found {
            self.write(idx);
        }
    }
}
