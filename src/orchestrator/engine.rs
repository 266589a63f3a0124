//! The phase engine: one run through discovery, implementation and
//! validation.
//!
//! [`Engine::run`] resolves the goal and start phase, optionally resumes a
//! prior run, isolates the run in a sibling worktree, and then drives each
//! phase through a [`PhaseExecutor`]. Everything a phase touches lives on the
//! per-run [`RunContext`]; nothing is read from process globals.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::anyhow;
use tokio::task::JoinHandle;

use super::artifacts::{self, LIVE_STATUS_FILE, OrchestrationLog, PhaseResult};
use super::complexity::{ComplexityLevel, classify_complexity};
use super::gate::{GateFailure, MAX_FINDINGS, Verdict, find_latest_council_report, read_gate_report};
use super::prompts::{self, RetryContext};
use super::state::{
    RunOptionsSnapshot, RunState, STATE_FILE, TerminalStatus, flat_state_path, load_state,
    mark_terminal, now_rfc3339, rpi_dir, run_registry_dir, save_state, update_heartbeat,
};
use super::tracker::{CrankStatus, Tracker, parse_crank_completion, parse_fast_path};
use crate::config::Config;
use crate::errors::{ExecutorError, OrchestratorError};
use crate::executor::{
    BackendKind, ExecutorOptions, LiveStatus, PhaseExecutor, RuntimeMode, build_executor,
    select_backend,
};
use crate::phase::{PHASES, phase_name, phase_name_to_num};
use crate::ui::RunUi;
use crate::util::{find_on_path, format_duration, generate_run_id};
use crate::worktree::WorktreeManager;

/// Options for a single run, after config layering and CLI flags.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub from: String,
    pub max_retries: u32,
    pub phase_timeout: Duration,
    pub stall_timeout: Duration,
    pub stream_startup_timeout: Duration,
    pub stall_check_interval: Duration,
    pub runtime_mode: RuntimeMode,
    pub runtime_command: String,
    pub tracker_command: String,
    pub tmux_command: String,
    pub live_status: bool,
    pub no_worktree: bool,
    pub fast_path: bool,
    pub test_first: bool,
    pub swarm_first: bool,
    pub dry_run: bool,
}

impl RunOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            from: "discovery".to_string(),
            max_retries: config.run.max_retries,
            phase_timeout: config.run.phase_timeout,
            stall_timeout: config.run.stall_timeout,
            stream_startup_timeout: config.run.stream_startup_timeout,
            stall_check_interval: config.run.stall_check_interval,
            runtime_mode: config.runtime.mode,
            runtime_command: config.runtime.command.clone(),
            tracker_command: config.runtime.tracker_command.clone(),
            tmux_command: config.runtime.tmux_command.clone(),
            live_status: config.run.live_status,
            no_worktree: false,
            fast_path: false,
            test_first: false,
            swarm_first: config.run.swarm_first,
            dry_run: false,
        }
    }

    pub fn snapshot(&self) -> RunOptionsSnapshot {
        RunOptionsSnapshot {
            from: self.from.clone(),
            fast_path: self.fast_path,
            test_first: self.test_first,
            swarm_first: self.swarm_first,
            live_status: self.live_status,
            no_worktree: self.no_worktree,
            max_retries: self.max_retries,
            phase_timeout_secs: self.phase_timeout.as_secs(),
            stall_timeout_secs: self.stall_timeout.as_secs(),
            stream_startup_timeout_secs: self.stream_startup_timeout.as_secs(),
            runtime_mode: self.runtime_mode,
            runtime_command: self.runtime_command.clone(),
            tracker_command: self.tracker_command.clone(),
            tmux_command: self.tmux_command.clone(),
        }
    }
}

impl Default for RunOptions {
    fn default() -> Self {
        let config = Config {
            project_dir: PathBuf::from("."),
            verbose: false,
            yes: false,
            runtime: Default::default(),
            run: Default::default(),
            supervisor: Default::default(),
        };
        Self::from_config(&config)
    }
}

/// Everything one run needs, built once and passed by reference.
pub struct RunContext {
    /// Main checkout: ledger, registry mirror, resume source.
    pub repo_root: PathBuf,
    /// Where sessions are spawned: the worktree, or the repo root.
    pub cwd: PathBuf,
    pub opts: RunOptions,
    pub state: RunState,
    pub executor: Arc<dyn PhaseExecutor>,
    pub live: Option<Arc<LiveStatus>>,
    pub tracker: Tracker,
    pub log: OrchestrationLog,
    pub ui: RunUi,
}

impl RunContext {
    fn state_roots(&self) -> Vec<&Path> {
        if self.cwd == self.repo_root {
            vec![&self.cwd]
        } else {
            vec![&self.cwd, &self.repo_root]
        }
    }

    /// Persist to the spawn directory and, for worktree runs, mirror into the
    /// main checkout so status and resume can find the run after removal.
    fn save(&self) {
        for root in self.state_roots() {
            if let Err(e) = save_state(root, &self.state) {
                tracing::warn!(root = %root.display(), error = %e, "could not save run state");
            }
        }
    }

    fn heartbeat(&self) {
        for root in self.state_roots() {
            update_heartbeat(root, &self.state.run_id);
        }
    }

    fn log(&self, phase: &str, details: &str) {
        self.log.transition(&self.state.run_id, phase, details);
    }

    fn live_update(&self, phase_num: u32, action: &str, error: &str) {
        if let Some(live) = &self.live {
            live.update_phase_status(phase_num, action, self.state.attempts_for(phase_num), error);
        }
    }

    async fn spawn(&self, phase_num: u32, prompt: &str) -> Result<(), ExecutorError> {
        self.heartbeat();
        let result = self
            .executor
            .execute(prompt, &self.cwd, &self.state.run_id, phase_num)
            .await;
        self.heartbeat();
        result
    }

    fn init_artifacts(&self) -> anyhow::Result<()> {
        let dir = rpi_dir(&self.cwd);
        std::fs::create_dir_all(&dir)?;
        if self.state.start_phase == 1 {
            artifacts::clean_phase_artifacts(&self.cwd);
        }
        self.ui.banner(
            &self.state.goal,
            self.state.start_phase,
            phase_name(self.state.start_phase),
        );
        self.ui
            .line("Monitor in a second terminal: forge-rpi status --watch");
        if let Some(live) = &self.live {
            self.ui
                .line(format!("Live status: {}", live.path().display()));
            live.write(self.state.start_phase.saturating_sub(1) as usize);
        }
        Ok(())
    }

    async fn run_phases(&mut self) -> Result<(), OrchestratorError> {
        let start = self.state.start_phase;
        for phase in PHASES.iter().filter(|p| p.num >= start) {
            if phase.num == 3
                && self.state.fast_path
                && self.state.complexity == Some(ComplexityLevel::Fast)
            {
                self.ui.skip_phase(phase.num, phase.name, "complexity: fast");
                self.log(phase.name, "skipped - complexity: fast");
                continue;
            }
            self.run_single_phase(phase.num).await?;
        }
        Ok(())
    }

    async fn run_single_phase(&mut self, phase_num: u32) -> Result<(), OrchestratorError> {
        let name = phase_name(phase_num);
        self.ui.start_phase(phase_num, name);
        self.state.phase = phase_num;
        self.save();

        let prompt = prompts::build_phase_prompt(&self.cwd, phase_num, &self.state)?;
        self.log(name, "started");
        self.live_update(phase_num, "starting", "");

        if self.opts.dry_run {
            self.ui.line(format!(
                "[dry-run] Would spawn: {} -p '{}'",
                self.opts.runtime_command,
                prompts::prompt_preview(&prompt)
            ));
            if !self.opts.no_worktree
                && self.state.worktree_path.is_empty()
                && phase_num == self.state.start_phase
            {
                let base = self
                    .repo_root
                    .file_name()
                    .map(|n| n.to_string_lossy().to_string())
                    .unwrap_or_default();
                self.ui.line(format!(
                    "[dry-run] Would create worktree: ../{base}-rpi-<id>/ (detached)"
                ));
            }
            self.log(name, "dry-run");
            return Ok(());
        }

        let started_at = now_rfc3339();
        let started = Instant::now();
        if let Err(e) = self.spawn(phase_num, &prompt).await {
            self.live_update(phase_num, "failed", &e.to_string());
            self.log(name, &format!("FAILED: {e}"));
            self.write_result(phase_num, "failed", &e.to_string(), &started_at, started);
            return Err(OrchestratorError::PhaseFailed {
                phase: phase_num,
                name,
                source: e,
            });
        }

        let elapsed = started.elapsed();
        self.ui.phase_complete(phase_num, elapsed);
        self.log(name, &format!("completed in {}", format_duration(elapsed)));
        self.live_update(phase_num, "completed", "");

        if let Some(gate) = self.post_phase(phase_num).await? {
            if phase_num == 1 {
                // Discovery re-plans inside its own session; a FAIL here is final.
                self.log(name, &format!("FAILED: pre-mortem {}", gate.verdict));
                return Err(gate.into());
            }
            self.resolve_gate(phase_num, gate).await?;
        }

        if artifacts::handoff_detected(&self.cwd, phase_num) {
            self.ui.warn(format!(
                "Phase {phase_num}: handoff detected - phase reported context degradation"
            ));
            self.log(name, "HANDOFF detected - context degradation");
        }

        match artifacts::write_phase_summary(&self.cwd, &self.state, phase_num) {
            Ok(true) => self.ui.line(format!(
                "Phase {phase_num}: no agent-written summary found, writing fallback"
            )),
            Ok(false) => self
                .ui
                .line(format!("Phase {phase_num}: agent-written summary found")),
            Err(e) => tracing::warn!(phase = phase_num, error = %e, "could not write phase summary"),
        }

        self.write_result(phase_num, "completed", "", &started_at, started);
        self.save();
        Ok(())
    }

    fn write_result(
        &self,
        phase_num: u32,
        status: &str,
        error: &str,
        started_at: &str,
        started: Instant,
    ) {
        let result = PhaseResult {
            schema_version: 1,
            run_id: self.state.run_id.clone(),
            phase: phase_num,
            phase_name: phase_name(phase_num).to_string(),
            status: status.to_string(),
            retries: self.state.attempts_for(phase_num),
            error: error.to_string(),
            backend: self.state.backend.clone(),
            verdicts: self.state.verdicts.clone(),
            started_at: started_at.to_string(),
            completed_at: now_rfc3339(),
            duration_seconds: started.elapsed().as_secs_f64(),
        };
        if let Err(e) = artifacts::write_phase_result(&self.cwd, &result) {
            tracing::warn!(phase = phase_num, error = %e, "could not write phase result");
        }
    }

    fn prerequisite(&self, phase_num: u32, prior: u32) -> Result<(), OrchestratorError> {
        artifacts::validate_prior_phase_result(&self.cwd, prior).map_err(|e| {
            OrchestratorError::Prerequisite {
                phase: phase_num,
                message: format!("{e:#}"),
            }
        })
    }

    /// Read gate artifacts for a finished phase. `Some` means the gate did not
    /// pass and the caller decides whether to retry.
    async fn post_phase(&mut self, phase_num: u32) -> Result<Option<GateFailure>, OrchestratorError> {
        match phase_num {
            1 => Ok(self.post_discovery().await),
            2 => self.post_implementation().await,
            3 => self.post_validation(),
            _ => Ok(None),
        }
    }

    async fn post_discovery(&mut self) -> Option<GateFailure> {
        match self.tracker.latest_epic(&self.cwd).await {
            Ok(epic) => {
                self.ui.line(format!("Epic ID: {epic}"));
                self.log("discovery", &format!("epic={epic}"));
                self.state.epic_id = epic;
            }
            Err(e) => {
                tracing::warn!(error = %e, "could not read epic from tracker");
                self.ui.warn(format!("Tracker unavailable, continuing without epic: {e:#}"));
            }
        }

        if !self.state.epic_id.is_empty() && !self.opts.fast_path {
            match self.tracker.children(&self.cwd, &self.state.epic_id).await {
                Ok(children) if parse_fast_path(&children) => {
                    self.state.fast_path = true;
                    self.ui
                        .line("Micro-epic detected - using fast path (--quick for gates)");
                }
                Ok(_) => {}
                Err(e) => tracing::debug!(error = %e, "fast-path check skipped"),
            }
        }

        let path = find_latest_council_report(&self.cwd, "pre-mortem", &self.state.epic_id)?;
        let report = match read_gate_report(&path, MAX_FINDINGS) {
            Ok(report) => report,
            Err(e) => {
                tracing::warn!(error = %e, "pre-mortem report unreadable");
                return None;
            }
        };
        self.state
            .verdicts
            .insert("pre_mortem".to_string(), report.verdict.to_string());
        self.ui.line(format!("Pre-mortem verdict: {}", report.verdict));
        (report.verdict == Verdict::Fail).then(|| GateFailure {
            phase: 1,
            verdict: report.verdict.to_string(),
            findings: report.findings,
            report: report.path.display().to_string(),
        })
    }

    async fn post_implementation(&mut self) -> Result<Option<GateFailure>, OrchestratorError> {
        if self.state.start_phase <= 1 {
            self.prerequisite(2, 1)?;
        }
        if self.state.epic_id.is_empty() {
            return Ok(None);
        }
        let children = match self.tracker.children(&self.cwd, &self.state.epic_id).await {
            Ok(children) => children,
            Err(e) => {
                tracing::warn!(error = %e, "could not check epic completion");
                return Ok(None);
            }
        };
        let status = parse_crank_completion(&children);
        self.ui.line(format!("Crank status: {}", status.as_str()));
        if status == CrankStatus::Done {
            return Ok(None);
        }
        Ok(Some(GateFailure {
            phase: 2,
            verdict: status.as_str().to_string(),
            findings: Vec::new(),
            report: format!("{} children {}", self.opts.tracker_command, self.state.epic_id),
        }))
    }

    fn post_validation(&mut self) -> Result<Option<GateFailure>, OrchestratorError> {
        if self.state.start_phase <= 2 {
            self.prerequisite(3, 2)?;
        }
        let Some(path) = find_latest_council_report(&self.cwd, "vibe", &self.state.epic_id) else {
            return Err(anyhow!("vibe did not produce a council report in .agents/council/").into());
        };
        let report = read_gate_report(&path, MAX_FINDINGS)?;
        self.state
            .verdicts
            .insert("vibe".to_string(), report.verdict.to_string());
        self.ui.line(format!("Vibe verdict: {}", report.verdict));
        if report.verdict == Verdict::Fail {
            return Ok(Some(GateFailure {
                phase: 3,
                verdict: report.verdict.to_string(),
                findings: report.findings,
                report: report.path.display().to_string(),
            }));
        }

        if let Some(pm) =
            find_latest_council_report(&self.cwd, "post-mortem", &self.state.epic_id)
        {
            match read_gate_report(&pm, MAX_FINDINGS) {
                Ok(r) => {
                    self.state
                        .verdicts
                        .insert("post_mortem".to_string(), r.verdict.to_string());
                    self.ui.line(format!("Post-mortem verdict: {}", r.verdict));
                }
                Err(e) => tracing::warn!(error = %e, "post-mortem report unreadable"),
            }
        }
        Ok(None)
    }

    /// Retry a failed gate until it passes or attempts reach `max_retries`.
    ///
    /// Each attempt first runs a retry prompt carrying the verdict and
    /// findings, then re-runs the phase. A validation FAIL retries through
    /// implementation before validation is checked again.
    async fn resolve_gate(
        &mut self,
        phase_num: u32,
        mut gate: GateFailure,
    ) -> Result<(), OrchestratorError> {
        let name = phase_name(phase_num);
        let max = self.opts.max_retries;
        loop {
            let attempt = {
                let slot = self
                    .state
                    .attempts
                    .entry(RunState::attempt_key(phase_num))
                    .or_insert(0);
                *slot += 1;
                *slot
            };
            self.save();
            self.live_update(phase_num, &format!("retrying after {}", gate.verdict), "");

            if attempt >= max {
                self.ui.escalated(name, attempt, max, &gate.report);
                self.live_update(
                    phase_num,
                    "failed after retries",
                    &format!("gate {}", gate.verdict),
                );
                self.log(
                    name,
                    &format!(
                        "FAILED: gate {} after {attempt}/{max} attempts (report: {})",
                        gate.verdict, gate.report
                    ),
                );
                return Err(OrchestratorError::GateExhausted {
                    phase: phase_num,
                    name,
                });
            }

            self.ui.retrying(name, &gate.verdict, attempt, max);
            self.log(
                name,
                &format!(
                    "RETRY attempt {attempt}/{max} verdict={} report={}",
                    gate.verdict, gate.report
                ),
            );

            let retry = RetryContext {
                attempt,
                max_retries: max,
                verdict: gate.verdict.clone(),
                findings: gate.findings.clone(),
            };
            let prompt = prompts::build_retry_prompt(&self.cwd, phase_num, &self.state, &retry)?;
            // Validation findings are fixed by another implementation pass.
            let retry_phase = if phase_num == 3 { 2 } else { phase_num };
            self.live_update(phase_num, "running retry prompt", "");
            if let Err(e) = self.spawn(retry_phase, &prompt).await {
                self.live_update(phase_num, "retry failed", &e.to_string());
                self.log(name, &format!("retry failed: {e}"));
                return Err(OrchestratorError::PhaseFailed {
                    phase: phase_num,
                    name,
                    source: e,
                });
            }

            let prompt = prompts::build_phase_prompt(&self.cwd, phase_num, &self.state)?;
            self.ui
                .line(format!("Re-running phase {phase_num} after retry"));
            self.live_update(phase_num, "re-running phase", "");
            if let Err(e) = self.spawn(phase_num, &prompt).await {
                self.log(name, &format!("rerun failed: {e}"));
                return Err(OrchestratorError::PhaseFailed {
                    phase: phase_num,
                    name,
                    source: e,
                });
            }

            match self.post_phase(phase_num).await? {
                None => {
                    self.live_update(phase_num, "retry succeeded", "");
                    self.log(name, &format!("retry succeeded on attempt {attempt}"));
                    return Ok(());
                }
                Some(next) => gate = next,
            }
        }
    }

    fn fail(&mut self, err: &OrchestratorError) {
        let name = phase_name(self.state.phase);
        self.ui.phase_failed(self.state.phase, &err.to_string());
        self.log(name, &format!("FATAL: {err}"));
        self.log.failure_context(&self.state.run_id, name, err);
        self.state
            .set_terminal(TerminalStatus::Failed, format!("phase {name}: {err}"));
        self.save();
        self.ui.abandon();
    }

    fn final_report(&self) {
        self.ui.complete("=== RPI Phased Complete ===");
        self.ui.line(format!("Goal: {}", self.state.goal));
        if !self.state.epic_id.is_empty() {
            self.ui.line(format!("Epic: {}", self.state.epic_id));
        }
        let verdicts = self
            .state
            .verdicts
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(", ");
        if !verdicts.is_empty() {
            self.ui.line(format!("Verdicts: {verdicts}"));
        }
        self.log(
            "complete",
            &format!("epic={} verdicts={{{verdicts}}}", self.state.epic_id),
        );
    }
}

/// Runs the RPI phases for one goal.
pub struct Engine {
    repo_root: PathBuf,
    opts: RunOptions,
    executor: Option<Arc<dyn PhaseExecutor>>,
    progress_bars: bool,
    cycle: Option<u32>,
}

impl Engine {
    pub fn new(repo_root: impl Into<PathBuf>, opts: RunOptions) -> Self {
        Self {
            repo_root: repo_root.into(),
            opts,
            executor: None,
            progress_bars: false,
            cycle: None,
        }
    }

    /// Use a caller-supplied executor instead of selecting a backend. The
    /// runtime PATH check is skipped.
    pub fn with_executor(mut self, executor: Arc<dyn PhaseExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    /// Draw a phase bar when the stream backend owns the output.
    pub fn with_progress_bars(mut self, enabled: bool) -> Self {
        self.progress_bars = enabled;
        self
    }

    /// Record the supervisor cycle this run belongs to.
    pub fn with_cycle(mut self, cycle: u32) -> Self {
        self.cycle = Some(cycle.max(1));
        self
    }

    pub fn options(&self) -> &RunOptions {
        &self.opts
    }

    fn resolve_goal(&self, goal: &str, start_phase: u32) -> Result<String, OrchestratorError> {
        let mut goal = goal.trim().to_string();
        if goal.is_empty() && start_phase >= 2 {
            if let Ok(prior) = load_state(&self.repo_root)
                && !prior.epic_id.is_empty()
            {
                goal = prior.goal;
            }
        }
        if goal.is_empty() && start_phase <= 1 {
            return Err(OrchestratorError::GoalRequired);
        }
        Ok(goal)
    }

    /// Carry forward a prior run's state. Returns the prior worktree when the
    /// run should continue inside it.
    fn resume(&self, state: &mut RunState, ui: &RunUi) -> Result<Option<PathBuf>, OrchestratorError> {
        let prior = match load_state(&self.repo_root) {
            Ok(prior) => prior,
            Err(e) => {
                tracing::debug!(error = %e, "no prior state to resume");
                return Ok(None);
            }
        };
        if state.goal.is_empty() {
            state.goal = prior.goal.clone();
        }
        state.epic_id = prior.epic_id;
        state.parent_epic = prior.parent_epic;
        state.cycle = prior.cycle.max(1);
        state.fast_path |= prior.fast_path;
        state.swarm_first |= prior.swarm_first;
        state.verdicts = prior.verdicts;
        state.attempts = prior.attempts;
        state.complexity = prior.complexity;

        if prior.worktree_path.is_empty() || self.opts.no_worktree {
            return Ok(None);
        }
        let worktree = PathBuf::from(&prior.worktree_path);
        if !worktree.exists() {
            return Err(OrchestratorError::ResumeWorktreeMissing(worktree));
        }
        state.worktree_path = prior.worktree_path;
        state.run_id = prior.run_id;
        ui.line(format!("Resuming in existing worktree: {}", worktree.display()));
        Ok(Some(worktree))
    }

    pub async fn run(&self, goal: &str) -> Result<RunState, OrchestratorError> {
        if self.executor.is_none()
            && !self.opts.dry_run
            && find_on_path(&self.opts.runtime_command).is_none()
        {
            return Err(OrchestratorError::RuntimeUnavailable(
                self.opts.runtime_command.clone(),
            ));
        }

        let start_phase = phase_name_to_num(&self.opts.from)?;
        let goal = self.resolve_goal(goal, start_phase)?;
        let selection = select_backend(self.opts.runtime_mode, self.opts.live_status);
        let ui = RunUi::new(
            PHASES.len() as u64,
            self.progress_bars && self.executor.is_none() && selection.kind == BackendKind::Stream,
        );

        let mut state = RunState::new(&goal, start_phase, self.opts.snapshot());
        let mut cwd = self.repo_root.clone();
        if start_phase > 1
            && let Some(worktree) = self.resume(&mut state, &ui)?
        {
            cwd = worktree;
        }
        if let Some(cycle) = self.cycle {
            state.cycle = cycle;
        }
        if state.complexity.is_none() {
            let level = classify_complexity(&state.goal);
            ui.line(format!("Complexity: {level}"));
            state.complexity = Some(level);
        }

        let isolate = !self.opts.no_worktree && !self.opts.dry_run;
        let manager = if isolate {
            let manager = WorktreeManager::new(&self.repo_root)?;
            if state.worktree_path.is_empty() {
                let created = manager.create().await?;
                ui.line(format!("Worktree created: {} (detached)", created.path.display()));
                state.worktree_path = created.path.display().to_string();
                state.run_id = created.run_id;
                cwd = created.path;
            }
            Some(manager)
        } else {
            None
        };

        if state.run_id.is_empty() {
            state.run_id = generate_run_id();
        }
        state.orchestrator_pid = std::process::id();
        state.backend = selection.kind.as_str().to_string();

        let live = self
            .opts
            .live_status
            .then(|| Arc::new(LiveStatus::new(rpi_dir(&cwd).join(LIVE_STATUS_FILE))));
        let executor = match &self.executor {
            Some(executor) => executor.clone(),
            None => build_executor(
                selection.kind,
                ExecutorOptions {
                    command: self.opts.runtime_command.clone(),
                    phase_timeout: self.opts.phase_timeout,
                    stall_timeout: self.opts.stall_timeout,
                    startup_timeout: self.opts.stream_startup_timeout,
                    check_interval: self.opts.stall_check_interval,
                    live: live.clone(),
                },
            ),
        };

        let mut ctx = RunContext {
            repo_root: self.repo_root.clone(),
            log: OrchestrationLog::new(&cwd).with_ledger_root(&self.repo_root),
            cwd,
            opts: self.opts.clone(),
            state,
            executor,
            live,
            tracker: Tracker::new(self.opts.tracker_command.clone()),
            ui,
        };

        ctx.init_artifacts()?;
        ctx.log(
            "start",
            &format!("goal=\"{}\" from={}", ctx.state.goal, self.opts.from),
        );
        ctx.ui.line(format!(
            "Executor backend: {} ({})",
            selection.kind.as_str(),
            selection.reason
        ));
        ctx.log(
            "backend-selection",
            &format!(
                "backend={} reason=\"{}\"",
                selection.kind.as_str(),
                selection.reason
            ),
        );
        ctx.save();
        ctx.heartbeat();

        let interrupt = manager.as_ref().map(|_| {
            let paths = ctx
                .state_roots()
                .into_iter()
                .flat_map(|root| state_copies(root, &ctx.state.run_id))
                .collect();
            spawn_interrupt_handler(paths, ctx.cwd.clone())
        });

        let outcome = ctx.run_phases().await;
        if let Some(handle) = interrupt {
            handle.abort();
        }

        if let Err(e) = outcome {
            ctx.fail(&e);
            if let Some(worktree) = ctx.state.worktree() {
                ctx.ui.line(format!(
                    "Worktree preserved for debugging: {}",
                    worktree.display()
                ));
            }
            return Err(e);
        }

        let reason = if self.opts.dry_run {
            "dry run"
        } else {
            "all phases completed"
        };
        ctx.state.set_terminal(TerminalStatus::Completed, reason);
        ctx.save();
        ctx.final_report();

        if let Some(manager) = manager
            && let Some(worktree) = ctx.state.worktree()
        {
            if let Err(e) = manager.merge(&worktree, &ctx.state.run_id).await {
                ctx.ui.line(format!(
                    "Merge failed: {e}. Worktree preserved at {}",
                    worktree.display()
                ));
                ctx.log("merge", &format!("FAILED: {e}"));
                return Err(e.into());
            }
            ctx.log("merge", "completed");
            match manager.remove(&worktree, &ctx.state.run_id).await {
                Ok(()) => ctx
                    .ui
                    .line(format!("Worktree removed: {}", worktree.display())),
                Err(e) => ctx.ui.warn(format!(
                    "Could not remove worktree {}: {e}",
                    worktree.display()
                )),
            }
        }
        Ok(ctx.state)
    }
}

fn state_copies(root: &Path, run_id: &str) -> Vec<PathBuf> {
    let mut paths = vec![flat_state_path(root)];
    if let Some(dir) = run_registry_dir(root, run_id) {
        paths.push(dir.join(STATE_FILE));
    }
    paths
}

async fn ctrl_c() {
    if tokio::signal::ctrl_c().await.is_err() {
        std::future::pending::<()>().await;
    }
}

async fn shutdown_signal() -> &'static str {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        if let Ok(mut term) = signal(SignalKind::terminate()) {
            return tokio::select! {
                _ = ctrl_c() => "interrupt",
                _ = term.recv() => "terminated",
            };
        }
    }
    ctrl_c().await;
    "interrupt"
}

/// Mark the run interrupted on SIGINT/SIGTERM and exit, leaving the worktree
/// in place.
fn spawn_interrupt_handler(state_paths: Vec<PathBuf>, worktree: PathBuf) -> JoinHandle<()> {
    tokio::spawn(async move {
        let name = shutdown_signal().await;
        let reason = format!("signal: {name}");
        for path in state_paths.iter().filter(|p| p.exists()) {
            if let Err(e) = mark_terminal(path, TerminalStatus::Interrupted, &reason) {
                tracing::warn!(path = %path.display(), error = %e, "could not record interruption");
            }
        }
        eprintln!(
            "\nInterrupted ({reason}). Worktree preserved at {}",
            worktree.display()
        );
        std::process::exit(1);
    })
}
