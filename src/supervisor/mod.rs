//! Supervisor loop: repeated orchestrator cycles under a single-flight lease.
//!
//! Each cycle checks the kill switch, runs the phase engine (retrying the
//! whole cycle up to `cycle_retries` extra times), runs the gate script,
//! lands the cycle's changes, and optionally sweeps stale runs. What happens
//! after a failed cycle is decided by the failure policy.

pub mod landing;
pub mod lease;
pub mod policy;

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use console::style;
use tokio::process::Command;

use crate::config::{Config, SupervisorSettings};
use crate::errors::SupervisorError;
use crate::executor::PhaseExecutor;
use crate::orchestrator::{Engine, RunOptions};
use crate::registry::RegistryOptions;
use crate::registry::cleanup::{self, CleanupOptions};
use crate::util::{format_duration, generate_run_id};

use landing::{LandingScope, commit_owned, render_commit_message};
use lease::{SupervisorLease, default_lease_path};
use policy::{FailurePolicy, GatePolicy, LandingPolicy};

const GATE_TIMEOUT: Duration = Duration::from_secs(30 * 60);

#[derive(Debug, Clone)]
pub struct SupervisorOptions {
    pub max_cycles: u32,
    /// Extra attempts per cycle after the first.
    pub cycle_retries: u32,
    pub cycle_delay: Duration,
    pub failure_policy: FailurePolicy,
    pub gate_policy: GatePolicy,
    pub gate_script: Option<PathBuf>,
    pub gate_timeout: Duration,
    pub landing_policy: LandingPolicy,
    pub commit_template: String,
    pub kill_switch: PathBuf,
    /// `None` uses `.agents/rpi/supervisor.lock` under the repository root.
    pub lease_path: Option<PathBuf>,
    pub lease_ttl: Duration,
    pub cleanup_after_cycle: bool,
    pub registry: RegistryOptions,
}

impl SupervisorOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            registry: RegistryOptions::from_config(config),
            ..Self::from_settings(&config.supervisor)
        }
    }

    fn from_settings(s: &SupervisorSettings) -> Self {
        Self {
            max_cycles: 1,
            cycle_retries: 0,
            cycle_delay: Duration::ZERO,
            failure_policy: s.failure_policy,
            gate_policy: s.gate_policy,
            gate_script: s.gate_script.as_ref().map(PathBuf::from),
            gate_timeout: GATE_TIMEOUT,
            landing_policy: s.landing_policy,
            commit_template: s.commit_template.clone(),
            kill_switch: s.kill_switch.clone(),
            lease_path: None,
            lease_ttl: s.lease_ttl,
            cleanup_after_cycle: s.cleanup_after_cycle,
            registry: RegistryOptions::default(),
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.cycle_retries + 1
    }
}

impl Default for SupervisorOptions {
    fn default() -> Self {
        Self::from_settings(&SupervisorSettings::default())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoopSummary {
    pub cycles_run: u32,
    pub succeeded: u32,
    pub failed: u32,
    pub commits: u32,
    pub stopped_by_kill_switch: bool,
}

fn resolve(root: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        root.join(path)
    }
}

/// `Ok(true)` when the kill switch file exists. A directory at that path is
/// an error so a typo cannot silently disable it.
pub fn kill_switch_set(path: &Path) -> Result<bool, SupervisorError> {
    match std::fs::metadata(path) {
        Ok(meta) if meta.is_dir() => Err(SupervisorError::KillSwitchIsDirectory(path.to_path_buf())),
        Ok(_) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

pub struct Supervisor {
    repo_root: PathBuf,
    opts: SupervisorOptions,
    run_opts: RunOptions,
    executor: Option<Arc<dyn PhaseExecutor>>,
    progress_bars: bool,
}

impl Supervisor {
    pub fn new(repo_root: impl Into<PathBuf>, opts: SupervisorOptions, run_opts: RunOptions) -> Self {
        Self {
            repo_root: repo_root.into(),
            opts,
            run_opts,
            executor: None,
            progress_bars: false,
        }
    }

    /// Hand every cycle's engine this executor.
    pub fn with_executor(mut self, executor: Arc<dyn PhaseExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    pub fn with_progress_bars(mut self, enabled: bool) -> Self {
        self.progress_bars = enabled;
        self
    }

    fn engine(&self, cycle: u32) -> Engine {
        let engine = Engine::new(&self.repo_root, self.run_opts.clone())
            .with_cycle(cycle)
            .with_progress_bars(self.progress_bars);
        match &self.executor {
            Some(executor) => engine.with_executor(executor.clone()),
            None => engine,
        }
    }

    pub async fn run(&self, goal: &str) -> Result<LoopSummary, SupervisorError> {
        let lease = if self.run_opts.dry_run {
            None
        } else {
            let path = self
                .opts
                .lease_path
                .as_deref()
                .map(|p| resolve(&self.repo_root, p))
                .unwrap_or_else(|| default_lease_path(&self.repo_root));
            let lease = SupervisorLease::acquire(&path, self.opts.lease_ttl, &generate_run_id())?;
            println!(
                "Supervisor lease acquired: {} (run={})",
                lease.path().display(),
                lease.run_id()
            );
            Some(lease)
        };

        let result = self.run_cycles(goal).await;

        if let Some(lease) = lease
            && let Err(e) = lease.release().await
        {
            tracing::warn!(error = %e, "could not release supervisor lease");
        }
        let summary = result?;
        println!("\nRPI loop finished after {} cycle(s).", summary.cycles_run);
        Ok(summary)
    }

    async fn run_cycles(&self, goal: &str) -> Result<LoopSummary, SupervisorError> {
        let kill_switch = resolve(&self.repo_root, &self.opts.kill_switch);
        let mut summary = LoopSummary::default();

        for cycle in 1..=self.opts.max_cycles.max(1) {
            if cycle > 1 && !self.opts.cycle_delay.is_zero() {
                println!(
                    "\nSleeping {} before next cycle...",
                    format_duration(self.opts.cycle_delay)
                );
                tokio::time::sleep(self.opts.cycle_delay).await;
            }

            println!("\n{}", style(format!("=== RPI Loop: Cycle {cycle} ===")).bold().cyan());
            if kill_switch_set(&kill_switch)? {
                println!("Kill switch present at {}. Stopping.", kill_switch.display());
                summary.stopped_by_kill_switch = true;
                break;
            }

            summary.cycles_run += 1;
            let started = Instant::now();
            match self.run_cycle_with_attempts(goal, cycle).await {
                Ok(committed) => {
                    summary.succeeded += 1;
                    summary.commits += u32::from(committed);
                    println!(
                        "Cycle {cycle} completed in {}",
                        format_duration(started.elapsed())
                    );
                }
                Err(e) => {
                    summary.failed += 1;
                    println!(
                        "Cycle {cycle} failed after {}: {e}",
                        format_duration(started.elapsed())
                    );
                    if self.opts.failure_policy == FailurePolicy::Continue {
                        println!("Failure policy \"continue\": moving on to the next cycle.");
                        continue;
                    }
                    println!("Stopping loop due to failure policy.");
                    return Err(e);
                }
            }
        }
        Ok(summary)
    }

    async fn run_cycle_with_attempts(&self, goal: &str, cycle: u32) -> Result<bool, SupervisorError> {
        let max = self.opts.max_attempts();
        let mut attempt = 1;
        loop {
            let result = self.run_cycle(goal, cycle, attempt).await;
            if self.opts.cleanup_after_cycle {
                self.sweep().await;
            }
            match result {
                Ok(committed) => return Ok(committed),
                Err(e) if attempt < max => {
                    println!("Cycle {cycle} attempt {attempt}/{max} failed: {e}");
                    tracing::warn!(cycle, attempt, error = %e, "cycle attempt failed");
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn run_cycle(&self, goal: &str, cycle: u32, attempt: u32) -> Result<bool, SupervisorError> {
        let scope = match self.opts.landing_policy {
            LandingPolicy::Commit => Some(LandingScope::capture(&self.repo_root).await?),
            LandingPolicy::Off => None,
        };

        self.engine(cycle)
            .run(goal)
            .await
            .map_err(|source| SupervisorError::Cycle { cycle, source })?;
        self.run_gate().await?;

        match scope {
            Some(scope) if !self.run_opts.dry_run => {
                let message =
                    render_commit_message(&self.opts.commit_template, cycle, attempt, goal);
                commit_owned(&self.repo_root, &message, &scope).await
            }
            _ => Ok(false),
        }
    }

    async fn run_gate(&self) -> Result<(), SupervisorError> {
        if self.opts.gate_policy == GatePolicy::Off {
            return Ok(());
        }
        let Some(script) = &self.opts.gate_script else {
            return Ok(());
        };
        let required = self.opts.gate_policy == GatePolicy::Required;
        match self.run_gate_script(&resolve(&self.repo_root, script), required).await {
            Ok(()) => Ok(()),
            Err(e) if !required => {
                println!("{} gate failed: {e}", style("Warning:").yellow());
                Ok(())
            }
            Err(e) => Err(SupervisorError::Gate(e)),
        }
    }

    async fn run_gate_script(&self, path: &Path, required: bool) -> Result<(), String> {
        if !path.is_file() {
            if required {
                return Err(format!("required gate script missing: {}", path.display()));
            }
            println!("Skipping optional gate (missing): {}", path.display());
            return Ok(());
        }

        println!("Running gate: {}", path.display());
        let child = Command::new("bash")
            .arg(path)
            .current_dir(&self.repo_root)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .status();
        match tokio::time::timeout(self.opts.gate_timeout, child).await {
            Err(_) => Err(format!(
                "gate script {} timed out after {}",
                path.display(),
                format_duration(self.opts.gate_timeout)
            )),
            Ok(Err(e)) => Err(format!("gate script {} failed: {e}", path.display())),
            Ok(Ok(status)) if !status.success() => {
                Err(format!("gate script {} failed: {status}", path.display()))
            }
            Ok(Ok(_)) => Ok(()),
        }
    }

    async fn sweep(&self) {
        let opts = CleanupOptions {
            all: true,
            prune_worktrees: true,
            registry: self.opts.registry.clone(),
            ..Default::default()
        };
        if let Err(e) = cleanup::execute(&self.repo_root, &opts).await {
            tracing::warn!(error = %e, "post-cycle cleanup failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ExecutorError;
    use crate::orchestrator::gate::council_dir;
    use async_trait::async_trait;
    use git2::{Repository, Signature};
    use std::sync::Mutex;
    use tempfile::{TempDir, tempdir};

    /// Passes every gate; implementation writes `feature-<n>.txt`.
    struct PassingExecutor {
        calls: Mutex<u32>,
    }

    #[async_trait]
    impl PhaseExecutor for PassingExecutor {
        fn name(&self) -> &'static str {
            "passing"
        }

        async fn execute(&self, _prompt: &str, cwd: &Path, _run_id: &str, phase_num: u32) -> Result<(), ExecutorError> {
            let n = {
                let mut calls = self.calls.lock().unwrap();
                *calls += 1;
                *calls
            };
            match phase_num {
                2 => std::fs::write(cwd.join(format!("feature-{n}.txt")), "done\n").unwrap(),
                3 => {
                    let dir = council_dir(cwd);
                    std::fs::create_dir_all(&dir).unwrap();
                    std::fs::write(
                        dir.join(format!("2026-01-01-vibe-{n:03}.json")),
                        r#"{"verdict":"PASS","findings":[]}"#,
                    )
                    .unwrap();
                }
                _ => {}
            }
            Ok(())
        }
    }

    fn executor() -> Arc<PassingExecutor> {
        Arc::new(PassingExecutor {
            calls: Mutex::new(0),
        })
    }

    fn setup_repo() -> TempDir {
        let dir = tempdir().unwrap();
        let repo = Repository::init(dir.path()).unwrap();
        let mut config = repo.config().unwrap();
        config.set_str("user.name", "Test").unwrap();
        config.set_str("user.email", "test@example.com").unwrap();
        std::fs::write(dir.path().join(".gitignore"), ".agents/\n").unwrap();
        let mut index = repo.index().unwrap();
        index.add_path(Path::new(".gitignore")).unwrap();
        index.write().unwrap();
        let tree = repo.find_tree(index.write_tree().unwrap()).unwrap();
        let sig = Signature::now("Test", "test@example.com").unwrap();
        repo.commit(Some("HEAD"), &sig, &sig, "init", &tree, &[])
            .unwrap();
        dir
    }

    fn run_opts() -> RunOptions {
        RunOptions {
            no_worktree: true,
            tracker_command: "/nonexistent/forge-rpi-tracker".to_string(),
            ..RunOptions::default()
        }
    }

    fn sup_opts() -> SupervisorOptions {
        SupervisorOptions {
            registry: crate::registry::tests::quiet_opts(),
            ..SupervisorOptions::default()
        }
    }

    #[tokio::test]
    async fn test_cycles_land_commits() {
        let dir = setup_repo();
        let opts = SupervisorOptions {
            max_cycles: 2,
            landing_policy: LandingPolicy::Commit,
            commit_template: "cycle {cycle}: {goal}".to_string(),
            ..sup_opts()
        };
        let summary = Supervisor::new(dir.path(), opts, run_opts())
            .with_executor(executor())
            .run("add auth")
            .await
            .unwrap();

        assert_eq!(summary.cycles_run, 2);
        assert_eq!(summary.succeeded, 2);
        assert_eq!(summary.commits, 2);

        let repo = Repository::open(dir.path()).unwrap();
        let head = repo.head().unwrap().peel_to_commit().unwrap();
        assert!(head.message().unwrap().starts_with("cycle 2: add auth"));

        // Lease released and expired.
        let meta = lease::read_lease(&default_lease_path(dir.path())).unwrap();
        assert!(lease::lease_expired(&meta, chrono::Utc::now() + chrono::Duration::seconds(1)));
    }

    #[tokio::test]
    async fn test_kill_switch_stops_before_first_cycle() {
        let dir = setup_repo();
        let kill = dir.path().join(".agents/rpi/KILL");
        std::fs::create_dir_all(kill.parent().unwrap()).unwrap();
        std::fs::write(&kill, "").unwrap();

        let exec = executor();
        let summary = Supervisor::new(dir.path(), sup_opts(), run_opts())
            .with_executor(exec.clone())
            .run("add auth")
            .await
            .unwrap();
        assert!(summary.stopped_by_kill_switch);
        assert_eq!(summary.cycles_run, 0);
        assert_eq!(*exec.calls.lock().unwrap(), 0);
    }

    #[test]
    fn test_kill_switch_directory_is_an_error() {
        let dir = tempdir().unwrap();
        assert!(!kill_switch_set(&dir.path().join("KILL")).unwrap());
        let err = kill_switch_set(dir.path()).unwrap_err();
        assert!(err.to_string().starts_with("kill switch path is a directory"));
    }

    #[tokio::test]
    async fn test_required_gate_missing_fails_cycle() {
        let dir = setup_repo();
        let opts = SupervisorOptions {
            gate_policy: GatePolicy::Required,
            gate_script: Some(PathBuf::from("scripts/gate.sh")),
            cycle_retries: 1,
            ..sup_opts()
        };
        let exec = executor();
        let err = Supervisor::new(dir.path(), opts, run_opts())
            .with_executor(exec.clone())
            .run("add auth")
            .await
            .unwrap_err();
        assert!(matches!(err, SupervisorError::Gate(_)));
        assert!(err.to_string().contains("required gate script missing"));
        // Two attempts, three phases each.
        assert_eq!(*exec.calls.lock().unwrap(), 6);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_best_effort_gate_failure_only_warns() {
        let dir = setup_repo();
        std::fs::write(dir.path().join("gate.sh"), "exit 3\n").unwrap();
        let opts = SupervisorOptions {
            gate_policy: GatePolicy::BestEffort,
            gate_script: Some(PathBuf::from("gate.sh")),
            ..sup_opts()
        };
        let summary = Supervisor::new(dir.path(), opts, run_opts())
            .with_executor(executor())
            .run("add auth")
            .await
            .unwrap();
        assert_eq!(summary.succeeded, 1);
    }

    #[tokio::test]
    async fn test_continue_policy_runs_remaining_cycles() {
        let dir = setup_repo();
        let opts = SupervisorOptions {
            max_cycles: 2,
            failure_policy: FailurePolicy::Continue,
            gate_policy: GatePolicy::Required,
            gate_script: Some(PathBuf::from("missing.sh")),
            ..sup_opts()
        };
        let summary = Supervisor::new(dir.path(), opts, run_opts())
            .with_executor(executor())
            .run("add auth")
            .await
            .unwrap();
        assert_eq!(summary.cycles_run, 2);
        assert_eq!(summary.failed, 2);
    }

    #[tokio::test]
    async fn test_lease_held_blocks_second_supervisor() {
        let dir = setup_repo();
        let held = SupervisorLease::acquire(
            &default_lease_path(dir.path()),
            Duration::from_secs(60),
            "other0000001",
        )
        .unwrap();
        let err = Supervisor::new(dir.path(), sup_opts(), run_opts())
            .with_executor(executor())
            .run("add auth")
            .await
            .unwrap_err();
        assert!(matches!(err, SupervisorError::LeaseHeld { .. }));
        held.release().await.unwrap();
    }
}
