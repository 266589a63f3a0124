//! Typed error hierarchy for the RPI orchestrator.
//!
//! One enum per subsystem:
//! - `WorktreeError` — sibling worktree create/merge/remove failures
//! - `ExecutorError` — backend execution failures (timeouts, stalls, exits)
//! - `LedgerError` — append and integrity failures
//! - `ConfigError` — invalid modes, policies and durations
//! - `OrchestratorError` — phase state machine failures
//! - `SupervisorError` — lease, kill switch, gate and landing failures
//!
//! [`exit_code`] maps any of them, wrapped in `anyhow`, to the process exit
//! status.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::util::format_duration;

/// Errors from the worktree manager.
#[derive(Debug, Error)]
pub enum WorktreeError {
    #[error("not a git repository: {}", .0.display())]
    NotGitRepo(PathBuf),

    #[error("could not resolve HEAD in {}", .0.display())]
    ResolveHead(PathBuf),

    #[error("{} is in detached HEAD state: check out a branch before merging", .0.display())]
    DetachedHead(PathBuf),

    #[error("worktree path collision after {attempts} attempts (last tried {})", .path.display())]
    Collision { attempts: u32, path: PathBuf },

    #[error(
        "original repo has uncommitted changes after {retries} retries: commit or stash before merge"
    )]
    RepoUnclean { retries: u32 },

    #[error("merge source unavailable: {0}")]
    MergeSourceUnavailable(String),

    #[error("merge source resolved to an empty commit id")]
    EmptyMergeSource,

    #[error("merge conflict in {short_sha}.\nConflicting files:\n{}", .files.join("\n"))]
    MergeConflict { short_sha: String, files: Vec<String> },

    #[error("refusing to remove {}: {reason} (path validation failed)", .path.display())]
    PathValidation { path: PathBuf, reason: String },

    #[error("git {command} failed: {stderr}")]
    GitCommand { command: String, stderr: String },

    #[error("git {command} timed out after {}", format_duration(*.after))]
    GitTimeout { command: String, after: Duration },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Git(#[from] git2::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// What a watchdog saw when it cancelled a stream session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchdogCause {
    /// No event arrived within the startup window.
    StartupTimeout(Duration),
    /// Events stopped arriving for longer than the stall window.
    Stall(Duration),
}

impl std::fmt::Display for WatchdogCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WatchdogCause::StartupTimeout(after) => write!(
                f,
                "stream startup timeout: no events received after {}",
                format_duration(*after)
            ),
            WatchdogCause::Stall(after) => write!(
                f,
                "stall detected: no stream activity for {}",
                format_duration(*after)
            ),
        }
    }
}

/// Errors from a backend executor.
#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("{command} execution failed: {source}")]
    SpawnFailed {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{command} exited with code {code}")]
    NonZeroExit { command: String, code: i32 },

    #[error("phase {phase} timed out after {} (set --phase-timeout to increase)", format_duration(*.after))]
    Timeout { phase: u32, after: Duration },

    #[error("phase {phase} (timeout) timed out after {} (set --phase-timeout to increase)", format_duration(*.after))]
    StreamTimeout { phase: u32, after: Duration },

    #[error("phase {phase} (stall): {cause}")]
    Stalled { phase: u32, cause: WatchdogCause },

    #[error("{command} exited with code {code} (exit_error)")]
    StreamExit { command: String, code: i32 },

    #[error("{command} execution failed (unknown): {source}")]
    StreamWait {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("stream parse error: {0}")]
    Parse(String),

    #[error("stream startup timeout: stream completed without parseable events")]
    NoEvents,

    #[error("stream execution failed: {stream}; direct fallback failed: {direct}")]
    FallbackFailed {
        stream: Box<ExecutorError>,
        direct: Box<ExecutorError>,
    },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ExecutorError {
    /// Whether a stream failure is a protocol problem that direct execution can absorb.
    pub fn is_recoverable_stream_failure(&self) -> bool {
        matches!(
            self,
            ExecutorError::Stalled { .. } | ExecutorError::Parse(_) | ExecutorError::NoEvents
        )
    }
}

/// Errors from the hash-chained ledger.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("ledger event missing required field '{0}'")]
    MissingField(&'static str),

    #[error("invalid run id '{0}': must not contain path separators or '..'")]
    InvalidRunId(String),

    #[error("ledger line {line} is not valid JSON: {message}")]
    Malformed { line: usize, message: String },

    #[error("ledger integrity check failed at record {index}: {message}")]
    Integrity { index: usize, message: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Errors from configuration and flag parsing.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid runtime \"{0}\" (valid: auto|direct|stream)")]
    InvalidRuntime(String),

    #[error("unknown phase: \"{0}\" (valid: discovery, implementation, validation)")]
    UnknownPhase(String),

    #[error("invalid duration '{0}': expected forms like 90m, 45s, 1h30m or 250ms")]
    InvalidDuration(String),

    #[error("Invalid {kind} '{value}'. Valid values: {valid}")]
    InvalidPolicy {
        kind: &'static str,
        value: String,
        valid: &'static str,
    },

    #[error("unsupported signal \"{0}\" (valid: TERM|KILL|INT)")]
    InvalidSignal(String),

    #[error("{0}")]
    Invalid(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Errors from the phase orchestrator.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("goal is required (provide as argument)")]
    GoalRequired,

    #[error("runtime command \"{0}\" not found on PATH (required for spawning phase sessions)")]
    RuntimeUnavailable(String),

    #[error("worktree {} from previous run no longer exists (was it removed?)", .0.display())]
    ResumeWorktreeMissing(PathBuf),

    #[error("phase {phase} ({name}) failed: {source}")]
    PhaseFailed {
        phase: u32,
        name: &'static str,
        #[source]
        source: ExecutorError,
    },

    #[error("phase {phase} ({name}): gate failed after max retries")]
    GateExhausted { phase: u32, name: &'static str },

    #[error("gate FAIL at phase {phase}: {verdict} (report: {report})")]
    GateFailed {
        phase: u32,
        verdict: String,
        report: String,
    },

    #[error("phase {phase} prerequisite not met: {message}")]
    Prerequisite { phase: u32, message: String },

    #[error(transparent)]
    Worktree(#[from] WorktreeError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl OrchestratorError {
    /// True when the run stopped because a gate verdict could not be satisfied.
    pub fn is_gate_failure(&self) -> bool {
        matches!(
            self,
            OrchestratorError::GateExhausted { .. } | OrchestratorError::GateFailed { .. }
        )
    }
}

/// Errors from the supervisor loop.
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("single-flight lease already held: {holder}")]
    LeaseHeld { holder: String },

    #[error("kill switch path is a directory: {}", .0.display())]
    KillSwitchIsDirectory(PathBuf),

    #[error("gate failures: {0}")]
    Gate(String),

    #[error("landing: {0}")]
    Landing(String),

    #[error("cycle {cycle} failed: {source}")]
    Cycle {
        cycle: u32,
        #[source]
        source: OrchestratorError,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// The operator declined a confirmation prompt.
#[derive(Debug, Error)]
#[error("aborted by user")]
pub struct UserAbort;

pub const EXIT_FAILURE: u8 = 1;
pub const EXIT_GATE_FAILURE: u8 = 10;
pub const EXIT_USER_ABORT: u8 = 20;
pub const EXIT_USAGE: u8 = 30;

fn orchestrator_exit_code(err: &OrchestratorError) -> Option<u8> {
    match err {
        e if e.is_gate_failure() => Some(EXIT_GATE_FAILURE),
        OrchestratorError::GoalRequired | OrchestratorError::Config(_) => Some(EXIT_USAGE),
        _ => None,
    }
}

/// Exit status for a failed command: gate failure 10, user abort 20,
/// usage or configuration error 30, anything else 1.
pub fn exit_code(err: &anyhow::Error) -> u8 {
    for cause in err.chain() {
        if cause.is::<UserAbort>() {
            return EXIT_USER_ABORT;
        }
        if cause.is::<ConfigError>() {
            return EXIT_USAGE;
        }
        if let Some(e) = cause.downcast_ref::<OrchestratorError>()
            && let Some(code) = orchestrator_exit_code(e)
        {
            return code;
        }
        if let Some(e) = cause.downcast_ref::<SupervisorError>() {
            match e {
                SupervisorError::Gate(_) => return EXIT_GATE_FAILURE,
                SupervisorError::Cycle { source, .. } => {
                    if let Some(code) = orchestrator_exit_code(source) {
                        return code;
                    }
                }
                _ => {}
            }
        }
    }
    EXIT_FAILURE
}
