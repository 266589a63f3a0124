//! Backend executors for a single phase session.
//!
//! Two implementations sit behind [`PhaseExecutor`]: [`DirectExecutor`]
//! (one blocking call) and [`StreamExecutor`] (structured events, live
//! status, watchdogs). Which one runs is decided by [`select_backend`], a
//! pure function of the runtime mode and the live-status flag.

pub mod direct;
pub mod events;
pub mod live_status;
pub mod stream;

use std::ffi::OsString;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use console::style;
use serde::{Deserialize, Serialize};

use crate::errors::{ConfigError, ExecutorError};

pub use direct::DirectExecutor;
pub use live_status::{LiveStatus, PhaseProgress};
pub use stream::StreamExecutor;

/// Requested runtime mode from flags, environment or config.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeMode {
    #[default]
    Auto,
    Direct,
    Stream,
}

impl FromStr for RuntimeMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "" | "auto" => Ok(RuntimeMode::Auto),
            "direct" => Ok(RuntimeMode::Direct),
            "stream" => Ok(RuntimeMode::Stream),
            _ => Err(ConfigError::InvalidRuntime(s.to_string())),
        }
    }
}

impl fmt::Display for RuntimeMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RuntimeMode::Auto => "auto",
            RuntimeMode::Direct => "direct",
            RuntimeMode::Stream => "stream",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Direct,
    Stream,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Direct => "direct",
            BackendKind::Stream => "stream",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendSelection {
    pub kind: BackendKind,
    pub reason: &'static str,
}

/// Explicit modes win; `auto` streams only when live status is on.
pub fn select_backend(mode: RuntimeMode, live_status: bool) -> BackendSelection {
    let (kind, reason) = match mode {
        RuntimeMode::Stream => (BackendKind::Stream, "runtime=stream"),
        RuntimeMode::Direct => (BackendKind::Direct, "runtime=direct"),
        RuntimeMode::Auto if live_status => (BackendKind::Stream, "runtime=auto live-status enabled"),
        RuntimeMode::Auto => (BackendKind::Direct, "runtime=auto live-status disabled"),
    };
    tracing::info!(backend = kind.as_str(), reason, "backend selected");
    BackendSelection { kind, reason }
}

/// One phase session against the agent runtime.
#[async_trait]
pub trait PhaseExecutor: Send + Sync {
    /// Backend name recorded in run state and the ledger.
    fn name(&self) -> &'static str;

    async fn execute(
        &self,
        prompt: &str,
        cwd: &Path,
        run_id: &str,
        phase_num: u32,
    ) -> Result<(), ExecutorError>;
}

/// Process environment minus the variables that make the runtime think it
/// is nested inside another agent session.
pub fn clean_env() -> Vec<(OsString, OsString)> {
    std::env::vars_os()
        .filter(|(key, _)| {
            let key = key.to_string_lossy();
            key != "CLAUDECODE" && !key.starts_with("CLAUDE_CODE_")
        })
        .collect()
}

pub fn should_fallback_to_direct(err: &ExecutorError) -> bool {
    err.is_recoverable_stream_failure()
}

/// Stream first; protocol-level failures are retried once through direct.
#[derive(Debug, Clone)]
pub struct FallbackExecutor {
    pub stream: StreamExecutor,
    pub direct: DirectExecutor,
}

#[async_trait]
impl PhaseExecutor for FallbackExecutor {
    fn name(&self) -> &'static str {
        self.stream.name()
    }

    async fn execute(
        &self,
        prompt: &str,
        cwd: &Path,
        run_id: &str,
        phase_num: u32,
    ) -> Result<(), ExecutorError> {
        let stream_err = match self.stream.execute(prompt, cwd, run_id, phase_num).await {
            Ok(()) => return Ok(()),
            Err(e) if should_fallback_to_direct(&e) => e,
            Err(e) => return Err(e),
        };

        println!(
            "{} Stream backend degraded for phase {}; falling back to direct execution ({})",
            style("!").yellow().bold(),
            phase_num,
            stream_err
        );
        tracing::warn!(phase = phase_num, error = %stream_err, "falling back to direct backend");

        self.direct
            .execute(prompt, cwd, run_id, phase_num)
            .await
            .map_err(|direct_err| ExecutorError::FallbackFailed {
                stream: Box::new(stream_err),
                direct: Box::new(direct_err),
            })
    }
}

/// Settings needed to build either backend.
#[derive(Debug, Clone)]
pub struct ExecutorOptions {
    pub command: String,
    pub phase_timeout: Duration,
    pub stall_timeout: Duration,
    pub startup_timeout: Duration,
    pub check_interval: Duration,
    pub live: Option<Arc<LiveStatus>>,
}

pub fn build_executor(kind: BackendKind, opts: ExecutorOptions) -> Arc<dyn PhaseExecutor> {
    let direct = DirectExecutor::new(opts.command.clone(), opts.phase_timeout);
    match kind {
        BackendKind::Direct => Arc::new(direct),
        BackendKind::Stream => Arc::new(FallbackExecutor {
            stream: StreamExecutor {
                command: opts.command,
                live: opts.live,
                phase_timeout: opts.phase_timeout,
                stall_timeout: opts.stall_timeout,
                startup_timeout: opts.startup_timeout,
                check_interval: opts.check_interval,
            },
            direct,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_runtime_mode_normalization() {
        assert_eq!("".parse::<RuntimeMode>().unwrap(), RuntimeMode::Auto);
        assert_eq!("  STREAM ".parse::<RuntimeMode>().unwrap(), RuntimeMode::Stream);
        assert_eq!("Direct".parse::<RuntimeMode>().unwrap(), RuntimeMode::Direct);
        let err = "tmux".parse::<RuntimeMode>().unwrap_err();
        assert!(err.to_string().contains("valid: auto|direct|stream"));
    }

    #[test]
    fn test_select_backend_auto_follows_live_status() {
        let off = select_backend(RuntimeMode::Auto, false);
        assert_eq!(off.kind, BackendKind::Direct);
        assert_eq!(off.reason, "runtime=auto live-status disabled");

        let on = select_backend(RuntimeMode::Auto, true);
        assert_eq!(on.kind, BackendKind::Stream);
        assert_eq!(on.reason, "runtime=auto live-status enabled");
    }

    #[test]
    fn test_explicit_mode_wins() {
        assert_eq!(select_backend(RuntimeMode::Direct, true).kind, BackendKind::Direct);
        assert_eq!(select_backend(RuntimeMode::Stream, false).kind, BackendKind::Stream);
        assert_eq!(select_backend(RuntimeMode::Stream, false).reason, "runtime=stream");
    }

    #[test]
    fn test_build_executor_names() {
        let opts = ExecutorOptions {
            command: "claude".to_string(),
            phase_timeout: Duration::ZERO,
            stall_timeout: Duration::ZERO,
            startup_timeout: Duration::ZERO,
            check_interval: Duration::ZERO,
            live: None,
        };
        assert_eq!(build_executor(BackendKind::Direct, opts.clone()).name(), "direct");
        assert_eq!(build_executor(BackendKind::Stream, opts).name(), "stream");
    }

    #[cfg(unix)]
    mod fallback {
        use super::*;
        use std::os::unix::fs::PermissionsExt;
        use tempfile::tempdir;

        fn script(dir: &Path, name: &str, body: &str) -> String {
            let path = dir.join(name);
            std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
            path.to_string_lossy().to_string()
        }

        fn fallback(stream_cmd: String, direct_cmd: String) -> FallbackExecutor {
            FallbackExecutor {
                stream: StreamExecutor {
                    command: stream_cmd,
                    live: None,
                    phase_timeout: Duration::ZERO,
                    stall_timeout: Duration::ZERO,
                    startup_timeout: Duration::ZERO,
                    check_interval: Duration::from_millis(50),
                },
                direct: DirectExecutor::new(direct_cmd, Duration::ZERO),
            }
        }

        #[tokio::test]
        async fn test_no_events_falls_back_to_direct() {
            let dir = tempdir().unwrap();
            let marker = dir.path().join("direct-ran");
            let exec = fallback(
                script(dir.path(), "stream.sh", "echo garbage"),
                script(dir.path(), "direct.sh", &format!("touch {}", marker.display())),
            );
            exec.execute("p", dir.path(), "abc", 1).await.unwrap();
            assert!(marker.exists());
        }

        #[tokio::test]
        async fn test_exit_error_does_not_fall_back() {
            let dir = tempdir().unwrap();
            let marker = dir.path().join("direct-ran");
            let exec = fallback(
                script(dir.path(), "stream.sh", "exit 4"),
                script(dir.path(), "direct.sh", &format!("touch {}", marker.display())),
            );
            let err = exec.execute("p", dir.path(), "abc", 1).await.unwrap_err();
            assert!(matches!(err, ExecutorError::StreamExit { code: 4, .. }));
            assert!(!marker.exists());
        }

        #[tokio::test]
        async fn test_double_failure_reports_both() {
            let dir = tempdir().unwrap();
            let exec = fallback(
                script(dir.path(), "stream.sh", "true"),
                script(dir.path(), "direct.sh", "exit 9"),
            );
            let err = exec.execute("p", dir.path(), "abc", 2).await.unwrap_err();
            let msg = err.to_string();
            assert!(msg.starts_with("stream execution failed: "));
            assert!(msg.contains("direct fallback failed: "));
            assert!(msg.contains("exited with code 9"));
        }
    }
}
