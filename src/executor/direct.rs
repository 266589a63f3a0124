//! Direct backend: one blocking runtime call per phase.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;

use super::{PhaseExecutor, clean_env};
use crate::errors::ExecutorError;

/// Runs `<command> -p <prompt>` with the terminal attached.
#[derive(Debug, Clone)]
pub struct DirectExecutor {
    pub command: String,
    /// Zero disables the deadline.
    pub phase_timeout: Duration,
}

impl DirectExecutor {
    pub fn new(command: impl Into<String>, phase_timeout: Duration) -> Self {
        Self {
            command: command.into(),
            phase_timeout,
        }
    }
}

#[async_trait]
impl PhaseExecutor for DirectExecutor {
    fn name(&self) -> &'static str {
        "direct"
    }

    async fn execute(
        &self,
        prompt: &str,
        cwd: &Path,
        run_id: &str,
        phase_num: u32,
    ) -> Result<(), ExecutorError> {
        tracing::debug!(command = %self.command, run_id, phase = phase_num, "spawning direct session");

        let mut cmd = Command::new(&self.command);
        cmd.arg("-p")
            .arg(prompt)
            .current_dir(cwd)
            .env_clear()
            .envs(clean_env())
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|source| ExecutorError::SpawnFailed {
            command: self.command.clone(),
            source,
        })?;

        let status = if self.phase_timeout > Duration::ZERO {
            match tokio::time::timeout(self.phase_timeout, child.wait()).await {
                Ok(waited) => waited,
                Err(_) => {
                    let _ = child.kill().await;
                    return Err(ExecutorError::Timeout {
                        phase: phase_num,
                        after: self.phase_timeout,
                    });
                }
            }
        } else {
            child.wait().await
        };

        let status = status.map_err(|source| ExecutorError::SpawnFailed {
            command: self.command.clone(),
            source,
        })?;
        if !status.success() {
            return Err(ExecutorError::NonZeroExit {
                command: self.command.clone(),
                code: status.code().unwrap_or(-1),
            });
        }
        Ok(())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::tempdir;

    fn script(dir: &Path, body: &str) -> String {
        let path = dir.join("fake-runtime.sh");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path.to_string_lossy().to_string()
    }

    #[tokio::test]
    async fn test_direct_success_receives_prompt() {
        let dir = tempdir().unwrap();
        let out = dir.path().join("args.txt");
        let cmd = script(dir.path(), &format!("echo \"$1|$2\" > {}", out.display()));
        let exec = DirectExecutor::new(cmd, Duration::ZERO);
        exec.execute("do the thing", dir.path(), "abc", 1).await.unwrap();
        assert_eq!(std::fs::read_to_string(&out).unwrap().trim(), "-p|do the thing");
    }

    #[tokio::test]
    async fn test_direct_strips_nested_session_env() {
        let dir = tempdir().unwrap();
        let out = dir.path().join("env.txt");
        let cmd = script(dir.path(), &format!("env > {}", out.display()));
        let exec = DirectExecutor::new(cmd, Duration::ZERO);
        exec.execute("p", dir.path(), "abc", 1).await.unwrap();
        let env = std::fs::read_to_string(&out).unwrap();
        assert!(!env.lines().any(|l| l.starts_with("CLAUDECODE=")));
        assert!(!env.lines().any(|l| l.starts_with("CLAUDE_CODE_")));
    }

    #[tokio::test]
    async fn test_direct_nonzero_exit() {
        let dir = tempdir().unwrap();
        let cmd = script(dir.path(), "exit 3");
        let exec = DirectExecutor::new(cmd, Duration::ZERO);
        let err = exec.execute("p", dir.path(), "abc", 2).await.unwrap_err();
        assert!(matches!(err, ExecutorError::NonZeroExit { code: 3, .. }));
    }

    #[tokio::test]
    async fn test_direct_timeout() {
        let dir = tempdir().unwrap();
        let cmd = script(dir.path(), "sleep 5");
        let exec = DirectExecutor::new(cmd, Duration::from_millis(200));
        let err = exec.execute("p", dir.path(), "abc", 3).await.unwrap_err();
        assert!(matches!(err, ExecutorError::Timeout { phase: 3, .. }));
    }

    #[tokio::test]
    async fn test_direct_spawn_failure() {
        let dir = tempdir().unwrap();
        let exec = DirectExecutor::new("/nonexistent/forge-rpi-runtime", Duration::ZERO);
        let err = exec.execute("p", dir.path(), "abc", 1).await.unwrap_err();
        assert!(matches!(err, ExecutorError::SpawnFailed { .. }));
    }
}
