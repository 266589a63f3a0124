//! Stream backend: runs the agent in `stream-json` mode, folds every event
//! into the live status file and supervises the session with two watchdogs.

use std::path::Path;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use super::events::{apply_event, parse_stream_line};
use super::live_status::{LiveStatus, PhaseProgress};
use super::{PhaseExecutor, clean_env};
use crate::errors::{ExecutorError, WatchdogCause};

const MAX_STARTUP_TICK: Duration = Duration::from_secs(5);

/// Counters shared between the reader and the watchdogs. Activity is kept
/// as milliseconds since `started` so it fits in an atomic.
#[derive(Debug)]
pub struct WatchdogState {
    started: Instant,
    events: AtomicU64,
    last_activity_ms: AtomicU64,
}

impl WatchdogState {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            events: AtomicU64::new(0),
            last_activity_ms: AtomicU64::new(0),
        }
    }

    pub fn record_event(&self) {
        self.events.fetch_add(1, Ordering::SeqCst);
        let now = self.started.elapsed().as_millis() as u64;
        self.last_activity_ms.store(now, Ordering::SeqCst);
    }

    pub fn event_count(&self) -> u64 {
        self.events.load(Ordering::SeqCst)
    }

    pub fn since_start(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn since_last_activity(&self) -> Duration {
        let last = Duration::from_millis(self.last_activity_ms.load(Ordering::SeqCst));
        self.started.elapsed().saturating_sub(last)
    }
}

impl Default for WatchdogState {
    fn default() -> Self {
        Self::new()
    }
}

/// Cancel-once handle: the first watchdog to trip records its cause.
#[derive(Debug, Clone, Default)]
pub struct WatchdogTrip {
    token: CancellationToken,
    cause: Arc<OnceLock<WatchdogCause>>,
}

impl WatchdogTrip {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false when another watchdog already tripped.
    pub fn trip(&self, cause: WatchdogCause) -> bool {
        if self.cause.set(cause).is_ok() {
            self.token.cancel();
            true
        } else {
            false
        }
    }

    pub fn cause(&self) -> Option<WatchdogCause> {
        self.cause.get().cloned()
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

async fn startup_watchdog(
    state: Arc<WatchdogState>,
    trip: WatchdogTrip,
    timeout: Duration,
    tick: Duration,
) {
    let mut interval = tokio::time::interval(tick);
    loop {
        tokio::select! {
            _ = trip.token().cancelled() => return,
            _ = interval.tick() => {}
        }
        if state.event_count() > 0 {
            return;
        }
        if state.since_start() > timeout {
            trip.trip(WatchdogCause::StartupTimeout(timeout));
            return;
        }
    }
}

async fn stall_watchdog(
    state: Arc<WatchdogState>,
    trip: WatchdogTrip,
    timeout: Duration,
    tick: Duration,
) {
    let mut interval = tokio::time::interval(tick);
    loop {
        tokio::select! {
            _ = trip.token().cancelled() => return,
            _ = interval.tick() => {}
        }
        if state.since_last_activity() > timeout {
            trip.trip(WatchdogCause::Stall(timeout));
            return;
        }
    }
}

enum Outcome {
    Finished {
        read: std::io::Result<()>,
        wait: std::io::Result<std::process::ExitStatus>,
    },
    Deadline,
    Cancelled,
}

/// Streams one phase session. Wrap it in [`super::FallbackExecutor`] to get
/// the direct fallback on protocol failures.
#[derive(Debug, Clone)]
pub struct StreamExecutor {
    pub command: String,
    pub live: Option<Arc<LiveStatus>>,
    /// Zero disables each of the timeouts below.
    pub phase_timeout: Duration,
    pub stall_timeout: Duration,
    pub startup_timeout: Duration,
    pub check_interval: Duration,
}

impl StreamExecutor {
    fn check_interval(&self) -> Duration {
        if self.check_interval.is_zero() {
            Duration::from_secs(1)
        } else {
            self.check_interval
        }
    }

    fn record(&self, phase_num: u32, progress: &PhaseProgress) {
        if let Some(live) = &self.live {
            live.merge_progress(phase_num, progress);
        }
    }
}

#[async_trait]
impl PhaseExecutor for StreamExecutor {
    fn name(&self) -> &'static str {
        "stream"
    }

    async fn execute(
        &self,
        prompt: &str,
        cwd: &Path,
        run_id: &str,
        phase_num: u32,
    ) -> Result<(), ExecutorError> {
        tracing::debug!(command = %self.command, run_id, phase = phase_num, "spawning stream session");

        let mut child = Command::new(&self.command)
            .arg("-p")
            .arg(prompt)
            .args(["--output-format", "stream-json", "--verbose"])
            .current_dir(cwd)
            .env_clear()
            .envs(clean_env())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| ExecutorError::SpawnFailed {
                command: self.command.clone(),
                source,
            })?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ExecutorError::Parse("stdout not captured".to_string()))?;

        let state = Arc::new(WatchdogState::new());
        let trip = WatchdogTrip::new();
        let interval = self.check_interval();
        let mut watchdogs = Vec::new();
        if !self.startup_timeout.is_zero() {
            watchdogs.push(tokio::spawn(startup_watchdog(
                Arc::clone(&state),
                trip.clone(),
                self.startup_timeout,
                interval.min(MAX_STARTUP_TICK),
            )));
        }
        if !self.stall_timeout.is_zero() {
            watchdogs.push(tokio::spawn(stall_watchdog(
                Arc::clone(&state),
                trip.clone(),
                self.stall_timeout,
                interval,
            )));
        }

        let pump = {
            let state = Arc::clone(&state);
            let child = &mut child;
            async move {
                let mut progress = PhaseProgress::default();
                let mut lines = BufReader::new(stdout).lines();
                let read = loop {
                    match lines.next_line().await {
                        Ok(Some(line)) => {
                            let Some(event) = parse_stream_line(&line) else {
                                continue;
                            };
                            state.record_event();
                            apply_event(&mut progress, &event);
                            self.record(phase_num, &progress);
                        }
                        Ok(None) => break Ok(()),
                        Err(e) => break Err(e),
                    }
                };
                let wait = child.wait().await;
                Outcome::Finished { read, wait }
            }
        };

        let has_deadline = !self.phase_timeout.is_zero();
        let outcome = tokio::select! {
            finished = pump => finished,
            _ = tokio::time::sleep(self.phase_timeout), if has_deadline => Outcome::Deadline,
            _ = trip.token().cancelled() => Outcome::Cancelled,
        };

        for handle in &watchdogs {
            handle.abort();
        }
        if !matches!(outcome, Outcome::Finished { .. }) {
            let _ = child.kill().await;
        }

        let result = classify(&self.command, phase_num, self.phase_timeout, &trip, &state, outcome);
        if let Err(e) = &result {
            tracing::warn!(phase = phase_num, error = %e, events = state.event_count(), "stream session failed");
        }
        result
    }
}

fn classify(
    command: &str,
    phase_num: u32,
    phase_timeout: Duration,
    trip: &WatchdogTrip,
    state: &WatchdogState,
    outcome: Outcome,
) -> Result<(), ExecutorError> {
    if matches!(outcome, Outcome::Deadline) {
        return Err(ExecutorError::StreamTimeout {
            phase: phase_num,
            after: phase_timeout,
        });
    }
    if let Some(cause) = trip.cause() {
        return Err(ExecutorError::Stalled {
            phase: phase_num,
            cause,
        });
    }
    let Outcome::Finished { read, wait } = outcome else {
        return Err(ExecutorError::Other(anyhow::anyhow!(
            "stream session cancelled without a cause"
        )));
    };
    match wait {
        Ok(status) if !status.success() => {
            return Err(ExecutorError::StreamExit {
                command: command.to_string(),
                code: status.code().unwrap_or(-1),
            });
        }
        Err(source) => {
            return Err(ExecutorError::StreamWait {
                command: command.to_string(),
                source,
            });
        }
        Ok(_) => {}
    }
    if let Err(e) = read {
        return Err(ExecutorError::Parse(e.to_string()));
    }
    if state.event_count() == 0 {
        return Err(ExecutorError::NoEvents);
    }
    Ok(())
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::tempdir;

    fn script(dir: &Path, body: &str) -> String {
        let path = dir.join("fake-stream.sh");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path.to_string_lossy().to_string()
    }

    fn executor(command: String, live: Option<Arc<LiveStatus>>) -> StreamExecutor {
        StreamExecutor {
            command,
            live,
            phase_timeout: Duration::ZERO,
            stall_timeout: Duration::ZERO,
            startup_timeout: Duration::ZERO,
            check_interval: Duration::from_millis(50),
        }
    }

    const EVENTS: &str = r#"echo '{"type":"system","subtype":"init","session_id":"s1","model":"m"}'
echo 'not json'
echo '{"type":"assistant","message":{"content":[{"type":"tool_use","name":"Read","input":{"file_path":"a/b/c.rs"}}]}}'
echo '{"type":"result","subtype":"success","total_cost_usd":0.25,"num_turns":2}'"#;

    #[tokio::test]
    async fn test_stream_success_writes_live_status() {
        let dir = tempdir().unwrap();
        let status_path = dir.path().join("live-status.md");
        let live = Arc::new(LiveStatus::new(status_path.clone()));
        let exec = executor(script(dir.path(), EVENTS), Some(Arc::clone(&live)));

        exec.execute("p", dir.path(), "abc", 2).await.unwrap();

        let slot = &live.snapshot()[1];
        assert_eq!(slot.name, "implementation");
        assert_eq!(slot.tool_count, 1);
        assert_eq!(slot.cost_usd, 0.25);
        assert_eq!(slot.current_action, "result received");
        let table = std::fs::read_to_string(&status_path).unwrap();
        assert!(table.contains("| implementation | running |"));
        assert!(table.contains("$0.2500"));
    }

    #[tokio::test]
    async fn test_stream_passes_stream_flags() {
        let dir = tempdir().unwrap();
        let out = dir.path().join("args.txt");
        let body = format!(
            "echo \"$*\" > {}\necho '{{\"type\":\"init\"}}'",
            out.display()
        );
        let exec = executor(script(dir.path(), &body), None);
        exec.execute("hello", dir.path(), "abc", 1).await.unwrap();
        assert_eq!(
            std::fs::read_to_string(&out).unwrap().trim(),
            "-p hello --output-format stream-json --verbose"
        );
    }

    #[tokio::test]
    async fn test_stream_without_events() {
        let dir = tempdir().unwrap();
        let exec = executor(script(dir.path(), "echo 'plain text only'"), None);
        let err = exec.execute("p", dir.path(), "abc", 1).await.unwrap_err();
        assert!(matches!(err, ExecutorError::NoEvents));
        assert!(err.is_recoverable_stream_failure());
    }

    #[tokio::test]
    async fn test_stream_exit_code_is_not_recoverable() {
        let dir = tempdir().unwrap();
        let body = format!("{EVENTS}\nexit 2");
        let exec = executor(script(dir.path(), &body), None);
        let err = exec.execute("p", dir.path(), "abc", 1).await.unwrap_err();
        assert!(matches!(err, ExecutorError::StreamExit { code: 2, .. }));
        assert!(!err.is_recoverable_stream_failure());
    }

    #[tokio::test]
    async fn test_startup_watchdog_fires_without_events() {
        let dir = tempdir().unwrap();
        let mut exec = executor(script(dir.path(), "exec sleep 5"), None);
        exec.startup_timeout = Duration::from_millis(200);
        let started = Instant::now();
        let err = exec.execute("p", dir.path(), "abc", 1).await.unwrap_err();
        assert!(started.elapsed() < Duration::from_secs(4));
        match err {
            ExecutorError::Stalled {
                phase: 1,
                cause: WatchdogCause::StartupTimeout(_),
            } => {}
            other => panic!("Expected startup timeout, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_stall_watchdog_fires_after_activity_stops() {
        let dir = tempdir().unwrap();
        let body = "echo '{\"type\":\"init\"}'\nexec sleep 5";
        let mut exec = executor(script(dir.path(), body), None);
        exec.stall_timeout = Duration::from_millis(300);
        exec.startup_timeout = Duration::from_secs(10);
        let err = exec.execute("p", dir.path(), "abc", 2).await.unwrap_err();
        match err {
            ExecutorError::Stalled {
                phase: 2,
                cause: WatchdogCause::Stall(_),
            } => {}
            other => panic!("Expected stall, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_phase_deadline_wins() {
        let dir = tempdir().unwrap();
        let mut exec = executor(script(dir.path(), "exec sleep 5"), None);
        exec.phase_timeout = Duration::from_millis(200);
        let err = exec.execute("p", dir.path(), "abc", 3).await.unwrap_err();
        assert!(matches!(err, ExecutorError::StreamTimeout { phase: 3, .. }));
    }

    #[test]
    fn test_first_trip_wins() {
        let trip = WatchdogTrip::new();
        assert!(trip.trip(WatchdogCause::Stall(Duration::from_secs(1))));
        assert!(!trip.trip(WatchdogCause::StartupTimeout(Duration::from_secs(2))));
        assert_eq!(trip.cause(), Some(WatchdogCause::Stall(Duration::from_secs(1))));
        assert!(trip.token().is_cancelled());
    }
}
