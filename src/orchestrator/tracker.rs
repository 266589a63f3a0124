//! Best-effort work-item tracker queries (`bd` by default).
//!
//! The tracker is optional. Every call returns an error the engine logs and
//! skips; only a BLOCKED or PARTIAL epic after implementation gates a run.

use std::path::Path;
use std::sync::LazyLock;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use regex::Regex;
use serde::Deserialize;
use tokio::process::Command;

const TRACKER_TIMEOUT: Duration = Duration::from_secs(30);

static ISSUE_ID_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z][a-z0-9]*-[a-z0-9][a-z0-9.]*$").expect("valid issue id regex")
});

/// Completion state of an epic's children.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrankStatus {
    Done,
    Blocked,
    Partial,
}

impl CrankStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CrankStatus::Done => "DONE",
            CrankStatus::Blocked => "BLOCKED",
            CrankStatus::Partial => "PARTIAL",
        }
    }
}

#[derive(Debug, Deserialize)]
struct IssueEntry {
    #[serde(default)]
    id: String,
}

/// Last non-empty `id` in a JSON list; the newest epic is listed last.
pub fn parse_latest_epic_from_json(data: &str) -> Result<String> {
    let entries: Vec<IssueEntry> =
        serde_json::from_str(data).context("Failed to parse tracker JSON")?;
    entries
        .iter()
        .rev()
        .map(|e| e.id.trim())
        .find(|id| !id.is_empty())
        .map(str::to_string)
        .ok_or_else(|| anyhow!("no epic found in tracker output"))
}

/// Last issue-like token within the first three fields of any line.
pub fn parse_latest_epic_from_text(output: &str) -> Result<String> {
    let mut latest = None;
    for line in output.lines() {
        let found = line
            .split_whitespace()
            .take(3)
            .map(|f| f.trim_matches(|c| matches!(c, '[' | ']' | '(' | ')')))
            .find(|token| ISSUE_ID_RE.is_match(token));
        if let Some(token) = found {
            latest = Some(token.to_string());
        }
    }
    latest.ok_or_else(|| anyhow!("no epic found in tracker output"))
}

fn child_lines(output: &str) -> impl Iterator<Item = String> + '_ {
    output
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(str::to_lowercase)
}

/// Micro-epic: at most two children and none blocked.
pub fn parse_fast_path(children: &str) -> bool {
    let lines: Vec<String> = child_lines(children).collect();
    lines.len() <= 2 && !lines.iter().any(|l| l.contains("blocked"))
}

pub fn parse_crank_completion(children: &str) -> CrankStatus {
    let mut total = 0;
    let mut closed = 0;
    let mut blocked = 0;
    for line in child_lines(children) {
        total += 1;
        if line.contains("closed") || line.contains('✓') {
            closed += 1;
        }
        if line.contains("blocked") {
            blocked += 1;
        }
    }
    if total == closed {
        CrankStatus::Done
    } else if blocked > 0 {
        CrankStatus::Blocked
    } else {
        CrankStatus::Partial
    }
}

/// Thin wrapper over the tracker CLI.
#[derive(Debug, Clone)]
pub struct Tracker {
    command: String,
}

impl Tracker {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }

    async fn output(&self, cwd: &Path, args: &[&str]) -> Result<String> {
        let mut cmd = Command::new(&self.command);
        cmd.args(args).current_dir(cwd).kill_on_drop(true);
        let out = tokio::time::timeout(TRACKER_TIMEOUT, cmd.output())
            .await
            .map_err(|_| anyhow!("{} {} timed out", self.command, args.join(" ")))?
            .with_context(|| format!("Failed to run {}", self.command))?;
        if !out.status.success() {
            bail!(
                "{} {} failed: {}",
                self.command,
                args.join(" "),
                String::from_utf8_lossy(&out.stderr).trim()
            );
        }
        Ok(String::from_utf8_lossy(&out.stdout).to_string())
    }

    /// Newest open epic, via JSON with a plain-text fallback.
    pub async fn latest_epic(&self, cwd: &Path) -> Result<String> {
        match self
            .output(cwd, &["list", "--type", "epic", "--status", "open", "--json"])
            .await
        {
            Ok(json) => match parse_latest_epic_from_json(&json) {
                Ok(id) => return Ok(id),
                Err(e) => tracing::debug!(error = %e, "tracker JSON unusable, falling back to text"),
            },
            Err(e) => tracing::debug!(error = %e, "tracker --json failed, falling back to text"),
        }
        let text = self
            .output(cwd, &["list", "--type", "epic", "--status", "open"])
            .await?;
        parse_latest_epic_from_text(&text)
    }

    pub async fn children(&self, cwd: &Path, epic_id: &str) -> Result<String> {
        self.output(cwd, &["children", epic_id]).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_latest_epic_from_json() {
        let json = r#"[{"id":"ag-1"},{"id":"ag-2"},{"id":"  "}]"#;
        assert_eq!(parse_latest_epic_from_json(json).unwrap(), "ag-2");
        assert!(parse_latest_epic_from_json("[]").is_err());
        assert!(parse_latest_epic_from_json("nope").is_err());
    }

    #[test]
    fn test_latest_epic_from_text() {
        let text = "○ bd-12 [epic] first\n○ [ag-7.1] second\nnothing here\n";
        assert_eq!(parse_latest_epic_from_text(text).unwrap(), "ag-7.1");
        assert!(parse_latest_epic_from_text("no ids\n").is_err());
    }

    #[test]
    fn test_fast_path_detection() {
        assert!(parse_fast_path("ag-1.1 open\nag-1.2 open\n"));
        assert!(!parse_fast_path("a\nb\nc\n"));
        assert!(!parse_fast_path("ag-1.1 blocked\n"));
        assert!(parse_fast_path(""));
    }

    #[test]
    fn test_crank_completion() {
        assert_eq!(parse_crank_completion(""), CrankStatus::Done);
        assert_eq!(
            parse_crank_completion("ag-1.1 closed\nag-1.2 ✓ done\n"),
            CrankStatus::Done
        );
        assert_eq!(
            parse_crank_completion("ag-1.1 closed\nag-1.2 blocked\n"),
            CrankStatus::Blocked
        );
        assert_eq!(
            parse_crank_completion("ag-1.1 closed\nag-1.2 open\n"),
            CrankStatus::Partial
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_missing_tracker_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = Tracker::new("/nonexistent/forge-rpi-tracker");
        assert!(tracker.latest_epic(dir.path()).await.is_err());
    }
}
