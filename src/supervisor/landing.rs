//! Commit landing for supervisor cycles.
//!
//! Only paths that became dirty during a cycle are committed; anything the
//! operator already had modified before the cycle started is left alone.

use std::collections::BTreeSet;
use std::path::Path;

use crate::config::DEFAULT_COMMIT_TEMPLATE;
use crate::errors::{SupervisorError, WorktreeError};
use crate::worktree::{VCS_TIMEOUT, run_git};

async fn git_stdout(dir: &Path, args: &[&str]) -> Result<String, SupervisorError> {
    let out = run_git(dir, args, VCS_TIMEOUT)
        .await
        .map_err(|e| SupervisorError::Landing(e.to_string()))?;
    if !out.success {
        return Err(SupervisorError::Landing(
            WorktreeError::GitCommand {
                command: args.join(" "),
                stderr: out.stderr.trim().to_string(),
            }
            .to_string(),
        ));
    }
    Ok(out.stdout)
}

fn collect_lines(dest: &mut BTreeSet<String>, output: &str) {
    dest.extend(
        output
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string),
    );
}

/// Tracked paths differing from HEAD plus untracked, non-ignored paths.
pub async fn collect_dirty_paths(dir: &Path) -> Result<BTreeSet<String>, SupervisorError> {
    let mut paths = BTreeSet::new();
    collect_lines(
        &mut paths,
        &git_stdout(dir, &["diff", "--name-only", "HEAD", "--"]).await?,
    );
    collect_lines(
        &mut paths,
        &git_stdout(dir, &["ls-files", "--others", "--exclude-standard"]).await?,
    );
    Ok(paths)
}

/// Paths dirty now that were not dirty in the baseline, sorted.
pub fn owned_paths(baseline: &BTreeSet<String>, current: &BTreeSet<String>) -> Vec<String> {
    current.difference(baseline).cloned().collect()
}

pub fn render_commit_message(template: &str, cycle: u32, attempt: u32, goal: &str) -> String {
    let template = match template.trim() {
        "" => DEFAULT_COMMIT_TEMPLATE,
        t => t,
    };
    template
        .replace("{cycle}", &cycle.to_string())
        .replace("{attempt}", &attempt.to_string())
        .replace("{goal}", goal)
}

pub async fn repo_has_changes(dir: &Path) -> Result<bool, SupervisorError> {
    Ok(!git_stdout(dir, &["status", "--porcelain"]).await?.trim().is_empty())
}

/// Dirty paths captured before a cycle runs.
#[derive(Debug, Clone, Default)]
pub struct LandingScope {
    pub baseline: BTreeSet<String>,
}

impl LandingScope {
    pub async fn capture(dir: &Path) -> Result<Self, SupervisorError> {
        Ok(Self {
            baseline: collect_dirty_paths(dir).await?,
        })
    }
}

/// Stage and commit the paths this cycle dirtied. Returns whether a commit
/// was made.
pub async fn commit_owned(dir: &Path, message: &str, scope: &LandingScope) -> Result<bool, SupervisorError> {
    if !repo_has_changes(dir).await? {
        println!("Landing: no changes to commit.");
        return Ok(false);
    }
    let current = collect_dirty_paths(dir).await?;
    let owned = owned_paths(&scope.baseline, &current);
    if owned.is_empty() {
        println!("Landing: only pre-existing dirty paths detected; skipping autonomous commit.");
        return Ok(false);
    }

    let mut add: Vec<&str> = vec!["add", "--"];
    add.extend(owned.iter().map(String::as_str));
    git_stdout(dir, &add).await?;
    git_stdout(dir, &["commit", "-m", message]).await?;
    tracing::info!(paths = owned.len(), "landing commit created");
    println!("Landing: committed {} path(s).", owned.len());
    Ok(true)
}
