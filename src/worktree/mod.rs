//! Sibling worktree isolation for RPI runs.
//!
//! A run executes in `<parent>/<repo>-rpi-<runID>`, a detached checkout of
//! the commit HEAD pointed at when the run started. Read-only repository
//! queries go through `git2`; mutations (worktree add/remove/prune, merge,
//! branch deletion) shell out to `git`, each bounded by [`VCS_TIMEOUT`].
//!
//! Removal is guarded before any mutation: the target must be a true
//! sibling of the repository root and must not be the root itself.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use git2::{Repository, StatusOptions};
use tokio::process::Command;

use crate::errors::WorktreeError;
use crate::util::generate_run_id;

pub const VCS_TIMEOUT: Duration = Duration::from_secs(60);
const CREATE_ATTEMPTS: u32 = 3;
const CLEAN_CHECKS: u32 = 5;
const CLEAN_DELAY: Duration = Duration::from_secs(2);

/// Captured output of one `git` invocation.
#[derive(Debug)]
pub struct GitOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

/// Run `git <args>` in `dir` with a timeout. Non-zero exit is reported in
/// `GitOutput::success`, not as an error.
pub async fn run_git(dir: &Path, args: &[&str], timeout: Duration) -> Result<GitOutput, WorktreeError> {
    let child = Command::new("git")
        .args(args)
        .current_dir(dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output();

    let output = tokio::time::timeout(timeout, child)
        .await
        .map_err(|_| WorktreeError::GitTimeout {
            command: args.first().copied().unwrap_or("").to_string(),
            after: timeout,
        })??;

    Ok(GitOutput {
        success: output.status.success(),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}

async fn run_git_checked(dir: &Path, args: &[&str], timeout: Duration) -> Result<GitOutput, WorktreeError> {
    let out = run_git(dir, args, timeout).await?;
    if !out.success {
        return Err(WorktreeError::GitCommand {
            command: args.join(" "),
            stderr: out.stderr.trim().to_string(),
        });
    }
    Ok(out)
}

/// Resolve the working-tree root of the repository containing `dir`.
pub fn discover_repo_root(dir: &Path) -> Result<PathBuf, WorktreeError> {
    let repo = Repository::discover(dir).map_err(|_| WorktreeError::NotGitRepo(dir.to_path_buf()))?;
    let root = repo
        .workdir()
        .ok_or_else(|| WorktreeError::NotGitRepo(dir.to_path_buf()))?;
    Ok(root.canonicalize().unwrap_or_else(|_| root.to_path_buf()))
}

/// Current branch name, or `None` when HEAD is detached or unborn.
pub fn current_branch(repo_root: &Path) -> Result<Option<String>, WorktreeError> {
    let repo = Repository::open(repo_root)?;
    if repo.head_detached().unwrap_or(false) {
        return Ok(None);
    }
    let head = match repo.head() {
        Ok(h) => h,
        Err(_) => return Ok(None),
    };
    Ok(head.shorthand().map(str::to_string))
}

fn head_commit(repo_root: &Path) -> Result<String, WorktreeError> {
    let repo = Repository::open(repo_root)?;
    let commit = repo
        .head()
        .and_then(|h| h.peel_to_commit())
        .map_err(|_| WorktreeError::ResolveHead(repo_root.to_path_buf()))?;
    Ok(commit.id().to_string())
}

/// True when tracked files match HEAD (untracked files are ignored).
pub fn is_clean(repo_root: &Path) -> Result<bool, WorktreeError> {
    let repo = Repository::open(repo_root)?;
    let mut opts = StatusOptions::new();
    opts.include_untracked(false).include_ignored(false);
    let statuses = repo.statuses(Some(&mut opts))?;
    Ok(statuses.is_empty())
}

/// Expected sibling path for a run.
pub fn worktree_path_for(repo_root: &Path, run_id: &str) -> PathBuf {
    let base = repo_root
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let parent = repo_root.parent().unwrap_or(repo_root);
    parent.join(format!("{base}-rpi-{run_id}"))
}

/// Recover the run ID from a worktree directory name.
pub fn run_id_from_worktree(repo_root: &Path, worktree: &Path) -> Option<String> {
    let base = worktree.file_name()?.to_string_lossy().into_owned();
    let prefix = format!("{}-rpi-", repo_root.file_name()?.to_string_lossy());
    base.strip_prefix(&prefix)
        .filter(|id| !id.is_empty())
        .map(str::to_string)
}

fn resolve_path(path: &Path) -> PathBuf {
    path.canonicalize().unwrap_or_else(|_| {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            std::env::current_dir()
                .map(|cwd| cwd.join(path))
                .unwrap_or_else(|_| path.to_path_buf())
        }
    })
}

/// A freshly created worktree.
#[derive(Debug, Clone, PartialEq)]
pub struct CreatedWorktree {
    pub path: PathBuf,
    pub run_id: String,
    pub base_commit: String,
}

/// Creates, merges and removes sibling worktrees of one repository.
#[derive(Debug, Clone)]
pub struct WorktreeManager {
    repo_root: PathBuf,
    timeout: Duration,
    clean_checks: u32,
    clean_delay: Duration,
}

impl WorktreeManager {
    /// Open the repository containing `dir`.
    pub fn new(dir: &Path) -> Result<Self, WorktreeError> {
        Ok(Self {
            repo_root: discover_repo_root(dir)?,
            timeout: VCS_TIMEOUT,
            clean_checks: CLEAN_CHECKS,
            clean_delay: CLEAN_DELAY,
        })
    }

    /// Override the dirty-target wait (number of checks and delay between them).
    pub fn with_clean_wait(mut self, checks: u32, delay: Duration) -> Self {
        self.clean_checks = checks.max(1);
        self.clean_delay = delay;
        self
    }

    pub fn repo_root(&self) -> &Path {
        &self.repo_root
    }

    /// Create a detached sibling worktree at HEAD with a fresh run ID.
    pub async fn create(&self) -> Result<CreatedWorktree, WorktreeError> {
        let base_commit = head_commit(&self.repo_root)?;
        if let Ok(Some(branch)) = current_branch(&self.repo_root) {
            tracing::debug!(%branch, "creating detached worktree from current branch");
        }

        let mut last_path = PathBuf::new();
        for attempt in 1..=CREATE_ATTEMPTS {
            let run_id = generate_run_id();
            let path = worktree_path_for(&self.repo_root, &run_id);
            last_path = path.clone();

            if path.exists() {
                tracing::warn!(path = %path.display(), attempt, "worktree path collision, retrying");
                continue;
            }

            let path_arg = path.to_string_lossy().into_owned();
            let out = run_git(
                &self.repo_root,
                &["worktree", "add", "--detach", &path_arg, &base_commit],
                self.timeout,
            )
            .await?;

            if out.success {
                if let Err(e) = std::fs::create_dir_all(path.join(".agents").join("rpi")) {
                    tracing::warn!(error = %e, "could not create .agents/rpi in worktree");
                }
                tracing::info!(path = %path.display(), %run_id, "worktree created");
                return Ok(CreatedWorktree {
                    path,
                    run_id,
                    base_commit,
                });
            }
            if !out.stderr.contains("already exists") {
                return Err(WorktreeError::GitCommand {
                    command: "worktree add".to_string(),
                    stderr: out.stderr.trim().to_string(),
                });
            }
            tracing::warn!(path = %path.display(), attempt, "worktree path collision, retrying");
        }

        Err(WorktreeError::Collision {
            attempts: CREATE_ATTEMPTS,
            path: last_path,
        })
    }

    async fn wait_for_clean(&self) -> Result<(), WorktreeError> {
        for check in 1..=self.clean_checks {
            if is_clean(&self.repo_root)? {
                return Ok(());
            }
            if check < self.clean_checks {
                tracing::info!(
                    check,
                    total = self.clean_checks,
                    "target repo dirty (another merge in progress?), waiting"
                );
                tokio::time::sleep(self.clean_delay).await;
            }
        }
        Err(WorktreeError::RepoUnclean {
            retries: self.clean_checks,
        })
    }

    /// Merge the worktree's HEAD into the branch checked out in the repo root.
    ///
    /// On conflict the merge is aborted, the target is restored and the
    /// worktree is left untouched.
    pub async fn merge(&self, worktree: &Path, run_id: &str) -> Result<(), WorktreeError> {
        if Repository::open(&self.repo_root)?
            .head_detached()
            .unwrap_or(false)
        {
            return Err(WorktreeError::DetachedHead(self.repo_root.clone()));
        }

        self.wait_for_clean().await?;

        let worktree = if worktree.as_os_str().is_empty() {
            if run_id.trim().is_empty() {
                return Err(WorktreeError::MergeSourceUnavailable(
                    "missing worktree path and run ID".to_string(),
                ));
            }
            worktree_path_for(&self.repo_root, run_id)
        } else {
            worktree.to_path_buf()
        };

        let head = run_git(&worktree, &["rev-parse", "HEAD"], self.timeout)
            .await
            .map_err(|e| WorktreeError::MergeSourceUnavailable(e.to_string()))?;
        if !head.success {
            return Err(WorktreeError::MergeSourceUnavailable(
                head.stderr.trim().to_string(),
            ));
        }
        let source = head.stdout.trim().to_string();
        if source.is_empty() {
            return Err(WorktreeError::EmptyMergeSource);
        }
        let short_sha: String = source.chars().take(12).collect();

        let message = if run_id.trim().is_empty() {
            "Merge rpi worktree (detached checkout)".to_string()
        } else {
            format!("Merge {run_id} (rpi worktree)")
        };
        let merge = run_git(
            &self.repo_root,
            &["merge", "--no-ff", "-m", &message, &source],
            self.timeout,
        )
        .await?;
        if merge.success {
            tracing::info!(%short_sha, "worktree merged");
            return Ok(());
        }

        let conflicts = run_git(
            &self.repo_root,
            &["diff", "--name-only", "--diff-filter=U"],
            self.timeout,
        )
        .await
        .map(|o| o.stdout)
        .unwrap_or_default();
        let _ = run_git(&self.repo_root, &["merge", "--abort"], self.timeout).await;

        let files: Vec<String> = conflicts
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect();
        if files.is_empty() {
            return Err(WorktreeError::GitCommand {
                command: "merge".to_string(),
                stderr: format!("{}{}", merge.stdout.trim(), merge.stderr.trim()),
            });
        }
        Err(WorktreeError::MergeConflict { short_sha, files })
    }

    /// Validate that `worktree` is exactly this repository's worktree for the
    /// run. Returns the resolved path and run ID.
    pub fn validate_removal(&self, worktree: &Path, run_id: &str) -> Result<(PathBuf, String), WorktreeError> {
        let target = resolve_path(worktree);
        let root = resolve_path(&self.repo_root);

        if target == root {
            return Err(WorktreeError::PathValidation {
                path: target,
                reason: "target is the repository root".to_string(),
            });
        }
        if target.parent() != root.parent() {
            return Err(WorktreeError::PathValidation {
                path: target,
                reason: format!(
                    "not a sibling of the repository root {}",
                    root.display()
                ),
            });
        }

        let run_id = if run_id.trim().is_empty() {
            run_id_from_worktree(&root, &target).ok_or_else(|| WorktreeError::PathValidation {
                path: target.clone(),
                reason: "cannot infer run id from worktree name".to_string(),
            })?
        } else {
            run_id.trim().to_string()
        };

        let expected = worktree_path_for(&root, &run_id);
        if target != expected {
            return Err(WorktreeError::PathValidation {
                path: target,
                reason: format!("expected run worktree {}", expected.display()),
            });
        }
        Ok((target, run_id))
    }

    /// Remove a sibling worktree and its legacy `rpi/<runID>` branch.
    pub async fn remove(&self, worktree: &Path, run_id: &str) -> Result<(), WorktreeError> {
        let (target, run_id) = self.validate_removal(worktree, run_id)?;

        let target_arg = target.to_string_lossy().into_owned();
        let removed = run_git(
            &self.repo_root,
            &["worktree", "remove", &target_arg, "--force"],
            self.timeout,
        )
        .await
        .map(|o| o.success)
        .unwrap_or(false);
        if !removed && target.exists() {
            tracing::debug!(path = %target.display(), "git worktree remove failed, deleting directory");
            std::fs::remove_dir_all(&target)?;
        }

        let branch = format!("rpi/{run_id}");
        let _ = run_git(&self.repo_root, &["branch", "-D", &branch], self.timeout).await;
        Ok(())
    }

    /// `git worktree prune`.
    pub async fn prune(&self) -> Result<(), WorktreeError> {
        run_git_checked(&self.repo_root, &["worktree", "prune"], self.timeout).await?;
        Ok(())
    }

    /// Roots of every worktree attached to the repository (including the main one).
    pub async fn list_worktree_roots(&self) -> Result<Vec<PathBuf>, WorktreeError> {
        let out = run_git_checked(
            &self.repo_root,
            &["worktree", "list", "--porcelain"],
            self.timeout,
        )
        .await?;
        Ok(parse_porcelain_worktrees(&out.stdout))
    }

    /// Branch names checked out by any attached worktree.
    pub async fn checked_out_branches(&self) -> Result<HashSet<String>, WorktreeError> {
        let out = run_git_checked(
            &self.repo_root,
            &["worktree", "list", "--porcelain"],
            self.timeout,
        )
        .await?;
        Ok(parse_porcelain_branches(&out.stdout))
    }

    /// Legacy `rpi/*` branches, or only `rpi/<run_id>` when given.
    pub async fn rpi_branches(&self, run_id: Option<&str>) -> Result<Vec<String>, WorktreeError> {
        let pattern = match run_id {
            Some(id) => format!("refs/heads/rpi/{id}"),
            None => "refs/heads/rpi/*".to_string(),
        };
        let out = run_git_checked(
            &self.repo_root,
            &["for-each-ref", "--format=%(refname:short)", &pattern],
            self.timeout,
        )
        .await?;
        Ok(out
            .stdout
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }

    pub async fn delete_branch(&self, branch: &str) -> Result<(), WorktreeError> {
        run_git_checked(&self.repo_root, &["branch", "-D", branch], self.timeout).await?;
        Ok(())
    }
}

pub fn parse_porcelain_worktrees(porcelain: &str) -> Vec<PathBuf> {
    porcelain
        .lines()
        .filter_map(|l| l.strip_prefix("worktree "))
        .map(|p| PathBuf::from(p.trim()))
        .collect()
}

pub fn parse_porcelain_branches(porcelain: &str) -> HashSet<String> {
    porcelain
        .lines()
        .filter_map(|l| l.strip_prefix("branch refs/heads/"))
        .map(|b| b.trim().to_string())
        .collect()
}
