//! Run overview: `forge-rpi status [--json] [--watch]`.

use std::fmt::Write as _;
use std::io::Write as _;
use std::path::Path;
use std::time::Duration;

use anyhow::Result;
use console::{Term, style};
use serde::Serialize;

use forge_rpi::config::Config;
use forge_rpi::registry::{
    LiveStatusSnapshot, RegistryOptions, RunInfo, discover_live_statuses, discover_runs,
};
use forge_rpi::util::truncate_str;

use super::super::Cli;

const WATCH_INTERVAL: Duration = Duration::from_secs(5);
const WATCH_FOOTER: &str = "[watch mode: polling every 5s, Ctrl-C to exit]";

#[derive(Debug, Serialize)]
pub struct StatusOutput {
    pub active: Vec<RunInfo>,
    pub historical: Vec<RunInfo>,
    pub runs: Vec<RunInfo>,
    pub live_statuses: Vec<LiveStatusSnapshot>,
    pub count: usize,
}

pub async fn build_status(cwd: &Path, opts: &RegistryOptions) -> StatusOutput {
    let (active, historical) = discover_runs(cwd, opts).await;
    let runs: Vec<RunInfo> = active.iter().chain(historical.iter()).cloned().collect();
    StatusOutput {
        count: runs.len(),
        active,
        historical,
        runs,
        live_statuses: discover_live_statuses(cwd),
    }
}

fn render_section(out: &mut String, title: &str, runs: &[RunInfo], label: &str) {
    let _ = writeln!(out, "{}", style(title).bold());
    if runs.iter().any(|r| !r.reason.is_empty()) {
        let _ = writeln!(
            out,
            "{:<14} {:<26} {:<14} {:<12} {:<20} ELAPSED",
            "RUN-ID", "GOAL", "PHASE", "STATUS", "REASON"
        );
        let _ = writeln!(out, "{}", "─".repeat(100));
        for r in runs {
            let _ = writeln!(
                out,
                "{:<14} {:<26} {:<14} {:<12} {:<20} {}",
                r.run_id,
                truncate_str(&r.goal, 24),
                r.phase_name,
                r.status,
                r.reason,
                r.elapsed
            );
        }
    } else {
        let _ = writeln!(
            out,
            "{:<14} {:<30} {:<14} {:<10} ELAPSED",
            "RUN-ID", "GOAL", "PHASE", "STATUS"
        );
        let _ = writeln!(out, "{}", "─".repeat(82));
        for r in runs {
            let _ = writeln!(
                out,
                "{:<14} {:<30} {:<14} {:<10} {}",
                r.run_id,
                truncate_str(&r.goal, 28),
                r.phase_name,
                r.status,
                r.elapsed
            );
        }
    }
    let _ = writeln!(out, "\n{} {label} run(s) found.", runs.len());
}

/// Human-readable tables; live status paths are shown relative to `cwd`.
pub fn render_status_table(cwd: &Path, output: &StatusOutput) -> String {
    let mut out = String::new();
    if output.runs.is_empty() && output.live_statuses.is_empty() {
        out.push_str("No active RPI runs found.\n");
        return out;
    }

    if !output.active.is_empty() {
        render_section(&mut out, "Active Runs", &output.active, "active");
    }
    if !output.historical.is_empty() {
        if !output.active.is_empty() {
            out.push('\n');
        }
        render_section(&mut out, "Historical Runs", &output.historical, "historical");
    }
    if !output.live_statuses.is_empty() {
        let _ = writeln!(out, "\n{}", style("Live Status Files").bold());
        let _ = writeln!(out, "{}", "─".repeat(100));
        for snapshot in &output.live_statuses {
            let path = snapshot.path.strip_prefix(cwd).unwrap_or(&snapshot.path);
            let _ = writeln!(out, "\n[{}]\n{}", path.display(), snapshot.content.trim());
        }
    }
    out
}

async fn print_once(cwd: &Path, opts: &RegistryOptions, json: bool) -> Result<()> {
    let output = build_status(cwd, opts).await;
    if json {
        println!("{}", serde_json::to_string_pretty(&output)?);
    } else {
        print!("{}", render_status_table(cwd, &output));
    }
    Ok(())
}

async fn watch(cwd: &Path, opts: &RegistryOptions, json: bool) -> Result<()> {
    let term = Term::stdout();
    let mut ticker = tokio::time::interval(WATCH_INTERVAL);
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                println!("\nExiting watch mode.");
                return Ok(());
            }
            _ = ticker.tick() => {
                let _ = term.clear_screen();
                if let Err(e) = print_once(cwd, opts, json).await {
                    eprintln!("Error: {e:#}");
                }
                print!("\n{WATCH_FOOTER}");
                let _ = std::io::stdout().flush();
            }
        }
    }
}

pub async fn cmd_status(cli: &Cli, project_dir: &Path, json: bool, watch_mode: bool) -> Result<()> {
    let config = Config::load(project_dir, cli.verbose, cli.yes)?;
    let opts = RegistryOptions::from_config(&config);
    if watch_mode {
        watch(&config.project_dir, &opts, json).await
    } else {
        print_once(&config.project_dir, &opts, json).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn run(id: &str, goal: &str, status: &str, reason: &str) -> RunInfo {
        RunInfo {
            run_id: id.to_string(),
            goal: goal.to_string(),
            phase: 2,
            phase_name: "implementation".to_string(),
            status: status.to_string(),
            reason: reason.to_string(),
            epic_id: String::new(),
            worktree: PathBuf::from("/repo"),
            started_at: "2026-01-01T00:00:00Z".to_string(),
            elapsed: "5m0s".to_string(),
            is_active: status == "running",
            last_heartbeat: None,
        }
    }

    fn output(active: Vec<RunInfo>, historical: Vec<RunInfo>) -> StatusOutput {
        let runs: Vec<RunInfo> = active.iter().chain(historical.iter()).cloned().collect();
        StatusOutput {
            count: runs.len(),
            active,
            historical,
            runs,
            live_statuses: Vec::new(),
        }
    }

    #[test]
    fn empty_status_says_so() {
        let text = render_status_table(Path::new("/repo"), &output(vec![], vec![]));
        assert_eq!(text, "No active RPI runs found.\n");
    }

    #[test]
    fn reason_column_only_when_needed() {
        console::set_colors_enabled(false);
        let active = vec![run("abc123def456", "add auth", "running", "")];
        let text = render_status_table(Path::new("/repo"), &output(active, vec![]));
        assert!(text.starts_with("Active Runs\nRUN-ID"));
        assert!(!text.contains("REASON"));
        assert!(text.contains("1 active run(s) found."));

        let historical = vec![run(
            "fff000111222",
            "a goal long enough to be truncated in the table",
            "failed",
            "phase 2 failed",
        )];
        let text = render_status_table(Path::new("/repo"), &output(vec![], historical));
        assert!(text.contains("REASON"));
        assert!(text.contains("a goal long enough to..."));
        assert!(text.contains("1 historical run(s) found."));
    }

    #[test]
    fn live_status_paths_are_relative() {
        console::set_colors_enabled(false);
        let mut out = output(vec![], vec![]);
        out.live_statuses.push(LiveStatusSnapshot {
            path: PathBuf::from("/repo/.agents/rpi/live-status.md"),
            content: "# Live\n\n".to_string(),
        });
        let text = render_status_table(Path::new("/repo"), &out);
        assert!(text.contains("[.agents/rpi/live-status.md]\n# Live\n"));
    }

    #[tokio::test]
    async fn json_output_counts_runs() {
        let dir = tempfile::tempdir().unwrap();
        let opts = RegistryOptions {
            tmux_command: "/nonexistent/forge-rpi-tmux".to_string(),
            ..RegistryOptions::default()
        };
        let status = build_status(dir.path(), &opts).await;
        assert_eq!(status.count, 0);
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["runs"], serde_json::json!([]));
    }
}
