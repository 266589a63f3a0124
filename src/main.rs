use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::error::ErrorKind;
use clap::{Args, Parser, Subcommand};

use forge_rpi::errors::{EXIT_USAGE, exit_code};
use forge_rpi::logging::{self, LogOptions};

mod cmd;

#[derive(Parser)]
#[command(name = "forge-rpi")]
#[command(
    version,
    about = "Research-Plan-Implement orchestrator: discovery, implementation and validation phases for agent sessions"
)]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Skip confirmation prompts
    #[arg(long, global = true)]
    pub yes: bool,

    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    /// Also write JSON diagnostics to this file
    #[arg(long, global = true)]
    pub log_file: Option<PathBuf>,

    /// Emit stderr diagnostics as JSON lines
    #[arg(long, global = true)]
    pub log_json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Engine flags shared by `run` and `loop`.
#[derive(Args, Clone, Debug, Default)]
pub struct RunFlags {
    /// Phase to start from (discovery, implementation, validation or 1-3)
    #[arg(long)]
    pub from: Option<String>,

    /// Gate retries before escalation
    #[arg(long)]
    pub max_retries: Option<u32>,

    /// Per-phase wall clock limit, e.g. 90m
    #[arg(long)]
    pub phase_timeout: Option<String>,

    /// Stream inactivity limit once output has started
    #[arg(long)]
    pub stall_timeout: Option<String>,

    /// Limit for the first stream event
    #[arg(long)]
    pub stream_startup_timeout: Option<String>,

    /// Backend: auto, direct or stream
    #[arg(long)]
    pub runtime: Option<String>,

    /// Agent runtime command
    #[arg(long)]
    pub runtime_cmd: Option<String>,

    /// Write a live status file while phases stream
    #[arg(long)]
    pub live_status: bool,

    /// Run in the current checkout instead of a sibling worktree
    #[arg(long)]
    pub no_worktree: bool,

    /// Skip validation for fast-complexity goals
    #[arg(long)]
    pub fast_path: bool,

    /// Ask implementation to write tests first
    #[arg(long)]
    pub test_first: bool,

    #[arg(long)]
    pub no_swarm_first: bool,

    /// Print prompts without spawning sessions
    #[arg(long)]
    pub dry_run: bool,
}

#[derive(Args, Clone, Debug)]
pub struct LoopArgs {
    pub goal: String,

    #[command(flatten)]
    pub run: RunFlags,

    #[arg(long, default_value = "1")]
    pub max_cycles: u32,

    /// Extra attempts per cycle
    #[arg(long, default_value = "0")]
    pub cycle_retries: u32,

    /// Pause between cycles, e.g. 30s
    #[arg(long)]
    pub cycle_delay: Option<String>,

    /// stop or continue
    #[arg(long)]
    pub failure_policy: Option<String>,

    /// off, best-effort or required
    #[arg(long)]
    pub gate_policy: Option<String>,

    #[arg(long)]
    pub gate_script: Option<PathBuf>,

    /// off or commit
    #[arg(long)]
    pub landing_policy: Option<String>,

    /// Commit message with {cycle}, {attempt} and {goal} placeholders
    #[arg(long)]
    pub commit_template: Option<String>,

    #[arg(long)]
    pub kill_switch: Option<PathBuf>,

    #[arg(long)]
    pub lease_ttl: Option<String>,

    /// Mark stale runs and prune worktrees after each cycle
    #[arg(long)]
    pub cleanup_after_cycle: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the phases for a goal
    Run {
        goal: Option<String>,

        #[command(flatten)]
        flags: RunFlags,
    },
    /// Show active and historical runs
    Status {
        #[arg(long)]
        json: bool,

        /// Redraw every 5s until Ctrl-C
        #[arg(long)]
        watch: bool,
    },
    /// Mark stale runs and remove their leftovers
    Cleanup {
        #[arg(long, conflicts_with = "all")]
        run_id: Option<String>,

        #[arg(long)]
        all: bool,

        #[arg(long)]
        dry_run: bool,

        #[arg(long)]
        prune_worktrees: bool,

        #[arg(long)]
        prune_branches: bool,

        /// Only runs older than this, e.g. 2h
        #[arg(long)]
        stale_after: Option<String>,
    },
    /// Signal live runs and the supervisor, then mark them interrupted
    Cancel {
        #[arg(long, conflicts_with = "all")]
        run_id: Option<String>,

        #[arg(long)]
        all: bool,

        /// TERM, KILL or INT
        #[arg(long, default_value = "TERM")]
        signal: String,

        #[arg(long)]
        dry_run: bool,
    },
    /// Inspect the orchestration ledger
    Ledger {
        #[command(subcommand)]
        command: LedgerCommands,
    },
    /// Run repeated cycles under the supervisor
    Loop(LoopArgs),
}

#[derive(Subcommand, Clone)]
pub enum LedgerCommands {
    /// Re-walk the hash chain
    Verify {
        #[arg(long)]
        json: bool,
    },
    /// Rebuild the cached summary for one run
    Materialize {
        #[arg(long)]
        run_id: String,
    },
}

async fn dispatch(cli: &Cli) -> Result<()> {
    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };

    match &cli.command {
        Commands::Run { goal, flags } => {
            cmd::cmd_run(cli, &project_dir, goal.as_deref(), flags).await
        }
        Commands::Status { json, watch } => {
            cmd::cmd_status(cli, &project_dir, *json, *watch).await
        }
        Commands::Cleanup {
            run_id,
            all,
            dry_run,
            prune_worktrees,
            prune_branches,
            stale_after,
        } => {
            let args = cmd::CleanupArgs {
                run_id: run_id.clone(),
                all: *all,
                dry_run: *dry_run,
                prune_worktrees: *prune_worktrees,
                prune_branches: *prune_branches,
                stale_after: stale_after.clone(),
            };
            cmd::cmd_cleanup(cli, &project_dir, &args).await
        }
        Commands::Cancel {
            run_id,
            all,
            signal,
            dry_run,
        } => {
            cmd::cmd_cancel(cli, &project_dir, run_id.as_deref(), *all, signal, *dry_run)
                .await
        }
        Commands::Ledger { command } => cmd::cmd_ledger(&project_dir, command),
        Commands::Loop(args) => cmd::cmd_loop(cli, &project_dir, args).await,
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            if matches!(e.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) {
                e.exit();
            }
            let _ = e.print();
            return ExitCode::from(EXIT_USAGE);
        }
    };

    let _guard = match logging::init(&LogOptions {
        verbose: cli.verbose,
        json: cli.log_json,
        file: cli.log_file.clone(),
    }) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Error: {e:#}");
            return ExitCode::from(EXIT_USAGE);
        }
    };

    match dispatch(&cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::from(exit_code(&e))
        }
    }
}
