//! Cancel live runs: `forge-rpi cancel`.

use std::path::Path;

use anyhow::Result;
use dialoguer::Confirm;

use forge_rpi::config::Config;
use forge_rpi::errors::UserAbort;
use forge_rpi::registry::RegistryOptions;
use forge_rpi::registry::cancel::{self, CancelOptions};
use forge_rpi::registry::process::parse_signal;

use super::super::Cli;

/// `--all` signals everything this checkout knows about, so it asks first
/// unless `--yes` or `--dry-run` is given or stdin is not a terminal.
fn confirm_all(cli: &Cli, dry_run: bool) -> Result<()> {
    if cli.yes || dry_run || !console::user_attended() {
        return Ok(());
    }
    let proceed = Confirm::new()
        .with_prompt("Cancel ALL active runs and the supervisor?")
        .default(false)
        .interact()?;
    if !proceed {
        return Err(UserAbort.into());
    }
    Ok(())
}

pub async fn cmd_cancel(
    cli: &Cli,
    project_dir: &Path,
    run_id: Option<&str>,
    all: bool,
    signal: &str,
    dry_run: bool,
) -> Result<()> {
    let signal = parse_signal(signal)?;
    let config = Config::load(project_dir, cli.verbose, cli.yes)?;
    if all {
        confirm_all(cli, dry_run)?;
    }

    let opts = CancelOptions {
        run_id: run_id.map(str::to_string),
        all,
        signal,
        dry_run,
        registry: RegistryOptions::from_config(&config),
    };
    let targets = cancel::execute(&config.project_dir, &opts).await?;
    if !dry_run && !targets.is_empty() {
        println!("Cancelled {} target(s).", targets.len());
    }
    Ok(())
}
