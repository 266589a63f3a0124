//! Ledger inspection: `forge-rpi ledger verify|materialize`.

use std::path::Path;

use anyhow::{Result, bail};
use console::style;

use forge_rpi::ledger::{self, VerifyResult, cache::run_cache_path, materialize_run_cache};

use super::super::LedgerCommands;
use super::run::resolve_run_root;

pub fn render_verify(result: &VerifyResult, path: &Path) -> String {
    if result.pass {
        format!(
            "{} {} record(s) verified ({})",
            style("Ledger OK:").green().bold(),
            result.record_count,
            path.display()
        )
    } else {
        format!(
            "{} record {} of {}: {}",
            style("Ledger FAIL at").red().bold(),
            result.first_broken_index.unwrap_or(0),
            result.record_count,
            result.message
        )
    }
}

/// The ledger lives at the repository root; any subdirectory resolves to it.
pub fn cmd_ledger(project_dir: &Path, command: &LedgerCommands) -> Result<()> {
    let root = resolve_run_root(project_dir);
    match command {
        LedgerCommands::Verify { json } => {
            let result = ledger::verify_file(&root)?;
            if *json {
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                println!("{}", render_verify(&result, &ledger::ledger_path(&root)));
            }
            if !result.pass {
                bail!("ledger verification failed");
            }
        }
        LedgerCommands::Materialize { run_id } => match materialize_run_cache(&root, run_id)? {
            Some(cache) => println!(
                "Run cache written: {} ({} event(s), latest: {})",
                run_cache_path(&root, run_id).display(),
                cache.event_count,
                cache.latest.action
            ),
            None => bail!("no ledger events for run {run_id}"),
        },
    }
    Ok(())
}
