//! Derived per-run cache materialized from the ledger.

use std::path::{Path, PathBuf};

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use super::{LedgerRecord, load_records, verify_chain};
use crate::errors::LedgerError;
use crate::util::atomic_write;

/// `.agents/rpi/runs/<run_id>.json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunCache {
    pub run_id: String,
    pub event_count: usize,
    pub latest: LedgerRecord,
    pub updated_at: String,
}

pub fn run_cache_path(root: &Path, run_id: &str) -> PathBuf {
    root.join(".agents")
        .join("rpi")
        .join("runs")
        .join(format!("{run_id}.json"))
}

fn validate_run_id(run_id: &str) -> Result<(), LedgerError> {
    if run_id.trim().is_empty() {
        return Err(LedgerError::MissingField("run_id"));
    }
    if run_id.contains('/') || run_id.contains('\\') || run_id.contains("..") {
        return Err(LedgerError::InvalidRunId(run_id.to_string()));
    }
    Ok(())
}

/// Rebuild the cache for `run_id`. The chain is verified first; a broken
/// chain leaves any existing cache untouched.
///
/// Returns `Ok(None)` when the ledger holds no events for the run.
pub fn materialize_run_cache(root: &Path, run_id: &str) -> Result<Option<RunCache>, LedgerError> {
    validate_run_id(run_id)?;

    let records = load_records(root)?;
    let verdict = verify_chain(&records);
    if !verdict.pass {
        return Err(LedgerError::Integrity {
            index: verdict.first_broken_index.unwrap_or(0),
            message: verdict.message,
        });
    }

    let mut latest = None;
    let mut count = 0;
    for record in records.into_iter().filter(|r| r.run_id == run_id) {
        count += 1;
        latest = Some(record);
    }
    let Some(latest) = latest else {
        return Ok(None);
    };

    let cache = RunCache {
        run_id: run_id.to_string(),
        event_count: count,
        latest,
        updated_at: Utc::now().to_rfc3339_opts(SecondsFormat::Nanos, true),
    };
    let mut bytes = serde_json::to_vec_pretty(&cache)?;
    bytes.push(b'\n');
    let path = run_cache_path(root, run_id);
    atomic_write(&path, &bytes)?;
    Ok(Some(cache))
}
