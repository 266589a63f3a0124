//! Append-only, hash-chained event ledger.
//!
//! Every orchestration transition is appended as one JSON line to
//! `.agents/ledger/rpi-events.jsonl`. Each record carries:
//! - `payload_hash`: SHA-256 over the canonical JSON payload
//!   (`schema_version`, `event_id`, `run_id`, `ts`, `phase`, `action`,
//!   `details`, `prev_hash`)
//! - `hash`: SHA-256 over `payload_hash + "\n" + prev_hash`
//!
//! The first record has an empty `prev_hash`. Verification re-walks the
//! chain and stops at the first broken record. The per-run cache in
//! [`cache`] is derived from the chain and can always be rebuilt.

pub mod cache;

pub use cache::{RunCache, materialize_run_cache};

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, SecondsFormat, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::errors::LedgerError;

pub const SCHEMA_VERSION: u32 = 1;
pub const LEDGER_RELATIVE_PATH: &str = ".agents/ledger/rpi-events.jsonl";

/// An event to append.
#[derive(Debug, Clone, PartialEq)]
pub struct LedgerEvent {
    pub run_id: String,
    pub phase: String,
    pub action: String,
    pub details: Value,
}

/// One immutable line of the ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerRecord {
    #[serde(default)]
    pub schema_version: u32,
    #[serde(default)]
    pub event_id: String,
    #[serde(default)]
    pub run_id: String,
    #[serde(default)]
    pub ts: String,
    #[serde(default)]
    pub phase: String,
    #[serde(default)]
    pub action: String,
    #[serde(default)]
    pub details: Value,
    #[serde(default)]
    pub prev_hash: String,
    #[serde(default)]
    pub payload_hash: String,
    #[serde(default)]
    pub hash: String,
}

#[derive(Serialize)]
struct Payload<'a> {
    schema_version: u32,
    event_id: &'a str,
    run_id: &'a str,
    ts: &'a str,
    phase: &'a str,
    action: &'a str,
    details: &'a Value,
    prev_hash: &'a str,
}

/// Machine-readable verification outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerifyResult {
    pub pass: bool,
    pub record_count: usize,
    /// 1-based index of the first broken record.
    pub first_broken_index: Option<usize>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
}

pub fn ledger_path(root: &Path) -> PathBuf {
    root.join(LEDGER_RELATIVE_PATH)
}

fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// `null` details become `{}`.
fn normalize_details(details: Value) -> Value {
    match details {
        Value::Null => Value::Object(serde_json::Map::new()),
        other => other,
    }
}

fn new_event_id() -> String {
    format!("evt-{}", uuid::Uuid::new_v4().simple())
}

/// Compute `(payload_hash, hash)` for a record's content.
pub fn compute_hashes(record: &LedgerRecord) -> Result<(String, String), LedgerError> {
    let details = normalize_details(record.details.clone());
    let payload = Payload {
        schema_version: record.schema_version,
        event_id: &record.event_id,
        run_id: &record.run_id,
        ts: &record.ts,
        phase: &record.phase,
        action: &record.action,
        details: &details,
        prev_hash: &record.prev_hash,
    };
    let bytes = serde_json::to_vec(&payload)?;
    let payload_hash = sha256_hex(&bytes);
    let hash = sha256_hex(format!("{}\n{}", payload_hash, record.prev_hash).as_bytes());
    Ok((payload_hash, hash))
}

fn require(value: &str, field: &'static str) -> Result<(), LedgerError> {
    if value.trim().is_empty() {
        Err(LedgerError::MissingField(field))
    } else {
        Ok(())
    }
}

/// Append one event under an exclusive lock, fsyncing file and directory.
pub fn append_event(root: &Path, event: LedgerEvent) -> Result<LedgerRecord, LedgerError> {
    require(&event.run_id, "run_id")?;
    require(&event.phase, "phase")?;
    require(&event.action, "action")?;

    let path = ledger_path(root);
    let dir = path.parent().unwrap_or(root).to_path_buf();
    fs::create_dir_all(&dir)?;

    let mut lock_name = path.clone().into_os_string();
    lock_name.push(".lock");
    let lock = OpenOptions::new()
        .create(true)
        .truncate(false)
        .read(true)
        .write(true)
        .open(PathBuf::from(lock_name))?;
    lock.lock_exclusive()?;

    let result = append_locked(&path, &dir, event);
    let _ = FileExt::unlock(&lock);
    result
}

fn append_locked(path: &Path, dir: &Path, event: LedgerEvent) -> Result<LedgerRecord, LedgerError> {
    let mut file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .read(true)
        .append(true)
        .open(path)?;

    let prev_hash = read_last_hash(&mut file)?;
    let mut record = LedgerRecord {
        schema_version: SCHEMA_VERSION,
        event_id: new_event_id(),
        run_id: event.run_id,
        ts: Utc::now().to_rfc3339_opts(SecondsFormat::Nanos, true),
        phase: event.phase,
        action: event.action,
        details: normalize_details(event.details),
        prev_hash,
        payload_hash: String::new(),
        hash: String::new(),
    };
    let (payload_hash, hash) = compute_hashes(&record)?;
    record.payload_hash = payload_hash;
    record.hash = hash;

    let mut line = serde_json::to_vec(&record)?;
    line.push(b'\n');
    file.write_all(&line)?;
    file.sync_all()?;
    sync_directory(dir)?;

    tracing::debug!(run_id = %record.run_id, action = %record.action, "ledger append");
    Ok(record)
}

fn read_last_hash(file: &mut File) -> Result<String, LedgerError> {
    file.seek(SeekFrom::Start(0))?;
    let mut last = String::new();
    for (idx, line) in BufReader::new(&*file).lines().enumerate() {
        let line = line?;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let record: LedgerRecord =
            serde_json::from_str(trimmed).map_err(|e| LedgerError::Malformed {
                line: idx + 1,
                message: e.to_string(),
            })?;
        last = record.hash;
    }
    Ok(last)
}

pub(crate) fn sync_directory(dir: &Path) -> Result<(), LedgerError> {
    let handle = File::open(dir)?;
    match handle.sync_all() {
        Ok(()) => Ok(()),
        // Some filesystems refuse fsync on directories.
        Err(e) if e.kind() == std::io::ErrorKind::InvalidInput => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Load every record in append order. A missing ledger is empty.
pub fn load_records(root: &Path) -> Result<Vec<LedgerRecord>, LedgerError> {
    let path = ledger_path(root);
    let file = match File::open(&path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut records = Vec::new();
    for (idx, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let record = serde_json::from_str(trimmed).map_err(|e| LedgerError::Malformed {
            line: idx + 1,
            message: e.to_string(),
        })?;
        records.push(record);
    }
    Ok(records)
}

fn validate_record(record: &LedgerRecord) -> Result<(), String> {
    if record.schema_version != SCHEMA_VERSION {
        return Err(format!(
            "unsupported schema_version: got {} want {}",
            record.schema_version, SCHEMA_VERSION
        ));
    }
    let fields = [
        (&record.event_id, "event_id"),
        (&record.run_id, "run_id"),
        (&record.phase, "phase"),
        (&record.action, "action"),
        (&record.ts, "ts"),
        (&record.payload_hash, "payload_hash"),
        (&record.hash, "hash"),
    ];
    for (value, name) in fields {
        if value.trim().is_empty() {
            return Err(format!("missing field: {name}"));
        }
    }
    let parsed = DateTime::parse_from_rfc3339(&record.ts)
        .map_err(|e| format!("invalid ts: {e}"))?;
    if parsed.offset().local_minus_utc() != 0 || !record.ts.ends_with('Z') {
        return Err("invalid ts: must be UTC RFC3339 with Z suffix".to_string());
    }
    Ok(())
}

/// Re-walk the chain and report the first broken record.
pub fn verify_chain(records: &[LedgerRecord]) -> VerifyResult {
    let mut result = VerifyResult {
        pass: true,
        record_count: records.len(),
        first_broken_index: None,
        message: String::new(),
    };

    let mut prev_hash = String::new();
    for (i, record) in records.iter().enumerate() {
        let failure = if let Err(msg) = validate_record(record) {
            Some(msg)
        } else if record.prev_hash != prev_hash {
            Some(format!(
                "prev_hash mismatch: got {:?} want {:?}",
                record.prev_hash, prev_hash
            ))
        } else {
            match compute_hashes(record) {
                Err(e) => Some(e.to_string()),
                Ok((payload_hash, _)) if payload_hash != record.payload_hash => {
                    Some("payload_hash mismatch".to_string())
                }
                Ok((_, hash)) if hash != record.hash => Some("hash mismatch".to_string()),
                Ok(_) => None,
            }
        };

        if let Some(message) = failure {
            result.pass = false;
            result.first_broken_index = Some(i + 1);
            result.message = message;
            return result;
        }
        prev_hash = record.hash.clone();
    }
    result
}

/// Verify the on-disk ledger. Chain breaks are reported in the result; only I/O
/// and decode failures are errors.
pub fn verify_file(root: &Path) -> Result<VerifyResult, LedgerError> {
    let records = load_records(root)?;
    Ok(verify_chain(&records))
}

/// Map a free-form orchestration log detail to a ledger action.
pub fn action_from_details(details: &str) -> String {
    let normalized = details.trim().to_lowercase();
    if normalized.is_empty() {
        return "event".to_string();
    }
    let prefixes = [
        ("started", "started"),
        ("completed", "completed"),
        ("failed:", "failed"),
        ("fatal:", "fatal"),
        ("retry", "retry"),
        ("dry-run", "dry-run"),
        ("handoff", "handoff"),
        ("epic=", "summary"),
    ];
    for (prefix, action) in prefixes {
        if normalized.starts_with(prefix) {
            return action.to_string();
        }
    }
    let first = normalized
        .split_whitespace()
        .next()
        .unwrap_or("")
        .trim_matches(':');
    if first.is_empty() {
        "event".to_string()
    } else {
        first.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    fn event(run_id: &str, phase: &str, action: &str) -> LedgerEvent {
        LedgerEvent {
            run_id: run_id.to_string(),
            phase: phase.to_string(),
            action: action.to_string(),
            details: json!({"details": format!("{action} detail")}),
        }
    }

    fn rewrite(root: &Path, records: &[LedgerRecord]) {
        let mut out = String::new();
        for r in records {
            out.push_str(&serde_json::to_string(r).unwrap());
            out.push('\n');
        }
        fs::write(ledger_path(root), out).unwrap();
    }

    #[test]
    fn test_append_builds_chain() {
        let dir = tempdir().unwrap();
        for i in 0..4 {
            append_event(dir.path(), event("abc123def456", "discovery", &format!("step{i}")))
                .unwrap();
        }
        let records = load_records(dir.path()).unwrap();
        assert_eq!(records.len(), 4);
        assert_eq!(records[0].prev_hash, "");
        for i in 1..records.len() {
            assert_eq!(records[i].prev_hash, records[i - 1].hash);
        }
        assert!(records.iter().all(|r| r.event_id.starts_with("evt-") && r.event_id.len() == 36));
        assert!(records.iter().all(|r| r.ts.ends_with('Z')));

        let result = verify_file(dir.path()).unwrap();
        assert!(result.pass);
        assert_eq!(result.record_count, 4);
        assert_eq!(result.first_broken_index, None);
    }

    #[test]
    fn test_append_rejects_missing_fields() {
        let dir = tempdir().unwrap();
        let err = append_event(dir.path(), event("", "discovery", "started")).unwrap_err();
        assert!(matches!(err, LedgerError::MissingField("run_id")));
        let err = append_event(dir.path(), event("r1", " ", "started")).unwrap_err();
        assert!(matches!(err, LedgerError::MissingField("phase")));
        assert!(!ledger_path(dir.path()).exists());
    }

    #[test]
    fn test_null_details_normalized_to_empty_object() {
        let dir = tempdir().unwrap();
        let mut ev = event("r1", "discovery", "started");
        ev.details = Value::Null;
        let record = append_event(dir.path(), ev).unwrap();
        assert_eq!(record.details, json!({}));
    }

    #[test]
    fn test_tampered_details_break_at_that_record() {
        let dir = tempdir().unwrap();
        for i in 0..5 {
            append_event(dir.path(), event("r1", "implementation", &format!("a{i}"))).unwrap();
        }
        let mut records = load_records(dir.path()).unwrap();
        records[2].details = json!({"details": "forged"});
        rewrite(dir.path(), &records);

        let result = verify_file(dir.path()).unwrap();
        assert!(!result.pass);
        assert_eq!(result.first_broken_index, Some(3));
        assert_eq!(result.message, "payload_hash mismatch");
    }

    #[test]
    fn test_relinked_record_reports_prev_hash_mismatch() {
        let dir = tempdir().unwrap();
        for i in 0..3 {
            append_event(dir.path(), event("r1", "validation", &format!("a{i}"))).unwrap();
        }
        let mut records = load_records(dir.path()).unwrap();
        records[1].prev_hash = "deadbeef".to_string();
        let result = verify_chain(&records);
        assert!(!result.pass);
        assert_eq!(result.first_broken_index, Some(2));
        assert!(result.message.starts_with("prev_hash mismatch"));
    }

    #[test]
    fn test_forged_hash_reports_hash_mismatch() {
        let dir = tempdir().unwrap();
        append_event(dir.path(), event("r1", "discovery", "started")).unwrap();
        let mut records = load_records(dir.path()).unwrap();
        records[0].hash = "0".repeat(64);
        let result = verify_chain(&records);
        assert_eq!(result.first_broken_index, Some(1));
        assert_eq!(result.message, "hash mismatch");
    }

    #[test]
    fn test_schema_and_timestamp_validation() {
        let dir = tempdir().unwrap();
        append_event(dir.path(), event("r1", "discovery", "started")).unwrap();
        let records = load_records(dir.path()).unwrap();

        let mut bad_schema = records.clone();
        bad_schema[0].schema_version = 2;
        assert!(verify_chain(&bad_schema).message.contains("unsupported schema_version"));

        let mut bad_ts = records.clone();
        bad_ts[0].ts = "yesterday".to_string();
        assert!(verify_chain(&bad_ts).message.starts_with("invalid ts"));

        let mut missing = records;
        missing[0].event_id.clear();
        assert_eq!(verify_chain(&missing).message, "missing field: event_id");
    }

    #[test]
    fn test_empty_ledger_passes() {
        let dir = tempdir().unwrap();
        let result = verify_file(dir.path()).unwrap();
        assert!(result.pass);
        assert_eq!(result.record_count, 0);
    }

    #[test]
    fn test_malformed_line_is_an_error() {
        let dir = tempdir().unwrap();
        let path = ledger_path(dir.path());
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, "{not json}\n").unwrap();
        let err = load_records(dir.path()).unwrap_err();
        assert!(matches!(err, LedgerError::Malformed { line: 1, .. }));
    }

    #[test]
    fn test_action_from_details() {
        assert_eq!(action_from_details("started"), "started");
        assert_eq!(action_from_details("completed in 12s"), "completed");
        assert_eq!(action_from_details("FAILED: boom"), "failed");
        assert_eq!(action_from_details("fatal: gate"), "fatal");
        assert_eq!(action_from_details("RETRY attempt 1/3"), "retry");
        assert_eq!(action_from_details("dry-run"), "dry-run");
        assert_eq!(action_from_details("HANDOFF detected"), "handoff");
        assert_eq!(action_from_details("epic=ag-1 verdicts=map[]"), "summary");
        assert_eq!(action_from_details("resumed: from 2"), "resumed");
        assert_eq!(action_from_details("   "), "event");
    }
}
