//! Single-flight supervisor lease.
//!
//! The lease is an exclusive, non-blocking `flock` on
//! `.agents/rpi/supervisor.lock` plus JSON metadata written into the same
//! file. The lock is what excludes a second supervisor; the metadata lets
//! `cancel` find the holder and lets readers treat an abandoned file as free
//! once `expires_at` passes. A background task renews the expiry every
//! third of the TTL until the lease is released.

use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::errors::SupervisorError;
use crate::orchestrator::state::rpi_dir;

pub const LEASE_FILE: &str = "supervisor.lock";
pub const DEFAULT_LEASE_TTL: Duration = Duration::from_secs(120);

pub fn default_lease_path(root: &Path) -> PathBuf {
    rpi_dir(root).join(LEASE_FILE)
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LeaseMetadata {
    #[serde(default)]
    pub run_id: String,
    #[serde(default)]
    pub pid: i32,
    #[serde(default)]
    pub host: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub cwd: String,
    #[serde(default)]
    pub acquired_at: String,
    #[serde(default)]
    pub renewed_at: String,
    #[serde(default)]
    pub expires_at: String,
}

/// Blank expiry means the writer predates expiry tracking and is not
/// expired; an unparseable expiry is treated as expired.
pub fn lease_expired(meta: &LeaseMetadata, now: DateTime<Utc>) -> bool {
    let raw = meta.expires_at.trim();
    if raw.is_empty() {
        return false;
    }
    match DateTime::parse_from_rfc3339(raw) {
        Ok(expiry) => now > expiry.with_timezone(&Utc),
        Err(_) => true,
    }
}

/// Missing or unparseable lease files read as `None`.
pub fn read_lease(path: &Path) -> Option<LeaseMetadata> {
    let data = std::fs::read(path).ok()?;
    serde_json::from_slice(&data).ok()
}

fn holder_hint(path: &Path) -> String {
    match read_lease(path) {
        Some(meta) if !meta.run_id.is_empty() => format!(
            "run={} pid={} host={} renewed_at={}",
            meta.run_id, meta.pid, meta.host, meta.renewed_at
        ),
        _ => format!("lock={}", path.display()),
    }
}

fn ts(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn hostname() -> String {
    nix::unistd::gethostname()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_default()
}

struct LeaseFile {
    file: File,
    meta: LeaseMetadata,
    ttl: Duration,
}

impl LeaseFile {
    fn write_metadata(&mut self, now: DateTime<Utc>, expires: DateTime<Utc>) -> std::io::Result<()> {
        self.meta.renewed_at = ts(now);
        self.meta.expires_at = ts(expires);
        let mut data = serde_json::to_vec_pretty(&self.meta)?;
        data.push(b'\n');
        self.file.set_len(0)?;
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(&data)?;
        self.file.sync_all()
    }

    fn renew(&mut self) -> std::io::Result<()> {
        let now = Utc::now();
        let ttl = chrono::Duration::from_std(self.ttl).unwrap_or(chrono::Duration::seconds(120));
        self.write_metadata(now, now + ttl)
    }
}

/// A held lease. Release it explicitly; dropping stops renewal and the OS
/// drops the lock when the file closes.
pub struct SupervisorLease {
    path: PathBuf,
    run_id: String,
    inner: Arc<Mutex<LeaseFile>>,
    cancel: CancellationToken,
    renewal: Option<JoinHandle<()>>,
}

impl SupervisorLease {
    /// Take the lease or fail with [`SupervisorError::LeaseHeld`] naming the
    /// current holder. Must be called inside a tokio runtime.
    pub fn acquire(path: &Path, ttl: Duration, run_id: &str) -> Result<Self, SupervisorError> {
        let ttl = if ttl.is_zero() { DEFAULT_LEASE_TTL } else { ttl };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(path)?;

        if let Err(e) = file.try_lock_exclusive() {
            let contended = fs2::lock_contended_error().raw_os_error();
            if e.kind() == ErrorKind::WouldBlock || e.raw_os_error() == contended {
                return Err(SupervisorError::LeaseHeld {
                    holder: holder_hint(path),
                });
            }
            return Err(e.into());
        }

        let now = Utc::now();
        let meta = LeaseMetadata {
            run_id: run_id.to_string(),
            pid: std::process::id() as i32,
            host: hostname(),
            cwd: std::env::current_dir()
                .map(|p| p.display().to_string())
                .unwrap_or_default(),
            acquired_at: ts(now),
            ..Default::default()
        };
        let mut lease_file = LeaseFile { file, meta, ttl };
        if let Err(e) = lease_file.renew() {
            let _ = FileExt::unlock(&lease_file.file);
            return Err(e.into());
        }
        tracing::info!(path = %path.display(), run_id, ttl_secs = ttl.as_secs(), "supervisor lease acquired");

        let inner = Arc::new(Mutex::new(lease_file));
        let cancel = CancellationToken::new();
        let renewal = tokio::spawn(renew_loop(inner.clone(), cancel.clone(), ttl / 3));
        Ok(Self {
            path: path.to_path_buf(),
            run_id: run_id.to_string(),
            inner,
            cancel,
            renewal: Some(renewal),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Stop renewal, mark the metadata expired and unlock.
    pub async fn release(mut self) -> Result<(), SupervisorError> {
        self.cancel.cancel();
        if let Some(handle) = self.renewal.take() {
            let _ = handle.await;
        }
        expire_and_unlock(&self.inner)?;
        tracing::debug!(path = %self.path.display(), "supervisor lease released");
        Ok(())
    }
}

impl Drop for SupervisorLease {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn renew_loop(inner: Arc<Mutex<LeaseFile>>, cancel: CancellationToken, every: Duration) {
    let every = every.max(Duration::from_secs(1));
    let mut ticker = tokio::time::interval(every);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => renew_now(&inner),
        }
    }
}

fn expire_and_unlock(inner: &Mutex<LeaseFile>) -> std::io::Result<()> {
    let mut guard = inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    let now = Utc::now();
    if let Err(e) = guard.write_metadata(now, now) {
        tracing::warn!(error = %e, "could not expire lease metadata");
    }
    FileExt::unlock(&guard.file)
}

fn renew_now(inner: &Mutex<LeaseFile>) {
    let mut guard = inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    if let Err(e) = guard.renew() {
        tracing::warn!(error = %e, "lease renewal failed");
    }
}
