//! Diagnostic tracing for the orchestrator.
//!
//! # Separation of Concerns
//!
//! - **Tracing (this module)**: developer diagnostics filtered by `RUST_LOG`,
//!   written to stderr and optionally to a log file. Never part of the run
//!   artifacts.
//! - **Orchestration log and ledger** (`orchestrator::artifacts`, `ledger`):
//!   product artifacts under `.agents/`, always written, unaffected by
//!   `RUST_LOG`.

use std::path::Path;

use anyhow::{Context, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, Layer, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Logging options resolved from global CLI flags.
#[derive(Debug, Clone, Default)]
pub struct LogOptions {
    pub verbose: bool,
    pub json: bool,
    pub file: Option<std::path::PathBuf>,
}

/// Keeps the non-blocking file writer alive; drop it at process exit.
pub struct LogGuard {
    _file: Option<WorkerGuard>,
}

fn env_filter(verbose: bool) -> EnvFilter {
    let default = if verbose { "debug" } else { "warn" };
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default))
}

/// Initialize the global subscriber.
///
/// Reads `RUST_LOG`; defaults to `warn` (`debug` with `--verbose`). Stderr
/// output is compact unless `json` is set. A file layer is added when
/// `file` is given and always uses JSON lines.
pub fn init(opts: &LogOptions) -> Result<LogGuard> {
    let stderr_layer = if opts.json {
        fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .with_target(true)
            .boxed()
    } else {
        fmt::layer()
            .with_writer(std::io::stderr)
            .compact()
            .boxed()
    };

    let (file_layer, guard) = match &opts.file {
        Some(path) => {
            let (dir, name) = split_log_path(path)?;
            std::fs::create_dir_all(&dir)
                .with_context(|| format!("Failed to create log directory {}", dir.display()))?;
            let appender = tracing_appender::rolling::never(&dir, name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .json()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(true)
                .boxed();
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    // A second init (tests, embedding) keeps the first subscriber.
    let _ = tracing_subscriber::registry()
        .with(env_filter(opts.verbose))
        .with(stderr_layer)
        .with(file_layer)
        .try_init();

    Ok(LogGuard { _file: guard })
}

fn split_log_path(path: &Path) -> Result<(std::path::PathBuf, std::ffi::OsString)> {
    let name = path
        .file_name()
        .with_context(|| format!("Log file path has no file name: {}", path.display()))?
        .to_os_string();
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| std::path::PathBuf::from("."));
    Ok((dir, name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_log_path() {
        let (dir, name) = split_log_path(Path::new("logs/rpi.log")).unwrap();
        assert_eq!(dir, Path::new("logs"));
        assert_eq!(name, "rpi.log");

        let (dir, _) = split_log_path(Path::new("rpi.log")).unwrap();
        assert_eq!(dir, Path::new("."));
    }

    #[test]
    fn test_split_log_path_rejects_directory_only() {
        assert!(split_log_path(Path::new("/")).is_err());
    }
}
