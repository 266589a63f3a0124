//! System process table and signalling for `cancel`.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

use anyhow::{Context, Result, bail};
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use tokio::process::Command;

use crate::errors::ConfigError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessInfo {
    pub pid: i32,
    pub ppid: i32,
    pub command: String,
}

/// Parse `ps -axo pid=,ppid=,command=` output. Malformed lines are skipped.
pub fn parse_process_table(output: &str) -> Vec<ProcessInfo> {
    output
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let pid = fields.next()?.parse().ok()?;
            let ppid = fields.next()?.parse().ok()?;
            let command = fields.collect::<Vec<_>>().join(" ");
            (!command.is_empty()).then_some(ProcessInfo { pid, ppid, command })
        })
        .collect()
}

pub async fn list_processes() -> Result<Vec<ProcessInfo>> {
    let out = Command::new("ps")
        .args(["-axo", "pid=,ppid=,command="])
        .output()
        .await
        .context("Failed to list processes")?;
    if !out.status.success() {
        bail!(
            "list processes: ps exited with {}: {}",
            out.status,
            String::from_utf8_lossy(&out.stderr).trim()
        );
    }
    Ok(parse_process_table(&String::from_utf8_lossy(&out.stdout)))
}

pub fn process_exists(pid: i32, procs: &[ProcessInfo]) -> bool {
    procs.iter().any(|p| p.pid == pid)
}

/// Every descendant of `parent`, breadth first, returned sorted.
pub fn descendant_pids(parent: i32, procs: &[ProcessInfo]) -> Vec<i32> {
    let mut children: HashMap<i32, Vec<i32>> = HashMap::new();
    for p in procs {
        children.entry(p.ppid).or_default().push(p.pid);
    }

    let mut seen = HashSet::from([parent]);
    let mut queue = VecDeque::from([parent]);
    let mut out = BTreeSet::new();
    while let Some(pid) = queue.pop_front() {
        for &child in children.get(&pid).into_iter().flatten() {
            if seen.insert(child) {
                out.insert(child);
                queue.push_back(child);
            }
        }
    }
    out.into_iter().collect()
}

/// Sorted, deduplicated, and never PID 1 (or below) or our own PID.
pub fn filter_killable_pids(pids: &[i32], self_pid: i32) -> Vec<i32> {
    pids.iter()
        .copied()
        .filter(|&pid| pid > 1 && pid != self_pid)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

/// `TERM` (default), `KILL` or `INT`, with or without a `SIG` prefix.
pub fn parse_signal(raw: &str) -> Result<Signal, ConfigError> {
    let upper = raw.trim().to_uppercase();
    match upper.strip_prefix("SIG").unwrap_or(&upper) {
        "" | "TERM" => Ok(Signal::SIGTERM),
        "KILL" => Ok(Signal::SIGKILL),
        "INT" => Ok(Signal::SIGINT),
        _ => Err(ConfigError::InvalidSignal(raw.to_string())),
    }
}

/// Send `signal` to `pid`. A process that already exited is not an error.
pub fn send_signal(pid: i32, signal: Signal) -> Result<()> {
    match kill(Pid::from_raw(pid), signal) {
        Ok(()) | Err(nix::errno::Errno::ESRCH) => Ok(()),
        Err(e) => bail!("pid {pid}: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> Vec<ProcessInfo> {
        parse_process_table(
            "    1     0 /sbin/init\n  100     1 forge-rpi run\n  101   100 claude -p x\n  102   101 node worker\n  200     1 unrelated\n  bad line\n",
        )
    }

    #[test]
    fn test_parse_process_table() {
        let procs = table();
        assert_eq!(procs.len(), 5);
        assert_eq!(procs[2].command, "claude -p x");
        assert!(process_exists(102, &procs));
        assert!(!process_exists(999, &procs));
    }

    #[test]
    fn test_descendants_walk_whole_tree() {
        let procs = table();
        assert_eq!(descendant_pids(100, &procs), vec![101, 102]);
        assert!(descendant_pids(200, &procs).is_empty());
    }

    #[test]
    fn test_filter_excludes_init_and_self() {
        assert_eq!(filter_killable_pids(&[1, 0, 42, 7, 42, 300], 300), vec![7, 42]);
    }

    #[test]
    fn test_parse_signal() {
        assert_eq!(parse_signal("").unwrap(), Signal::SIGTERM);
        assert_eq!(parse_signal("sigkill").unwrap(), Signal::SIGKILL);
        assert_eq!(parse_signal(" INT ").unwrap(), Signal::SIGINT);
        let err = parse_signal("HUP").unwrap_err();
        assert_eq!(err.to_string(), "unsupported signal \"HUP\" (valid: TERM|KILL|INT)");
    }
}
