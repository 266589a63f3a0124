//! Gate verdicts read from council reports the agent writes under
//! `.agents/council/`.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use anyhow::{Context, Result, bail};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::errors::OrchestratorError;
use crate::util::extract_json_object;

/// Findings carried into a retry prompt.
pub const MAX_FINDINGS: usize = 5;

static VERDICT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^## Council Verdict:\s*(PASS|WARN|FAIL)").expect("valid verdict regex")
});

static FINDING_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)FINDING:\s*(.+?)\s*\|\s*FIX:\s*(.+?)\s*\|\s*REF:\s*(.+?)$")
        .expect("valid finding regex")
});

static NUMBERED_FINDING_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^\d+\.\s+\*\*(.+?)\*\*\s*[—–-]\s*(.+)$").expect("valid numbered finding regex")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Verdict {
    Pass,
    Warn,
    Fail,
}

impl Verdict {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_uppercase().as_str() {
            "PASS" => Some(Verdict::Pass),
            "WARN" => Some(Verdict::Warn),
            "FAIL" => Some(Verdict::Fail),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Verdict::Pass => "PASS",
            Verdict::Warn => "WARN",
            Verdict::Fail => "FAIL",
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Finding {
    pub description: String,
    pub fix: String,
    #[serde(rename = "ref")]
    pub reference: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GateReport {
    pub path: PathBuf,
    pub verdict: Verdict,
    pub findings: Vec<Finding>,
}

#[derive(Debug, Deserialize)]
struct JsonReport {
    verdict: String,
    #[serde(default)]
    findings: Vec<Finding>,
}

/// A gate that did not pass. `verdict` is a council verdict or a tracker
/// status such as `BLOCKED`.
#[derive(Debug, Clone, PartialEq)]
pub struct GateFailure {
    pub phase: u32,
    pub verdict: String,
    pub findings: Vec<Finding>,
    pub report: String,
}

impl From<GateFailure> for OrchestratorError {
    fn from(g: GateFailure) -> Self {
        OrchestratorError::GateFailed {
            phase: g.phase,
            verdict: g.verdict,
            report: g.report,
        }
    }
}

pub fn council_dir(root: &Path) -> PathBuf {
    root.join(".agents").join("council")
}

/// Latest report whose file name contains `kind`, by file name. Names that
/// also contain `epic_id` win when any exist.
pub fn find_latest_council_report(root: &Path, kind: &str, epic_id: &str) -> Option<PathBuf> {
    let dir = council_dir(root);
    let pattern = format!(
        "{}/*{}*",
        glob::Pattern::escape(&dir.to_string_lossy()),
        glob::Pattern::escape(kind)
    );
    let mut all: Vec<PathBuf> = glob::glob(&pattern)
        .ok()?
        .flatten()
        .filter(|p| p.is_file())
        .filter(|p| {
            matches!(
                p.extension().and_then(|e| e.to_str()),
                Some("md") | Some("json")
            )
        })
        .collect();

    let file_name = |p: &PathBuf| {
        p.file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default()
    };
    if !epic_id.is_empty() && all.iter().any(|p| file_name(p).contains(epic_id)) {
        all.retain(|p| file_name(p).contains(epic_id));
    }
    all.sort_by_key(file_name);
    all.pop()
}

fn parse_json_report(text: &str, path: &Path) -> Result<(Verdict, Vec<Finding>)> {
    let report: JsonReport = serde_json::from_str(text)
        .with_context(|| format!("Failed to parse council report {}", path.display()))?;
    let Some(verdict) = Verdict::parse(&report.verdict) else {
        bail!("no verdict found in {}", path.display());
    };
    Ok((verdict, report.findings))
}

fn markdown_findings(text: &str, path: &Path) -> Vec<Finding> {
    let structured: Vec<Finding> = FINDING_RE
        .captures_iter(text)
        .map(|c| Finding {
            description: c[1].to_string(),
            fix: c[2].to_string(),
            reference: c[3].to_string(),
        })
        .collect();
    if !structured.is_empty() {
        return structured;
    }
    NUMBERED_FINDING_RE
        .captures_iter(text)
        .map(|c| Finding {
            description: format!("{}: {}", &c[1], &c[2]),
            fix: "See council report".to_string(),
            reference: path.display().to_string(),
        })
        .collect()
}

/// Read a markdown or JSON council report. At most `max_findings` are kept.
pub fn read_gate_report(path: &Path, max_findings: usize) -> Result<GateReport> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read council report {}", path.display()))?;

    let is_json = path.extension().and_then(|e| e.to_str()) == Some("json");
    let (verdict, mut findings) = if is_json {
        parse_json_report(&text, path)?
    } else if let Some(caps) = VERDICT_RE.captures(&text) {
        let verdict = Verdict::parse(&caps[1]).unwrap_or(Verdict::Fail);
        (verdict, markdown_findings(&text, path))
    } else if let Some(embedded) = extract_json_object(&text) {
        parse_json_report(&embedded, path)?
    } else {
        bail!("no verdict found in {}", path.display());
    };

    findings.truncate(max_findings);
    Ok(GateReport {
        path: path.to_path_buf(),
        verdict,
        findings,
    })
}
