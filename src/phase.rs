//! The three fixed RPI phases.
//!
//! Phases are compile-time constants: discovery (1), implementation (2) and
//! validation (3). `--from` accepts their names, the legacy step aliases and
//! the bare phase number.

use std::fmt;

use crate::errors::ConfigError;

/// One stage of the workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Phase {
    pub num: u32,
    pub name: &'static str,
    /// Underlying step alias used in prompts and logs.
    pub step: &'static str,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

pub const DISCOVERY: Phase = Phase {
    num: 1,
    name: "discovery",
    step: "research",
};

pub const IMPLEMENTATION: Phase = Phase {
    num: 2,
    name: "implementation",
    step: "implement",
};

pub const VALIDATION: Phase = Phase {
    num: 3,
    name: "validation",
    step: "validate",
};

/// All phases in execution order.
pub const PHASES: [Phase; 3] = [DISCOVERY, IMPLEMENTATION, VALIDATION];

/// Phase number of the last phase; a run at this phase (or beyond) is complete.
pub const COMPLETED_PHASE: u32 = 3;

pub fn phase_by_num(num: u32) -> Option<Phase> {
    PHASES.iter().copied().find(|p| p.num == num)
}

/// Name for a phase number, or "unknown".
pub fn phase_name(num: u32) -> &'static str {
    phase_by_num(num).map(|p| p.name).unwrap_or("unknown")
}

/// Resolve a `--from` value to a phase number.
pub fn phase_name_to_num(value: &str) -> Result<u32, ConfigError> {
    let normalized = value.trim().to_lowercase();
    let num = match normalized.as_str() {
        "" | "discovery" | "research" | "plan" | "pre-mortem" | "1" => 1,
        "implementation" | "crank" | "implement" | "2" => 2,
        "validation" | "vibe" | "post-mortem" | "validate" | "3" => 3,
        _ => return Err(ConfigError::UnknownPhase(value.to_string())),
    };
    Ok(num)
}
