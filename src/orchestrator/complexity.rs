//! Goal complexity scoring. The level shapes prompts and whether a fast-path
//! run skips validation; it never changes the phase order.

use std::fmt;

use regex::Regex;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComplexityLevel {
    Fast,
    Standard,
    Full,
}

impl fmt::Display for ComplexityLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ComplexityLevel::Fast => "fast",
            ComplexityLevel::Standard => "standard",
            ComplexityLevel::Full => "full",
        })
    }
}

/// Words suggesting the goal spans many files.
const SCOPE_KEYWORDS: &[&str] = &[
    "all",
    "entire",
    "across",
    "everywhere",
    "every file",
    "every module",
    "system-wide",
    "systemwide",
    "global",
    "throughout",
    "codebase",
];

/// Rewrite-class operations.
const COMPLEX_KEYWORDS: &[&str] = &[
    "refactor",
    "migrate",
    "migration",
    "rewrite",
    "redesign",
    "rearchitect",
    "overhaul",
    "restructure",
    "reorganize",
    "decouple",
    "deprecate",
    "split",
    "extract module",
    "port",
];

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ComplexityScore {
    pub length: usize,
    pub scope_keywords: usize,
    pub complex_keywords: usize,
}

/// Whole-word, case-insensitive match; `support` does not contain `port`.
fn contains_whole_word(text: &str, keyword: &str) -> bool {
    let pattern = format!(r"(?i)\b{}\b", regex::escape(keyword));
    match Regex::new(&pattern) {
        Ok(re) => re.is_match(text),
        Err(_) => text.contains(keyword),
    }
}

pub fn score_goal(goal: &str) -> ComplexityScore {
    let lower = goal.trim().to_lowercase();
    let count = |keywords: &[&str]| {
        keywords
            .iter()
            .filter(|kw| contains_whole_word(&lower, kw))
            .count()
    };
    ComplexityScore {
        length: lower.chars().count(),
        scope_keywords: count(SCOPE_KEYWORDS),
        complex_keywords: count(COMPLEX_KEYWORDS),
    }
}

pub fn level_from_score(score: ComplexityScore) -> ComplexityLevel {
    if score.complex_keywords > 0 || score.scope_keywords > 1 || score.length > 120 {
        ComplexityLevel::Full
    } else if score.length > 30 || score.scope_keywords > 0 {
        ComplexityLevel::Standard
    } else {
        ComplexityLevel::Fast
    }
}

pub fn classify_complexity(goal: &str) -> ComplexityLevel {
    level_from_score(score_goal(goal))
}
