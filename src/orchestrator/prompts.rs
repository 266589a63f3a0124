//! Phase prompt assembly.
//!
//! Every prompt opens with the context-discipline preamble and the summary
//! contract so they survive compaction, then cross-phase context (phases 2
//! and 3), then the phase's skill template.

use std::path::Path;

use anyhow::{Result, bail};

use super::complexity::ComplexityLevel;
use super::gate::Finding;
use super::state::{RunState, rpi_dir};
use crate::phase::{PHASES, phase_name};
use crate::util::truncate_str;

const SUMMARY_CAP: usize = 2000;

/// Inputs for a retry prompt after a failed gate.
#[derive(Debug, Clone, Default)]
pub struct RetryContext {
    pub attempt: u32,
    pub max_retries: u32,
    pub verdict: String,
    pub findings: Vec<Finding>,
}

pub fn phase_budget(phase_num: u32) -> &'static str {
    match phase_num {
        1 => {
            "BUDGET: This session runs research + plan + pre-mortem. Research: limit to ~15 file reads, write findings to .agents/research/. Plan: write to .agents/plans/, focus on issue creation. Pre-mortem: invoke /council, read the verdict, done. If pre-mortem FAILs, re-plan and re-run pre-mortem within this session (max 3 attempts)."
        }
        2 => {
            "BUDGET (CRITICAL): Implementation is the highest-risk phase for context. /crank spawns workers internally. Do NOT re-read worker output into your context. Trust /crank to manage its waves. Read only the completion status."
        }
        3 => {
            "BUDGET: This session runs vibe + post-mortem. Vibe: invoke /council on recent changes, read the verdict. Post-mortem: invoke /council + /retro, read output files, write summary. Minimal context for both."
        }
        _ => "",
    }
}

pub fn context_discipline(phase_num: u32) -> String {
    format!(
        "CONTEXT DISCIPLINE: You are running inside forge-rpi (phase {phase_num} of {total}). Each phase gets a FRESH context window. Stay disciplined:\n\
         - Do NOT accumulate large file contents in context. Read files just in time and extract only what you need.\n\
         - Do NOT explore broadly when narrow exploration suffices.\n\
         - Write findings, plans, and results to DISK (files in .agents/), not just in conversation.\n\
         - If you delegate to workers, read their result files from disk instead of accumulating their output.\n\
         - If you notice context degradation (forgetting instructions, repeating yourself, losing the goal), IMMEDIATELY write a handoff to .agents/rpi/phase-{phase_num}-handoff.md with what you accomplished, what remains and key context. Then finish cleanly.\n\
         {budget}\n\n",
        total = PHASES.len(),
        budget = phase_budget(phase_num),
    )
}

pub fn summary_contract(phase_num: u32) -> String {
    format!(
        "PHASE SUMMARY CONTRACT: Before finishing this session, write a concise summary (max 500 tokens) to .agents/rpi/phase-{phase_num}-summary.md covering key insights, tradeoffs considered, and risks for subsequent phases. This file is read by the next phase.\n\n"
    )
}

/// Prior summaries, each capped at 2000 characters.
pub fn read_phase_summaries(root: &Path, current_phase: u32) -> String {
    let dir = rpi_dir(root);
    let mut parts = Vec::new();
    for i in 1..current_phase {
        let Ok(content) = std::fs::read_to_string(dir.join(format!("phase-{i}-summary.md"))) else {
            continue;
        };
        let content = content.trim();
        if content.is_empty() {
            continue;
        }
        let content = if content.chars().count() > SUMMARY_CAP {
            format!("{}...", content.chars().take(SUMMARY_CAP).collect::<String>())
        } else {
            content.to_string()
        };
        parts.push(format!("[Phase {i}: {}]\n{content}", phase_name(i)));
    }
    parts.join("\n\n")
}

/// Goal, recorded verdicts and prior summaries.
pub fn build_phase_context(root: &Path, state: &RunState, phase_num: u32) -> String {
    let mut parts = Vec::new();
    if !state.goal.is_empty() {
        parts.push(format!("Goal: {}", state.goal));
    }
    for (key, verdict) in &state.verdicts {
        parts.push(format!("{} verdict: {verdict}", key.replace('_', "-")));
    }
    let summaries = read_phase_summaries(root, phase_num);
    if !summaries.is_empty() {
        parts.push(summaries);
    }
    if parts.is_empty() {
        return String::new();
    }
    format!("--- RPI Context (from prior phases) ---\n{}", parts.join("\n"))
}

/// Gates run with `--quick` on the fast path unless the goal scored `full`.
fn quick_flag(state: &RunState) -> &'static str {
    if state.fast_path && state.complexity != Some(ComplexityLevel::Full) {
        " --quick"
    } else {
        ""
    }
}

fn crank_invocation(state: &RunState) -> String {
    let mut s = format!("/crank {}", state.epic_id);
    if state.test_first {
        s.push_str(" --test-first");
    }
    s
}

fn swarm_step(state: &RunState, preference: &str) -> String {
    if state.swarm_first {
        format!("Prefer: {preference}\nFallback direct command:\n")
    } else {
        String::new()
    }
}

fn discovery_template(state: &RunState) -> String {
    let mut p = String::new();
    if state.swarm_first {
        p.push_str(
            "SWARM-FIRST EXECUTION CONTRACT:\n\
             - Default to /swarm for each step in this phase (research, plan, pre-mortem) using a lead + worker team pattern.\n\
             - If /swarm runtime is unavailable, execute the direct commands below in this same session.\n\
             - Keep worker outputs on disk and consume thin summaries only.\n\n",
        );
    }
    p.push_str("Run these skills IN SEQUENCE. Do not skip any step.\n\n");
    p.push_str("STEP 1 - Research:\n");
    p.push_str(&swarm_step(state, "execute this step via /swarm with research-focused workers."));
    p.push_str(&format!("/research \"{}\" --auto\n\n", state.goal));
    p.push_str("STEP 2 - Plan:\nAfter research completes, run:\n");
    p.push_str(&swarm_step(state, "execute this step via /swarm with planning/decomposition workers."));
    p.push_str(&format!("/plan \"{}\" --auto\n\n", state.goal));
    p.push_str("STEP 3 - Pre-mortem:\nAfter plan completes, run:\n");
    p.push_str(&swarm_step(state, "execute this step via /swarm (including council/critique workers when available)."));
    p.push_str(&format!("/pre-mortem{}\n\n", quick_flag(state)));
    p.push_str(
        "If pre-mortem returns FAIL, re-run /plan with the findings and then /pre-mortem again. Max 3 total attempts. If still FAIL after 3 attempts, stop and report.\n\
         If pre-mortem returns PASS or WARN, proceed.",
    );
    p
}

fn implementation_template(state: &RunState) -> String {
    let mut p = String::new();
    if state.swarm_first {
        p.push_str(
            "SWARM-FIRST EXECUTION CONTRACT:\n\
             - Run implementation with swarm-managed waves by default (lead + worker teams).\n\
             - Prefer crank paths that delegate to /swarm for wave execution.\n\n",
        );
    }
    p.push_str(&crank_invocation(state));
    p
}

fn validation_template(state: &RunState) -> String {
    let quick = quick_flag(state);
    let mut p = String::new();
    if state.swarm_first {
        p.push_str(
            "SWARM-FIRST EXECUTION CONTRACT:\n\
             - Use swarm/team execution for validation and retrospective steps where available.\n\
             - Keep validator and implementer contexts isolated; do not reuse implementation worker context.\n\n",
        );
    }
    p.push_str("Run these skills IN SEQUENCE. Do not skip any step.\n\n");
    p.push_str("STEP 1 - Vibe:\n");
    p.push_str(&swarm_step(state, "execute vibe using /swarm-driven validation workers."));
    p.push_str(&format!("/vibe{quick} recent\n\n"));
    p.push_str(
        "If vibe returns FAIL, STOP and report the findings. Do NOT proceed to post-mortem.\n\
         If vibe returns PASS or WARN, proceed.\n\n",
    );
    p.push_str("STEP 2 - Post-mortem:\n");
    p.push_str(&swarm_step(state, "execute post-mortem using /swarm-driven retro workers."));
    p.push_str(&format!("/post-mortem{quick} {}", state.epic_id));
    p
}

fn phase_template(phase_num: u32, state: &RunState) -> Result<String> {
    Ok(match phase_num {
        1 => discovery_template(state),
        2 => implementation_template(state),
        3 => validation_template(state),
        n => bail!("no prompt template for phase {n}"),
    })
}

pub fn build_phase_prompt(root: &Path, phase_num: u32, state: &RunState) -> Result<String> {
    let body = phase_template(phase_num, state)?;
    let mut prompt = context_discipline(phase_num);
    prompt.push_str(&summary_contract(phase_num));
    if phase_num >= 2 {
        let ctx = build_phase_context(root, state, phase_num);
        if !ctx.is_empty() {
            prompt.push_str(&ctx);
            prompt.push_str("\n\n");
        }
    }
    prompt.push_str(&body);
    Ok(prompt)
}

fn push_findings(prompt: &mut String, findings: &[Finding]) {
    for f in findings {
        prompt.push_str(&format!(
            "FINDING: {} | FIX: {} | REF: {}\n",
            f.description, f.fix, f.reference
        ));
    }
}

/// A validation FAIL retries implementation with the findings inline. Other
/// phases get their normal prompt followed by the failed verdict and findings.
pub fn build_retry_prompt(
    root: &Path,
    phase_num: u32,
    state: &RunState,
    retry: &RetryContext,
) -> Result<String> {
    if phase_num != 3 {
        let mut prompt = build_phase_prompt(root, phase_num, state)?;
        prompt.push_str(&format!(
            "\n\nRETRY: {} gate returned {} (attempt {}/{}). Address these findings before re-running:\n",
            phase_name(phase_num),
            retry.verdict,
            retry.attempt,
            retry.max_retries
        ));
        push_findings(&mut prompt, &retry.findings);
        return Ok(prompt);
    }
    let mut prompt = context_discipline(phase_num);
    prompt.push_str(&summary_contract(phase_num));
    prompt.push_str(&crank_invocation(state));
    prompt.push_str(&format!(
        "\n\nVibe FAIL (attempt {}/{}). Address these findings:\n",
        retry.attempt, retry.max_retries
    ));
    push_findings(&mut prompt, &retry.findings);
    Ok(prompt)
}

/// One-line preview for dry-run and spawn banners.
pub fn prompt_preview(prompt: &str) -> String {
    truncate_str(&crate::util::collapse_whitespace(prompt), 160)
}
