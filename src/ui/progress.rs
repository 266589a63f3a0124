use std::time::Duration;

use console::style;
use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};

use crate::ui::icons::{CHECK, CROSS, RETRY, SKIP, SPARKLE, STOP, WARN};
use crate::util::format_duration;

/// Terminal output for one orchestrated run.
///
/// A phase bar is drawn only when `bars` is set; with the direct backend the
/// agent owns the terminal, so the engine runs with plain line output.
pub struct RunUi {
    multi: MultiProgress,
    phase_bar: ProgressBar,
    bars: bool,
}

impl RunUi {
    pub fn new(total_phases: u64, bars: bool) -> Self {
        let multi = if bars {
            MultiProgress::new()
        } else {
            MultiProgress::with_draw_target(ProgressDrawTarget::hidden())
        };
        let phase_bar = multi.add(ProgressBar::new(total_phases));
        if let Ok(phase_style) = ProgressStyle::default_bar()
            .template("{prefix:.bold.dim} [{bar:30.cyan/blue}] {pos}/{len} {msg}")
        {
            phase_bar.set_style(phase_style.progress_chars("█▓▒░"));
        }
        phase_bar.set_prefix("Phases");
        Self {
            multi,
            phase_bar,
            bars,
        }
    }

    /// Plain output, for tests and non-interactive runs.
    pub fn plain() -> Self {
        Self::new(0, false)
    }

    /// Print above the bars, or straight to stdout when bars are off.
    pub fn line(&self, msg: impl AsRef<str>) {
        if !self.bars || self.multi.println(msg.as_ref()).is_err() {
            println!("{}", msg.as_ref());
        }
    }

    pub fn warn(&self, msg: impl AsRef<str>) {
        self.line(format!("{}{}", WARN, style(msg.as_ref()).yellow()));
    }

    pub fn banner(&self, goal: &str, start_phase: u32, start_name: &str) {
        self.line(format!(
            "\n{} {}",
            style("=== RPI Phased:").bold().cyan(),
            style(format!("{goal} ===")).bold()
        ));
        self.line(format!("Starting from phase {start_phase} ({start_name})"));
    }

    pub fn start_phase(&self, num: u32, name: &str) {
        self.phase_bar
            .set_message(format!("{}: {}", style(num).yellow(), name));
        self.line(format!("\n--- Phase {num}: {name} ---"));
    }

    pub fn skip_phase(&self, num: u32, name: &str, reason: &str) {
        self.phase_bar.inc(1);
        self.line(format!(
            "\n{}--- Phase {num}: {name} (skipped - {reason}) ---",
            SKIP
        ));
    }

    pub fn phase_complete(&self, num: u32, elapsed: Duration) {
        self.phase_bar.inc(1);
        self.line(format!(
            "{}Phase {} completed in {}",
            CHECK,
            style(num).green().bold(),
            format_duration(elapsed)
        ));
    }

    pub fn phase_failed(&self, num: u32, reason: &str) {
        self.line(format!(
            "{}Phase {} failed: {}",
            CROSS,
            style(num).red().bold(),
            reason
        ));
    }

    pub fn retrying(&self, name: &str, verdict: &str, attempt: u32, max: u32) {
        self.line(format!(
            "{}{name}: {} (attempt {attempt}/{max}) - retrying",
            RETRY,
            style(verdict).yellow().bold()
        ));
    }

    pub fn escalated(&self, name: &str, attempt: u32, max: u32, report: &str) {
        self.line(format!(
            "{}{name} escalated (attempt {attempt}/{max}). Last report: {report}. Manual intervention needed.",
            STOP
        ));
    }

    pub fn complete(&self, msg: &str) {
        self.phase_bar.finish_and_clear();
        self.line(format!("\n{}{}", SPARKLE, style(msg).green().bold()));
    }

    pub fn abandon(&self) {
        self.phase_bar.abandon();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_ui_does_not_panic() {
        let ui = RunUi::plain();
        ui.banner("add auth", 1, "discovery");
        ui.start_phase(1, "discovery");
        ui.phase_complete(1, Duration::from_secs(95));
        ui.skip_phase(3, "validation", "complexity: fast");
        ui.retrying("validation", "FAIL", 1, 3);
        ui.escalated("validation", 3, 3, "vibe.md");
        ui.complete("=== RPI Phased Complete ===");
    }
}
