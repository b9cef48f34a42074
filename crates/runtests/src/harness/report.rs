//! User-facing progress banners and the end-of-run summary.
//!
//! Diagnostics go through `tracing` to stderr; everything a user watches a
//! run for goes through the [`Reporter`] to stdout.

use std::fmt::Write as _;
use std::io::{self, Write};
use std::sync::Arc;
use std::time::Duration;

use colored::{Color, Colorize};
use parking_lot::Mutex;

use super::runner::{Outcome, RunResult};

/// In-memory sink shared between a [`Reporter`] and whoever inspects it.
#[derive(Debug, Clone, Default)]
pub struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

impl SharedBuffer {
    /// Everything written so far.
    #[must_use]
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock()).into_owned()
    }
}

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Writes banners for each context and a summary at the end of the run.
pub struct Reporter {
    out: Box<dyn Write + Send>,
    color: bool,
    show_time: bool,
}

impl std::fmt::Debug for Reporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reporter")
            .field("color", &self.color)
            .field("show_time", &self.show_time)
            .finish_non_exhaustive()
    }
}

impl Reporter {
    /// Reporter writing to stdout.
    #[must_use]
    pub fn stdout(color: bool) -> Self {
        Self {
            out: Box::new(io::stdout()),
            color,
            show_time: false,
        }
    }

    /// Uncolored reporter writing to a buffer.
    #[must_use]
    pub fn buffered() -> (Self, SharedBuffer) {
        let buffer = SharedBuffer::default();
        let reporter = Self {
            out: Box::new(buffer.clone()),
            color: false,
            show_time: false,
        };
        (reporter, buffer)
    }

    /// Append the elapsed time to PASS banners.
    #[must_use]
    pub fn with_time(mut self, show: bool) -> Self {
        self.show_time = show;
        self
    }

    fn paint(&self, text: &str, color: Color) -> String {
        if self.color {
            text.color(color).bold().to_string()
        } else {
            text.to_string()
        }
    }

    fn line(&mut self, text: &str) {
        // A closed stdout must not abort the run.
        let _ = writeln!(self.out, "{text}");
        let _ = self.out.flush();
    }

    /// `obj_basic/TEST0: SETUP (check/pmem/debug)`
    pub fn setup(&mut self, test: &str, variants: &str) {
        self.line(&format!("{test}: SETUP ({variants})"));
    }

    /// `obj_basic/TEST0: PASS`, optionally followed by `[SS.mmm] s`.
    pub fn passed(&mut self, test: &str, elapsed: Duration) {
        let mut text = format!("{test}: {}", self.paint("PASS", Color::Green));
        if self.show_time {
            let _ = write!(text, "\t\t\t[{}] s", format_elapsed(elapsed));
        }
        self.line(&text);
    }

    /// Captured output, then `obj_basic/TEST0: FAILED`.
    pub fn failed(&mut self, test: &str, output: &str) {
        if !output.is_empty() {
            self.line(output.trim_end_matches('\n'));
        }
        let text = format!("{test}: {}", self.paint("FAILED", Color::Red));
        self.line(&text);
    }

    /// `Skipping: obj_basic/TEST0 timed out`
    pub fn timed_out(&mut self, test: &str) {
        let text = format!("Skipping: {test} {}", self.paint("timed out", Color::Red));
        self.line(&text);
    }

    /// Totals and the list of failed contexts.
    pub fn summary(&mut self, result: &RunResult) {
        let failed = if result.failed > 0 {
            self.paint(&format!("{} failed", result.failed), Color::Red)
        } else {
            format!("{} failed", result.failed)
        };
        let mut text = format!(
            "{} contexts: {} passed, {failed}, {} skipped in {}",
            result.total,
            result.passed,
            result.skipped,
            format_elapsed(result.duration)
        );
        if result.aborted {
            let _ = write!(text, " ({})", self.paint("aborted", Color::Yellow));
        }
        self.line(&text);

        for record in &result.records {
            if let Outcome::Failed { reason, .. } = &record.outcome {
                let text = format!("  {} ({}): {reason}", record.test, record.variants());
                self.line(&text);
            }
        }
    }
}

/// `SS.mmm` below 61 seconds, `H:MM:SS` above.
#[must_use]
pub fn format_elapsed(elapsed: Duration) -> String {
    let secs = elapsed.as_secs_f64();
    if secs < 61.0 {
        format!("{secs:06.3}")
    } else {
        let total = elapsed.as_secs();
        format!("{}:{:02}:{:02}", total / 3600, total / 60 % 60, total % 60)
    }
}
