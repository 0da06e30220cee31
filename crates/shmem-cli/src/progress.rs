//! Progress display and formatting helpers.

use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;

/// Message progress tracker
pub struct FrameProgress {
    bar: ProgressBar,
}

impl FrameProgress {
    /// Create a new progress tracker for `total` messages
    #[must_use]
    pub fn new(total: u64, label: &str) -> Self {
        let bar = ProgressBar::new(total);
        let style = ProgressStyle::with_template(
            "{msg}\n{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {pos}/{len} ({per_sec}, {eta})",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("#>-");
        bar.set_style(style);
        bar.set_message(label.to_string());

        Self { bar }
    }

    /// Hidden tracker (for tests and `--quiet` paths)
    #[must_use]
    pub fn hidden() -> Self {
        Self {
            bar: ProgressBar::hidden(),
        }
    }

    /// Advance by `n` messages
    pub fn inc(&self, n: u64) {
        self.bar.inc(n);
    }

    /// Messages counted so far
    #[must_use]
    pub fn position(&self) -> u64 {
        self.bar.position()
    }

    /// Finish with custom message
    pub fn finish_with_message(&self, msg: String) {
        self.bar.finish_with_message(msg);
    }

    /// Abandon the progress bar (for errors)
    pub fn abandon(&self) {
        self.bar.abandon();
    }
}

/// Format bytes in human-readable format
#[must_use]
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_idx = 0;

    while size >= 1024.0 && unit_idx < UNITS.len() - 1 {
        size /= 1024.0;
        unit_idx += 1;
    }

    format!("{size:.2} {}", UNITS[unit_idx])
}

/// Format throughput of `bytes` moved in `elapsed`
#[must_use]
pub fn format_throughput(bytes: u64, elapsed: Duration) -> String {
    let secs = elapsed.as_secs_f64();
    if secs <= 0.0 {
        return "n/a".to_string();
    }
    format!("{}/s", format_bytes((bytes as f64 / secs) as u64))
}

/// Format a latency with a unit that keeps it readable
#[must_use]
pub fn format_latency(latency: Duration) -> String {
    let micros = latency.as_micros();
    if micros < 1000 {
        format!("{micros} us")
    } else {
        format!("{:.2} ms", latency.as_secs_f64() * 1000.0)
    }
}
