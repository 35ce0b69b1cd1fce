//! Batch progress: remaining-time estimate and terminal display.

use indicatif::{ProgressBar, ProgressStyle};
use std::time::{Duration, Instant};

/// Estimated time left in a batch, or `None` before the first completion.
///
/// Linear extrapolation: `(total - completed) * elapsed / completed`.
pub fn estimate_remaining(total: usize, completed: usize, elapsed: Duration) -> Option<Duration> {
    if completed == 0 {
        return None;
    }
    let remaining = total.saturating_sub(completed) as f64;
    Some(elapsed.mul_f64(remaining / completed as f64))
}

/// `H:MM:SS`, hours are not wrapped
pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    format!("{}:{:02}:{:02}", secs / 3600, (secs / 60) % 60, secs % 60)
}

/// Start time of a batch
#[derive(Debug, Clone, Copy)]
pub struct BatchClock {
    started: Instant,
}

impl BatchClock {
    pub fn start() -> Self {
        Self {
            started: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn remaining(&self, total: usize, completed: usize) -> Option<Duration> {
        estimate_remaining(total, completed, self.elapsed())
    }

    /// `Done: k / n, ETA: H:MM:SS`
    pub fn status(&self, total: usize, completed: usize) -> String {
        match self.remaining(total, completed) {
            Some(eta) => format!("Done: {} / {}, ETA: {}", completed, total, format_duration(eta)),
            None => format!("Done: {} / {}", completed, total),
        }
    }
}

impl Default for BatchClock {
    fn default() -> Self {
        Self::start()
    }
}

/// Progress bar for a batch of `total` tasks
pub fn batch_progress_bar(total: usize) -> ProgressBar {
    let pb = ProgressBar::new(total as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} | {msg}")
            .expect("valid progress template")
            .progress_chars("=>-"),
    );
    pb.enable_steady_tick(Duration::from_millis(100));
    pb
}
