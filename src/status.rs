use crate::config::PROGRESS_INTERVAL;
use indicatif::{ProgressBar, ProgressStyle};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

/// Shared run/halt flag and progress counter for one phase of a job.
///
/// Once halted it never resumes; workers see the flag at the top of their next
/// loop iteration.
pub struct Status {
    halted: AtomicBool,
    processed: AtomicU64,
    description: String,
    pb: ProgressBar,
}

impl Status {
    pub fn new(description: &str) -> Self {
        let pb = ProgressBar::new_spinner();
        if let Ok(style) = ProgressStyle::default_spinner().template("{spinner:.cyan} {msg}") {
            pb.set_style(style);
        }
        pb.enable_steady_tick(Duration::from_millis(100));
        pb.set_message(format!("{description}: 0"));
        Self::with_progress_bar(description, pb)
    }

    /// Status without a visible spinner
    pub fn hidden(description: &str) -> Self {
        Self::with_progress_bar(description, ProgressBar::hidden())
    }

    fn with_progress_bar(description: &str, pb: ProgressBar) -> Self {
        Self {
            halted: AtomicBool::new(false),
            processed: AtomicU64::new(0),
            description: description.to_string(),
            pb,
        }
    }

    pub fn allow_continue(&self) -> bool {
        !self.halted.load(Ordering::Acquire)
    }

    pub fn halt(&self) {
        self.halted.store(true, Ordering::Release);
    }

    pub fn update(&self) {
        let processed = self.processed.fetch_add(1, Ordering::Relaxed) + 1;
        if processed % PROGRESS_INTERVAL == 0 {
            self.pb
                .set_message(format!("{}: {}", self.description, processed));
        }
    }

    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    pub fn finish(&self) {
        self.pb.finish_and_clear();
    }
}
