//! Terminal progress: one bar per reader and one per worker.
//!
//! Readers know their shard size and get a bounded bar; workers get an
//! open-ended counter with the current output file index in the message.
//! Status changes are mirrored to `tracing` so they survive in logs when the
//! bars are hidden.

use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};

/// Owns the bar group for one dataset.
#[derive(Clone)]
pub struct Progress {
    multi: MultiProgress,
}

impl Progress {
    #[must_use]
    pub fn new(visible: bool) -> Self {
        let multi = if visible {
            MultiProgress::new()
        } else {
            MultiProgress::with_draw_target(ProgressDrawTarget::hidden())
        };
        Self { multi }
    }

    /// Bar for reader `id` over a shard of `len` rows.
    #[must_use]
    pub fn reader_bar(&self, id: usize, len: u64) -> StatusBar {
        let bar = self.multi.add(ProgressBar::new(len));
        if let Ok(style) = ProgressStyle::default_bar()
            .template("{prefix:>10} [{bar:30.cyan/blue}] {pos}/{len} {per_sec} {msg}")
        {
            bar.set_style(style.progress_chars("#>-"));
        }
        bar.set_prefix(format!("reader-{id}"));
        StatusBar {
            bar,
            label: format!("reader-{id}"),
        }
    }

    /// Counter for worker `rank`.
    #[must_use]
    pub fn worker_bar(&self, rank: usize) -> StatusBar {
        let bar = self.multi.add(ProgressBar::no_length());
        if let Ok(style) = ProgressStyle::default_spinner()
            .template("{spinner:.green} {prefix:>8} {pos} items {per_sec} | {msg}")
        {
            bar.set_style(style);
        }
        bar.set_prefix(format!("gpu-{rank}"));
        StatusBar {
            bar,
            label: format!("gpu-{rank}"),
        }
    }
}

/// A bar plus the label used when mirroring status to the log.
#[derive(Clone)]
pub struct StatusBar {
    bar: ProgressBar,
    label: String,
}

impl StatusBar {
    /// A bar that is never drawn.
    #[must_use]
    pub fn hidden(label: impl Into<String>) -> Self {
        Self {
            bar: ProgressBar::hidden(),
            label: label.into(),
        }
    }

    pub fn inc(&self, n: u64) {
        self.bar.inc(n);
    }

    /// Lifecycle change (loading, ready, done). Logged at INFO.
    pub fn status(&self, msg: impl Into<String>) {
        let msg = msg.into();
        tracing::info!(component = %self.label, "{msg}");
        self.bar.set_message(msg);
    }

    /// Transient notice such as a dropped item. Logged at WARN.
    pub fn notice(&self, msg: impl Into<String>) {
        let msg = msg.into();
        tracing::warn!(component = %self.label, "{msg}");
        self.bar.set_message(msg);
    }

    /// Quiet message update, not logged.
    pub fn set_message(&self, msg: impl Into<String>) {
        self.bar.set_message(msg.into());
    }

    pub fn finish(&self, msg: impl Into<String>) {
        self.bar.finish_with_message(msg.into());
    }

    pub fn abandon(&self, msg: impl Into<String>) {
        self.bar.abandon_with_message(msg.into());
    }
}
