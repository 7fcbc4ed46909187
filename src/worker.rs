//! Encoding workers.
//!
//! A worker is bound to one accelerator unit. It loads an encoder once, then
//! pulls work items off the queue until it receives a sentinel, encoding each
//! item and appending the result to its own [`RotatingWriter`].
//!
//! ```text
//! Loading -> Ready -> (Processing <-> Rotating)* -> Draining -> Done
//!    \
//!     `-> Crashed   (encoder failed to load, or the output could not be closed)
//! ```
//!
//! A failure while encoding or writing one item drops that item and the loop
//! carries on. Encoder panics count as failures of the item being encoded.

use crate::cancel::CancelToken;
use crate::codec::{Encoder, EncoderFactory};
use crate::metrics::RunMetrics;
use crate::progress::StatusBar;
use crate::queue::{QueueError, WorkQueue};
use crate::record::{EncodedRecord, QueueMessage, WorkItem};
use crate::writer::{FileSummary, RotatingWriter, WriterConfig};
use anyhow::anyhow;
use std::any::Any;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Loading,
    Ready,
    Processing,
    Rotating,
    Draining,
    Done,
    Crashed,
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Loading => "loading",
            Self::Ready => "ready",
            Self::Processing => "processing",
            Self::Rotating => "rotating",
            Self::Draining => "draining",
            Self::Done => "done",
            Self::Crashed => "crashed",
        };
        f.write_str(s)
    }
}

/// How a worker's loop ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerOutcome {
    /// Consumed its sentinel and closed every file.
    Completed,
    /// Stopped early; the message says why.
    Crashed(String),
    /// The run was cancelled while the worker was waiting or working.
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct WorkerReport {
    pub rank: usize,
    /// Records written.
    pub encoded: u64,
    /// Items received but not written.
    pub dropped: u64,
    pub files: Vec<FileSummary>,
    pub outcome: WorkerOutcome,
}

impl WorkerReport {
    #[must_use]
    pub fn bytes_written(&self) -> u64 {
        self.files.iter().map(|f| f.bytes).sum()
    }

    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.outcome == WorkerOutcome::Completed
    }
}

pub struct Worker {
    rank: usize,
    device: usize,
    queue: WorkQueue,
    cancel: CancelToken,
    factory: Arc<dyn EncoderFactory>,
    writer_config: WriterConfig,
    metrics: Arc<RunMetrics>,
    bar: StatusBar,
    state: WorkerState,
    encoded: u64,
    dropped: u64,
    files_reported: usize,
}

impl Worker {
    /// Worker `rank`, bound to accelerator unit `rank`.
    #[must_use]
    pub fn new(
        rank: usize,
        queue: WorkQueue,
        cancel: CancelToken,
        factory: Arc<dyn EncoderFactory>,
        writer_config: WriterConfig,
        metrics: Arc<RunMetrics>,
        bar: StatusBar,
    ) -> Self {
        Self {
            rank,
            device: rank,
            queue,
            cancel,
            factory,
            writer_config,
            metrics,
            bar,
            state: WorkerState::Loading,
            encoded: 0,
            dropped: 0,
            files_reported: 0,
        }
    }

    fn transition(&mut self, next: WorkerState) {
        if self.state != next {
            tracing::trace!(rank = self.rank, from = %self.state, to = %next, "worker state");
            self.state = next;
        }
    }

    /// Run the worker to completion. Never panics on item failures.
    pub fn run(mut self) -> WorkerReport {
        self.transition(WorkerState::Loading);
        self.bar.status("loading");

        let loaded = catch_unwind(AssertUnwindSafe(|| self.factory.load(self.device)))
            .unwrap_or_else(|p| {
                Err(anyhow!(
                    "encoder load panicked: {}",
                    panic_message(p.as_ref())
                ))
            });
        let mut encoder = match loaded {
            Ok(encoder) => encoder,
            Err(e) => return self.crash(format!("failed to load encoder: {e:#}"), Vec::new()),
        };
        let mut writer = match RotatingWriter::new(self.writer_config.clone()) {
            Ok(writer) => writer,
            Err(e) => return self.crash(format!("{e:#}"), Vec::new()),
        };

        self.transition(WorkerState::Ready);
        self.bar.status("ready");

        let stop = loop {
            match self.queue.get(&self.cancel) {
                Ok(QueueMessage::Work(item)) => {
                    self.transition(WorkerState::Processing);
                    self.process(encoder.as_mut(), &mut writer, item);
                    self.transition(WorkerState::Ready);
                }
                Ok(QueueMessage::Sentinel) => break None,
                Err(QueueError::Cancelled) => break Some(WorkerOutcome::Cancelled),
                Err(QueueError::Closed) => {
                    break Some(WorkerOutcome::Crashed("work queue disconnected".into()));
                }
            }
        };

        self.transition(WorkerState::Draining);
        let files = match writer.finish() {
            Ok(files) => files,
            Err(e) => return self.crash(format!("failed to close output: {e:#}"), Vec::new()),
        };
        self.report_new_files(&files);

        match stop {
            None => {
                self.transition(WorkerState::Done);
                self.bar.finish(format!(
                    "done ({} items, {} files, {} dropped)",
                    self.encoded,
                    files.len(),
                    self.dropped
                ));
                self.report(files, WorkerOutcome::Completed)
            }
            Some(WorkerOutcome::Crashed(reason)) => self.crash(reason, files),
            Some(outcome) => {
                self.transition(WorkerState::Done);
                self.bar.abandon("cancelled");
                tracing::info!(rank = self.rank, encoded = self.encoded, "worker cancelled");
                self.report(files, outcome)
            }
        }
    }

    fn process(&mut self, encoder: &mut dyn Encoder, writer: &mut RotatingWriter, item: WorkItem) {
        let encoded = catch_unwind(AssertUnwindSafe(|| encoder.encode(&item.waveform)))
            .unwrap_or_else(|p| Err(anyhow!("encoder panicked: {}", panic_message(p.as_ref()))));
        let written = encoded
            .and_then(|enc| EncodedRecord::assemble(item, enc))
            .and_then(|record| writer.append(&record));

        match written {
            Ok(index) => {
                self.encoded += 1;
                self.metrics.add_encoded(1);
                self.bar.inc(1);
                if writer.closed_files().len() > self.files_reported {
                    self.transition(WorkerState::Rotating);
                    let closed = writer.closed_files().to_vec();
                    self.report_new_files(&closed);
                    self.bar.set_message(format!("file {:05}", index + 1));
                }
            }
            Err(e) => {
                self.dropped += 1;
                self.metrics.add_dropped(1);
                let mut msg = format!("{e:#}");
                truncate_chars(&mut msg, 60);
                self.bar.notice(format!("dropped item: {msg}"));
            }
        }
    }

    fn report_new_files(&mut self, files: &[FileSummary]) {
        for file in files.iter().skip(self.files_reported) {
            self.metrics.add_file(file.bytes);
        }
        self.files_reported = self.files_reported.max(files.len());
    }

    fn crash(mut self, reason: String, files: Vec<FileSummary>) -> WorkerReport {
        self.transition(WorkerState::Crashed);
        self.metrics.add_worker_failure();
        tracing::error!(rank = self.rank, reason = %reason, "worker crashed");
        self.bar.abandon(format!("crashed: {reason}"));
        self.report(files, WorkerOutcome::Crashed(reason))
    }

    fn report(self, files: Vec<FileSummary>, outcome: WorkerOutcome) -> WorkerReport {
        WorkerReport {
            rank: self.rank,
            encoded: self.encoded,
            dropped: self.dropped,
            files,
            outcome,
        }
    }
}

/// Best-effort text of a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

fn truncate_chars(s: &mut String, max: usize) {
    if let Some((idx, _)) = s.char_indices().nth(max) {
        s.truncate(idx);
        s.push_str("...");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncation_respects_char_boundaries() {
        let mut s = "é".repeat(10);
        truncate_chars(&mut s, 4);
        assert_eq!(s, "éééé...");
        let mut short = "ok".to_string();
        truncate_chars(&mut short, 4);
        assert_eq!(short, "ok");
    }

    #[test]
    fn panic_payloads_are_readable() {
        let p = catch_unwind(|| panic!("boom {}", 1)).unwrap_err();
        assert_eq!(panic_message(p.as_ref()), "boom 1");
    }
}
