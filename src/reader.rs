//! Readers: turn one shard of the source into queued work items.

use crate::cancel::CancelToken;
use crate::metrics::RunMetrics;
use crate::progress::StatusBar;
use crate::queue::{QueueError, WorkQueue};
use crate::source::{shard_range, ItemPreparer, RecordSource};
use std::sync::Arc;

/// What one reader did with its shard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReaderReport {
    pub id: usize,
    /// Shard size according to the source.
    pub expected: u64,
    /// Items put on the queue.
    pub produced: u64,
    /// Rows that could not be read or prepared.
    pub skipped: u64,
    /// Why the reader stopped before the end of its shard, if it did.
    pub aborted: Option<String>,
}

impl ReaderReport {
    /// Rows of the shard that were neither produced nor skipped.
    #[must_use]
    pub fn shortfall(&self) -> u64 {
        self.expected.saturating_sub(self.produced + self.skipped)
    }
}

pub struct Reader {
    id: usize,
    num_readers: usize,
    source: Arc<dyn RecordSource>,
    preparer: Arc<ItemPreparer>,
    queue: WorkQueue,
    cancel: CancelToken,
    metrics: Arc<RunMetrics>,
    bar: StatusBar,
}

impl Reader {
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn new(
        id: usize,
        num_readers: usize,
        source: Arc<dyn RecordSource>,
        preparer: Arc<ItemPreparer>,
        queue: WorkQueue,
        cancel: CancelToken,
        metrics: Arc<RunMetrics>,
        bar: StatusBar,
    ) -> Self {
        Self {
            id,
            num_readers,
            source,
            preparer,
            queue,
            cancel,
            metrics,
            bar,
        }
    }

    /// Shard size this reader is responsible for.
    #[must_use]
    pub fn expected(&self) -> u64 {
        shard_range(self.source.len(), self.num_readers, self.id).len() as u64
    }

    /// Read the shard to the end, skipping rows that fail.
    ///
    /// Stops early if the shard cannot be opened, the run is cancelled, or
    /// the queue goes away.
    pub fn run(self) -> ReaderReport {
        let mut report = ReaderReport {
            id: self.id,
            expected: self.expected(),
            produced: 0,
            skipped: 0,
            aborted: None,
        };

        let rows = match self.source.shard(self.num_readers, self.id) {
            Ok(rows) => rows,
            Err(e) => {
                let reason = format!("failed to open shard: {e:#}");
                tracing::error!(reader = self.id, "{reason}");
                self.metrics.add_reader_failure();
                self.bar.abandon(reason.clone());
                report.aborted = Some(reason);
                return report;
            }
        };

        for (offset, row) in rows.enumerate() {
            let item = row.and_then(|row| self.preparer.prepare(&row));
            let item = match item {
                Ok(item) => item,
                Err(e) => {
                    report.skipped += 1;
                    self.metrics.add_skipped(1);
                    self.bar.inc(1);
                    self.bar.notice(format!("skipped row {offset}: {e:#}"));
                    continue;
                }
            };
            match self.queue.put(item, &self.cancel) {
                Ok(()) => {
                    report.produced += 1;
                    self.metrics.add_enqueued(1);
                    self.bar.inc(1);
                }
                Err(QueueError::Cancelled) => {
                    report.aborted = Some("cancelled".into());
                    break;
                }
                Err(QueueError::Closed) => {
                    report.aborted = Some("work queue disconnected".into());
                    break;
                }
            }
        }

        match &report.aborted {
            None => self.bar.finish(format!("done ({} items)", report.produced)),
            Some(reason) => {
                if !self.cancel.is_cancelled() {
                    self.metrics.add_reader_failure();
                }
                self.bar.abandon(reason.clone());
            }
        }
        tracing::debug!(
            reader = self.id,
            produced = report.produced,
            skipped = report.skipped,
            "reader finished"
        );
        report
    }
}
