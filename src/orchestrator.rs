//! Runs readers and workers for each dataset and shuts them down.
//!
//! Per dataset the [`Pipeline`]:
//!
//! 1. creates a bounded [`WorkQueue`] of `qsize` slots,
//! 2. spawns one worker thread per accelerator unit and `num_readers`
//!    reader threads, each reader bound to its shard,
//! 3. joins every reader,
//! 4. only then enqueues exactly one sentinel per worker,
//! 5. joins every worker,
//! 6. reports the files produced and their total size.
//!
//! While it waits the orchestrator watches the run's [`CancelToken`]. Once
//! it is raised, every child is told to stop and joined with a bounded
//! timeout, and [`PipelineError::Interrupted`] is returned. It also watches
//! the workers while readers run: if none is left alive, nothing can drain
//! the queue, so the readers are stopped and the dataset fails with
//! [`PipelineError::AllWorkersFailed`].

use crate::assemble::{assemble_archive, ArchiveReport};
use crate::cancel::CancelToken;
use crate::codec::EncoderFactory;
use crate::config::{check_unique_prefixes, BaseSettings, DatasetConfig, SaveSettings};
use crate::device::detect_accelerators;
use crate::error::PipelineError;
use crate::metrics::{MetricsSnapshot, RunMetrics};
use crate::progress::Progress;
use crate::queue::{WorkQueue, POLL_INTERVAL};
use crate::reader::{Reader, ReaderReport};
use crate::source::{shard_range, ItemPreparer, JsonlSource, RecordSource};
use crate::worker::{panic_message, Worker, WorkerOutcome, WorkerReport};
use crate::writer::{FileSummary, WriterConfig};
use anyhow::{Context, Result};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Outcome of one dataset.
#[derive(Debug, Clone)]
pub struct DatasetReport {
    pub dataset: String,
    pub readers: Vec<ReaderReport>,
    pub workers: Vec<WorkerReport>,
    pub elapsed: Duration,
}

impl DatasetReport {
    #[must_use]
    pub fn items_enqueued(&self) -> u64 {
        self.readers.iter().map(|r| r.produced).sum()
    }

    #[must_use]
    pub fn items_skipped(&self) -> u64 {
        self.readers.iter().map(|r| r.skipped).sum()
    }

    /// Rows the readers never got to.
    #[must_use]
    pub fn shortfall(&self) -> u64 {
        self.readers.iter().map(ReaderReport::shortfall).sum()
    }

    #[must_use]
    pub fn records_written(&self) -> u64 {
        self.workers.iter().map(|w| w.encoded).sum()
    }

    #[must_use]
    pub fn items_dropped(&self) -> u64 {
        self.workers.iter().map(|w| w.dropped).sum()
    }

    /// All output files, grouped by worker rank.
    pub fn files(&self) -> impl Iterator<Item = &FileSummary> {
        self.workers.iter().flat_map(|w| w.files.iter())
    }

    #[must_use]
    pub fn total_bytes(&self) -> u64 {
        self.files().map(|f| f.bytes).sum()
    }

    #[must_use]
    pub fn failed_workers(&self) -> usize {
        self.workers.iter().filter(|w| !w.is_completed()).count()
    }
}

/// Outcome of a whole run.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub datasets: Vec<DatasetReport>,
    pub archive: Option<ArchiveReport>,
    pub metrics: MetricsSnapshot,
}

pub struct Pipeline {
    settings: BaseSettings,
    save: SaveSettings,
    factory: Arc<dyn EncoderFactory>,
    cancel: CancelToken,
    metrics: Arc<RunMetrics>,
    num_workers: usize,
}

impl Pipeline {
    /// Set up a pipeline with one worker per accelerator unit.
    ///
    /// `settings.num_gpu_units` overrides accelerator detection.
    ///
    /// # Errors
    /// [`PipelineError::InvalidConfig`] for out-of-range settings and
    /// [`PipelineError::NoAccelerators`] when no unit is available.
    pub fn new(settings: BaseSettings, factory: Arc<dyn EncoderFactory>) -> Result<Self> {
        settings.validate()?;
        let num_workers = settings.num_gpu_units.unwrap_or_else(detect_accelerators);
        if num_workers == 0 {
            return Err(PipelineError::NoAccelerators.into());
        }
        tracing::info!(
            workers = num_workers,
            readers = settings.num_readers,
            qsize = settings.qsize,
            codec = %settings.audio_codec,
            "pipeline configured"
        );
        Ok(Self {
            settings,
            save: SaveSettings::default(),
            factory,
            cancel: CancelToken::new(),
            metrics: RunMetrics::new(),
            num_workers,
        })
    }

    /// Where [`run`](Self::run) saves the assembled archive.
    #[must_use]
    pub fn with_save_settings(mut self, save: SaveSettings) -> Self {
        self.save = save;
        self
    }

    /// Use an externally owned token, e.g. one raised by a signal handler.
    #[must_use]
    pub fn with_cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    #[must_use]
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    #[must_use]
    pub fn metrics(&self) -> Arc<RunMetrics> {
        Arc::clone(&self.metrics)
    }

    #[must_use]
    pub fn num_workers(&self) -> usize {
        self.num_workers
    }

    #[must_use]
    pub fn settings(&self) -> &BaseSettings {
        &self.settings
    }

    /// Process every dataset in order, then assemble the archive.
    ///
    /// # Errors
    /// Stops at the first dataset that fails or is interrupted. Datasets
    /// sharing an output prefix are rejected before anything runs.
    pub fn run(&self, datasets: &[DatasetConfig]) -> Result<RunReport> {
        check_unique_prefixes(datasets)?;
        let mut reports = Vec::with_capacity(datasets.len());
        for ds in datasets {
            tracing::info!(dataset = %ds.describe(), files = %ds.data_files, "loading dataset");
            let source = JsonlSource::open(&ds.data_files)
                .with_context(|| format!("load dataset {}", ds.name))?;
            reports.push(self.process_dataset(ds, Arc::new(source))?);
        }

        let archive = match &self.save.local {
            Some(_) => Some(assemble_archive(&self.settings.out_dir, &self.save)?),
            None => None,
        };

        self.metrics.finish();
        if let Some(path) = &self.settings.metrics_path {
            self.metrics
                .save_to_file(path)
                .with_context(|| format!("save metrics to {}", path.display()))?;
        }
        Ok(RunReport {
            datasets: reports,
            archive,
            metrics: self.metrics.snapshot(),
        })
    }

    /// Encode one dataset into `out_dir`.
    ///
    /// # Errors
    /// [`PipelineError::Interrupted`] when cancelled,
    /// [`PipelineError::AllWorkersFailed`] when no worker survives long
    /// enough to drain the queue, or an error spawning threads.
    pub fn process_dataset(
        &self,
        dataset: &DatasetConfig,
        source: Arc<dyn RecordSource>,
    ) -> Result<DatasetReport> {
        if self.cancel.is_cancelled() {
            return Err(PipelineError::Interrupted { stragglers: 0 }.into());
        }
        let started = Instant::now();
        let cancel = self.cancel.child();
        let queue = WorkQueue::bounded(self.settings.qsize)?;
        let progress = Progress::new(self.settings.progress);
        let codec = self.settings.codec();
        let preparer = Arc::new(ItemPreparer::new(dataset, codec.sample_rate));
        let num_readers = self.settings.num_readers;

        tracing::info!(
            dataset = %dataset.name,
            rows = source.len(),
            readers = num_readers,
            workers = self.num_workers,
            "processing dataset"
        );

        let mut workers = Vec::with_capacity(self.num_workers);
        for rank in 0..self.num_workers {
            let worker = Worker::new(
                rank,
                queue.clone(),
                cancel.clone(),
                Arc::clone(&self.factory),
                self.writer_config(dataset, rank),
                Arc::clone(&self.metrics),
                progress.worker_bar(rank),
            );
            let spawned = thread::Builder::new()
                .name(format!("worker-{rank}"))
                .spawn(move || worker.run());
            match spawned {
                Ok(handle) => workers.push(handle),
                Err(e) => {
                    self.abort(&cancel, workers, Vec::new());
                    return Err(e).context("spawn worker thread");
                }
            }
        }

        let mut readers = Vec::with_capacity(num_readers);
        for id in 0..num_readers {
            let len = shard_range(source.len(), num_readers, id).len() as u64;
            let reader = Reader::new(
                id,
                num_readers,
                Arc::clone(&source),
                Arc::clone(&preparer),
                queue.clone(),
                cancel.clone(),
                Arc::clone(&self.metrics),
                progress.reader_bar(id, len),
            );
            let spawned = thread::Builder::new()
                .name(format!("reader-{id}"))
                .spawn(move || reader.run());
            match spawned {
                Ok(handle) => readers.push(handle),
                Err(e) => {
                    self.abort(&cancel, workers, readers);
                    return Err(e).context("spawn reader thread");
                }
            }
        }

        // Readers first; sentinels may only follow once all of them are done.
        loop {
            if all_finished(&readers) {
                break;
            }
            if cancel.is_cancelled() {
                let stragglers = self.abort(&cancel, workers, readers);
                return Err(PipelineError::Interrupted { stragglers }.into());
            }
            if all_finished(&workers) {
                tracing::error!(dataset = %dataset.name, "every worker exited, stopping readers");
                self.abort(&cancel, workers, readers);
                return Err(PipelineError::AllWorkersFailed {
                    dataset: dataset.name.clone(),
                    workers: self.num_workers,
                }
                .into());
            }
            thread::sleep(POLL_INTERVAL);
        }
        let readers: Vec<ReaderReport> = readers
            .into_iter()
            .enumerate()
            .map(|(id, h)| reader_result(id, h.join(), &self.metrics))
            .collect();
        for r in &readers {
            if r.shortfall() > 0 {
                tracing::warn!(
                    reader = r.id,
                    expected = r.expected,
                    produced = r.produced,
                    skipped = r.skipped,
                    reason = r.aborted.as_deref().unwrap_or("unknown"),
                    "reader stopped before the end of its shard"
                );
            }
        }

        let mut sent = 0;
        while sent < self.num_workers {
            if cancel.is_cancelled() {
                let stragglers = self.abort(&cancel, workers, Vec::new());
                return Err(PipelineError::Interrupted { stragglers }.into());
            }
            if all_finished(&workers) {
                break;
            }
            if queue.offer_sentinel(POLL_INTERVAL)? {
                sent += 1;
            }
        }

        loop {
            if all_finished(&workers) {
                break;
            }
            if cancel.is_cancelled() {
                let stragglers = self.abort(&cancel, workers, Vec::new());
                return Err(PipelineError::Interrupted { stragglers }.into());
            }
            thread::sleep(POLL_INTERVAL);
        }
        let workers: Vec<WorkerReport> = workers
            .into_iter()
            .enumerate()
            .map(|(rank, h)| worker_result(rank, h.join(), &self.metrics))
            .collect();

        let report = DatasetReport {
            dataset: dataset.name.clone(),
            readers,
            workers,
            elapsed: started.elapsed(),
        };
        if report.failed_workers() == self.num_workers {
            return Err(PipelineError::AllWorkersFailed {
                dataset: dataset.name.clone(),
                workers: self.num_workers,
            }
            .into());
        }
        if report.failed_workers() > 0 {
            tracing::warn!(
                dataset = %dataset.name,
                failed = report.failed_workers(),
                workers = self.num_workers,
                "dataset finished with reduced throughput"
            );
        }
        tracing::info!(
            dataset = %dataset.name,
            records = report.records_written(),
            dropped = report.items_dropped(),
            skipped = report.items_skipped(),
            files = report.files().count(),
            bytes = report.total_bytes(),
            elapsed_ms = report.elapsed.as_millis() as u64,
            "dataset complete"
        );
        Ok(report)
    }

    fn writer_config(&self, dataset: &DatasetConfig, rank: usize) -> WriterConfig {
        WriterConfig {
            out_dir: self.settings.out_dir.clone(),
            dataset_prefix: dataset.dataset_prefix().to_string(),
            rank,
            lines_per_file: self.settings.lines_per_file,
            gzip_level: self.settings.gzip_level,
            buffer_size: self.settings.buffer_size,
        }
    }

    /// Stop every child and join each within the join timeout.
    /// Returns how many threads were still running and got detached.
    fn abort(
        &self,
        cancel: &CancelToken,
        workers: Vec<JoinHandle<WorkerReport>>,
        readers: Vec<JoinHandle<ReaderReport>>,
    ) -> usize {
        cancel.cancel();
        let timeout = self.settings.join_timeout();
        let mut stragglers = 0;
        for (id, handle) in readers.into_iter().enumerate() {
            match join_within(handle, timeout) {
                Some(result) => {
                    reader_result(id, result, &self.metrics);
                }
                None => {
                    tracing::warn!(reader = id, "reader did not stop in time, detaching");
                    stragglers += 1;
                }
            }
        }
        for (rank, handle) in workers.into_iter().enumerate() {
            match join_within(handle, timeout) {
                Some(result) => {
                    worker_result(rank, result, &self.metrics);
                }
                None => {
                    tracing::warn!(rank, "worker did not stop in time, detaching");
                    stragglers += 1;
                }
            }
        }
        stragglers
    }
}

fn all_finished<T>(handles: &[JoinHandle<T>]) -> bool {
    handles.iter().all(JoinHandle::is_finished)
}

/// Join `handle` if it finishes within `timeout`; otherwise leave it detached.
fn join_within<T>(handle: JoinHandle<T>, timeout: Duration) -> Option<thread::Result<T>> {
    let deadline = Instant::now() + timeout;
    while !handle.is_finished() {
        let now = Instant::now();
        if now >= deadline {
            return None;
        }
        thread::sleep(POLL_INTERVAL.min(deadline - now));
    }
    Some(handle.join())
}

fn reader_result(
    id: usize,
    result: thread::Result<ReaderReport>,
    metrics: &RunMetrics,
) -> ReaderReport {
    result.unwrap_or_else(|panic| {
        let reason = format!("reader panicked: {}", panic_message(panic.as_ref()));
        tracing::error!(reader = id, "{reason}");
        metrics.add_reader_failure();
        ReaderReport {
            id,
            expected: 0,
            produced: 0,
            skipped: 0,
            aborted: Some(reason),
        }
    })
}

fn worker_result(
    rank: usize,
    result: thread::Result<WorkerReport>,
    metrics: &RunMetrics,
) -> WorkerReport {
    result.unwrap_or_else(|panic| {
        let reason = format!("worker panicked: {}", panic_message(panic.as_ref()));
        tracing::error!(rank, "{reason}");
        metrics.add_worker_failure();
        WorkerReport {
            rank,
            encoded: 0,
            dropped: 0,
            files: Vec::new(),
            outcome: WorkerOutcome::Crashed(reason),
        }
    })
}
