//! Per-worker rotating gzip JSONL output.
//!
//! Each worker owns one [`RotatingWriter`]. Files are named
//! `{prefix}-worker{rank:02}-{index:05}.jsonl.gz` with `index` counting from
//! zero. A file is opened when the first record for it arrives and closed
//! after `lines_per_file` records, so every file on disk holds between 1 and
//! `lines_per_file` complete lines and all but the last are full.
//!
//! Records are serialized into memory before anything is written; a record
//! that fails to serialize leaves the current file untouched. A failed write
//! may leave a partial line behind, so the file is abandoned: it is closed as
//! far as possible, left out of the summaries, and the next record starts a
//! new sequence index.

use crate::io::compression::gzip_writer;
use crate::record::EncodedRecord;
use anyhow::{Context, Result};
use flate2::write::GzEncoder;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

/// Output settings for one worker.
#[derive(Debug, Clone)]
pub struct WriterConfig {
    pub out_dir: PathBuf,
    pub dataset_prefix: String,
    pub rank: usize,
    pub lines_per_file: usize,
    pub gzip_level: u32,
    pub buffer_size: usize,
}

/// A closed output file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileSummary {
    pub path: PathBuf,
    pub sequence_index: usize,
    pub records: usize,
    /// Compressed size on disk.
    pub bytes: u64,
}

struct OpenFile {
    path: PathBuf,
    sequence_index: usize,
    records: usize,
    encoder: GzEncoder<BufWriter<File>>,
}

pub struct RotatingWriter {
    config: WriterConfig,
    current: Option<OpenFile>,
    next_index: usize,
    closed: Vec<FileSummary>,
    abandoned: Vec<PathBuf>,
}

/// Path of output file `index` for `rank`.
#[must_use]
pub fn shard_path(out_dir: &Path, prefix: &str, rank: usize, index: usize) -> PathBuf {
    out_dir.join(format!("{prefix}-worker{rank:02}-{index:05}.jsonl.gz"))
}

impl RotatingWriter {
    /// Prepare a writer. Creates `out_dir` if needed; no file is opened yet.
    ///
    /// # Errors
    /// Fails if `lines_per_file` is zero or the directory cannot be created.
    pub fn new(config: WriterConfig) -> Result<Self> {
        anyhow::ensure!(config.lines_per_file > 0, "lines_per_file must be > 0");
        fs::create_dir_all(&config.out_dir)
            .with_context(|| format!("create output dir {}", config.out_dir.display()))?;
        Ok(Self {
            config,
            current: None,
            next_index: 0,
            closed: Vec::new(),
            abandoned: Vec::new(),
        })
    }

    /// Append one record, rotating to a new file after `lines_per_file` lines.
    ///
    /// Returns the index of the file the record went into.
    ///
    /// # Errors
    /// Serialization, open and write failures; in each case the record is not
    /// on disk. A write failure abandons the current file. Once the record is
    /// written, a failure closing the full file is logged and the file
    /// abandoned, but the append still succeeds.
    pub fn append(&mut self, record: &EncodedRecord) -> Result<usize> {
        let line = record.to_json_line()?;

        let file = match self.current.take() {
            Some(file) => file,
            None => Self::open(&self.config, self.next_index)?,
        };
        let file = self.current.insert(file);
        if let Err(e) = file.encoder.write_all(&line) {
            let path = file.path.clone();
            self.abandon();
            return Err(e).with_context(|| format!("write {}", path.display()));
        }
        file.records += 1;
        let index = file.sequence_index;

        if file.records >= self.config.lines_per_file
            && let Err(e) = self.rotate()
        {
            tracing::error!(
                error = %format!("{e:#}"),
                "output file abandoned after rotation failure"
            );
        }
        Ok(index)
    }

    fn open(config: &WriterConfig, index: usize) -> Result<OpenFile> {
        let path = shard_path(&config.out_dir, &config.dataset_prefix, config.rank, index);
        let file = File::create(&path).with_context(|| format!("create {}", path.display()))?;
        tracing::debug!(path = %path.display(), "opened output file");
        Ok(OpenFile {
            encoder: gzip_writer(
                BufWriter::with_capacity(config.buffer_size, file),
                config.gzip_level,
            ),
            path,
            sequence_index: index,
            records: 0,
        })
    }

    /// Close the current file, if any. The next append opens a new one.
    ///
    /// A file that cannot be closed is recorded as abandoned.
    fn rotate(&mut self) -> Result<()> {
        let Some(file) = self.current.take() else {
            return Ok(());
        };
        self.next_index = file.sequence_index + 1;
        let path = file.path.clone();
        match Self::close(file) {
            Ok(summary) => {
                tracing::debug!(
                    path = %summary.path.display(),
                    records = summary.records,
                    bytes = summary.bytes,
                    "closed output file"
                );
                self.closed.push(summary);
                Ok(())
            }
            Err(e) => {
                self.abandoned.push(path);
                Err(e)
            }
        }
    }

    /// Drop the current file after a failed write. Its earlier records are
    /// flushed if the stream still allows it.
    fn abandon(&mut self) {
        let Some(file) = self.current.take() else {
            return;
        };
        self.next_index = file.sequence_index + 1;
        let (path, records) = (file.path.clone(), file.records);
        if let Err(e) = Self::close(file) {
            tracing::debug!(
                path = %path.display(),
                error = %format!("{e:#}"),
                "close after failed write"
            );
        }
        tracing::warn!(
            path = %path.display(),
            records,
            "abandoned output file after a failed write"
        );
        self.abandoned.push(path);
    }

    fn close(file: OpenFile) -> Result<FileSummary> {
        let OpenFile {
            path,
            sequence_index,
            records,
            encoder,
        } = file;
        let buffered = encoder
            .finish()
            .with_context(|| format!("finish gzip stream {}", path.display()))?;
        let inner = buffered
            .into_inner()
            .map_err(|e| e.into_error())
            .with_context(|| format!("flush {}", path.display()))?;
        inner
            .sync_all()
            .with_context(|| format!("sync {}", path.display()))?;
        let bytes = fs::metadata(&path)?.len();
        Ok(FileSummary {
            path,
            sequence_index,
            records,
            bytes,
        })
    }

    /// Records in the file currently open.
    #[must_use]
    pub fn pending_records(&self) -> usize {
        self.current.as_ref().map_or(0, |f| f.records)
    }

    /// Files closed so far.
    #[must_use]
    pub fn closed_files(&self) -> &[FileSummary] {
        &self.closed
    }

    /// Files given up on after a write or close failure.
    #[must_use]
    pub fn abandoned_files(&self) -> &[PathBuf] {
        &self.abandoned
    }

    /// Close the last file and return every file written, in order.
    ///
    /// # Errors
    /// Fails if the final file cannot be flushed.
    pub fn finish(mut self) -> Result<Vec<FileSummary>> {
        self.rotate()?;
        Ok(self.closed)
    }
}
