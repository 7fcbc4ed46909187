//! The source dataset, seen through the operations readers need.
//!
//! A [`RecordSource`] knows its length and can produce any one of `n`
//! disjoint shards as a stream of raw rows. An [`ItemPreparer`] turns one raw
//! row into a [`WorkItem`] by pulling the configured text/audio/speaker
//! columns and attaching the dataset's constant columns.
//!
//! Shards are opened on the reader's own thread, so streams do not need to be
//! `Send`.

use crate::config::DatasetConfig;
use crate::io::jsonl::{count_records, JsonlRange};
use crate::record::{ExtraFields, WorkItem};
use anyhow::{anyhow, bail, Context, Result};
use serde_json::{Map, Value};
use std::ops::Range;
use std::path::PathBuf;
use std::sync::Arc;

/// One row of the source dataset.
pub type RawRecord = Map<String, Value>;

/// Rows of one shard, in shard order.
pub type RecordStream<'a> = Box<dyn Iterator<Item = Result<RawRecord>> + 'a>;

pub trait RecordSource: Send + Sync {
    /// Total number of rows.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Rows of shard `index` out of `num_shards`, see [`shard_range`].
    ///
    /// # Errors
    /// Fails if the shard cannot be opened at all; per-row failures are
    /// reported through the stream instead.
    fn shard(&self, num_shards: usize, index: usize) -> Result<RecordStream<'_>>;
}

/// Row indices assigned to shard `index` of `num_shards`.
///
/// Shards are contiguous: the first `len % num_shards` shards receive one
/// extra row. Together they cover `0..len` exactly once. An out-of-range
/// `index` (or zero shards) gets an empty range.
#[must_use]
pub fn shard_range(len: usize, num_shards: usize, index: usize) -> Range<usize> {
    if num_shards == 0 || index >= num_shards {
        return 0..0;
    }
    let div = len / num_shards;
    let rem = len % num_shards;
    let start = div * index + index.min(rem);
    let end = start + div + usize::from(index < rem);
    start..end
}

/// In-memory rows.
#[derive(Debug, Clone, Default)]
pub struct VecSource {
    rows: Arc<Vec<RawRecord>>,
}

impl VecSource {
    #[must_use]
    pub fn new(rows: Vec<RawRecord>) -> Self {
        Self {
            rows: Arc::new(rows),
        }
    }
}

impl RecordSource for VecSource {
    fn len(&self) -> usize {
        self.rows.len()
    }

    fn shard(&self, num_shards: usize, index: usize) -> Result<RecordStream<'_>> {
        let range = shard_range(self.rows.len(), num_shards, index);
        Ok(Box::new(self.rows[range].iter().cloned().map(Ok)))
    }
}

/// Rows stored in one or more JSONL files (optionally compressed).
///
/// Files are ordered by path and treated as one concatenated sequence.
#[derive(Debug, Clone)]
pub struct JsonlSource {
    files: Vec<(PathBuf, u64)>,
    total: u64,
}

impl JsonlSource {
    /// Resolve `pattern` (a path or glob) and count the rows of every file.
    ///
    /// # Errors
    /// Fails on an invalid pattern, when nothing matches, or when a file
    /// cannot be read.
    pub fn open(pattern: &str) -> Result<Self> {
        let mut paths: Vec<PathBuf> = glob::glob(pattern)
            .with_context(|| format!("invalid data_files pattern {pattern:?}"))?
            .collect::<Result<_, _>>()
            .with_context(|| format!("expand {pattern:?}"))?;
        paths.sort();
        if paths.is_empty() {
            bail!("no files match {pattern:?}");
        }
        let mut files = Vec::with_capacity(paths.len());
        let mut total = 0u64;
        for path in paths {
            let n = count_records(&path)?;
            total += n;
            files.push((path, n));
        }
        Ok(Self { files, total })
    }

    #[must_use]
    pub fn files(&self) -> Vec<&PathBuf> {
        self.files.iter().map(|(p, _)| p).collect()
    }
}

impl RecordSource for JsonlSource {
    fn len(&self) -> usize {
        self.total as usize
    }

    fn shard(&self, num_shards: usize, index: usize) -> Result<RecordStream<'_>> {
        let range = shard_range(self.total as usize, num_shards, index);
        let (start, end) = (range.start as u64, range.end as u64);

        let mut pieces = Vec::new();
        let mut offset = 0u64;
        for (path, n) in &self.files {
            let (lo, hi) = (offset, offset + n);
            offset = hi;
            if hi <= start || lo >= end {
                continue;
            }
            std::fs::metadata(path)
                .with_context(|| format!("shard {index}/{num_shards}: {}", path.display()))?;
            pieces.push((path, start.max(lo) - lo, end.min(hi) - lo));
        }

        Ok(Box::new(pieces.into_iter().flat_map(|(path, s, e)| {
            match JsonlRange::<RawRecord>::open(path, s, e) {
                Ok(rows) => Box::new(rows) as RecordStream<'_>,
                Err(err) => Box::new(std::iter::once(Err(err))),
            }
        })))
    }
}

/// Builds work items from raw rows for one dataset.
#[derive(Debug, Clone)]
pub struct ItemPreparer {
    text_column: String,
    audio_column: String,
    speaker_column: Option<String>,
    constants: ExtraFields,
    sample_rate: u32,
}

impl ItemPreparer {
    #[must_use]
    pub fn new(dataset: &DatasetConfig, sample_rate: u32) -> Self {
        Self {
            text_column: dataset.text_column_name.clone(),
            audio_column: dataset.audio_column_name.clone(),
            speaker_column: dataset.speaker_column_name.clone(),
            constants: dataset.constant_columns(),
            sample_rate,
        }
    }

    /// Extract text, waveform and speaker, then attach the constant columns.
    ///
    /// The audio column holds either a plain array of samples or an object
    /// `{"array": [...], "sampling_rate": n}`. Audio at a different rate than
    /// the run's is rejected; resampling belongs to the dataset loader.
    ///
    /// # Errors
    /// Missing columns, wrong value types and rate mismatches.
    pub fn prepare(&self, row: &RawRecord) -> Result<WorkItem> {
        let text = match row.get(&self.text_column) {
            Some(Value::String(s)) => s.clone(),
            Some(other) => bail!("column `{}` is not a string: {other}", self.text_column),
            None => bail!("missing column `{}`", self.text_column),
        };

        let audio = row
            .get(&self.audio_column)
            .ok_or_else(|| anyhow!("missing column `{}`", self.audio_column))?;
        let waveform = self.waveform(audio)?;

        let speaker = match &self.speaker_column {
            None => None,
            Some(col) => match row.get(col) {
                None => bail!("missing column `{col}`"),
                Some(Value::Null) => None,
                Some(Value::String(s)) => Some(s.clone()),
                Some(other) => Some(other.to_string()),
            },
        };

        Ok(WorkItem {
            text,
            waveform,
            speaker,
            extra_fields: self.constants.clone(),
        })
    }

    fn waveform(&self, audio: &Value) -> Result<Vec<f32>> {
        let samples = match audio {
            Value::Array(samples) => samples,
            Value::Object(obj) => {
                if let Some(rate) = obj.get("sampling_rate").and_then(Value::as_u64)
                    && rate != u64::from(self.sample_rate)
                {
                    bail!(
                        "column `{}` sampled at {rate} Hz, expected {} Hz",
                        self.audio_column,
                        self.sample_rate
                    );
                }
                match obj.get("array") {
                    Some(Value::Array(samples)) => samples,
                    _ => bail!("column `{}` has no `array` of samples", self.audio_column),
                }
            }
            other => bail!("column `{}` is not audio: {other}", self.audio_column),
        };
        samples
            .iter()
            .enumerate()
            .map(|(i, v)| {
                v.as_f64()
                    .map(|x| x as f32)
                    .ok_or_else(|| anyhow!("sample {i} of `{}` is not a number", self.audio_column))
            })
            .collect()
    }
}
