//! JSON Lines (JSONL) utilities.
//!
//! This module provides:
//! - **Typed vector I/O** with Serde: [`read_jsonl_vec`] and [`write_jsonl_vec`]
//! - **Record counting**: [`count_records`]
//! - **Streaming range reads**: [`JsonlRange`], a lazy iterator over records
//!   `[start, end)` of one file
//!
//! # Notes
//! - Blank/whitespace-only lines are not records: they are skipped on read and
//!   not counted, so record indices are stable whatever the line layout.
//! - Compressed inputs are detected transparently (see [`super::compression`]).
//!   Compressed streams cannot seek, so a range read decompresses from the
//!   start and skips until `start`.

use crate::io::compression::{gzip_writer, open_lines, Compression};
use anyhow::{Context, Result};
use serde::{de::DeserializeOwned, Serialize};
use std::fs::{create_dir_all, File};
use std::io::{BufRead, BufWriter, Lines, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

/// Read a JSONL file into a typed `Vec<T>`.
///
/// # Errors
/// Returns an error if the file cannot be opened, read, or if any line fails
/// to parse into `T`. Errors carry the line number.
pub fn read_jsonl_vec<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<Vec<T>> {
    JsonlRange::<T>::open(path, 0, u64::MAX)?.collect()
}

/// Write a typed slice as JSONL, one compact JSON value per line.
///
/// Parent directories are created as needed. A `.gz` path is gzip-compressed
/// at the default level.
///
/// # Errors
/// Returns an error if the file/dirs cannot be created or any item fails to
/// serialize/flush.
pub fn write_jsonl_vec<T: Serialize>(path: impl AsRef<Path>, data: &[T]) -> Result<usize> {
    let path = path.as_ref();
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        create_dir_all(parent).with_context(|| format!("mkdir -p {}", parent.display()))?;
    }
    let f = File::create(path).with_context(|| format!("create {}", path.display()))?;
    if Compression::from_path(path) == Some(Compression::Gzip) {
        let mut w = gzip_writer(BufWriter::new(f), 6);
        write_lines(&mut w, data, path)?;
        w.finish()?.flush()?;
    } else {
        let mut w = BufWriter::new(f);
        write_lines(&mut w, data, path)?;
        w.flush()?;
    }
    Ok(data.len())
}

fn write_lines<W: Write, T: Serialize>(w: &mut W, data: &[T], path: &Path) -> Result<()> {
    for (i, item) in data.iter().enumerate() {
        serde_json::to_writer(&mut *w, item)
            .with_context(|| format!("serialize item #{} to {}", i, path.display()))?;
        w.write_all(b"\n")?;
    }
    Ok(())
}

/// Count the records (non-blank lines) of a JSONL file.
///
/// # Errors
/// Returns an error if the file cannot be opened or read.
pub fn count_records(path: impl AsRef<Path>) -> Result<u64> {
    let path = path.as_ref();
    let mut total = 0u64;
    for (i, line) in open_lines(path)?.lines().enumerate() {
        let line = line.with_context(|| format!("read line {} in {}", i + 1, path.display()))?;
        if !line.trim().is_empty() {
            total += 1;
        }
    }
    Ok(total)
}

/// Lazy iterator over records `[start, end)` of one JSONL file.
///
/// Stops at the first read error after yielding it.
pub struct JsonlRange<T> {
    path: PathBuf,
    lines: Lines<Box<dyn BufRead>>,
    line_no: u64,
    record_idx: u64,
    start: u64,
    end: u64,
    failed: bool,
    _marker: PhantomData<T>,
}

impl<T: DeserializeOwned> JsonlRange<T> {
    /// Open `path` and position the iterator before record `start`.
    ///
    /// # Errors
    /// Fails if the file cannot be opened.
    pub fn open(path: impl AsRef<Path>, start: u64, end: u64) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let lines = open_lines(&path)?.lines();
        Ok(Self {
            path,
            lines,
            line_no: 0,
            record_idx: 0,
            start,
            end,
            failed: false,
            _marker: PhantomData,
        })
    }
}

impl<T: DeserializeOwned> Iterator for JsonlRange<T> {
    type Item = Result<T>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        while self.record_idx < self.end {
            let line = match self.lines.next()? {
                Ok(line) => line,
                Err(e) => {
                    self.failed = true;
                    return Some(Err(e).with_context(|| {
                        format!("read line {} in {}", self.line_no + 1, self.path.display())
                    }));
                }
            };
            self.line_no += 1;
            if line.trim().is_empty() {
                continue;
            }
            let idx = self.record_idx;
            self.record_idx += 1;
            if idx < self.start {
                continue;
            }
            return Some(serde_json::from_str(&line).with_context(|| {
                format!("parse JSONL line {} in {}", self.line_no, self.path.display())
            }));
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Rec {
        id: u32,
    }

    #[test]
    fn range_skips_blank_lines_and_respects_bounds() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("in.jsonl");
        std::fs::write(&path, "{\"id\":0}\n\n{\"id\":1}\n   \n{\"id\":2}\n{\"id\":3}\n")?;

        assert_eq!(count_records(&path)?, 4);
        let mid: Vec<Rec> = JsonlRange::open(&path, 1, 3)?.collect::<Result<_>>()?;
        assert_eq!(mid, vec![Rec { id: 1 }, Rec { id: 2 }]);
        Ok(())
    }

    #[test]
    fn gzip_roundtrip() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("nested/out.jsonl.gz");
        let data: Vec<Rec> = (0..5).map(|id| Rec { id }).collect();
        assert_eq!(write_jsonl_vec(&path, &data)?, 5);
        assert_eq!(read_jsonl_vec::<Rec>(&path)?, data);
        Ok(())
    }

    #[test]
    fn parse_errors_carry_line_numbers() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("bad.jsonl");
        std::fs::write(&path, "{\"id\":0}\nnot json\n")?;
        let err = read_jsonl_vec::<Rec>(&path).unwrap_err();
        assert!(format!("{err:#}").contains("line 2"));
        Ok(())
    }
}
