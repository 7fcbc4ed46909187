//! Temporary run directories.

use super::fixtures::{sample_dataset, test_settings};
use crate::config::{BaseSettings, DatasetConfig};
use crate::io::jsonl::write_jsonl_vec;
use crate::source::RawRecord;
use anyhow::Result;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// A temporary directory with `data/`, `shards/` and `archive/` inside.
/// Everything is deleted on drop.
pub struct TestWorkspace {
    dir: TempDir,
}

impl TestWorkspace {
    /// # Errors
    /// Returns an error if the temporary directory cannot be created.
    pub fn new() -> std::io::Result<Self> {
        Ok(Self {
            dir: tempfile::tempdir()?,
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    #[must_use]
    pub fn out_dir(&self) -> PathBuf {
        self.dir.path().join("shards")
    }

    #[must_use]
    pub fn archive_dir(&self) -> PathBuf {
        self.dir.path().join("archive")
    }

    /// [`test_settings`] writing into [`out_dir`](Self::out_dir).
    #[must_use]
    pub fn settings(&self) -> BaseSettings {
        test_settings(self.out_dir())
    }

    /// Write `rows` as `data/{short name}.jsonl.gz` and return a matching
    /// [`sample_dataset`].
    ///
    /// # Errors
    /// Returns an error if the file cannot be written.
    pub fn write_dataset(&self, name: &str, rows: &[RawRecord]) -> Result<DatasetConfig> {
        let short = name.rsplit('/').next().unwrap_or(name);
        let path = self.dir.path().join("data").join(format!("{short}.jsonl.gz"));
        write_jsonl_vec(&path, rows)?;
        Ok(sample_dataset(name, path))
    }
}
