//! Final archive assembly.
//!
//! After every dataset is encoded, the per-worker shards in `out_dir` are
//! checked one by one (each must decompress and parse on its own), described
//! in a `manifest.json`, and optionally concatenated into a single
//! multi-member gzip file.

use crate::config::SaveSettings;
use crate::record::EncodedRecord;
use anyhow::{bail, Context, Result};
use flate2::read::MultiGzDecoder;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

/// Name of the concatenated archive inside `save_settings.local`.
pub const ARCHIVE_NAME: &str = "data.jsonl.gz";
pub const MANIFEST_NAME: &str = "manifest.json";

/// One verified shard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardInfo {
    pub name: String,
    pub records: u64,
    pub bytes: u64,
    pub sha256: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub files: Vec<ShardInfo>,
    pub total_records: u64,
    pub total_bytes: u64,
}

#[derive(Debug, Clone)]
pub struct ArchiveReport {
    pub manifest: Manifest,
    pub manifest_path: PathBuf,
    /// Set when the shards were concatenated.
    pub archive_path: Option<PathBuf>,
}

/// SHA-256 of `data` as lowercase hex.
#[must_use]
pub fn compute_checksum(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

fn shard_files(out_dir: &Path) -> Result<Vec<PathBuf>> {
    let pattern = out_dir.join("*.jsonl.gz");
    let pattern = pattern.to_string_lossy();
    let mut files: Vec<PathBuf> = glob::glob(&pattern)
        .with_context(|| format!("invalid output pattern {pattern}"))?
        .collect::<Result<_, _>>()?;
    files.retain(|p| p.file_name().is_some_and(|n| n != ARCHIVE_NAME));
    files.sort();
    Ok(files)
}

/// Decompress and parse every line of one shard.
fn verify_shard(path: &Path) -> Result<ShardInfo> {
    let data = fs::read(path).with_context(|| format!("read {}", path.display()))?;
    let sha256 = compute_checksum(&data);
    let reader = BufReader::new(MultiGzDecoder::new(data.as_slice()));
    let mut records = 0u64;
    for (i, line) in reader.lines().enumerate() {
        let line = line.with_context(|| format!("decompress {}", path.display()))?;
        if line.trim().is_empty() {
            continue;
        }
        serde_json::from_str::<EncodedRecord>(&line)
            .with_context(|| format!("{}: line {}", path.display(), i + 1))?;
        records += 1;
    }
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    Ok(ShardInfo {
        name,
        records,
        bytes: data.len() as u64,
        sha256,
    })
}

/// Verify every shard in `out_dir` and describe them, without writing.
///
/// # Errors
/// Fails if a shard is unreadable, truncated or holds a malformed record.
pub fn inspect_output(out_dir: impl AsRef<Path>) -> Result<Manifest> {
    let files = shard_files(out_dir.as_ref())?;

    #[cfg(feature = "parallel-io")]
    let infos: Vec<ShardInfo> = {
        use rayon::prelude::*;
        files
            .par_iter()
            .map(|p| verify_shard(p))
            .collect::<Result<_>>()?
    };
    #[cfg(not(feature = "parallel-io"))]
    let infos: Vec<ShardInfo> = files
        .iter()
        .map(|p| verify_shard(p))
        .collect::<Result<_>>()?;

    Ok(Manifest {
        total_records: infos.iter().map(|f| f.records).sum(),
        total_bytes: infos.iter().map(|f| f.bytes).sum(),
        files: infos,
    })
}

/// Verify the shards, write `manifest.json` next to them and, when
/// `save.local` is set, concatenate them into `{local}/data.jsonl.gz` with a
/// copy of the manifest.
///
/// # Errors
/// Fails when `out_dir` holds no shards, or on any verification or I/O error.
pub fn assemble_archive(out_dir: impl AsRef<Path>, save: &SaveSettings) -> Result<ArchiveReport> {
    let out_dir = out_dir.as_ref();
    let manifest = inspect_output(out_dir)?;
    if manifest.files.is_empty() {
        bail!("no shards found in {}", out_dir.display());
    }

    let manifest_json = serde_json::to_vec_pretty(&manifest)?;
    let manifest_path = out_dir.join(MANIFEST_NAME);
    fs::write(&manifest_path, &manifest_json)
        .with_context(|| format!("write {}", manifest_path.display()))?;

    let archive_path = match &save.local {
        None => None,
        Some(local) => {
            fs::create_dir_all(local).with_context(|| format!("mkdir -p {}", local.display()))?;
            let archive = local.join(ARCHIVE_NAME);
            let mut out = BufWriter::new(
                File::create(&archive).with_context(|| format!("create {}", archive.display()))?,
            );
            for shard in &manifest.files {
                let mut r = BufReader::new(File::open(out_dir.join(&shard.name))?);
                std::io::copy(&mut r, &mut out)?;
            }
            out.flush()?;
            fs::write(local.join(MANIFEST_NAME), &manifest_json)?;
            Some(archive)
        }
    };

    tracing::info!(
        files = manifest.files.len(),
        records = manifest.total_records,
        bytes = manifest.total_bytes,
        archive = ?archive_path,
        "archive assembled"
    );
    Ok(ArchiveReport {
        manifest,
        manifest_path,
        archive_path,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checksum_of_known_inputs() {
        assert_eq!(
            compute_checksum(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        assert_eq!(
            compute_checksum(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn archive_itself_is_not_a_shard() -> Result<()> {
        let dir = tempfile::tempdir()?;
        fs::write(dir.path().join("a-worker00-00000.jsonl.gz"), b"")?;
        fs::write(dir.path().join(ARCHIVE_NAME), b"")?;
        let names: Vec<PathBuf> = shard_files(dir.path())?;
        assert_eq!(names, vec![dir.path().join("a-worker00-00000.jsonl.gz")]);
        Ok(())
    }
}
