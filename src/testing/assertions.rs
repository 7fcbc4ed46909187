//! Reading shards back and checking their layout.

use crate::io::jsonl::read_jsonl_vec;
use crate::record::EncodedRecord;
use anyhow::{anyhow, Context, Result};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// One output file read back from disk.
#[derive(Debug, Clone)]
pub struct ShardFile {
    pub path: PathBuf,
    pub prefix: String,
    pub sequence_index: usize,
    pub records: Vec<EncodedRecord>,
}

/// Split `{prefix}-worker{rank}-{index}.jsonl.gz` into its parts.
#[must_use]
pub fn parse_shard_name(name: &str) -> Option<(String, usize, usize)> {
    let stem = name.strip_suffix(".jsonl.gz")?;
    let (rest, index) = stem.rsplit_once('-')?;
    let (prefix, rank) = rest.rsplit_once("-worker")?;
    Some((prefix.to_string(), rank.parse().ok()?, index.parse().ok()?))
}

/// Every shard in `out_dir`, grouped by worker rank and sorted by index.
///
/// # Errors
/// Fails on unreadable directories, unexpected file names or bad records.
pub fn read_worker_outputs(out_dir: impl AsRef<Path>) -> Result<BTreeMap<usize, Vec<ShardFile>>> {
    let out_dir = out_dir.as_ref();
    let mut by_rank: BTreeMap<usize, Vec<ShardFile>> = BTreeMap::new();
    if !out_dir.exists() {
        return Ok(by_rank);
    }
    let entries =
        std::fs::read_dir(out_dir).with_context(|| format!("list {}", out_dir.display()))?;
    for entry in entries {
        let path = entry?.path();
        let name = path.file_name().and_then(|n| n.to_str()).unwrap_or_default();
        if !name.contains("-worker") {
            continue;
        }
        let (prefix, rank, sequence_index) =
            parse_shard_name(name).ok_or_else(|| anyhow!("unexpected shard name {name}"))?;
        let records = read_jsonl_vec::<EncodedRecord>(&path)?;
        by_rank.entry(rank).or_default().push(ShardFile {
            path,
            prefix,
            sequence_index,
            records,
        });
    }
    for files in by_rank.values_mut() {
        files.sort_by(|a, b| (&a.prefix, a.sequence_index).cmp(&(&b.prefix, b.sequence_index)));
    }
    Ok(by_rank)
}

/// Records across all workers and files.
#[must_use]
pub fn total_records(outputs: &BTreeMap<usize, Vec<ShardFile>>) -> usize {
    outputs
        .values()
        .flat_map(|files| files.iter().map(|f| f.records.len()))
        .sum()
}

/// All records, in no particular order.
#[must_use]
pub fn all_records(outputs: &BTreeMap<usize, Vec<ShardFile>>) -> Vec<&EncodedRecord> {
    outputs
        .values()
        .flat_map(|files| files.iter().flat_map(|f| f.records.iter()))
        .collect()
}

/// Assert that, per worker and dataset prefix, file indices run `0..k`
/// without gaps, every file but the last holds exactly `lines_per_file`
/// records and the last holds `1..=lines_per_file`.
///
/// # Panics
///
/// Panics describing the first violation.
pub fn assert_rotation_invariant(outputs: &BTreeMap<usize, Vec<ShardFile>>, lines_per_file: usize) {
    for (rank, files) in outputs {
        let mut by_prefix: BTreeMap<&str, Vec<&ShardFile>> = BTreeMap::new();
        for f in files {
            by_prefix.entry(f.prefix.as_str()).or_default().push(f);
        }
        for (prefix, files) in by_prefix {
            let counts: Vec<usize> = files.iter().map(|f| f.records.len()).collect();
            for (expected, f) in files.iter().enumerate() {
                assert_eq!(
                    f.sequence_index, expected,
                    "worker {rank} ({prefix}): file indices have a gap: {:?}",
                    files.iter().map(|f| f.sequence_index).collect::<Vec<_>>()
                );
            }
            let Some((last, full)) = counts.split_last() else {
                continue;
            };
            assert!(
                full.iter().all(|&n| n == lines_per_file),
                "worker {rank} ({prefix}): non-final file not full: {counts:?}"
            );
            assert!(
                (1..=lines_per_file).contains(last),
                "worker {rank} ({prefix}): last file holds {last} records: {counts:?}"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shard_names_parse() {
        assert_eq!(
            parse_shard_name("my-ds-worker03-00012.jsonl.gz"),
            Some(("my-ds".to_string(), 3, 12))
        );
        assert_eq!(parse_shard_name("manifest.json"), None);
        assert_eq!(parse_shard_name("ds-workerX-00001.jsonl.gz"), None);
    }
}
