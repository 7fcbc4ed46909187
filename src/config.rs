//! Configuration for an encoding run.
//!
//! One YAML (or JSON) document with three sections: `base_settings` (the
//! pipeline knobs), `save_settings` (where the assembled archive goes) and
//! `datasets` (what to encode, processed in order).
//!
//! ```yaml
//! base_settings:
//!   audio_codec: hubertsiuzdak/snac_24khz
//!   num_readers: 4
//!   qsize: 64
//!   out_dir: ./shards
//!   gzip_level: 6
//!   buffer_size: 1048576
//!   lines_per_file: 10000
//! save_settings:
//!   local: ./archive
//! datasets:
//!   - name: acme/podcasts
//!     data_files: ./data/podcasts-*.jsonl.gz
//!     text_column_name: transcript
//!     audio_column_name: audio
//!     speaker_column_name: speaker_id
//!     add_constant:
//!       - { key: lang, value: en }
//! ```

use crate::codec::CodecSpec;
use crate::error::PipelineError;
use crate::record::{is_reserved_key, ExtraFields, Scalar};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub base_settings: BaseSettings,

    #[serde(default)]
    pub save_settings: SaveSettings,

    #[serde(alias = "hf_datasets")]
    pub datasets: Vec<DatasetConfig>,
}

/// Pipeline knobs shared by every dataset of a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BaseSettings {
    /// Codec model id; also fixes the sample rate and layer count.
    pub audio_codec: String,

    /// Reader threads per dataset
    #[serde(default = "default_num_readers")]
    pub num_readers: usize,

    /// Work queue capacity
    #[serde(default = "default_qsize")]
    pub qsize: usize,

    /// Directory receiving the per-worker shards
    #[serde(alias = "OUT_DIR")]
    pub out_dir: PathBuf,

    /// Gzip level, 0-9
    #[serde(default = "default_gzip_level")]
    pub gzip_level: u32,

    /// Write buffer in front of each gzip stream, in bytes
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,

    /// Records per output file before rotating
    #[serde(default = "default_lines_per_file")]
    pub lines_per_file: usize,

    /// Worker count; detected from the visible accelerators when unset
    #[serde(default)]
    pub num_gpu_units: Option<usize>,

    /// Per-thread join timeout after cancellation, in seconds
    #[serde(default = "default_join_timeout_secs")]
    pub join_timeout_secs: u64,

    /// Show progress bars
    #[serde(default = "default_true")]
    pub progress: bool,

    /// Optional path to save run metrics as JSON
    #[serde(default)]
    pub metrics_path: Option<PathBuf>,
}

impl BaseSettings {
    /// Settings for `audio_codec` writing into `out_dir`, everything else default.
    #[must_use]
    pub fn new(audio_codec: impl Into<String>, out_dir: impl Into<PathBuf>) -> Self {
        Self {
            audio_codec: audio_codec.into(),
            num_readers: default_num_readers(),
            qsize: default_qsize(),
            out_dir: out_dir.into(),
            gzip_level: default_gzip_level(),
            buffer_size: default_buffer_size(),
            lines_per_file: default_lines_per_file(),
            num_gpu_units: None,
            join_timeout_secs: default_join_timeout_secs(),
            progress: true,
            metrics_path: None,
        }
    }

    #[must_use]
    pub fn codec(&self) -> CodecSpec {
        CodecSpec::from_model_id(&self.audio_codec)
    }

    #[must_use]
    pub fn join_timeout(&self) -> Duration {
        Duration::from_secs(self.join_timeout_secs)
    }

    /// Range checks on the numeric knobs.
    ///
    /// # Errors
    /// [`PipelineError::InvalidConfig`] naming the offending setting.
    pub fn validate(&self) -> Result<(), PipelineError> {
        let invalid = |msg: &str| Err(PipelineError::InvalidConfig(msg.to_string()));
        if self.num_readers == 0 {
            return invalid("num_readers must be > 0");
        }
        if self.qsize == 0 {
            return invalid("qsize must be > 0");
        }
        if self.lines_per_file == 0 {
            return invalid("lines_per_file must be > 0");
        }
        if self.buffer_size == 0 {
            return invalid("buffer_size must be > 0");
        }
        if self.gzip_level > 9 {
            return invalid("gzip_level must be 0-9");
        }
        if self.num_gpu_units == Some(0) {
            return invalid("num_gpu_units must be > 0 when set");
        }
        Ok(())
    }
}

/// Where the assembled archive is saved.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SaveSettings {
    #[serde(default)]
    pub local: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConstantColumn {
    pub key: String,
    pub value: Scalar,
}

/// One source dataset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetConfig {
    /// Dataset id, e.g. `org/name`
    pub name: String,

    /// JSONL file or glob holding the rows
    pub data_files: String,

    pub text_column_name: String,
    pub audio_column_name: String,

    #[serde(default)]
    pub speaker_column_name: Option<String>,

    /// Columns with the same value on every record
    #[serde(default)]
    pub add_constant: Vec<ConstantColumn>,

    #[serde(default = "default_split")]
    pub split: String,

    #[serde(default)]
    pub sub_name: Option<String>,
}

impl DatasetConfig {
    /// Output file prefix: the part of `name` after the last `/`.
    #[must_use]
    pub fn dataset_prefix(&self) -> &str {
        self.name.rsplit('/').next().unwrap_or(&self.name)
    }

    #[must_use]
    pub fn constant_columns(&self) -> ExtraFields {
        self.add_constant
            .iter()
            .map(|c| (c.key.clone(), c.value.clone()))
            .collect()
    }

    /// Human readable `name (sub_name) [split]`.
    #[must_use]
    pub fn describe(&self) -> String {
        match &self.sub_name {
            Some(sub) => format!("{} ({sub}) [{}]", self.name, self.split),
            None => format!("{} [{}]", self.name, self.split),
        }
    }
}

impl Config {
    /// Load configuration from a YAML or JSON file.
    /// Format is picked from the extension (.yaml, .yml, or .json); YAML otherwise.
    ///
    /// # Errors
    /// Fails if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("read config {}", path.display()))?;
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
        let config = match ext {
            "json" => Self::from_json(&contents),
            _ => Self::from_yaml(&contents),
        };
        config.with_context(|| format!("parse config {}", path.display()))
    }

    /// # Errors
    /// Fails on malformed YAML or a schema mismatch.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    /// # Errors
    /// Fails on malformed JSON or a schema mismatch.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// # Errors
    /// Fails if serialization fails.
    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Validate settings and dataset definitions.
    ///
    /// All datasets must attach the same set of constant columns, since their
    /// shards end up in one archive. Constant keys may not shadow fields the
    /// workers write themselves.
    ///
    /// # Errors
    /// [`PipelineError::InvalidConfig`] describing the first problem found.
    pub fn validate(&self) -> Result<(), PipelineError> {
        self.base_settings.validate()?;

        if self.datasets.is_empty() {
            return Err(PipelineError::InvalidConfig(
                "no datasets specified in configuration".into(),
            ));
        }

        check_unique_prefixes(&self.datasets)?;

        let mut all_keys = BTreeSet::new();
        for ds in &self.datasets {
            for c in &ds.add_constant {
                if is_reserved_key(&c.key) {
                    return Err(PipelineError::InvalidConfig(format!(
                        "dataset '{}': constant column `{}` collides with an output field",
                        ds.name, c.key
                    )));
                }
                all_keys.insert(c.key.as_str());
            }
        }
        for ds in &self.datasets {
            let keys: BTreeSet<&str> = ds.add_constant.iter().map(|c| c.key.as_str()).collect();
            let missing: Vec<&str> = all_keys.difference(&keys).copied().collect();
            if !missing.is_empty() {
                return Err(PipelineError::InvalidConfig(format!(
                    "dataset '{}' is missing constant columns {missing:?}; \
                     all datasets must have the same constant columns",
                    ds.name
                )));
            }
        }
        Ok(())
    }
}

/// Datasets share `out_dir`, so their output prefixes must differ or the
/// later dataset's shards overwrite the earlier one's.
///
/// # Errors
/// [`PipelineError::InvalidConfig`] naming both datasets.
pub fn check_unique_prefixes(datasets: &[DatasetConfig]) -> Result<(), PipelineError> {
    let mut seen: BTreeMap<&str, &str> = BTreeMap::new();
    for ds in datasets {
        if let Some(first) = seen.insert(ds.dataset_prefix(), &ds.name) {
            return Err(PipelineError::InvalidConfig(format!(
                "datasets '{first}' and '{}' share the output prefix '{}'",
                ds.name,
                ds.dataset_prefix()
            )));
        }
    }
    Ok(())
}

/// Commented sample configuration written by `codecshard generate-config`.
pub const SAMPLE_CONFIG: &str = r#"# codecshard configuration

base_settings:
  # Codec model id. "24khz" -> 24 kHz / 3 layers, "32khz" or "44khz" -> 4 layers
  audio_codec: "hubertsiuzdak/snac_24khz"

  # Reader threads per dataset and work queue capacity
  num_readers: 4
  qsize: 64

  # Shard output
  out_dir: "./shards"
  gzip_level: 6
  buffer_size: 1048576
  lines_per_file: 10000

  # Worker count (default: visible accelerators)
  # num_gpu_units: 2

  # Seconds to wait for each thread after Ctrl-C
  join_timeout_secs: 10

  progress: true
  # metrics_path: "./metrics.json"

save_settings:
  # Directory for the assembled archive (omit to skip)
  local: "./archive"

datasets:
  - name: "org/dataset"
    data_files: "./data/*.jsonl.gz"
    text_column_name: "text"
    audio_column_name: "audio"
    # speaker_column_name: "speaker"
    add_constant:
      - { key: "lang", value: "en" }
    split: "train"
"#;

fn default_num_readers() -> usize {
    num_cpus::get().clamp(1, 8)
}

fn default_qsize() -> usize {
    64
}

fn default_gzip_level() -> u32 {
    6
}

fn default_buffer_size() -> usize {
    1 << 20
}

fn default_lines_per_file() -> usize {
    10_000
}

fn default_join_timeout_secs() -> u64 {
    10
}

fn default_true() -> bool {
    true
}

fn default_split() -> String {
    "train".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sample_config_parses_and_validates() {
        let cfg = Config::from_yaml(SAMPLE_CONFIG).unwrap();
        cfg.validate().unwrap();
        assert_eq!(cfg.datasets[0].dataset_prefix(), "dataset");
        assert_eq!(cfg.base_settings.codec().num_layers, 3);
    }

    #[test]
    fn prefix_without_slash_is_whole_name() {
        let cfg = Config::from_yaml(SAMPLE_CONFIG).unwrap();
        let mut ds = cfg.datasets[0].clone();
        ds.name = "plain".into();
        assert_eq!(ds.dataset_prefix(), "plain");
        assert_eq!(ds.describe(), "plain [train]");
    }
}
