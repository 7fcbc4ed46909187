//! Synthetic datasets and settings for tests.

use crate::config::{BaseSettings, ConstantColumn, DatasetConfig};
use crate::source::RawRecord;
use serde_json::{json, Value};
use std::path::Path;

/// Sample value that makes [`MockEncoder`](super::MockEncoder) fail.
pub const POISON_SAMPLE: f32 = -7.0;
/// Sample value that makes a [`panicking`](super::MockFactory::panicking) mock panic.
pub const PANIC_SAMPLE: f32 = -9.0;

/// One raw row with the fixture column names.
#[must_use]
pub fn row(text: &str, samples: &[f32], speaker: Option<&str>) -> RawRecord {
    let mut row = RawRecord::new();
    row.insert("text".into(), json!(text));
    row.insert(
        "audio".into(),
        json!({ "array": samples, "sampling_rate": 24_000 }),
    );
    row.insert(
        "speaker".into(),
        speaker.map_or(Value::Null, |s| Value::String(s.to_string())),
    );
    row
}

/// `n` distinct rows: `utterance {i}`, a short sine burst, three speakers.
#[must_use]
pub fn synthetic_rows(n: usize) -> Vec<RawRecord> {
    (0..n)
        .map(|i| {
            let len = 32 + 8 * (i % 5);
            let samples: Vec<f32> = (0..len)
                .map(|t| 0.25 * ((t + i) as f32 * 0.3).sin())
                .collect();
            let speaker = format!("spk{}", i % 3);
            row(&format!("utterance {i}"), &samples, Some(&speaker))
        })
        .collect()
}

/// A row whose audio trips the mock encoder.
#[must_use]
pub fn poisoned_row(text: &str) -> RawRecord {
    row(text, &[0.1, POISON_SAMPLE, 0.1], None)
}

/// A row whose audio makes a panicking mock encoder panic.
#[must_use]
pub fn panicking_row(text: &str) -> RawRecord {
    row(text, &[0.1, PANIC_SAMPLE, 0.1], None)
}

/// Dataset definition matching [`row`], with one constant column `lang: en`.
#[must_use]
pub fn sample_dataset(name: &str, data_files: impl AsRef<Path>) -> DatasetConfig {
    DatasetConfig {
        name: name.to_string(),
        data_files: data_files.as_ref().to_string_lossy().into_owned(),
        text_column_name: "text".into(),
        audio_column_name: "audio".into(),
        speaker_column_name: Some("speaker".into()),
        add_constant: vec![ConstantColumn {
            key: "lang".into(),
            value: "en".into(),
        }],
        split: "train".into(),
        sub_name: None,
    }
}

/// Small, fast settings: 2 readers, 2 workers, `qsize` 4, 3 lines per file.
#[must_use]
pub fn test_settings(out_dir: impl AsRef<Path>) -> BaseSettings {
    let mut s = BaseSettings::new("hubertsiuzdak/snac_24khz", out_dir.as_ref());
    s.num_readers = 2;
    s.num_gpu_units = Some(2);
    s.qsize = 4;
    s.lines_per_file = 3;
    s.gzip_level = 1;
    s.buffer_size = 4096;
    s.join_timeout_secs = 2;
    s.progress = false;
    s
}
