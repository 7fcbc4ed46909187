use anyhow::Result;
use codecshard::config::ConstantColumn;
use codecshard::io::jsonl::write_jsonl_vec;
use codecshard::record::Scalar;
use codecshard::source::{
    shard_range, ItemPreparer, JsonlSource, RawRecord, RecordSource, VecSource,
};
use codecshard::testing::*;
use serde_json::json;

fn texts(source: &dyn RecordSource, n: usize, i: usize) -> Result<Vec<String>> {
    source
        .shard(n, i)?
        .map(|r| Ok(r?["text"].as_str().unwrap_or_default().to_string()))
        .collect()
}

#[test]
fn shards_partition_every_length() {
    for len in 0..40 {
        for n in 1..9 {
            let mut covered = Vec::new();
            let mut sizes = Vec::new();
            for i in 0..n {
                let r = shard_range(len, n, i);
                sizes.push(r.len());
                covered.extend(r);
            }
            assert_eq!(covered, (0..len).collect::<Vec<_>>(), "len={len} n={n}");
            let (min, max) = (sizes.iter().min().unwrap(), sizes.iter().max().unwrap());
            assert!(max - min <= 1, "len={len} n={n} sizes={sizes:?}");
        }
    }
    assert_eq!(shard_range(10, 3, 3), 0..0);
    assert_eq!(shard_range(10, 0, 0), 0..0);
}

#[test]
fn vec_source_shards_are_disjoint() -> Result<()> {
    let source = VecSource::new(synthetic_rows(11));
    let mut all = Vec::new();
    for i in 0..3 {
        all.extend(texts(&source, 3, i)?);
    }
    let expected: Vec<String> = (0..11).map(|i| format!("utterance {i}")).collect();
    assert_eq!(all, expected);
    Ok(())
}

#[test]
fn jsonl_source_spans_files() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let rows = synthetic_rows(10);
    write_jsonl_vec(dir.path().join("part-0.jsonl.gz"), &rows[..4])?;
    write_jsonl_vec(dir.path().join("part-1.jsonl"), &rows[4..5])?;
    write_jsonl_vec(dir.path().join("part-2.jsonl.gz"), &rows[5..])?;

    let pattern = dir.path().join("part-*");
    let source = JsonlSource::open(&pattern.to_string_lossy())?;
    assert_eq!(source.len(), 10);
    assert_eq!(source.files().len(), 3);

    let mut all = Vec::new();
    for i in 0..4 {
        all.extend(texts(&source, 4, i)?);
    }
    let expected: Vec<String> = (0..10).map(|i| format!("utterance {i}")).collect();
    assert_eq!(all, expected);
    Ok(())
}

#[test]
fn jsonl_source_requires_a_match() {
    let dir = tempfile::tempdir().unwrap();
    let pattern = dir.path().join("nothing-*.jsonl");
    assert!(JsonlSource::open(&pattern.to_string_lossy()).is_err());
}

#[test]
fn preparer_extracts_columns_and_constants() -> Result<()> {
    let mut dataset = sample_dataset("org/x", "unused");
    dataset.add_constant.push(ConstantColumn {
        key: "source_id".into(),
        value: Scalar::Int(7),
    });
    let preparer = ItemPreparer::new(&dataset, 24_000);

    let item = preparer.prepare(&row("hello", &[0.5, -0.5], Some("bob")))?;
    assert_eq!(item.text, "hello");
    assert_eq!(item.waveform, vec![0.5, -0.5]);
    assert_eq!(item.speaker.as_deref(), Some("bob"));
    assert_eq!(item.extra_fields.get("lang"), Some(&Scalar::from("en")));
    assert_eq!(item.extra_fields.get("source_id"), Some(&Scalar::Int(7)));

    let nobody = preparer.prepare(&row("hi", &[0.1], None))?;
    assert_eq!(nobody.speaker, None);
    Ok(())
}

#[test]
fn preparer_accepts_plain_sample_arrays() -> Result<()> {
    let mut dataset = sample_dataset("org/x", "unused");
    dataset.speaker_column_name = None;
    let preparer = ItemPreparer::new(&dataset, 24_000);
    let row: RawRecord = json!({"text": "t", "audio": [0.25, 0.5]})
        .as_object()
        .cloned()
        .unwrap_or_default();
    let item = preparer.prepare(&row)?;
    assert_eq!(item.waveform, vec![0.25, 0.5]);
    assert_eq!(item.speaker, None);
    Ok(())
}

#[test]
fn preparer_rejects_bad_rows() {
    let preparer = ItemPreparer::new(&sample_dataset("org/x", "unused"), 24_000);
    let bad = |v: serde_json::Value| {
        let row = v.as_object().cloned().unwrap_or_default();
        format!("{:#}", preparer.prepare(&row).unwrap_err())
    };

    assert!(bad(json!({"audio": [0.1], "speaker": "a"})).contains("missing column `text`"));
    assert!(bad(json!({"text": "t", "speaker": "a"})).contains("missing column `audio`"));
    assert!(bad(json!({"text": "t", "audio": [0.1]})).contains("missing column `speaker`"));
    assert!(bad(json!({"text": "t", "audio": [0.1, "x"], "speaker": "a"})).contains("sample 1"));
    assert!(
        bad(json!({"text": "t", "audio": {"array": [0.1], "sampling_rate": 16000}, "speaker": "a"}))
            .contains("16000 Hz")
    );
}
