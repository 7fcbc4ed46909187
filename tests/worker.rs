use anyhow::Result;
use codecshard::cancel::CancelToken;
use codecshard::metrics::RunMetrics;
use codecshard::progress::StatusBar;
use codecshard::queue::WorkQueue;
use codecshard::record::{QueueMessage, WorkItem};
use codecshard::source::ItemPreparer;
use codecshard::testing::*;
use codecshard::worker::{Worker, WorkerOutcome};
use codecshard::writer::WriterConfig;
use std::path::Path;
use std::sync::Arc;

fn items(rows: &[codecshard::source::RawRecord]) -> Result<Vec<WorkItem>> {
    let preparer = ItemPreparer::new(&sample_dataset("org/w", "unused"), 24_000);
    rows.iter().map(|r| preparer.prepare(r)).collect()
}

fn writer_config(dir: &Path) -> WriterConfig {
    WriterConfig {
        out_dir: dir.to_path_buf(),
        dataset_prefix: "w".into(),
        rank: 0,
        lines_per_file: 2,
        gzip_level: 1,
        buffer_size: 256,
    }
}

fn worker(
    queue: &WorkQueue,
    cancel: &CancelToken,
    factory: MockFactory,
    dir: &Path,
    metrics: &Arc<RunMetrics>,
) -> Worker {
    Worker::new(
        0,
        queue.clone(),
        cancel.clone(),
        Arc::new(factory),
        writer_config(dir),
        Arc::clone(metrics),
        StatusBar::hidden("gpu-0"),
    )
}

#[test]
fn drains_until_sentinel_and_drops_bad_items() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let queue = WorkQueue::bounded(16)?;
    let cancel = CancelToken::new();
    let metrics = RunMetrics::new();

    let mut rows = synthetic_rows(4);
    rows.insert(1, poisoned_row("bad"));
    for it in items(&rows)? {
        queue.put(it, &cancel)?;
    }
    queue.put_sentinel(&cancel)?;

    let report = worker(&queue, &cancel, MockFactory::new(2), dir.path(), &metrics).run();

    assert_eq!(report.outcome, WorkerOutcome::Completed);
    assert_eq!((report.encoded, report.dropped), (4, 1));
    let counts: Vec<usize> = report.files.iter().map(|f| f.records).collect();
    assert_eq!(counts, vec![2, 2]);
    assert_eq!(report.bytes_written(), metrics.snapshot().bytes_written);
    assert_eq!(metrics.snapshot().files_written, 2);
    assert!(queue.is_empty());

    let outputs = read_worker_outputs(dir.path())?;
    let texts: Vec<&str> = all_records(&outputs).iter().map(|r| r.text.as_str()).collect();
    assert_eq!(texts, vec!["utterance 0", "utterance 1", "utterance 2", "utterance 3"]);
    Ok(())
}

#[test]
fn items_after_the_sentinel_are_left_alone() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let queue = WorkQueue::bounded(8)?;
    let cancel = CancelToken::new();
    let mut it = items(&synthetic_rows(2))?.into_iter();
    queue.put(it.next().unwrap(), &cancel)?;
    queue.put_sentinel(&cancel)?;
    queue.put(it.next().unwrap(), &cancel)?;

    let report = worker(&queue, &cancel, MockFactory::new(2), dir.path(), &RunMetrics::new()).run();

    assert_eq!(report.encoded, 1);
    assert_eq!(queue.len(), 1);
    Ok(())
}

#[test]
fn load_failure_crashes_without_output() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let queue = WorkQueue::bounded(4)?;
    let cancel = CancelToken::new();
    let metrics = RunMetrics::new();
    queue.put_sentinel(&cancel)?;

    let factory = MockFactory::new(2).failing_on([0]);
    let report = worker(&queue, &cancel, factory, &dir.path().join("out"), &metrics).run();

    assert!(matches!(report.outcome, WorkerOutcome::Crashed(ref msg) if msg.contains("device 0")));
    assert!(report.files.is_empty());
    assert_eq!(metrics.snapshot().worker_failures, 1);
    // the sentinel was never consumed
    assert_eq!(queue.get(&cancel)?, QueueMessage::Sentinel);
    assert!(!dir.path().join("out").exists());
    Ok(())
}

#[test]
fn cancelled_worker_closes_its_file() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let queue = WorkQueue::bounded(4)?;
    let cancel = CancelToken::new();
    for it in items(&synthetic_rows(3))? {
        queue.put(it, &cancel)?;
    }

    let handle = {
        let w = worker(&queue, &cancel, MockFactory::new(2), dir.path(), &RunMetrics::new());
        std::thread::spawn(move || w.run())
    };
    while !queue.is_empty() {
        std::thread::sleep(std::time::Duration::from_millis(10));
    }
    std::thread::sleep(std::time::Duration::from_millis(100));
    cancel.cancel();
    let report = handle.join().unwrap();

    assert_eq!(report.outcome, WorkerOutcome::Cancelled);
    assert_eq!(report.encoded, 3);
    let outputs = read_worker_outputs(dir.path())?;
    assert_eq!(total_records(&outputs), 3);
    assert_rotation_invariant(&outputs, 2);
    Ok(())
}
