use anyhow::Result;
use codecshard::error::PipelineError;
use codecshard::orchestrator::Pipeline;
use codecshard::source::{JsonlSource, VecSource};
use codecshard::testing::*;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

#[test]
fn ten_records_two_readers_two_workers() -> Result<()> {
    let ws = TestWorkspace::new()?;
    let dataset = ws.write_dataset("org/scenario", &synthetic_rows(10))?;
    let pipeline = Pipeline::new(ws.settings(), Arc::new(MockFactory::new(3)))?;

    let report = pipeline.run(std::slice::from_ref(&dataset))?;
    let ds = &report.datasets[0];

    let produced: Vec<u64> = ds.readers.iter().map(|r| r.produced).collect();
    assert_eq!(produced, vec![5, 5]);
    assert_eq!(ds.items_enqueued(), 10);
    assert_eq!(ds.records_written(), 10);
    assert_eq!(ds.items_dropped(), 0);
    assert!(ds.workers.iter().all(|w| w.is_completed()));

    let outputs = read_worker_outputs(ws.out_dir())?;
    assert_eq!(total_records(&outputs), 10);
    assert_rotation_invariant(&outputs, 3);

    let remainders: usize = outputs
        .values()
        .map(|files| files.iter().map(|f| f.records.len()).sum::<usize>() % 3)
        .sum();
    assert!(remainders <= 2 * (3 - 1));

    assert_eq!(report.metrics.records_encoded, 10);
    assert_eq!(report.metrics.files_written as usize, ds.files().count());
    assert!(report.archive.is_none());
    Ok(())
}

#[test]
fn fields_pass_through_unchanged() -> Result<()> {
    let ws = TestWorkspace::new()?;
    let dataset = ws.write_dataset("org/fields", &synthetic_rows(7))?;
    let pipeline = Pipeline::new(ws.settings(), Arc::new(MockFactory::new(3)))?;
    pipeline.run(std::slice::from_ref(&dataset))?;

    let outputs = read_worker_outputs(ws.out_dir())?;
    let records = all_records(&outputs);
    let texts: BTreeSet<&str> = records.iter().map(|r| r.text.as_str()).collect();
    let expected: BTreeSet<String> = (0..7).map(|i| format!("utterance {i}")).collect();
    assert_eq!(texts, expected.iter().map(String::as_str).collect::<BTreeSet<_>>());

    for r in records {
        let i: usize = r.text.trim_start_matches("utterance ").parse()?;
        assert_eq!(r.speaker.as_deref(), Some(format!("spk{}", i % 3).as_str()));
        assert_eq!(r.extra_fields.get("lang"), Some(&"en".into()));
        assert_eq!(r.num_layers, 3);
        assert_eq!(r.layers.len(), 3);
        assert_eq!(r.token_lengths, vec![1, 2, 3]);
    }
    Ok(())
}

#[test]
fn single_worker_keeps_dequeue_order() -> Result<()> {
    let ws = TestWorkspace::new()?;
    let mut settings = ws.settings();
    settings.num_readers = 1;
    settings.num_gpu_units = Some(1);
    settings.lines_per_file = 4;
    let pipeline = Pipeline::new(settings, Arc::new(MockFactory::new(3)))?;
    let dataset = sample_dataset("org/ordered", "unused");

    pipeline.process_dataset(&dataset, Arc::new(VecSource::new(synthetic_rows(9))))?;

    let outputs = read_worker_outputs(ws.out_dir())?;
    let texts: Vec<String> = all_records(&outputs).iter().map(|r| r.text.clone()).collect();
    let expected: Vec<String> = (0..9).map(|i| format!("utterance {i}")).collect();
    assert_eq!(texts, expected);
    assert_rotation_invariant(&outputs, 4);
    Ok(())
}

#[test]
fn encode_failure_drops_one_item() -> Result<()> {
    let ws = TestWorkspace::new()?;
    let mut rows = synthetic_rows(6);
    rows.insert(3, poisoned_row("bad"));
    let pipeline = Pipeline::new(ws.settings(), Arc::new(MockFactory::new(3)))?;
    let dataset = sample_dataset("org/poison", "unused");

    let report = pipeline.process_dataset(&dataset, Arc::new(VecSource::new(rows)))?;

    assert_eq!(report.items_enqueued(), 7);
    assert_eq!(report.records_written(), 6);
    assert_eq!(report.items_dropped(), 1);
    assert!(report.workers.iter().all(|w| w.is_completed()));
    assert_eq!(pipeline.metrics().snapshot().items_dropped, 1);

    let outputs = read_worker_outputs(ws.out_dir())?;
    assert_eq!(total_records(&outputs), 6);
    assert!(all_records(&outputs).iter().all(|r| r.text != "bad"));
    assert_rotation_invariant(&outputs, 3);
    Ok(())
}

#[test]
fn encoder_panic_is_contained() -> Result<()> {
    let ws = TestWorkspace::new()?;
    let mut rows = synthetic_rows(4);
    rows.push(panicking_row("boom"));
    let pipeline = Pipeline::new(ws.settings(), Arc::new(MockFactory::new(3).panicking()))?;
    let dataset = sample_dataset("org/panic", "unused");

    let report = pipeline.process_dataset(&dataset, Arc::new(VecSource::new(rows)))?;

    assert_eq!(report.records_written(), 4);
    assert_eq!(report.items_dropped(), 1);
    assert_eq!(report.failed_workers(), 0);
    Ok(())
}

#[test]
fn slow_workers_still_conserve_items() -> Result<()> {
    let ws = TestWorkspace::new()?;
    let mut settings = ws.settings();
    settings.num_readers = 3;
    settings.qsize = 2;
    settings.lines_per_file = 5;
    let factory = MockFactory::new(3).with_delay(Duration::from_millis(2));
    let pipeline = Pipeline::new(settings, Arc::new(factory))?;
    let dataset = sample_dataset("org/slow", "unused");

    let report = pipeline.process_dataset(&dataset, Arc::new(VecSource::new(synthetic_rows(40))))?;

    assert_eq!(report.items_enqueued(), 40);
    assert_eq!(report.records_written(), 40);
    let outputs = read_worker_outputs(ws.out_dir())?;
    assert_eq!(total_records(&outputs), 40);
    assert_rotation_invariant(&outputs, 5);
    Ok(())
}

#[test]
fn more_readers_than_rows() -> Result<()> {
    let ws = TestWorkspace::new()?;
    let mut settings = ws.settings();
    settings.num_readers = 5;
    let pipeline = Pipeline::new(settings, Arc::new(MockFactory::new(3)))?;
    let dataset = sample_dataset("org/sparse", "unused");

    let report = pipeline.process_dataset(&dataset, Arc::new(VecSource::new(synthetic_rows(2))))?;

    let produced: Vec<u64> = report.readers.iter().map(|r| r.produced).collect();
    assert_eq!(produced, vec![1, 1, 0, 0, 0]);
    assert_eq!(report.records_written(), 2);
    Ok(())
}

#[test]
fn empty_dataset_writes_no_files() -> Result<()> {
    let ws = TestWorkspace::new()?;
    let pipeline = Pipeline::new(ws.settings(), Arc::new(MockFactory::new(3)))?;
    let dataset = sample_dataset("org/empty", "unused");

    let report = pipeline.process_dataset(&dataset, Arc::new(VecSource::new(Vec::new())))?;

    assert_eq!(report.records_written(), 0);
    assert_eq!(report.files().count(), 0);
    assert!(read_worker_outputs(ws.out_dir())?.is_empty());
    Ok(())
}

#[test]
fn cancellation_stops_everything_without_hanging() -> Result<()> {
    let ws = TestWorkspace::new()?;
    let mut settings = ws.settings();
    settings.qsize = 2;
    let factory = MockFactory::new(3).with_delay(Duration::from_millis(50));
    let pipeline = Pipeline::new(settings, Arc::new(factory))?;
    let dataset = sample_dataset("org/cancel", "unused");

    let cancel = pipeline.cancel_token();
    let canceller = thread::spawn(move || {
        thread::sleep(Duration::from_millis(150));
        cancel.cancel();
    });

    let started = Instant::now();
    let err = pipeline
        .process_dataset(&dataset, Arc::new(VecSource::new(synthetic_rows(500))))
        .unwrap_err();
    canceller.join().unwrap();

    assert!(started.elapsed() < Duration::from_secs(5));
    match err.downcast_ref::<PipelineError>() {
        Some(PipelineError::Interrupted { stragglers }) => assert_eq!(*stragglers, 0),
        other => panic!("expected Interrupted, got {other:?}"),
    }
    assert!(pipeline.metrics().snapshot().records_encoded < 500);

    let err = pipeline
        .process_dataset(&dataset, Arc::new(VecSource::new(synthetic_rows(1))))
        .unwrap_err();
    assert!(err.downcast_ref::<PipelineError>().is_some_and(PipelineError::is_interrupted));
    Ok(())
}

#[test]
fn all_workers_failing_to_load_does_not_hang() -> Result<()> {
    let ws = TestWorkspace::new()?;
    let mut settings = ws.settings();
    settings.qsize = 2;
    let factory = MockFactory::new(3).failing_on([0, 1]);
    let pipeline = Pipeline::new(settings, Arc::new(factory.clone()))?;
    let dataset = sample_dataset("org/dead", "unused");

    let started = Instant::now();
    let err = pipeline
        .process_dataset(&dataset, Arc::new(VecSource::new(synthetic_rows(50))))
        .unwrap_err();

    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(matches!(
        err.downcast_ref::<PipelineError>(),
        Some(PipelineError::AllWorkersFailed { workers: 2, .. })
    ));
    assert_eq!(factory.loads(), 2);
    assert_eq!(pipeline.metrics().snapshot().worker_failures, 2);
    assert!(read_worker_outputs(ws.out_dir())?.is_empty());
    Ok(())
}

#[test]
fn one_failed_worker_reduces_throughput_only() -> Result<()> {
    let ws = TestWorkspace::new()?;
    let factory = MockFactory::new(3).failing_on([1]);
    let pipeline = Pipeline::new(ws.settings(), Arc::new(factory))?;
    let dataset = sample_dataset("org/degraded", "unused");

    let report = pipeline.process_dataset(&dataset, Arc::new(VecSource::new(synthetic_rows(10))))?;

    assert_eq!(report.failed_workers(), 1);
    assert_eq!(report.records_written(), 10);
    let outputs = read_worker_outputs(ws.out_dir())?;
    assert_eq!(outputs.keys().copied().collect::<Vec<_>>(), vec![0]);
    assert_rotation_invariant(&outputs, 3);
    Ok(())
}

#[test]
fn unreadable_shard_is_reported_as_shortfall() -> Result<()> {
    let ws = TestWorkspace::new()?;
    let dataset = ws.write_dataset("org/vanishing", &synthetic_rows(8))?;
    let source = JsonlSource::open(&dataset.data_files)?;
    std::fs::remove_file(&dataset.data_files)?;

    let pipeline = Pipeline::new(ws.settings(), Arc::new(MockFactory::new(3)))?;
    let report = pipeline.process_dataset(&dataset, Arc::new(source))?;

    assert_eq!(report.records_written(), 0);
    assert_eq!(report.shortfall(), 8);
    assert_eq!(pipeline.metrics().snapshot().reader_failures, 2);
    Ok(())
}

#[test]
fn several_datasets_share_the_output_directory() -> Result<()> {
    let ws = TestWorkspace::new()?;
    let first = ws.write_dataset("org/alpha", &synthetic_rows(5))?;
    let second = ws.write_dataset("other/beta", &synthetic_rows(4))?;
    let pipeline = Pipeline::new(ws.settings(), Arc::new(MockFactory::new(3)))?;

    let report = pipeline.run(&[first, second])?;

    assert_eq!(report.datasets.len(), 2);
    assert_eq!(report.metrics.records_encoded, 9);
    let outputs = read_worker_outputs(ws.out_dir())?;
    let prefixes: BTreeSet<&str> = outputs
        .values()
        .flat_map(|files| files.iter().map(|f| f.prefix.as_str()))
        .collect();
    assert_eq!(prefixes, BTreeSet::from(["alpha", "beta"]));
    assert_rotation_invariant(&outputs, 3);
    Ok(())
}

#[test]
fn datasets_with_the_same_prefix_never_overwrite() -> Result<()> {
    let ws = TestWorkspace::new()?;
    let first = ws.write_dataset("org1/same", &synthetic_rows(9))?;
    let second = ws.write_dataset("org2/same", &synthetic_rows(3))?;
    let pipeline = Pipeline::new(ws.settings(), Arc::new(MockFactory::new(3)))?;

    let err = pipeline.run(&[first, second]).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<PipelineError>(),
        Some(PipelineError::InvalidConfig(_))
    ));
    assert!(read_worker_outputs(ws.out_dir())?.is_empty());
    assert_eq!(pipeline.metrics().snapshot().records_encoded, 0);
    Ok(())
}

#[test]
fn zero_workers_is_rejected() {
    let mut settings = test_settings("unused");
    settings.num_gpu_units = Some(0);
    let err = Pipeline::new(settings, Arc::new(MockFactory::new(3))).err().unwrap();
    assert!(matches!(
        err.downcast_ref::<PipelineError>(),
        Some(PipelineError::InvalidConfig(_))
    ));
}
