//! Run metrics shared by every reader and worker.
//!
//! [`RunMetrics`] is a set of atomic counters behind an `Arc`; components
//! bump them as they go and the orchestrator reports them at the end of
//! each dataset and of the run. Metrics can be printed or saved as JSON.
//!
//! # Example
//!
//! ```
//! use codecshard::metrics::RunMetrics;
//!
//! let metrics = RunMetrics::new();
//! metrics.add_enqueued(3);
//! metrics.add_encoded(2);
//! metrics.add_dropped(1);
//!
//! let snapshot = metrics.snapshot();
//! assert_eq!(snapshot.items_enqueued, 3);
//! assert_eq!(snapshot.records_encoded + snapshot.items_dropped, 3);
//! ```

use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::{json, Value};
use std::fs::File;
use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Counters for one run.
#[derive(Debug)]
pub struct RunMetrics {
    items_enqueued: AtomicU64,
    items_skipped: AtomicU64,
    records_encoded: AtomicU64,
    items_dropped: AtomicU64,
    files_written: AtomicU64,
    bytes_written: AtomicU64,
    worker_failures: AtomicU64,
    reader_failures: AtomicU64,
    start: Instant,
    end: Mutex<Option<Instant>>,
}

/// Point-in-time copy of [`RunMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub items_enqueued: u64,
    pub items_skipped: u64,
    pub records_encoded: u64,
    pub items_dropped: u64,
    pub files_written: u64,
    pub bytes_written: u64,
    pub worker_failures: u64,
    pub reader_failures: u64,
}

impl RunMetrics {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            items_enqueued: AtomicU64::new(0),
            items_skipped: AtomicU64::new(0),
            records_encoded: AtomicU64::new(0),
            items_dropped: AtomicU64::new(0),
            files_written: AtomicU64::new(0),
            bytes_written: AtomicU64::new(0),
            worker_failures: AtomicU64::new(0),
            reader_failures: AtomicU64::new(0),
            start: Instant::now(),
            end: Mutex::new(None),
        })
    }

    pub fn add_enqueued(&self, n: u64) {
        self.items_enqueued.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_skipped(&self, n: u64) {
        self.items_skipped.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_encoded(&self, n: u64) {
        self.records_encoded.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_dropped(&self, n: u64) {
        self.items_dropped.fetch_add(n, Ordering::Relaxed);
    }

    /// Record one closed output file of `bytes` compressed bytes.
    pub fn add_file(&self, bytes: u64) {
        self.files_written.fetch_add(1, Ordering::Relaxed);
        self.bytes_written.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn add_worker_failure(&self) {
        self.worker_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_reader_failure(&self) {
        self.reader_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Freeze the elapsed time.
    pub fn finish(&self) {
        if let Ok(mut end) = self.end.lock() {
            end.get_or_insert_with(Instant::now);
        }
    }

    /// Time since creation, or until [`finish`](Self::finish) if called.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        let end = self.end.lock().ok().and_then(|e| *e);
        end.unwrap_or_else(Instant::now).duration_since(self.start)
    }

    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            items_enqueued: self.items_enqueued.load(Ordering::Relaxed),
            items_skipped: self.items_skipped.load(Ordering::Relaxed),
            records_encoded: self.records_encoded.load(Ordering::Relaxed),
            items_dropped: self.items_dropped.load(Ordering::Relaxed),
            files_written: self.files_written.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            worker_failures: self.worker_failures.load(Ordering::Relaxed),
            reader_failures: self.reader_failures.load(Ordering::Relaxed),
        }
    }

    /// All metrics as a JSON object of `{name: {value, description}}`.
    #[must_use]
    pub fn to_json(&self) -> Value {
        let s = self.snapshot();
        let entry =
            |value: Value, description: &str| json!({ "value": value, "description": description });
        json!({
            "items_enqueued": entry(json!(s.items_enqueued), "Work items put on the queue by readers"),
            "items_skipped": entry(json!(s.items_skipped), "Rows readers could not turn into work items"),
            "records_encoded": entry(json!(s.records_encoded), "Encoded records written by workers"),
            "items_dropped": entry(json!(s.items_dropped), "Work items dropped after an encode or write failure"),
            "files_written": entry(json!(s.files_written), "Output files closed"),
            "bytes_written": entry(json!(s.bytes_written), "Compressed bytes in closed output files"),
            "worker_failures": entry(json!(s.worker_failures), "Workers that failed to load their encoder or crashed"),
            "reader_failures": entry(json!(s.reader_failures), "Readers that stopped before exhausting their shard"),
            "execution_time_ms": entry(json!(self.elapsed().as_millis() as u64), "Total execution time in milliseconds"),
        })
    }

    /// Print all metrics to stdout in a human-readable format.
    pub fn print(&self) {
        let s = self.snapshot();
        let elapsed = self.elapsed();
        println!("\n========== Run Metrics ==========");
        println!(
            "Execution Time: {:.3}s ({} ms)",
            elapsed.as_secs_f64(),
            elapsed.as_millis()
        );
        println!("---------------------------------");
        println!("items_enqueued: {}", s.items_enqueued);
        println!("items_skipped: {}", s.items_skipped);
        println!("records_encoded: {}", s.records_encoded);
        println!("items_dropped: {}", s.items_dropped);
        println!("files_written: {}", s.files_written);
        println!(
            "bytes_written: {} ({:.2} GB)",
            s.bytes_written,
            s.bytes_written as f64 / 1024f64.powi(3)
        );
        println!("worker_failures: {}", s.worker_failures);
        println!("reader_failures: {}", s.reader_failures);
        println!("=================================\n");
    }

    /// Save all metrics to a JSON file.
    ///
    /// # Errors
    /// Fails if the file cannot be created or written to.
    pub fn save_to_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let formatted = serde_json::to_string_pretty(&self.to_json())?;
        let mut file = File::create(path).with_context(|| format!("create {}", path.display()))?;
        file.write_all(formatted.as_bytes())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate_across_threads() {
        let m = RunMetrics::new();
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let m = Arc::clone(&m);
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        m.add_encoded(1);
                    }
                    m.add_file(10);
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        let s = m.snapshot();
        assert_eq!(s.records_encoded, 400);
        assert_eq!(s.files_written, 4);
        assert_eq!(s.bytes_written, 40);
    }

    #[test]
    fn json_and_file_output() -> Result<()> {
        let m = RunMetrics::new();
        m.add_dropped(2);
        m.finish();
        let v = m.to_json();
        assert_eq!(v["items_dropped"]["value"], json!(2));
        assert!(v["execution_time_ms"]["value"].is_u64());

        let dir = tempfile::tempdir()?;
        let path = dir.path().join("metrics.json");
        m.save_to_file(&path)?;
        let back: Value = serde_json::from_str(&std::fs::read_to_string(&path)?)?;
        assert_eq!(back["items_dropped"]["value"], json!(2));
        Ok(())
    }
}
