//! # codecshard
//!
//! A **concurrent encoding pipeline** that turns (text, audio) datasets into
//! sharded, gzip-compressed JSON Lines archives of codec tokens.
//!
//! ## Key Features
//!
//! - **Reader pool** - each reader owns a disjoint contiguous shard of the source
//! - **Bounded work queue** - the only flow control; readers block while it is full
//! - **One worker per accelerator** - encoders are loaded once and bound to a unit
//! - **Rotating output** - per-worker gzip JSONL files capped at `lines_per_file` records
//! - **Sentinel shutdown** - one end-of-stream marker per worker, sent after every reader is done
//! - **Cancellation** - Ctrl-C stops every thread and joins each within a bounded timeout
//! - **Failure isolation** - a bad row or a failed encode drops one item, never the run
//!
//! ## Quick Start
//!
//! ```no_run
//! use codecshard::codec::QuantizerFactory;
//! use codecshard::config::Config;
//! use codecshard::orchestrator::Pipeline;
//! use std::sync::Arc;
//!
//! # fn main() -> anyhow::Result<()> {
//! let config = Config::from_file("config.yaml")?;
//! config.validate()?;
//!
//! let factory = QuantizerFactory::new(config.base_settings.codec());
//! let pipeline = Pipeline::new(config.base_settings.clone(), Arc::new(factory))?
//!     .with_save_settings(config.save_settings.clone());
//!
//! let report = pipeline.run(&config.datasets)?;
//! for ds in &report.datasets {
//!     let files = ds.files().count();
//!     println!("{}: {} records in {files} files", ds.dataset, ds.records_written());
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Output Layout
//!
//! Each worker writes `{dataset_prefix}-worker{rank:02}-{index:05}.jsonl.gz`
//! into `out_dir`. Every line is one self-contained record:
//!
//! ```text
//! {"text":"...","snac_layer_1":[..],"snac_layer_2":[..],"snac_layer_3":[..],
//!  "num_layers":3,"token_lengths":[..],"speaker":"...","lang":"en"}
//! ```
//!
//! ## Module Overview
//!
//! - [`orchestrator`] - Per-dataset lifecycle of readers and workers
//! - [`reader`] / [`worker`] - The two thread roles
//! - [`queue`] - Bounded MPMC work queue with cancellable blocking calls
//! - [`writer`] - Rotating gzip JSONL output
//! - [`source`] - Dataset access, sharding and row preparation
//! - [`codec`] - Encoder traits and the built-in reference quantizer
//! - [`config`] - YAML/JSON configuration
//! - [`assemble`] - Shard verification, manifest and archive concatenation
//! - [`testing`] - Fixtures, mock encoders and output assertions

pub mod assemble;
pub mod cancel;
pub mod codec;
pub mod config;
pub mod device;
pub mod error;
pub mod io;
pub mod metrics;
pub mod orchestrator;
pub mod progress;
pub mod queue;
pub mod reader;
pub mod record;
pub mod source;
pub mod testing;
pub mod worker;
pub mod writer;

pub use cancel::CancelToken;
pub use codec::{Encoded, Encoder, EncoderFactory};
pub use config::{BaseSettings, Config, DatasetConfig};
pub use error::PipelineError;
pub use orchestrator::{DatasetReport, Pipeline, RunReport};
pub use record::{EncodedRecord, QueueMessage, WorkItem};
pub use source::{JsonlSource, RecordSource, VecSource};
