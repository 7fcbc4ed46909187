//! Testing utilities for encoding pipelines.
//!
//! - **Fixtures**: synthetic dataset rows, dataset definitions and settings
//!   sized for fast tests
//! - **Mock codecs**: deterministic encoders that can be told to fail, panic,
//!   stall or refuse to load
//! - **Assertions**: read shards back and check the rotation invariant
//! - **Workspace**: a temporary directory laid out like a real run
//!
//! # Quick Start
//!
//! ```no_run
//! use codecshard::orchestrator::Pipeline;
//! use codecshard::testing::*;
//! use std::sync::Arc;
//!
//! #[test]
//! fn encodes_everything() -> anyhow::Result<()> {
//!     let ws = TestWorkspace::new()?;
//!     let dataset = ws.write_dataset("org/tiny", &synthetic_rows(10))?;
//!     let pipeline = Pipeline::new(ws.settings(), Arc::new(MockFactory::new(3)))?;
//!     pipeline.run(&[dataset])?;
//!
//!     let outputs = read_worker_outputs(ws.out_dir())?;
//!     assert_eq!(total_records(&outputs), 10);
//!     assert_rotation_invariant(&outputs, 3);
//!     Ok(())
//! }
//! ```

pub mod assertions;
pub mod fixtures;
pub mod mock_codec;
pub mod workspace;

pub use assertions::*;
pub use fixtures::*;
pub use mock_codec::*;
pub use workspace::*;
