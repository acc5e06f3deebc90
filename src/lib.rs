//! floe: ship NDJSON log objects from a bucket to an HTTP collector.
//!
//! Each pipeline polls a bucket, mirrors new objects into a local directory,
//! emits their decompressed content as events and POSTs every event as a JSON
//! batch. A persisted checkpoint records the newest object emitted so far.
//!
//! # Example
//!
//! ```ignore
//! use floe::{Config, run_pipelines};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), floe::error::PipelineError> {
//!     let config = Config::from_file("floe.yaml")?;
//!     run_pipelines(config, CancellationToken::new()).await
//! }
//! ```

pub mod checkpoint;
pub mod config;
pub mod error;
pub mod event;
pub mod metrics;
pub mod pipeline;
pub mod polling;
pub mod signal;
pub mod sink;
pub mod source;
pub mod storage;

// Re-export main types
pub use config::Config;
pub use pipeline::{Pipeline, run_pipelines};
pub use storage::StorageProvider;
