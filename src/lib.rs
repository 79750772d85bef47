//! Glyco Flux - Dose-event feature engineering and anomaly scoring for diabetes device exports
//!
//! Flux turns a raw device export into dose-level feature tables and anomaly
//! verdicts through a deterministic pipeline: export adaptation → glucose
//! normalization → SAX discretization → dose feature extraction → outlier
//! scoring → table encoding.
//!
//! ## Modules
//!
//! - **Pipeline**: Process one export into feature and review tables
//! - **Batch**: Process many exports in parallel with per-file isolation
//! - **Cache**: Reuse stage outputs across runs keyed by content fingerprints

pub mod batch;
pub mod cache;
pub mod config;
pub mod encoder;
pub mod error;
pub mod features;
pub mod normalizer;
pub mod pipeline;
pub mod sax;
pub mod schema;
pub mod scoring;
pub mod stats;
pub mod types;
pub mod window;

pub use batch::{BatchInput, BatchReport, BatchRunner};
pub use config::PipelineConfig;
pub use error::ComputeError;
pub use pipeline::{Pipeline, PipelineOutput, Review};

// Schema exports
pub use schema::{RawEventAdapter, RawExport};

/// Flux version stamped on every run summary
pub const GLYCO_FLUX_VERSION: &str = env!("CARGO_PKG_VERSION");
