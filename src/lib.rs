//! Ingestion and compaction for partitioned datasets of small files.
//!
//! Three stages, each reading the whole output of the one before:
//!
//!   generate  <raw>/batch_<id>
//!   ingest    <ingested>/partition=<key>/batch_<id>
//!   compact   <compacted>/partition=<key>/data
//!
//! Ingestion parallelizes over batches and compaction over partitions. Every
//! file is published atomically, so a reader only ever sees complete files
//! and an interrupted stage can simply be run again.

use std::path::PathBuf;

pub mod compact;
pub mod config;
pub mod encoding;
pub mod error;
pub mod format;
pub mod fs;
pub mod generator;
pub mod ingest;
pub mod layout;
mod pool;
pub mod publish;
pub mod record;
pub mod report;


pub use compact::Compactor;
pub use config::{MalformedPolicy, PipelineConfig};
pub use error::{Error, Result};
pub use format::count_records;
pub use fs::{Dir, OsDir};
pub use generator::GeneratorOptions;
pub use ingest::Ingestor;
pub use layout::{BatchId, PartitionKey};
pub use record::{PartitionBy, Record};
pub use report::{Stage, StageReport, UnitStats};

/// Ingests the raw dataset at `in_path` into `out_path`.
pub fn ingest<P, Q>(config: &PipelineConfig, in_path: P, out_path: Q) -> Result<StageReport<BatchId>>
where
    P: Into<PathBuf>,
    Q: Into<PathBuf>,
{
    Ingestor::new(config.clone(), OsDir::new(in_path), OsDir::new(out_path)).run()
}

/// Compacts the ingested dataset at `in_path` into `out_path`.
pub fn compact<P, Q>(
    config: &PipelineConfig,
    in_path: P,
    out_path: Q,
) -> Result<StageReport<PartitionKey>>
where
    P: Into<PathBuf>,
    Q: Into<PathBuf>,
{
    Compactor::new(config.clone(), OsDir::new(in_path), OsDir::new(out_path)).run()
}

/// Writes a synthetic raw dataset to `out_path`.
pub fn generate<P>(
    config: &PipelineConfig,
    options: &GeneratorOptions,
    out_path: P,
) -> Result<StageReport<BatchId>>
where
    P: Into<PathBuf>,
{
    generator::generate(config, options, &OsDir::new(out_path))
}
