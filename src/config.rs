use std::{fs, path::Path};

use serde::{Deserialize, Serialize};

use crate::{
    error::{Error, Result},
    record::PartitionBy,
};

pub const MIN_CHUNK_SIZE: usize = 4 * 1024;

/// What ingestion does with a record it cannot decode or key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MalformedPolicy {
    /// Fail the batch containing the record. Nothing from a rejected batch
    /// that was not already published is written.
    #[default]
    RejectBatch,
    /// Drop the record, log it, and count it in the unit's stats.
    SkipRecord,
}

/// Settings shared by every stage. Built once and passed by reference; no
/// stage mutates it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineConfig {
    /// Batches to process. When set, exactly the ids `0..n` are expected and a
    /// missing one fails as a unit; when unset every batch found is processed.
    pub n_batches: Option<u64>,
    /// Upper bound on the records in one batch, and so on ingestion memory.
    pub batch_size: usize,
    /// Simulated span of one batch. Drives record timestamps, and through
    /// them the time-bucketed partition keys.
    pub batch_duration_secs: u64,
    pub partition_by: PartitionBy,
    /// Bytes a single merge may buffer. A quarter goes to the read buffer, a
    /// quarter to the largest accepted record frame and half to the write
    /// buffer.
    pub chunk_size: usize,
    pub workers: usize,
    /// Attempts per unit, counting the first, for transient I/O failures.
    pub max_attempts: u32,
    pub on_malformed: MalformedPolicy,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        PipelineConfig {
            n_batches: None,
            batch_size: 10_000,
            batch_duration_secs: 24 * 60 * 60,
            partition_by: PartitionBy::default(),
            chunk_size: 1024 * 1024,
            workers: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            max_attempts: 3,
            on_malformed: MalformedPolicy::default(),
        }
    }
}

impl PipelineConfig {
    pub fn from_json(s: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(s).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(path.as_ref()).map_err(|e| {
            Error::Config(format!("reading {}: {}", path.as_ref().display(), e))
        })?;
        Self::from_json(&contents)
    }

    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(Error::Config("batch_size must be positive".into()));
        }
        if self.batch_duration_secs == 0 {
            return Err(Error::Config("batch_duration_secs must be positive".into()));
        }
        if self.batch_duration_secs > i64::MAX as u64 / 1000 {
            return Err(Error::Config("batch_duration_secs is too large".into()));
        }
        if self.chunk_size < MIN_CHUNK_SIZE {
            return Err(Error::Config(format!(
                "chunk_size {} is below the minimum of {}",
                self.chunk_size, MIN_CHUNK_SIZE
            )));
        }
        if self.workers == 0 {
            return Err(Error::Config("workers must be positive".into()));
        }
        if self.max_attempts == 0 {
            return Err(Error::Config("max_attempts must be positive".into()));
        }
        Ok(())
    }

    pub fn batch_duration_ms(&self) -> i64 {
        self.batch_duration_secs as i64 * 1000
    }

    pub(crate) fn read_buffer_size(&self) -> usize {
        self.chunk_size / 4
    }

    pub(crate) fn max_frame_len(&self) -> usize {
        self.chunk_size / 4
    }

    pub(crate) fn write_buffer_size(&self) -> usize {
        self.chunk_size - self.read_buffer_size() - self.max_frame_len()
    }
}

#[cfg(test)]
mod test {
    use super::{MalformedPolicy, PipelineConfig};
    use crate::{error::Error, record::PartitionBy};

    #[test]
    fn test_defaults() {
        let config = PipelineConfig::from_json("{}").unwrap();
        assert_eq!(None, config.n_batches);
        assert_eq!(10_000, config.batch_size);
        assert_eq!(86_400_000, config.batch_duration_ms());
        assert_eq!(PartitionBy::Month, config.partition_by);
        assert_eq!(MalformedPolicy::RejectBatch, config.on_malformed);
        assert!(config.workers >= 1);
    }

    #[test]
    fn test_from_json() {
        let config = PipelineConfig::from_json(
            r#"{
                "n_batches": 10,
                "batch_size": 100,
                "partition_by": {"category": {"column": 0}},
                "chunk_size": 8192,
                "workers": 2,
                "on_malformed": "skip_record"
            }"#,
        )
        .unwrap();
        assert_eq!(Some(10), config.n_batches);
        assert_eq!(PartitionBy::Category { column: 0 }, config.partition_by);
        assert_eq!(MalformedPolicy::SkipRecord, config.on_malformed);
        assert_eq!(
            config.chunk_size,
            config.read_buffer_size() + config.max_frame_len() + config.write_buffer_size()
        );
    }

    #[test]
    fn test_rejects_bad_config() {
        for bad in [
            r#"{"chunk_size": 100}"#,
            r#"{"workers": 0}"#,
            r#"{"batch_size": 0}"#,
            r#"{"max_attempts": 0}"#,
            r#"{"batch_duration_secs": 0}"#,
            r#"{"chunk_sise": 8192}"#,
            r#"{"on_malformed": "ignore"}"#,
        ] {
            match PipelineConfig::from_json(bad) {
                Err(Error::Config(_)) => {}
                other => panic!("{}: expected config error, got {:?}", bad, other),
            }
        }
    }

    #[test]
    fn test_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let config = PipelineConfig {
            n_batches: Some(3),
            ..PipelineConfig::default()
        };
        std::fs::write(&path, serde_json::to_string(&config).unwrap()).unwrap();
        assert_eq!(config, PipelineConfig::load(&path).unwrap());
        assert!(PipelineConfig::load(dir.path().join("missing.json")).is_err());
    }
}
