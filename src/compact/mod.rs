use std::io::BufReader;

use tracing::{debug, info};

use crate::{
    config::PipelineConfig,
    error::{Error, Result},
    format::{ChunkedWriter, FrameReader, FrameWriter},
    fs::Dir,
    layout::{BatchId, PartitionKey, DATA_FILE},
    pool::WorkerPool,
    publish::{create_dir, publish, sweep_temporaries},
    report::{Stage, StageReport, UnitStats},
};

/// Folds every ingested file of a partition into a single `data` file.
///
/// The merge is a streaming concatenation in batch id order. Records are
/// moved frame by frame without being decoded, through a read buffer, one
/// frame buffer and a write buffer whose sizes add up to `chunk_size`, so a
/// partition of any size is merged in bounded memory.
pub struct Compactor<D: Dir> {
    config: PipelineConfig,
    input: D,
    output: D,
}

impl<D: Dir> Compactor<D> {
    pub fn new(config: PipelineConfig, input: D, output: D) -> Self {
        Compactor {
            config,
            input,
            output,
        }
    }

    /// Every partition present in the ingested dataset, sorted by key.
    pub fn discover(&self) -> Result<Vec<PartitionKey>> {
        if !self.input.exists()? {
            return Err(Error::MissingInput(self.input.path()));
        }
        Ok(self
            .input
            .ls()?
            .into_iter()
            .filter(|e| e.is_dir)
            .filter_map(|e| PartitionKey::parse_dir(&e.name))
            .collect())
    }

    pub fn run(&self) -> Result<StageReport<PartitionKey>> {
        self.prepare()?;
        let keys = self.discover()?;
        self.process(keys)
    }

    /// Compacts just `keys`, typically the failed units of an earlier
    /// report.
    pub fn run_partitions(&self, keys: Vec<PartitionKey>) -> Result<StageReport<PartitionKey>> {
        self.prepare()?;
        self.process(keys)
    }

    fn prepare(&self) -> Result<()> {
        self.config.validate()?;
        if !self.input.exists()? {
            return Err(Error::MissingInput(self.input.path()));
        }
        self.output.mkdir()?;
        sweep_temporaries(&self.output)?;
        Ok(())
    }

    fn process(&self, keys: Vec<PartitionKey>) -> Result<StageReport<PartitionKey>> {
        info!(
            stage = %Stage::Compact,
            input = %self.input.path().display(),
            output = %self.output.path().display(),
            units = keys.len(),
            "starting"
        );
        let report = WorkerPool::new(&self.config)?
            .run(Stage::Compact, keys, |key| self.compact_partition(key))?;
        let totals = report.totals();
        info!(
            stage = %Stage::Compact,
            records = totals.records_written,
            files = totals.files_written,
            peak_buffered_bytes = totals.peak_buffered_bytes,
            failed = report.failed.len(),
            "finished"
        );
        Ok(report)
    }

    fn compact_partition(&self, key: &PartitionKey) -> Result<UnitStats> {
        let src = self.input.cd(&key.dir_name());
        if !src.exists()? {
            return Err(Error::MissingInput(src.path()));
        }
        let mut batches: Vec<_> = src
            .ls()?
            .into_iter()
            .filter(|e| !e.is_dir)
            .filter_map(|e| BatchId::parse(&e.name))
            .collect();
        batches.sort();

        let mut stats = UnitStats::default();
        if batches.is_empty() {
            debug!(stage = %Stage::Compact, unit = %key, "no ingested files");
            return Ok(stats);
        }

        let dst = create_dir(&self.output, &key.dir_name())?;

        let read_buffer_size = self.config.read_buffer_size();
        let max_frame_len = self.config.max_frame_len();
        let mut frame = Vec::with_capacity(max_frame_len);
        let mut largest_frame = 0;
        let chunk_size = self.config.chunk_size;
        let peak = publish(&dst, DATA_FILE, |f| {
            let mut w =
                FrameWriter::new(ChunkedWriter::new(f, self.config.write_buffer_size()))?;
            for id in &batches {
                let name = id.file_name();
                let path = src.path().join(&name);
                let file = src
                    .open(&name)?
                    .ok_or_else(|| Error::MissingInput(path.clone()))?;
                let mut reader = FrameReader::open(
                    BufReader::with_capacity(read_buffer_size, file),
                    path,
                    max_frame_len,
                )?
                .written_within_limit();
                while reader.next_frame(&mut frame)? {
                    largest_frame = std::cmp::max(largest_frame, frame.len());
                    w.write_frame(&frame)?;
                }
                stats.records_read += reader.count();
            }
            stats.records_written = w.count();
            let peak = read_buffer_size + largest_frame + w.finish()?.high_water();
            // Checked before the rename so an over-budget merge publishes nothing.
            if peak > chunk_size {
                return Err(Error::ResourceBound(format!(
                    "{} buffered {} bytes, over chunk_size={}",
                    key, peak, chunk_size
                )));
            }
            Ok(peak)
        })?;

        stats.files_written = 1;
        stats.peak_buffered_bytes = peak;
        Ok(stats)
    }
}

#[cfg(test)]
mod test {
    use super::Compactor;
    use crate::{
        config::PipelineConfig,
        encoding::KeyWriter,
        error::Error,
        format::{count_records, read_records, FrameWriter},
        fs::{Dir, MockDir},
        layout::{BatchId, PartitionKey},
        publish::publish,
        record::Record,
    };

    fn record(batch: u64, i: u64) -> Record {
        Record {
            timestamp_ms: 1_577_836_800_000 + i as i64,
            batch,
            categories: vec!["bar".into(), "green".into(), "buzz".into()],
            values: (0..10).map(|v| (v as f64 + i as f64) / 100.0).collect(),
        }
    }

    // Writes `n` records of batch `id` as an ingested file of partition `key`.
    fn write_ingested(dir: &MockDir, key: &str, id: u64, n: u64) -> Vec<Record> {
        let records: Vec<_> = (0..n).map(|i| record(id, i)).collect();
        let part = dir.cd(&format!("partition={}", key));
        part.mkdir().unwrap();
        publish(&part, &BatchId(id).file_name(), |f| {
            let mut w = FrameWriter::new(f)?;
            let mut kw = KeyWriter::new();
            for r in &records {
                r.encode(&mut kw);
                w.write_frame(kw.as_bytes())?;
            }
            w.finish()?;
            Ok(())
        })
        .unwrap();
        records
    }

    fn key(k: &str) -> PartitionKey {
        PartitionKey::new(k).unwrap()
    }

    fn config() -> PipelineConfig {
        PipelineConfig {
            chunk_size: 4096,
            workers: 2,
            ..PipelineConfig::default()
        }
    }

    fn compactor(dir: &MockDir, config: PipelineConfig) -> Compactor<MockDir> {
        Compactor::new(config, dir.cd(&"ingested"), dir.cd(&"compacted"))
    }

    #[test]
    fn test_concatenates_in_batch_order() {
        let dir = MockDir::new();
        let ingested = dir.cd(&"ingested");
        let b10 = write_ingested(&ingested, "a", 10, 2);
        let b2 = write_ingested(&ingested, "a", 2, 3);
        let b9 = write_ingested(&ingested, "b", 9, 1);

        let engine = compactor(&dir, config());
        assert_eq!(vec![key("a"), key("b")], engine.discover().unwrap());
        let report = engine.run().unwrap();
        assert!(report.is_complete());
        let stats = report.stats(&key("a")).unwrap();
        assert_eq!(
            (5, 5, 1),
            (stats.records_read, stats.records_written, stats.files_written)
        );

        let compacted = dir.cd(&"compacted");
        assert_eq!(
            [b2, b10].concat(),
            read_records(&compacted.cd(&"partition=a"), "data").unwrap()
        );
        assert_eq!(b9, read_records(&compacted.cd(&"partition=b"), "data").unwrap());
        // Ingested files are left in place.
        assert_eq!(3, count_records(&ingested.cd(&"partition=a"), "batch_2").unwrap());
    }

    #[test]
    fn test_memory_bound_on_large_partition() {
        let dir = MockDir::new();
        let ingested = dir.cd(&"ingested");
        for id in 0..5 {
            write_ingested(&ingested, "big", id, 200);
        }

        let config = config();
        let report = compactor(&dir, config.clone()).run().unwrap();
        let stats = report.stats(&key("big")).unwrap();
        assert_eq!(1000, stats.records_written);
        assert!(stats.peak_buffered_bytes <= config.chunk_size);

        let compacted = dir.cd(&"compacted/partition=big");
        let size = dir.fs().contents("compacted/partition=big/data").unwrap().len();
        assert!(size > 20 * config.chunk_size, "{}", size);
        assert_eq!(1000, count_records(&compacted, "data").unwrap());
    }

    #[test]
    fn test_corrupt_partition_is_isolated() {
        let dir = MockDir::new();
        let ingested = dir.cd(&"ingested");
        for k in ["a", "b", "c"] {
            write_ingested(&ingested, k, 0, 4);
            write_ingested(&ingested, k, 1, 4);
        }
        let path = "ingested/partition=b/batch_1";
        let truncated = {
            let fs = dir.fs();
            let contents = fs.contents(path).unwrap();
            contents[..contents.len() - 5].to_vec()
        };
        assert!(dir.fs().overwrite(path, truncated));

        let engine = compactor(&dir, config());
        let report = engine.run().unwrap();
        assert_eq!(vec![key("b")], report.failed_units());
        assert!(matches!(report.failed[0].1, Error::Corrupt { .. }));
        assert_eq!(16, report.totals().records_written);
        assert_eq!(
            vec![
                "compacted/partition=a/data".to_owned(),
                "compacted/partition=c/data".to_owned()
            ],
            dir.fs()
                .file_names()
                .into_iter()
                .filter(|n| n.starts_with("compacted/"))
                .collect::<Vec<_>>()
        );

        write_ingested(&ingested, "b", 1, 4);
        let retry = engine.run_partitions(report.failed_units()).unwrap();
        assert!(retry.is_complete());
        assert_eq!(
            8,
            count_records(&dir.cd(&"compacted/partition=b"), "data").unwrap()
        );
    }

    // A damaged length field or header costs the partition, not the stage.
    #[test]
    fn test_damaged_files_are_isolated() {
        let dir = MockDir::new();
        let ingested = dir.cd(&"ingested");
        for k in ["a", "b", "c", "d"] {
            write_ingested(&ingested, k, 0, 4);
        }
        let damage = |path: &str, at: usize, bytes: &[u8]| {
            let mut fs = dir.fs();
            let mut contents = fs.contents(path).unwrap().to_vec();
            contents[at..at + bytes.len()].copy_from_slice(bytes);
            assert!(fs.overwrite(path, contents));
        };
        // The first frame length now claims 16MiB, far over max_frame_len.
        damage(
            "ingested/partition=b/batch_0",
            4,
            &0x00ff_ffff_u32.to_le_bytes(),
        );
        damage("ingested/partition=c/batch_0", 0, b"XXXX");

        let report = compactor(&dir, config()).run().unwrap();
        assert_eq!(vec![key("b"), key("c")], report.failed_units());
        for (_, e) in &report.failed {
            assert!(matches!(e, Error::Corrupt { .. }), "{}", e);
            assert!(!e.is_fatal());
        }
        assert_eq!(8, report.totals().records_written);
        assert_eq!(
            vec![
                "compacted/partition=a/data".to_owned(),
                "compacted/partition=d/data".to_owned()
            ],
            dir.fs()
                .file_names()
                .into_iter()
                .filter(|n| n.starts_with("compacted/"))
                .collect::<Vec<_>>()
        );
    }

    #[test]
    fn test_zero_and_single_partition() {
        let dir = MockDir::new();
        dir.cd(&"ingested").mkdir().unwrap();
        let report = compactor(&dir, config()).run().unwrap();
        assert!(report.is_complete());
        assert!(report.succeeded.is_empty());
        assert!(dir.cd(&"compacted").exists().unwrap());

        write_ingested(&dir.cd(&"ingested"), "only", 0, 3);
        let report = compactor(&dir, config()).run().unwrap();
        assert_eq!(
            vec![key("only")],
            report
                .succeeded
                .iter()
                .map(|(k, _)| k.clone())
                .collect::<Vec<_>>()
        );
        assert_eq!(
            3,
            count_records(&dir.cd(&"compacted/partition=only"), "data").unwrap()
        );
    }

    #[test]
    fn test_stale_output_is_replaced() {
        let dir = MockDir::new();
        write_ingested(&dir.cd(&"ingested"), "a", 0, 3);
        let out = dir.cd(&"compacted/partition=a");
        out.mkdir().unwrap();
        out.create(&"data.tmp").unwrap();

        let engine = compactor(&dir, config());
        engine.run().unwrap();
        let first = dir.fs().contents("compacted/partition=a/data").unwrap().to_vec();
        assert!(out.open(&"data.tmp").unwrap().is_none());

        engine.run().unwrap();
        assert_eq!(
            first,
            dir.fs().contents("compacted/partition=a/data").unwrap().to_vec()
        );
    }

    #[test]
    fn test_ignores_non_dataset_entries() {
        let dir = MockDir::new();
        let ingested = dir.cd(&"ingested");
        write_ingested(&ingested, "a", 0, 2);
        ingested.cd(&"partition=a").create(&"batch_1.tmp").unwrap();
        ingested.cd(&"partition=a").create(&"notes").unwrap();
        ingested.cd(&"year=2020").mkdir().unwrap();
        ingested.create(&"partition=b").unwrap();

        let engine = compactor(&dir, config());
        assert_eq!(vec![key("a")], engine.discover().unwrap());
        let report = engine.run().unwrap();
        assert_eq!(2, report.totals().records_written);
    }

    #[test]
    fn test_missing_input() {
        let dir = MockDir::new();
        let engine = compactor(&dir, config());
        assert!(matches!(engine.run(), Err(Error::MissingInput(_))));
        assert!(matches!(
            engine.run_partitions(vec![key("a")]),
            Err(Error::MissingInput(_))
        ));
    }
}
