use std::{collections::BTreeMap, io::BufReader};

use tracing::{info, warn};

use crate::{
    config::{MalformedPolicy, PipelineConfig},
    error::{Error, Result},
    format::{ChunkedWriter, FrameReader, FrameWriter},
    fs::Dir,
    layout::{BatchId, PartitionKey},
    pool::WorkerPool,
    publish::{create_dir, publish, sweep_temporaries},
    record::Record,
    report::{Stage, StageReport, UnitStats},
};

/// Fans raw batches out into one file per (batch, partition).
///
/// Each batch is read whole (it is bounded by `batch_size`), grouped by
/// partition key in encounter order, and every group is published as
/// `partition=<key>/batch_<id>`. Nothing is written for a batch until all of
/// it has been read, so a rejected batch leaves no output behind.
pub struct Ingestor<D: Dir> {
    config: PipelineConfig,
    input: D,
    output: D,
}

impl<D: Dir> Ingestor<D> {
    pub fn new(config: PipelineConfig, input: D, output: D) -> Self {
        Ingestor {
            config,
            input,
            output,
        }
    }

    /// Ingests every batch: ids `0..n_batches` if configured, otherwise
    /// every batch file found in the input.
    pub fn run(&self) -> Result<StageReport<BatchId>> {
        self.prepare()?;
        let ids = self.batches()?;
        self.process(ids)
    }

    /// Ingests just `ids`, typically the failed units of an earlier report.
    pub fn run_batches(&self, ids: Vec<BatchId>) -> Result<StageReport<BatchId>> {
        self.prepare()?;
        self.process(ids)
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

    fn batches(&self) -> Result<Vec<BatchId>> {
        if let Some(n) = self.config.n_batches {
            return Ok((0..n).map(BatchId).collect());
        }
        let mut ids: Vec<_> = self
            .input
            .ls()?
            .into_iter()
            .filter(|e| !e.is_dir)
            .filter_map(|e| BatchId::parse(&e.name))
            .collect();
        ids.sort();
        Ok(ids)
    }

    fn process(&self, ids: Vec<BatchId>) -> Result<StageReport<BatchId>> {
        info!(
            stage = %Stage::Ingest,
            input = %self.input.path().display(),
            output = %self.output.path().display(),
            units = ids.len(),
            "starting"
        );
        let report =
            WorkerPool::new(&self.config)?.run(Stage::Ingest, ids, |id| self.ingest_batch(*id))?;
        let totals = report.totals();
        info!(
            stage = %Stage::Ingest,
            records = totals.records_written,
            skipped = totals.records_skipped,
            files = totals.files_written,
            failed = report.failed.len(),
            "finished"
        );
        Ok(report)
    }

    fn ingest_batch(&self, id: BatchId) -> Result<UnitStats> {
        let name = id.file_name();
        let path = self.input.path().join(&name);
        let file = self
            .input
            .open(&name)?
            .ok_or_else(|| Error::MissingInput(path.clone()))?;
        let mut reader = FrameReader::open(
            BufReader::with_capacity(self.config.read_buffer_size(), file),
            path.clone(),
            self.config.max_frame_len(),
        )?;

        let mut stats = UnitStats::default();
        let mut groups: BTreeMap<PartitionKey, Vec<Vec<u8>>> = BTreeMap::new();
        let mut held = 0;
        let mut frame = Vec::new();
        while reader.next_frame(&mut frame)? {
            stats.records_read += 1;
            if stats.records_read > self.config.batch_size as u64 {
                return Err(Error::ResourceBound(format!(
                    "{} holds more than batch_size={} records",
                    path.display(),
                    self.config.batch_size
                )));
            }
            let keyed =
                Record::decode_from(&frame).and_then(|r| self.config.partition_by.key(&r));
            match keyed {
                Ok(key) => {
                    held += frame.len();
                    groups.entry(key).or_default().push(std::mem::take(&mut frame));
                }
                Err(e) => {
                    let err = Error::MalformedRecord {
                        file: path.clone(),
                        index: reader.count() - 1,
                        reason: format!("{:#}", e),
                    };
                    match self.config.on_malformed {
                        MalformedPolicy::RejectBatch => return Err(err),
                        MalformedPolicy::SkipRecord => {
                            warn!(
                                stage = %Stage::Ingest,
                                unit = %id,
                                error = %err,
                                "skipping record"
                            );
                            stats.records_skipped += 1;
                        }
                    }
                }
            }
        }

        let mut write_peak = 0;
        for (key, payloads) in &groups {
            let dir = create_dir(&self.output, &key.dir_name())?;
            let high_water = publish(&dir, &name, |f| {
                let mut w =
                    FrameWriter::new(ChunkedWriter::new(f, self.config.write_buffer_size()))?;
                for payload in payloads {
                    w.write_frame(payload)?;
                }
                Ok(w.finish()?.high_water())
            })?;
            write_peak = std::cmp::max(write_peak, high_water);
            stats.records_written += payloads.len() as u64;
            stats.files_written += 1;
        }
        stats.peak_buffered_bytes = self.config.read_buffer_size() + held + write_peak;
        Ok(stats)
    }
}
