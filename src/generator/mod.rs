use rand::{rngs::StdRng, Rng, SeedableRng};
use rand_distr::StandardNormal;
use tracing::info;

use crate::{
    config::PipelineConfig,
    encoding::KeyWriter,
    error::{Error, Result},
    format::{ChunkedWriter, FrameWriter},
    fs::Dir,
    layout::BatchId,
    pool::WorkerPool,
    publish::{publish, sweep_temporaries},
    record::Record,
    report::{Stage, StageReport, UnitStats},
};

pub const CATEGORIES: [&[&str]; 3] = [
    &["foo", "bar", "baz"],
    &["red", "green", "blue"],
    &["fizz", "buzz"],
];

pub const NUMERIC_COLUMNS: usize = 10;

// 2020-01-01T00:00:00Z
const DEFAULT_START_MS: i64 = 1_577_836_800_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GeneratorOptions {
    pub seed: u64,
    /// Timestamp of the first record of batch 0.
    pub start_ms: i64,
}

impl Default for GeneratorOptions {
    fn default() -> Self {
        GeneratorOptions {
            seed: 1,
            start_ms: DEFAULT_START_MS,
        }
    }
}

/// Writes a raw dataset of `n_batches` batches (one if unset) into `dir`.
///
/// Every batch draws from its own generator seeded from `options.seed` and
/// the batch id, so the output doesn't depend on how batches are scheduled.
pub fn generate<D: Dir>(
    config: &PipelineConfig,
    options: &GeneratorOptions,
    dir: &D,
) -> Result<StageReport<BatchId>> {
    config.validate()?;
    dir.mkdir()?;
    sweep_temporaries(dir)?;

    let ids: Vec<_> = (0..config.n_batches.unwrap_or(1)).map(BatchId).collect();
    info!(
        stage = %Stage::Generate,
        output = %dir.path().display(),
        units = ids.len(),
        "starting"
    );
    let report = WorkerPool::new(config)?.run(Stage::Generate, ids, |id| {
        write_batch(config, options, dir, *id)
    })?;
    info!(
        stage = %Stage::Generate,
        records = report.totals().records_written,
        failed = report.failed.len(),
        "finished"
    );
    Ok(report)
}

fn batch_start(config: &PipelineConfig, options: &GeneratorOptions, id: BatchId) -> Result<i64> {
    i64::try_from(id.0)
        .ok()
        .and_then(|i| i.checked_mul(config.batch_duration_ms()))
        .and_then(|offset| offset.checked_add(options.start_ms))
        .ok_or_else(|| Error::Config(format!("timestamps of {} overflow", id)))
}

fn write_batch<D: Dir>(
    config: &PipelineConfig,
    options: &GeneratorOptions,
    dir: &D,
    id: BatchId,
) -> Result<UnitStats> {
    let start = batch_start(config, options, id)?;
    let duration = config.batch_duration_ms() as i128;
    let batch_size = config.batch_size as i128;
    let mut rng = StdRng::seed_from_u64(options.seed ^ id.0.rotate_left(32));
    let mut kw = KeyWriter::new();

    let (written, high_water) = publish(dir, &id.file_name(), |f| {
        let mut w = FrameWriter::new(ChunkedWriter::new(f, config.write_buffer_size()))?;
        for j in 0..config.batch_size {
            // Less than one batch duration, so it fits.
            let offset = (duration * j as i128 / batch_size) as i64;
            let record = Record {
                timestamp_ms: start + offset,
                batch: id.0,
                categories: CATEGORIES
                    .iter()
                    .map(|values| values[rng.gen_range(0..values.len())].to_owned())
                    .collect(),
                values: (0..NUMERIC_COLUMNS)
                    .map(|_| rng.sample(StandardNormal))
                    .collect(),
            };
            record.encode(&mut kw);
            w.write_frame(kw.as_bytes())?;
        }
        let written = w.count();
        Ok((written, w.finish()?.high_water()))
    })?;

    Ok(UnitStats {
        records_written: written,
        files_written: 1,
        peak_buffered_bytes: high_water + kw.as_bytes().len(),
        ..UnitStats::default()
    })
}
