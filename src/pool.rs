use std::fmt;

use rayon::prelude::*;
use tracing::{debug, warn};

use crate::{
    config::PipelineConfig,
    error::{Error, Result},
    report::{Stage, StageReport, UnitStats},
};

/// Runs independent units of work on a fixed number of threads.
///
/// Units share nothing but the filesystem and the pool hands each unit to
/// exactly one worker, so no unit is ever processed twice at the same time.
pub(crate) struct WorkerPool {
    pool: rayon::ThreadPool,
    max_attempts: u32,
}

impl WorkerPool {
    pub(crate) fn new(config: &PipelineConfig) -> Result<Self> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.workers)
            .thread_name(|i| format!("lakefold-worker-{}", i))
            .build()?;
        Ok(WorkerPool {
            pool,
            max_attempts: config.max_attempts,
        })
    }

    /// Runs `work` once per unit, retrying transient failures, and collects
    /// every outcome. A fatal failure in any unit fails the whole stage once
    /// the units already in flight have finished.
    pub(crate) fn run<U, F>(&self, stage: Stage, units: Vec<U>, work: F) -> Result<StageReport<U>>
    where
        U: fmt::Display + Send + Sync,
        F: Fn(&U) -> Result<UnitStats> + Sync,
    {
        let outcomes: Vec<(U, Result<UnitStats>)> = self.pool.install(|| {
            units
                .into_par_iter()
                .map(|unit| {
                    let outcome = self.attempt(stage, &unit, &work);
                    (unit, outcome)
                })
                .collect()
        });

        let mut report = StageReport::new(stage);
        let mut fatal = None;
        for (unit, outcome) in outcomes {
            match outcome {
                Ok(stats) => {
                    debug!(
                        %stage,
                        %unit,
                        records_read = stats.records_read,
                        records_written = stats.records_written,
                        files = stats.files_written,
                        "unit done"
                    );
                    report.succeeded.push((unit, stats));
                }
                Err(error) => {
                    warn!(%stage, %unit, %error, "unit failed");
                    if error.is_fatal() && fatal.is_none() {
                        fatal = Some(error);
                    } else {
                        report.failed.push((unit, error));
                    }
                }
            }
        }
        match fatal {
            Some(error) => Err(error),
            None => Ok(report),
        }
    }

    fn attempt<U, F>(&self, stage: Stage, unit: &U, work: &F) -> Result<UnitStats>
    where
        U: fmt::Display,
        F: Fn(&U) -> Result<UnitStats>,
    {
        let mut attempt = 1;
        loop {
            match work(unit) {
                Err(error) if error.is_transient() && attempt < self.max_attempts => {
                    warn!(%stage, %unit, attempt, %error, "retrying unit");
                    attempt += 1;
                }
                outcome => return outcome,
            }
        }
    }
}
