use std::fmt;

use crate::error::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Generate,
    Ingest,
    Compact,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Generate => "generate",
            Stage::Ingest => "ingest",
            Stage::Compact => "compact",
        };
        f.write_str(name)
    }
}

/// What one unit of work (a batch or a partition) did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UnitStats {
    pub records_read: u64,
    pub records_written: u64,
    /// Malformed records dropped under the skip policy.
    pub records_skipped: u64,
    pub files_written: u64,
    /// The most bytes the unit held in its I/O buffers at once.
    pub peak_buffered_bytes: usize,
}

impl UnitStats {
    fn absorb(&mut self, other: &UnitStats) {
        self.records_read += other.records_read;
        self.records_written += other.records_written;
        self.records_skipped += other.records_skipped;
        self.files_written += other.files_written;
        self.peak_buffered_bytes =
            std::cmp::max(self.peak_buffered_bytes, other.peak_buffered_bytes);
    }
}

/// The outcome of a stage, per unit. Units appear in the order they were
/// scheduled. A caller can hand `failed_units()` back to the engine to retry
/// just those.
#[derive(Debug)]
pub struct StageReport<U> {
    pub stage: Stage,
    pub succeeded: Vec<(U, UnitStats)>,
    pub failed: Vec<(U, Error)>,
}

impl<U> StageReport<U> {
    pub(crate) fn new(stage: Stage) -> Self {
        StageReport {
            stage,
            succeeded: Vec::new(),
            failed: Vec::new(),
        }
    }

    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn failed_units(&self) -> Vec<U>
    where
        U: Clone,
    {
        self.failed.iter().map(|(u, _)| u.clone()).collect()
    }

    pub fn stats(&self, unit: &U) -> Option<&UnitStats>
    where
        U: PartialEq,
    {
        self.succeeded
            .iter()
            .find(|(u, _)| u == unit)
            .map(|(_, stats)| stats)
    }

    // Sums over succeeded units; the peak is the largest single peak.
    pub fn totals(&self) -> UnitStats {
        let mut totals = UnitStats::default();
        for (_, stats) in &self.succeeded {
            totals.absorb(stats);
        }
        totals
    }
}

#[cfg(test)]
mod test {
    use super::{Stage, StageReport, UnitStats};
    use crate::error::Error;

    #[test]
    fn test_totals() {
        let mut report = StageReport::new(Stage::Compact);
        report.succeeded.push((
            "a",
            UnitStats {
                records_read: 3,
                records_written: 3,
                files_written: 1,
                peak_buffered_bytes: 10,
                ..UnitStats::default()
            },
        ));
        report.succeeded.push((
            "b",
            UnitStats {
                records_read: 5,
                records_written: 4,
                records_skipped: 1,
                files_written: 2,
                peak_buffered_bytes: 7,
            },
        ));
        report
            .failed
            .push(("c", Error::MissingInput("c".into())));

        assert!(!report.is_complete());
        assert_eq!(vec!["c"], report.failed_units());
        assert_eq!(Some(4), report.stats(&"b").map(|s| s.records_written));
        assert_eq!(None, report.stats(&"c"));
        assert_eq!(
            UnitStats {
                records_read: 8,
                records_written: 7,
                records_skipped: 1,
                files_written: 3,
                peak_buffered_bytes: 10,
            },
            report.totals()
        );
        assert_eq!("compact", Stage::Compact.to_string());
    }
}
