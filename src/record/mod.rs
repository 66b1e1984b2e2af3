use anyhow::anyhow;
use chrono::{DateTime, Datelike, Timelike, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    encoding::{decode_exact, Decode, Encode, KeyReader, KeyWriter},
    layout::PartitionKey,
};

/// One synthetic row: a timestamp, categorical columns, numeric columns, and
/// the index of the batch that produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub timestamp_ms: i64,
    pub batch: u64,
    pub categories: Vec<String>,
    pub values: Vec<f64>,
}

impl Encode for Record {
    fn write_bytes(&self, kw: &mut KeyWriter) {
        (
            self.timestamp_ms,
            (self.batch, (&self.categories, &self.values)),
        )
            .write_bytes(kw)
    }
}

impl Decode for Record {
    fn decode(kr: &mut KeyReader) -> anyhow::Result<Self> {
        let (timestamp_ms, (batch, (categories, values))): (i64, (u64, (Vec<String>, Vec<f64>))) =
            Decode::decode(kr)?;
        Ok(Record {
            timestamp_ms,
            batch,
            categories,
            values,
        })
    }
}

impl Record {
    pub fn encode(&self, kw: &mut KeyWriter) {
        kw.clear();
        self.write_bytes(kw);
    }

    pub fn decode_from(buf: &[u8]) -> anyhow::Result<Self> {
        decode_exact(buf)
    }
}

/// The pure function from a record to the partition it belongs to.
///
/// Time buckets are computed in UTC so the key never depends on where the
/// pipeline runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartitionBy {
    #[default]
    Month,
    Day,
    Hour,
    Category {
        column: usize,
    },
}

fn utc(record: &Record) -> anyhow::Result<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp_millis(record.timestamp_ms)
        .ok_or_else(|| anyhow!("timestamp {} is out of range", record.timestamp_ms))
}

impl PartitionBy {
    pub fn key(&self, record: &Record) -> anyhow::Result<PartitionKey> {
        let key = match self {
            PartitionBy::Month => {
                let t = utc(record)?;
                format!("{:04}-{:02}", t.year(), t.month())
            }
            PartitionBy::Day => {
                let t = utc(record)?;
                format!("{:04}-{:02}-{:02}", t.year(), t.month(), t.day())
            }
            PartitionBy::Hour => {
                let t = utc(record)?;
                format!(
                    "{:04}-{:02}-{:02}T{:02}",
                    t.year(),
                    t.month(),
                    t.day(),
                    t.hour()
                )
            }
            PartitionBy::Category { column } => record
                .categories
                .get(*column)
                .cloned()
                .ok_or_else(|| anyhow!("record has no categorical column {}", column))?,
        };
        PartitionKey::new(key)
    }
}
