// Names of the files and directories that make up a dataset.
//
//   raw:       <root>/batch_<id>
//   ingested:  <root>/partition=<key>/batch_<id>
//   compacted: <root>/partition=<key>/data
//
// Anything carrying the temporary suffix is an unpublished artifact and is
// never a valid dataset name.

use std::fmt;

use anyhow::bail;

pub const DATA_FILE: &str = "data";

const BATCH_PREFIX: &str = "batch_";
const PARTITION_PREFIX: &str = "partition=";
const TEMP_SUFFIX: &str = ".tmp";
const MAX_KEY_LEN: usize = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BatchId(pub u64);

impl BatchId {
    pub fn file_name(&self) -> String {
        format!("{}{}", BATCH_PREFIX, self.0)
    }

    // Only the canonical spelling parses, so every batch has exactly one
    // file name.
    pub fn parse(name: &str) -> Option<Self> {
        let digits = name.strip_prefix(BATCH_PREFIX)?;
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        if digits.len() > 1 && digits.starts_with('0') {
            return None;
        }
        digits.parse().ok().map(BatchId)
    }
}

impl fmt::Display for BatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", BATCH_PREFIX, self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PartitionKey(String);

impl PartitionKey {
    pub fn new<S: Into<String>>(key: S) -> anyhow::Result<Self> {
        let key = key.into();
        if key.is_empty() {
            bail!("partition key is empty");
        }
        if key.len() > MAX_KEY_LEN {
            bail!("partition key is longer than {} bytes", MAX_KEY_LEN);
        }
        if key.starts_with('.') {
            bail!("partition key {:?} starts with '.'", key);
        }
        if is_temporary(&key) {
            bail!("partition key {:?} ends with {}", key, TEMP_SUFFIX);
        }
        if let Some(c) = key
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ':')))
        {
            bail!("partition key {:?} contains {:?}", key, c);
        }
        Ok(PartitionKey(key))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn dir_name(&self) -> String {
        format!("{}{}", PARTITION_PREFIX, self.0)
    }

    pub fn parse_dir(name: &str) -> Option<Self> {
        let key = name.strip_prefix(PARTITION_PREFIX)?;
        PartitionKey::new(key).ok()
    }
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", PARTITION_PREFIX, self.0)
    }
}

pub fn temp_name(name: &str) -> String {
    format!("{}{}", name, TEMP_SUFFIX)
}

pub fn is_temporary(name: &str) -> bool {
    name.ends_with(TEMP_SUFFIX)
}
