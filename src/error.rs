use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("input {0} does not exist")]
    MissingInput(PathBuf),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("malformed record {index} in {file}: {reason}")]
    MalformedRecord {
        file: PathBuf,
        index: u64,
        reason: String,
    },
    #[error("corrupt file {file}: {reason}")]
    Corrupt { file: PathBuf, reason: String },
    #[error("resource bound exceeded: {0}")]
    ResourceBound(String),
    #[error("io error: {0:#}")]
    Io(#[from] anyhow::Error),
    #[error("failed to build worker pool: {0}")]
    Pool(#[from] rayon::ThreadPoolBuildError),
}

impl Error {
    pub(crate) fn corrupt<P: Into<PathBuf>, S: ToString>(file: P, reason: S) -> Self {
        Error::Corrupt {
            file: file.into(),
            reason: reason.to_string(),
        }
    }

    // Worth retrying the unit that produced it.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Io(_))
    }

    // A misconfiguration that no amount of retrying fixes; the whole stage
    // stops.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::ResourceBound(_) | Error::Config(_) | Error::Pool(_)
        )
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e.into())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
