use std::io;
use std::path::PathBuf;
use thiserror::Error;

use super::store::StoreError;
use crate::source::SourceError;

/// Why a single download task failed. None of these escape the scheduler loop.
#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("no usable video: {0}")]
    Resolution(String),

    #[error("transfer of {url} failed after {attempts} attempt(s): {source}")]
    Transfer {
        url: String,
        attempts: u32,
        #[source]
        source: SourceError,
    },

    #[error("failed to assemble {path:?}: {source}")]
    Merge {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("queue persistence failed: {0}")]
    Store(#[from] StoreError),

    #[error("download cancelled")]
    Cancelled,

    #[error("not enough free space: {available} bytes available, {required} required")]
    InsufficientSpace { available: u64, required: u64 },

    #[error("unknown source {0}")]
    UnknownSource(i64),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl DownloadError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, DownloadError::Cancelled)
    }
}
