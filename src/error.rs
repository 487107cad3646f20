// Error taxonomy shared by the metadata cache, download jobs and the read path.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

pub type Result<T, E = CacheError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("invalid cache key: {0}")]
    InvalidKey(String),

    #[error("invalid cache configuration: {0}")]
    InvalidConfig(String),

    #[error("entry of {size} units does not fit in a cache of capacity {capacity}")]
    EntryTooLarge { size: u64, capacity: u64 },

    #[error("requested offset {offset} is beyond object size {size}")]
    OffsetOutOfRange { offset: u64, size: u64 },

    /// A job tried to record progress for a generation other than the one in the metadata cache.
    #[error("generation of object being downloaded ({job}) differs from cached generation ({cached})")]
    GenerationConflict { job: i64, cached: i64 },

    /// The remote object changed since it was admitted into the cache.
    #[error("object generation changed: cached {cached}, live {live}")]
    GenerationChanged { cached: i64, live: i64 },

    #[error("remote read failed: {0:#}")]
    RemoteRead(anyhow::Error),

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("timed out after {0:?} waiting for download progress")]
    WaitTimeout(Duration),

    #[error("download job was cancelled")]
    Cancelled,

    #[error("object {0} has no entry in the metadata cache")]
    NotCached(String),

    #[error("range ending at {upper} is not downloaded yet (confirmed {confirmed})")]
    NotYetDownloaded { upper: u64, confirmed: u64 },

    #[error("job is completed but only {offset} of {size} bytes were downloaded")]
    IncompleteDownload { offset: u64, size: u64 },

    /// Terminal error of a download job, shared between every waiter it woke.
    #[error(transparent)]
    Job(Arc<CacheError>),
}

impl CacheError {
    pub(crate) fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Unwraps `Job` layers to the underlying error.
    pub fn root(&self) -> &CacheError {
        match self {
            CacheError::Job(inner) => inner.root(),
            other => other,
        }
    }
}
