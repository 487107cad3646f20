use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::engine::lru::CacheCapacity;
use crate::error::{CacheError, Result};

/// Bytes copied from the remote reader into the cache file per download iteration (8 MB).
pub const READ_CHUNK_SIZE: u64 = 8 * 1024 * 1024;

/// Span of a single remote range reader; sequential chunks reuse the same reader (200 MB).
pub const DEFAULT_SEQUENTIAL_READ_SIZE: u64 = 200 * 1024 * 1024;

/// Upper bound on how long a reader blocks waiting for download progress.
pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(5);

/// Permission bits for cache files. Directories get the execute bits added.
pub const DEFAULT_FILE_MODE: u32 = 0o644;

/// Default metadata cache capacity (10 GB of object bytes).
pub const DEFAULT_CAPACITY_BYTES: u64 = 10 * 1024 * 1024 * 1024;

/// Top-level configuration for the cache engine.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Root directory holding `<bucket>/<object>` cache files.
    pub cache_dir: PathBuf,
    /// Bound on the metadata cache, in object bytes or entry count.
    pub capacity: CacheCapacity,
    /// Size of each download chunk in bytes.
    pub chunk_size: u64,
    /// Byte span requested from the remote store per range reader.
    pub sequential_read_size: u64,
    /// Milliseconds a blocking read waits for the job before giving up.
    pub wait_timeout_ms: u64,
    /// Permission bits applied to created cache files.
    pub file_mode: u32,
    /// Numeric owner applied to cache files; unchanged when absent.
    pub uid: Option<u32>,
    /// Numeric group applied to cache files; unchanged when absent.
    pub gid: Option<u32>,
}

impl CacheConfig {
    pub fn new(cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            ..Self::default()
        }
    }

    pub fn wait_timeout(&self) -> Duration {
        Duration::from_millis(self.wait_timeout_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(CacheError::InvalidConfig("chunk_size must be > 0".into()));
        }
        if self.sequential_read_size == 0 {
            return Err(CacheError::InvalidConfig(
                "sequential_read_size must be > 0".into(),
            ));
        }
        if self.capacity.limit() == 0 {
            return Err(CacheError::InvalidConfig("capacity must be > 0".into()));
        }
        Ok(())
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            cache_dir: std::env::temp_dir().join("objcache"),
            capacity: CacheCapacity::Bytes(DEFAULT_CAPACITY_BYTES),
            chunk_size: READ_CHUNK_SIZE,
            sequential_read_size: DEFAULT_SEQUENTIAL_READ_SIZE,
            wait_timeout_ms: DEFAULT_WAIT_TIMEOUT.as_millis() as u64,
            file_mode: DEFAULT_FILE_MODE,
            uid: None,
            gid: None,
        }
    }
}
