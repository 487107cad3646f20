// Open handle on a cached object: serves reads from the local file once the job has confirmed
// the requested range.

use std::io::SeekFrom;
use std::sync::Arc;

use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::debug;

use super::entry::{CacheKey, ObjectIdentity};
use super::job::{DownloadJob, JobStatus};
use super::lru::MetadataCache;
use super::registry::JobRegistry;
use super::stats::StatsCollector;
use crate::error::{CacheError, Result};

pub struct CacheHandle {
    file: File,
    job: Arc<DownloadJob>,
    metadata: Arc<MetadataCache>,
    registry: Arc<JobRegistry>,
    stats: Arc<StatsCollector>,
    key: CacheKey,
    generation: i64,
    released: bool,
}

impl CacheHandle {
    /// Wraps a job the caller already attached to; the handle releases it when closed.
    pub(crate) fn new(
        file: File,
        job: Arc<DownloadJob>,
        metadata: Arc<MetadataCache>,
        registry: Arc<JobRegistry>,
        stats: Arc<StatsCollector>,
        key: CacheKey,
        generation: i64,
    ) -> Self {
        Self {
            file,
            job,
            metadata,
            registry,
            stats,
            key,
            generation,
            released: false,
        }
    }

    /// Kick off the background download without waiting for any data.
    pub async fn start_download(&self) -> Result<JobStatus> {
        self.job.download(0, false).await.into_result()
    }

    /// Read up to `dst.len()` bytes at `offset` into `dst`.
    ///
    /// `live_generation` is the object's current remote generation; a mismatch fails with
    /// `GenerationChanged`. With `wait_for_data` unset, a range that is not yet on disk fails
    /// with `NotYetDownloaded` instead of blocking. Returns fewer bytes than requested only at
    /// the end of the object.
    pub async fn read(
        &mut self,
        live_generation: i64,
        offset: u64,
        dst: &mut [u8],
        wait_for_data: bool,
    ) -> Result<usize> {
        if live_generation != self.generation {
            return Err(CacheError::GenerationChanged {
                cached: self.generation,
                live: live_generation,
            });
        }

        let size = self.job.attrs().size;
        if offset > size {
            return Err(CacheError::OffsetOutOfRange { offset, size });
        }
        let upper = (offset + dst.len() as u64).min(size);
        if upper == offset {
            return Ok(0);
        }

        let entry = self
            .metadata
            .lookup(&self.key)
            .ok_or_else(|| CacheError::NotCached(self.job.object().to_string()))?;
        if entry.generation != live_generation {
            return Err(CacheError::GenerationChanged {
                cached: entry.generation,
                live: live_generation,
            });
        }

        let confirmed = entry.downloaded_offset;
        let hit = confirmed >= upper;
        if !hit {
            if !wait_for_data {
                self.stats.record_miss();
                self.job.download(upper, false).await.into_result()?;
                return Err(CacheError::NotYetDownloaded { upper, confirmed });
            }
            let status = match self.job.download(upper, true).await.into_result() {
                Ok(status) => status,
                Err(e) => {
                    self.stats.record_miss();
                    return Err(e);
                }
            };
            if status.offset < upper {
                self.stats.record_miss();
                debug!(
                    "{} stopped at {:?} before reaching {}",
                    self.job.object(),
                    status.state,
                    upper
                );
                return Err(CacheError::Cancelled);
            }
        }

        let len = (upper - offset) as usize;
        let n = self.read_local(offset, &mut dst[..len]).await?;
        self.stats.record_read(hit, n as u64);
        Ok(n)
    }

    pub fn object(&self) -> &ObjectIdentity {
        self.job.object()
    }

    pub fn generation(&self) -> i64 {
        self.generation
    }

    pub fn job(&self) -> &Arc<DownloadJob> {
        &self.job
    }

    /// Detach from the download job. Cached bytes stay on disk.
    pub fn close(mut self) {
        self.release();
    }

    /// Fill `dst` from the local file. Hitting end of file early is not an error.
    async fn read_local(&mut self, offset: u64, dst: &mut [u8]) -> Result<usize> {
        self.file
            .seek(SeekFrom::Start(offset))
            .await
            .map_err(|e| CacheError::io(format!("error seeking cache file to {}", offset), e))?;

        let mut filled = 0;
        while filled < dst.len() {
            let n = self
                .file
                .read(&mut dst[filled..])
                .await
                .map_err(|e| CacheError::io("error reading cache file", e))?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        Ok(filled)
    }

    fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        self.registry.release_handle(&self.job);
    }
}

impl Drop for CacheHandle {
    fn drop(&mut self) {
        self.release();
    }
}
