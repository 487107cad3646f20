// Per-object download job: a single background task copies the remote object into the local
// cache file chunk by chunk, records progress in the metadata cache and wakes waiting readers.

use std::io::SeekFrom;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use parking_lot::Mutex;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::entry::{CacheKey, ObjectIdentity};
use super::local_file::{self, FileSpec};
use super::lru::MetadataCache;
use super::stats::{JobOutcome, StatsCollector};
use crate::config::CacheConfig;
use crate::error::{CacheError, Result};
use crate::source::traits::{ObjectAttrs, ObjectReader, ObjectSource, RangeRequest};

/// Buffer used to move bytes from the remote reader into the cache file.
const COPY_BUFFER_SIZE: usize = 256 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    NotStarted,
    Downloading,
    Completed,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct JobStatus {
    pub state: JobState,
    /// Bytes confirmed written to the cache file when this status was taken.
    pub offset: u64,
    pub error: Option<Arc<CacheError>>,
}

impl JobStatus {
    fn not_started() -> Self {
        Self {
            state: JobState::NotStarted,
            offset: 0,
            error: None,
        }
    }

    fn with_error(mut self, error: CacheError) -> Self {
        self.error = Some(Arc::new(error));
        self
    }

    /// Turn a status carrying an error into `Err`.
    pub fn into_result(self) -> Result<JobStatus> {
        match self.error {
            Some(error) => Err(CacheError::Job(error)),
            None => Ok(self),
        }
    }
}

/// Tunables copied out of the engine configuration.
#[derive(Debug, Clone, Copy)]
pub struct JobSettings {
    pub chunk_size: u64,
    pub sequential_read_size: u64,
    pub wait_timeout: Duration,
}

impl From<&CacheConfig> for JobSettings {
    fn from(config: &CacheConfig) -> Self {
        Self {
            chunk_size: config.chunk_size,
            sequential_read_size: config.sequential_read_size,
            wait_timeout: config.wait_timeout(),
        }
    }
}

/// A reader blocked until the job reaches `offset` or terminates. Fires exactly once.
struct Subscriber {
    offset: u64,
    notifier: oneshot::Sender<JobStatus>,
}

struct Progress {
    status: JobStatus,
    subscribers: Vec<Subscriber>,
    cancel: CancellationToken,
}

impl Progress {
    fn new() -> Self {
        Self {
            status: JobStatus::not_started(),
            subscribers: Vec::new(),
            cancel: CancellationToken::new(),
        }
    }
}

pub struct DownloadJob {
    object: ObjectIdentity,
    key: CacheKey,
    attrs: ObjectAttrs,
    file_spec: FileSpec,
    source: Arc<dyn ObjectSource>,
    metadata: Arc<MetadataCache>,
    settings: JobSettings,
    stats: Arc<StatsCollector>,
    handles: AtomicUsize,
    progress: Mutex<Progress>,
}

impl DownloadJob {
    pub fn new(
        object: ObjectIdentity,
        attrs: ObjectAttrs,
        file_spec: FileSpec,
        source: Arc<dyn ObjectSource>,
        metadata: Arc<MetadataCache>,
        settings: JobSettings,
        stats: Arc<StatsCollector>,
    ) -> Result<Self> {
        let key = object.key()?;
        Ok(Self {
            object,
            key,
            attrs,
            file_spec,
            source,
            metadata,
            settings,
            stats,
            handles: AtomicUsize::new(0),
            progress: Mutex::new(Progress::new()),
        })
    }

    /// Start the download if needed and optionally wait until `offset` bytes are on disk.
    ///
    /// Never blocks while holding the job lock. A wait that outlasts the configured timeout
    /// returns a `Cancelled` status carrying `WaitTimeout`; the download itself keeps running.
    pub async fn download(self: &Arc<Self>, offset: u64, wait_for_download: bool) -> JobStatus {
        let receiver = {
            let mut progress = self.progress.lock();
            if offset > self.attrs.size {
                return progress.status.clone().with_error(CacheError::OffsetOutOfRange {
                    offset,
                    size: self.attrs.size,
                });
            }

            match progress.status.state {
                JobState::Completed => {
                    let status = progress.status.clone();
                    if status.offset < self.attrs.size {
                        let offset = status.offset;
                        return status.with_error(CacheError::IncompleteDownload {
                            offset,
                            size: self.attrs.size,
                        });
                    }
                    return status;
                }
                JobState::NotStarted => {
                    progress.status.state = JobState::Downloading;
                    self.spawn_download(progress.cancel.clone());
                }
                _ => {}
            }

            let status = &progress.status;
            if matches!(status.state, JobState::Failed | JobState::Cancelled)
                || !wait_for_download
                || status.offset >= offset
            {
                return status.clone();
            }

            let (notifier, receiver) = oneshot::channel();
            progress.subscribers.push(Subscriber { offset, notifier });
            receiver
        };

        match tokio::time::timeout(self.settings.wait_timeout, receiver).await {
            Ok(Ok(status)) => status,
            Ok(Err(_)) => self.cancelled_status(CacheError::Cancelled),
            Err(_) => {
                warn!(
                    "timed out after {:?} waiting for {} to reach offset {}",
                    self.settings.wait_timeout, self.object, offset
                );
                self.cancelled_status(CacheError::WaitTimeout(self.settings.wait_timeout))
            }
        }
    }

    /// Cancel the download and wake every waiter. Idempotent; bytes on disk are kept.
    pub fn cancel(&self) {
        let mut progress = self.progress.lock();
        self.cancel_locked(&mut progress);
    }

    /// Cancel, then return to `NotStarted` with no subscribers and a fresh cancellation scope.
    /// The cache file is left untouched.
    pub fn reset(&self) {
        let mut progress = self.progress.lock();
        self.cancel_locked(&mut progress);
        *progress = Progress::new();
    }

    /// Reset only if the job is `Failed` or `Cancelled`, checked and applied under one lock so
    /// concurrent callers cannot cancel a download another caller just restarted. Returns whether
    /// the job was reset.
    pub fn reset_if_terminal(&self) -> bool {
        let mut progress = self.progress.lock();
        if !matches!(progress.status.state, JobState::Failed | JobState::Cancelled) {
            return false;
        }
        debug!(
            "restarting {:?} download of {}",
            progress.status.state, self.object
        );
        // Already terminal, so there is nothing left to cancel or notify.
        progress.cancel.cancel();
        *progress = Progress::new();
        true
    }

    pub fn status(&self) -> JobStatus {
        self.progress.lock().status.clone()
    }

    pub fn subscriber_count(&self) -> usize {
        self.progress.lock().subscribers.len()
    }

    pub fn object(&self) -> &ObjectIdentity {
        &self.object
    }

    pub fn attrs(&self) -> &ObjectAttrs {
        &self.attrs
    }

    pub fn file_path(&self) -> &Path {
        &self.file_spec.path
    }

    /// Register an open handle. Returns the number of attached handles.
    pub fn attach(&self) -> usize {
        self.handles.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Unregister an open handle. Returns the number of handles still attached.
    pub fn detach(&self) -> usize {
        self.handles.fetch_sub(1, Ordering::AcqRel).saturating_sub(1)
    }

    fn cancelled_status(&self, error: CacheError) -> JobStatus {
        let offset = self.progress.lock().status.offset;
        JobStatus {
            state: JobState::Cancelled,
            offset,
            error: None,
        }
        .with_error(error)
    }

    fn cancel_locked(&self, progress: &mut Progress) {
        if progress.status.state == JobState::Downloading {
            debug!("cancelling in-flight download of {}", self.object);
            self.stats.job_ended(JobOutcome::Cancelled);
        }
        progress.cancel.cancel();
        progress.status.state = JobState::Cancelled;
        Self::notify_subscribers(progress);
    }

    /// Wake subscribers whose offset is reached, or all of them once the job failed or was
    /// cancelled.
    fn notify_subscribers(progress: &mut Progress) {
        let status = &progress.status;
        let terminal = status.error.is_some() || status.state == JobState::Cancelled;
        for subscriber in std::mem::take(&mut progress.subscribers) {
            if terminal || status.offset >= subscriber.offset {
                // The waiter may have timed out already.
                let _ = subscriber.notifier.send(status.clone());
            } else {
                progress.subscribers.push(subscriber);
            }
        }
    }

    fn spawn_download(self: &Arc<Self>, cancel: CancellationToken) {
        let job = Arc::clone(self);
        tokio::spawn(async move {
            job.stats.task_started();
            info!(
                "download started for {} generation {} ({} bytes)",
                job.object, job.attrs.generation, job.attrs.size
            );
            let result = job.copy_object(&cancel).await;
            job.stats.task_exited();
            match result {
                Ok(()) => job.complete(&cancel),
                Err(e) => job.fail(&cancel, e),
            }
        });
    }

    /// Copy `[0, size)` into the cache file. Cancellation is checked at every chunk boundary
    /// and while waiting for a remote reader to open, never in the middle of a chunk copy.
    async fn copy_object(&self, cancel: &CancellationToken) -> Result<()> {
        let file = local_file::create_file(&self.file_spec, true)?;
        let mut file = File::from_std(file);
        let size = self.attrs.size;
        let mut buf = vec![0u8; COPY_BUFFER_SIZE];
        let mut reader: Option<(ObjectReader, u64)> = None;
        let mut start = 0u64;

        while start < size {
            if cancel.is_cancelled() {
                debug!("download of {} cancelled at offset {}", self.object, start);
                return Ok(());
            }

            let chunk_end = (start + self.settings.chunk_size).min(size);
            file.seek(SeekFrom::Start(start)).await.map_err(|e| {
                CacheError::io(format!("error seeking cache file to {}", start), e)
            })?;

            let mut pos = start;
            while pos < chunk_end {
                let (mut stream, limit) = match reader.take() {
                    Some(open) => open,
                    None => {
                        let limit = (pos + self.settings.sequential_read_size).min(size);
                        match self.open_reader(pos, limit, cancel).await? {
                            Some(stream) => (stream, limit),
                            None => return Ok(()),
                        }
                    }
                };

                let until = chunk_end.min(limit);
                while pos < until {
                    let want = ((until - pos) as usize).min(buf.len());
                    let n = stream.read(&mut buf[..want]).await.map_err(|e| {
                        CacheError::RemoteRead(anyhow!(e).context(format!(
                            "error reading {} at offset {}",
                            self.object, pos
                        )))
                    })?;
                    if n == 0 {
                        return Err(CacheError::RemoteRead(anyhow!(
                            "unexpected end of stream for {} at offset {}, reader ends at {}",
                            self.object,
                            pos,
                            limit
                        )));
                    }
                    file.write_all(&buf[..n]).await.map_err(|e| {
                        CacheError::io(format!("error writing cache file at {}", pos), e)
                    })?;
                    pos += n as u64;
                }

                if pos < limit {
                    reader = Some((stream, limit));
                }
            }

            file.flush()
                .await
                .map_err(|e| CacheError::io("error flushing cache file", e))?;
            self.stats.record_downloaded(chunk_end - start);
            start = chunk_end;

            if !self.advance(cancel, start)? {
                return Ok(());
            }
        }

        Ok(())
    }

    /// Open a remote reader over `[start, limit)`. Returns `None` if cancelled while waiting.
    async fn open_reader(
        &self,
        start: u64,
        limit: u64,
        cancel: &CancellationToken,
    ) -> Result<Option<ObjectReader>> {
        let request = RangeRequest {
            object: self.object.clone(),
            generation: self.attrs.generation,
            range: start..limit,
            read_compressed: self.attrs.gzip_encoded,
        };
        debug!("opening reader for {} range [{}, {})", self.object, start, limit);
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Ok(None),
            opened = self.source.open_range_reader(request) => {
                opened.map(Some).map_err(|e| {
                    CacheError::RemoteRead(e.context(format!(
                        "error opening reader for {} range [{}, {})",
                        self.object, start, limit
                    )))
                })
            }
        }
    }

    /// Publish a new confirmed offset. Returns `false` if the job was cancelled meanwhile, or
    /// if its metadata entry was evicted or invalidated, in which case the job cancels itself.
    fn advance(&self, cancel: &CancellationToken, offset: u64) -> Result<bool> {
        let mut progress = self.progress.lock();
        if cancel.is_cancelled() {
            return Ok(false);
        }

        if !self
            .metadata
            .record_progress(&self.key, self.attrs.generation, offset)?
        {
            debug!(
                "metadata of {} dropped at offset {}, stopping download",
                self.object, offset
            );
            self.cancel_locked(&mut progress);
            return Ok(false);
        }

        progress.status.offset = offset;
        debug!("{} downloaded {} of {} bytes", self.object, offset, self.attrs.size);
        Self::notify_subscribers(&mut progress);
        Ok(true)
    }

    fn complete(&self, cancel: &CancellationToken) {
        let mut progress = self.progress.lock();
        if cancel.is_cancelled() {
            return;
        }
        progress.status.state = JobState::Completed;
        self.stats.job_ended(JobOutcome::Completed);
        info!("download completed for {} ({} bytes)", self.object, self.attrs.size);
        Self::notify_subscribers(&mut progress);
    }

    fn fail(&self, cancel: &CancellationToken, error: CacheError) {
        let mut progress = self.progress.lock();
        if cancel.is_cancelled() {
            debug!("ignoring error for cancelled download of {}: {}", self.object, error);
            return;
        }
        warn!("download of {} failed: {}", self.object, error);
        progress.status.state = JobState::Failed;
        self.stats.job_ended(JobOutcome::Failed);
        progress.status.error = Some(Arc::new(error));
        Self::notify_subscribers(&mut progress);
    }
}
