// Job registry: at most one live download job per object path.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use super::entry::ObjectIdentity;
use super::job::{DownloadJob, JobSettings, JobState};
use super::local_file::FileSpec;
use super::lru::MetadataCache;
use super::stats::StatsCollector;
use crate::config::CacheConfig;
use crate::error::Result;
use crate::source::traits::{ObjectAttrs, ObjectSource};

pub struct JobRegistry {
    jobs: Mutex<HashMap<String, Arc<DownloadJob>>>,
    source: Arc<dyn ObjectSource>,
    metadata: Arc<MetadataCache>,
    stats: Arc<StatsCollector>,
    settings: JobSettings,
    file_mode: u32,
    uid: Option<u32>,
    gid: Option<u32>,
}

impl JobRegistry {
    pub fn new(
        config: &CacheConfig,
        source: Arc<dyn ObjectSource>,
        metadata: Arc<MetadataCache>,
        stats: Arc<StatsCollector>,
    ) -> Self {
        Self {
            jobs: Mutex::new(HashMap::new()),
            source,
            metadata,
            stats,
            settings: JobSettings::from(config),
            file_mode: config.file_mode,
            uid: config.uid,
            gid: config.gid,
        }
    }

    /// Return the live job for `object`, creating a not-yet-started one if there is none.
    ///
    /// Jobs are keyed by bucket and object name only, so a job left over from another
    /// generation is cancelled and replaced here, under the registry lock.
    pub fn get_or_create_job(
        &self,
        object: &ObjectIdentity,
        attrs: &ObjectAttrs,
        destination: PathBuf,
    ) -> Result<Arc<DownloadJob>> {
        let mut jobs = self.jobs.lock();
        self.get_or_create_locked(&mut jobs, object, attrs, destination)
    }

    /// `get_or_create_job` plus registering an open handle on the job, atomically with respect
    /// to `release_handle`.
    pub fn attach_job(
        &self,
        object: &ObjectIdentity,
        attrs: &ObjectAttrs,
        destination: PathBuf,
    ) -> Result<Arc<DownloadJob>> {
        let mut jobs = self.jobs.lock();
        let job = self.get_or_create_locked(&mut jobs, object, attrs, destination)?;
        job.attach();
        Ok(job)
    }

    /// Drop a handle's reference to `job`. When the last handle goes away while the job is
    /// still downloading, the job is cancelled and forgotten; bytes already on disk stay.
    pub fn release_handle(&self, job: &Arc<DownloadJob>) {
        let mut jobs = self.jobs.lock();
        if job.detach() > 0 || job.status().state != JobState::Downloading {
            return;
        }
        let path = job.object().object_path();
        if matches!(jobs.get(&path), Some(current) if Arc::ptr_eq(current, job)) {
            jobs.remove(&path);
            job.cancel();
            debug!("last handle of {} closed, download cancelled", job.object());
        }
    }

    fn get_or_create_locked(
        &self,
        jobs: &mut HashMap<String, Arc<DownloadJob>>,
        object: &ObjectIdentity,
        attrs: &ObjectAttrs,
        destination: PathBuf,
    ) -> Result<Arc<DownloadJob>> {
        let path = object.object_path();
        if let Some(existing) = jobs.get(&path) {
            if existing.attrs().generation == attrs.generation {
                return Ok(Arc::clone(existing));
            }
            warn!(
                "replacing job for {} generation {} with generation {}",
                object,
                existing.attrs().generation,
                attrs.generation
            );
            existing.cancel();
        }

        let job = Arc::new(DownloadJob::new(
            object.clone(),
            attrs.clone(),
            FileSpec {
                path: destination,
                mode: self.file_mode,
                uid: self.uid,
                gid: self.gid,
            },
            Arc::clone(&self.source),
            Arc::clone(&self.metadata),
            self.settings,
            Arc::clone(&self.stats),
        )?);
        debug!("created download job for {}", object);
        jobs.insert(path, Arc::clone(&job));
        Ok(job)
    }

    pub fn get(&self, object: &ObjectIdentity) -> Option<Arc<DownloadJob>> {
        self.jobs.lock().get(&object.object_path()).cloned()
    }

    /// Cancel the job for `object`, if any, and forget it so the next request starts fresh.
    pub fn cancel_and_remove(&self, object: &ObjectIdentity) -> Option<Arc<DownloadJob>> {
        let job = self.jobs.lock().remove(&object.object_path())?;
        job.cancel();
        debug!("cancelled and removed job for {}", object);
        Some(job)
    }

    /// Cancel every job and empty the registry.
    pub fn cancel_all(&self) {
        let jobs: Vec<_> = self.jobs.lock().drain().map(|(_, job)| job).collect();
        for job in &jobs {
            job.cancel();
        }
        debug!("cancelled {} download jobs", jobs.len());
    }

    pub fn len(&self) -> usize {
        self.jobs.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
