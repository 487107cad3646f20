// Read-path orchestration: admits objects into the metadata cache, checks generations, hands
// out download jobs and opens cache handles.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::fs::File;
use tracing::{debug, info, warn};

use super::entry::{CacheEntry, CacheKey, ObjectIdentity};
use super::handle::CacheHandle;
use super::local_file::{self, FileSpec};
use super::lru::MetadataCache;
use super::registry::JobRegistry;
use super::stats::{CacheStats, StatsCollector};
use crate::config::CacheConfig;
use crate::error::{CacheError, Result};
use crate::source::traits::{ObjectAttrs, ObjectSource};

pub struct CacheHandler {
    config: CacheConfig,
    source: Arc<dyn ObjectSource>,
    metadata: Arc<MetadataCache>,
    registry: Arc<JobRegistry>,
    stats: Arc<StatsCollector>,
}

impl CacheHandler {
    /// Build a handler with its own metadata cache and job registry.
    pub fn new(config: CacheConfig, source: Arc<dyn ObjectSource>) -> Result<Self> {
        config.validate()?;
        std::fs::create_dir_all(&config.cache_dir).map_err(|e| {
            CacheError::io(
                format!("error creating cache directory {}", config.cache_dir.display()),
                e,
            )
        })?;

        let metadata = Arc::new(MetadataCache::new(config.capacity));
        let stats = Arc::new(StatsCollector::new());
        let registry = Arc::new(JobRegistry::new(
            &config,
            Arc::clone(&source),
            Arc::clone(&metadata),
            Arc::clone(&stats),
        ));

        info!(
            "cache handler ready at {} (capacity {:?}, chunk {} bytes)",
            config.cache_dir.display(),
            config.capacity,
            config.chunk_size
        );

        Ok(Self {
            config,
            source,
            metadata,
            registry,
            stats,
        })
    }

    /// Stat the object remotely, then open it through the cache.
    pub async fn read_file(
        &self,
        object: &ObjectIdentity,
        trigger_download: bool,
    ) -> Result<CacheHandle> {
        let attrs = self
            .source
            .stat(object)
            .await
            .map_err(|e| CacheError::RemoteRead(e.context(format!("error stating {}", object))))?;
        self.prepare_read(object, &attrs, trigger_download).await
    }

    /// Admit `object` at the generation described by `remote` and return a handle on its local
    /// copy.
    ///
    /// If the cache holds another generation, the stale job, entry and file are dropped and the
    /// call fails with `GenerationChanged`; the caller retries from scratch.
    pub async fn prepare_read(
        &self,
        object: &ObjectIdentity,
        remote: &ObjectAttrs,
        start_background: bool,
    ) -> Result<CacheHandle> {
        let key = object.key()?;
        let path = self.local_file_path(object)?;

        match self.metadata.lookup(&key) {
            Some(entry) if entry.generation != remote.generation => {
                warn!(
                    "generation of {} changed from {} to {}, invalidating cached copy",
                    object, entry.generation, remote.generation
                );
                self.invalidate(object, &key, &path)?;
                return Err(CacheError::GenerationChanged {
                    cached: entry.generation,
                    live: remote.generation,
                });
            }
            Some(_) => {}
            None => {
                let entry = CacheEntry::new(object.clone(), remote.generation, remote.size);
                let evicted = self.metadata.insert(key.clone(), entry)?;
                for victim in evicted {
                    self.discard_evicted(&victim);
                }
            }
        }

        let job = self.registry.attach_job(object, remote, path.clone())?;
        job.reset_if_terminal();

        // From here on the handle owns the attachment and releases it on every exit path.
        let file = match local_file::create_file(&self.file_spec(path), false) {
            Ok(file) => File::from_std(file),
            Err(e) => {
                self.registry.release_handle(&job);
                return Err(e);
            }
        };
        let handle = CacheHandle::new(
            file,
            job,
            Arc::clone(&self.metadata),
            Arc::clone(&self.registry),
            Arc::clone(&self.stats),
            key,
            remote.generation,
        );

        if start_background {
            handle.start_download().await?;
        }
        Ok(handle)
    }

    /// Drop everything cached for `object`: its job, its metadata entry and its local file.
    pub fn remove_object(&self, object: &ObjectIdentity) -> Result<()> {
        let key = object.key()?;
        let path = self.local_file_path(object)?;
        self.invalidate(object, &key, &path)
    }

    /// Cancel all downloads. Cached files and metadata are kept.
    pub fn destroy(&self) {
        self.registry.cancel_all();
        info!("cache handler destroyed, {} entries kept", self.metadata.len());
    }

    pub fn local_file_path(&self, object: &ObjectIdentity) -> Result<PathBuf> {
        local_file::cache_file_path(&self.config.cache_dir, &object.bucket, &object.object)
    }

    pub fn metadata(&self) -> &Arc<MetadataCache> {
        &self.metadata
    }

    pub fn registry(&self) -> &Arc<JobRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn stats(&self) -> CacheStats {
        self.stats.snapshot()
    }

    fn file_spec(&self, path: PathBuf) -> FileSpec {
        FileSpec {
            path,
            mode: self.config.file_mode,
            uid: self.config.uid,
            gid: self.config.gid,
        }
    }

    fn invalidate(&self, object: &ObjectIdentity, key: &CacheKey, path: &Path) -> Result<()> {
        self.registry.cancel_and_remove(object);
        if self.metadata.remove(key).is_some() {
            self.stats.record_invalidation();
        }
        local_file::remove_file(path)
    }

    fn discard_evicted(&self, victim: &CacheEntry) {
        debug!("evicting {} from the cache", victim.identity);
        self.stats.record_eviction();
        self.registry.cancel_and_remove(&victim.identity);
        let removed = self
            .local_file_path(&victim.identity)
            .and_then(|path| local_file::remove_file(&path));
        if let Err(e) = removed {
            warn!("failed to remove evicted file of {}: {}", victim.identity, e);
        }
    }
}

impl Drop for CacheHandler {
    fn drop(&mut self) {
        self.registry.cancel_all();
    }
}
