mod common;

use std::sync::Arc;
use std::time::UNIX_EPOCH;

use common::{wait_until, FaultySource};
use objcache::engine::stats::StatsCollector;
use objcache::source::traits::ObjectSource;
use objcache::{
    CacheCapacity, CacheConfig, CacheEntry, JobRegistry, JobState, MetadataCache, ObjectAttrs,
    ObjectIdentity,
};

const MIB: u64 = 1024 * 1024;

fn registry(source: Arc<FaultySource>) -> (tempfile::TempDir, Arc<JobRegistry>) {
    let (dir, registry, _) = registry_with_metadata(source);
    (dir, registry)
}

fn registry_with_metadata(
    source: Arc<FaultySource>,
) -> (tempfile::TempDir, Arc<JobRegistry>, Arc<MetadataCache>) {
    let dir = tempfile::tempdir().unwrap();
    let config = CacheConfig {
        chunk_size: MIB,
        sequential_read_size: 4 * MIB,
        ..CacheConfig::new(dir.path())
    };
    let source: Arc<dyn ObjectSource> = source;
    let metadata = Arc::new(MetadataCache::new(CacheCapacity::Entries(16)));
    let registry = JobRegistry::new(
        &config,
        source,
        metadata.clone(),
        Arc::new(StatsCollector::new()),
    );
    (dir, Arc::new(registry), metadata)
}

fn object(name: &str) -> ObjectIdentity {
    ObjectIdentity::new("bucket", UNIX_EPOCH, name)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_get_or_create_returns_one_job() {
    let source = Arc::new(FaultySource::new());
    let attrs = source.put("bucket", "a.bin", vec![7u8; 1024]);
    let (dir, registry) = registry(source);
    let path = dir.path().join("bucket/a.bin");

    let mut tasks = Vec::new();
    for _ in 0..16 {
        let registry = registry.clone();
        let attrs = attrs.clone();
        let path = path.clone();
        tasks.push(tokio::spawn(async move {
            registry
                .get_or_create_job(&object("a.bin"), &attrs, path)
                .unwrap()
        }));
    }

    let mut jobs = Vec::new();
    for task in tasks {
        jobs.push(task.await.unwrap());
    }
    assert!(jobs.iter().all(|job| Arc::ptr_eq(job, &jobs[0])));
    assert_eq!(registry.len(), 1);
}

#[tokio::test]
async fn test_new_generation_replaces_and_cancels_old_job() {
    let source = Arc::new(FaultySource::new());
    let old_attrs = source.put("bucket", "a.bin", vec![1u8; 1024]);
    let (dir, registry) = registry(source.clone());
    let path = dir.path().join("bucket/a.bin");

    let old = registry
        .get_or_create_job(&object("a.bin"), &old_attrs, path.clone())
        .unwrap();
    let new_attrs = ObjectAttrs {
        generation: old_attrs.generation + 1,
        ..old_attrs.clone()
    };
    let new = registry
        .get_or_create_job(&object("a.bin"), &new_attrs, path)
        .unwrap();

    assert!(!Arc::ptr_eq(&old, &new));
    assert_eq!(old.status().state, JobState::Cancelled);
    assert_eq!(new.status().state, JobState::NotStarted);
    assert_eq!(new.attrs().generation, new_attrs.generation);
    assert_eq!(registry.len(), 1);
}

#[tokio::test]
async fn test_cancel_and_remove() {
    let source = Arc::new(FaultySource::new());
    let attrs = source.put("bucket", "a.bin", vec![1u8; 1024]);
    let (dir, registry) = registry(source);

    let job = registry
        .get_or_create_job(&object("a.bin"), &attrs, dir.path().join("bucket/a.bin"))
        .unwrap();
    let removed = registry.cancel_and_remove(&object("a.bin")).unwrap();

    assert!(Arc::ptr_eq(&job, &removed));
    assert_eq!(job.status().state, JobState::Cancelled);
    assert!(registry.is_empty());
    assert!(registry.cancel_and_remove(&object("a.bin")).is_none());
}

#[tokio::test]
async fn test_last_handle_release_cancels_running_job() {
    let source = Arc::new(FaultySource::new());
    let attrs = source.put("bucket", "a.bin", vec![1u8; 2 * MIB as usize]);
    let _gate = source.gate_opens(0);
    let (dir, registry) = registry(source);
    let path = dir.path().join("bucket/a.bin");

    let first = registry
        .attach_job(&object("a.bin"), &attrs, path.clone())
        .unwrap();
    let second = registry.attach_job(&object("a.bin"), &attrs, path).unwrap();
    assert!(Arc::ptr_eq(&first, &second));
    first.download(0, false).await;

    registry.release_handle(&first);
    assert_eq!(first.status().state, JobState::Downloading);
    assert_eq!(registry.len(), 1);

    registry.release_handle(&second);
    assert_eq!(first.status().state, JobState::Cancelled);
    assert!(registry.is_empty());
}

#[tokio::test]
async fn test_release_keeps_completed_job() {
    let source = Arc::new(FaultySource::new());
    let attrs = source.put("bucket", "a.bin", vec![3u8; 1024]);
    let (dir, registry, metadata) = registry_with_metadata(source);
    let id = object("a.bin");
    metadata
        .insert(
            id.key().unwrap(),
            CacheEntry::new(id.clone(), attrs.generation, attrs.size),
        )
        .unwrap();

    let job = registry
        .attach_job(&id, &attrs, dir.path().join("bucket/a.bin"))
        .unwrap();
    job.download(1024, true).await;
    wait_until(|| job.status().state == JobState::Completed).await;

    registry.release_handle(&job);
    assert_eq!(job.status().state, JobState::Completed);
    assert!(registry.get(&object("a.bin")).is_some());
}

#[tokio::test]
async fn test_cancel_all_empties_registry() {
    let source = Arc::new(FaultySource::new());
    let a = source.put("bucket", "a.bin", vec![1u8; 16]);
    let b = source.put("bucket", "b.bin", vec![2u8; 16]);
    let (dir, registry) = registry(source);

    let job_a = registry
        .get_or_create_job(&object("a.bin"), &a, dir.path().join("bucket/a.bin"))
        .unwrap();
    let job_b = registry
        .get_or_create_job(&object("b.bin"), &b, dir.path().join("bucket/b.bin"))
        .unwrap();
    registry.cancel_all();

    assert!(registry.is_empty());
    assert_eq!(job_a.status().state, JobState::Cancelled);
    assert_eq!(job_b.status().state, JobState::Cancelled);
}
