// Cache counters: read hits and misses, eviction and invalidation churn, job outcomes.

use std::sync::atomic::{AtomicU64, Ordering};

/// How a download job left the `Downloading` state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Completed,
    Failed,
    Cancelled,
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CacheStats {
    pub downloaded_bytes: u64,
    pub served_bytes: u64,
    /// Reads whose whole range was already confirmed on disk.
    pub read_hits: u64,
    /// Reads that had to start or wait for a download.
    pub read_misses: u64,
    pub evictions: u64,
    pub invalidations: u64,
    pub running_jobs: u64,
    pub completed_jobs: u64,
    pub failed_jobs: u64,
    pub cancelled_jobs: u64,
}

impl CacheStats {
    pub fn hit_ratio(&self) -> f64 {
        let reads = self.read_hits + self.read_misses;
        if reads == 0 {
            return 0.0;
        }
        self.read_hits as f64 / reads as f64
    }
}

#[derive(Debug, Default)]
pub struct StatsCollector {
    downloaded_bytes: AtomicU64,
    served_bytes: AtomicU64,
    read_hits: AtomicU64,
    read_misses: AtomicU64,
    evictions: AtomicU64,
    invalidations: AtomicU64,
    running_jobs: AtomicU64,
    completed_jobs: AtomicU64,
    failed_jobs: AtomicU64,
    cancelled_jobs: AtomicU64,
}

fn bump(counter: &AtomicU64, by: u64) {
    counter.fetch_add(by, Ordering::Relaxed);
}

impl StatsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_downloaded(&self, bytes: u64) {
        bump(&self.downloaded_bytes, bytes);
    }

    /// Count one read and the bytes it returned. `hit` means no download was needed.
    pub fn record_read(&self, hit: bool, served: u64) {
        bump(if hit { &self.read_hits } else { &self.read_misses }, 1);
        bump(&self.served_bytes, served);
    }

    /// A read that failed before serving anything still counts as a miss.
    pub fn record_miss(&self) {
        bump(&self.read_misses, 1);
    }

    pub fn record_eviction(&self) {
        bump(&self.evictions, 1);
    }

    pub fn record_invalidation(&self) {
        bump(&self.invalidations, 1);
    }

    pub fn task_started(&self) {
        bump(&self.running_jobs, 1);
    }

    pub fn task_exited(&self) {
        self.running_jobs.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn job_ended(&self, outcome: JobOutcome) {
        let counter = match outcome {
            JobOutcome::Completed => &self.completed_jobs,
            JobOutcome::Failed => &self.failed_jobs,
            JobOutcome::Cancelled => &self.cancelled_jobs,
        };
        bump(counter, 1);
    }

    pub fn snapshot(&self) -> CacheStats {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        CacheStats {
            downloaded_bytes: load(&self.downloaded_bytes),
            served_bytes: load(&self.served_bytes),
            read_hits: load(&self.read_hits),
            read_misses: load(&self.read_misses),
            evictions: load(&self.evictions),
            invalidations: load(&self.invalidations),
            running_jobs: load(&self.running_jobs),
            completed_jobs: load(&self.completed_jobs),
            failed_jobs: load(&self.failed_jobs),
            cancelled_jobs: load(&self.cancelled_jobs),
        }
    }
}
