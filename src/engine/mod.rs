// Cache engine: metadata LRU, per-object download jobs, job registry and the read path.

pub mod entry;
pub mod handle;
pub mod handler;
pub mod job;
pub mod local_file;
pub mod lru;
pub mod registry;
pub mod stats;
