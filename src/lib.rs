// Local-disk read cache for objects served through a FUSE view of an object store.

pub mod config;
pub mod engine;
pub mod error;
pub mod logging;
pub mod source;

pub use config::CacheConfig;
pub use engine::entry::{CacheEntry, CacheKey, ObjectIdentity};
pub use engine::handle::CacheHandle;
pub use engine::handler::CacheHandler;
pub use engine::job::{DownloadJob, JobState, JobStatus};
pub use engine::lru::{CacheCapacity, MetadataCache};
pub use engine::registry::JobRegistry;
pub use error::{CacheError, Result};
pub use source::traits::{ObjectAttrs, ObjectSource};
