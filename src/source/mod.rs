// Remote object sources: the store the cache downloads from.

pub mod http_source;
pub mod memory;
pub mod traits;
