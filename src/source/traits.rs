use std::ops::Range;

use anyhow::Result;
use async_trait::async_trait;
use tokio::io::AsyncRead;

use crate::engine::entry::ObjectIdentity;

/// Remote attributes of an object at the time it was stat'ed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectAttrs {
    pub generation: i64,
    pub size: u64,
    /// Stored with gzip content encoding; such objects are fetched without decompression.
    pub gzip_encoded: bool,
}

/// A bounded streaming read of one object generation.
#[derive(Debug, Clone)]
pub struct RangeRequest {
    pub object: ObjectIdentity,
    pub generation: i64,
    pub range: Range<u64>,
    pub read_compressed: bool,
}

pub type ObjectReader = Box<dyn AsyncRead + Send + Unpin>;

#[async_trait]
pub trait ObjectSource: Send + Sync {
    async fn stat(&self, object: &ObjectIdentity) -> Result<ObjectAttrs>;
    async fn open_range_reader(&self, request: RangeRequest) -> Result<ObjectReader>;
}
