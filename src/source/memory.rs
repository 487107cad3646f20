// In-memory object store: generation-versioned objects served through bounded range readers.

use std::collections::HashMap;
use std::io::Cursor;
use std::sync::atomic::{AtomicI64, Ordering};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;

use super::traits::{ObjectAttrs, ObjectReader, ObjectSource, RangeRequest};
use crate::engine::entry::ObjectIdentity;

struct StoredObject {
    generation: i64,
    data: Bytes,
    gzip_encoded: bool,
}

/// Object store kept entirely in memory. Every `put` assigns a fresh generation.
pub struct MemorySource {
    objects: RwLock<HashMap<String, StoredObject>>,
    next_generation: AtomicI64,
}

impl MemorySource {
    pub fn new() -> Self {
        Self {
            objects: RwLock::new(HashMap::new()),
            next_generation: AtomicI64::new(1),
        }
    }

    /// Store `data` as a new generation of `bucket/object` and return its attributes.
    pub fn put(&self, bucket: &str, object: &str, data: impl Into<Bytes>) -> ObjectAttrs {
        self.put_with_encoding(bucket, object, data, false)
    }

    pub fn put_with_encoding(
        &self,
        bucket: &str,
        object: &str,
        data: impl Into<Bytes>,
        gzip_encoded: bool,
    ) -> ObjectAttrs {
        let data = data.into();
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let attrs = ObjectAttrs {
            generation,
            size: data.len() as u64,
            gzip_encoded,
        };
        self.objects.write().insert(
            format!("{}/{}", bucket, object),
            StoredObject {
                generation,
                data,
                gzip_encoded,
            },
        );
        attrs
    }

    pub fn delete(&self, bucket: &str, object: &str) {
        self.objects.write().remove(&format!("{}/{}", bucket, object));
    }

    fn attrs_of(&self, object: &ObjectIdentity) -> Result<ObjectAttrs> {
        let objects = self.objects.read();
        let stored = objects
            .get(&object.object_path())
            .ok_or_else(|| anyhow!("object not found: {}", object))?;
        Ok(ObjectAttrs {
            generation: stored.generation,
            size: stored.data.len() as u64,
            gzip_encoded: stored.gzip_encoded,
        })
    }
}

impl Default for MemorySource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ObjectSource for MemorySource {
    async fn stat(&self, object: &ObjectIdentity) -> Result<ObjectAttrs> {
        self.attrs_of(object)
    }

    async fn open_range_reader(&self, request: RangeRequest) -> Result<ObjectReader> {
        let objects = self.objects.read();
        let stored = objects
            .get(&request.object.object_path())
            .ok_or_else(|| anyhow!("object not found: {}", request.object))?;
        if stored.generation != request.generation {
            return Err(anyhow!(
                "object not found: {} generation {}",
                request.object,
                request.generation
            ));
        }
        let size = stored.data.len() as u64;
        let start = request.range.start.min(size) as usize;
        let end = request.range.end.min(size).max(start as u64) as usize;
        Ok(Box::new(Cursor::new(stored.data.slice(start..end))))
    }
}
