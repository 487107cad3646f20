// Object identity, cache keys and the per-object metadata record.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::{CacheError, Result};

/// Identifies a cacheable remote object.
///
/// The bucket creation time distinguishes buckets whose names were reused after deletion.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObjectIdentity {
    pub bucket: String,
    pub bucket_created: SystemTime,
    pub object: String,
}

impl ObjectIdentity {
    pub fn new(
        bucket: impl Into<String>,
        bucket_created: SystemTime,
        object: impl Into<String>,
    ) -> Self {
        Self {
            bucket: bucket.into(),
            bucket_created,
            object: object.into(),
        }
    }

    /// Build the metadata cache key for this object.
    ///
    /// The bucket name is length-prefixed and the creation time is encoded in nanoseconds, so
    /// distinct (bucket, creation time, object) triples never produce the same key.
    pub fn key(&self) -> Result<CacheKey> {
        if self.bucket.is_empty() || self.object.is_empty() {
            return Err(CacheError::InvalidKey(format!(
                "bucket {:?} and object {:?} must both be non-empty",
                self.bucket, self.object
            )));
        }
        let created = match self.bucket_created.duration_since(UNIX_EPOCH) {
            Ok(d) => d.as_nanos() as i128,
            Err(e) => -(e.duration().as_nanos() as i128),
        };
        Ok(CacheKey(format!(
            "{}:{}{}:{}",
            self.bucket.len(),
            self.bucket,
            created,
            self.object
        )))
    }

    /// Generation-independent path used to key download jobs.
    pub fn object_path(&self) -> String {
        format!("{}/{}", self.bucket, self.object)
    }
}

impl fmt::Display for ObjectIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.bucket, self.object)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// What the cache knows about one object's local copy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub identity: ObjectIdentity,
    pub generation: i64,
    /// Bytes confirmed written to the local cache file. Never exceeds `size`.
    pub downloaded_offset: u64,
    pub size: u64,
}

impl CacheEntry {
    pub fn new(identity: ObjectIdentity, generation: i64, size: u64) -> Self {
        Self {
            identity,
            generation,
            downloaded_offset: 0,
            size,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.downloaded_offset >= self.size
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::time::Duration;

    use super::*;

    fn at(secs: u64) -> SystemTime {
        UNIX_EPOCH + Duration::from_secs(secs)
    }

    #[test]
    fn test_key_is_deterministic() {
        let id = ObjectIdentity::new("bucket", at(1654041600), "dir/file.bin");
        assert_eq!(id.key().unwrap(), id.clone().key().unwrap());
    }

    #[test]
    fn test_empty_names_rejected() {
        let no_bucket = ObjectIdentity::new("", at(1), "obj");
        let no_object = ObjectIdentity::new("bucket", at(1), "");
        assert!(matches!(no_bucket.key(), Err(CacheError::InvalidKey(_))));
        assert!(matches!(no_object.key(), Err(CacheError::InvalidKey(_))));
    }

    #[test]
    fn test_key_does_not_collide_on_concatenation() {
        // Naive concatenation would map all of these to the same string.
        let ids = [
            ObjectIdentity::new("a", at(1), "2b"),
            ObjectIdentity::new("a1", at(2), "b"),
            ObjectIdentity::new("a", at(12), "b"),
            ObjectIdentity::new("a", at(1), "2b:"),
        ];
        let keys: HashSet<_> = ids.iter().map(|id| id.key().unwrap()).collect();
        assert_eq!(keys.len(), ids.len());
    }

    #[test]
    fn test_key_distinguishes_recreated_bucket() {
        let old = ObjectIdentity::new("bucket", at(100), "obj");
        let new = ObjectIdentity::new("bucket", at(100) + Duration::from_millis(1), "obj");
        assert_ne!(old.key().unwrap(), new.key().unwrap());
        assert_eq!(old.object_path(), new.object_path());
    }
}
