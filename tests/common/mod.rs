// Shared test source: wraps `MemorySource` with knobs for gating, throttling and breaking
// range readers so tests can control the timing of a download.
#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use bytes::Bytes;
use objcache::engine::entry::ObjectIdentity;
use objcache::source::memory::MemorySource;
use objcache::source::traits::{ObjectAttrs, ObjectReader, ObjectSource, RangeRequest};
use parking_lot::RwLock;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::Semaphore;

#[derive(Default)]
pub struct FaultySource {
    inner: MemorySource,
    readers_opened: AtomicUsize,
    compressed_reads: AtomicUsize,
    open_gate: RwLock<Option<Arc<Semaphore>>>,
    throttle: RwLock<Option<(usize, Duration)>>,
    fail_opens: AtomicBool,
    truncate_streams: AtomicBool,
}

impl FaultySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, bucket: &str, object: &str, data: impl Into<Bytes>) -> ObjectAttrs {
        self.inner.put(bucket, object, data)
    }

    pub fn put_with_encoding(
        &self,
        bucket: &str,
        object: &str,
        data: impl Into<Bytes>,
        gzip_encoded: bool,
    ) -> ObjectAttrs {
        self.inner.put_with_encoding(bucket, object, data, gzip_encoded)
    }

    pub fn delete(&self, bucket: &str, object: &str) {
        self.inner.delete(bucket, object);
    }

    /// Number of range readers handed out so far.
    pub fn readers_opened(&self) -> usize {
        self.readers_opened.load(Ordering::Relaxed)
    }

    pub fn compressed_reads(&self) -> usize {
        self.compressed_reads.load(Ordering::Relaxed)
    }

    /// Require a permit from the returned semaphore for every reader opened from now on.
    pub fn gate_opens(&self, permits: usize) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(permits));
        *self.open_gate.write() = Some(gate.clone());
        gate
    }

    /// Stream reader contents `piece` bytes at a time with `delay` between pieces.
    pub fn throttle(&self, piece: usize, delay: Duration) {
        *self.throttle.write() = Some((piece.max(1), delay));
    }

    pub fn fail_opens(&self, fail: bool) {
        self.fail_opens.store(fail, Ordering::Relaxed);
    }

    /// Make every reader end one byte before the end of its range.
    pub fn truncate_streams(&self, truncate: bool) {
        self.truncate_streams.store(truncate, Ordering::Relaxed);
    }
}

#[async_trait]
impl ObjectSource for FaultySource {
    async fn stat(&self, object: &ObjectIdentity) -> Result<ObjectAttrs> {
        self.inner.stat(object).await
    }

    async fn open_range_reader(&self, mut request: RangeRequest) -> Result<ObjectReader> {
        let gate = self.open_gate.read().clone();
        if let Some(gate) = gate {
            gate.acquire().await?.forget();
        }
        self.readers_opened.fetch_add(1, Ordering::Relaxed);
        if request.read_compressed {
            self.compressed_reads.fetch_add(1, Ordering::Relaxed);
        }
        if self.fail_opens.load(Ordering::Relaxed) {
            return Err(anyhow!("injected failure opening {}", request.object));
        }
        if self.truncate_streams.load(Ordering::Relaxed) && request.range.end > request.range.start
        {
            request.range.end -= 1;
        }

        let mut inner = self.inner.open_range_reader(request).await?;
        let throttle = *self.throttle.read();
        let Some((piece, delay)) = throttle else {
            return Ok(inner);
        };
        let (mut writer, reader) = tokio::io::duplex(piece);
        tokio::spawn(async move {
            let mut buf = vec![0u8; piece];
            loop {
                let n = match inner.read(&mut buf).await {
                    Ok(0) | Err(_) => return,
                    Ok(n) => n,
                };
                if writer.write_all(&buf[..n]).await.is_err() {
                    // Reader dropped.
                    return;
                }
                tokio::time::sleep(delay).await;
            }
        });
        Ok(Box::new(reader))
    }
}

pub async fn wait_until(mut cond: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(10), async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}
