// HTTP object source: stats objects with HEAD and streams generation-pinned byte ranges.

use std::collections::HashMap;
use std::io;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use futures::TryStreamExt;
use parking_lot::RwLock;
use reqwest::header::{HeaderMap, ACCEPT_ENCODING, CONTENT_ENCODING, CONTENT_LENGTH, RANGE};
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode, Url};
use tokio_util::io::StreamReader;
use tracing::{debug, warn};

use super::traits::{ObjectAttrs, ObjectReader, ObjectSource, RangeRequest};
use crate::engine::entry::ObjectIdentity;

/// Response header carrying the object generation.
pub const GENERATION_HEADER: &str = "x-goog-generation";

/// Object store reached over HTTP at `{base}/{bucket}/{object}`.
///
/// `HEAD` answers with the generation header and content length; `GET` honours `Range` and a
/// `generation` query parameter pinning the read to one generation.
pub struct HttpObjectSource {
    client: Client,
    base_url: Arc<RwLock<String>>,
    headers: Arc<RwLock<HashMap<String, String>>>,
}

impl HttpObjectSource {
    pub fn new(base_url: String, headers: HashMap<String, String>) -> Self {
        Self::with_client(Client::new(), base_url, headers)
    }

    pub fn with_client(client: Client, base_url: String, headers: HashMap<String, String>) -> Self {
        Self {
            client,
            base_url: Arc::new(RwLock::new(base_url)),
            headers: Arc::new(RwLock::new(headers)),
        }
    }

    /// Update the endpoint and headers (e.g. after token refresh).
    pub fn update_auth(&self, new_url: String, new_headers: HashMap<String, String>) {
        if !new_url.trim().is_empty() {
            *self.base_url.write() = new_url;
        }
        if !new_headers.is_empty() {
            *self.headers.write() = new_headers;
        }
    }

    fn object_url(&self, object: &ObjectIdentity) -> Result<Url> {
        let base = self.base_url.read().clone();
        let mut url = Url::parse(&base).map_err(|e| anyhow!("invalid source url: {}", e))?;
        url.path_segments_mut()
            .map_err(|_| anyhow!("source url cannot be a base: {}", base))?
            .pop_if_empty()
            .push(&object.bucket)
            .extend(object.object.split('/'));
        Ok(url)
    }

    fn build_request(&self, method: Method, url: Url) -> RequestBuilder {
        let headers = self.headers.read().clone();
        let mut req = self.client.request(method, url);
        for (k, v) in &headers {
            req = req.header(k.as_str(), v.as_str());
        }
        req
    }
}

fn check_status(resp: &Response, what: &str, object: &ObjectIdentity) -> Result<()> {
    let status = resp.status();
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN | StatusCode::PRECONDITION_FAILED => {
            warn!("{} {} auth rejected status={}", what, object, status.as_u16());
            Err(anyhow!("auth_rejected: HTTP {}", status.as_u16()))
        }
        StatusCode::NOT_FOUND => Err(anyhow!("object not found: {}", object)),
        s if !s.is_success() => {
            warn!("{} {} failed status={}", what, object, status.as_u16());
            Err(anyhow!("{} failed: HTTP {}", what, status.as_u16()))
        }
        _ => Ok(()),
    }
}

fn parse_header<T: std::str::FromStr>(headers: &HeaderMap, name: &str) -> Option<T> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<T>().ok())
}

#[async_trait]
impl ObjectSource for HttpObjectSource {
    async fn stat(&self, object: &ObjectIdentity) -> Result<ObjectAttrs> {
        let url = self.object_url(object)?;
        // Ask for the stored representation so the length matches what range reads return.
        let resp = self
            .build_request(Method::HEAD, url)
            .header(ACCEPT_ENCODING, "gzip")
            .send()
            .await?;
        debug!("http stat {} status={}", object, resp.status().as_u16());
        check_status(&resp, "stat", object)?;

        let headers = resp.headers();
        let generation = parse_header::<i64>(headers, GENERATION_HEADER)
            .ok_or_else(|| anyhow!("missing {} header for {}", GENERATION_HEADER, object))?;
        let size = parse_header::<u64>(headers, CONTENT_LENGTH.as_str())
            .ok_or_else(|| anyhow!("missing content-length for {}", object))?;
        let gzip_encoded = headers
            .get(CONTENT_ENCODING)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.eq_ignore_ascii_case("gzip"))
            .unwrap_or(false);

        Ok(ObjectAttrs {
            generation,
            size,
            gzip_encoded,
        })
    }

    async fn open_range_reader(&self, request: RangeRequest) -> Result<ObjectReader> {
        let RangeRequest {
            object,
            generation,
            range,
            read_compressed,
        } = request;
        if range.start >= range.end {
            return Ok(Box::new(tokio::io::empty()));
        }

        let mut url = self.object_url(&object)?;
        url.query_pairs_mut()
            .append_pair("generation", &generation.to_string());
        let range_header = format!("bytes={}-{}", range.start, range.end - 1);
        let encoding = if read_compressed { "gzip" } else { "identity" };

        let resp = self
            .build_request(Method::GET, url)
            .header(RANGE, &range_header)
            .header(ACCEPT_ENCODING, encoding)
            .send()
            .await?;
        debug!(
            "http range read {} {} status={}",
            object,
            range_header,
            resp.status().as_u16()
        );
        check_status(&resp, "range read", &object)?;
        if resp.status() != StatusCode::PARTIAL_CONTENT && range.start > 0 {
            return Err(anyhow!(
                "range read of {} ignored {}: HTTP {}",
                object,
                range_header,
                resp.status().as_u16()
            ));
        }

        let stream = resp.bytes_stream().map_err(io::Error::other);
        Ok(Box::new(StreamReader::new(Box::pin(stream))))
    }
}
