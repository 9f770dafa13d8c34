//! Object-storage backend for `s3://bucket/key` references.
//!
//! Amazon virtual-hosted and path-style HTTPS URLs are normalized to
//! `s3://bucket/key` before lookup. The store itself sits behind
//! [`ObjectStore`] so the transport runs against an in-memory map in tests
//! and an S3-compatible HTTP endpoint (MinIO, localstack) in deployment.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use courier_core::ContentReference;
use dashmap::DashMap;
use reqwest::StatusCode;
use tracing::debug;

use super::{
    read_to_bytes, reader_from_bytes, wait_until_available, ContentReader, ContentTransport,
    WaitPolicy,
};
use crate::error::ContentIoError;

const SCHEME: &str = "s3://";
const AWS_SUFFIX: &str = ".amazonaws.com";

// ---------------------------------------------------------------------------
// ObjectLocation / normalize_uri
// ---------------------------------------------------------------------------

/// A bucket and key pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObjectLocation {
    pub bucket: String,
    pub key: String,
}

impl ObjectLocation {
    /// Creates a location from `bucket` and `key`.
    pub fn new(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
        }
    }
}

impl fmt::Display for ObjectLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{SCHEME}{}/{}", self.bucket, self.key)
    }
}

fn invalid(uri: &str, reason: &str) -> ContentIoError {
    ContentIoError::InvalidUri {
        uri: uri.to_string(),
        reason: reason.to_string(),
    }
}

fn split_bucket_key<'a>(uri: &str, path: &'a str) -> Result<(&'a str, &'a str), ContentIoError> {
    let (bucket, key) = path
        .split_once('/')
        .ok_or_else(|| invalid(uri, "missing object key"))?;
    if bucket.is_empty() {
        return Err(invalid(uri, "missing bucket"));
    }
    if key.is_empty() {
        return Err(invalid(uri, "missing object key"));
    }
    Ok((bucket, key))
}

/// Resolves an object URI to its bucket and key.
///
/// Accepted forms:
/// - `s3://bucket/key`
/// - `https://bucket.s3.amazonaws.com/key`, `https://bucket.s3.<region>.amazonaws.com/key`
/// - `https://s3.amazonaws.com/bucket/key`, `https://s3.<region>.amazonaws.com/bucket/key`,
///   `https://s3-<region>.amazonaws.com/bucket/key`
///
/// # Errors
///
/// Returns [`ContentIoError::InvalidUri`] for anything else.
pub fn normalize_uri(uri: &str) -> Result<ObjectLocation, ContentIoError> {
    if let Some(rest) = uri.strip_prefix(SCHEME) {
        let (bucket, key) = split_bucket_key(uri, rest)?;
        return Ok(ObjectLocation::new(bucket, key));
    }

    let rest = uri
        .strip_prefix("https://")
        .or_else(|| uri.strip_prefix("http://"))
        .ok_or_else(|| invalid(uri, "not an object storage uri"))?;
    let rest = rest.split(['?', '#']).next().unwrap_or_default();
    let (authority, path) = rest.split_once('/').unwrap_or((rest, ""));
    let host = authority.split(':').next().unwrap_or_default();
    let Some(prefix) = host.strip_suffix(AWS_SUFFIX) else {
        return Err(invalid(uri, "not an amazonaws.com host"));
    };

    // Path-style: s3.amazonaws.com, s3.<region>.amazonaws.com, s3-<region>.amazonaws.com
    if prefix == "s3" || prefix.starts_with("s3.") || prefix.starts_with("s3-") {
        let (bucket, key) = split_bucket_key(uri, path)?;
        return Ok(ObjectLocation::new(bucket, key));
    }

    // Virtual-hosted: <bucket>.s3[.<region>].amazonaws.com
    let bucket = if let Some(bucket) = prefix.strip_suffix(".s3") {
        bucket
    } else if let Some(idx) = prefix.find(".s3.") {
        &prefix[..idx]
    } else {
        return Err(invalid(uri, "unrecognized S3 host"));
    };
    if bucket.is_empty() {
        return Err(invalid(uri, "missing bucket"));
    }
    if path.is_empty() {
        return Err(invalid(uri, "missing object key"));
    }
    Ok(ObjectLocation::new(bucket, path))
}

// ---------------------------------------------------------------------------
// ObjectStore
// ---------------------------------------------------------------------------

/// Minimal object-store client.
#[async_trait]
pub trait ObjectStore: Send + Sync + 'static {
    /// Object size, or `None` if absent.
    async fn head(&self, location: &ObjectLocation) -> Result<Option<u64>, ContentIoError>;
    /// Object bytes, or `None` if absent.
    async fn get(&self, location: &ObjectLocation) -> Result<Option<Bytes>, ContentIoError>;
    async fn put(
        &self,
        location: &ObjectLocation,
        data: Bytes,
        content_type: &str,
    ) -> Result<(), ContentIoError>;
    /// Removes the object; absent objects are not an error.
    async fn delete(&self, location: &ObjectLocation) -> Result<(), ContentIoError>;
    async fn ping(&self) -> bool;
}

/// Process-local object store.
#[derive(Debug)]
pub struct MemoryObjectStore {
    objects: DashMap<ObjectLocation, Bytes>,
    reachable: AtomicBool,
}

impl MemoryObjectStore {
    /// Creates an empty, reachable store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            objects: DashMap::new(),
            reachable: AtomicBool::new(true),
        }
    }

    /// Simulates the store going up or down.
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Number of stored objects.
    #[must_use]
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    /// Returns `true` if no objects are stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}

impl Default for MemoryObjectStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn head(&self, location: &ObjectLocation) -> Result<Option<u64>, ContentIoError> {
        Ok(self.objects.get(location).map(|data| data.len() as u64))
    }

    async fn get(&self, location: &ObjectLocation) -> Result<Option<Bytes>, ContentIoError> {
        Ok(self.objects.get(location).map(|data| data.clone()))
    }

    async fn put(
        &self,
        location: &ObjectLocation,
        data: Bytes,
        _content_type: &str,
    ) -> Result<(), ContentIoError> {
        self.objects.insert(location.clone(), data);
        Ok(())
    }

    async fn delete(&self, location: &ObjectLocation) -> Result<(), ContentIoError> {
        self.objects.remove(location);
        Ok(())
    }

    async fn ping(&self) -> bool {
        self.reachable.load(Ordering::SeqCst)
    }
}

/// Path-style HTTP client for S3-compatible endpoints: `{endpoint}/{bucket}/{key}`.
///
/// Requests are unsigned; the endpoint must allow anonymous access or sit
/// behind a signing proxy.
#[derive(Debug, Clone)]
pub struct HttpObjectStore {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpObjectStore {
    /// Creates a client for the S3-compatible `endpoint`, using path-style URLs.
    pub fn new(client: reqwest::Client, endpoint: impl Into<String>) -> Self {
        let endpoint: String = endpoint.into();
        Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
        }
    }

    fn url(&self, location: &ObjectLocation) -> String {
        format!("{}/{}/{}", self.endpoint, location.bucket, location.key)
    }
}

fn client_error(location: &ObjectLocation, source: reqwest::Error) -> ContentIoError {
    ContentIoError::Client {
        uri: location.to_string(),
        source,
    }
}

fn status_error(location: &ObjectLocation, status: StatusCode) -> ContentIoError {
    ContentIoError::Http {
        uri: location.to_string(),
        status: status.as_u16(),
    }
}

/// Reads `Content-Length` from the headers; `reqwest` reports 0 for HEAD bodies.
pub(crate) fn header_length(response: &reqwest::Response) -> Option<u64> {
    response
        .headers()
        .get(reqwest::header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
}

#[async_trait]
impl ObjectStore for HttpObjectStore {
    async fn head(&self, location: &ObjectLocation) -> Result<Option<u64>, ContentIoError> {
        let response = self
            .client
            .head(self.url(location))
            .send()
            .await
            .map_err(|e| client_error(location, e))?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            s if s.is_success() => Ok(Some(header_length(&response).unwrap_or(0))),
            s => Err(status_error(location, s)),
        }
    }

    async fn get(&self, location: &ObjectLocation) -> Result<Option<Bytes>, ContentIoError> {
        let response = self
            .client
            .get(self.url(location))
            .send()
            .await
            .map_err(|e| client_error(location, e))?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            s if s.is_success() => response
                .bytes()
                .await
                .map(Some)
                .map_err(|e| client_error(location, e)),
            s => Err(status_error(location, s)),
        }
    }

    async fn put(
        &self,
        location: &ObjectLocation,
        data: Bytes,
        content_type: &str,
    ) -> Result<(), ContentIoError> {
        let response = self
            .client
            .put(self.url(location))
            .header(reqwest::header::CONTENT_TYPE, content_type)
            .body(data)
            .send()
            .await
            .map_err(|e| client_error(location, e))?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(status_error(location, response.status()))
        }
    }

    async fn delete(&self, location: &ObjectLocation) -> Result<(), ContentIoError> {
        let response = self
            .client
            .delete(self.url(location))
            .send()
            .await
            .map_err(|e| client_error(location, e))?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(()),
            s if s.is_success() => Ok(()),
            s => Err(status_error(location, s)),
        }
    }

    async fn ping(&self) -> bool {
        match self.client.head(&self.endpoint).send().await {
            Ok(response) => !response.status().is_server_error(),
            Err(err) => {
                debug!(endpoint = %self.endpoint, error = %err, "object store unreachable");
                false
            }
        }
    }
}

// ---------------------------------------------------------------------------
// ObjectStorageTransport
// ---------------------------------------------------------------------------

/// [`ContentTransport`] over an [`ObjectStore`].
#[derive(Clone)]
pub struct ObjectStorageTransport {
    store: Arc<dyn ObjectStore>,
    bucket: String,
    poll_interval: Duration,
}

impl ObjectStorageTransport {
    /// `bucket` receives content allocated through `create`.
    pub fn new(store: Arc<dyn ObjectStore>, bucket: impl Into<String>, poll_interval: Duration) -> Self {
        Self {
            store,
            bucket: bucket.into(),
            poll_interval,
        }
    }
}

impl fmt::Debug for ObjectStorageTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectStorageTransport")
            .field("bucket", &self.bucket)
            .field("poll_interval", &self.poll_interval)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl ContentTransport for ObjectStorageTransport {
    fn name(&self) -> &'static str {
        "object-storage"
    }

    fn is_supported(&self, reference: &ContentReference) -> bool {
        normalize_uri(&reference.uri).is_ok()
    }

    async fn exists(&self, reference: &ContentReference) -> Result<bool, ContentIoError> {
        Ok(self.size(reference).await?.is_some())
    }

    async fn size(&self, reference: &ContentReference) -> Result<Option<u64>, ContentIoError> {
        let location = normalize_uri(&reference.uri)?;
        self.store.head(&location).await
    }

    async fn create(
        &self,
        name: &str,
        media_type: &str,
    ) -> Result<ContentReference, ContentIoError> {
        let location = ObjectLocation::new(
            self.bucket.clone(),
            format!("{}/{}", uuid::Uuid::new_v4(), name.trim_start_matches('/')),
        );
        self.store.put(&location, Bytes::new(), media_type).await?;
        Ok(ContentReference::new(location.to_string(), media_type))
    }

    async fn read(
        &self,
        reference: &ContentReference,
        wait: &WaitPolicy,
    ) -> Result<ContentReader, ContentIoError> {
        let location = normalize_uri(&reference.uri)?;
        wait_until_available(self, reference, wait, self.poll_interval).await?;
        let data = self
            .store
            .get(&location)
            .await?
            .ok_or_else(|| ContentIoError::NotFound {
                uri: reference.uri.clone(),
            })?;
        Ok(reader_from_bytes(data))
    }

    async fn write(
        &self,
        reader: ContentReader,
        reference: &ContentReference,
    ) -> Result<u64, ContentIoError> {
        let location = normalize_uri(&reference.uri)?;
        let data = read_to_bytes(reader, &reference.uri).await?;
        let written = data.len() as u64;
        self.store.put(&location, data, &reference.media_type).await?;
        Ok(written)
    }

    async fn delete(&self, reference: &ContentReference) -> Result<(), ContentIoError> {
        let location = normalize_uri(&reference.uri)?;
        self.store.delete(&location).await
    }

    async fn is_available(&self) -> bool {
        self.store.ping().await
    }
}
