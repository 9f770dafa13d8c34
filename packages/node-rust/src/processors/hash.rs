//! Digest computation over source content.

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use courier_core::{ContentReference, Request};
use sha2::Digest as _;
use tokio::io::AsyncReadExt;
use tracing::debug;

use crate::dispatch::{ProcessingContext, RequestProcessor};
use crate::error::{ContentIoError, ProcessingError};
use crate::transport::{reader_from_bytes, WaitPolicy};

/// Request option naming the digest algorithm.
pub const ALGORITHM_OPTION: &str = "algorithm";

const CHUNK: usize = 64 * 1024;

/// Supported digests. `sha256` unless the request asks otherwise.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum HashAlgorithm {
    #[default]
    Sha256,
    Sha512,
    Blake3,
}

impl HashAlgorithm {
    /// Option value naming the algorithm.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sha256 => "sha256",
            Self::Sha512 => "sha512",
            Self::Blake3 => "blake3",
        }
    }

    fn hasher(self) -> Hasher {
        match self {
            Self::Sha256 => Hasher::Sha256(sha2::Sha256::new()),
            Self::Sha512 => Hasher::Sha512(sha2::Sha512::new()),
            Self::Blake3 => Hasher::Blake3(Box::new(blake3::Hasher::new())),
        }
    }
}

impl FromStr for HashAlgorithm {
    type Err = ProcessingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "").as_str() {
            "sha256" => Ok(Self::Sha256),
            "sha512" => Ok(Self::Sha512),
            "blake3" => Ok(Self::Blake3),
            other => Err(ProcessingError::InvalidRequest(format!(
                "unknown hash algorithm `{other}`"
            ))),
        }
    }
}

impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

enum Hasher {
    Sha256(sha2::Sha256),
    Sha512(sha2::Sha512),
    Blake3(Box<blake3::Hasher>),
}

impl Hasher {
    fn update(&mut self, data: &[u8]) {
        match self {
            Self::Sha256(h) => h.update(data),
            Self::Sha512(h) => h.update(data),
            Self::Blake3(h) => {
                h.update(data);
            }
        }
    }

    fn finalize_hex(self) -> String {
        match self {
            Self::Sha256(h) => hex::encode(h.finalize()),
            Self::Sha512(h) => hex::encode(h.finalize()),
            Self::Blake3(h) => h.finalize().to_hex().to_string(),
        }
    }
}

/// Hashes each source and writes its hex digest as `text/plain`.
///
/// Digest `i` goes to target `i` when the request names targets, otherwise to
/// content created on the primary backend. Progress is reported by bytes read
/// when sources carry sizes.
#[derive(Debug, Clone, Copy, Default)]
pub struct ContentHashProcessor;

impl ContentHashProcessor {
    /// Creates a processor defaulting to SHA-256.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl RequestProcessor for ContentHashProcessor {
    fn service_type(&self) -> &'static str {
        "content-hash"
    }

    async fn process(
        &self,
        request: &Request,
        ctx: &ProcessingContext,
    ) -> Result<Vec<ContentReference>, ProcessingError> {
        let algorithm = request
            .options
            .get(ALGORITHM_OPTION)
            .map_or(Ok(HashAlgorithm::default()), HashAlgorithm::from_str)?;

        if request.source_refs.is_empty() {
            return Err(ProcessingError::InvalidRequest(
                "request has no sources".to_string(),
            ));
        }
        if let Some(targets) = &request.target_refs {
            if targets.len() != request.source_refs.len() {
                return Err(ProcessingError::InvalidRequest(format!(
                    "{} sources but {} targets",
                    request.source_refs.len(),
                    targets.len()
                )));
            }
        }

        let total: Option<u64> = request.source_refs.iter().map(|r| r.size).sum();
        let mut done = 0u64;
        let mut results = Vec::with_capacity(request.source_refs.len());

        for (index, source) in request.source_refs.iter().enumerate() {
            let wait = WaitPolicy::UntilAvailable(ctx.cancel.child_token());
            let mut reader = ctx.transport.read(source, &wait).await?;
            let mut hasher = algorithm.hasher();
            let mut buf = vec![0u8; CHUNK];

            loop {
                if ctx.cancel.is_cancelled() {
                    return Err(ProcessingError::Failed("cancelled".to_string()));
                }
                let n = reader
                    .read(&mut buf)
                    .await
                    .map_err(|e| ContentIoError::io(&source.uri, e))?;
                if n == 0 {
                    break;
                }
                hasher.update(&buf[..n]);
                done += n as u64;
                if let Some(total) = total.filter(|t| *t > 0) {
                    #[allow(clippy::cast_precision_loss)]
                    let fraction = done as f32 / total as f32;
                    ctx.report_progress(fraction).await;
                }
            }

            let digest = hasher.finalize_hex();
            debug!(uri = %source.uri, %algorithm, %digest, "hashed source");

            let target = match request.target_refs.as_ref().and_then(|t| t.get(index)) {
                Some(target) => target.clone(),
                None => {
                    let name = format!("{}.{}", file_name(&source.uri), algorithm);
                    ctx.transport.create(&name, "text/plain").await?
                }
            };
            let written = ctx
                .transport
                .write(reader_from_bytes(digest.into_bytes()), &target)
                .await?;
            results.push(target.with_size(written));
        }

        Ok(results)
    }
}

/// Last path segment of a URI, for naming derived content.
fn file_name(uri: &str) -> &str {
    let path = uri.split(['?', '#']).next().unwrap_or(uri);
    path.rsplit('/')
        .find(|segment| !segment.is_empty())
        .unwrap_or("content")
}
