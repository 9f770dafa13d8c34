//! Content transport: moving payload bytes referenced by [`ContentReference`].
//!
//! Messages only carry references; the bytes live in a file tree, an object
//! store, or a remote document store. Each backend implements
//! [`ContentTransport`], and [`DelegatingTransport`] routes a reference to the
//! first backend that claims it.

pub mod availability;
pub mod delegating;
pub mod file;
pub mod object;
pub mod remote;

use std::path::PathBuf;
use std::pin::Pin;

use async_trait::async_trait;
use bytes::Bytes;
use courier_core::ContentReference;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_util::sync::CancellationToken;

pub use availability::wait_until_available;
pub use delegating::DelegatingTransport;
pub use file::FileTransport;
pub use object::{
    normalize_uri, HttpObjectStore, MemoryObjectStore, ObjectLocation, ObjectStorageTransport,
    ObjectStore,
};
pub use remote::RemoteStoreTransport;

use crate::error::{ContentIoError, UnsupportedOperation};

/// Byte stream returned by [`ContentTransport::read`].
pub type ContentReader = Pin<Box<dyn AsyncRead + Send>>;

/// Whether a read waits for content to reach its expected size.
#[derive(Debug, Clone, Default)]
pub enum WaitPolicy {
    /// Read whatever is there now.
    #[default]
    Immediate,
    /// Poll until the reference's `size` is reached or the token is cancelled.
    UntilAvailable(CancellationToken),
}

impl WaitPolicy {
    /// Waits until available with a token nobody cancels.
    #[must_use]
    pub fn until_available() -> Self {
        Self::UntilAvailable(CancellationToken::new())
    }

    /// Returns `true` if reads wait for content to appear.
    #[must_use]
    pub fn waits(&self) -> bool {
        matches!(self, Self::UntilAvailable(_))
    }

    /// The cancel token, if waiting.
    #[must_use]
    pub fn token(&self) -> Option<&CancellationToken> {
        match self {
            Self::Immediate => None,
            Self::UntilAvailable(token) => Some(token),
        }
    }
}

/// Storage backend for content references.
#[async_trait]
pub trait ContentTransport: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    /// Whether this backend understands `reference`'s URI.
    fn is_supported(&self, reference: &ContentReference) -> bool;

    async fn exists(&self, reference: &ContentReference) -> Result<bool, ContentIoError>;

    /// Current size in bytes, or `None` if the content does not exist yet.
    async fn size(&self, reference: &ContentReference) -> Result<Option<u64>, ContentIoError>;

    /// Allocates a new, empty piece of content owned by this backend.
    async fn create(&self, name: &str, media_type: &str)
        -> Result<ContentReference, ContentIoError>;

    async fn read(
        &self,
        reference: &ContentReference,
        wait: &WaitPolicy,
    ) -> Result<ContentReader, ContentIoError>;

    /// Replaces the content behind `reference` and returns the bytes written.
    async fn write(
        &self,
        reader: ContentReader,
        reference: &ContentReference,
    ) -> Result<u64, ContentIoError>;

    /// Removes the content. Deleting missing content succeeds.
    async fn delete(&self, reference: &ContentReference) -> Result<(), ContentIoError>;

    /// Whether the backend is reachable right now.
    async fn is_available(&self) -> bool;

    /// A local filesystem path for `reference`, for tools that need a file.
    ///
    /// # Errors
    ///
    /// Backends without local files return [`UnsupportedOperation`].
    fn local_path(&self, reference: &ContentReference) -> Result<PathBuf, ContentIoError> {
        let _ = reference;
        Err(UnsupportedOperation {
            operation: "local_path",
            backend: self.name(),
        }
        .into())
    }
}

/// Wraps in-memory bytes as a [`ContentReader`].
#[must_use]
pub fn reader_from_bytes(bytes: impl Into<Bytes>) -> ContentReader {
    Box::pin(std::io::Cursor::new(bytes.into()))
}

/// Drains a reader into memory.
///
/// # Errors
///
/// Returns [`ContentIoError::Io`] tagged with `uri` if the read fails.
pub async fn read_to_bytes(mut reader: ContentReader, uri: &str) -> Result<Bytes, ContentIoError> {
    let mut buf = Vec::new();
    reader
        .read_to_end(&mut buf)
        .await
        .map_err(|e| ContentIoError::io(uri, e))?;
    Ok(Bytes::from(buf))
}
