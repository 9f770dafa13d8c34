//! `file://` backend rooted in a local directory.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use courier_core::ContentReference;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use super::{wait_until_available, ContentReader, ContentTransport, WaitPolicy};
use crate::error::ContentIoError;

const SCHEME: &str = "file://";

/// Reads and writes absolute `file://` URIs; creates new content under `root`.
#[derive(Debug, Clone)]
pub struct FileTransport {
    root: PathBuf,
    poll_interval: Duration,
}

impl FileTransport {
    /// Creates a transport creating content under `root`.
    pub fn new(root: impl Into<PathBuf>, poll_interval: Duration) -> Self {
        Self {
            root: root.into(),
            poll_interval,
        }
    }

    /// Directory created content goes into.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The `file://` URI for an absolute path.
    #[must_use]
    pub fn uri_for(path: &Path) -> String {
        format!("{SCHEME}{}", path.display())
    }

    fn path_of(reference: &ContentReference) -> Result<PathBuf, ContentIoError> {
        let rest = reference
            .uri
            .strip_prefix(SCHEME)
            .ok_or_else(|| ContentIoError::Unsupported {
                uri: reference.uri.clone(),
            })?;
        let rest = rest.strip_prefix("localhost").unwrap_or(rest);
        if !rest.starts_with('/') {
            return Err(ContentIoError::InvalidUri {
                uri: reference.uri.clone(),
                reason: "file uri must carry an absolute path".to_string(),
            });
        }
        Ok(PathBuf::from(rest))
    }
}

/// Keeps only characters that are safe in a file name.
fn sanitize(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let cleaned = cleaned.trim_start_matches('.');
    if cleaned.is_empty() {
        "content".to_string()
    } else {
        cleaned.to_string()
    }
}

#[async_trait]
impl ContentTransport for FileTransport {
    fn name(&self) -> &'static str {
        "file"
    }

    fn is_supported(&self, reference: &ContentReference) -> bool {
        reference.uri.starts_with(SCHEME)
    }

    async fn exists(&self, reference: &ContentReference) -> Result<bool, ContentIoError> {
        let path = Self::path_of(reference)?;
        tokio::fs::try_exists(&path)
            .await
            .map_err(|e| ContentIoError::io(&reference.uri, e))
    }

    async fn size(&self, reference: &ContentReference) -> Result<Option<u64>, ContentIoError> {
        let path = Self::path_of(reference)?;
        match tokio::fs::metadata(&path).await {
            Ok(meta) => Ok(Some(meta.len())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(ContentIoError::io(&reference.uri, e)),
        }
    }

    async fn create(
        &self,
        name: &str,
        media_type: &str,
    ) -> Result<ContentReference, ContentIoError> {
        let root_uri = Self::uri_for(&self.root);
        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(|e| ContentIoError::io(&root_uri, e))?;
        let path = self
            .root
            .join(format!("{}-{}", uuid::Uuid::new_v4(), sanitize(name)));
        let uri = Self::uri_for(&path);
        tokio::fs::File::create(&path)
            .await
            .map_err(|e| ContentIoError::io(&uri, e))?;
        debug!(%uri, "created file content");
        Ok(ContentReference::new(uri, media_type))
    }

    async fn read(
        &self,
        reference: &ContentReference,
        wait: &WaitPolicy,
    ) -> Result<ContentReader, ContentIoError> {
        let path = Self::path_of(reference)?;
        wait_until_available(self, reference, wait, self.poll_interval).await?;
        let file = tokio::fs::File::open(&path)
            .await
            .map_err(|e| ContentIoError::io(&reference.uri, e))?;
        Ok(Box::pin(file))
    }

    async fn write(
        &self,
        mut reader: ContentReader,
        reference: &ContentReference,
    ) -> Result<u64, ContentIoError> {
        let path = Self::path_of(reference)?;
        let io_err = |e| ContentIoError::io(&reference.uri, e);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(io_err)?;
        }
        let mut file = tokio::fs::File::create(&path).await.map_err(io_err)?;
        let written = tokio::io::copy(&mut reader, &mut file)
            .await
            .map_err(io_err)?;
        file.flush().await.map_err(io_err)?;
        Ok(written)
    }

    async fn delete(&self, reference: &ContentReference) -> Result<(), ContentIoError> {
        let path = Self::path_of(reference)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(ContentIoError::io(&reference.uri, e)),
        }
    }

    async fn is_available(&self) -> bool {
        if tokio::fs::create_dir_all(&self.root).await.is_err() {
            return false;
        }
        tokio::fs::metadata(&self.root)
            .await
            .is_ok_and(|meta| meta.is_dir())
    }

    fn local_path(&self, reference: &ContentReference) -> Result<PathBuf, ContentIoError> {
        Self::path_of(reference)
    }
}
