//! Routes each reference to the first backend that supports it.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use courier_core::ContentReference;

use super::{ContentReader, ContentTransport, WaitPolicy};
use crate::error::ContentIoError;

/// Ordered list of backends. The first registered backend is the primary and
/// receives `create`.
#[derive(Clone, Default)]
pub struct DelegatingTransport {
    delegates: Vec<Arc<dyn ContentTransport>>,
}

impl DelegatingTransport {
    /// Creates a transport with no backends.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a backend after those already registered.
    #[must_use]
    pub fn with(mut self, delegate: Arc<dyn ContentTransport>) -> Self {
        self.delegates.push(delegate);
        self
    }

    /// Backend names in routing order.
    #[must_use]
    pub fn delegate_names(&self) -> Vec<&'static str> {
        self.delegates.iter().map(|d| d.name()).collect()
    }

    fn route(&self, reference: &ContentReference) -> Result<&dyn ContentTransport, ContentIoError> {
        self.delegates
            .iter()
            .find(|d| d.is_supported(reference))
            .map(|d| &**d)
            .ok_or_else(|| ContentIoError::Unsupported {
                uri: reference.uri.clone(),
            })
    }

    /// Name of the backend that would handle `reference`.
    #[must_use]
    pub fn backend_for(&self, reference: &ContentReference) -> Option<&'static str> {
        self.route(reference).ok().map(|d| d.name())
    }
}

impl std::fmt::Debug for DelegatingTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DelegatingTransport")
            .field("delegates", &self.delegate_names())
            .finish()
    }
}

#[async_trait]
impl ContentTransport for DelegatingTransport {
    fn name(&self) -> &'static str {
        "delegating"
    }

    fn is_supported(&self, reference: &ContentReference) -> bool {
        self.delegates.iter().any(|d| d.is_supported(reference))
    }

    async fn exists(&self, reference: &ContentReference) -> Result<bool, ContentIoError> {
        self.route(reference)?.exists(reference).await
    }

    async fn size(&self, reference: &ContentReference) -> Result<Option<u64>, ContentIoError> {
        self.route(reference)?.size(reference).await
    }

    async fn create(
        &self,
        name: &str,
        media_type: &str,
    ) -> Result<ContentReference, ContentIoError> {
        let primary = self
            .delegates
            .first()
            .ok_or_else(|| ContentIoError::Unsupported {
                uri: format!("<new content {name}>"),
            })?;
        primary.create(name, media_type).await
    }

    async fn read(
        &self,
        reference: &ContentReference,
        wait: &WaitPolicy,
    ) -> Result<ContentReader, ContentIoError> {
        self.route(reference)?.read(reference, wait).await
    }

    async fn write(
        &self,
        reader: ContentReader,
        reference: &ContentReference,
    ) -> Result<u64, ContentIoError> {
        self.route(reference)?.write(reader, reference).await
    }

    async fn delete(&self, reference: &ContentReference) -> Result<(), ContentIoError> {
        self.route(reference)?.delete(reference).await
    }

    async fn is_available(&self) -> bool {
        for delegate in &self.delegates {
            if !delegate.is_available().await {
                return false;
            }
        }
        true
    }

    fn local_path(&self, reference: &ContentReference) -> Result<PathBuf, ContentIoError> {
        self.route(reference)?.local_path(reference)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::transport::{
        read_to_bytes, reader_from_bytes, FileTransport, MemoryObjectStore, ObjectStorageTransport,
    };

    const POLL: Duration = Duration::from_millis(10);

    fn object_then_file(dir: &tempfile::TempDir) -> (DelegatingTransport, Arc<MemoryObjectStore>) {
        let store = Arc::new(MemoryObjectStore::new());
        let transport = DelegatingTransport::new()
            .with(Arc::new(ObjectStorageTransport::new(store.clone(), "courier", POLL)))
            .with(Arc::new(FileTransport::new(dir.path(), POLL)));
        (transport, store)
    }

    #[test]
    fn first_supporting_backend_wins() {
        let dir = tempfile::tempdir().unwrap();
        let (transport, _) = object_then_file(&dir);
        let file = ContentReference::new("file:///tmp/x", "text/plain");
        let object = ContentReference::new("s3://b/k", "text/plain");
        assert_eq!(transport.backend_for(&file), Some("file"));
        assert_eq!(transport.backend_for(&object), Some("object-storage"));
        assert_eq!(
            transport.backend_for(&ContentReference::new("ftp://h/x", "text/plain")),
            None
        );
    }

    #[tokio::test]
    async fn unsupported_reference_errors() {
        let dir = tempfile::tempdir().unwrap();
        let (transport, _) = object_then_file(&dir);
        let reference = ContentReference::new("ftp://h/x", "text/plain");
        assert!(!transport.is_supported(&reference));
        assert!(matches!(
            transport.exists(&reference).await,
            Err(ContentIoError::Unsupported { .. })
        ));
    }

    #[tokio::test]
    async fn create_goes_to_primary_and_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let (transport, store) = object_then_file(&dir);
        let reference = transport.create("blob", "application/octet-stream").await.unwrap();
        assert!(reference.uri.starts_with("s3://"));
        assert_eq!(store.len(), 1);

        transport
            .write(reader_from_bytes(&b"routed"[..]), &reference)
            .await
            .unwrap();
        let reader = transport.read(&reference, &WaitPolicy::Immediate).await.unwrap();
        assert_eq!(&read_to_bytes(reader, "x").await.unwrap()[..], b"routed");
    }

    #[tokio::test]
    async fn local_path_follows_the_routed_backend() {
        let dir = tempfile::tempdir().unwrap();
        let (transport, _) = object_then_file(&dir);
        let file = ContentReference::new("file:///tmp/x", "text/plain");
        assert_eq!(transport.local_path(&file).unwrap(), PathBuf::from("/tmp/x"));
        let object = ContentReference::new("s3://b/k", "text/plain");
        assert!(matches!(
            transport.local_path(&object),
            Err(ContentIoError::Operation(_))
        ));
    }

    #[tokio::test]
    async fn availability_is_the_and_of_delegates() {
        let dir = tempfile::tempdir().unwrap();
        let (transport, store) = object_then_file(&dir);
        assert!(transport.is_available().await);
        store.set_reachable(false);
        assert!(!transport.is_available().await);
    }

    #[tokio::test]
    async fn empty_delegating_transport_cannot_create() {
        let transport = DelegatingTransport::new();
        assert!(transport.create("x", "text/plain").await.is_err());
        assert!(transport.is_available().await);
    }
}
