//! WebDAV-style remote document store under a base URL.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use courier_core::ContentReference;
use reqwest::StatusCode;
use tracing::debug;

use super::object::header_length;
use super::{
    read_to_bytes, reader_from_bytes, wait_until_available, ContentReader, ContentTransport,
    WaitPolicy,
};
use crate::error::ContentIoError;

/// HEAD for existence and size, GET/PUT/DELETE for data, all relative to
/// `base_url`.
#[derive(Debug, Clone)]
pub struct RemoteStoreTransport {
    client: reqwest::Client,
    base_url: String,
    poll_interval: Duration,
}

impl RemoteStoreTransport {
    /// Creates a transport over the store at `base_url`.
    pub fn new(client: reqwest::Client, base_url: impl Into<String>, poll_interval: Duration) -> Self {
        let base_url: String = base_url.into();
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            poll_interval,
        }
    }

    /// Base URL of the store.
    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn client_error(uri: &str, source: reqwest::Error) -> ContentIoError {
        ContentIoError::Client {
            uri: uri.to_string(),
            source,
        }
    }

    fn status_error(uri: &str, status: StatusCode) -> ContentIoError {
        ContentIoError::Http {
            uri: uri.to_string(),
            status: status.as_u16(),
        }
    }

    async fn get_once(&self, uri: &str) -> Result<Option<Bytes>, ContentIoError> {
        let response = self
            .client
            .get(uri)
            .send()
            .await
            .map_err(|e| Self::client_error(uri, e))?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            s if s.is_success() => response
                .bytes()
                .await
                .map(Some)
                .map_err(|e| Self::client_error(uri, e)),
            s => Err(Self::status_error(uri, s)),
        }
    }
}

#[async_trait]
impl ContentTransport for RemoteStoreTransport {
    fn name(&self) -> &'static str {
        "remote-store"
    }

    fn is_supported(&self, reference: &ContentReference) -> bool {
        reference
            .uri
            .strip_prefix(&self.base_url)
            .is_some_and(|rest| rest.starts_with('/') && rest.len() > 1)
    }

    async fn exists(&self, reference: &ContentReference) -> Result<bool, ContentIoError> {
        Ok(self.size(reference).await?.is_some())
    }

    async fn size(&self, reference: &ContentReference) -> Result<Option<u64>, ContentIoError> {
        let uri = &reference.uri;
        let response = self
            .client
            .head(uri)
            .send()
            .await
            .map_err(|e| Self::client_error(uri, e))?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            s if s.is_success() => Ok(Some(header_length(&response).unwrap_or(0))),
            s => Err(Self::status_error(uri, s)),
        }
    }

    async fn create(
        &self,
        name: &str,
        media_type: &str,
    ) -> Result<ContentReference, ContentIoError> {
        let uri = format!(
            "{}/{}-{}",
            self.base_url,
            uuid::Uuid::new_v4(),
            name.trim_start_matches('/')
        );
        let reference = ContentReference::new(uri, media_type);
        self.write(reader_from_bytes(Bytes::new()), &reference).await?;
        Ok(reference)
    }

    /// A 404 means "not written yet" only while waiting; without a wait
    /// policy it is a hard `NotFound`.
    async fn read(
        &self,
        reference: &ContentReference,
        wait: &WaitPolicy,
    ) -> Result<ContentReader, ContentIoError> {
        let uri = &reference.uri;
        wait_until_available(self, reference, wait, self.poll_interval).await?;

        loop {
            if let Some(data) = self.get_once(uri).await? {
                return Ok(reader_from_bytes(data));
            }
            let Some(token) = wait.token() else {
                return Err(ContentIoError::NotFound { uri: uri.clone() });
            };
            debug!(%uri, "remote content not present yet");
            tokio::select! {
                () = token.cancelled() => {
                    return Err(ContentIoError::NotFound { uri: uri.clone() });
                }
                () = tokio::time::sleep(self.poll_interval) => {}
            }
        }
    }

    async fn write(
        &self,
        reader: ContentReader,
        reference: &ContentReference,
    ) -> Result<u64, ContentIoError> {
        let uri = &reference.uri;
        let data = read_to_bytes(reader, uri).await?;
        let written = data.len() as u64;
        let response = self
            .client
            .put(uri)
            .header(reqwest::header::CONTENT_TYPE, &reference.media_type)
            .body(data)
            .send()
            .await
            .map_err(|e| Self::client_error(uri, e))?;
        if response.status().is_success() {
            Ok(written)
        } else {
            Err(Self::status_error(uri, response.status()))
        }
    }

    async fn delete(&self, reference: &ContentReference) -> Result<(), ContentIoError> {
        let uri = &reference.uri;
        let response = self
            .client
            .delete(uri)
            .send()
            .await
            .map_err(|e| Self::client_error(uri, e))?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(()),
            s if s.is_success() => Ok(()),
            s => Err(Self::status_error(uri, s)),
        }
    }

    async fn is_available(&self) -> bool {
        match self.client.head(&self.base_url).send().await {
            Ok(response) => !response.status().is_server_error(),
            Err(err) => {
                debug!(base_url = %self.base_url, error = %err, "remote store unreachable");
                false
            }
        }
    }
}
