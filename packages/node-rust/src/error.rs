//! Error types for the node runtime.
//!
//! Library code returns these typed errors; `anyhow` appears only at the
//! process edges (binary, heartbeat sources, reaction actions).

use std::fmt;

use courier_core::{AddressError, CodecError};

// ---------------------------------------------------------------------------
// MessagingError
// ---------------------------------------------------------------------------

/// Failures sending to or receiving from the broker.
#[derive(Debug, thiserror::Error)]
pub enum MessagingError {
    #[error("send to {address} failed: {reason}")]
    Send { address: String, reason: String },
    #[error("broker connection failed: {0}")]
    Connection(String),
    #[error("broker connection closed")]
    Closed,
    #[error("send timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },
    #[error("no address given and the channel has no default address")]
    NoAddress,
    #[error("unsupported broker binding: {0}")]
    UnsupportedBinding(String),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Address(#[from] AddressError),
    #[error("broker i/o: {0}")]
    Io(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// ContentIoError / UnsupportedOperation
// ---------------------------------------------------------------------------

/// Failures moving payloads through a content transport.
#[derive(Debug, thiserror::Error)]
pub enum ContentIoError {
    #[error("no content transport supports {uri}")]
    Unsupported { uri: String },
    #[error("content not found: {uri}")]
    NotFound { uri: String },
    #[error("invalid content uri {uri}: {reason}")]
    InvalidUri { uri: String, reason: String },
    #[error("i/o on {uri}: {source}")]
    Io {
        uri: String,
        #[source]
        source: std::io::Error,
    },
    #[error("content store returned {status} for {uri}")]
    Http { uri: String, status: u16 },
    #[error("content store request for {uri} failed: {source}")]
    Client {
        uri: String,
        #[source]
        source: reqwest::Error,
    },
    #[error(transparent)]
    Operation(#[from] UnsupportedOperation),
}

impl ContentIoError {
    /// Wraps an I/O error, mapping `NotFound` to [`ContentIoError::NotFound`].
    pub fn io(uri: impl Into<String>, source: std::io::Error) -> Self {
        let uri = uri.into();
        if source.kind() == std::io::ErrorKind::NotFound {
            Self::NotFound { uri }
        } else {
            Self::Io { uri, source }
        }
    }

    /// Returns `true` when the content does not exist.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// A backend was asked for a capability it does not have.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("operation `{operation}` is not supported by the {backend} backend")]
pub struct UnsupportedOperation {
    pub operation: &'static str,
    pub backend: &'static str,
}

// ---------------------------------------------------------------------------
// DispatchError
// ---------------------------------------------------------------------------

/// Requester-side failures.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("request {request_id} timed out after {timeout_ms}ms")]
    Timeout { request_id: String, timeout_ms: u64 },
    #[error("request {request_id} failed remotely: {detail}")]
    Remote { request_id: String, detail: String },
    #[error("no pending operation for request {0}")]
    NotFound(String),
    #[error(transparent)]
    Messaging(#[from] MessagingError),
    #[error(transparent)]
    Content(#[from] ContentIoError),
}

// ---------------------------------------------------------------------------
// ComponentUnavailableError
// ---------------------------------------------------------------------------

/// Which kind of dependency went away.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnavailableKind {
    /// A required executable is missing or not runnable.
    Executable,
    /// A content transport backend cannot be reached.
    ContentStore,
    /// The message broker cannot be reached.
    Broker,
    /// A remote HTTP service the processor calls.
    RemoteService,
    /// The node is misconfigured.
    Configuration,
}

impl UnavailableKind {
    /// Stable name used in logs and configuration.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Executable => "executable",
            Self::ContentStore => "content-store",
            Self::Broker => "broker",
            Self::RemoteService => "remote-service",
            Self::Configuration => "configuration",
        }
    }
}

impl fmt::Display for UnavailableKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A dependency of this node is down.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind} `{component}` unavailable: {reason}")]
pub struct ComponentUnavailableError {
    pub kind: UnavailableKind,
    pub component: String,
    pub reason: String,
}

impl ComponentUnavailableError {
    /// Creates an error for `component` of `kind`.
    pub fn new(
        kind: UnavailableKind,
        component: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            component: component.into(),
            reason: reason.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// ReplyError / ProcessingError
// ---------------------------------------------------------------------------

/// Worker-side failures emitting replies.
#[derive(Debug, thiserror::Error)]
pub enum ReplyError {
    #[error("request {0} already received its terminal reply")]
    AlreadyTerminated(String),
    #[error(transparent)]
    Messaging(#[from] MessagingError),
}

/// Why a processor could not produce targets for a request.
#[derive(Debug, thiserror::Error)]
pub enum ProcessingError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error(transparent)]
    Content(#[from] ContentIoError),
    #[error(transparent)]
    Unavailable(#[from] ComponentUnavailableError),
    #[error("{0}")]
    Failed(String),
}

// ---------------------------------------------------------------------------
// ActionError
// ---------------------------------------------------------------------------

/// Outcome of a reaction to a [`ComponentUnavailableError`].
#[derive(Debug, thiserror::Error)]
pub enum ActionError {
    #[error("action `{action}` timed out after {timeout_ms}ms")]
    TimedOut { action: String, timeout_ms: u64 },
    #[error("action `{action}` failed: {reason}")]
    Failed { action: String, reason: String },
    /// Every action ran; the error that triggered them is handed back.
    #[error(transparent)]
    Trigger(ComponentUnavailableError),
}

impl From<UnsupportedOperation> for ProcessingError {
    fn from(value: UnsupportedOperation) -> Self {
        Self::Content(ContentIoError::from(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_not_found_maps_to_not_found() {
        let err = ContentIoError::io(
            "file:///missing",
            std::io::Error::new(std::io::ErrorKind::NotFound, "gone"),
        );
        assert!(err.is_not_found());

        let err = ContentIoError::io(
            "file:///denied",
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "no"),
        );
        assert!(matches!(err, ContentIoError::Io { .. }));
    }

    #[test]
    fn timeout_message_mentions_timed_out() {
        let err = DispatchError::Timeout {
            request_id: "abc".to_string(),
            timeout_ms: 1000,
        };
        assert!(err.to_string().contains("timed out"));
    }

    #[test]
    fn unavailable_display_names_kind_and_component() {
        let err = ComponentUnavailableError::new(UnavailableKind::Executable, "ffmpeg", "not on PATH");
        assert_eq!(err.to_string(), "executable `ffmpeg` unavailable: not on PATH");
    }

    #[test]
    fn unsupported_operation_converts_into_processing_error() {
        let err: ProcessingError = UnsupportedOperation {
            operation: "local_path",
            backend: "object-storage",
        }
        .into();
        assert!(err.to_string().contains("local_path"));
    }
}
