//! Wire data model shared by requesters, workers, and monitors.
//!
//! All structs use `#[serde(rename_all = "camelCase")]` so the JSON and
//! named-`MsgPack` encodings carry the same field names
//! (`sourceRefs`, `requestId`, `instanceId`, ...).

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// ContentReference
// ---------------------------------------------------------------------------

/// Backend-agnostic handle to a binary payload.
///
/// `size` is advisory. When present it is the contract used by
/// "wait for availability" reads: a reader polls until the backend reports at
/// least `size` bytes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentReference {
    /// Location of the payload (`file:///...`, `s3://bucket/key`, `https://...`).
    pub uri: String,
    /// Media type of the payload, e.g. `video/mp4`.
    pub media_type: String,
    /// Expected size in bytes, if known.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub size: Option<u64>,
}

impl ContentReference {
    /// Creates a reference without a known size.
    #[must_use]
    pub fn new(uri: impl Into<String>, media_type: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            media_type: media_type.into(),
            size: None,
        }
    }

    /// Returns a copy of this reference carrying the given expected size.
    #[must_use]
    pub fn with_size(mut self, size: u64) -> Self {
        self.size = Some(size);
        self
    }

    /// The URI scheme (`file`, `s3`, `https`), lowercased, if the URI has one.
    #[must_use]
    pub fn scheme(&self) -> Option<String> {
        let (scheme, _) = self.uri.split_once(':')?;
        if scheme.is_empty()
            || !scheme
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'))
        {
            return None;
        }
        Some(scheme.to_ascii_lowercase())
    }
}

impl fmt::Display for ContentReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.uri, self.media_type)
    }
}

// ---------------------------------------------------------------------------
// TransformOptions
// ---------------------------------------------------------------------------

/// Processor options carried opaquely from requester to worker.
///
/// Uses `BTreeMap` for deterministic serialization order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransformOptions(BTreeMap<String, String>);

impl TransformOptions {
    /// Creates empty options.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    /// Sets `key`, replacing any previous value.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    /// Value of `key`, if present.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// Returns `true` if no options are set.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Options in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

// ---------------------------------------------------------------------------
// Request
// ---------------------------------------------------------------------------

/// A unit of work sent from a requester to a worker pool.
///
/// Immutable once sent, except `reply_to`, which a worker-side listener may
/// back-fill from transport headers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Request {
    /// Correlation identifier, unique per request.
    pub id: String,
    /// Payloads the worker reads.
    pub source_refs: Vec<ContentReference>,
    /// Where the worker writes results. `None` lets the worker create targets.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub target_refs: Option<Vec<ContentReference>>,
    #[serde(default)]
    pub options: TransformOptions,
    /// Reply address override (`queue:<name>` / `topic:<name>`).
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub reply_to: Option<String>,
}

impl Request {
    /// Creates a request with a freshly generated UUID v4 identifier.
    #[must_use]
    pub fn new(source_refs: Vec<ContentReference>, options: TransformOptions) -> Self {
        Self {
            id: generate_request_id(),
            source_refs,
            target_refs: None,
            options,
            reply_to: None,
        }
    }

    /// Sets the explicit target references.
    #[must_use]
    pub fn with_targets(mut self, target_refs: Vec<ContentReference>) -> Self {
        self.target_refs = Some(target_refs);
        self
    }

    /// Sets the address replies go to.
    #[must_use]
    pub fn with_reply_to(mut self, reply_to: impl Into<String>) -> Self {
        self.reply_to = Some(reply_to.into());
        self
    }
}

/// Generates a new correlation identifier.
#[must_use]
pub fn generate_request_id() -> String {
    Uuid::new_v4().to_string()
}

// ---------------------------------------------------------------------------
// ReplyStatus
// ---------------------------------------------------------------------------

/// Lifecycle status carried by a [`Reply`].
///
/// `Pending` and `InProgress` may repeat; `Complete` and `Error` are terminal
/// and mutually exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReplyStatus {
    Pending,
    InProgress,
    Complete,
    Error,
}

impl ReplyStatus {
    /// Returns `true` for `Complete` and `Error`.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Error)
    }

    /// Position in the status order: pending < in-progress < terminal.
    #[must_use]
    pub fn rank(self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::InProgress => 1,
            Self::Complete | Self::Error => 2,
        }
    }

    /// Whether a request currently in `self` may move to `next`.
    ///
    /// Nothing follows a terminal status, and a status never moves backwards.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        !self.is_terminal() && next.rank() >= self.rank()
    }

    /// Wire spelling of the status.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in-progress",
            Self::Complete => "complete",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for ReplyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Reply
// ---------------------------------------------------------------------------

/// Status update for exactly one [`Request`], matched by `request_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reply {
    pub request_id: String,
    pub status: ReplyStatus,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub target_refs: Vec<ContentReference>,
    /// Worker-side job identifier, if the worker assigns one.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub job_id: Option<String>,
    /// Fraction complete in `[0, 1]`.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub progress: Option<f32>,
    /// Human-readable detail; the failure reason for `Error`.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub detail: Option<String>,
}

impl Reply {
    fn with_status(request_id: impl Into<String>, status: ReplyStatus) -> Self {
        Self {
            request_id: request_id.into(),
            status,
            target_refs: Vec::new(),
            job_id: None,
            progress: None,
            detail: None,
        }
    }

    /// The synthetic "sent, nothing heard yet" reply.
    #[must_use]
    pub fn pending(request_id: impl Into<String>) -> Self {
        Self::with_status(request_id, ReplyStatus::Pending)
    }

    /// In-progress without a progress value (work has started).
    #[must_use]
    pub fn in_progress(request_id: impl Into<String>) -> Self {
        Self::with_status(request_id, ReplyStatus::InProgress)
    }

    /// In-progress with a progress value, clamped to `[0, 1]`.
    #[must_use]
    pub fn progress(request_id: impl Into<String>, progress: f32) -> Self {
        let mut reply = Self::with_status(request_id, ReplyStatus::InProgress);
        reply.progress = Some(clamp_progress(progress));
        reply
    }

    /// Terminal success reply listing the written targets.
    #[must_use]
    pub fn complete(request_id: impl Into<String>, target_refs: Vec<ContentReference>) -> Self {
        let mut reply = Self::with_status(request_id, ReplyStatus::Complete);
        reply.target_refs = target_refs;
        reply.progress = Some(1.0);
        reply
    }

    /// Terminal failure reply carrying `detail`.
    #[must_use]
    pub fn error(request_id: impl Into<String>, detail: impl Into<String>) -> Self {
        let mut reply = Self::with_status(request_id, ReplyStatus::Error);
        reply.detail = Some(detail.into());
        reply
    }

    /// Attaches the worker-side job identifier.
    #[must_use]
    pub fn with_job_id(mut self, job_id: impl Into<String>) -> Self {
        self.job_id = Some(job_id.into());
        self
    }
}

fn clamp_progress(progress: f32) -> f32 {
    if progress.is_nan() {
        0.0
    } else {
        progress.clamp(0.0, 1.0)
    }
}

// ---------------------------------------------------------------------------
// Heartbeat
// ---------------------------------------------------------------------------

/// Periodic liveness signal emitted by a component instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Heartbeat {
    pub service_type: String,
    pub instance_id: String,
    /// Milliseconds since Unix epoch; non-decreasing per instance.
    pub timestamp: i64,
    pub available: bool,
    #[serde(default)]
    pub details: BTreeMap<String, String>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
