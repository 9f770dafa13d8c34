//! Requester side: submit requests, follow their replies, collect results.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use courier_core::{ContentReference, Headers, Reply, ReplyStatus, Request, TransformOptions};
use metrics::counter;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use super::tracker::{CorrelationTracker, ProgressSnapshot, ReplyOutcome};
use crate::channel::{ListenerHandle, MessageChannel, MessageHandler};
use crate::config::DispatchConfig;
use crate::error::{DispatchError, MessagingError};
use crate::periodic::{Periodic, PeriodicHandle, Schedule};
use crate::telemetry::metric;
use crate::transport::{read_to_bytes, reader_from_bytes, ContentTransport, WaitPolicy};

// ---------------------------------------------------------------------------
// Submission
// ---------------------------------------------------------------------------

/// One source payload: an existing reference, or bytes to upload to it first.
#[derive(Debug, Clone)]
pub struct SourceContent {
    pub reference: ContentReference,
    pub data: Option<Bytes>,
}

/// Everything needed to build and send a [`Request`].
#[derive(Debug, Clone, Default)]
pub struct Submission {
    pub sources: Vec<SourceContent>,
    pub targets: Option<Vec<ContentReference>>,
    pub options: TransformOptions,
}

impl Submission {
    /// Creates a submission with `options` and no content yet.
    #[must_use]
    pub fn new(options: TransformOptions) -> Self {
        Self {
            options,
            ..Self::default()
        }
    }

    /// Uploads `data` to `reference` before sending.
    #[must_use]
    pub fn with_upload(mut self, reference: ContentReference, data: impl Into<Bytes>) -> Self {
        self.sources.push(SourceContent {
            reference,
            data: Some(data.into()),
        });
        self
    }

    /// References content that is already in place.
    #[must_use]
    pub fn with_source(mut self, reference: ContentReference) -> Self {
        self.sources.push(SourceContent {
            reference,
            data: None,
        });
        self
    }

    /// Sets explicit targets instead of letting the worker create them.
    #[must_use]
    pub fn with_targets(mut self, targets: Vec<ContentReference>) -> Self {
        self.targets = Some(targets);
        self
    }
}

/// A result target and its bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResultContent {
    pub reference: ContentReference,
    pub data: Bytes,
}

/// How a synchronous wait ended without error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    Completed(Vec<ResultContent>),
    /// The caller's cancel token fired; the request may still run remotely.
    Cancelled,
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

/// Sends requests and tracks them until a terminal reply arrives.
#[derive(Clone)]
pub struct Dispatcher {
    tracker: Arc<CorrelationTracker>,
    channel: MessageChannel,
    transport: Arc<dyn ContentTransport>,
    config: DispatchConfig,
}

impl Dispatcher {
    /// Creates a dispatcher sending on `channel` and moving content through `transport`.
    pub fn new(
        channel: MessageChannel,
        transport: Arc<dyn ContentTransport>,
        config: DispatchConfig,
    ) -> Self {
        Self {
            tracker: Arc::new(CorrelationTracker::new()),
            channel,
            transport,
            config,
        }
    }

    /// Tracker holding every outstanding request.
    #[must_use]
    pub fn tracker(&self) -> &Arc<CorrelationTracker> {
        &self.tracker
    }

    /// Addresses and timing this dispatcher runs with.
    #[must_use]
    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    /// Starts the reply listener on the configured reply address.
    ///
    /// # Errors
    ///
    /// Returns `MessagingError` if the listener cannot be started.
    pub fn listen(&self) -> Result<ListenerHandle, MessagingError> {
        self.channel.start_listener(
            Some(&self.config.reply_address),
            ReplyListener::new(Arc::clone(&self.tracker)),
        )
    }

    /// Starts the periodic TTL sweep of abandoned entries.
    #[must_use]
    pub fn start_sweeper(&self) -> PeriodicHandle {
        let sweeper = TrackerSweeper {
            tracker: Arc::clone(&self.tracker),
            pending_ttl: self.config.pending_ttl,
            completed_ttl: self.config.completed_ttl,
        };
        let period = self.config.sweep_interval;
        PeriodicHandle::spawn(sweeper, Schedule::every(period).after(period))
    }

    /// Uploads sources, registers the request, and sends it. Returns the
    /// request ID without waiting for any reply.
    ///
    /// # Errors
    ///
    /// Returns `DispatchError::Content` if a source upload fails and
    /// `DispatchError::Messaging` if the request cannot be sent. Nothing stays
    /// registered on failure.
    pub async fn submit_async(&self, submission: Submission) -> Result<String, DispatchError> {
        self.submit(submission, true).await
    }

    async fn submit(
        &self,
        submission: Submission,
        asynchronous: bool,
    ) -> Result<String, DispatchError> {
        let Submission {
            sources,
            targets,
            options,
        } = submission;

        let mut source_refs = Vec::with_capacity(sources.len());
        for SourceContent { mut reference, data } in sources {
            if let Some(data) = data {
                let written = self
                    .transport
                    .write(reader_from_bytes(data), &reference)
                    .await?;
                reference.size = Some(written);
            }
            source_refs.push(reference);
        }

        let mut request = Request::new(source_refs, options)
            .with_reply_to(self.config.reply_address.to_string());
        if let Some(targets) = targets {
            request = request.with_targets(targets);
        }
        let id = request.id.clone();

        async {
            self.tracker.register(request.clone(), asynchronous);
            if let Err(err) = self
                .channel
                .send(request, Some(&self.config.request_address), None)
                .await
            {
                self.tracker.remove(&id);
                warn!(error = %err, "request send failed");
                return Err(DispatchError::from(err));
            }
            counter!(metric::REQUESTS_SUBMITTED).increment(1);
            info!(asynchronous, "request submitted");
            Ok(id.clone())
        }
        .instrument(info_span!("submit", request_id = %id))
        .await
    }

    /// Latest known status of a request.
    ///
    /// An asynchronous request that has finished is removed by the poll that
    /// returns its terminal status.
    ///
    /// # Errors
    ///
    /// Returns `DispatchError::NotFound` for unknown or already collected IDs.
    pub fn poll_progress(&self, request_id: &str) -> Result<ProgressSnapshot, DispatchError> {
        self.tracker
            .poll(request_id)
            .ok_or_else(|| DispatchError::NotFound(request_id.to_string()))
    }

    /// Submits and waits for the terminal reply, polling every
    /// `poll_interval`. `timeout_ms <= 0` waits without a deadline.
    ///
    /// The tracker entry is removed however the wait ends.
    ///
    /// # Errors
    ///
    /// - `DispatchError::Timeout` when the deadline passes first
    /// - `DispatchError::Remote` for an error reply
    /// - submit and result-read failures as in [`Self::submit_async`]
    pub async fn await_sync(
        &self,
        submission: Submission,
        timeout_ms: i64,
        cancel: &CancellationToken,
    ) -> Result<SyncOutcome, DispatchError> {
        let id = self.submit(submission, false).await?;
        let _entry = EntryGuard {
            tracker: &self.tracker,
            request_id: &id,
        };

        let timeout_ms = u64::try_from(timeout_ms).ok().filter(|ms| *ms > 0);
        let deadline = timeout_ms.map(|ms| Instant::now() + Duration::from_millis(ms));

        loop {
            let snapshot = self
                .tracker
                .snapshot(&id)
                .ok_or_else(|| DispatchError::NotFound(id.clone()))?;
            match snapshot.status {
                ReplyStatus::Complete => {
                    let wait = WaitPolicy::UntilAvailable(cancel.child_token());
                    let fetch = self.fetch_results(&snapshot.target_refs, &wait);
                    let results = match deadline {
                        Some(deadline) => {
                            let Ok(results) = tokio::time::timeout_at(deadline, fetch).await else {
                                let timeout_ms = timeout_ms.unwrap_or_default();
                                warn!(request_id = %id, timeout_ms, "results not available before the deadline");
                                return Err(DispatchError::Timeout {
                                    request_id: id.clone(),
                                    timeout_ms,
                                });
                            };
                            results?
                        }
                        None => fetch.await?,
                    };
                    return Ok(SyncOutcome::Completed(results));
                }
                ReplyStatus::Error => {
                    return Err(DispatchError::Remote {
                        request_id: id.clone(),
                        detail: snapshot.detail.unwrap_or_default(),
                    });
                }
                ReplyStatus::Pending | ReplyStatus::InProgress => {}
            }

            let mut nap = self.config.poll_interval;
            if let (Some(deadline), Some(timeout_ms)) = (deadline, timeout_ms) {
                let now = Instant::now();
                if now >= deadline {
                    warn!(request_id = %id, timeout_ms, "synchronous request timed out");
                    return Err(DispatchError::Timeout {
                        request_id: id.clone(),
                        timeout_ms,
                    });
                }
                nap = nap.min(deadline - now);
            }

            tokio::select! {
                () = cancel.cancelled() => {
                    info!(request_id = %id, "synchronous wait cancelled");
                    return Ok(SyncOutcome::Cancelled);
                }
                () = tokio::time::sleep(nap) => {}
            }
        }
    }

    /// Reads every target of a finished request.
    ///
    /// # Errors
    ///
    /// Returns the first `ContentIoError` hit.
    pub async fn fetch_results(
        &self,
        targets: &[ContentReference],
        wait: &WaitPolicy,
    ) -> Result<Vec<ResultContent>, DispatchError> {
        let mut results = Vec::with_capacity(targets.len());
        for reference in targets {
            let reader = self.transport.read(reference, wait).await?;
            let data = read_to_bytes(reader, &reference.uri).await?;
            results.push(ResultContent {
                reference: reference.clone(),
                data,
            });
        }
        Ok(results)
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("pending", &self.tracker.len())
            .field("channel", &self.channel)
            .field("transport", &self.transport.name())
            .field("config", &self.config)
            .finish()
    }
}

/// Removes a synchronous request's entry when its waiter returns.
struct EntryGuard<'a> {
    tracker: &'a CorrelationTracker,
    request_id: &'a str,
}

impl Drop for EntryGuard<'_> {
    fn drop(&mut self) {
        self.tracker.remove(self.request_id);
    }
}

// ---------------------------------------------------------------------------
// ReplyListener
// ---------------------------------------------------------------------------

/// Feeds replies from the reply address into the tracker.
#[derive(Debug, Clone)]
pub struct ReplyListener {
    tracker: Arc<CorrelationTracker>,
}

impl ReplyListener {
    /// Creates a listener feeding `tracker`.
    #[must_use]
    pub fn new(tracker: Arc<CorrelationTracker>) -> Self {
        Self { tracker }
    }

    /// Applies one reply.
    pub fn on_reply(&self, reply: Reply) -> ReplyOutcome {
        let request_id = reply.request_id.clone();
        let status = reply.status;
        counter!(metric::REPLIES, "status" => status.as_str()).increment(1);

        let outcome = self.tracker.record_reply(reply);
        match outcome {
            ReplyOutcome::Orphaned => {
                info!(%request_id, %status, "dropping reply for unknown request");
            }
            ReplyOutcome::Ignored { current } => {
                debug!(%request_id, %status, %current, "ignoring out-of-order reply");
            }
            ReplyOutcome::Updated { status } => {
                debug!(%request_id, %status, "reply recorded");
            }
        }
        outcome
    }
}

#[async_trait]
impl MessageHandler for ReplyListener {
    type Body = Reply;

    async fn on_receive(&self, body: Reply, _headers: &Headers) {
        self.on_reply(body);
    }
}

// ---------------------------------------------------------------------------
// TrackerSweeper
// ---------------------------------------------------------------------------

struct TrackerSweeper {
    tracker: Arc<CorrelationTracker>,
    pending_ttl: Duration,
    completed_ttl: Duration,
}

#[async_trait]
impl Periodic for TrackerSweeper {
    fn name(&self) -> &'static str {
        "tracker-sweeper"
    }

    async fn tick(&mut self) -> anyhow::Result<()> {
        let evicted = self
            .tracker
            .evict_expired(self.pending_ttl, self.completed_ttl);
        if evicted > 0 {
            warn!(evicted, remaining = self.tracker.len(), "evicted expired pending operations");
        }
        Ok(())
    }
}
