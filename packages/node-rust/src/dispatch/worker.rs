//! Worker side: the reply protocol and the request-processing handlers.
//!
//! A [`RequestWorker`] turns each inbound [`Request`] into a `started` reply,
//! any number of rate-limited progress replies, and exactly one terminal
//! reply. Wrapping it in [`Handoff`] moves the work off the listener task so
//! deliveries are acknowledged while processing continues.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use courier_core::{Address, ContentReference, Headers, Reply, Request};
use metrics::counter;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::channel::{MessageChannel, MessageHandler};
use crate::config::WorkerConfig;
use crate::error::{ComponentUnavailableError, ProcessingError, ReplyError};
use crate::health::UnavailableHandler;
use crate::lifecycle::NodeLifecycle;
use crate::telemetry::metric;
use crate::transport::ContentTransport;

// ---------------------------------------------------------------------------
// ReplyEmitter
// ---------------------------------------------------------------------------

/// Sends the replies for one request.
///
/// Replies go to the request's `replyTo` when it parses as an address, else
/// to the worker's default reply address. Only one terminal reply is ever
/// sent.
#[derive(Debug)]
pub struct ReplyEmitter {
    channel: MessageChannel,
    destination: Address,
    request_id: String,
    job_id: Option<String>,
    progress_interval: Duration,
    last_progress: Mutex<Option<Instant>>,
    terminated: AtomicBool,
}

impl ReplyEmitter {
    /// Creates an emitter for `request` on `channel`.
    ///
    /// Replies go to the request's `replyTo` when it parses, else to
    /// `default_reply`. Progress is sent at most once per `progress_interval`.
    pub fn new(
        channel: MessageChannel,
        request: &Request,
        default_reply: &Address,
        progress_interval: Duration,
    ) -> Self {
        let destination = match request.reply_to.as_deref().map(str::parse::<Address>) {
            Some(Ok(address)) => address,
            Some(Err(err)) => {
                warn!(request_id = %request.id, error = %err, "unusable replyTo, using default reply address");
                default_reply.clone()
            }
            None => default_reply.clone(),
        };
        Self {
            channel,
            destination,
            request_id: request.id.clone(),
            job_id: None,
            progress_interval,
            last_progress: Mutex::new(None),
            terminated: AtomicBool::new(false),
        }
    }

    /// Tags every reply with a worker-side job ID.
    #[must_use]
    pub fn with_job_id(mut self, job_id: impl Into<String>) -> Self {
        self.job_id = Some(job_id.into());
        self
    }

    /// Address replies are sent to.
    #[must_use]
    pub fn destination(&self) -> &Address {
        &self.destination
    }

    /// Returns `true` once a complete or error reply has been sent.
    #[must_use]
    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }

    async fn emit(&self, mut reply: Reply) -> Result<(), ReplyError> {
        if let Some(job_id) = &self.job_id {
            reply.job_id = Some(job_id.clone());
        }
        self.channel
            .send(reply, Some(&self.destination), None)
            .await
            .map_err(ReplyError::from)
    }

    fn ensure_open(&self) -> Result<(), ReplyError> {
        if self.is_terminated() {
            Err(ReplyError::AlreadyTerminated(self.request_id.clone()))
        } else {
            Ok(())
        }
    }

    fn claim_terminal(&self) -> Result<(), ReplyError> {
        if self.terminated.swap(true, Ordering::SeqCst) {
            Err(ReplyError::AlreadyTerminated(self.request_id.clone()))
        } else {
            Ok(())
        }
    }

    /// In-progress reply without a progress value.
    ///
    /// # Errors
    ///
    /// `AlreadyTerminated` after a terminal reply; `Messaging` on send failure.
    pub async fn started(&self) -> Result<(), ReplyError> {
        self.ensure_open()?;
        self.emit(Reply::in_progress(self.request_id.clone())).await
    }

    /// In-progress reply carrying `fraction`, at most once per
    /// `progress_interval`. Returns whether a reply was sent.
    ///
    /// # Errors
    ///
    /// `AlreadyTerminated` after a terminal reply; `Messaging` on send failure.
    pub async fn progress(&self, fraction: f32) -> Result<bool, ReplyError> {
        self.ensure_open()?;
        {
            let mut last = self.last_progress.lock();
            let now = Instant::now();
            if last.is_some_and(|at| now.duration_since(at) < self.progress_interval) {
                return Ok(false);
            }
            *last = Some(now);
        }
        self.emit(Reply::progress(self.request_id.clone(), fraction))
            .await
            .map(|()| true)
    }

    /// Terminal success reply.
    ///
    /// # Errors
    ///
    /// `AlreadyTerminated` if a terminal reply was already sent.
    pub async fn complete(&self, targets: Vec<ContentReference>) -> Result<(), ReplyError> {
        self.claim_terminal()?;
        self.emit(Reply::complete(self.request_id.clone(), targets)).await
    }

    /// Terminal failure reply.
    ///
    /// # Errors
    ///
    /// `AlreadyTerminated` if a terminal reply was already sent.
    pub async fn error(&self, detail: impl Into<String>) -> Result<(), ReplyError> {
        self.claim_terminal()?;
        self.emit(Reply::error(self.request_id.clone(), detail)).await
    }
}

// ---------------------------------------------------------------------------
// RequestProcessor
// ---------------------------------------------------------------------------

/// What a processor gets to work with for one request.
#[derive(Clone)]
pub struct ProcessingContext {
    pub transport: Arc<dyn ContentTransport>,
    pub emitter: Arc<ReplyEmitter>,
    /// Fires when the node shuts down.
    pub cancel: CancellationToken,
}

impl std::fmt::Debug for ProcessingContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessingContext")
            .field("transport", &self.transport.name())
            .field("emitter", &self.emitter)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}

impl ProcessingContext {
    /// Sends a progress reply if the rate limit allows; send failures are
    /// logged, not returned.
    pub async fn report_progress(&self, fraction: f32) {
        if let Err(err) = self.emitter.progress(fraction).await {
            debug!(error = %err, "progress reply not sent");
        }
    }
}

/// The work a worker performs for each request.
#[async_trait]
pub trait RequestProcessor: Send + Sync + 'static {
    /// Reported in heartbeats and logs.
    fn service_type(&self) -> &'static str;

    /// Checks the processor's external dependencies.
    async fn check_available(&self) -> Result<(), ComponentUnavailableError> {
        Ok(())
    }

    /// Produces the request's targets.
    async fn process(
        &self,
        request: &Request,
        ctx: &ProcessingContext,
    ) -> Result<Vec<ContentReference>, ProcessingError>;
}

// ---------------------------------------------------------------------------
// RequestWorker
// ---------------------------------------------------------------------------

/// Handles requests with a [`RequestProcessor`] and answers with replies.
pub struct RequestWorker<P> {
    processor: Arc<P>,
    channel: MessageChannel,
    transport: Arc<dyn ContentTransport>,
    lifecycle: Arc<NodeLifecycle>,
    default_reply: Address,
    progress_interval: Duration,
    unavailable: Option<Arc<UnavailableHandler>>,
    cancel: CancellationToken,
}

impl<P: RequestProcessor> RequestWorker<P> {
    /// Creates a worker running `processor`, replying on `channel` and
    /// counting each request as in-flight work on `lifecycle`.
    pub fn new(
        processor: Arc<P>,
        channel: MessageChannel,
        transport: Arc<dyn ContentTransport>,
        lifecycle: Arc<NodeLifecycle>,
        config: &WorkerConfig,
    ) -> Self {
        Self {
            processor,
            channel,
            transport,
            lifecycle,
            default_reply: config.default_reply_address.clone(),
            progress_interval: config.progress_interval,
            unavailable: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Routes unavailable dependencies to the action policy.
    #[must_use]
    pub fn with_unavailable_handler(mut self, handler: Arc<UnavailableHandler>) -> Self {
        self.unavailable = Some(handler);
        self
    }

    /// Token handed to processors as [`ProcessingContext::cancel`].
    #[must_use]
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Runs one request to its terminal reply.
    pub async fn handle(&self, request: Request) {
        let span = info_span!(
            "process",
            request_id = %request.id,
            service = self.processor.service_type()
        );
        self.handle_inner(request).instrument(span).await;
    }

    async fn handle_inner(&self, request: Request) {
        let _in_flight = self.lifecycle.in_flight_guard();
        let emitter = Arc::new(ReplyEmitter::new(
            self.channel.clone(),
            &request,
            &self.default_reply,
            self.progress_interval,
        ));

        if let Err(err) = emitter.started().await {
            warn!(error = %err, "could not send started reply");
        }

        let outcome = match self.processor.check_available().await {
            Ok(()) => {
                let ctx = ProcessingContext {
                    transport: Arc::clone(&self.transport),
                    emitter: Arc::clone(&emitter),
                    cancel: self.cancel.clone(),
                };
                self.processor.process(&request, &ctx).await
            }
            Err(unavailable) => Err(ProcessingError::Unavailable(unavailable)),
        };

        let (label, sent) = match outcome {
            Ok(targets) => {
                info!(targets = targets.len(), "request complete");
                ("complete", emitter.complete(targets).await)
            }
            Err(ProcessingError::Unavailable(unavailable)) => {
                let sent = emitter.error(unavailable.to_string()).await;
                if let Some(handler) = &self.unavailable {
                    handler.handle(&unavailable).await;
                } else {
                    error!(severity = "critical", error = %unavailable, "component unavailable");
                }
                ("unavailable", sent)
            }
            Err(err) => {
                warn!(error = %err, "request failed");
                ("error", emitter.error(err.to_string()).await)
            }
        };
        counter!(metric::REQUESTS_PROCESSED, "outcome" => label).increment(1);

        if let Err(err) = sent {
            warn!(error = %err, "terminal reply not delivered");
        }
    }
}

#[async_trait]
impl<P: RequestProcessor> MessageHandler for RequestWorker<P> {
    type Body = Request;

    async fn on_receive(&self, body: Request, _headers: &Headers) {
        self.handle(body).await;
    }
}

// ---------------------------------------------------------------------------
// Handoff
// ---------------------------------------------------------------------------

/// Message parked in the handoff until a task signals it has been taken.
type Slot<B> = (B, Headers, oneshot::Sender<()>);

/// Offloads a handler's work to `n` tasks as a rendezvous.
///
/// `on_receive` returns only after a processing task has taken the message,
/// so the listener never acknowledges work that no task holds. While every
/// task is busy the listener stays blocked and stops consuming. Dropping the
/// `Handoff` closes the queue; the tasks finish the work they already took.
pub struct Handoff<H: MessageHandler> {
    queue: mpsc::Sender<Slot<H::Body>>,
    tasks: Vec<JoinHandle<()>>,
}

impl<H: MessageHandler> Handoff<H> {
    /// Spawns `workers` processing tasks (at least one) around `handler`.
    pub fn new(handler: H, workers: usize) -> Self {
        let (queue, rx) = mpsc::channel::<Slot<H::Body>>(1);
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let handler = Arc::new(handler);

        let tasks = (0..workers.max(1))
            .map(|index| {
                let rx = Arc::clone(&rx);
                let handler = Arc::clone(&handler);
                tokio::spawn(async move {
                    loop {
                        let next = rx.lock().await.recv().await;
                        let Some((body, headers, taken)) = next else {
                            break;
                        };
                        let _ = taken.send(());
                        handler.on_receive(body, &headers).await;
                    }
                    debug!(task = index, "handoff task finished");
                })
            })
            .collect();

        Self { queue, tasks }
    }

    /// Number of processing tasks.
    #[must_use]
    pub fn workers(&self) -> usize {
        self.tasks.len()
    }

    /// Closes the queue and waits for the tasks to finish their current work.
    pub async fn shutdown(self) {
        let Self { queue, tasks } = self;
        drop(queue);
        for task in tasks {
            let _ = task.await;
        }
    }
}

#[async_trait]
impl<H: MessageHandler> MessageHandler for Handoff<H> {
    type Body = H::Body;

    async fn on_receive(&self, body: Self::Body, headers: &Headers) {
        let (taken, picked) = oneshot::channel();
        if self.queue.send((body, headers.clone(), taken)).await.is_err() {
            warn!("handoff queue closed, dropping message");
            return;
        }
        if picked.await.is_err() {
            warn!("handoff closed before a task took the message");
        }
    }
}
