//! Node assembly: wires channels, transports, dispatch, and health together.
//!
//! A worker node consumes requests, runs them through a processor, publishes
//! heartbeats, and exposes health endpoints. A requester node sends requests
//! and tracks their replies.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::channel::{self, ListenerHandle, MessageChannel};
use crate::config::{DispatchConfig, NodeConfig, TransportConfig};
use crate::dispatch::{Dispatcher, Handoff, RequestProcessor, RequestWorker};
use crate::error::MessagingError;
use crate::health::{Heart, NodeHeartbeatSource, UnavailableHandler};
use crate::http::{HealthServer, HealthState};
use crate::lifecycle::NodeLifecycle;
use crate::periodic::PeriodicHandle;
use crate::transport::{
    ContentTransport, DelegatingTransport, FileTransport, HttpObjectStore,
    ObjectStorageTransport, RemoteStoreTransport,
};

/// Builds the routing transport: object storage, then the remote store, then
/// local files, each only when configured.
///
/// # Errors
///
/// Fails if the HTTP client cannot be built.
pub fn build_transport(config: &TransportConfig) -> anyhow::Result<Arc<DelegatingTransport>> {
    let poll = config.availability_poll_interval;
    let mut transport = DelegatingTransport::new();

    let needs_http = config.object_store_endpoint.is_some() || config.remote_base_url.is_some();
    if needs_http {
        let client = reqwest::Client::builder()
            .build()
            .context("building HTTP client")?;
        if let Some(endpoint) = &config.object_store_endpoint {
            let store = Arc::new(HttpObjectStore::new(client.clone(), endpoint.clone()));
            transport = transport.with(Arc::new(ObjectStorageTransport::new(
                store,
                config.object_store_bucket.clone(),
                poll,
            )));
        }
        if let Some(base) = &config.remote_base_url {
            transport = transport.with(Arc::new(RemoteStoreTransport::new(client, base.clone(), poll)));
        }
    }
    transport = transport.with(Arc::new(FileTransport::new(config.file_root.clone(), poll)));

    info!(backends = ?transport.delegate_names(), "content transport ready");
    Ok(Arc::new(transport))
}

// ---------------------------------------------------------------------------
// Worker node
// ---------------------------------------------------------------------------

/// A worker node before it starts consuming.
pub struct WorkerNode<P: RequestProcessor> {
    processor: Arc<P>,
    channel: MessageChannel,
    transport: Arc<dyn ContentTransport>,
    lifecycle: Arc<NodeLifecycle>,
    config: NodeConfig,
}

impl<P: RequestProcessor> WorkerNode<P> {
    /// Creates a worker node from already-built parts.
    pub fn new(
        processor: Arc<P>,
        channel: MessageChannel,
        transport: Arc<dyn ContentTransport>,
        config: NodeConfig,
    ) -> Self {
        Self {
            processor,
            channel,
            transport,
            lifecycle: Arc::new(NodeLifecycle::new()),
            config,
        }
    }

    /// Connects the configured broker and transports.
    ///
    /// # Errors
    ///
    /// Fails if the broker is unreachable or the transport cannot be built.
    pub async fn connect(processor: P, config: NodeConfig) -> anyhow::Result<Self> {
        let broker = channel::connect(&config.channel.broker_url)
            .await
            .with_context(|| format!("connecting to {}", config.channel.broker_url))?;
        let channel = MessageChannel::new(broker, &config.channel);
        let transport = build_transport(&config.transport)?;
        Ok(Self::new(Arc::new(processor), channel, transport, config))
    }

    /// Lifecycle shared with the running node.
    #[must_use]
    pub fn lifecycle(&self) -> &Arc<NodeLifecycle> {
        &self.lifecycle
    }

    /// Starts the health endpoint, the heart, and the request listener, then
    /// marks the node ready.
    ///
    /// # Errors
    ///
    /// Fails if the health address cannot be bound or the listener cannot
    /// start.
    pub async fn start(self) -> anyhow::Result<RunningWorker<P>> {
        let Self {
            processor,
            channel,
            transport,
            lifecycle,
            config,
        } = self;
        let service_type = processor.service_type();
        let http_shutdown = CancellationToken::new();

        let health = match config.http_addr {
            Some(addr) => {
                let state = HealthState::new(Arc::clone(&lifecycle), Arc::clone(&transport), service_type);
                let server = HealthServer::bind(addr, state).await?;
                let local = server.local_addr()?;
                let task = tokio::spawn(server.serve(http_shutdown.clone().cancelled_owned()));
                Some((local, task))
            }
            None => None,
        };

        let source = NodeHeartbeatSource::new(Arc::clone(&lifecycle), Arc::clone(&transport))
            .with_processor(Arc::clone(&processor) as Arc<dyn RequestProcessor>);
        let heart = Arc::new(Heart::new(
            channel.clone(),
            &config.heartbeat,
            service_type,
            Arc::new(source),
        ));
        let instance_id = heart.instance_id().to_string();
        let beating = Arc::clone(&heart).start(&config.heartbeat);

        let cancel = CancellationToken::new();
        let unavailable = Arc::new(UnavailableHandler::from_config(&config.action, &lifecycle));
        let worker = RequestWorker::new(
            processor,
            channel.clone(),
            transport,
            Arc::clone(&lifecycle),
            &config.worker,
        )
        .with_unavailable_handler(unavailable)
        .with_cancel(cancel.clone());
        let handoff = Arc::new(Handoff::new(worker, config.worker.concurrency));
        let listener = channel
            .start_listener(Some(&config.worker.request_address), Arc::clone(&handoff))
            .context("starting request listener")?;

        // Draining for any reason stops consumption; shutdown does the rest.
        let stop = listener.stop_token();
        let watched = Arc::clone(&lifecycle);
        tokio::spawn(async move {
            tokio::select! {
                () = watched.drained() => {
                    info!("drain started, request listener stopping");
                    stop.cancel();
                }
                () = stop.cancelled() => {}
            }
        });

        lifecycle.set_ready();
        info!(
            service = service_type,
            instance = %instance_id,
            requests = %config.worker.request_address,
            concurrency = config.worker.concurrency,
            "worker ready"
        );

        Ok(RunningWorker {
            lifecycle,
            listener,
            handoff,
            heart: beating,
            health,
            http_shutdown,
            cancel,
            instance_id,
            drain_timeout: config.drain_timeout,
        })
    }
}

impl<P: RequestProcessor> std::fmt::Debug for WorkerNode<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerNode")
            .field("service", &self.processor.service_type())
            .field("channel", &self.channel)
            .field("transport", &self.transport.name())
            .finish_non_exhaustive()
    }
}

/// A started worker node.
pub struct RunningWorker<P: RequestProcessor> {
    lifecycle: Arc<NodeLifecycle>,
    listener: ListenerHandle,
    handoff: Arc<Handoff<RequestWorker<P>>>,
    heart: PeriodicHandle,
    health: Option<(SocketAddr, JoinHandle<anyhow::Result<()>>)>,
    http_shutdown: CancellationToken,
    cancel: CancellationToken,
    instance_id: String,
    drain_timeout: Duration,
}

impl<P: RequestProcessor> RunningWorker<P> {
    /// Lifecycle of the running node.
    #[must_use]
    pub fn lifecycle(&self) -> &Arc<NodeLifecycle> {
        &self.lifecycle
    }

    /// Identity reported in heartbeats.
    #[must_use]
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Bound address of the health endpoint, if enabled.
    #[must_use]
    pub fn health_addr(&self) -> Option<SocketAddr> {
        self.health.as_ref().map(|(addr, _)| *addr)
    }

    /// Resolves when something (a signal handler, a drain action) starts
    /// draining the node.
    pub async fn drained(&self) {
        self.lifecycle.drained().await;
    }

    /// Drains and stops the node.
    ///
    /// Returns `true` if in-flight work finished within the drain timeout;
    /// otherwise processing is cancelled.
    pub async fn shutdown(self) -> bool {
        let Self {
            lifecycle,
            listener,
            handoff,
            mut heart,
            health,
            http_shutdown,
            cancel,
            instance_id,
            drain_timeout,
        } = self;

        lifecycle.begin_drain();

        // The listener may be parked on the handoff until a task frees up.
        let finished = tokio::time::timeout(drain_timeout, async {
            listener.stop().await;
            if let Ok(handoff) = Arc::try_unwrap(handoff) {
                handoff.shutdown().await;
            }
        })
        .await
        .is_ok();
        if !finished {
            warn!(
                in_flight = lifecycle.in_flight_count(),
                timeout_ms = u64::try_from(drain_timeout.as_millis()).unwrap_or(u64::MAX),
                "drain timed out, cancelling processing"
            );
            cancel.cancel();
        }
        let idle = lifecycle.wait_for_idle(Duration::ZERO).await;

        heart.stop().await;
        http_shutdown.cancel();
        if let Some((_, task)) = health {
            match task.await {
                Ok(Err(e)) => warn!(error = %e, "health endpoint failed"),
                Err(e) => warn!(error = %e, "health endpoint task panicked"),
                Ok(Ok(())) => {}
            }
        }
        info!(instance = %instance_id, idle, "worker stopped");
        finished && idle
    }
}

impl<P: RequestProcessor> std::fmt::Debug for RunningWorker<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunningWorker")
            .field("instance_id", &self.instance_id)
            .field("state", &self.lifecycle.state())
            .field("listener", &self.listener)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Requester node
// ---------------------------------------------------------------------------

/// A dispatcher with its reply listener and eviction sweep running.
#[derive(Debug)]
pub struct RequesterNode {
    dispatcher: Dispatcher,
    listener: ListenerHandle,
    sweeper: PeriodicHandle,
}

impl RequesterNode {
    /// # Errors
    ///
    /// Returns `MessagingError` if the reply listener cannot start.
    pub fn start(
        channel: MessageChannel,
        transport: Arc<dyn ContentTransport>,
        config: DispatchConfig,
    ) -> Result<Self, MessagingError> {
        let dispatcher = Dispatcher::new(channel, transport, config);
        let listener = dispatcher.listen()?;
        let sweeper = dispatcher.start_sweeper();
        info!(replies = %dispatcher.config().reply_address, "requester ready");
        Ok(Self {
            dispatcher,
            listener,
            sweeper,
        })
    }

    /// Connects the configured broker and transports, then starts.
    ///
    /// # Errors
    ///
    /// Fails if the broker is unreachable or the listener cannot start.
    pub async fn connect(config: &NodeConfig) -> anyhow::Result<Self> {
        let broker = channel::connect(&config.channel.broker_url)
            .await
            .with_context(|| format!("connecting to {}", config.channel.broker_url))?;
        let channel = MessageChannel::new(broker, &config.channel);
        let transport = build_transport(&config.transport)?;
        Ok(Self::start(channel, transport, config.dispatch.clone())?)
    }

    /// Dispatcher for submitting and tracking requests.
    #[must_use]
    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Stops the reply listener and the sweep. Outstanding entries are
    /// dropped with the tracker.
    pub async fn shutdown(self) {
        let Self {
            dispatcher,
            listener,
            mut sweeper,
        } = self;
        listener.stop().await;
        sweeper.stop().await;
        info!(pending = dispatcher.tracker().len(), "requester stopped");
    }
}
