//! Heartbeat emission.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Context as _;
use async_trait::async_trait;
use courier_core::{Address, ClockSource, Heartbeat, MonotonicClock};
use metrics::counter;
use tracing::debug;

use crate::channel::MessageChannel;
use crate::config::HeartbeatConfig;
use crate::dispatch::RequestProcessor;
use crate::lifecycle::NodeLifecycle;
use crate::periodic::{Periodic, PeriodicHandle, Schedule};
use crate::telemetry::metric;
use crate::transport::ContentTransport;

/// What one heartbeat reports.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeartbeatReport {
    pub available: bool,
    pub details: BTreeMap<String, String>,
}

/// Supplies the contents of each heartbeat.
#[async_trait]
pub trait HeartbeatSource: Send + Sync + 'static {
    async fn gather(&self) -> anyhow::Result<HeartbeatReport>;
}

/// Reports lifecycle state, in-flight work, transport reachability, and the
/// processor's dependency check.
pub struct NodeHeartbeatSource {
    lifecycle: Arc<NodeLifecycle>,
    transport: Arc<dyn ContentTransport>,
    processor: Option<Arc<dyn RequestProcessor>>,
}

impl NodeHeartbeatSource {
    /// Creates a source reporting `lifecycle` and `transport` state.
    pub fn new(lifecycle: Arc<NodeLifecycle>, transport: Arc<dyn ContentTransport>) -> Self {
        Self {
            lifecycle,
            transport,
            processor: None,
        }
    }

    /// Adds the processor's dependency check to every report.
    #[must_use]
    pub fn with_processor(mut self, processor: Arc<dyn RequestProcessor>) -> Self {
        self.processor = Some(processor);
        self
    }
}

#[async_trait]
impl HeartbeatSource for NodeHeartbeatSource {
    async fn gather(&self) -> anyhow::Result<HeartbeatReport> {
        let state = self.lifecycle.state();
        let transport_up = self.transport.is_available().await;
        let mut details = BTreeMap::new();
        details.insert("state".to_string(), state.as_str().to_string());
        details.insert(
            "inFlight".to_string(),
            self.lifecycle.in_flight_count().to_string(),
        );
        details.insert("transportAvailable".to_string(), transport_up.to_string());

        let mut available = state.accepts_work() && transport_up;
        if let Some(processor) = &self.processor {
            if let Err(unavailable) = processor.check_available().await {
                details.insert("unavailable".to_string(), unavailable.to_string());
                available = false;
            }
        }
        Ok(HeartbeatReport { available, details })
    }
}

/// Sends heartbeats for one service instance.
pub struct Heart {
    channel: MessageChannel,
    address: Address,
    service_type: String,
    instance_id: String,
    clock: MonotonicClock,
    source: Arc<dyn HeartbeatSource>,
}

impl Heart {
    /// Creates a heart publishing to the configured heartbeat address.
    pub fn new(
        channel: MessageChannel,
        config: &HeartbeatConfig,
        service_type: impl Into<String>,
        source: Arc<dyn HeartbeatSource>,
    ) -> Self {
        Self {
            channel,
            address: config.address.clone(),
            service_type: service_type.into(),
            instance_id: config
                .instance_id
                .clone()
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            clock: MonotonicClock::system(),
            source,
        }
    }

    /// Replaces the timestamp source.
    #[must_use]
    pub fn with_clock(mut self, clock: MonotonicClock) -> Self {
        self.clock = clock;
        self
    }

    /// Identity reported in every heartbeat.
    #[must_use]
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Gathers and sends one heartbeat.
    ///
    /// # Errors
    ///
    /// Fails if the source cannot gather a report or the send fails.
    pub async fn beat(&self) -> anyhow::Result<Heartbeat> {
        let report = self
            .source
            .gather()
            .await
            .context("gathering heartbeat details")?;
        let heartbeat = Heartbeat {
            service_type: self.service_type.clone(),
            instance_id: self.instance_id.clone(),
            timestamp: self.clock.now_millis(),
            available: report.available,
            details: report.details,
        };
        self.channel
            .send(heartbeat.clone(), Some(&self.address), None)
            .await
            .with_context(|| format!("sending heartbeat to {}", self.address))?;
        counter!(metric::HEARTBEATS_SENT).increment(1);
        debug!(
            instance = %self.instance_id,
            timestamp = heartbeat.timestamp,
            available = heartbeat.available,
            "heartbeat sent"
        );
        Ok(heartbeat)
    }

    /// Beats after `initial_delay`, then every `period`. The first failure
    /// cancels the schedule.
    pub fn start(self: Arc<Self>, config: &HeartbeatConfig) -> PeriodicHandle {
        PeriodicHandle::spawn(
            HeartTask(self),
            Schedule::every(config.period)
                .after(config.initial_delay)
                .stop_on_error(),
        )
    }
}

impl std::fmt::Debug for Heart {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Heart")
            .field("address", &self.address)
            .field("service_type", &self.service_type)
            .field("instance_id", &self.instance_id)
            .finish_non_exhaustive()
    }
}

struct HeartTask(Arc<Heart>);

#[async_trait]
impl Periodic for HeartTask {
    fn name(&self) -> &'static str {
        "heart"
    }

    async fn tick(&mut self) -> anyhow::Result<()> {
        self.0.beat().await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    use courier_core::{Codec, ManualClock, Message};

    use super::*;
    use crate::channel::{BrokerTransport, MemoryBroker};
    use crate::config::ChannelConfig;
    use crate::transport::{MemoryObjectStore, ObjectStorageTransport};

    struct Fixed {
        fail: AtomicBool,
    }

    #[async_trait]
    impl HeartbeatSource for Fixed {
        async fn gather(&self) -> anyhow::Result<HeartbeatReport> {
            if self.fail.load(Ordering::SeqCst) {
                anyhow::bail!("probe exploded");
            }
            Ok(HeartbeatReport {
                available: true,
                details: BTreeMap::from([("k".to_string(), "v".to_string())]),
            })
        }
    }

    fn config() -> HeartbeatConfig {
        HeartbeatConfig {
            instance_id: Some("worker-1".to_string()),
            ..HeartbeatConfig::default()
        }
    }

    fn heart(broker: &Arc<MemoryBroker>, source: Arc<dyn HeartbeatSource>) -> Heart {
        let channel = MessageChannel::new(
            Arc::clone(broker) as Arc<dyn BrokerTransport>,
            &ChannelConfig::default(),
        );
        Heart::new(channel, &config(), "content-hash", source)
    }

    #[tokio::test]
    async fn beat_publishes_to_topic() {
        let broker = Arc::new(MemoryBroker::new());
        let mut subscriber = broker.consume(&config().address, 10).await.unwrap();
        let source = Arc::new(Fixed {
            fail: AtomicBool::new(false),
        });
        let heart = heart(&broker, source);

        let sent = heart.beat().await.unwrap();
        assert_eq!(sent.instance_id, "worker-1");
        assert_eq!(sent.details["k"], "v");

        let delivery = subscriber.next().await.unwrap();
        let Message::Heartbeat(received) = Codec::Json.decode(&delivery.envelope.body).unwrap() else {
            panic!("expected heartbeat");
        };
        assert_eq!(received, sent);
        delivery.acker.ack();
    }

    #[tokio::test]
    async fn timestamps_never_decrease() {
        let broker = Arc::new(MemoryBroker::new());
        let manual = Arc::new(ManualClock::new(10_000));
        let heart = heart(
            &broker,
            Arc::new(Fixed {
                fail: AtomicBool::new(false),
            }),
        )
        .with_clock(MonotonicClock::new(manual.clone()));

        let first = heart.beat().await.unwrap().timestamp;
        manual.set(5_000);
        let second = heart.beat().await.unwrap().timestamp;
        manual.set(12_000);
        let third = heart.beat().await.unwrap().timestamp;
        assert_eq!((first, second, third), (10_000, 10_000, 12_000));
    }

    #[tokio::test(start_paused = true)]
    async fn schedule_beats_each_period_and_stops_on_failure() {
        let broker = Arc::new(MemoryBroker::new());
        let source = Arc::new(Fixed {
            fail: AtomicBool::new(false),
        });
        let mut subscriber = broker.consume(&config().address, 100).await.unwrap();
        let heart = Arc::new(heart(&broker, source.clone()));
        let handle = heart.start(&config());

        // initial delay 1s, then every 5s: beats at 1, 6, 11
        tokio::time::sleep(Duration::from_millis(11_500)).await;
        let mut stamps = Vec::new();
        for _ in 0..3 {
            let delivery = subscriber.next().await.unwrap();
            if let Message::Heartbeat(hb) = Codec::Json.decode(&delivery.envelope.body).unwrap() {
                stamps.push(hb.timestamp);
            }
            delivery.acker.ack();
        }
        assert!(stamps.windows(2).all(|w| w[0] <= w[1]));

        source.fail.store(true, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(handle.is_finished());
    }

    #[tokio::test]
    async fn node_source_reports_unavailable_while_draining() {
        let lifecycle = Arc::new(NodeLifecycle::new());
        let transport = Arc::new(ObjectStorageTransport::new(
            Arc::new(MemoryObjectStore::new()),
            "courier",
            Duration::from_millis(10),
        ));
        let source = NodeHeartbeatSource::new(Arc::clone(&lifecycle), transport);

        lifecycle.set_ready();
        let ready = source.gather().await.unwrap();
        assert!(ready.available);
        assert_eq!(ready.details["state"], "ready");

        lifecycle.begin_drain();
        let draining = source.gather().await.unwrap();
        assert!(!draining.available);
        assert_eq!(draining.details["state"], "draining");
    }
}
