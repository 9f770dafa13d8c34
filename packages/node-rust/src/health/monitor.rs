//! Heartbeat collection.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use courier_core::{ClockSource, Headers, Heartbeat, Message, SystemClock};
use dashmap::DashMap;
use metrics::counter;
use tracing::{debug, warn};

use crate::channel::MessageHandler;
use crate::telemetry::metric;

/// Service type and instance recorded for messages that are not heartbeats.
pub const UNKNOWN: &str = "unknown";
/// Detail key holding the description of an unexpected message.
pub const UNEXPECTED_PAYLOAD: &str = "unexpectedPayload";

/// Persists received heartbeats.
#[async_trait]
pub trait HeartbeatDao: Send + Sync + 'static {
    async fn save(&self, heartbeat: Heartbeat) -> anyhow::Result<()>;

    /// Latest heartbeat of every instance seen.
    async fn latest(&self) -> anyhow::Result<Vec<Heartbeat>>;
}

#[derive(Debug)]
struct InstanceRecord {
    latest: Heartbeat,
    count: u64,
}

/// Keeps the latest heartbeat per instance and how many were received.
#[derive(Debug, Default)]
pub struct InMemoryHeartbeatDao {
    instances: DashMap<(String, String), InstanceRecord>,
}

impl InMemoryHeartbeatDao {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Heartbeats received from `instance_id` of `service_type`.
    #[must_use]
    pub fn count(&self, service_type: &str, instance_id: &str) -> u64 {
        self.instances
            .get(&(service_type.to_string(), instance_id.to_string()))
            .map_or(0, |r| r.count)
    }

    /// Latest heartbeat from `instance_id` of `service_type`.
    #[must_use]
    pub fn get(&self, service_type: &str, instance_id: &str) -> Option<Heartbeat> {
        self.instances
            .get(&(service_type.to_string(), instance_id.to_string()))
            .map(|r| r.latest.clone())
    }
}

#[async_trait]
impl HeartbeatDao for InMemoryHeartbeatDao {
    async fn save(&self, heartbeat: Heartbeat) -> anyhow::Result<()> {
        let key = (heartbeat.service_type.clone(), heartbeat.instance_id.clone());
        let mut entry = self.instances.entry(key).or_insert_with(|| InstanceRecord {
            latest: heartbeat.clone(),
            count: 0,
        });
        entry.count += 1;
        // Out-of-order deliveries never replace a newer beat.
        if heartbeat.timestamp >= entry.latest.timestamp {
            entry.latest = heartbeat;
        }
        Ok(())
    }

    async fn latest(&self) -> anyhow::Result<Vec<Heartbeat>> {
        let mut beats: Vec<Heartbeat> = self.instances.iter().map(|r| r.latest.clone()).collect();
        beats.sort_by(|a, b| {
            (&a.service_type, &a.instance_id).cmp(&(&b.service_type, &b.instance_id))
        });
        Ok(beats)
    }
}

/// Listens on the heartbeat topic and records what it hears.
pub struct HeartbeatMonitor {
    dao: Arc<dyn HeartbeatDao>,
    clock: Arc<dyn ClockSource>,
}

impl HeartbeatMonitor {
    /// Creates a monitor persisting into `dao`.
    pub fn new(dao: Arc<dyn HeartbeatDao>) -> Self {
        Self {
            dao,
            clock: Arc::new(SystemClock),
        }
    }

    /// Clock stamped onto placeholder heartbeats.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn ClockSource>) -> Self {
        self.clock = clock;
        self
    }

    /// Turns any message into the heartbeat to persist.
    #[must_use]
    pub fn to_heartbeat(&self, message: Message) -> Heartbeat {
        match message {
            Message::Heartbeat(heartbeat) => heartbeat,
            other => Heartbeat {
                service_type: UNKNOWN.to_string(),
                instance_id: UNKNOWN.to_string(),
                timestamp: self.clock.now_millis(),
                available: false,
                details: BTreeMap::from([(UNEXPECTED_PAYLOAD.to_string(), other.describe())]),
            },
        }
    }

    /// Instances whose latest beat is older than `max_silence` at `now_ms`.
    ///
    /// # Errors
    ///
    /// Propagates storage failures.
    pub async fn stale_instances(
        &self,
        now_ms: i64,
        max_silence: Duration,
    ) -> anyhow::Result<Vec<Heartbeat>> {
        let window = i64::try_from(max_silence.as_millis()).unwrap_or(i64::MAX);
        Ok(self
            .dao
            .latest()
            .await?
            .into_iter()
            .filter(|hb| now_ms.saturating_sub(hb.timestamp) > window)
            .collect())
    }
}

impl std::fmt::Debug for HeartbeatMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeartbeatMonitor").finish_non_exhaustive()
    }
}

#[async_trait]
impl MessageHandler for HeartbeatMonitor {
    type Body = Message;

    async fn on_receive(&self, body: Message, _headers: &Headers) {
        let heartbeat = self.to_heartbeat(body);
        if heartbeat.service_type == UNKNOWN {
            counter!(metric::MESSAGES_DROPPED, "reason" => "not-heartbeat").increment(1);
            warn!(
                payload = heartbeat.details.get(UNEXPECTED_PAYLOAD).map(String::as_str),
                "non-heartbeat message on heartbeat address"
            );
        } else {
            debug!(
                service = %heartbeat.service_type,
                instance = %heartbeat.instance_id,
                available = heartbeat.available,
                timestamp = heartbeat.timestamp,
                "heartbeat received"
            );
        }
        if let Err(e) = self.dao.save(heartbeat).await {
            warn!(error = %e, "failed to persist heartbeat");
        }
    }
}

#[cfg(test)]
mod tests {
    use courier_core::{ManualClock, Reply};

    use super::*;

    fn beat(instance: &str, timestamp: i64) -> Heartbeat {
        Heartbeat {
            service_type: "content-hash".to_string(),
            instance_id: instance.to_string(),
            timestamp,
            available: true,
            details: BTreeMap::new(),
        }
    }

    fn monitor(dao: &Arc<InMemoryHeartbeatDao>) -> HeartbeatMonitor {
        HeartbeatMonitor::new(Arc::clone(dao) as Arc<dyn HeartbeatDao>)
            .with_clock(Arc::new(ManualClock::new(42_000)))
    }

    #[tokio::test]
    async fn keeps_latest_beat_and_count() {
        let dao = Arc::new(InMemoryHeartbeatDao::new());
        let monitor = monitor(&dao);
        for ts in [1_000, 3_000, 2_000] {
            monitor
                .on_receive(Message::Heartbeat(beat("a", ts)), &Headers::new())
                .await;
        }
        assert_eq!(dao.count("content-hash", "a"), 3);
        assert_eq!(dao.get("content-hash", "a").unwrap().timestamp, 3_000);
    }

    #[tokio::test]
    async fn other_messages_become_placeholders() {
        let dao = Arc::new(InMemoryHeartbeatDao::new());
        let monitor = monitor(&dao);
        let reply = Reply::pending("req-9");
        let description = Message::Reply(reply.clone()).describe();

        monitor.on_receive(Message::Reply(reply), &Headers::new()).await;

        let placeholder = dao.get(UNKNOWN, UNKNOWN).unwrap();
        assert!(!placeholder.available);
        assert_eq!(placeholder.timestamp, 42_000);
        assert_eq!(placeholder.details[UNEXPECTED_PAYLOAD], description);
        assert_eq!(dao.count(UNKNOWN, UNKNOWN), 1);
    }

    #[tokio::test]
    async fn stale_instances_exceed_the_window() {
        let dao = Arc::new(InMemoryHeartbeatDao::new());
        let monitor = monitor(&dao);
        dao.save(beat("fresh", 9_000)).await.unwrap();
        dao.save(beat("edge", 5_000)).await.unwrap();
        dao.save(beat("silent", 1_000)).await.unwrap();

        let stale = monitor
            .stale_instances(10_000, Duration::from_secs(5))
            .await
            .unwrap();
        let ids: Vec<_> = stale.iter().map(|h| h.instance_id.as_str()).collect();
        assert_eq!(ids, vec!["silent"]);
    }

    #[tokio::test]
    async fn latest_is_sorted() {
        let dao = InMemoryHeartbeatDao::new();
        dao.save(beat("b", 1)).await.unwrap();
        dao.save(beat("a", 1)).await.unwrap();
        let ids: Vec<_> = dao
            .latest()
            .await
            .unwrap()
            .into_iter()
            .map(|h| h.instance_id)
            .collect();
        assert_eq!(ids, vec!["a", "b"]);
    }
}
