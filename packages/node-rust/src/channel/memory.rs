//! In-process broker.
//!
//! Queues hand each message to one competing consumer; topics copy each
//! message into a private mailbox per subscriber. A delivery whose
//! acknowledger is dropped without `ack` goes back to the front of its
//! mailbox. The TCP [`BrokerServer`](super::broker::BrokerServer) fronts one
//! of these.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use async_trait::async_trait;
use courier_core::{Address, Headers};
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::{Notify, Semaphore};

use super::{Acknowledger, BrokerTransport, Consumer, Delivery, Envelope, Settle};
use crate::error::MessagingError;

static NAMED: OnceLock<DashMap<String, Arc<MemoryBroker>>> = OnceLock::new();

// ---------------------------------------------------------------------------
// Mailbox
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Mailbox {
    pending: Mutex<VecDeque<Envelope>>,
    notify: Notify,
    closed: AtomicBool,
}

impl Mailbox {
    fn push_back(&self, envelope: Envelope) {
        self.pending.lock().push_back(envelope);
        self.notify.notify_one();
    }

    fn push_front(&self, envelope: Envelope) {
        self.pending.lock().push_front(envelope);
        self.notify.notify_one();
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }
}

// ---------------------------------------------------------------------------
// MemoryBroker
// ---------------------------------------------------------------------------

/// In-process broker with queue and topic semantics.
pub struct MemoryBroker {
    queues: DashMap<String, Arc<Mailbox>>,
    topics: DashMap<String, Vec<Weak<Mailbox>>>,
    carries_headers: bool,
    closed: AtomicBool,
}

impl MemoryBroker {
    /// Creates an empty broker.
    #[must_use]
    pub fn new() -> Self {
        Self {
            queues: DashMap::new(),
            topics: DashMap::new(),
            carries_headers: true,
            closed: AtomicBool::new(false),
        }
    }

    /// A broker that drops headers on publish, like transports without
    /// header support. Reply addresses then travel in the request body.
    #[must_use]
    pub fn without_headers() -> Self {
        Self {
            carries_headers: false,
            ..Self::new()
        }
    }

    /// Process-wide broker registered under `name` (`memory://<name>`).
    ///
    /// A closed broker is replaced by a fresh one on the next lookup.
    #[must_use]
    pub fn named(name: &str) -> Arc<Self> {
        let registry = NAMED.get_or_init(DashMap::new);
        let mut entry = registry
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Self::new()));
        if entry.closed.load(Ordering::SeqCst) {
            *entry = Arc::new(Self::new());
        }
        Arc::clone(&entry)
    }

    /// Messages waiting on a queue, excluding unsettled deliveries.
    #[must_use]
    pub fn queue_depth(&self, name: &str) -> usize {
        self.queues
            .get(name)
            .map_or(0, |mailbox| mailbox.pending.lock().len())
    }

    fn queue(&self, name: &str) -> Arc<Mailbox> {
        Arc::clone(&self.queues.entry(name.to_string()).or_default())
    }

    fn subscribe_topic(&self, name: &str) -> Arc<Mailbox> {
        let mailbox = Arc::new(Mailbox::default());
        self.topics
            .entry(name.to_string())
            .or_default()
            .push(Arc::downgrade(&mailbox));
        mailbox
    }

    fn publish_topic(&self, name: &str, envelope: Envelope) {
        if let Some(mut subscribers) = self.topics.get_mut(name) {
            subscribers.retain(|weak| match weak.upgrade() {
                Some(mailbox) => {
                    mailbox.push_back(envelope.clone());
                    true
                }
                None => false,
            });
        }
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BrokerTransport for MemoryBroker {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn publish(&self, address: &Address, mut envelope: Envelope) -> Result<(), MessagingError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(MessagingError::Closed);
        }
        if !self.carries_headers {
            envelope.headers = Headers::new();
        }
        if address.is_topic() {
            self.publish_topic(&address.name, envelope);
        } else {
            self.queue(&address.name).push_back(envelope);
        }
        Ok(())
    }

    async fn consume(
        &self,
        address: &Address,
        prefetch: usize,
    ) -> Result<Box<dyn Consumer>, MessagingError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(MessagingError::Closed);
        }
        let mailbox = if address.is_topic() {
            self.subscribe_topic(&address.name)
        } else {
            self.queue(&address.name)
        };
        Ok(Box::new(MemoryConsumer {
            mailbox,
            credit: Arc::new(Semaphore::new(prefetch.max(1))),
        }))
    }

    fn supports_headers(&self) -> bool {
        self.carries_headers
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        for mailbox in &self.queues {
            mailbox.close();
        }
        for subscribers in &self.topics {
            for mailbox in subscribers.iter().filter_map(Weak::upgrade) {
                mailbox.close();
            }
        }
    }
}

// ---------------------------------------------------------------------------
// MemoryConsumer
// ---------------------------------------------------------------------------

struct MemoryConsumer {
    mailbox: Arc<Mailbox>,
    credit: Arc<Semaphore>,
}

#[async_trait]
impl Consumer for MemoryConsumer {
    async fn next(&mut self) -> Option<Delivery> {
        let permit = Arc::clone(&self.credit).acquire_owned().await.ok()?;
        loop {
            let notified = self.mailbox.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.mailbox.closed.load(Ordering::SeqCst) {
                return None;
            }
            let next = self.mailbox.pending.lock().pop_front();
            if let Some(envelope) = next {
                let settle = MemorySettle {
                    mailbox: Arc::clone(&self.mailbox),
                    envelope: envelope.clone(),
                };
                return Some(Delivery {
                    envelope,
                    acker: Acknowledger::new(Box::new(settle), Some(permit)),
                });
            }
            notified.await;
        }
    }
}

struct MemorySettle {
    mailbox: Arc<Mailbox>,
    envelope: Envelope,
}

impl Settle for MemorySettle {
    fn ack(self: Box<Self>) {}

    fn requeue(self: Box<Self>) {
        let Self { mailbox, envelope } = *self;
        if !mailbox.closed.load(Ordering::SeqCst) {
            mailbox.push_front(envelope);
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::Bytes;

    use super::*;

    fn envelope(body: &'static str) -> Envelope {
        Envelope::new(Headers::new().with("k", "v"), body.as_bytes())
    }

    async fn next_within(consumer: &mut Box<dyn Consumer>, ms: u64) -> Option<Delivery> {
        tokio::time::timeout(Duration::from_millis(ms), consumer.next())
            .await
            .ok()
            .flatten()
    }

    #[tokio::test]
    async fn queue_delivers_each_message_once() {
        let broker = MemoryBroker::new();
        let address = Address::queue("work");
        let mut a = broker.consume(&address, 10).await.unwrap();
        let mut b = broker.consume(&address, 10).await.unwrap();

        broker.publish(&address, envelope("one")).await.unwrap();
        broker.publish(&address, envelope("two")).await.unwrap();

        let mut bodies = Vec::new();
        for consumer in [&mut a, &mut b] {
            while let Some(delivery) = next_within(consumer, 20).await {
                bodies.push(delivery.envelope.body.clone());
                delivery.acker.ack();
            }
        }
        bodies.sort();
        assert_eq!(bodies, vec![Bytes::from("one"), Bytes::from("two")]);
        assert_eq!(broker.queue_depth("work"), 0);
    }

    #[tokio::test]
    async fn topic_fans_out_to_every_subscriber() {
        let broker = MemoryBroker::new();
        let address = Address::topic("beats");
        let mut a = broker.consume(&address, 10).await.unwrap();
        let mut b = broker.consume(&address, 10).await.unwrap();

        broker.publish(&address, envelope("beat")).await.unwrap();

        for consumer in [&mut a, &mut b] {
            let delivery = next_within(consumer, 100).await.unwrap();
            assert_eq!(delivery.envelope.body, Bytes::from("beat"));
            assert_eq!(delivery.envelope.headers.get("k"), Some("v"));
            delivery.acker.ack();
        }
    }

    #[tokio::test]
    async fn topic_without_subscribers_discards() {
        let broker = MemoryBroker::new();
        broker
            .publish(&Address::topic("nobody"), envelope("lost"))
            .await
            .unwrap();
        let mut late = broker.consume(&Address::topic("nobody"), 1).await.unwrap();
        assert!(next_within(&mut late, 20).await.is_none());
    }

    #[tokio::test]
    async fn dropped_delivery_is_requeued() {
        let broker = MemoryBroker::new();
        let address = Address::queue("retry");
        let mut consumer = broker.consume(&address, 1).await.unwrap();
        broker.publish(&address, envelope("again")).await.unwrap();

        let first = next_within(&mut consumer, 100).await.unwrap();
        drop(first);

        let second = next_within(&mut consumer, 100).await.unwrap();
        assert_eq!(second.envelope.body, Bytes::from("again"));
        second.acker.ack();
        assert!(next_within(&mut consumer, 20).await.is_none());
    }

    #[tokio::test]
    async fn prefetch_limits_unsettled_deliveries() {
        let broker = MemoryBroker::new();
        let address = Address::queue("credit");
        let mut consumer = broker.consume(&address, 2).await.unwrap();
        for body in ["a", "b", "c"] {
            broker.publish(&address, envelope(body)).await.unwrap();
        }

        let first = next_within(&mut consumer, 100).await.unwrap();
        let second = next_within(&mut consumer, 100).await.unwrap();
        assert!(next_within(&mut consumer, 20).await.is_none());

        first.acker.ack();
        let third = next_within(&mut consumer, 100).await.unwrap();
        assert_eq!(third.envelope.body, Bytes::from("c"));
        second.acker.ack();
        third.acker.ack();
    }

    #[tokio::test]
    async fn headerless_broker_strips_headers() {
        let broker = MemoryBroker::without_headers();
        assert!(!broker.supports_headers());
        let address = Address::queue("plain");
        let mut consumer = broker.consume(&address, 1).await.unwrap();
        broker.publish(&address, envelope("x")).await.unwrap();

        let delivery = next_within(&mut consumer, 100).await.unwrap();
        assert!(delivery.envelope.headers.is_empty());
        delivery.acker.ack();
    }

    #[tokio::test]
    async fn close_ends_consumers_and_rejects_publish() {
        let broker = MemoryBroker::new();
        let address = Address::queue("closing");
        let mut consumer = broker.consume(&address, 1).await.unwrap();

        broker.close().await;
        assert!(consumer.next().await.is_none());
        assert!(matches!(
            broker.publish(&address, envelope("late")).await,
            Err(MessagingError::Closed)
        ));
    }

    #[tokio::test]
    async fn named_brokers_are_shared_until_closed() {
        let a = MemoryBroker::named("memory-test-shared");
        let b = MemoryBroker::named("memory-test-shared");
        assert!(Arc::ptr_eq(&a, &b));

        a.close().await;
        let c = MemoryBroker::named("memory-test-shared");
        assert!(!Arc::ptr_eq(&a, &c));
    }
}
