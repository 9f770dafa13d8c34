//! Broker-facing message channel.
//!
//! [`BrokerTransport`] is the wire adapter seam (in-memory broker, framed TCP
//! client). [`MessageChannel`] adds the body codec, a default address, and
//! supervised listeners on top of any transport.

pub mod broker;
pub mod connect;
pub mod frame;
pub mod listener;
pub mod memory;
pub mod tcp;

use async_trait::async_trait;
use bytes::Bytes;
use courier_core::{Address, Headers};
use tokio::sync::OwnedSemaphorePermit;

use crate::error::MessagingError;

pub use connect::connect;
pub use listener::{ListenerHandle, MessageChannel, MessageHandler};
pub use memory::MemoryBroker;

// ---------------------------------------------------------------------------
// Envelope / Delivery
// ---------------------------------------------------------------------------

/// Headers plus encoded body, as handed to and stored by a broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub headers: Headers,
    pub body: Bytes,
}

impl Envelope {
    /// Creates an envelope from headers and an encoded body.
    #[must_use]
    pub fn new(headers: Headers, body: impl Into<Bytes>) -> Self {
        Self {
            headers,
            body: body.into(),
        }
    }
}

/// Broker-specific settlement of one delivery.
pub trait Settle: Send + Sync + 'static {
    /// Removes the delivery from the broker.
    fn ack(self: Box<Self>);
    /// Returns the delivery to its queue for redelivery.
    fn requeue(self: Box<Self>);
}

/// Settles a delivery exactly once.
///
/// Dropping an unsettled acknowledger requeues the delivery. The consumer's
/// credit permit travels with the acknowledger and is released on settlement.
pub struct Acknowledger {
    settle: Option<Box<dyn Settle>>,
    _credit: Option<OwnedSemaphorePermit>,
}

impl Acknowledger {
    /// Wraps a broker settlement, holding `credit` until settled.
    #[must_use]
    pub fn new(settle: Box<dyn Settle>, credit: Option<OwnedSemaphorePermit>) -> Self {
        Self {
            settle: Some(settle),
            _credit: credit,
        }
    }

    /// Removes the delivery from the broker.
    pub fn ack(mut self) {
        if let Some(settle) = self.settle.take() {
            settle.ack();
        }
    }

    /// Returns the delivery for redelivery.
    pub fn requeue(mut self) {
        if let Some(settle) = self.settle.take() {
            settle.requeue();
        }
    }
}

impl Drop for Acknowledger {
    fn drop(&mut self) {
        if let Some(settle) = self.settle.take() {
            settle.requeue();
        }
    }
}

impl std::fmt::Debug for Acknowledger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Acknowledger")
            .field("settled", &self.settle.is_none())
            .finish_non_exhaustive()
    }
}

/// One message received from a consumer.
#[derive(Debug)]
pub struct Delivery {
    pub envelope: Envelope,
    pub acker: Acknowledger,
}

// ---------------------------------------------------------------------------
// Transport traits
// ---------------------------------------------------------------------------

/// Stream of deliveries for one subscription.
#[async_trait]
pub trait Consumer: Send {
    /// Next delivery, or `None` once the subscription has ended.
    async fn next(&mut self) -> Option<Delivery>;
}

/// Wire adapter between a [`MessageChannel`] and a broker.
#[async_trait]
pub trait BrokerTransport: Send + Sync + 'static {
    /// Short binding name for logs (`memory`, `tcp`).
    fn name(&self) -> &'static str;

    /// Publishes one message.
    async fn publish(&self, address: &Address, envelope: Envelope) -> Result<(), MessagingError>;

    /// Subscribes to `address` with at most `prefetch` unsettled deliveries.
    async fn consume(
        &self,
        address: &Address,
        prefetch: usize,
    ) -> Result<Box<dyn Consumer>, MessagingError>;

    /// Whether published headers reach consumers.
    fn supports_headers(&self) -> bool;

    /// Closes the transport; open consumers end.
    async fn close(&self);
}

/// When a listener acknowledges a delivery.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AckMode {
    /// After the handler returns: at-least-once.
    #[default]
    AfterHandler,
    /// Before the handler runs: at-most-once.
    BeforeHandler,
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    use super::*;

    #[derive(Default)]
    struct Recorder {
        acks: AtomicU32,
        requeues: AtomicU32,
    }

    struct Recorded(Arc<Recorder>);

    impl Settle for Recorded {
        fn ack(self: Box<Self>) {
            self.0.acks.fetch_add(1, Ordering::SeqCst);
        }

        fn requeue(self: Box<Self>) {
            self.0.requeues.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn ack_settles_once_and_drop_requeues() {
        let recorder = Arc::new(Recorder::default());

        Acknowledger::new(Box::new(Recorded(recorder.clone())), None).ack();
        drop(Acknowledger::new(Box::new(Recorded(recorder.clone())), None));

        assert_eq!(recorder.acks.load(Ordering::SeqCst), 1);
        assert_eq!(recorder.requeues.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn deliveries_are_shareable_across_tasks() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<Acknowledger>();
        assert_send_sync::<Delivery>();
        assert_send_sync::<std::sync::Arc<dashmap::DashMap<u64, Acknowledger>>>();
    }

    #[test]
    fn settling_releases_credit() {
        let credit = Arc::new(tokio::sync::Semaphore::new(1));
        let permit = credit.clone().try_acquire_owned().unwrap();
        assert_eq!(credit.available_permits(), 0);

        let recorder = Arc::new(Recorder::default());
        Acknowledger::new(Box::new(Recorded(recorder)), Some(permit)).ack();
        assert_eq!(credit.available_permits(), 1);
    }

    #[test]
    fn ack_mode_defaults_to_after_handler() {
        assert_eq!(AckMode::default(), AckMode::AfterHandler);
    }
}
