//! [`MessageChannel`]: codec-aware send and supervised listeners.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use courier_core::{header, Address, Codec, FromMessage, Headers, Message};
use metrics::counter;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{AckMode, BrokerTransport, Delivery, Envelope};
use crate::config::ChannelConfig;
use crate::error::MessagingError;
use crate::telemetry::metric;

// ---------------------------------------------------------------------------
// MessageHandler
// ---------------------------------------------------------------------------

/// Receives decoded messages from a listener.
///
/// `Body` selects which envelope variant the handler wants; anything else
/// arriving on the address is logged and dropped. Use [`Message`] to take
/// every variant.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    type Body: FromMessage + Send + 'static;

    async fn on_receive(&self, body: Self::Body, headers: &Headers);
}

#[async_trait]
impl<H: MessageHandler> MessageHandler for Arc<H> {
    type Body = H::Body;

    async fn on_receive(&self, body: Self::Body, headers: &Headers) {
        (**self).on_receive(body, headers).await;
    }
}

// ---------------------------------------------------------------------------
// MessageChannel
// ---------------------------------------------------------------------------

/// Codec, transport, and default address bundled for senders and listeners.
#[derive(Clone)]
pub struct MessageChannel {
    transport: Arc<dyn BrokerTransport>,
    codec: Codec,
    default_address: Option<Address>,
    prefetch: usize,
    ack_mode: AckMode,
    send_timeout: Duration,
    resubscribe_backoff: Duration,
}

impl MessageChannel {
    /// Creates a channel over `transport`, taking codec, acking and timeouts from `config`.
    #[must_use]
    pub fn new(transport: Arc<dyn BrokerTransport>, config: &ChannelConfig) -> Self {
        Self {
            transport,
            codec: config.codec,
            default_address: None,
            prefetch: config.prefetch,
            ack_mode: config.ack_mode,
            send_timeout: config.send_timeout,
            resubscribe_backoff: config.resubscribe_backoff,
        }
    }

    /// Address used when `send`/`start_listener` get none.
    #[must_use]
    pub fn with_default_address(mut self, address: Address) -> Self {
        self.default_address = Some(address);
        self
    }

    /// Codec used for outgoing bodies.
    #[must_use]
    pub fn codec(&self) -> Codec {
        self.codec
    }

    /// Underlying broker transport.
    #[must_use]
    pub fn transport(&self) -> &Arc<dyn BrokerTransport> {
        &self.transport
    }

    /// Whether `reply-to` travels as a header on this channel.
    #[must_use]
    pub fn supports_headers(&self) -> bool {
        self.transport.supports_headers()
    }

    fn resolve<'a>(&'a self, address: Option<&'a Address>) -> Result<&'a Address, MessagingError> {
        address
            .or(self.default_address.as_ref())
            .ok_or(MessagingError::NoAddress)
    }

    /// Encodes and publishes one message.
    ///
    /// On a header-capable transport a request's `replyTo` moves into the
    /// `reply-to` header; otherwise it stays in the body.
    ///
    /// # Errors
    ///
    /// Returns `MessagingError` if there is no address, encoding fails, the
    /// transport rejects the publish, or the publish exceeds the send timeout.
    pub async fn send(
        &self,
        message: impl Into<Message>,
        address: Option<&Address>,
        headers: Option<Headers>,
    ) -> Result<(), MessagingError> {
        let address = self.resolve(address)?;
        let mut message = message.into();
        let mut headers = headers.unwrap_or_default();

        if self.supports_headers() {
            headers.insert(header::CONTENT_TYPE, self.codec.content_type());
            match &mut message {
                Message::Request(request) => {
                    headers.insert(header::CORRELATION_ID, request.id.clone());
                    if let Some(reply_to) = request.reply_to.take() {
                        headers.insert(header::REPLY_TO, reply_to);
                    }
                }
                Message::Reply(reply) => {
                    headers.insert(header::CORRELATION_ID, reply.request_id.clone());
                }
                Message::Heartbeat(_) => {}
            }
        }

        let body = self.codec.encode(&message)?;
        let publish = self.transport.publish(address, Envelope::new(headers, body));
        match tokio::time::timeout(self.send_timeout, publish).await {
            Ok(result) => result,
            Err(_) => Err(MessagingError::Timeout {
                timeout_ms: u64::try_from(self.send_timeout.as_millis()).unwrap_or(u64::MAX),
            }),
        }
    }

    /// Starts one supervised listener task on `address`.
    ///
    /// The task re-subscribes after `resubscribe_backoff` whenever its
    /// consumer ends or cannot be opened, until the handle is stopped.
    ///
    /// # Errors
    ///
    /// Returns `MessagingError::NoAddress` if no address is given and the
    /// channel has no default.
    pub fn start_listener<H: MessageHandler>(
        &self,
        address: Option<&Address>,
        handler: H,
    ) -> Result<ListenerHandle, MessagingError> {
        let address = self.resolve(address)?.clone();
        let token = CancellationToken::new();
        let listener = Listener {
            transport: Arc::clone(&self.transport),
            codec: self.codec,
            address: address.clone(),
            prefetch: self.prefetch,
            ack_mode: self.ack_mode,
            backoff: self.resubscribe_backoff,
            handler,
        };
        let task = tokio::spawn(listener.run(token.clone()));
        info!(%address, expects = H::Body::EXPECTED, "listener started");
        Ok(ListenerHandle {
            address,
            token,
            task: Some(task),
        })
    }
}

impl std::fmt::Debug for MessageChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageChannel")
            .field("transport", &self.transport.name())
            .field("codec", &self.codec)
            .field("default_address", &self.default_address)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// ListenerHandle
// ---------------------------------------------------------------------------

/// Owns a listener task. Dropping the handle stops the listener.
#[derive(Debug)]
pub struct ListenerHandle {
    address: Address,
    token: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl ListenerHandle {
    /// Address the listener consumes from.
    #[must_use]
    pub fn address(&self) -> &Address {
        &self.address
    }

    /// Stops the listener and waits for a handler call in progress to finish.
    pub async fn stop(mut self) {
        self.token.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }

    /// Token that stops the listener when cancelled, without waiting.
    #[must_use]
    pub fn stop_token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Returns `true` while the listener task is alive.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }
}

impl Drop for ListenerHandle {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

// ---------------------------------------------------------------------------
// Listener task
// ---------------------------------------------------------------------------

struct Listener<H> {
    transport: Arc<dyn BrokerTransport>,
    codec: Codec,
    address: Address,
    prefetch: usize,
    ack_mode: AckMode,
    backoff: Duration,
    handler: H,
}

impl<H: MessageHandler> Listener<H> {
    async fn run(self, token: CancellationToken) {
        loop {
            let subscribed = tokio::select! {
                () = token.cancelled() => break,
                result = self.transport.consume(&self.address, self.prefetch) => result,
            };

            match subscribed {
                Ok(mut consumer) => loop {
                    let delivery = tokio::select! {
                        biased;
                        () = token.cancelled() => return,
                        next = consumer.next() => next,
                    };
                    match delivery {
                        Some(delivery) => self.dispatch(delivery).await,
                        None => {
                            warn!(address = %self.address, "consumer ended, re-subscribing");
                            break;
                        }
                    }
                },
                Err(err) => {
                    warn!(address = %self.address, error = %err, "subscribe failed, retrying");
                }
            }

            tokio::select! {
                () = token.cancelled() => break,
                () = tokio::time::sleep(self.backoff) => {}
            }
        }
        debug!(address = %self.address, "listener stopped");
    }

    async fn dispatch(&self, delivery: Delivery) {
        let Delivery { envelope, acker } = delivery;
        let Envelope { headers, body } = envelope;

        let codec = headers
            .get(header::CONTENT_TYPE)
            .and_then(Codec::from_content_type)
            .unwrap_or(self.codec);

        let mut message = match codec.decode(&body) {
            Ok(message) => message,
            Err(err) => {
                warn!(address = %self.address, error = %err, bytes = body.len(), "dropping undecodable message");
                counter!(metric::MESSAGES_DROPPED, "reason" => "decode").increment(1);
                acker.ack();
                return;
            }
        };

        if let Message::Request(request) = &mut message {
            if request.reply_to.is_none() {
                request.reply_to = headers.get(header::REPLY_TO).map(str::to_string);
            }
        }

        let body = match H::Body::from_message(message) {
            Ok(body) => body,
            Err(other) => {
                warn!(
                    address = %self.address,
                    expected = H::Body::EXPECTED,
                    received = %other.describe(),
                    "dropping unexpected message"
                );
                counter!(metric::MESSAGES_DROPPED, "reason" => "unexpected").increment(1);
                acker.ack();
                return;
            }
        };

        match self.ack_mode {
            AckMode::BeforeHandler => {
                acker.ack();
                self.handler.on_receive(body, &headers).await;
            }
            AckMode::AfterHandler => {
                self.handler.on_receive(body, &headers).await;
                acker.ack();
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use courier_core::{ContentReference, Reply, Request, TransformOptions};
    use tokio::sync::mpsc;

    use super::*;
    use crate::channel::MemoryBroker;

    struct Collect<T> {
        tx: mpsc::UnboundedSender<(T, Headers)>,
    }

    #[async_trait]
    impl<T: FromMessage + Send + 'static> MessageHandler for Collect<T> {
        type Body = T;

        async fn on_receive(&self, body: T, headers: &Headers) {
            let _ = self.tx.send((body, headers.clone()));
        }
    }

    fn collector<T>() -> (Collect<T>, mpsc::UnboundedReceiver<(T, Headers)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Collect { tx }, rx)
    }

    fn channel(broker: Arc<MemoryBroker>) -> MessageChannel {
        MessageChannel::new(broker, &ChannelConfig::default())
    }

    async fn recv<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> T {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for message")
            .expect("channel closed")
    }

    fn request() -> Request {
        Request::new(
            vec![ContentReference::new("file:///a", "text/plain")],
            TransformOptions::new(),
        )
        .with_reply_to("queue:replies")
    }

    #[tokio::test]
    async fn send_without_address_uses_default_or_fails() {
        let broker = Arc::new(MemoryBroker::new());
        let bare = channel(Arc::clone(&broker));
        assert!(matches!(
            bare.send(Reply::pending("x"), None, None).await,
            Err(MessagingError::NoAddress)
        ));

        let with_default = bare.with_default_address(Address::queue("replies"));
        with_default
            .send(Reply::pending("x"), None, None)
            .await
            .unwrap();
        assert_eq!(broker.queue_depth("replies"), 1);
    }

    #[tokio::test]
    async fn reply_to_travels_in_header_when_supported() {
        let broker = Arc::new(MemoryBroker::new());
        let channel = channel(Arc::clone(&broker));
        let address = Address::queue("requests");
        let mut raw = broker.consume(&address, 1).await.unwrap();

        channel.send(request(), Some(&address), None).await.unwrap();

        let delivery = raw.next().await.unwrap();
        assert_eq!(delivery.envelope.headers.get(header::REPLY_TO), Some("queue:replies"));
        assert_eq!(
            delivery.envelope.headers.get(header::CONTENT_TYPE),
            Some("application/json")
        );
        let decoded = Codec::Json.decode(&delivery.envelope.body).unwrap();
        let Message::Request(body) = decoded else {
            panic!("expected request");
        };
        assert!(body.reply_to.is_none());
        delivery.acker.ack();
    }

    #[tokio::test]
    async fn reply_to_stays_in_body_without_headers() {
        let broker = Arc::new(MemoryBroker::without_headers());
        let channel = channel(Arc::clone(&broker));
        let address = Address::queue("requests");
        let mut raw = broker.consume(&address, 1).await.unwrap();

        channel.send(request(), Some(&address), None).await.unwrap();

        let delivery = raw.next().await.unwrap();
        assert!(delivery.envelope.headers.is_empty());
        let Message::Request(body) = Codec::Json.decode(&delivery.envelope.body).unwrap() else {
            panic!("expected request");
        };
        assert_eq!(body.reply_to.as_deref(), Some("queue:replies"));
        delivery.acker.ack();
    }

    #[tokio::test]
    async fn listener_backfills_reply_to_from_header() {
        let broker = Arc::new(MemoryBroker::new());
        let channel = channel(Arc::clone(&broker));
        let address = Address::queue("requests");
        let (handler, mut rx) = collector::<Request>();
        let _listener = channel.start_listener(Some(&address), handler).unwrap();

        let sent = request();
        channel.send(sent.clone(), Some(&address), None).await.unwrap();

        let (received, headers) = recv(&mut rx).await;
        assert_eq!(received.id, sent.id);
        assert_eq!(received.reply_to.as_deref(), Some("queue:replies"));
        assert_eq!(headers.get(header::CORRELATION_ID), Some(sent.id.as_str()));
    }

    #[tokio::test]
    async fn undecodable_and_unexpected_bodies_are_dropped_and_acked() {
        let broker = Arc::new(MemoryBroker::new());
        let channel = channel(Arc::clone(&broker));
        let address = Address::queue("replies");
        let (handler, mut rx) = collector::<Reply>();
        let listener = channel.start_listener(Some(&address), handler).unwrap();

        broker
            .publish(&address, Envelope::new(Headers::new(), &b"not json"[..]))
            .await
            .unwrap();
        broker
            .publish(&address, Envelope::new(Headers::new(), Vec::<u8>::new()))
            .await
            .unwrap();
        channel.send(request(), Some(&address), None).await.unwrap();
        channel.send(Reply::in_progress("r-1"), Some(&address), None).await.unwrap();

        let (reply, _) = recv(&mut rx).await;
        assert_eq!(reply.request_id, "r-1");
        assert_eq!(broker.queue_depth("replies"), 0);
        listener.stop().await;
    }

    #[tokio::test]
    async fn msgpack_bodies_decode_by_content_type() {
        let broker = Arc::new(MemoryBroker::new());
        let config = ChannelConfig {
            codec: Codec::MsgPack,
            ..ChannelConfig::default()
        };
        let sender = MessageChannel::new(Arc::clone(&broker) as Arc<dyn BrokerTransport>, &config);
        // Receiver defaults to JSON but honours the content-type header.
        let receiver = channel(Arc::clone(&broker));
        let address = Address::queue("mixed");
        let (handler, mut rx) = collector::<Reply>();
        let _listener = receiver.start_listener(Some(&address), handler).unwrap();

        sender.send(Reply::progress("m", 0.25), Some(&address), None).await.unwrap();
        let (reply, headers) = recv(&mut rx).await;
        assert_eq!(reply.progress, Some(0.25));
        assert_eq!(headers.get(header::CONTENT_TYPE), Some("application/msgpack"));
    }

    #[tokio::test]
    async fn listener_resubscribes_after_consumer_ends() {
        let broker = Arc::new(MemoryBroker::new());
        let config = ChannelConfig {
            resubscribe_backoff: Duration::from_millis(20),
            ..ChannelConfig::default()
        };
        let first = MessageChannel::new(Arc::clone(&broker) as Arc<dyn BrokerTransport>, &config);
        let (handler, mut rx) = collector::<Reply>();
        let listener = first.start_listener(Some(&Address::queue("r")), handler).unwrap();

        // Closing the broker ends the consumer; subscribe then fails until stopped.
        broker.close().await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(listener.is_running());
        listener.stop().await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn stopped_listener_leaves_messages_queued() {
        let broker = Arc::new(MemoryBroker::new());
        let channel = channel(Arc::clone(&broker));
        let address = Address::queue("idle");
        let (handler, _rx) = collector::<Reply>();
        let listener = channel.start_listener(Some(&address), handler).unwrap();
        listener.stop().await;

        channel.send(Reply::pending("p"), Some(&address), None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(broker.queue_depth("idle"), 1);
    }
}
