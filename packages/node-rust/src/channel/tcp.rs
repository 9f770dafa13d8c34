//! Framed TCP client binding for `tcp://` and `failover:` broker URLs.
//!
//! One connection is shared by all publishers and consumers of a transport.
//! Requests (`publish`, `consume`) are matched to their `receipt` by
//! sequence number. When the connection drops, open consumers end; the next
//! operation reconnects, trying the endpoints in listed order.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use courier_core::Address;
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::frame::{framed, Frame};
use super::{Acknowledger, BrokerTransport, Consumer, Delivery, Envelope, Settle};
use crate::error::MessagingError;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

type Receipts = DashMap<u64, oneshot::Sender<Option<String>>>;
type Subscriptions = DashMap<u64, mpsc::Sender<(u64, Envelope)>>;

// ---------------------------------------------------------------------------
// Connection
// ---------------------------------------------------------------------------

struct Connection {
    peer: String,
    outbound: mpsc::UnboundedSender<Frame>,
    receipts: Arc<Receipts>,
    subscriptions: Arc<Subscriptions>,
    next_seq: AtomicU64,
    alive: Arc<AtomicBool>,
    io: JoinHandle<()>,
}

impl Connection {
    async fn open(peer: &str) -> Result<Self, MessagingError> {
        let stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(peer))
            .await
            .map_err(|_| MessagingError::Connection(format!("connect to {peer} timed out")))??;
        stream.set_nodelay(true)?;

        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let receipts = Arc::new(Receipts::new());
        let subscriptions = Arc::new(Subscriptions::new());
        let alive = Arc::new(AtomicBool::new(true));

        let io = tokio::spawn(run_io(
            stream,
            peer.to_string(),
            outbound_rx,
            Arc::clone(&receipts),
            Arc::clone(&subscriptions),
            Arc::clone(&alive),
        ));

        info!(peer = %peer, "connected to broker");
        Ok(Self {
            peer: peer.to_string(),
            outbound,
            receipts,
            subscriptions,
            next_seq: AtomicU64::new(1),
            alive,
            io,
        })
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    fn next_seq(&self) -> u64 {
        self.next_seq.fetch_add(1, Ordering::Relaxed)
    }

    /// Sends a frame that the server answers with a receipt, and waits for it.
    async fn request(&self, seq: u64, frame: Frame) -> Result<Option<String>, MessagingError> {
        let (tx, rx) = oneshot::channel();
        self.receipts.insert(seq, tx);
        if self.outbound.send(frame).is_err() {
            self.receipts.remove(&seq);
            return Err(MessagingError::Closed);
        }
        rx.await.map_err(|_| MessagingError::Closed)
    }

    fn shutdown(&self) {
        self.io.abort();
        self.alive.store(false, Ordering::SeqCst);
        self.receipts.clear();
        self.subscriptions.clear();
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.io.abort();
    }
}

async fn run_io(
    stream: TcpStream,
    peer: String,
    mut outbound_rx: mpsc::UnboundedReceiver<Frame>,
    receipts: Arc<Receipts>,
    subscriptions: Arc<Subscriptions>,
    alive: Arc<AtomicBool>,
) {
    let mut io = framed(stream);

    loop {
        tokio::select! {
            Some(frame) = outbound_rx.recv() => {
                let sent = match frame.encode() {
                    Ok(bytes) => io.send(bytes).await.map_err(MessagingError::from),
                    Err(err) => Err(err),
                };
                if let Err(err) = sent {
                    warn!(peer = %peer, error = %err, "broker write failed");
                    break;
                }
            }
            inbound = io.next() => {
                let raw = match inbound {
                    Some(Ok(raw)) => raw,
                    Some(Err(err)) => {
                        warn!(peer = %peer, error = %err, "broker read failed");
                        break;
                    }
                    None => break,
                };
                match Frame::decode(&raw) {
                    Ok(Frame::Receipt { seq, error }) => {
                        if let Some((_, waiter)) = receipts.remove(&seq) {
                            let _ = waiter.send(error);
                        }
                    }
                    Ok(Frame::Deliver { consumer, tag, headers, body }) => {
                        let envelope = Envelope::new(headers, body);
                        let accepted = subscriptions
                            .get(&consumer)
                            .is_some_and(|sub| sub.try_send((tag, envelope)).is_ok());
                        if !accepted {
                            // Subscription gone or over its window: hand it back.
                            if let Ok(bytes) = (Frame::Nack { tag }).encode() {
                                if io.send(bytes).await.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                    Ok(other) => debug!(peer = %peer, ?other, "ignoring client-only frame from broker"),
                    Err(err) => {
                        warn!(peer = %peer, error = %err, "malformed frame from broker");
                        break;
                    }
                }
            }
        }
    }

    alive.store(false, Ordering::SeqCst);
    receipts.clear();
    subscriptions.clear();
    info!(peer = %peer, "broker connection closed");
}

// ---------------------------------------------------------------------------
// TcpBrokerTransport
// ---------------------------------------------------------------------------

/// Client side of the framed TCP binding.
pub struct TcpBrokerTransport {
    endpoints: Vec<String>,
    current: Mutex<Option<Arc<Connection>>>,
    closed: AtomicBool,
}

impl TcpBrokerTransport {
    /// Connects to the first reachable endpoint (`host:port`), in order.
    ///
    /// # Errors
    ///
    /// Returns `MessagingError::Connection` if no endpoint accepts.
    pub async fn connect(endpoints: Vec<String>) -> Result<Self, MessagingError> {
        let transport = Self {
            endpoints,
            current: Mutex::new(None),
            closed: AtomicBool::new(false),
        };
        transport.connection().await?;
        Ok(transport)
    }

    /// Endpoint of the live connection, if any.
    pub async fn connected_peer(&self) -> Option<String> {
        self.current
            .lock()
            .await
            .as_ref()
            .filter(|c| c.is_alive())
            .map(|c| c.peer.clone())
    }

    async fn connection(&self) -> Result<Arc<Connection>, MessagingError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(MessagingError::Closed);
        }
        let mut current = self.current.lock().await;
        if let Some(conn) = current.as_ref().filter(|c| c.is_alive()) {
            return Ok(Arc::clone(conn));
        }

        let mut last_error = None;
        for endpoint in &self.endpoints {
            match Connection::open(endpoint).await {
                Ok(conn) => {
                    let conn = Arc::new(conn);
                    *current = Some(Arc::clone(&conn));
                    return Ok(conn);
                }
                Err(err) => {
                    warn!(endpoint = %endpoint, error = %err, "broker endpoint unreachable");
                    last_error = Some(err);
                }
            }
        }
        Err(MessagingError::Connection(match last_error {
            Some(err) => format!("no broker endpoint reachable: {err}"),
            None => "no broker endpoints configured".to_string(),
        }))
    }
}

#[async_trait]
impl BrokerTransport for TcpBrokerTransport {
    fn name(&self) -> &'static str {
        "tcp"
    }

    async fn publish(&self, address: &Address, envelope: Envelope) -> Result<(), MessagingError> {
        let conn = self.connection().await?;
        let seq = conn.next_seq();
        let frame = Frame::Publish {
            seq,
            address: address.clone(),
            headers: envelope.headers,
            body: envelope.body.to_vec(),
        };
        match conn.request(seq, frame).await? {
            None => Ok(()),
            Some(reason) => Err(MessagingError::Send {
                address: address.to_string(),
                reason,
            }),
        }
    }

    async fn consume(
        &self,
        address: &Address,
        prefetch: usize,
    ) -> Result<Box<dyn Consumer>, MessagingError> {
        let conn = self.connection().await?;
        let prefetch = prefetch.max(1);
        let consumer = conn.next_seq();
        let (tx, rx) = mpsc::channel(prefetch);
        conn.subscriptions.insert(consumer, tx);

        let seq = conn.next_seq();
        let frame = Frame::Consume {
            seq,
            consumer,
            address: address.clone(),
            prefetch: u32::try_from(prefetch).unwrap_or(u32::MAX),
        };
        match conn.request(seq, frame).await {
            Ok(None) => Ok(Box::new(TcpConsumer { conn, consumer, rx })),
            Ok(Some(reason)) => {
                conn.subscriptions.remove(&consumer);
                Err(MessagingError::Connection(format!(
                    "subscribe to {address} refused: {reason}"
                )))
            }
            Err(err) => {
                conn.subscriptions.remove(&consumer);
                Err(err)
            }
        }
    }

    fn supports_headers(&self) -> bool {
        true
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        if let Some(conn) = self.current.lock().await.take() {
            conn.shutdown();
        }
    }
}

// ---------------------------------------------------------------------------
// TcpConsumer
// ---------------------------------------------------------------------------

struct TcpConsumer {
    conn: Arc<Connection>,
    consumer: u64,
    rx: mpsc::Receiver<(u64, Envelope)>,
}

#[async_trait]
impl Consumer for TcpConsumer {
    async fn next(&mut self) -> Option<Delivery> {
        let (tag, envelope) = self.rx.recv().await?;
        let settle = TcpSettle {
            tag,
            outbound: self.conn.outbound.clone(),
        };
        Some(Delivery {
            envelope,
            acker: Acknowledger::new(Box::new(settle), None),
        })
    }
}

impl Drop for TcpConsumer {
    fn drop(&mut self) {
        self.conn.subscriptions.remove(&self.consumer);
        let _ = self.conn.outbound.send(Frame::Cancel {
            consumer: self.consumer,
        });
    }
}

struct TcpSettle {
    tag: u64,
    outbound: mpsc::UnboundedSender<Frame>,
}

// Send failures mean the connection is gone; the server requeues on disconnect.
impl Settle for TcpSettle {
    fn ack(self: Box<Self>) {
        let _ = self.outbound.send(Frame::Ack { tag: self.tag });
    }

    fn requeue(self: Box<Self>) {
        let _ = self.outbound.send(Frame::Nack { tag: self.tag });
    }
}

#[cfg(test)]
mod tests {
    use courier_core::Headers;
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::channel::broker::BrokerServer;
    use crate::channel::MemoryBroker;

    async fn start_server() -> (String, Arc<MemoryBroker>, CancellationToken) {
        let broker = Arc::new(MemoryBroker::new());
        let server = BrokerServer::bind("127.0.0.1:0", Arc::clone(&broker))
            .await
            .unwrap();
        let addr = server.local_addr().unwrap().to_string();
        let token = CancellationToken::new();
        tokio::spawn(server.serve(token.clone()));
        (addr, broker, token)
    }

    async fn next_within(consumer: &mut Box<dyn Consumer>) -> Option<Delivery> {
        tokio::time::timeout(Duration::from_millis(500), consumer.next())
            .await
            .ok()
            .flatten()
    }

    #[tokio::test]
    async fn publish_and_consume_through_server() {
        let (addr, _broker, token) = start_server().await;
        let transport = TcpBrokerTransport::connect(vec![addr]).await.unwrap();
        let address = Address::queue("jobs");

        let mut consumer = transport.consume(&address, 4).await.unwrap();
        transport
            .publish(
                &address,
                Envelope::new(Headers::new().with("reply-to", "queue:r"), &b"hello"[..]),
            )
            .await
            .unwrap();

        let delivery = next_within(&mut consumer).await.unwrap();
        assert_eq!(&delivery.envelope.body[..], b"hello");
        assert_eq!(delivery.envelope.headers.get("reply-to"), Some("queue:r"));
        delivery.acker.ack();
        token.cancel();
    }

    #[tokio::test]
    async fn nacked_delivery_comes_back() {
        let (addr, broker, token) = start_server().await;
        let transport = TcpBrokerTransport::connect(vec![addr]).await.unwrap();
        let address = Address::queue("retry");
        let mut consumer = transport.consume(&address, 1).await.unwrap();
        transport
            .publish(&address, Envelope::new(Headers::new(), &b"again"[..]))
            .await
            .unwrap();

        let first = next_within(&mut consumer).await.unwrap();
        first.acker.requeue();
        let second = next_within(&mut consumer).await.unwrap();
        assert_eq!(&second.envelope.body[..], b"again");
        second.acker.ack();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(broker.queue_depth("retry"), 0);
        token.cancel();
    }

    #[tokio::test]
    async fn failover_skips_dead_endpoint() {
        // Bind and drop to get a port nothing listens on.
        let dead = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let dead_addr = dead.local_addr().unwrap().to_string();
        drop(dead);

        let (addr, _broker, token) = start_server().await;
        let transport = TcpBrokerTransport::connect(vec![dead_addr, addr.clone()])
            .await
            .unwrap();
        assert_eq!(transport.connected_peer().await, Some(addr));
        token.cancel();
    }

    #[tokio::test]
    async fn no_reachable_endpoint_is_a_connection_error() {
        let dead = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let dead_addr = dead.local_addr().unwrap().to_string();
        drop(dead);

        let result = TcpBrokerTransport::connect(vec![dead_addr]).await;
        assert!(matches!(result, Err(MessagingError::Connection(_))));
    }

    #[tokio::test]
    async fn close_ends_consumers_and_rejects_publish() {
        let (addr, _broker, token) = start_server().await;
        let transport = TcpBrokerTransport::connect(vec![addr]).await.unwrap();
        let address = Address::queue("closing");
        let mut consumer = transport.consume(&address, 1).await.unwrap();

        transport.close().await;
        assert!(consumer.next().await.is_none());
        assert!(matches!(
            transport
                .publish(&address, Envelope::new(Headers::new(), &b"x"[..]))
                .await,
            Err(MessagingError::Closed)
        ));
        token.cancel();
    }
}
