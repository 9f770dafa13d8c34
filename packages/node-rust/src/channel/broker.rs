//! TCP broker server fronting a [`MemoryBroker`].
//!
//! Each connection is a session: subscriptions opened with `consume` run as
//! pump tasks that forward deliveries to the socket, and unsettled
//! deliveries are parked by tag until the client acks or nacks them. When the
//! session ends every parked delivery is requeued.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::frame::{framed, Frame};
use super::{Acknowledger, BrokerTransport, Consumer, Envelope, MemoryBroker};
use crate::error::MessagingError;

/// Accepts broker clients on a TCP socket.
pub struct BrokerServer {
    broker: Arc<MemoryBroker>,
    listener: TcpListener,
}

impl BrokerServer {
    /// Binds the listener. Port 0 picks an ephemeral port.
    ///
    /// # Errors
    ///
    /// Returns `MessagingError::Io` if the address cannot be bound.
    pub async fn bind(addr: &str, broker: Arc<MemoryBroker>) -> Result<Self, MessagingError> {
        let listener = TcpListener::bind(addr).await?;
        info!(addr = %listener.local_addr()?, "broker listening");
        Ok(Self { broker, listener })
    }

    /// # Errors
    ///
    /// Returns `MessagingError::Io` if the socket address cannot be read.
    pub fn local_addr(&self) -> Result<SocketAddr, MessagingError> {
        Ok(self.listener.local_addr()?)
    }

    /// Serves connections until `shutdown` is cancelled.
    pub async fn serve(self, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!(%peer, "broker client connected");
                        let broker = Arc::clone(&self.broker);
                        tokio::spawn(run_session(stream, peer, broker, shutdown.child_token()));
                    }
                    Err(err) => warn!(error = %err, "accept failed"),
                },
            }
        }
        info!("broker stopped accepting connections");
    }
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

struct Parked {
    consumer: u64,
    acker: Acknowledger,
}

struct Session {
    broker: Arc<MemoryBroker>,
    outbound: mpsc::UnboundedSender<Frame>,
    parked: Arc<DashMap<u64, Parked>>,
    pumps: HashMap<u64, JoinHandle<()>>,
    next_tag: Arc<AtomicU64>,
}

impl Session {
    async fn handle(&mut self, frame: Frame) {
        match frame {
            Frame::Publish {
                seq,
                address,
                headers,
                body,
            } => {
                let result = self
                    .broker
                    .publish(&address, Envelope::new(headers, body))
                    .await;
                self.receipt(seq, result.err());
            }
            Frame::Consume {
                seq,
                consumer,
                address,
                prefetch,
            } => match self.broker.consume(&address, prefetch as usize).await {
                Ok(mut source) => {
                    let outbound = self.outbound.clone();
                    let parked = Arc::clone(&self.parked);
                    let next_tag = Arc::clone(&self.next_tag);
                    let pump = tokio::spawn(async move {
                        while let Some(delivery) = source.next().await {
                            let tag = next_tag.fetch_add(1, Ordering::Relaxed);
                            let Envelope { headers, body } = delivery.envelope;
                            parked.insert(
                                tag,
                                Parked {
                                    consumer,
                                    acker: delivery.acker,
                                },
                            );
                            let frame = Frame::Deliver {
                                consumer,
                                tag,
                                headers,
                                body: body.to_vec(),
                            };
                            if outbound.send(frame).is_err() {
                                break;
                            }
                        }
                    });
                    if let Some(previous) = self.pumps.insert(consumer, pump) {
                        previous.abort();
                    }
                    self.receipt(seq, None);
                }
                Err(err) => self.receipt(seq, Some(err)),
            },
            Frame::Ack { tag } => {
                if let Some((_, parked)) = self.parked.remove(&tag) {
                    parked.acker.ack();
                }
            }
            Frame::Nack { tag } => {
                if let Some((_, parked)) = self.parked.remove(&tag) {
                    parked.acker.requeue();
                }
            }
            Frame::Cancel { consumer } => {
                if let Some(pump) = self.pumps.remove(&consumer) {
                    pump.abort();
                }
                self.parked.retain(|_, parked| parked.consumer != consumer);
            }
            Frame::Receipt { .. } | Frame::Deliver { .. } => {
                warn!("client sent a server-only frame, ignoring");
            }
        }
    }

    fn receipt(&self, seq: u64, error: Option<MessagingError>) {
        let _ = self.outbound.send(Frame::Receipt {
            seq,
            error: error.map(|e| e.to_string()),
        });
    }

    /// Stops every pump and requeues all parked deliveries.
    fn teardown(&mut self) {
        for (_, pump) in self.pumps.drain() {
            pump.abort();
        }
        self.parked.clear();
    }
}

async fn run_session(
    stream: TcpStream,
    peer: SocketAddr,
    broker: Arc<MemoryBroker>,
    shutdown: CancellationToken,
) {
    let mut io = framed(stream);
    let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<Frame>();
    let mut session = Session {
        broker,
        outbound,
        parked: Arc::new(DashMap::new()),
        pumps: HashMap::new(),
        next_tag: Arc::new(AtomicU64::new(1)),
    };

    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            Some(frame) = outbound_rx.recv() => {
                let sent = match frame.encode() {
                    Ok(bytes) => io.send(bytes).await.map_err(MessagingError::from),
                    Err(err) => Err(err),
                };
                if let Err(err) = sent {
                    debug!(%peer, error = %err, "write to broker client failed");
                    break;
                }
            }
            inbound = io.next() => match inbound {
                Some(Ok(raw)) => match Frame::decode(&raw) {
                    Ok(frame) => session.handle(frame).await,
                    Err(err) => {
                        warn!(%peer, error = %err, "malformed frame, closing session");
                        break;
                    }
                },
                Some(Err(err)) => {
                    debug!(%peer, error = %err, "broker client read failed");
                    break;
                }
                None => break,
            },
        }
    }

    let requeued = session.parked.len();
    session.teardown();
    debug!(%peer, requeued, "broker client disconnected");
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use courier_core::{Address, Headers};

    use super::*;

    async fn start_server(broker: Arc<MemoryBroker>) -> (SocketAddr, CancellationToken) {
        let server = BrokerServer::bind("127.0.0.1:0", broker).await.unwrap();
        let addr = server.local_addr().unwrap();
        let token = CancellationToken::new();
        tokio::spawn(server.serve(token.clone()));
        (addr, token)
    }

    async fn recv_frame(
        io: &mut tokio_util::codec::Framed<TcpStream, tokio_util::codec::LengthDelimitedCodec>,
    ) -> Frame {
        let raw = tokio::time::timeout(Duration::from_secs(2), io.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        Frame::decode(&raw).unwrap()
    }

    #[tokio::test]
    async fn publish_is_confirmed_and_enqueued() {
        let broker = Arc::new(MemoryBroker::new());
        let (addr, token) = start_server(Arc::clone(&broker)).await;

        let mut io = framed(TcpStream::connect(addr).await.unwrap());
        let publish = Frame::Publish {
            seq: 9,
            address: Address::queue("jobs"),
            headers: Headers::new(),
            body: b"payload".to_vec(),
        };
        io.send(publish.encode().unwrap()).await.unwrap();

        assert_eq!(
            recv_frame(&mut io).await,
            Frame::Receipt { seq: 9, error: None }
        );
        assert_eq!(broker.queue_depth("jobs"), 1);
        token.cancel();
    }

    #[tokio::test]
    async fn disconnect_requeues_unacked_deliveries() {
        let broker = Arc::new(MemoryBroker::new());
        broker
            .publish(&Address::queue("jobs"), Envelope::new(Headers::new(), &b"x"[..]))
            .await
            .unwrap();
        let (addr, token) = start_server(Arc::clone(&broker)).await;

        let mut io = framed(TcpStream::connect(addr).await.unwrap());
        let consume = Frame::Consume {
            seq: 1,
            consumer: 1,
            address: Address::queue("jobs"),
            prefetch: 1,
        };
        io.send(consume.encode().unwrap()).await.unwrap();

        let mut got_delivery = false;
        for _ in 0..2 {
            match recv_frame(&mut io).await {
                Frame::Deliver { body, .. } => {
                    assert_eq!(body, b"x");
                    got_delivery = true;
                }
                Frame::Receipt { seq, error } => {
                    assert_eq!(seq, 1);
                    assert!(error.is_none());
                }
                other => panic!("unexpected frame {other:?}"),
            }
        }
        assert!(got_delivery);
        assert_eq!(broker.queue_depth("jobs"), 0);

        drop(io);
        tokio::time::timeout(Duration::from_secs(2), async {
            while broker.queue_depth("jobs") == 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        token.cancel();
    }
}
