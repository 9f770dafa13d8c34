//! Broker URL to transport.

use std::sync::Arc;

use courier_core::{BindingKind, BrokerBinding};
use tracing::info;

use super::tcp::TcpBrokerTransport;
use super::{BrokerTransport, MemoryBroker};
use crate::error::MessagingError;

/// Opens the transport selected by `url`'s scheme.
///
/// `memory://<name>` joins the process-wide in-memory broker of that name.
/// `tcp://` and `failover:(tcp://...)` connect the framed TCP binding.
/// `ssl://` and the AMQP schemes parse but have no client compiled in.
///
/// # Errors
///
/// Returns `MessagingError::Address` for a malformed URL,
/// `MessagingError::UnsupportedBinding` for TLS or AMQP, and
/// `MessagingError::Connection` when no endpoint is reachable.
pub async fn connect(url: &str) -> Result<Arc<dyn BrokerTransport>, MessagingError> {
    let binding = BrokerBinding::from_url(url)?;
    match binding.kind {
        BindingKind::InProcess => {
            let name = binding
                .endpoints
                .first()
                .map_or("local", |e| e.authority.as_str());
            info!(broker = name, "using in-process broker");
            Ok(MemoryBroker::named(name))
        }
        BindingKind::Generic => {
            if let Some(secure) = binding.endpoints.iter().find(|e| e.is_secure()) {
                return Err(MessagingError::UnsupportedBinding(format!(
                    "{}://{} needs TLS, which this build does not provide",
                    secure.scheme, secure.authority
                )));
            }
            let endpoints = binding
                .endpoints
                .into_iter()
                .map(|e| e.authority)
                .collect();
            Ok(Arc::new(TcpBrokerTransport::connect(endpoints).await?))
        }
        BindingKind::Direct => Err(MessagingError::UnsupportedBinding(format!(
            "AMQP broker {url}: no AMQP client is compiled in"
        ))),
    }
}
