//! Log subscriber setup and metric names.

use std::net::SocketAddr;

use anyhow::Context as _;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Metric names recorded by the node.
pub mod metric {
    /// Requests published by a dispatcher.
    pub const REQUESTS_SUBMITTED: &str = "courier_requests_submitted_total";
    /// Replies received by a dispatcher, labelled by `status`.
    pub const REPLIES: &str = "courier_replies_total";
    /// Requests finished by a worker, labelled by `outcome`.
    pub const REQUESTS_PROCESSED: &str = "courier_requests_processed_total";
    /// Heartbeats published.
    pub const HEARTBEATS_SENT: &str = "courier_heartbeats_sent_total";
    /// Deliveries acknowledged without being handled, labelled by `reason`.
    pub const MESSAGES_DROPPED: &str = "courier_messages_dropped_total";
}

/// Console log layout.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum LogFormat {
    /// Human-readable, one event per line.
    #[default]
    Pretty,
    /// One JSON object per event.
    Json,
}

/// Installs the global subscriber. `RUST_LOG` wins over `default_directive`.
///
/// # Errors
///
/// Fails if a global subscriber is already set.
pub fn init_tracing(format: LogFormat, default_directive: &str) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_directive))
        .context("invalid log filter")?;
    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Pretty => registry
            .with(tracing_subscriber::fmt::layer().with_target(false))
            .try_init(),
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json().flatten_event(true))
            .try_init(),
    }
    .context("installing tracing subscriber")
}

/// Serves Prometheus metrics on `addr`. Must run inside a Tokio runtime.
///
/// # Errors
///
/// Fails if a recorder is already installed or the address cannot be bound.
pub fn install_metrics_exporter(addr: SocketAddr) -> anyhow::Result<()> {
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .with_context(|| format!("installing metrics exporter on {addr}"))
}

#[cfg(test)]
mod tests {
    use clap::ValueEnum;

    use super::*;

    #[test]
    fn log_format_parses_from_cli_names() {
        assert_eq!(LogFormat::from_str("json", true).unwrap(), LogFormat::Json);
        assert_eq!(LogFormat::from_str("pretty", true).unwrap(), LogFormat::Pretty);
        assert!(LogFormat::from_str("xml", true).is_err());
    }

    #[test]
    fn metric_names_share_prefix() {
        for name in [
            metric::REQUESTS_SUBMITTED,
            metric::REPLIES,
            metric::REQUESTS_PROCESSED,
            metric::HEARTBEATS_SENT,
            metric::MESSAGES_DROPPED,
        ] {
            assert!(name.starts_with("courier_") && name.ends_with("_total"), "{name}");
        }
    }
}
