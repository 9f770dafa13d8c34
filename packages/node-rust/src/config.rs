//! Configuration types for courier nodes.
//!
//! Plain structs with `Default` impls. The `courier` binary fills them from
//! command-line arguments and environment variables.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use courier_core::{Address, Codec};

use crate::channel::AckMode;
use crate::error::UnavailableKind;

/// Broker connection and listener settings.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Broker URL: `memory://<name>`, `tcp://host:port`, `failover:(...)`.
    pub broker_url: String,
    /// Body codec used for outgoing messages.
    pub codec: Codec,
    /// Maximum unacknowledged deliveries per consumer.
    pub prefetch: usize,
    /// When a listener acknowledges relative to its handler.
    pub ack_mode: AckMode,
    /// Maximum time a single publish may take.
    pub send_timeout: Duration,
    /// Pause before a listener re-subscribes after its consumer ended.
    pub resubscribe_backoff: Duration,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            broker_url: "memory://local".to_string(),
            codec: Codec::Json,
            prefetch: 10,
            ack_mode: AckMode::AfterHandler,
            send_timeout: Duration::from_secs(5),
            resubscribe_backoff: Duration::from_secs(1),
        }
    }
}

/// Requester-side settings.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Where requests are sent.
    pub request_address: Address,
    /// Where workers send replies for this requester.
    pub reply_address: Address,
    /// Interval between status checks in `await_sync`.
    pub poll_interval: Duration,
    /// Non-terminal entries older than this are evicted.
    pub pending_ttl: Duration,
    /// Terminal entries nobody collected are evicted after this.
    pub completed_ttl: Duration,
    /// How often the eviction sweep runs.
    pub sweep_interval: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            request_address: Address::queue("courier.requests"),
            reply_address: Address::queue("courier.replies"),
            poll_interval: Duration::from_millis(500),
            pending_ttl: Duration::from_secs(3600),
            completed_ttl: Duration::from_secs(600),
            sweep_interval: Duration::from_secs(60),
        }
    }
}

/// Worker-side settings.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Queue the worker consumes requests from.
    pub request_address: Address,
    /// Reply destination when a request carries no `replyTo`.
    pub default_reply_address: Address,
    /// Number of processing tasks behind the handoff queue.
    pub concurrency: usize,
    /// Minimum spacing between progress replies for one request.
    pub progress_interval: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            request_address: Address::queue("courier.requests"),
            default_reply_address: Address::queue("courier.replies"),
            concurrency: 1,
            progress_interval: Duration::from_secs(2),
        }
    }
}

/// Heartbeat emission settings.
#[derive(Debug, Clone)]
pub struct HeartbeatConfig {
    /// Topic heartbeats are published to.
    pub address: Address,
    /// Delay before the first beat.
    pub initial_delay: Duration,
    /// Spacing between beats.
    pub period: Duration,
    /// Identifies this instance; a UUID when unset.
    pub instance_id: Option<String>,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            address: Address::topic("courier.heartbeats"),
            initial_delay: Duration::from_secs(1),
            period: Duration::from_secs(5),
            instance_id: None,
        }
    }
}

/// Content transport backends to register, in routing order.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Root directory for `file://` content created by this node.
    pub file_root: PathBuf,
    /// S3-compatible endpoint (path-style), e.g. `http://minio:9000`.
    pub object_store_endpoint: Option<String>,
    /// Bucket used when this node creates object-storage content.
    pub object_store_bucket: String,
    /// Base URL of a WebDAV-like document store.
    pub remote_base_url: Option<String>,
    /// Poll spacing while waiting for content to reach its expected size.
    pub availability_poll_interval: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            file_root: std::env::temp_dir().join("courier"),
            object_store_endpoint: None,
            object_store_bucket: "courier".to_string(),
            remote_base_url: None,
            availability_poll_interval: Duration::from_millis(250),
        }
    }
}

/// What to do about an unavailable component.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionKind {
    /// Stop taking work; readiness turns unhealthy.
    Drain,
    /// Exit the process.
    Terminate,
}

/// Reaction policy for `ComponentUnavailable` errors.
#[derive(Debug, Clone)]
pub struct ActionConfig {
    /// Actions run, in order, for each kind. Unlisted kinds are only logged.
    pub policies: HashMap<UnavailableKind, Vec<ActionKind>>,
    /// Upper bound on each individual action.
    pub action_timeout: Duration,
    /// Process exit status used by the terminate action.
    pub exit_code: i32,
}

impl Default for ActionConfig {
    fn default() -> Self {
        let mut policies = HashMap::new();
        policies.insert(
            UnavailableKind::Executable,
            vec![ActionKind::Drain, ActionKind::Terminate],
        );
        policies.insert(
            UnavailableKind::Configuration,
            vec![ActionKind::Terminate],
        );
        Self {
            policies,
            action_timeout: Duration::from_secs(10),
            exit_code: 1,
        }
    }
}

/// Everything a node needs, grouped by concern.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub channel: ChannelConfig,
    pub dispatch: DispatchConfig,
    pub worker: WorkerConfig,
    pub heartbeat: HeartbeatConfig,
    pub transport: TransportConfig,
    pub action: ActionConfig,
    /// Bind address for the health endpoints; disabled when `None`.
    pub http_addr: Option<SocketAddr>,
    /// How long shutdown waits for in-flight work.
    pub drain_timeout: Duration,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            channel: ChannelConfig::default(),
            dispatch: DispatchConfig::default(),
            worker: WorkerConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            transport: TransportConfig::default(),
            action: ActionConfig::default(),
            http_addr: None,
            drain_timeout: Duration::from_secs(30),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_config_defaults() {
        let config = ChannelConfig::default();
        assert_eq!(config.broker_url, "memory://local");
        assert_eq!(config.codec, Codec::Json);
        assert_eq!(config.prefetch, 10);
        assert_eq!(config.ack_mode, AckMode::AfterHandler);
        assert_eq!(config.send_timeout, Duration::from_secs(5));
        assert_eq!(config.resubscribe_backoff, Duration::from_secs(1));
    }

    #[test]
    fn dispatch_config_defaults() {
        let config = DispatchConfig::default();
        assert_eq!(config.request_address, Address::queue("courier.requests"));
        assert_eq!(config.reply_address, Address::queue("courier.replies"));
        assert_eq!(config.poll_interval, Duration::from_millis(500));
        assert_eq!(config.pending_ttl, Duration::from_secs(3600));
        assert_eq!(config.completed_ttl, Duration::from_secs(600));
    }

    #[test]
    fn worker_and_heartbeat_defaults() {
        let worker = WorkerConfig::default();
        assert_eq!(worker.concurrency, 1);
        assert_eq!(worker.progress_interval, Duration::from_secs(2));

        let heartbeat = HeartbeatConfig::default();
        assert_eq!(heartbeat.period, Duration::from_secs(5));
        assert!(heartbeat.address.is_topic());
        assert!(heartbeat.instance_id.is_none());
    }

    #[test]
    fn transport_config_defaults() {
        let config = TransportConfig::default();
        assert!(config.file_root.ends_with("courier"));
        assert!(config.object_store_endpoint.is_none());
        assert!(config.remote_base_url.is_none());
        assert_eq!(config.availability_poll_interval, Duration::from_millis(250));
    }

    #[test]
    fn action_config_defaults() {
        let config = ActionConfig::default();
        assert_eq!(config.exit_code, 1);
        assert_eq!(config.action_timeout, Duration::from_secs(10));
        assert_eq!(
            config.policies.get(&UnavailableKind::Executable),
            Some(&vec![ActionKind::Drain, ActionKind::Terminate])
        );
        assert!(!config.policies.contains_key(&UnavailableKind::Broker));
    }

    #[test]
    fn node_config_has_no_http_by_default() {
        let config = NodeConfig::default();
        assert!(config.http_addr.is_none());
        assert_eq!(config.drain_timeout, Duration::from_secs(30));
    }
}
