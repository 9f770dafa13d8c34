//! Broker endpoint addresses and broker URL binding selection.
//!
//! Addresses are written `queue:<name>` (point-to-point, competing consumers)
//! or `topic:<name>` (publish/subscribe fan-out). The broker URL scheme picks
//! the binding used to reach the broker.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Errors from parsing addresses and broker URLs.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AddressError {
    #[error("address must start with `queue:` or `topic:`: {0}")]
    MissingKind(String),
    #[error("address has an empty name: {0}")]
    EmptyName(String),
    #[error("broker url has no scheme: {0}")]
    MissingScheme(String),
    #[error("unsupported broker url scheme `{scheme}` in {url}")]
    UnsupportedScheme { scheme: String, url: String },
    #[error("failover url lists no endpoints: {0}")]
    EmptyFailover(String),
}

// ---------------------------------------------------------------------------
// Address
// ---------------------------------------------------------------------------

/// Delivery semantics of an address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AddressKind {
    /// Each message goes to exactly one consumer.
    Queue,
    /// Each message goes to every current subscriber.
    Topic,
}

/// A named broker endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Address {
    pub kind: AddressKind,
    pub name: String,
}

impl Address {
    /// Point-to-point queue named `name`.
    #[must_use]
    pub fn queue(name: impl Into<String>) -> Self {
        Self {
            kind: AddressKind::Queue,
            name: name.into(),
        }
    }

    /// Publish/subscribe topic named `name`.
    #[must_use]
    pub fn topic(name: impl Into<String>) -> Self {
        Self {
            kind: AddressKind::Topic,
            name: name.into(),
        }
    }

    /// Returns `true` for topics.
    #[must_use]
    pub fn is_topic(&self) -> bool {
        self.kind == AddressKind::Topic
    }
}

impl FromStr for Address {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (kind, name) = if let Some(name) = s.strip_prefix("queue:") {
            (AddressKind::Queue, name)
        } else if let Some(name) = s.strip_prefix("topic:") {
            (AddressKind::Topic, name)
        } else {
            return Err(AddressError::MissingKind(s.to_string()));
        };

        let name = name.trim();
        if name.is_empty() {
            return Err(AddressError::EmptyName(s.to_string()));
        }
        Ok(Self {
            kind,
            name: name.to_string(),
        })
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            AddressKind::Queue => write!(f, "queue:{}", self.name),
            AddressKind::Topic => write!(f, "topic:{}", self.name),
        }
    }
}

impl Serialize for Address {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

// ---------------------------------------------------------------------------
// BrokerBinding
// ---------------------------------------------------------------------------

/// Which broker client family a URL selects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindingKind {
    /// `amqp`, `amqps`, `amqp+ssl`: direct AMQP binding.
    Direct,
    /// `tcp`, `ssl`, `failover`: generic framed binding.
    Generic,
    /// `memory`: in-process broker, no network.
    InProcess,
}

/// A single network endpoint within a broker URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerEndpoint {
    pub scheme: String,
    /// `host:port` (or the in-process broker name).
    pub authority: String,
}

impl BrokerEndpoint {
    /// Whether this endpoint asks for transport security.
    #[must_use]
    pub fn is_secure(&self) -> bool {
        matches!(self.scheme.as_str(), "ssl" | "amqps" | "amqp+ssl")
    }
}

/// A parsed broker URL: binding kind plus the endpoints to try, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerBinding {
    pub kind: BindingKind,
    pub endpoints: Vec<BrokerEndpoint>,
}

impl BrokerBinding {
    /// Parses a broker URL and selects its binding from the scheme.
    ///
    /// `failover:(tcp://a:1,tcp://b:2)` expands to its member endpoints, tried
    /// in the listed order.
    ///
    /// # Errors
    ///
    /// Returns an `AddressError` for a missing or unknown scheme, or an empty
    /// failover list.
    pub fn from_url(url: &str) -> Result<Self, AddressError> {
        let url = url.trim();
        if let Some(rest) = url.strip_prefix("failover:") {
            let inner = rest
                .trim()
                .trim_start_matches('(')
                .split(')')
                .next()
                .unwrap_or_default();
            let endpoints = inner
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(parse_endpoint)
                .collect::<Result<Vec<_>, _>>()?;
            if endpoints.is_empty() {
                return Err(AddressError::EmptyFailover(url.to_string()));
            }
            if let Some(bad) = endpoints.iter().find(|e| !matches!(e.scheme.as_str(), "tcp" | "ssl")) {
                return Err(AddressError::UnsupportedScheme {
                    scheme: bad.scheme.clone(),
                    url: url.to_string(),
                });
            }
            return Ok(Self {
                kind: BindingKind::Generic,
                endpoints,
            });
        }

        let endpoint = parse_endpoint(url)?;
        let kind = match endpoint.scheme.as_str() {
            "amqp" | "amqps" | "amqp+ssl" => BindingKind::Direct,
            "tcp" | "ssl" => BindingKind::Generic,
            "memory" => BindingKind::InProcess,
            other => {
                return Err(AddressError::UnsupportedScheme {
                    scheme: other.to_string(),
                    url: url.to_string(),
                })
            }
        };
        Ok(Self {
            kind,
            endpoints: vec![endpoint],
        })
    }
}

fn parse_endpoint(url: &str) -> Result<BrokerEndpoint, AddressError> {
    let (scheme, rest) = url
        .split_once(':')
        .ok_or_else(|| AddressError::MissingScheme(url.to_string()))?;
    if scheme.is_empty() {
        return Err(AddressError::MissingScheme(url.to_string()));
    }
    let authority = rest
        .trim_start_matches("//")
        .split(['/', '?'])
        .next()
        .unwrap_or_default();
    Ok(BrokerEndpoint {
        scheme: scheme.to_ascii_lowercase(),
        authority: authority.to_string(),
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
