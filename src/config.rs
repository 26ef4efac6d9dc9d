//! Node and client configuration.
//!
//! Everything here deserializes from camelCase JSON, so a bot can keep its node list in a
//! config file and hand the parsed values to [`ClientBuilder`](crate::client::ClientBuilder).

use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{ClientError, Result};

const DEFAULT_PORT: u16 = 2333;

/// Address and credentials of one Lavalink node. Immutable once handed to a pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeConfig {
    pub identifier: String,
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub password: String,
    #[serde(default)]
    pub secure: bool,
    #[serde(default)]
    pub region_hint: Option<String>,
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

impl NodeConfig {
    pub fn new(
        identifier: impl Into<String>,
        host: impl Into<String>,
        port: u16,
        password: impl Into<String>,
    ) -> Self {
        Self {
            identifier: identifier.into(),
            host: host.into(),
            port,
            password: password.into(),
            secure: false,
            region_hint: None,
        }
    }

    pub fn secure(mut self, secure: bool) -> Self {
        self.secure = secure;
        self
    }

    pub fn region(mut self, region: impl Into<String>) -> Self {
        self.region_hint = Some(region.into());
        self
    }

    /// `ws://host:port/` or `wss://host:port/`.
    pub fn websocket_url(&self) -> Result<Url> {
        let scheme = if self.secure { "wss" } else { "ws" };
        self.url(scheme)
    }

    /// `http://host:port/` or `https://host:port/`.
    pub fn rest_url(&self) -> Result<Url> {
        let scheme = if self.secure { "https" } else { "http" };
        self.url(scheme)
    }

    fn url(&self, scheme: &str) -> Result<Url> {
        Url::parse(&format!("{}://{}:{}/", scheme, self.host, self.port))
            .map_err(|e| ClientError::Config(format!("node {}: {}", self.identifier, e)))
    }

    /// True when `hint` names this node, either by identifier or by region.
    pub fn matches_hint(&self, hint: &str) -> bool {
        self.identifier == hint || self.region_hint.as_deref() == Some(hint)
    }
}

/// Reconnect backoff for a node's control socket.
///
/// Delays follow full jitter: `uniform(0, min(cap, base * 2^attempt))`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconnectPolicy {
    #[serde(with = "millis")]
    pub base_delay: Duration,
    #[serde(with = "millis")]
    pub max_delay: Duration,
    /// `None` retries until the node is closed. A node only reaches `Failed`, and so only
    /// triggers failover, once this budget is spent.
    pub max_retries: Option<u32>,
}

/// Roughly two to five minutes of retrying with the default delays.
pub const DEFAULT_MAX_RETRIES: u32 = 10;

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            max_retries: Some(DEFAULT_MAX_RETRIES),
        }
    }
}

/// How the pool picks a node for a new or migrating session.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Balance {
    /// Fewest playing players, then lowest CPU load, then insertion order.
    #[default]
    LeastPlaying,
    RoundRobin,
    /// Lowest `players * playing + cpu * cpuLoad + memory * memoryUsedMiB` wins.
    Weighted { players: f64, cpu: f64, memory: f64 },
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
