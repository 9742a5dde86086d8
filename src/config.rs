//! Proxy configuration.
//!
//! Every field has a default, so a JSON file only needs the values it
//! changes. Durations are given in milliseconds.
//!
//! ```json
//! {
//!   "listen": "127.0.0.1:9000",
//!   "backend": {
//!     "endpoint": "unix:/run/php/fpm.sock",
//!     "pool_size": 4,
//!     "multiplex": "discover",
//!     "response_timeout": 30000
//!   },
//!   "capabilities": { "max_conns": 256, "max_reqs": 16, "mpxs_conns": true }
//! }
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::backend::MultiplexMode;
use crate::error::{BridgeError, Result};
use crate::protocol::{HEADER_SIZE, MAX_FRAME_SIZE};
use crate::session::{Capabilities, DEFAULT_MAX_BUFFERED_INPUT, DEFAULT_MAX_PARAMS_SIZE};
use crate::transport::Endpoint;
use crate::writer::WriterConfig;

/// Default front-facing listen address.
pub const DEFAULT_LISTEN: &str = "127.0.0.1:9000";

/// Default backend address.
pub const DEFAULT_BACKEND: &str = "127.0.0.1:9001";

/// Default number of backend connections.
pub const DEFAULT_POOL_SIZE: usize = 1;

/// Default cap on concurrent front-facing connections.
pub const DEFAULT_MAX_CONNS: u32 = 1024;

/// Default read buffer per connection (64KB).
pub const DEFAULT_READ_BUFFER_SIZE: usize = 64 * 1024;

/// Default capacity of each per-request response channel.
pub const DEFAULT_ROUTE_CAPACITY: usize = 64;

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(2);

/// Backend side of the proxy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// `host:port` or `unix:/path`.
    pub endpoint: String,
    pub pool_size: usize,
    pub multiplex: MultiplexMode,
    /// Requests per connection when multiplexing is enabled.
    pub max_requests: u32,
    #[serde(with = "duration_ms")]
    pub connect_timeout: Duration,
    /// Longest silence tolerated from the backend while a request waits.
    #[serde(with = "duration_ms")]
    pub response_timeout: Duration,
    /// Bound on the get-values exchange used for discovery.
    #[serde(with = "duration_ms")]
    pub query_timeout: Duration,
    /// Frames buffered per request between the reader task and its relay.
    pub route_capacity: usize,
    pub writer: WriterConfig,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_BACKEND.to_string(),
            pool_size: DEFAULT_POOL_SIZE,
            multiplex: MultiplexMode::Disabled,
            max_requests: 1,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            response_timeout: DEFAULT_RESPONSE_TIMEOUT,
            query_timeout: DEFAULT_QUERY_TIMEOUT,
            route_capacity: DEFAULT_ROUTE_CAPACITY,
            writer: WriterConfig::default(),
        }
    }
}

impl BackendConfig {
    pub fn endpoint(&self) -> Result<Endpoint> {
        Endpoint::parse(&self.endpoint)
    }
}

/// Full proxy configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Front-facing listen endpoint.
    pub listen: String,
    pub backend: BackendConfig,
    /// What the proxy declares to front-facing peers.
    pub capabilities: Capabilities,
    /// Ceiling on a single inbound record (header + content + padding).
    pub max_frame_size: usize,
    /// Input held per request while it waits for a backend slot.
    pub max_buffered_input: usize,
    /// Ceiling on one request's encoded parameter stream.
    pub max_params_size: usize,
    pub read_buffer_size: usize,
    /// Writer settings for front-facing connections.
    pub writer: WriterConfig,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen: DEFAULT_LISTEN.to_string(),
            backend: BackendConfig::default(),
            capabilities: Capabilities {
                max_conns: DEFAULT_MAX_CONNS,
                ..Capabilities::default()
            },
            max_frame_size: MAX_FRAME_SIZE,
            max_buffered_input: DEFAULT_MAX_BUFFERED_INPUT,
            max_params_size: DEFAULT_MAX_PARAMS_SIZE,
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            writer: WriterConfig::default(),
        }
    }
}

impl ProxyConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    pub fn listen_endpoint(&self) -> Result<Endpoint> {
        Endpoint::parse(&self.listen)
    }

    /// Reject settings the proxy cannot run with.
    pub fn validate(&self) -> Result<()> {
        self.listen_endpoint()?;
        self.backend.endpoint()?;

        if self.backend.pool_size == 0 {
            return Err(BridgeError::Config("backend.pool_size must be at least 1".into()));
        }
        if self.backend.max_requests == 0 {
            return Err(BridgeError::Config(
                "backend.max_requests must be at least 1".into(),
            ));
        }
        if self.capabilities.max_reqs == 0 || self.capabilities.max_conns == 0 {
            return Err(BridgeError::Config(
                "capabilities.max_reqs and capabilities.max_conns must be at least 1".into(),
            ));
        }
        if self.max_frame_size < HEADER_SIZE {
            return Err(BridgeError::Config(format!(
                "max_frame_size must be at least {HEADER_SIZE}"
            )));
        }
        if self.max_params_size == 0 {
            return Err(BridgeError::Config("max_params_size must not be zero".into()));
        }
        if self.read_buffer_size == 0 {
            return Err(BridgeError::Config("read_buffer_size must not be zero".into()));
        }
        Ok(())
    }
}

/// Serialize a `Duration` as whole milliseconds.
pub(crate) mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
