//! Proxy builder and accept loop.
//!
//! The [`ProxyBuilder`] provides a fluent API over [`ProxyConfig`]. The
//! [`ProxyServer`] manages the lifecycle:
//! 1. Validate configuration
//! 2. Bind the front-facing listener
//! 3. Accept connections, one bridge task each
//!
//! # Example
//!
//! ```ignore
//! use fcgi_bridge::{MultiplexMode, ProxyServer};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let server = ProxyServer::builder()
//!         .listen("127.0.0.1:9000")
//!         .backend("unix:/run/php/fpm.sock")
//!         .pool_size(4)
//!         .multiplex(MultiplexMode::Discover)
//!         .bind()
//!         .await?;
//!
//!     server.run().await?;
//!     Ok(())
//! }
//! ```

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;

use crate::backend::{BackendPool, MultiplexMode};
use crate::bridge::ProxyBridge;
use crate::config::ProxyConfig;
use crate::error::Result;
use crate::session::Capabilities;
use crate::transport::{Endpoint, Listener};

/// Builder for configuring and binding a proxy server.
pub struct ProxyBuilder {
    config: ProxyConfig,
}

impl ProxyBuilder {
    pub fn new() -> Self {
        Self {
            config: ProxyConfig::default(),
        }
    }

    /// Start from a loaded configuration.
    pub fn from_config(config: ProxyConfig) -> Self {
        Self { config }
    }

    /// Front-facing listen endpoint (`host:port` or `unix:/path`).
    pub fn listen(mut self, endpoint: &str) -> Self {
        self.config.listen = endpoint.to_string();
        self
    }

    /// Backend endpoint (`host:port` or `unix:/path`).
    pub fn backend(mut self, endpoint: &str) -> Self {
        self.config.backend.endpoint = endpoint.to_string();
        self
    }

    pub fn pool_size(mut self, size: usize) -> Self {
        self.config.backend.pool_size = size;
        self
    }

    pub fn multiplex(mut self, mode: MultiplexMode) -> Self {
        self.config.backend.multiplex = mode;
        self
    }

    /// Requests per backend connection when multiplexing is enabled.
    pub fn max_backend_requests(mut self, limit: u32) -> Self {
        self.config.backend.max_requests = limit;
        self
    }

    /// What the proxy declares to front-facing peers.
    pub fn capabilities(mut self, capabilities: Capabilities) -> Self {
        self.config.capabilities = capabilities;
        self
    }

    pub fn max_frame_size(mut self, size: usize) -> Self {
        self.config.max_frame_size = size;
        self
    }

    pub fn max_buffered_input(mut self, bytes: usize) -> Self {
        self.config.max_buffered_input = bytes;
        self
    }

    pub fn max_params_size(mut self, bytes: usize) -> Self {
        self.config.max_params_size = bytes;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.backend.connect_timeout = timeout;
        self
    }

    pub fn response_timeout(mut self, timeout: Duration) -> Self {
        self.config.backend.response_timeout = timeout;
        self
    }

    /// Set maximum pending frames per writer before backpressure.
    pub fn max_pending_frames(mut self, limit: usize) -> Self {
        self.config.writer.max_pending_frames = limit;
        self.config.backend.writer.max_pending_frames = limit;
        self
    }

    /// Set backpressure timeout for front and backend writers.
    pub fn backpressure_timeout(mut self, timeout: Duration) -> Self {
        self.config.writer.backpressure_timeout = timeout;
        self.config.backend.writer.backpressure_timeout = timeout;
        self
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    /// Validate the configuration and bind the listener.
    ///
    /// Backend connections are opened on first use.
    pub async fn bind(self) -> Result<ProxyServer> {
        self.config.validate()?;
        let endpoint = self.config.listen_endpoint()?;
        let listener = Listener::bind(&endpoint).await?;
        let pool = Arc::new(BackendPool::new(self.config.backend.clone())?);
        let connections = Arc::new(Semaphore::new(self.config.capabilities.max_conns as usize));

        tracing::info!(
            "Listening on {}, backend {}",
            listener.endpoint()?,
            pool.endpoint()
        );
        Ok(ProxyServer {
            listener,
            bridge: ProxyBridge::new(Arc::new(self.config), pool),
            connections,
        })
    }
}

impl Default for ProxyBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// A bound proxy server.
pub struct ProxyServer {
    listener: Listener,
    bridge: ProxyBridge,
    /// Caps concurrent front-facing connections at `max_conns`.
    connections: Arc<Semaphore>,
}

impl ProxyServer {
    pub fn builder() -> ProxyBuilder {
        ProxyBuilder::new()
    }

    /// Bound TCP address.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn endpoint(&self) -> Result<Endpoint> {
        self.listener.endpoint()
    }

    pub fn bridge(&self) -> &ProxyBridge {
        &self.bridge
    }

    /// Accept connections forever.
    pub async fn run(self) -> Result<()> {
        self.run_until(std::future::pending::<()>()).await
    }

    /// Accept connections until `shutdown` resolves.
    ///
    /// Connections already accepted keep running in their own tasks.
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        loop {
            let permit = tokio::select! {
                _ = &mut shutdown => break,
                permit = self.connections.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let accepted = tokio::select! {
                _ = &mut shutdown => break,
                accepted = self.listener.accept() => accepted,
            };

            let accepted = match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    tracing::error!("Accept failed: {}", e);
                    continue;
                }
            };

            tracing::debug!("Accepted front connection from {}", accepted.peer);
            let bridge = self.bridge.clone();
            tokio::spawn(async move {
                let _permit = permit;
                let peer = accepted.peer;
                match bridge.run(accepted.reader, accepted.writer).await {
                    Ok(()) => tracing::debug!("Front connection {} finished", peer),
                    Err(e) => tracing::warn!("Front connection {} failed: {}", peer, e),
                }
            });
        }

        tracing::info!("Proxy stopped accepting connections");
        Ok(())
    }
}
