//! # fcgi-bridge
//!
//! FastCGI record codec and multiplexing proxy.
//!
//! The proxy sits between a front-facing server and a backend application
//! process. It accepts FastCGI records on front-facing connections, tracks
//! every request by id and forwards each one over a persistent backend
//! connection, carrying many requests per connection when the backend allows
//! it, and routes the backend's output back to the right caller.
//!
//! ## Architecture
//!
//! - **Protocol** ([`protocol`]): 8-byte headers, name/value pairs, typed
//!   records, and the reassembler that turns arbitrary reads into frames
//! - **Session** ([`session`]): per-connection request table
//! - **Bridge** ([`bridge`]): one task per front-facing connection
//! - **Backend** ([`backend`]): pooled backend connections with id routing
//!
//! ## Example
//!
//! ```ignore
//! use fcgi_bridge::ProxyServer;
//!
//! #[tokio::main]
//! async fn main() {
//!     let server = ProxyServer::builder()
//!         .listen("127.0.0.1:9000")
//!         .backend("127.0.0.1:9001")
//!         .bind()
//!         .await
//!         .unwrap();
//!
//!     server.run().await.unwrap();
//! }
//! ```

pub mod backend;
pub mod bridge;
pub mod config;
pub mod error;
pub mod protocol;
pub mod session;
pub mod transport;
pub mod writer;

mod backpressure;
mod server;

pub use backend::{BackendPool, MultiplexMode};
pub use bridge::ProxyBridge;
pub use config::{BackendConfig, ProxyConfig};
pub use error::BridgeError;
pub use server::{ProxyBuilder, ProxyServer};
pub use session::Capabilities;
