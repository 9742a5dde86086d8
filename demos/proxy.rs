//! FastCGI proxy - listen for a web server, forward to a backend pool.
//!
//! This example demonstrates:
//! - Loading a `ProxyConfig` from a JSON file (or using the defaults)
//! - Installing a `tracing` subscriber filtered by `RUST_LOG`
//! - Running the accept loop until Ctrl-C
//!
//! # Running
//!
//! ```text
//! RUST_LOG=fcgi_bridge=debug cargo run --example proxy -- proxy.json
//! ```
//!
//! with `proxy.json`:
//!
//! ```json
//! {
//!   "listen": "127.0.0.1:9000",
//!   "backend": { "endpoint": "unix:/run/php/fpm.sock", "multiplex": "discover" }
//! }
//! ```

use fcgi_bridge::{ProxyBuilder, ProxyConfig};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = match std::env::args().nth(1) {
        Some(path) => ProxyConfig::from_json_file(&path)?,
        None => ProxyConfig::default(),
    };

    let server = ProxyBuilder::from_config(config).bind().await?;
    server
        .run_until(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    Ok(())
}
