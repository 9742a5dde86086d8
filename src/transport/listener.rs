//! Front-facing listener.
//!
//! TCP everywhere; Unix domain sockets on unix platforms. A Unix listener
//! removes a stale socket file before binding and its own file on drop.

use std::net::SocketAddr;

use tokio::net::TcpListener;

use super::endpoint::{BoxedReader, BoxedWriter, Endpoint};
use crate::error::{BridgeError, Result};

/// An accepted front-facing connection, already split.
pub struct Accepted {
    pub reader: BoxedReader,
    pub writer: BoxedWriter,
    /// Peer address for logging.
    pub peer: String,
}

/// Listener for front-facing connections.
pub enum Listener {
    Tcp(TcpListener),
    #[cfg(unix)]
    Unix {
        listener: tokio::net::UnixListener,
        path: std::path::PathBuf,
    },
}

impl Listener {
    pub async fn bind(endpoint: &Endpoint) -> Result<Self> {
        match endpoint {
            Endpoint::Tcp(addr) => Ok(Self::Tcp(TcpListener::bind(addr.as_str()).await?)),
            #[cfg(unix)]
            Endpoint::Unix(path) => {
                if path.exists() {
                    std::fs::remove_file(path)?;
                }
                let listener = tokio::net::UnixListener::bind(path)?;
                Ok(Self::Unix {
                    listener,
                    path: path.clone(),
                })
            }
            #[cfg(not(unix))]
            Endpoint::Unix(_) => Err(BridgeError::Config(
                "unix sockets are not available on this platform".into(),
            )),
        }
    }

    pub async fn accept(&self) -> Result<Accepted> {
        match self {
            Self::Tcp(listener) => {
                let (stream, addr) = listener.accept().await?;
                stream.set_nodelay(true)?;
                let (reader, writer) = stream.into_split();
                Ok(Accepted {
                    reader: Box::new(reader),
                    writer: Box::new(writer),
                    peer: addr.to_string(),
                })
            }
            #[cfg(unix)]
            Self::Unix { listener, path } => {
                let (stream, _addr) = listener.accept().await?;
                let (reader, writer) = stream.into_split();
                Ok(Accepted {
                    reader: Box::new(reader),
                    writer: Box::new(writer),
                    peer: path.display().to_string(),
                })
            }
        }
    }

    /// Bound TCP address (useful after binding port 0).
    pub fn local_addr(&self) -> Result<SocketAddr> {
        match self {
            Self::Tcp(listener) => Ok(listener.local_addr()?),
            #[cfg(unix)]
            Self::Unix { .. } => Err(BridgeError::Config(
                "unix listener has no socket address".into(),
            )),
        }
    }

    /// The endpoint actually bound.
    pub fn endpoint(&self) -> Result<Endpoint> {
        match self {
            Self::Tcp(listener) => Ok(Endpoint::Tcp(listener.local_addr()?.to_string())),
            #[cfg(unix)]
            Self::Unix { path, .. } => Ok(Endpoint::Unix(path.clone())),
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        #[cfg(unix)]
        {
            if let Self::Unix { path, .. } = self {
                let _ = std::fs::remove_file(path);
            }
        }
    }
}
