//! Stream endpoints: `host:port` for TCP, `unix:/path` for Unix domain
//! sockets.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

use crate::error::{BridgeError, Result};

/// Prefix selecting a Unix domain socket.
pub const UNIX_PREFIX: &str = "unix:";

/// Read half of a connected stream.
pub type BoxedReader = Box<dyn AsyncRead + Unpin + Send>;
/// Write half of a connected stream.
pub type BoxedWriter = Box<dyn AsyncWrite + Unpin + Send>;

/// Where a stream connects or listens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Tcp(String),
    Unix(PathBuf),
}

impl Endpoint {
    pub fn parse(s: &str) -> Result<Self> {
        let s = s.trim();
        if let Some(path) = s.strip_prefix(UNIX_PREFIX) {
            if path.is_empty() {
                return Err(BridgeError::Config("unix endpoint without a path".into()));
            }
            return Ok(Self::Unix(PathBuf::from(path)));
        }

        // host:port, with the port required
        match s.rsplit_once(':') {
            Some((host, port)) if !host.is_empty() && port.parse::<u16>().is_ok() => {
                Ok(Self::Tcp(s.to_string()))
            }
            _ => Err(BridgeError::Config(format!(
                "endpoint `{s}` is neither host:port nor unix:/path"
            ))),
        }
    }

    #[inline]
    pub fn is_unix(&self) -> bool {
        matches!(self, Self::Unix(_))
    }
}

impl FromStr for Endpoint {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp(addr) => f.write_str(addr),
            Self::Unix(path) => write!(f, "{UNIX_PREFIX}{}", path.display()),
        }
    }
}

/// Connect to an endpoint and split the stream, bounded by `timeout`.
pub async fn connect(endpoint: &Endpoint, timeout: Duration) -> Result<(BoxedReader, BoxedWriter)> {
    let connecting = connect_inner(endpoint);
    match tokio::time::timeout(timeout, connecting).await {
        Ok(Ok(halves)) => Ok(halves),
        Ok(Err(e)) => Err(BridgeError::BackendUnavailable(format!(
            "connect to {endpoint} failed: {e}"
        ))),
        Err(_) => Err(BridgeError::Timeout("backend connect")),
    }
}

async fn connect_inner(endpoint: &Endpoint) -> Result<(BoxedReader, BoxedWriter)> {
    match endpoint {
        Endpoint::Tcp(addr) => {
            let stream = TcpStream::connect(addr.as_str()).await?;
            stream.set_nodelay(true)?;
            let (reader, writer) = stream.into_split();
            Ok((Box::new(reader), Box::new(writer)))
        }
        #[cfg(unix)]
        Endpoint::Unix(path) => {
            let stream = tokio::net::UnixStream::connect(path).await?;
            let (reader, writer) = stream.into_split();
            Ok((Box::new(reader), Box::new(writer)))
        }
        #[cfg(not(unix))]
        Endpoint::Unix(_) => Err(BridgeError::Config(
            "unix sockets are not available on this platform".into(),
        )),
    }
}
