//! Round-robin pool of lazily connected backend connections.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::Mutex;

use super::connection::{BackendConnection, BackendLease};
use crate::config::BackendConfig;
use crate::error::{BridgeError, Result};
use crate::transport::Endpoint;

type Slot = Mutex<Option<Arc<BackendConnection>>>;

/// `pool_size` backend connections, opened on first use and reopened after
/// they fail.
pub struct BackendPool {
    config: BackendConfig,
    endpoint: Endpoint,
    slots: Vec<Slot>,
    next: AtomicUsize,
}

impl BackendPool {
    pub fn new(config: BackendConfig) -> Result<Self> {
        if config.pool_size == 0 {
            return Err(BridgeError::Config("backend pool needs at least one slot".into()));
        }
        let endpoint = config.endpoint()?;
        let slots = (0..config.pool_size).map(|_| Mutex::new(None)).collect();
        Ok(Self {
            config,
            endpoint,
            slots,
            next: AtomicUsize::new(0),
        })
    }

    #[inline]
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.slots.len()
    }

    #[inline]
    pub fn config(&self) -> &BackendConfig {
        &self.config
    }

    /// Lease a request slot.
    ///
    /// Any free slot is taken immediately, starting from the round-robin
    /// position; when every connection is busy the caller queues on the
    /// round-robin choice.
    pub async fn lease(&self) -> Result<BackendLease> {
        let count = self.slots.len();
        let start = self.next.fetch_add(1, Ordering::Relaxed) % count;

        for offset in 0..count {
            let connection = self.connection((start + offset) % count).await?;
            match connection.try_lease() {
                Ok(Some(lease)) => return Ok(lease),
                Ok(None) => {}
                // closed between the check and the lease; the next call reconnects
                Err(e) => tracing::debug!("Skipping backend connection: {}", e),
            }
        }

        self.connection(start).await?.lease().await
    }

    /// Open connections that are still alive.
    pub async fn connected_count(&self) -> usize {
        let mut count = 0;
        for slot in &self.slots {
            if matches!(&*slot.lock().await, Some(conn) if !conn.is_closed()) {
                count += 1;
            }
        }
        count
    }

    async fn connection(&self, index: usize) -> Result<Arc<BackendConnection>> {
        let mut slot = self.slots[index].lock().await;
        if let Some(conn) = slot.as_ref() {
            if !conn.is_closed() {
                return Ok(conn.clone());
            }
            tracing::info!("Reconnecting backend {} (slot {})", self.endpoint, index);
        }

        let conn = Arc::new(BackendConnection::connect(&self.endpoint, &self.config).await?);
        *slot = Some(conn.clone());
        Ok(conn)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{FrameBuffer, Record, Role};
    use std::time::Duration;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    fn config(endpoint: String, pool_size: usize) -> BackendConfig {
        BackendConfig {
            endpoint,
            pool_size,
            connect_timeout: Duration::from_secs(2),
            ..BackendConfig::default()
        }
    }

    /// Accept connections and count them; read and discard everything.
    async fn sink_backend() -> (String, tokio::sync::mpsc::UnboundedReceiver<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    return;
                };
                let _ = tx.send(());
                tokio::spawn(async move {
                    let mut buf = [0u8; 1024];
                    while matches!(stream.read(&mut buf).await, Ok(n) if n > 0) {}
                });
            }
        });
        (addr, rx)
    }

    #[test]
    fn test_rejects_empty_pool() {
        assert!(BackendPool::new(config("127.0.0.1:1".into(), 0)).is_err());
        assert!(BackendPool::new(config("nope".into(), 1)).is_err());
    }

    #[tokio::test]
    async fn test_connects_lazily() {
        let (addr, mut accepted) = sink_backend().await;
        let pool = BackendPool::new(config(addr, 2)).unwrap();
        assert_eq!(pool.connected_count().await, 0);

        let lease = pool.lease().await.unwrap();
        accepted.recv().await.unwrap();
        assert_eq!(pool.connected_count().await, 1);
        drop(lease);
    }

    #[tokio::test]
    async fn test_busy_connection_spills_to_next_slot() {
        let (addr, mut accepted) = sink_backend().await;
        let pool = BackendPool::new(config(addr, 2)).unwrap();

        let first = pool.lease().await.unwrap();
        let second = pool.lease().await.unwrap();
        accepted.recv().await.unwrap();
        accepted.recv().await.unwrap();
        assert_eq!(pool.connected_count().await, 2);

        // single-request mode: both connections are now busy
        let third = tokio::time::timeout(Duration::from_millis(50), pool.lease()).await;
        assert!(third.is_err());

        drop(first);
        let third = tokio::time::timeout(Duration::from_secs(2), pool.lease())
            .await
            .unwrap()
            .unwrap();
        drop((second, third));
    }

    #[tokio::test]
    async fn test_reconnects_after_backend_closes() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let pool = BackendPool::new(config(addr, 1)).unwrap();

        let backend = tokio::spawn(async move {
            // first connection: read the begin-request, then hang up
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut frames = FrameBuffer::new();
            let mut buf = [0u8; 1024];
            loop {
                let n = stream.read(&mut buf).await.unwrap();
                if !frames.push(&buf[..n]).unwrap().is_empty() {
                    break;
                }
            }
            drop(stream);

            let (stream, _) = listener.accept().await.unwrap();
            stream
        });

        let mut lease = pool.lease().await.unwrap();
        lease.begin(Role::Responder).await.unwrap();
        let end = lease.recv().await.unwrap();
        assert!(matches!(
            Record::from_frame(end).unwrap(),
            Record::EndRequest { .. }
        ));
        drop(lease);

        let _lease = pool.lease().await.unwrap();
        let _second = backend.await.unwrap();
        assert_eq!(pool.connected_count().await, 1);
    }
}
