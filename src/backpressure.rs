//! Bounded queue slots for a connection's writer task.
//!
//! Every record queued for a front or backend socket holds one slot until
//! the writer task has pushed its bytes out. When all slots are taken the
//! producer waits for a release, up to a timeout, and then gives up with
//! [`BridgeError::BackpressureTimeout`]. A slow peer therefore stalls the
//! code feeding it instead of growing memory.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;

use crate::error::{BridgeError, Result};

/// Records a writer may have queued before producers wait.
pub const DEFAULT_MAX_PENDING: usize = 1024;

/// How long a producer waits for a free slot.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Slot accounting shared by a writer task and its handles.
#[derive(Debug, Clone)]
pub struct BackpressureController {
    slots: Arc<Semaphore>,
    limit: usize,
    timeout: Duration,
}

impl BackpressureController {
    pub fn new(limit: usize) -> Self {
        Self::with_timeout(limit, DEFAULT_TIMEOUT)
    }

    /// A zero limit is raised to one so a writer can always make progress.
    pub fn with_timeout(limit: usize, timeout: Duration) -> Self {
        let limit = limit.max(1);
        Self {
            slots: Arc::new(Semaphore::new(limit)),
            limit,
            timeout,
        }
    }

    /// Slots currently held by queued records.
    #[inline]
    pub fn pending_count(&self) -> usize {
        self.limit - self.slots.available_permits()
    }

    /// Take a slot, waiting for a release until the timeout expires.
    pub async fn reserve(&self) -> Result<()> {
        match tokio::time::timeout(self.timeout, self.slots.acquire()).await {
            Ok(Ok(permit)) => {
                permit.forget();
                Ok(())
            }
            Ok(Err(_)) => Err(BridgeError::ConnectionClosed),
            Err(_) => Err(BridgeError::BackpressureTimeout),
        }
    }

    #[inline]
    pub fn release(&self) {
        self.release_many(1);
    }

    /// Return slots after a batch hits the socket. Never exceeds the limit.
    pub fn release_many(&self, count: usize) {
        self.slots.add_permits(count.min(self.pending_count()));
    }

    /// The writer is gone: current and future waiters get `ConnectionClosed`.
    pub fn close(&self) {
        self.slots.close();
    }
}

impl Default for BackpressureController {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PENDING)
    }
}
