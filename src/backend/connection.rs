//! One persistent backend stream.
//!
//! The stream is owned by two tasks: the writer task (every outbound byte)
//! and the reader task, which reassembles frames and routes them by backend
//! request id to the lease that owns the id. Requests reach the stream only
//! through a [`BackendLease`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::sync::{mpsc, oneshot, OwnedSemaphorePermit, Semaphore, TryAcquireError};

use super::MultiplexMode;
use crate::config::BackendConfig;
use crate::error::{BridgeError, Result};
use crate::protocol::{
    BeginRequestBody, EndResult, Frame, FrameBuffer, NameValuePair, Record, Role, StreamKind,
    MAX_FRAME_SIZE, NULL_REQUEST_ID, VAR_MAX_CONNS, VAR_MAX_REQS, VAR_MPXS_CONNS,
};
use crate::session::Capabilities;
use crate::transport::{self, Endpoint};
use crate::writer::{spawn_writer_task, WriterHandle};

/// Read buffer for the backend reader task.
const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Upper bound on concurrent requests per connection (non-zero u16 ids).
const MAX_IDS: usize = u16::MAX as usize;

/// Open backend request ids and where their frames go.
struct Routes {
    senders: HashMap<u16, mpsc::Sender<Frame>>,
    next_id: u16,
}

impl Routes {
    fn new() -> Self {
        Self {
            senders: HashMap::new(),
            next_id: 1,
        }
    }

    /// Allocate the next free non-zero id, cycling so ids are not reused
    /// back to back.
    fn register(&mut self, tx: mpsc::Sender<Frame>) -> Option<u16> {
        if self.senders.len() >= MAX_IDS {
            return None;
        }
        loop {
            let id = self.next_id;
            self.next_id = self.next_id.checked_add(1).unwrap_or(1);
            if !self.senders.contains_key(&id) {
                self.senders.insert(id, tx);
                return Some(id);
            }
        }
    }
}

/// State shared by the connection, its reader task and its leases.
struct Shared {
    label: String,
    routes: Mutex<Routes>,
    management: Mutex<Option<oneshot::Sender<Vec<NameValuePair>>>>,
    slots: Arc<Semaphore>,
    closed: AtomicBool,
}

impl Shared {
    fn routes(&self) -> MutexGuard<'_, Routes> {
        self.routes.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn management(&self) -> MutexGuard<'_, Option<oneshot::Sender<Vec<NameValuePair>>>> {
        self.management
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn dispatch(&self, frame: Frame) {
        let id = frame.request_id();
        if id == NULL_REQUEST_ID {
            self.answer_management(frame);
            return;
        }

        let route = self.routes().senders.get(&id).cloned();
        match route {
            Some(tx) => {
                if tx.send(frame).await.is_err() {
                    tracing::debug!("Backend {}: relay for request {} is gone", self.label, id);
                }
            }
            None => {
                tracing::debug!(
                    "Backend {}: dropping record type {} for unknown request {}",
                    self.label,
                    frame.header.record_type,
                    id
                );
            }
        }
    }

    fn answer_management(&self, frame: Frame) {
        match Record::from_frame(frame) {
            Ok(Record::GetValuesResult { pairs }) => {
                if let Some(tx) = self.management().take() {
                    let _ = tx.send(pairs);
                }
            }
            Ok(Record::UnknownType { record_type }) => {
                tracing::warn!(
                    "Backend {} does not understand record type {}",
                    self.label,
                    record_type
                );
                if let Some(tx) = self.management().take() {
                    let _ = tx.send(Vec::new());
                }
            }
            Ok(other) => {
                tracing::debug!("Backend {}: ignoring management record {:?}", self.label, other);
            }
            Err(e) => {
                tracing::warn!("Backend {}: bad management record: {}", self.label, e);
            }
        }
    }

    /// Mark the connection dead and end every routed request as overloaded.
    fn fail_all(&self) {
        let routes: Vec<(u16, mpsc::Sender<Frame>)> = {
            let mut routes = self.routes();
            self.closed.store(true, Ordering::SeqCst);
            routes.senders.drain().collect()
        };
        self.slots.close();
        self.management().take();

        if !routes.is_empty() {
            tracing::warn!(
                "Backend {} lost with {} requests in flight",
                self.label,
                routes.len()
            );
        }
        for (id, tx) in routes {
            let end = Record::EndRequest {
                request_id: id,
                result: EndResult::overloaded(),
            };
            // a full or closed channel still ends the relay once the sender drops
            let _ = tx.try_send(end.into_frame());
        }
    }
}

/// A persistent connection to one backend process.
pub struct BackendConnection {
    shared: Arc<Shared>,
    writer: WriterHandle,
    capabilities: Capabilities,
    route_capacity: usize,
}

impl BackendConnection {
    /// Start the reader and writer tasks over an already-connected stream.
    ///
    /// The connection starts in single-request mode; see [`negotiate`](Self::negotiate).
    pub fn spawn<R, W>(reader: R, writer: W, config: &BackendConfig) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let shared = Arc::new(Shared {
            label: config.endpoint.clone(),
            routes: Mutex::new(Routes::new()),
            management: Mutex::new(None),
            slots: Arc::new(Semaphore::new(1)),
            closed: AtomicBool::new(false),
        });

        let (writer, writer_task) = spawn_writer_task(writer, config.writer.clone());

        let watcher = shared.clone();
        tokio::spawn(async move {
            if let Ok(Err(e)) = writer_task.await {
                tracing::warn!("Backend {} write failed: {}", watcher.label, e);
                watcher.fail_all();
            }
        });

        let reading = shared.clone();
        tokio::spawn(async move {
            match read_loop(reader, &reading).await {
                Ok(()) => tracing::debug!("Backend {} closed the connection", reading.label),
                Err(e) => tracing::warn!("Backend {} read failed: {}", reading.label, e),
            }
            reading.fail_all();
        });

        Self {
            shared,
            writer,
            capabilities: Capabilities::default(),
            route_capacity: config.route_capacity.max(1),
        }
    }

    /// Connect to `endpoint` and negotiate multiplexing per `config`.
    pub async fn connect(endpoint: &Endpoint, config: &BackendConfig) -> Result<Self> {
        let (reader, writer) = transport::connect(endpoint, config.connect_timeout).await?;
        tracing::debug!("Connected to backend {}", endpoint);

        let mut connection = Self::spawn(reader, writer, config);
        connection.negotiate(config).await;
        Ok(connection)
    }

    /// Decide how many requests this connection carries at once.
    ///
    /// A discovery query that fails or times out leaves the connection in
    /// single-request mode.
    pub async fn negotiate(&mut self, config: &BackendConfig) -> Capabilities {
        let capabilities = match config.multiplex {
            MultiplexMode::Disabled => Capabilities::default(),
            MultiplexMode::Enabled => Capabilities {
                max_conns: config.pool_size as u32,
                max_reqs: config.max_requests,
                mpxs_conns: true,
            },
            MultiplexMode::Discover => {
                let names = [VAR_MAX_CONNS, VAR_MAX_REQS, VAR_MPXS_CONNS]
                    .iter()
                    .map(|name| Bytes::from_static(name.as_bytes()))
                    .collect();
                match self.query_values(names, config.query_timeout).await {
                    Ok(pairs) => Capabilities::from_pairs(&pairs),
                    Err(e) => {
                        tracing::debug!(
                            "Backend {} capability query failed ({}), not multiplexing",
                            self.shared.label,
                            e
                        );
                        Capabilities::default()
                    }
                }
            }
        };

        let concurrent = capabilities.concurrent_requests().min(MAX_IDS);
        let current = self.capabilities.concurrent_requests();
        if concurrent > current {
            self.shared.slots.add_permits(concurrent - current);
        }
        tracing::debug!(
            "Backend {} carries up to {} concurrent requests",
            self.shared.label,
            concurrent
        );
        self.capabilities = capabilities;
        capabilities
    }

    /// Send a get-values query and wait for the answer.
    pub async fn query_values(
        &self,
        names: Vec<Bytes>,
        timeout: Duration,
    ) -> Result<Vec<NameValuePair>> {
        let (tx, rx) = oneshot::channel();
        *self.shared.management() = Some(tx);

        self.writer
            .send_record(Record::GetValues { names })
            .await
            .map_err(|e| self.unavailable(e))?;

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(pairs)) => Ok(pairs),
            Ok(Err(_)) => Err(BridgeError::BackendUnavailable(format!(
                "{} closed during a management query",
                self.shared.label
            ))),
            Err(_) => Err(BridgeError::Timeout("management query")),
        }
    }

    /// Wait for a request slot and allocate a backend request id.
    pub async fn lease(&self) -> Result<BackendLease> {
        if self.is_closed() {
            return Err(self.closed_error());
        }
        let permit = self
            .shared
            .slots
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| self.closed_error())?;
        self.register(permit)
    }

    /// Lease without waiting. `Ok(None)` when every slot is taken.
    pub fn try_lease(&self) -> Result<Option<BackendLease>> {
        match self.shared.slots.clone().try_acquire_owned() {
            Ok(permit) => self.register(permit).map(Some),
            Err(TryAcquireError::NoPermits) => Ok(None),
            Err(TryAcquireError::Closed) => Err(self.closed_error()),
        }
    }

    fn register(&self, permit: OwnedSemaphorePermit) -> Result<BackendLease> {
        let (tx, responses) = mpsc::channel(self.route_capacity);
        let backend_id = {
            let mut routes = self.shared.routes();
            if self.shared.closed.load(Ordering::SeqCst) {
                return Err(self.closed_error());
            }
            routes.register(tx).ok_or_else(|| {
                BridgeError::BackendUnavailable(format!(
                    "{} has no free request ids",
                    self.shared.label
                ))
            })?
        };

        Ok(BackendLease {
            sender: BackendSender {
                backend_id,
                writer: self.writer.clone(),
                shared: self.shared.clone(),
            },
            responses,
            _permit: permit,
        })
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    #[inline]
    pub fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    /// Requests currently holding a lease.
    pub fn active_requests(&self) -> usize {
        self.shared.routes().senders.len()
    }

    fn closed_error(&self) -> BridgeError {
        BridgeError::BackendUnavailable(format!("{} is closed", self.shared.label))
    }

    fn unavailable(&self, e: BridgeError) -> BridgeError {
        BridgeError::BackendUnavailable(format!("{}: {}", self.shared.label, e))
    }
}

async fn read_loop<R>(mut reader: R, shared: &Shared) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut frame_buffer = FrameBuffer::with_max_frame_size(MAX_FRAME_SIZE);
    let mut buf = vec![0u8; READ_BUFFER_SIZE];

    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => return Ok(()),
            Ok(n) => n,
            Err(e) => return Err(BridgeError::Io(e)),
        };

        for frame in frame_buffer.push(&buf[..n])? {
            shared.dispatch(frame).await;
        }
    }
}

/// A request slot on one backend connection.
///
/// Dropping the lease unregisters the backend id and frees the slot.
pub struct BackendLease {
    sender: BackendSender,
    responses: mpsc::Receiver<Frame>,
    _permit: OwnedSemaphorePermit,
}

impl BackendLease {
    #[inline]
    pub fn backend_id(&self) -> u16 {
        self.sender.backend_id
    }

    /// A handle for writing this request's records from another task.
    pub fn sender(&self) -> BackendSender {
        self.sender.clone()
    }

    pub async fn begin(&self, role: Role) -> Result<()> {
        self.sender.begin(role).await
    }

    pub async fn send_stream(&self, kind: StreamKind, content: Bytes) -> Result<()> {
        self.sender.send_stream(kind, content).await
    }

    pub async fn abort(&self) -> Result<()> {
        self.sender.abort().await
    }

    /// Next frame from the backend for this request.
    ///
    /// `None` once the connection has failed and the route is gone.
    pub async fn recv(&mut self) -> Option<Frame> {
        self.responses.recv().await
    }
}

impl Drop for BackendLease {
    fn drop(&mut self) {
        self.sender
            .shared
            .routes()
            .senders
            .remove(&self.sender.backend_id);
    }
}

impl std::fmt::Debug for BackendLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendLease")
            .field("backend", &self.sender.shared.label)
            .field("backend_id", &self.sender.backend_id)
            .finish()
    }
}

/// Writes records for one leased backend request id.
///
/// Every record sent through it carries the backend id. Write failures are
/// reported as `BackendUnavailable`.
#[derive(Clone)]
pub struct BackendSender {
    backend_id: u16,
    writer: WriterHandle,
    shared: Arc<Shared>,
}

impl BackendSender {
    #[inline]
    pub fn backend_id(&self) -> u16 {
        self.backend_id
    }

    /// Send the begin-request. The backend connection is always kept open.
    pub async fn begin(&self, role: Role) -> Result<()> {
        self.send_record(Record::BeginRequest {
            request_id: self.backend_id,
            body: BeginRequestBody::new(role, true),
        })
        .await
    }

    /// Send one stream record; empty content is the end-marker.
    pub async fn send_stream(&self, kind: StreamKind, content: Bytes) -> Result<()> {
        self.send_record(Record::Stream {
            kind,
            request_id: self.backend_id,
            content,
        })
        .await
    }

    /// Forward a frame re-headed with the backend id.
    pub async fn send_frame(&self, frame: &Frame) -> Result<()> {
        self.writer
            .send_frame(frame.with_request_id(self.backend_id))
            .await
            .map_err(|e| self.unavailable(e))
    }

    pub async fn abort(&self) -> Result<()> {
        self.send_record(Record::AbortRequest {
            request_id: self.backend_id,
        })
        .await
    }

    async fn send_record(&self, record: Record) -> Result<()> {
        self.writer
            .send_record(record)
            .await
            .map_err(|e| self.unavailable(e))
    }

    fn unavailable(&self, e: BridgeError) -> BridgeError {
        BridgeError::BackendUnavailable(format!("{}: {}", self.shared.label, e))
    }
}
