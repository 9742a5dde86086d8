//! Proxy bridge - one task per front-facing connection.
//!
//! The bridge owns the connection's [`FrameBuffer`] and [`SessionTable`]
//! and is the only code that touches them. Its loop selects over two
//! sources:
//!
//! ```text
//! front reads ─► FrameBuffer ─► Record ─► SessionTable ─┐
//!                                                       ├─► backend writer
//! events (lease ready / lease failed / completed) ──────┘
//!
//! backend reader ─► route ─► relay (per request) ─► front writer
//! ```
//!
//! Backend slots are acquired in spawned tasks so a busy backend never
//! stalls the loop. Writes to a backend whose queue is full do stall it,
//! which in turn stops front reads.

mod relay;

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::backend::{BackendLease, BackendPool, BackendSender};
use crate::config::ProxyConfig;
use crate::error::{BridgeError, Result};
use crate::protocol::{
    stream_frames, BeginRequestBody, EndResult, FrameBuffer, ProtocolStatus, Record, RecordType,
    StreamKind, NULL_REQUEST_ID,
};
use crate::session::{AbortAction, InputProgress, ParamsProgress, SessionTable};
use crate::writer::{spawn_writer_task, WriterHandle};
use relay::{relay, RelayTarget};

/// Messages from helper tasks back to the bridge loop.
///
/// `seq` identifies the request incarnation, so an event for an id that has
/// since been finished and reused is recognised and dropped.
#[derive(Debug)]
pub(crate) enum Event {
    LeaseReady {
        id: u16,
        seq: u64,
        lease: BackendLease,
    },
    LeaseFailed {
        id: u16,
        seq: u64,
        error: BridgeError,
    },
    /// A relay could not write backend output to the front.
    FrontStalled {
        id: u16,
        seq: u64,
        error: BridgeError,
    },
    Completed {
        id: u16,
        seq: u64,
        result: EndResult,
    },
}

/// Whether the loop keeps running after handling something.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Close,
}

/// Bridge-side bookkeeping for one open request.
struct Slot {
    seq: u64,
    acquiring: Option<JoinHandle<()>>,
    sender: Option<BackendSender>,
    relay: Option<JoinHandle<()>>,
    /// Set when the bridge ended a leased request itself; the backend's
    /// own end-request is then answered with this instead.
    ended_with: Option<EndResult>,
}

impl Slot {
    fn stop_acquiring(&mut self) {
        if let Some(task) = self.acquiring.take() {
            task.abort();
        }
    }
}

/// Serves front-facing connections against a backend pool.
///
/// Cheap to clone; the server hands a clone to every connection task.
#[derive(Clone)]
pub struct ProxyBridge {
    config: Arc<ProxyConfig>,
    pool: Arc<BackendPool>,
}

impl ProxyBridge {
    pub fn new(config: Arc<ProxyConfig>, pool: Arc<BackendPool>) -> Self {
        Self { config, pool }
    }

    #[inline]
    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    #[inline]
    pub fn pool(&self) -> &Arc<BackendPool> {
        &self.pool
    }

    /// Serve one front-facing connection until it closes.
    ///
    /// Returns `Ok` when the peer disconnects or a finished request asked
    /// for the connection to close, and the fatal error otherwise. Either
    /// way every request still holding a backend slot is sent one abort.
    pub async fn run<R, W>(&self, mut reader: R, writer: W) -> Result<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (front, writer_task) = spawn_writer_task(writer, self.config.writer.clone());
        let (events_tx, mut events) = mpsc::unbounded_channel();
        let (front_open, _) = watch::channel(());

        let mut conn = FrontConnection {
            table: SessionTable::with_max_buffered_input(
                self.config.capabilities,
                self.config.max_buffered_input,
            )
            .with_max_params_size(self.config.max_params_size),
            slots: HashMap::new(),
            next_seq: 0,
            front,
            events: events_tx,
            front_open,
            pool: self.pool.clone(),
            config: self.config.clone(),
        };

        let mut frames = FrameBuffer::with_max_frame_size(self.config.max_frame_size);
        let mut buf = vec![0u8; self.config.read_buffer_size.max(1)];

        let outcome = loop {
            tokio::select! {
                biased;

                Some(event) = events.recv() => match conn.on_event(event).await {
                    Ok(Flow::Continue) => {}
                    Ok(Flow::Close) => break Ok(()),
                    Err(e) => break Err(e),
                },
                read = reader.read(&mut buf) => {
                    let n = match read {
                        Ok(0) => {
                            tracing::debug!(
                                "Front connection closed with {} requests open",
                                conn.table.open_count()
                            );
                            break Ok(());
                        }
                        Ok(n) => n,
                        Err(e) => break Err(BridgeError::Io(e)),
                    };
                    match conn.on_bytes(&mut frames, &buf[..n]).await {
                        Ok(Flow::Continue) => {}
                        Ok(Flow::Close) => break Ok(()),
                        Err(e) => break Err(e),
                    }
                }
            }
        };

        if let Err(e) = &outcome {
            tracing::warn!("Closing front connection: {}", e);
        }

        conn.shutdown().await;
        drop(conn);
        drop(events);

        match writer_task.await {
            Ok(Err(e)) => tracing::debug!("Front writer stopped: {}", e),
            Err(e) => tracing::error!("Front writer task failed: {}", e),
            Ok(Ok(())) => {}
        }
        outcome
    }
}

/// State of one front-facing connection, owned by its bridge loop.
struct FrontConnection {
    table: SessionTable,
    slots: HashMap<u16, Slot>,
    next_seq: u64,
    front: WriterHandle,
    events: mpsc::UnboundedSender<Event>,
    /// Dropped on shutdown; relays watch it to let go of the front writer.
    front_open: watch::Sender<()>,
    pool: Arc<BackendPool>,
    config: Arc<ProxyConfig>,
}

impl FrontConnection {
    async fn on_bytes(&mut self, frames: &mut FrameBuffer, data: &[u8]) -> Result<Flow> {
        for frame in frames.push(data)? {
            let record = Record::from_frame(frame)?;
            if self.on_record(record).await? == Flow::Close {
                return Ok(Flow::Close);
            }
        }
        Ok(Flow::Continue)
    }

    async fn on_record(&mut self, record: Record) -> Result<Flow> {
        match record {
            Record::BeginRequest { request_id, body } => self.on_begin(request_id, body).await,
            Record::AbortRequest { request_id } => self.on_abort(request_id).await,
            Record::Stream {
                kind: StreamKind::Params,
                request_id,
                content,
            } => self.on_params(request_id, content).await,
            Record::Stream {
                kind: kind @ (StreamKind::Stdin | StreamKind::Data),
                request_id,
                content,
            } => self.on_input(request_id, kind, content).await,
            Record::GetValues { names } => {
                let pairs = self.table.management_query(&names);
                tracing::debug!("Answering management query ({} of {} known)", pairs.len(), names.len());
                self.front.send_record(Record::GetValuesResult { pairs }).await?;
                Ok(Flow::Continue)
            }
            Record::Unrecognized {
                record_type,
                request_id,
                ..
            } => {
                tracing::debug!(
                    "Unknown record type {} on request {}",
                    record_type,
                    request_id
                );
                self.front.send_record(Record::UnknownType { record_type }).await?;
                Ok(Flow::Continue)
            }
            other => {
                let request_id = other.request_id();
                tracing::warn!(
                    "Ignoring record type {} from front (request {})",
                    other.into_frame().header.record_type,
                    request_id
                );
                Ok(Flow::Continue)
            }
        }
    }

    async fn on_begin(&mut self, id: u16, body: BeginRequestBody) -> Result<Flow> {
        let fresh = id != NULL_REQUEST_ID && self.table.get(id).is_none();
        if fresh && !body.role.is_known() {
            tracing::debug!("Request {} has unsupported role {:?}", id, body.role);
            return self
                .reply_end(id, EndResult::rejected(ProtocolStatus::UnknownRole))
                .await;
        }
        if fresh && !self.table.accepts_new_request() {
            tracing::debug!(
                "Refusing request {}: {} already open",
                id,
                self.table.open_count()
            );
            return self
                .reply_end(id, EndResult::rejected(ProtocolStatus::CantMultiplexConnection))
                .await;
        }

        // id 0 and collisions are fatal
        self.table.begin_request(id, body.role, body.keep_conn())?;

        self.next_seq += 1;
        self.slots.insert(
            id,
            Slot {
                seq: self.next_seq,
                acquiring: None,
                sender: None,
                relay: None,
                ended_with: None,
            },
        );
        Ok(Flow::Continue)
    }

    async fn on_params(&mut self, id: u16, content: Bytes) -> Result<Flow> {
        if !self.is_live(id) {
            tracing::debug!("Dropping params for finished request {}", id);
            return Ok(Flow::Continue);
        }

        match self.table.add_params(id, content)? {
            ParamsProgress::Accumulating => Ok(Flow::Continue),
            ParamsProgress::ParamsComplete => {
                self.start_lease(id);
                Ok(Flow::Continue)
            }
            ParamsProgress::Overflow => self.end_request(id, EndResult::overloaded()).await,
        }
    }

    async fn on_input(&mut self, id: u16, kind: StreamKind, content: Bytes) -> Result<Flow> {
        if !self.is_live(id) {
            tracing::debug!("Dropping {:?} for finished request {}", kind, id);
            return Ok(Flow::Continue);
        }

        match self.table.add_input(id, kind, content)? {
            InputProgress::Queued | InputProgress::InputComplete => {}
            InputProgress::Overflow => {
                tracing::warn!("Request {} exceeded the input buffer, ending it", id);
                return self.end_request(id, EndResult::overloaded()).await;
            }
        }

        let Some(sender) = self.slots.get(&id).and_then(|slot| slot.sender.clone()) else {
            // queued until the lease arrives
            return Ok(Flow::Continue);
        };
        if let Err(e) = self.forward_pending(id, &sender).await {
            return self.backend_write_failed(id, e).await;
        }
        Ok(Flow::Continue)
    }

    async fn on_abort(&mut self, id: u16) -> Result<Flow> {
        match self.table.abort(id) {
            None => {
                tracing::debug!("Abort for unknown request {}", id);
                Ok(Flow::Continue)
            }
            Some(AbortAction::ForwardToBackend(backend_id)) => {
                tracing::debug!("Forwarding abort for request {} (backend {})", id, backend_id);
                if let Some(sender) = self.slots.get(&id).and_then(|slot| slot.sender.clone()) {
                    if let Err(e) = sender.abort().await {
                        return self.backend_write_failed(id, e).await;
                    }
                }
                Ok(Flow::Continue)
            }
            Some(AbortAction::AlreadyForwarded) => Ok(Flow::Continue),
            Some(AbortAction::EndLocally) => self.finish(id, EndResult::complete(0)).await,
        }
    }

    async fn on_event(&mut self, event: Event) -> Result<Flow> {
        match event {
            Event::LeaseReady { id, seq, lease } => {
                if !self.is_current(id, seq) {
                    tracing::debug!("Releasing lease for finished request {}", id);
                    return Ok(Flow::Continue);
                }
                self.on_lease(id, seq, lease).await
            }
            Event::LeaseFailed { id, seq, error } => {
                if !self.is_current(id, seq) {
                    return Ok(Flow::Continue);
                }
                tracing::warn!("No backend for request {}: {}", id, error);
                self.finish(id, EndResult::overloaded()).await
            }
            Event::FrontStalled { id, seq, error } => {
                if !self.is_current(id, seq) {
                    return Ok(Flow::Continue);
                }
                tracing::warn!("Ending request {}: front output lost ({})", id, error);
                self.end_request(id, EndResult::overloaded()).await
            }
            Event::Completed { id, seq, result } => {
                if !self.is_current(id, seq) {
                    return Ok(Flow::Continue);
                }
                self.finish(id, result).await
            }
        }
    }

    async fn on_lease(&mut self, id: u16, seq: u64, lease: BackendLease) -> Result<Flow> {
        let sender = lease.sender();
        self.table.attach_backend(id, sender.backend_id())?;

        let Some(request) = self.table.get(id) else {
            return Ok(Flow::Continue);
        };
        let role = request.role();
        let params = request.params_stream();
        tracing::debug!(
            "Request {} leased backend id {} ({} bytes of params)",
            id,
            sender.backend_id(),
            params.len()
        );

        let relay_task = tokio::spawn(relay(
            lease,
            RelayTarget {
                front_id: id,
                seq,
                front: self.front.clone(),
                front_open: self.front_open.subscribe(),
                events: self.events.clone(),
                response_timeout: self.config.backend.response_timeout,
            },
        ));
        if let Some(slot) = self.slots.get_mut(&id) {
            slot.acquiring = None;
            slot.sender = Some(sender.clone());
            slot.relay = Some(relay_task);
        }

        let opened = async {
            sender.begin(role).await?;
            for frame in stream_frames(RecordType::Params, sender.backend_id(), &params) {
                sender.send_frame(&frame).await?;
            }
            Ok::<_, BridgeError>(())
        };
        if let Err(e) = opened.await {
            return self.backend_write_failed(id, e).await;
        }
        if let Err(e) = self.forward_pending(id, &sender).await {
            return self.backend_write_failed(id, e).await;
        }
        Ok(Flow::Continue)
    }

    /// Spawn the slot acquisition for a request whose params are complete.
    fn start_lease(&mut self, id: u16) {
        let Some(slot) = self.slots.get_mut(&id) else {
            return;
        };
        let seq = slot.seq;
        let pool = self.pool.clone();
        let events = self.events.clone();
        slot.acquiring = Some(tokio::spawn(async move {
            let event = match pool.lease().await {
                Ok(lease) => Event::LeaseReady { id, seq, lease },
                Err(error) => Event::LeaseFailed { id, seq, error },
            };
            // a closed bridge drops the lease with the event
            let _ = events.send(event);
        }));
    }

    async fn forward_pending(&mut self, id: u16, sender: &BackendSender) -> Result<()> {
        for chunk in self.table.take_pending(id) {
            sender.send_stream(chunk.kind, chunk.content).await?;
        }
        self.table.mark_awaiting(id);
        Ok(())
    }

    /// A backend write failed: stop the relay and answer overloaded.
    async fn backend_write_failed(&mut self, id: u16, error: BridgeError) -> Result<Flow> {
        tracing::warn!("Backend write for request {} failed: {}", id, error);
        if let Some(relay) = self.slots.get_mut(&id).and_then(|slot| slot.relay.take()) {
            relay.abort();
        }
        self.finish(id, EndResult::overloaded()).await
    }

    /// End a request early: abort backend work if any, otherwise answer now.
    async fn end_request(&mut self, id: u16, result: EndResult) -> Result<Flow> {
        match self.table.abort(id) {
            Some(AbortAction::ForwardToBackend(_)) => {
                let Some(slot) = self.slots.get_mut(&id) else {
                    return Ok(Flow::Continue);
                };
                slot.ended_with = Some(result);
                if let Some(sender) = slot.sender.clone() {
                    if let Err(e) = sender.abort().await {
                        return self.backend_write_failed(id, e).await;
                    }
                }
                Ok(Flow::Continue)
            }
            Some(AbortAction::AlreadyForwarded) => {
                if let Some(slot) = self.slots.get_mut(&id) {
                    slot.ended_with = Some(result);
                }
                Ok(Flow::Continue)
            }
            None => Ok(Flow::Continue),
            Some(AbortAction::EndLocally) => self.finish(id, result).await,
        }
    }

    /// Remove a request, write its end-request and honour keep_conn.
    async fn finish(&mut self, id: u16, mut result: EndResult) -> Result<Flow> {
        if let Some(mut slot) = self.slots.remove(&id) {
            slot.stop_acquiring();
            if let Some(ended_with) = slot.ended_with {
                result = ended_with;
            }
        }
        let request = self.table.complete(id, result)?;
        self.front
            .send_record(Record::EndRequest {
                request_id: id,
                result,
            })
            .await?;

        if request.keep_conn() {
            Ok(Flow::Continue)
        } else {
            tracing::debug!("Request {} finished without keep_conn, closing", id);
            Ok(Flow::Close)
        }
    }

    async fn reply_end(&self, id: u16, result: EndResult) -> Result<Flow> {
        self.front
            .send_record(Record::EndRequest {
                request_id: id,
                result,
            })
            .await?;
        Ok(Flow::Continue)
    }

    /// Abort every request still holding a backend slot, exactly once each.
    async fn shutdown(&mut self) {
        for request in self.table.drain() {
            let sender = self
                .slots
                .get(&request.id())
                .and_then(|slot| slot.sender.clone());
            if let Some(sender) = sender {
                tracing::debug!(
                    "Aborting backend request {} for front request {}",
                    sender.backend_id(),
                    request.id()
                );
                if let Err(e) = sender.abort().await {
                    tracing::debug!("Abort for request {} not delivered: {}", request.id(), e);
                }
            }
        }
        for (_, mut slot) in self.slots.drain() {
            slot.stop_acquiring();
        }
    }

    fn is_current(&self, id: u16, seq: u64) -> bool {
        self.slots.get(&id).is_some_and(|slot| slot.seq == seq)
    }

    /// Open and not aborted.
    fn is_live(&self, id: u16) -> bool {
        self.table
            .get(id)
            .is_some_and(|request| !request.state().is_terminal())
    }
}
