//! A single in-flight request on a front-facing connection.

use std::collections::VecDeque;

use bytes::{Bytes, BytesMut};

use crate::protocol::{NameValuePair, Role, StreamKind};

/// Request lifecycle.
///
/// ```text
/// Began → ParamsDone → InputReceiving → Dispatched → AwaitingResponse → Completed
///   └──────────┴──────────────┴──────────────┴──────────────┴──────────→ Aborted
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    Began,
    ParamsDone,
    InputReceiving,
    Dispatched,
    AwaitingResponse,
    Completed,
    Aborted,
}

impl RequestState {
    #[inline]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Aborted)
    }

    /// States in which stdin/data chunks are accepted.
    #[inline]
    pub(crate) fn accepts_input(self) -> bool {
        matches!(self, Self::ParamsDone | Self::InputReceiving)
    }
}

/// A chunk of stdin or data waiting to be forwarded; empty content is the
/// end-marker of its stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputChunk {
    pub kind: StreamKind,
    pub content: Bytes,
}

impl InputChunk {
    #[inline]
    pub fn is_end_marker(&self) -> bool {
        self.content.is_empty()
    }
}

/// Bookkeeping for one request id.
#[derive(Debug)]
pub struct Request {
    pub(crate) id: u16,
    pub(crate) role: Role,
    pub(crate) keep_conn: bool,
    pub(crate) state: RequestState,
    pub(crate) params: Vec<NameValuePair>,
    pub(crate) raw_params: Vec<Bytes>,
    pub(crate) raw_params_len: usize,
    pub(crate) pending: VecDeque<InputChunk>,
    pub(crate) pending_bytes: usize,
    pub(crate) input_total: u64,
    pub(crate) stdin_closed: bool,
    pub(crate) data_closed: bool,
    pub(crate) backend_id: Option<u16>,
    pub(crate) abort_sent: bool,
}

impl Request {
    pub(crate) fn new(id: u16, role: Role, keep_conn: bool) -> Self {
        Self {
            id,
            role,
            keep_conn,
            state: RequestState::Began,
            params: Vec::new(),
            raw_params: Vec::new(),
            raw_params_len: 0,
            pending: VecDeque::new(),
            pending_bytes: 0,
            input_total: 0,
            stdin_closed: false,
            data_closed: false,
            backend_id: None,
            abort_sent: false,
        }
    }

    #[inline]
    pub fn id(&self) -> u16 {
        self.id
    }

    #[inline]
    pub fn role(&self) -> Role {
        self.role
    }

    #[inline]
    pub fn keep_conn(&self) -> bool {
        self.keep_conn
    }

    #[inline]
    pub fn state(&self) -> RequestState {
        self.state
    }

    /// Parameters in arrival order.
    pub fn params(&self) -> &[NameValuePair] {
        &self.params
    }

    /// Value of the last parameter named `name`.
    pub fn param(&self, name: &[u8]) -> Option<&Bytes> {
        self.params
            .iter()
            .rev()
            .find(|pair| pair.name.as_ref() == name)
            .map(|pair| &pair.value)
    }

    /// The parameter stream exactly as received, in one buffer.
    pub fn params_stream(&self) -> Bytes {
        match self.raw_params.as_slice() {
            [] => Bytes::new(),
            [single] => single.clone(),
            chunks => {
                let mut joined = BytesMut::with_capacity(self.raw_params_len);
                for part in chunks {
                    joined.extend_from_slice(part);
                }
                joined.freeze()
            }
        }
    }

    /// Bytes of stdin/data received so far (forwarded or not).
    #[inline]
    pub fn input_total(&self) -> u64 {
        self.input_total
    }

    /// Bytes of stdin/data waiting to be forwarded.
    #[inline]
    pub fn pending_bytes(&self) -> usize {
        self.pending_bytes
    }

    /// Backend request id, once a backend slot is leased.
    #[inline]
    pub fn backend_id(&self) -> Option<u16> {
        self.backend_id
    }

    #[inline]
    pub fn abort_sent(&self) -> bool {
        self.abort_sent
    }

    /// Every input stream the role uses has seen its end-marker.
    pub(crate) fn input_complete(&self) -> bool {
        self.stdin_closed && (self.role != Role::Filter || self.data_closed)
    }
}
