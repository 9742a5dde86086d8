//! Per-connection request bookkeeping.

use std::collections::HashMap;

use bytes::Bytes;

use super::request::{InputChunk, Request, RequestState};
use super::Capabilities;
use crate::error::{BridgeError, Result};
use crate::protocol::{decode_pairs, EndResult, NameValuePair, Role, StreamKind, NULL_REQUEST_ID};

/// Default cap on input held for one request while it waits for a backend.
pub const DEFAULT_MAX_BUFFERED_INPUT: usize = 1024 * 1024;

/// Default cap on the encoded parameter stream of one request.
pub const DEFAULT_MAX_PARAMS_SIZE: usize = 1024 * 1024;

/// Progress reported by [`SessionTable::add_params`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamsProgress {
    /// More parameter records are expected.
    Accumulating,
    /// The end-marker arrived and the parameters decoded.
    ParamsComplete,
    /// Chunk refused: the parameter stream grew past its ceiling.
    Overflow,
}

/// Progress reported by [`SessionTable::add_input`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputProgress {
    /// Chunk queued as pending input.
    Queued,
    /// Chunk queued and every input stream has ended.
    InputComplete,
    /// Chunk refused: the request already holds too much pending input.
    Overflow,
}

/// What the bridge owes the backend after an abort.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortAction {
    /// Forward one abort to this backend request id.
    ForwardToBackend(u16),
    /// No backend work exists; end the request locally.
    EndLocally,
    /// An abort was already forwarded; nothing more to do.
    AlreadyForwarded,
}

/// Request table for one front-facing connection.
///
/// Owned exclusively by the connection's bridge task, so it needs no locks.
#[derive(Debug)]
pub struct SessionTable {
    requests: HashMap<u16, Request>,
    capabilities: Capabilities,
    max_buffered_input: usize,
    max_params_size: usize,
}

impl SessionTable {
    pub fn new(capabilities: Capabilities) -> Self {
        Self::with_max_buffered_input(capabilities, DEFAULT_MAX_BUFFERED_INPUT)
    }

    pub fn with_max_buffered_input(capabilities: Capabilities, max_buffered_input: usize) -> Self {
        Self {
            requests: HashMap::new(),
            capabilities,
            max_buffered_input,
            max_params_size: DEFAULT_MAX_PARAMS_SIZE,
        }
    }

    pub fn with_max_params_size(mut self, max_params_size: usize) -> Self {
        self.max_params_size = max_params_size;
        self
    }

    #[inline]
    pub fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    /// Whether another request may open alongside the current ones.
    pub fn accepts_new_request(&self) -> bool {
        self.requests.is_empty()
            || (self.capabilities.mpxs_conns
                && self.requests.len() < self.capabilities.max_reqs as usize)
    }

    /// Open a request in `Began`.
    pub fn begin_request(&mut self, id: u16, role: Role, keep_conn: bool) -> Result<&Request> {
        if id == NULL_REQUEST_ID {
            return Err(BridgeError::Protocol(
                "begin-request on the management id".into(),
            ));
        }
        if self.requests.contains_key(&id) {
            return Err(BridgeError::Protocol(format!(
                "request id {id} is already in flight"
            )));
        }

        tracing::debug!("Request {} began (role {:?}, keep_conn {})", id, role, keep_conn);
        Ok(self
            .requests
            .entry(id)
            .or_insert_with(|| Request::new(id, role, keep_conn)))
    }

    /// Accumulate one parameter record; the empty end-marker closes the stream.
    pub fn add_params(&mut self, id: u16, chunk: Bytes) -> Result<ParamsProgress> {
        let max_params_size = self.max_params_size;
        let request = self.open_mut(id)?;
        if request.state != RequestState::Began {
            return Err(BridgeError::Protocol(format!(
                "params for request {id} after the stream ended"
            )));
        }

        if !chunk.is_empty() {
            if request.raw_params_len + chunk.len() > max_params_size {
                tracing::warn!(
                    "Request {} params exceed {} bytes, refusing",
                    id,
                    max_params_size
                );
                return Ok(ParamsProgress::Overflow);
            }
            request.raw_params_len += chunk.len();
            request.raw_params.push(chunk);
            return Ok(ParamsProgress::Accumulating);
        }

        // a pair may straddle records, so decode the concatenation
        request.params = decode_pairs(&request.params_stream())?;
        request.state = RequestState::ParamsDone;
        tracing::debug!("Request {} params complete ({} pairs)", id, request.params.len());
        Ok(ParamsProgress::ParamsComplete)
    }

    /// Queue one stdin or data chunk for forwarding.
    pub fn add_input(&mut self, id: u16, kind: StreamKind, chunk: Bytes) -> Result<InputProgress> {
        if !matches!(kind, StreamKind::Stdin | StreamKind::Data) {
            return Err(BridgeError::Protocol(format!(
                "{kind:?} is not an input stream"
            )));
        }

        let max_buffered_input = self.max_buffered_input;
        let request = self.open_mut(id)?;
        if !request.state.accepts_input() {
            return Err(BridgeError::Protocol(format!(
                "input for request {id} in state {:?}",
                request.state
            )));
        }

        let closed = match kind {
            StreamKind::Stdin => request.stdin_closed,
            _ => request.data_closed,
        };
        if closed {
            return Err(BridgeError::Protocol(format!(
                "{kind:?} for request {id} after its end-marker"
            )));
        }

        if request.pending_bytes + chunk.len() > max_buffered_input {
            return Ok(InputProgress::Overflow);
        }

        request.state = RequestState::InputReceiving;
        if chunk.is_empty() {
            match kind {
                StreamKind::Stdin => request.stdin_closed = true,
                _ => request.data_closed = true,
            }
        }

        request.pending_bytes += chunk.len();
        request.input_total += chunk.len() as u64;
        request.pending.push_back(InputChunk {
            kind,
            content: chunk,
        });

        if request.input_complete() {
            request.state = RequestState::Dispatched;
            return Ok(InputProgress::InputComplete);
        }
        Ok(InputProgress::Queued)
    }

    /// Drain the queued input chunks of a request, oldest first.
    pub fn take_pending(&mut self, id: u16) -> Vec<InputChunk> {
        match self.requests.get_mut(&id) {
            Some(request) => {
                request.pending_bytes = 0;
                request.pending.drain(..).collect()
            }
            None => Vec::new(),
        }
    }

    /// Record the backend request id leased for `id`.
    pub fn attach_backend(&mut self, id: u16, backend_id: u16) -> Result<()> {
        let request = self.open_mut(id)?;
        request.backend_id = Some(backend_id);
        Ok(())
    }

    /// Dispatched → AwaitingResponse once nothing is left to forward.
    ///
    /// Returns whether the request is now awaiting its response.
    pub fn mark_awaiting(&mut self, id: u16) -> bool {
        let Some(request) = self.requests.get_mut(&id) else {
            return false;
        };
        if request.state == RequestState::Dispatched
            && request.backend_id.is_some()
            && request.pending.is_empty()
        {
            request.state = RequestState::AwaitingResponse;
        }
        request.state == RequestState::AwaitingResponse
    }

    /// Mark a request aborted. `None` if the id is not open.
    pub fn abort(&mut self, id: u16) -> Option<AbortAction> {
        let request = self.requests.get_mut(&id)?;
        request.state = RequestState::Aborted;
        request.pending.clear();
        request.pending_bytes = 0;

        Some(match request.backend_id {
            Some(_) if request.abort_sent => AbortAction::AlreadyForwarded,
            Some(backend_id) => {
                request.abort_sent = true;
                AbortAction::ForwardToBackend(backend_id)
            }
            None => AbortAction::EndLocally,
        })
    }

    /// Remove a finished request and hand it back for the end-request reply.
    pub fn complete(&mut self, id: u16, result: EndResult) -> Result<Request> {
        let mut request = self.requests.remove(&id).ok_or_else(|| {
            BridgeError::Protocol(format!("completion for unknown request {id}"))
        })?;
        if request.state != RequestState::Aborted {
            request.state = RequestState::Completed;
        }
        tracing::debug!(
            "Request {} finished (app status {}, {:?})",
            id,
            result.app_status,
            result.protocol_status
        );
        Ok(request)
    }

    /// Answer a get-values query from the declared capabilities.
    ///
    /// Unknown names are left out of the reply.
    pub fn management_query(&self, names: &[Bytes]) -> Vec<NameValuePair> {
        names
            .iter()
            .filter_map(|name| {
                self.capabilities
                    .value_of(name)
                    .map(|value| NameValuePair::new(name.clone(), Bytes::from(value)))
            })
            .collect()
    }

    /// Remove every request, returning those holding a backend lease that
    /// have not been sent an abort yet.
    pub fn drain(&mut self) -> Vec<Request> {
        let mut leased: Vec<Request> = self
            .requests
            .drain()
            .map(|(_, request)| request)
            .filter(|request| request.backend_id.is_some() && !request.abort_sent)
            .collect();
        for request in &mut leased {
            request.abort_sent = true;
            request.state = RequestState::Aborted;
        }
        leased
    }

    #[inline]
    pub fn open_count(&self) -> usize {
        self.requests.len()
    }

    #[inline]
    pub fn get(&self, id: u16) -> Option<&Request> {
        self.requests.get(&id)
    }

    /// Total pending input across all requests.
    pub fn buffered_input(&self) -> usize {
        self.requests.values().map(|r| r.pending_bytes).sum()
    }

    fn open_mut(&mut self, id: u16) -> Result<&mut Request> {
        match self.requests.get_mut(&id) {
            Some(request) if request.state != RequestState::Aborted => Ok(request),
            Some(_) => Err(BridgeError::Protocol(format!("request {id} was aborted"))),
            None => Err(BridgeError::Protocol(format!("no open request {id}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{encode_pairs, ProtocolStatus, VAR_MAX_CONNS, VAR_MAX_REQS, VAR_MPXS_CONNS};

    fn table() -> SessionTable {
        SessionTable::new(Capabilities::default())
    }

    fn params_bytes() -> Bytes {
        encode_pairs(&[
            NameValuePair::from_strs("REQUEST_METHOD", "GET"),
            NameValuePair::from_strs("SCRIPT_NAME", "/index.php"),
        ])
    }

    fn open_with_params(table: &mut SessionTable, id: u16) {
        table.begin_request(id, Role::Responder, true).unwrap();
        table.add_params(id, params_bytes()).unwrap();
        assert_eq!(
            table.add_params(id, Bytes::new()).unwrap(),
            ParamsProgress::ParamsComplete
        );
    }

    #[test]
    fn test_begin_rejects_null_and_duplicate_ids() {
        let mut table = table();
        assert!(matches!(
            table.begin_request(0, Role::Responder, false),
            Err(BridgeError::Protocol(_))
        ));

        table.begin_request(1, Role::Responder, false).unwrap();
        assert!(matches!(
            table.begin_request(1, Role::Responder, false),
            Err(BridgeError::Protocol(_))
        ));
        assert_eq!(table.open_count(), 1);
    }

    #[test]
    fn test_params_split_across_records() {
        let mut table = table();
        table.begin_request(1, Role::Responder, false).unwrap();

        let encoded = params_bytes();
        let (left, right) = encoded.split_at(5);
        assert_eq!(
            table.add_params(1, Bytes::copy_from_slice(left)).unwrap(),
            ParamsProgress::Accumulating
        );
        table.add_params(1, Bytes::copy_from_slice(right)).unwrap();
        table.add_params(1, Bytes::new()).unwrap();

        let request = table.get(1).unwrap();
        assert_eq!(request.state(), RequestState::ParamsDone);
        assert_eq!(request.params_stream(), params_bytes());
        assert_eq!(request.param(b"SCRIPT_NAME").unwrap().as_ref(), b"/index.php");
    }

    #[test]
    fn test_params_after_end_rejected() {
        let mut table = table();
        open_with_params(&mut table, 1);
        assert!(table.add_params(1, params_bytes()).is_err());
        assert!(table.add_params(2, params_bytes()).is_err());
    }

    #[test]
    fn test_bad_params_encoding() {
        let mut table = table();
        table.begin_request(1, Role::Responder, false).unwrap();
        table.add_params(1, Bytes::from_static(&[2, 2, 48])).unwrap();
        assert!(matches!(
            table.add_params(1, Bytes::new()),
            Err(BridgeError::Format(_))
        ));
    }

    #[test]
    fn test_input_before_params_rejected() {
        let mut table = table();
        table.begin_request(1, Role::Responder, false).unwrap();
        assert!(table
            .add_input(1, StreamKind::Stdin, Bytes::from_static(b"x"))
            .is_err());
    }

    #[test]
    fn test_stdin_end_dispatches() {
        let mut table = table();
        open_with_params(&mut table, 1);

        assert_eq!(
            table
                .add_input(1, StreamKind::Stdin, Bytes::from_static(b"body"))
                .unwrap(),
            InputProgress::Queued
        );
        assert_eq!(table.get(1).unwrap().state(), RequestState::InputReceiving);
        assert_eq!(
            table.add_input(1, StreamKind::Stdin, Bytes::new()).unwrap(),
            InputProgress::InputComplete
        );
        assert_eq!(table.get(1).unwrap().state(), RequestState::Dispatched);
        assert_eq!(table.buffered_input(), 4);

        let pending = table.take_pending(1);
        assert_eq!(pending.len(), 2);
        assert_eq!(&pending[0].content[..], b"body");
        assert!(pending[1].is_end_marker());
        assert_eq!(table.buffered_input(), 0);

        assert!(!table.mark_awaiting(1));
        table.attach_backend(1, 7).unwrap();
        assert!(table.mark_awaiting(1));
        assert_eq!(table.get(1).unwrap().backend_id(), Some(7));
    }

    #[test]
    fn test_filter_waits_for_data_stream() {
        let mut table = table();
        table.begin_request(1, Role::Filter, false).unwrap();
        table.add_params(1, Bytes::new()).unwrap();

        assert_eq!(
            table.add_input(1, StreamKind::Stdin, Bytes::new()).unwrap(),
            InputProgress::Queued
        );
        table
            .add_input(1, StreamKind::Data, Bytes::from_static(b"file"))
            .unwrap();
        assert_eq!(
            table.add_input(1, StreamKind::Data, Bytes::new()).unwrap(),
            InputProgress::InputComplete
        );
        assert!(table
            .add_input(1, StreamKind::Data, Bytes::from_static(b"late"))
            .is_err());
    }

    #[test]
    fn test_input_overflow() {
        let mut table = SessionTable::with_max_buffered_input(Capabilities::default(), 8);
        open_with_params(&mut table, 1);

        table
            .add_input(1, StreamKind::Stdin, Bytes::from_static(b"12345"))
            .unwrap();
        assert_eq!(
            table
                .add_input(1, StreamKind::Stdin, Bytes::from_static(b"67890"))
                .unwrap(),
            InputProgress::Overflow
        );
        assert_eq!(table.get(1).unwrap().pending_bytes(), 5);

        table.take_pending(1);
        assert_eq!(
            table
                .add_input(1, StreamKind::Stdin, Bytes::from_static(b"67890"))
                .unwrap(),
            InputProgress::Queued
        );
    }

    #[test]
    fn test_params_ceiling() {
        let mut table = SessionTable::with_max_buffered_input(Capabilities::default(), 8)
            .with_max_params_size(1024);
        table.begin_request(1, Role::Responder, true).unwrap();

        let chunk = Bytes::from(vec![0u8; 1000]);
        assert_eq!(
            table.add_params(1, chunk.clone()).unwrap(),
            ParamsProgress::Accumulating
        );
        assert_eq!(table.add_params(1, chunk).unwrap(), ParamsProgress::Overflow);
        assert_eq!(
            table.add_params(1, Bytes::from(vec![0u8; 24])).unwrap(),
            ParamsProgress::Accumulating
        );
        assert_eq!(
            table.add_params(1, Bytes::from_static(b"x")).unwrap(),
            ParamsProgress::Overflow
        );
        assert_eq!(table.get(1).unwrap().state(), RequestState::Began);
    }

    #[test]
    fn test_abort_forwards_once() {
        let mut table = table();
        open_with_params(&mut table, 1);
        table.attach_backend(1, 3).unwrap();

        assert_eq!(table.abort(1), Some(AbortAction::ForwardToBackend(3)));
        assert_eq!(table.abort(1), Some(AbortAction::AlreadyForwarded));
        assert_eq!(table.get(1).unwrap().state(), RequestState::Aborted);
        assert!(table.drain().is_empty());
    }

    #[test]
    fn test_abort_without_lease_ends_locally() {
        let mut table = table();
        table.begin_request(4, Role::Responder, false).unwrap();
        assert_eq!(table.abort(4), Some(AbortAction::EndLocally));
        assert_eq!(table.abort(9), None);

        let request = table.complete(4, EndResult::complete(0)).unwrap();
        assert_eq!(request.state(), RequestState::Aborted);
        assert_eq!(table.open_count(), 0);
    }

    #[test]
    fn test_complete_removes_request() {
        let mut table = table();
        open_with_params(&mut table, 2);
        let request = table
            .complete(2, EndResult::rejected(ProtocolStatus::Overloaded))
            .unwrap();
        assert_eq!(request.state(), RequestState::Completed);
        assert!(request.keep_conn());
        assert!(table.get(2).is_none());
        assert!(table.complete(2, EndResult::complete(0)).is_err());

        // the id is free again
        table.begin_request(2, Role::Responder, false).unwrap();
    }

    #[test]
    fn test_drain_returns_only_leased() {
        let mut table = table();
        open_with_params(&mut table, 1);
        open_with_params(&mut table, 2);
        table.begin_request(3, Role::Responder, false).unwrap();
        table.attach_backend(1, 10).unwrap();
        table.attach_backend(2, 11).unwrap();
        table.abort(2);

        let leased = table.drain();
        assert_eq!(leased.len(), 1);
        assert_eq!(leased[0].backend_id(), Some(10));
        assert!(leased[0].abort_sent());
        assert_eq!(table.open_count(), 0);
    }

    #[test]
    fn test_management_query() {
        let table = SessionTable::new(Capabilities {
            max_conns: 10,
            max_reqs: 50,
            mpxs_conns: true,
        });
        let names = vec![
            Bytes::from_static(VAR_MAX_CONNS.as_bytes()),
            Bytes::from_static(b"FCGI_NOT_A_THING"),
            Bytes::from_static(VAR_MAX_REQS.as_bytes()),
            Bytes::from_static(VAR_MPXS_CONNS.as_bytes()),
        ];

        let reply = table.management_query(&names);
        assert_eq!(
            reply,
            vec![
                NameValuePair::from_strs(VAR_MAX_CONNS, "10"),
                NameValuePair::from_strs(VAR_MAX_REQS, "50"),
                NameValuePair::from_strs(VAR_MPXS_CONNS, "1"),
            ]
        );
        assert_eq!(table.open_count(), 0);
    }

    #[test]
    fn test_accepts_new_request() {
        let mut single = table();
        assert!(single.accepts_new_request());
        single.begin_request(1, Role::Responder, false).unwrap();
        assert!(!single.accepts_new_request());

        let mut multi = SessionTable::new(Capabilities {
            max_conns: 1,
            max_reqs: 2,
            mpxs_conns: true,
        });
        multi.begin_request(1, Role::Responder, false).unwrap();
        assert!(multi.accepts_new_request());
        multi.begin_request(2, Role::Responder, false).unwrap();
        assert!(!multi.accepts_new_request());
    }
}
