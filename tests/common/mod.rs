//! Shared helpers: a record-speaking peer and scripted backends.

#![allow(dead_code, clippy::expect_used, clippy::unwrap_used)]

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use bytes::Bytes;
use fcgi_bridge::protocol::{
    decode_pairs, encode_pairs, BeginRequestBody, EndResult, Frame, FrameBuffer, NameValuePair,
    Record, Role, StreamKind, VAR_MAX_REQS, VAR_MPXS_CONNS,
};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;

pub const RECV_TIMEOUT: Duration = Duration::from_secs(5);

/// One end of a record stream.
pub struct Peer {
    reader: Box<dyn AsyncRead + Unpin + Send>,
    writer: Box<dyn AsyncWrite + Unpin + Send>,
    frames: FrameBuffer,
    ready: VecDeque<Frame>,
}

impl Peer {
    pub fn new<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        Self {
            reader: Box::new(reader),
            writer: Box::new(writer),
            frames: FrameBuffer::new(),
            ready: VecDeque::new(),
        }
    }

    pub async fn send(&mut self, record: Record) {
        self.send_raw(&record.into_frame().to_bytes()).await;
    }

    pub async fn send_raw(&mut self, bytes: &[u8]) {
        self.writer.write_all(bytes).await.unwrap();
        self.writer.flush().await.unwrap();
    }

    /// Next record, `None` at end of stream.
    pub async fn recv(&mut self) -> Option<Record> {
        tokio::time::timeout(RECV_TIMEOUT, self.recv_inner())
            .await
            .expect("timed out waiting for a record")
    }

    async fn recv_inner(&mut self) -> Option<Record> {
        let mut buf = [0u8; 8192];
        while self.ready.is_empty() {
            let n = self.reader.read(&mut buf).await.ok()?;
            if n == 0 {
                return None;
            }
            self.ready.extend(self.frames.push(&buf[..n]).unwrap());
        }
        let frame = self.ready.pop_front()?;
        Some(Record::from_frame(frame).unwrap())
    }

    pub async fn begin(&mut self, id: u16, keep_conn: bool) {
        self.send(Record::BeginRequest {
            request_id: id,
            body: BeginRequestBody::new(Role::Responder, keep_conn),
        })
        .await;
    }

    /// Send the parameters split over two records, then the end-marker.
    pub async fn params(&mut self, id: u16, pairs: &[(&str, &str)]) {
        let pairs: Vec<NameValuePair> = pairs
            .iter()
            .map(|(name, value)| NameValuePair::from_strs(name, value))
            .collect();
        let encoded = encode_pairs(&pairs);
        let middle = encoded.len() / 2;
        for chunk in [encoded.slice(..middle), encoded.slice(middle..)] {
            if !chunk.is_empty() {
                self.stream(StreamKind::Params, id, chunk).await;
            }
        }
        self.stream(StreamKind::Params, id, Bytes::new()).await;
    }

    pub async fn stdin(&mut self, id: u16, data: &'static [u8]) {
        self.stream(StreamKind::Stdin, id, Bytes::from_static(data))
            .await;
    }

    pub async fn stdin_end(&mut self, id: u16) {
        self.stream(StreamKind::Stdin, id, Bytes::new()).await;
    }

    pub async fn stream(&mut self, kind: StreamKind, id: u16, content: Bytes) {
        self.send(Record::Stream {
            kind,
            request_id: id,
            content,
        })
        .await;
    }

    /// Read until `count` requests have ended; stdout per id plus results.
    pub async fn responses(&mut self, count: usize) -> HashMap<u16, (Vec<u8>, EndResult)> {
        let mut stdout: HashMap<u16, Vec<u8>> = HashMap::new();
        let mut done = HashMap::new();
        while done.len() < count {
            match self.recv().await.expect("stream ended before every response") {
                Record::Stream {
                    kind: StreamKind::Stdout,
                    request_id,
                    content,
                } => stdout.entry(request_id).or_default().extend_from_slice(&content),
                Record::Stream {
                    kind: StreamKind::Stderr,
                    ..
                } => {}
                Record::EndRequest { request_id, result } => {
                    let body = stdout.remove(&request_id).unwrap_or_default();
                    done.insert(request_id, (body, result));
                }
                other => panic!("unexpected record {other:?}"),
            }
        }
        done
    }
}

/// What a scripted backend observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendEvent {
    Connected,
    Begin(u16),
    Abort(u16),
    Finished(u16),
}

pub struct Backend {
    pub endpoint: String,
    pub events: mpsc::UnboundedReceiver<BackendEvent>,
}

impl Backend {
    pub async fn next_event(&mut self) -> BackendEvent {
        tokio::time::timeout(RECV_TIMEOUT, self.events.recv())
            .await
            .expect("timed out waiting for the backend")
            .expect("backend stopped")
    }

    /// Events seen within `window`.
    pub async fn events_within(&mut self, window: Duration) -> Vec<BackendEvent> {
        let mut seen = Vec::new();
        let deadline = tokio::time::Instant::now() + window;
        while let Ok(Some(event)) = tokio::time::timeout_at(deadline, self.events.recv()).await {
            seen.push(event);
        }
        seen
    }
}

#[derive(Default)]
struct Pending {
    params: Vec<u8>,
    stdin: Vec<u8>,
}

/// A backend application that answers each request with
/// `SCRIPT_NAME|<stdin>` on stdout once stdin ends.
///
/// With `multiplex` it advertises `FCGI_MPXS_CONNS=1` and `FCGI_MAX_REQS=10`.
pub async fn echo_backend(multiplex: bool) -> Backend {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let endpoint = listener.local_addr().unwrap().to_string();
    let (tx, events) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let _ = tx.send(BackendEvent::Connected);
            let (reader, writer) = stream.into_split();
            let tx = tx.clone();
            tokio::spawn(serve_echo(Peer::new(reader, writer), multiplex, tx));
        }
    });

    Backend { endpoint, events }
}

async fn serve_echo(mut peer: Peer, multiplex: bool, tx: mpsc::UnboundedSender<BackendEvent>) {
    let mut open: HashMap<u16, Pending> = HashMap::new();

    while let Some(record) = peer.recv_inner().await {
        match record {
            Record::GetValues { .. } => {
                let pairs = if multiplex {
                    vec![
                        NameValuePair::from_strs(VAR_MPXS_CONNS, "1"),
                        NameValuePair::from_strs(VAR_MAX_REQS, "10"),
                    ]
                } else {
                    vec![NameValuePair::from_strs(VAR_MPXS_CONNS, "0")]
                };
                peer.send(Record::GetValuesResult { pairs }).await;
            }
            Record::BeginRequest { request_id, .. } => {
                open.insert(request_id, Pending::default());
                let _ = tx.send(BackendEvent::Begin(request_id));
            }
            Record::AbortRequest { request_id } => {
                let _ = tx.send(BackendEvent::Abort(request_id));
                if open.remove(&request_id).is_some() {
                    peer.send(Record::EndRequest {
                        request_id,
                        result: EndResult::complete(1),
                    })
                    .await;
                }
            }
            Record::Stream {
                kind: StreamKind::Params,
                request_id,
                content,
            } => {
                if let Some(pending) = open.get_mut(&request_id) {
                    pending.params.extend_from_slice(&content);
                }
            }
            Record::Stream {
                kind: StreamKind::Stdin,
                request_id,
                content,
            } => {
                let Some(pending) = open.get_mut(&request_id) else {
                    continue;
                };
                if !content.is_empty() {
                    pending.stdin.extend_from_slice(&content);
                    continue;
                }

                let Some(pending) = open.remove(&request_id) else {
                    continue;
                };
                let params = decode_pairs(&pending.params).unwrap();
                let script = params
                    .iter()
                    .find(|pair| pair.name.as_ref() == b"SCRIPT_NAME")
                    .map(|pair| pair.value_str().into_owned())
                    .unwrap_or_default();
                let mut body = format!("{script}|").into_bytes();
                body.extend_from_slice(&pending.stdin);

                for content in [Bytes::from(body), Bytes::new()] {
                    peer.send(Record::Stream {
                        kind: StreamKind::Stdout,
                        request_id,
                        content,
                    })
                    .await;
                }
                peer.send(Record::EndRequest {
                    request_id,
                    result: EndResult::complete(0),
                })
                .await;
                let _ = tx.send(BackendEvent::Finished(request_id));
            }
            _ => {}
        }
    }
}

/// A backend that answers every request with `chunks` stdout records of
/// `chunk_size` bytes as soon as stdin ends, without waiting for the
/// proxy to keep up.
pub async fn bulk_backend(chunks: usize, chunk_size: usize) -> Backend {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let endpoint = listener.local_addr().unwrap().to_string();
    let (tx, events) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let _ = tx.send(BackendEvent::Connected);
            let (reader, writer) = stream.into_split();
            let tx = tx.clone();
            tokio::spawn(async move {
                let mut peer = Peer::new(reader, writer);
                while let Some(record) = peer.recv_inner().await {
                    match record {
                        Record::BeginRequest { request_id, .. } => {
                            let _ = tx.send(BackendEvent::Begin(request_id));
                        }
                        Record::AbortRequest { request_id } => {
                            let _ = tx.send(BackendEvent::Abort(request_id));
                        }
                        Record::Stream {
                            kind: StreamKind::Stdin,
                            request_id,
                            content,
                        } if content.is_empty() => {
                            let chunk = Bytes::from(vec![b'z'; chunk_size]);
                            for _ in 0..chunks {
                                peer.stream(StreamKind::Stdout, request_id, chunk.clone())
                                    .await;
                            }
                            peer.stream(StreamKind::Stdout, request_id, Bytes::new())
                                .await;
                            peer.send(Record::EndRequest {
                                request_id,
                                result: EndResult::complete(0),
                            })
                            .await;
                            let _ = tx.send(BackendEvent::Finished(request_id));
                        }
                        _ => {}
                    }
                }
            });
        }
    });

    Backend { endpoint, events }
}

/// A backend that accepts, reads until it sees a begin-request, then hangs up.
pub async fn dying_backend() -> Backend {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let endpoint = listener.local_addr().unwrap().to_string();
    let (tx, events) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let _ = tx.send(BackendEvent::Connected);
            let (reader, writer) = stream.into_split();
            let mut peer = Peer::new(reader, writer);
            while let Some(record) = peer.recv_inner().await {
                if let Record::BeginRequest { request_id, .. } = record {
                    let _ = tx.send(BackendEvent::Begin(request_id));
                    break;
                }
            }
            drop(peer);
        }
    });

    Backend { endpoint, events }
}

/// An address nothing listens on.
pub fn refused_endpoint() -> String {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr.to_string()
}
