//! Typed record bodies and the `Record` tagged variant.
//!
//! Every layer above the reassembler speaks `Record`; `Frame` is only the
//! transport form.

use bytes::{Bytes, BytesMut};

use super::name_value::{decode_pairs, encode_pairs, NameValuePair};
use super::wire_format::{RecordType, NULL_REQUEST_ID};
use super::Frame;
use crate::error::{BridgeError, Result};

/// Size of the begin-request, end-request and unknown-type bodies.
pub const BODY_SIZE: usize = 8;

/// Bit 0 of the begin-request flags: keep the connection open.
pub const FLAG_KEEP_CONN: u8 = 0x01;

/// Management variable: maximum concurrent transport connections.
pub const VAR_MAX_CONNS: &str = "FCGI_MAX_CONNS";
/// Management variable: maximum concurrent requests.
pub const VAR_MAX_REQS: &str = "FCGI_MAX_REQS";
/// Management variable: "1" when connections may be multiplexed.
pub const VAR_MPXS_CONNS: &str = "FCGI_MPXS_CONNS";

/// Declared purpose of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Responder,
    Authorizer,
    Filter,
    /// A role value this side does not implement.
    Other(u16),
}

impl Role {
    pub fn from_u16(value: u16) -> Self {
        match value {
            1 => Self::Responder,
            2 => Self::Authorizer,
            3 => Self::Filter,
            other => Self::Other(other),
        }
    }

    pub fn as_u16(self) -> u16 {
        match self {
            Self::Responder => 1,
            Self::Authorizer => 2,
            Self::Filter => 3,
            Self::Other(value) => value,
        }
    }

    #[inline]
    pub fn is_known(self) -> bool {
        !matches!(self, Self::Other(_))
    }
}

/// Protocol-level outcome carried by an end-request record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProtocolStatus {
    RequestComplete,
    CantMultiplexConnection,
    Overloaded,
    UnknownRole,
}

impl ProtocolStatus {
    pub fn from_u8(value: u8) -> Result<Self> {
        Ok(match value {
            0 => Self::RequestComplete,
            1 => Self::CantMultiplexConnection,
            2 => Self::Overloaded,
            3 => Self::UnknownRole,
            other => {
                return Err(BridgeError::Format(format!(
                    "unknown protocol status {other}"
                )))
            }
        })
    }

    pub fn as_u8(self) -> u8 {
        match self {
            Self::RequestComplete => 0,
            Self::CantMultiplexConnection => 1,
            Self::Overloaded => 2,
            Self::UnknownRole => 3,
        }
    }
}

/// Begin-request body: role (u16 BE), flags, 5 reserved bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BeginRequestBody {
    pub role: Role,
    pub flags: u8,
}

impl BeginRequestBody {
    pub fn new(role: Role, keep_conn: bool) -> Self {
        Self {
            role,
            flags: if keep_conn { FLAG_KEEP_CONN } else { 0 },
        }
    }

    #[inline]
    pub fn keep_conn(&self) -> bool {
        self.flags & FLAG_KEEP_CONN != 0
    }

    pub fn encode(&self) -> [u8; BODY_SIZE] {
        let mut buf = [0u8; BODY_SIZE];
        buf[0..2].copy_from_slice(&self.role.as_u16().to_be_bytes());
        buf[2] = self.flags;
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        check_body(buf, "begin-request")?;
        Ok(Self {
            role: Role::from_u16(u16::from_be_bytes([buf[0], buf[1]])),
            flags: buf[2],
        })
    }
}

/// Final result of a request: application status plus protocol status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndResult {
    pub app_status: u32,
    pub protocol_status: ProtocolStatus,
}

impl EndResult {
    pub fn complete(app_status: u32) -> Self {
        Self {
            app_status,
            protocol_status: ProtocolStatus::RequestComplete,
        }
    }

    pub fn rejected(protocol_status: ProtocolStatus) -> Self {
        Self {
            app_status: 0,
            protocol_status,
        }
    }

    /// Result reported for requests lost to a backend failure.
    pub fn overloaded() -> Self {
        Self::rejected(ProtocolStatus::Overloaded)
    }

    /// End-request body: app status (u32 BE), protocol status, 3 reserved.
    pub fn encode(&self) -> [u8; BODY_SIZE] {
        let mut buf = [0u8; BODY_SIZE];
        buf[0] = (self.app_status >> 24) as u8;
        buf[1] = (self.app_status >> 16) as u8;
        buf[2] = (self.app_status >> 8) as u8;
        buf[3] = self.app_status as u8;
        buf[4] = self.protocol_status.as_u8();
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        check_body(buf, "end-request")?;
        Ok(Self {
            app_status: u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]),
            protocol_status: ProtocolStatus::from_u8(buf[4])?,
        })
    }
}

fn check_body(buf: &[u8], what: &str) -> Result<()> {
    if buf.len() < BODY_SIZE {
        return Err(BridgeError::Format(format!(
            "{what} body needs {BODY_SIZE} bytes, got {}",
            buf.len()
        )));
    }
    Ok(())
}

/// Stream-carrying record types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamKind {
    Params,
    Stdin,
    Stdout,
    Stderr,
    Data,
}

impl StreamKind {
    pub fn record_type(self) -> RecordType {
        match self {
            Self::Params => RecordType::Params,
            Self::Stdin => RecordType::Stdin,
            Self::Stdout => RecordType::Stdout,
            Self::Stderr => RecordType::Stderr,
            Self::Data => RecordType::Data,
        }
    }
}

/// A decoded record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Record {
    BeginRequest {
        request_id: u16,
        body: BeginRequestBody,
    },
    AbortRequest {
        request_id: u16,
    },
    EndRequest {
        request_id: u16,
        result: EndResult,
    },
    /// Params, stdin, stdout, stderr or data; empty content ends the stream.
    Stream {
        kind: StreamKind,
        request_id: u16,
        content: Bytes,
    },
    GetValues {
        names: Vec<Bytes>,
    },
    GetValuesResult {
        pairs: Vec<NameValuePair>,
    },
    /// Reply to a record whose type was not understood.
    UnknownType {
        record_type: u8,
    },
    /// A record with a type outside 1..=11.
    Unrecognized {
        record_type: u8,
        request_id: u16,
        content: Bytes,
    },
}

impl Record {
    /// Interpret a frame.
    pub fn from_frame(frame: Frame) -> Result<Self> {
        let request_id = frame.request_id();
        let Some(kind) = frame.kind() else {
            return Ok(Self::Unrecognized {
                record_type: frame.header.record_type,
                request_id,
                content: frame.content,
            });
        };

        let stream = |kind| Self::Stream {
            kind,
            request_id,
            content: frame.content.clone(),
        };

        Ok(match kind {
            RecordType::BeginRequest => Self::BeginRequest {
                request_id,
                body: BeginRequestBody::decode(&frame.content)?,
            },
            RecordType::AbortRequest => Self::AbortRequest { request_id },
            RecordType::EndRequest => Self::EndRequest {
                request_id,
                result: EndResult::decode(&frame.content)?,
            },
            RecordType::Params => stream(StreamKind::Params),
            RecordType::Stdin => stream(StreamKind::Stdin),
            RecordType::Stdout => stream(StreamKind::Stdout),
            RecordType::Stderr => stream(StreamKind::Stderr),
            RecordType::Data => stream(StreamKind::Data),
            RecordType::GetValues => Self::GetValues {
                names: decode_pairs(&frame.content)?
                    .into_iter()
                    .map(|pair| pair.name)
                    .collect(),
            },
            RecordType::GetValuesResult => Self::GetValuesResult {
                pairs: decode_pairs(&frame.content)?,
            },
            RecordType::UnknownType => {
                check_body(&frame.content, "unknown-type")?;
                Self::UnknownType {
                    record_type: frame.content[0],
                }
            }
        })
    }

    /// Encode back into a single frame with canonical padding.
    ///
    /// Stream and management contents must fit one record.
    pub fn into_frame(self) -> Frame {
        match self {
            Self::BeginRequest { request_id, body } => Frame::new(
                RecordType::BeginRequest,
                request_id,
                Bytes::copy_from_slice(&body.encode()),
            ),
            Self::AbortRequest { request_id } => {
                Frame::empty(RecordType::AbortRequest, request_id)
            }
            Self::EndRequest { request_id, result } => Frame::new(
                RecordType::EndRequest,
                request_id,
                Bytes::copy_from_slice(&result.encode()),
            ),
            Self::Stream {
                kind,
                request_id,
                content,
            } => Frame::new(kind.record_type(), request_id, content),
            Self::GetValues { names } => {
                let pairs: Vec<NameValuePair> = names
                    .into_iter()
                    .map(|name| NameValuePair::new(name, Bytes::new()))
                    .collect();
                Frame::new(RecordType::GetValues, NULL_REQUEST_ID, encode_pairs(&pairs))
            }
            Self::GetValuesResult { pairs } => Frame::new(
                RecordType::GetValuesResult,
                NULL_REQUEST_ID,
                encode_pairs(&pairs),
            ),
            Self::UnknownType { record_type } => {
                let mut body = BytesMut::zeroed(BODY_SIZE);
                body[0] = record_type;
                Frame::new(RecordType::UnknownType, NULL_REQUEST_ID, body.freeze())
            }
            Self::Unrecognized {
                record_type,
                request_id,
                content,
            } => {
                let mut frame = Frame::new(RecordType::UnknownType, request_id, content);
                frame.header.record_type = record_type;
                frame
            }
        }
    }

    /// Request id the record belongs to (0 for management records).
    pub fn request_id(&self) -> u16 {
        match self {
            Self::BeginRequest { request_id, .. }
            | Self::AbortRequest { request_id }
            | Self::EndRequest { request_id, .. }
            | Self::Stream { request_id, .. }
            | Self::Unrecognized { request_id, .. } => *request_id,
            Self::GetValues { .. } | Self::GetValuesResult { .. } | Self::UnknownType { .. } => {
                NULL_REQUEST_ID
            }
        }
    }
}
