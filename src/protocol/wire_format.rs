//! Wire format encoding and decoding.
//!
//! Implements the 8-byte record header:
//! ```text
//! ┌─────────┬────────┬────────────┬────────────────┬─────────┬──────────┐
//! │ Version │ Type   │ Request ID │ Content Length │ Padding │ Reserved │
//! │ 1 byte  │ 1 byte │ uint16 BE  │ uint16 BE      │ 1 byte  │ 1 byte   │
//! └─────────┴────────┴────────────┴────────────────┴─────────┴──────────┘
//! ```
//!
//! The header is followed by `content_length` content bytes and
//! `padding_length` ignorable padding bytes.

use crate::error::{BridgeError, Result};

/// Header size in bytes (fixed, exactly 8).
pub const HEADER_SIZE: usize = 8;

/// The only protocol version on the wire.
pub const VERSION_1: u8 = 1;

/// Largest content a single record can carry.
pub const MAX_CONTENT_LENGTH: usize = u16::MAX as usize;

/// Largest padding a decoder must accept.
pub const MAX_PADDING_LENGTH: usize = u8::MAX as usize;

/// Largest record on the wire (header + content + padding).
pub const MAX_FRAME_SIZE: usize = HEADER_SIZE + MAX_CONTENT_LENGTH + MAX_PADDING_LENGTH;

/// Request id reserved for management records.
pub const NULL_REQUEST_ID: u16 = 0;

/// Record types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum RecordType {
    BeginRequest = 1,
    AbortRequest = 2,
    EndRequest = 3,
    Params = 4,
    Stdin = 5,
    Stdout = 6,
    Stderr = 7,
    Data = 8,
    GetValues = 9,
    GetValuesResult = 10,
    UnknownType = 11,
}

impl RecordType {
    /// Map a raw type byte to a known record type.
    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            1 => Self::BeginRequest,
            2 => Self::AbortRequest,
            3 => Self::EndRequest,
            4 => Self::Params,
            5 => Self::Stdin,
            6 => Self::Stdout,
            7 => Self::Stderr,
            8 => Self::Data,
            9 => Self::GetValues,
            10 => Self::GetValuesResult,
            11 => Self::UnknownType,
            _ => return None,
        })
    }

    /// Raw type byte.
    #[inline]
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Management records travel on request id 0.
    #[inline]
    pub fn is_management(self) -> bool {
        matches!(
            self,
            Self::GetValues | Self::GetValuesResult | Self::UnknownType
        )
    }

    /// Stream records are terminated by an empty record of the same type.
    #[inline]
    pub fn is_stream(self) -> bool {
        matches!(
            self,
            Self::Params | Self::Stdin | Self::Stdout | Self::Stderr | Self::Data
        )
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::BeginRequest => "BEGIN_REQUEST",
            Self::AbortRequest => "ABORT_REQUEST",
            Self::EndRequest => "END_REQUEST",
            Self::Params => "PARAMS",
            Self::Stdin => "STDIN",
            Self::Stdout => "STDOUT",
            Self::Stderr => "STDERR",
            Self::Data => "DATA",
            Self::GetValues => "GET_VALUES",
            Self::GetValuesResult => "GET_VALUES_RESULT",
            Self::UnknownType => "UNKNOWN_TYPE",
        }
    }
}

/// Padding that rounds `content_length` up to a multiple of 8.
#[inline]
pub fn padding_for(content_length: usize) -> u8 {
    ((8 - (content_length % 8)) % 8) as u8
}

/// Decoded header from wire format.
///
/// `record_type` is kept raw so that unknown types survive decoding and
/// can be answered with an unknown-type record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Protocol version (always 1 when encoded here).
    pub version: u8,
    /// Raw record type byte.
    pub record_type: u8,
    /// Request identifier (0 = management).
    pub request_id: u16,
    /// Content length in bytes.
    pub content_length: u16,
    /// Padding length in bytes.
    pub padding_length: u8,
    /// Reserved byte, carried through unchanged.
    pub reserved: u8,
}

impl Header {
    /// Create a version-1 header with the canonical padding for its content.
    pub fn new(record_type: RecordType, request_id: u16, content_length: u16) -> Self {
        Self {
            version: VERSION_1,
            record_type: record_type.as_u8(),
            request_id,
            content_length,
            padding_length: padding_for(content_length as usize),
            reserved: 0,
        }
    }

    /// Encode header to bytes (Big Endian).
    ///
    /// # Example
    ///
    /// ```
    /// use fcgi_bridge::protocol::{Header, RecordType};
    ///
    /// let header = Header::new(RecordType::Stdout, 1, 5);
    /// assert_eq!(header.encode(), [1, 6, 0, 1, 0, 5, 3, 0]);
    /// ```
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        self.encode_into(&mut buf);
        buf
    }

    /// Encode header into an existing buffer.
    ///
    /// # Panics
    ///
    /// Panics if buffer is smaller than `HEADER_SIZE` (8 bytes).
    pub fn encode_into(&self, buf: &mut [u8]) {
        debug_assert!(buf.len() >= HEADER_SIZE);
        buf[0] = self.version;
        buf[1] = self.record_type;
        buf[2..4].copy_from_slice(&self.request_id.to_be_bytes());
        buf[4..6].copy_from_slice(&self.content_length.to_be_bytes());
        buf[6] = self.padding_length;
        buf[7] = self.reserved;
    }

    /// Decode header from bytes (Big Endian).
    ///
    /// Any padding length 0–255 is accepted.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_SIZE {
            return Err(BridgeError::Format(format!(
                "header needs {} bytes, got {}",
                HEADER_SIZE,
                buf.len()
            )));
        }
        Ok(Self {
            version: buf[0],
            record_type: buf[1],
            request_id: u16::from_be_bytes([buf[2], buf[3]]),
            content_length: u16::from_be_bytes([buf[4], buf[5]]),
            padding_length: buf[6],
            reserved: buf[7],
        })
    }

    /// Validate the header against the version and a frame size ceiling.
    pub fn validate(&self, max_frame_size: usize) -> Result<()> {
        if self.version != VERSION_1 {
            return Err(BridgeError::Format(format!(
                "unsupported protocol version {}",
                self.version
            )));
        }

        if self.frame_size() > max_frame_size {
            return Err(BridgeError::Protocol(format!(
                "frame size {} exceeds maximum {}",
                self.frame_size(),
                max_frame_size
            )));
        }

        Ok(())
    }

    /// Known record type, if any.
    #[inline]
    pub fn kind(&self) -> Option<RecordType> {
        RecordType::from_u8(self.record_type)
    }

    /// Bytes following the header (content + padding).
    #[inline]
    pub fn body_size(&self) -> usize {
        self.content_length as usize + self.padding_length as usize
    }

    /// Total size on the wire.
    #[inline]
    pub fn frame_size(&self) -> usize {
        HEADER_SIZE + self.body_size()
    }

    #[inline]
    pub fn is_management(&self) -> bool {
        self.request_id == NULL_REQUEST_ID
    }
}

/// Encode a header from its parts (standalone function).
#[inline]
pub fn encode_header(
    record_type: RecordType,
    request_id: u16,
    content_length: u16,
    padding_length: u8,
) -> [u8; HEADER_SIZE] {
    Header {
        version: VERSION_1,
        record_type: record_type.as_u8(),
        request_id,
        content_length,
        padding_length,
        reserved: 0,
    }
    .encode()
}

/// Decode a header from bytes (standalone function).
#[inline]
pub fn decode_header(buf: &[u8]) -> Result<Header> {
    Header::decode(buf)
}
