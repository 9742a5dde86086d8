//! Frame struct with typed accessors.
//!
//! Represents a complete record with header and content. Padding is
//! consumed by the reassembler and never stored.
//! Uses `bytes::Bytes` for zero-copy content sharing.
//!
//! # Example
//!
//! ```
//! use fcgi_bridge::protocol::{Frame, RecordType};
//! use bytes::Bytes;
//!
//! let frame = Frame::new(RecordType::Stdout, 42, Bytes::from_static(b"hello"));
//!
//! assert_eq!(frame.request_id(), 42);
//! assert_eq!(frame.content(), b"hello");
//! assert_eq!(frame.to_bytes().len(), 8 + 5 + 3);
//! ```

use bytes::{BufMut, Bytes, BytesMut};

use super::wire_format::{Header, RecordType, HEADER_SIZE, MAX_CONTENT_LENGTH};

/// Zero bytes used for padding.
pub(crate) const PADDING: [u8; 8] = [0u8; 8];

/// A complete protocol frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Decoded header.
    pub header: Header,
    /// Content bytes (zero-copy via `bytes::Bytes`).
    pub content: Bytes,
}

impl Frame {
    /// Create a frame with a canonical header for `content`.
    ///
    /// `content` must not exceed 65535 bytes.
    pub fn new(record_type: RecordType, request_id: u16, content: Bytes) -> Self {
        debug_assert!(content.len() <= MAX_CONTENT_LENGTH);
        Self {
            header: Header::new(record_type, request_id, content.len() as u16),
            content,
        }
    }

    /// Create a frame from a decoded header and its content.
    pub fn from_parts(header: Header, content: Bytes) -> Self {
        Self { header, content }
    }

    /// Empty record of `record_type` (stream end-marker, abort).
    pub fn empty(record_type: RecordType, request_id: u16) -> Self {
        Self::new(record_type, request_id, Bytes::new())
    }

    /// Get a reference to the content bytes.
    #[inline]
    pub fn content(&self) -> &[u8] {
        &self.content
    }

    #[inline]
    pub fn content_len(&self) -> usize {
        self.content.len()
    }

    #[inline]
    pub fn request_id(&self) -> u16 {
        self.header.request_id
    }

    /// Known record type, `None` for values outside 1..=11.
    #[inline]
    pub fn kind(&self) -> Option<RecordType> {
        self.header.kind()
    }

    /// An empty stream record closes that stream.
    #[inline]
    pub fn is_end_of_stream(&self) -> bool {
        self.content.is_empty() && self.kind().is_some_and(RecordType::is_stream)
    }

    /// Same record addressed to another request id; content is shared.
    pub fn with_request_id(&self, request_id: u16) -> Self {
        let mut header = self.header;
        header.request_id = request_id;
        Self {
            header,
            content: self.content.clone(),
        }
    }

    /// Append header, content and padding to `buf`.
    pub fn encode_into(&self, buf: &mut BytesMut) {
        buf.reserve(HEADER_SIZE + self.content.len() + self.header.padding_length as usize);
        buf.put_slice(&self.header.encode());
        buf.put_slice(&self.content);
        buf.put_bytes(0, self.header.padding_length as usize);
    }

    /// Encode the frame as one contiguous buffer.
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::new();
        self.encode_into(&mut buf);
        buf.freeze()
    }
}

/// Build a complete frame as a single byte vector, with canonical padding.
pub fn build_frame(record_type: RecordType, request_id: u16, content: &[u8]) -> Vec<u8> {
    let frame = Frame::new(record_type, request_id, Bytes::copy_from_slice(content));
    frame.to_bytes().to_vec()
}

/// Split `content` into as many records as needed, then the end-marker.
///
/// An empty `content` yields only the end-marker.
pub fn stream_frames(record_type: RecordType, request_id: u16, content: &Bytes) -> Vec<Frame> {
    let mut frames: Vec<Frame> = chunk_content(content)
        .map(|chunk| Frame::new(record_type, request_id, chunk))
        .collect();
    frames.push(Frame::empty(record_type, request_id));
    frames
}

/// Split `content` into pieces that each fit one record.
fn chunk_content(content: &Bytes) -> impl Iterator<Item = Bytes> + '_ {
    (0..content.len())
        .step_by(MAX_CONTENT_LENGTH)
        .map(move |start| content.slice(start..(start + MAX_CONTENT_LENGTH).min(content.len())))
}
