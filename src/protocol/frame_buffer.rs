//! Record reassembly over arbitrary reads.
//!
//! Reads land in a `BytesMut`; complete records are split off without
//! copying. Two states:
//! - `WaitingForHeader`: fewer than 8 bytes of the next record
//! - `WaitingForBody`: header validated, content and padding outstanding
//!
//! # Example
//!
//! ```
//! use fcgi_bridge::protocol::{build_frame, FrameBuffer, RecordType};
//!
//! let bytes = build_frame(RecordType::Stdout, 1, b"hello");
//! let mut buffer = FrameBuffer::new();
//!
//! assert!(buffer.push(&bytes[..5]).unwrap().is_empty());
//! let frames = buffer.push(&bytes[5..]).unwrap();
//! assert_eq!(frames[0].content(), b"hello");
//! ```

use bytes::BytesMut;

use super::wire_format::{Header, HEADER_SIZE, MAX_FRAME_SIZE};
use super::Frame;
use crate::error::Result;

/// Initial buffer capacity; one maximal record fits without growing.
const INITIAL_CAPACITY: usize = 64 * 1024;

/// Where the next record stands.
#[derive(Debug, Clone)]
enum State {
    WaitingForHeader,
    WaitingForBody { header: Header },
}

/// Turns a stream of reads into whole frames.
///
/// A frame that straddles any number of reads is reassembled; only a
/// header that is malformed or declares more than `max_frame_size` is an
/// error.
pub struct FrameBuffer {
    /// Bytes received but not yet part of a returned frame.
    buffer: BytesMut,
    state: State,
    /// Ceiling on header + content + padding.
    max_frame_size: usize,
}

impl FrameBuffer {
    /// Create a new frame buffer accepting any legal record.
    pub fn new() -> Self {
        Self::with_max_frame_size(MAX_FRAME_SIZE)
    }

    /// Create a frame buffer with a lower frame size ceiling.
    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(INITIAL_CAPACITY.min(max_frame_size)),
            state: State::WaitingForHeader,
            max_frame_size: max_frame_size.min(MAX_FRAME_SIZE),
        }
    }

    /// Append a read and return every frame it completes.
    ///
    /// Returns an empty vector while a frame is still incomplete.
    ///
    /// # Errors
    ///
    /// Returns a format error for a bad version and a protocol error for a
    /// frame larger than the ceiling. Both are fatal to the connection.
    pub fn push(&mut self, data: &[u8]) -> Result<Vec<Frame>> {
        self.buffer.extend_from_slice(data);

        let mut frames = Vec::new();
        while let Some(frame) = self.try_extract_one()? {
            frames.push(frame);
        }
        Ok(frames)
    }

    fn try_extract_one(&mut self) -> Result<Option<Frame>> {
        let header = match self.state {
            State::WaitingForHeader => {
                if self.buffer.len() < HEADER_SIZE {
                    return Ok(None);
                }

                let header = Header::decode(&self.buffer[..HEADER_SIZE])?;
                header.validate(self.max_frame_size)?;

                let _ = self.buffer.split_to(HEADER_SIZE);
                self.state = State::WaitingForBody { header };
                header
            }
            State::WaitingForBody { header } => header,
        };

        if self.buffer.len() < header.body_size() {
            return Ok(None);
        }

        let content = self
            .buffer
            .split_to(header.content_length as usize)
            .freeze();
        let _ = self.buffer.split_to(header.padding_length as usize);
        self.state = State::WaitingForHeader;

        Ok(Some(Frame::from_parts(header, content)))
    }

    /// Number of buffered, not yet consumed bytes.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty() && matches!(self.state, State::WaitingForHeader)
    }

    /// Drop any partial record.
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.state = State::WaitingForHeader;
    }

    #[cfg(test)]
    fn state_name(&self) -> &'static str {
        match &self.state {
            State::WaitingForHeader => "WaitingForHeader",
            State::WaitingForBody { .. } => "WaitingForBody",
        }
    }
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new()
    }
}
