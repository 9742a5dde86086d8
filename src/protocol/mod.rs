//! Protocol module - wire format, framing, and record types.
//!
//! This module implements the binary record protocol:
//! - 8-byte header encoding/decoding
//! - Name/value pair length encoding
//! - Frame buffer for accumulating partial reads
//! - `Record`, the single typed view of every record type

mod frame;
mod frame_buffer;
mod name_value;
mod record;
mod wire_format;

pub use frame::{build_frame, stream_frames, Frame};
pub(crate) use frame::PADDING;
pub use frame_buffer::FrameBuffer;
pub use name_value::{decode_pairs, encode_pairs, NameValuePair, LONG_LENGTH_MAX, SHORT_LENGTH_MAX};
pub use record::{
    BeginRequestBody, EndResult, ProtocolStatus, Record, Role, StreamKind, BODY_SIZE,
    FLAG_KEEP_CONN, VAR_MAX_CONNS, VAR_MAX_REQS, VAR_MPXS_CONNS,
};
pub use wire_format::{
    decode_header, encode_header, padding_for, Header, RecordType, HEADER_SIZE,
    MAX_CONTENT_LENGTH, MAX_FRAME_SIZE, MAX_PADDING_LENGTH, NULL_REQUEST_ID, VERSION_1,
};
