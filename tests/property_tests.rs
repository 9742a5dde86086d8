//! Property-based tests using proptest
//!
//! The reassembler must yield the same frames however the byte stream is
//! cut, and the codec must survive arbitrary input without panicking.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use bytes::Bytes;
use fcgi_bridge::protocol::{
    decode_pairs, encode_pairs, padding_for, Frame, FrameBuffer, Header, NameValuePair,
    RecordType, HEADER_SIZE,
};
use proptest::prelude::*;

fn record_type() -> impl Strategy<Value = RecordType> {
    (1u8..=11).prop_map(|value| RecordType::from_u8(value).expect("1..=11 are all known"))
}

fn frame() -> impl Strategy<Value = Frame> {
    (
        record_type(),
        any::<u16>(),
        prop::collection::vec(any::<u8>(), 0..600),
    )
        .prop_map(|(kind, id, content)| Frame::new(kind, id, Bytes::from(content)))
}

fn encode_all(frames: &[Frame]) -> Vec<u8> {
    frames.iter().flat_map(|frame| frame.to_bytes().to_vec()).collect()
}

// Property: any split of the stream yields the same frames as one push
proptest! {
    #[test]
    fn prop_reassembly_is_chunking_independent(
        frames in prop::collection::vec(frame(), 1..12),
        cuts in prop::collection::vec(any::<prop::sample::Index>(), 0..20),
    ) {
        let stream = encode_all(&frames);

        let mut offsets: Vec<usize> = cuts.iter().map(|cut| cut.index(stream.len() + 1)).collect();
        offsets.push(0);
        offsets.push(stream.len());
        offsets.sort_unstable();
        offsets.dedup();

        let mut buffer = FrameBuffer::new();
        let mut decoded = Vec::new();
        for window in offsets.windows(2) {
            decoded.extend(buffer.push(&stream[window[0]..window[1]]).unwrap());
        }

        prop_assert_eq!(decoded, frames);
        prop_assert!(buffer.is_empty());
    }
}

// Property: byte-at-a-time delivery yields the same frames
proptest! {
    #[test]
    fn prop_reassembly_byte_at_a_time(frames in prop::collection::vec(frame(), 1..4)) {
        let stream = encode_all(&frames);
        let mut buffer = FrameBuffer::new();
        let mut decoded = Vec::new();
        for byte in &stream {
            decoded.extend(buffer.push(std::slice::from_ref(byte)).unwrap());
        }
        prop_assert_eq!(decoded, frames);
    }
}

// Property: encoders always pad to a multiple of eight
proptest! {
    #[test]
    fn prop_padding_aligns(len in 0usize..=65535) {
        let padding = padding_for(len) as usize;
        prop_assert!(padding < 8);
        prop_assert_eq!((len + padding) % 8, 0);
    }
}

// Property: a decoded header re-encodes to the same bytes
proptest! {
    #[test]
    fn prop_header_roundtrip(
        kind in record_type(),
        id in any::<u16>(),
        len in any::<u16>(),
    ) {
        let header = Header::new(kind, id, len);
        let bytes = header.encode();
        prop_assert_eq!(bytes.len(), HEADER_SIZE);
        prop_assert_eq!(Header::decode(&bytes).unwrap(), header);
    }
}

// Property: name/value sequences survive encoding whatever the lengths
proptest! {
    #[test]
    fn prop_pairs_roundtrip(
        pairs in prop::collection::vec(
            (prop::collection::vec(any::<u8>(), 0..300), prop::collection::vec(any::<u8>(), 0..300)),
            0..8,
        )
    ) {
        let pairs: Vec<NameValuePair> = pairs
            .into_iter()
            .map(|(name, value)| NameValuePair::new(name, value))
            .collect();
        let encoded = encode_pairs(&pairs);
        prop_assert_eq!(decode_pairs(&encoded).unwrap(), pairs);
    }
}

// Property: garbage never panics the reassembler or the pair decoder
proptest! {
    #[test]
    fn prop_garbage_never_panics(data in prop::collection::vec(any::<u8>(), 0..2000)) {
        let mut buffer = FrameBuffer::new();
        let _ = buffer.push(&data);
        let _ = decode_pairs(&data);
    }
}
