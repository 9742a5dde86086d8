//! Name/value pair encoding.
//!
//! Each length is one byte when it fits in 7 bits, otherwise four bytes
//! big-endian with the top bit of the first byte set:
//! ```text
//! short: 0LLLLLLL
//! long:  1LLLLLLL LLLLLLLL LLLLLLLL LLLLLLLL
//! ```
//! Name and value lengths choose their form independently, then the name
//! bytes and value bytes follow.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{BridgeError, Result};

/// Longest length that uses the one-byte form.
pub const SHORT_LENGTH_MAX: usize = 0x7F;

/// Longest length the four-byte form can carry.
pub const LONG_LENGTH_MAX: usize = 0x7FFF_FFFF;

/// A single name/value entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NameValuePair {
    pub name: Bytes,
    pub value: Bytes,
}

impl NameValuePair {
    pub fn new(name: impl Into<Bytes>, value: impl Into<Bytes>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }

    /// Build a pair from UTF-8 strings (copies).
    pub fn from_strs(name: &str, value: &str) -> Self {
        Self {
            name: Bytes::copy_from_slice(name.as_bytes()),
            value: Bytes::copy_from_slice(value.as_bytes()),
        }
    }

    /// Name as UTF-8, lossy.
    pub fn name_str(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.name)
    }

    /// Value as UTF-8, lossy.
    pub fn value_str(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.value)
    }

    /// Size of the encoded pair.
    pub fn encoded_len(&self) -> usize {
        length_field_size(self.name.len())
            + length_field_size(self.value.len())
            + self.name.len()
            + self.value.len()
    }

    /// Append the encoded pair to `buf`.
    pub fn encode_into(&self, buf: &mut BytesMut) {
        buf.reserve(self.encoded_len());
        put_length(buf, self.name.len());
        put_length(buf, self.value.len());
        buf.put_slice(&self.name);
        buf.put_slice(&self.value);
    }

    /// Encode the pair into a fresh buffer.
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.encode_into(&mut buf);
        buf.freeze()
    }

    /// Decode one pair from the front of `buf`.
    ///
    /// Returns the pair and the number of bytes it occupied.
    ///
    /// # Example
    ///
    /// ```
    /// use fcgi_bridge::protocol::NameValuePair;
    ///
    /// let data = [12, 0, b'Q', b'U', b'E', b'R', b'Y', b'_', b'S', b'T', b'R', b'I', b'N', b'G'];
    /// let (pair, used) = NameValuePair::decode(&data).unwrap();
    /// assert_eq!(&pair.name[..], b"QUERY_STRING");
    /// assert!(pair.value.is_empty());
    /// assert_eq!(used, data.len());
    /// ```
    pub fn decode(buf: &[u8]) -> Result<(Self, usize)> {
        let (name_len, name_field) = read_length(buf)?;
        let (value_len, value_field) = read_length(&buf[name_field..])?;

        let start = name_field + value_field;
        let remaining = buf.len() - start;
        if name_len + value_len > remaining {
            return Err(BridgeError::Format(format!(
                "name/value pair needs {} bytes, {} remain",
                name_len + value_len,
                remaining
            )));
        }

        let name_end = start + name_len;
        let value_end = name_end + value_len;
        let pair = Self {
            name: Bytes::copy_from_slice(&buf[start..name_end]),
            value: Bytes::copy_from_slice(&buf[name_end..value_end]),
        };
        Ok((pair, value_end))
    }
}

/// Decode pairs until `buf` is exhausted.
pub fn decode_pairs(mut buf: &[u8]) -> Result<Vec<NameValuePair>> {
    let mut pairs = Vec::new();
    while !buf.is_empty() {
        let (pair, used) = NameValuePair::decode(buf)?;
        pairs.push(pair);
        buf = &buf[used..];
    }
    Ok(pairs)
}

/// Encode a sequence of pairs back to back.
pub fn encode_pairs<'a, I>(pairs: I) -> Bytes
where
    I: IntoIterator<Item = &'a NameValuePair>,
{
    let mut buf = BytesMut::new();
    for pair in pairs {
        pair.encode_into(&mut buf);
    }
    buf.freeze()
}

#[inline]
fn length_field_size(len: usize) -> usize {
    if len <= SHORT_LENGTH_MAX {
        1
    } else {
        4
    }
}

fn put_length(buf: &mut BytesMut, len: usize) {
    debug_assert!(len <= LONG_LENGTH_MAX);
    if len <= SHORT_LENGTH_MAX {
        buf.put_u8(len as u8);
    } else {
        buf.put_u32(len as u32 | 0x8000_0000);
    }
}

/// Read one length field, returning the length and the field's size.
fn read_length(buf: &[u8]) -> Result<(usize, usize)> {
    let first = *buf
        .first()
        .ok_or_else(|| BridgeError::Format("missing name/value length".to_string()))?;

    if first & 0x80 == 0 {
        return Ok((first as usize, 1));
    }

    if buf.len() < 4 {
        return Err(BridgeError::Format(format!(
            "long name/value length needs 4 bytes, {} remain",
            buf.len()
        )));
    }

    let len = ((first & 0x7F) as usize) << 24
        | (buf[1] as usize) << 16
        | (buf[2] as usize) << 8
        | buf[3] as usize;
    Ok((len, 4))
}
