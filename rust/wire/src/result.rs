//! The tag-value result encoding.
//!
//! A result is one count byte followed by `count` pairs, each serialized as
//! `[fieldPos:u8][len:u8][utf8 value][0x00]` where `len` is the value's byte
//! length plus one. The length prefix is the only framing; values are never
//! escaped and decoding never scans for delimiters. A lone zero byte is the
//! canonical empty result.

use bytes::{BufMut, Bytes, BytesMut};
use serde::Serialize;

use crate::{Result, WireError};

/// Values longer than this are truncated before encoding.
const MAX_VALUE_LEN: usize = 250;
/// Length an oversized value is cut down to.
const TRUNCATED_LEN: usize = 240;
/// The count byte caps how many pairs one result can carry.
const MAX_PAIRS: usize = 255;

/// An immutable encoded lookup result.
///
/// Always at least one byte long; every constructor either builds the buffer
/// pair by pair or validates it, so the count byte can be trusted.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EncodedResult {
    bytes: Bytes,
}

impl EncodedResult {
    /// The empty sentinel: zero pairs, a single zero byte.
    pub fn empty() -> Self {
        Self {
            bytes: Bytes::from_static(&[0]),
        }
    }

    /// Encode a list of (field position, value) pairs.
    ///
    /// Values whose UTF-8 length exceeds 250 bytes are silently truncated to
    /// at most 240 bytes, backing up to the nearest character boundary.
    /// Positions above 255 cannot be expressed in the pair format and error.
    pub fn encode<S: AsRef<str>>(pairs: &[(u16, S)]) -> Result<Self> {
        if pairs.len() > MAX_PAIRS {
            return Err(WireError::TooManyPairs(pairs.len()));
        }
        let mut buf = BytesMut::with_capacity(
            1 + pairs
                .iter()
                .map(|(_, v)| 3 + clamp(v.as_ref()).len())
                .sum::<usize>(),
        );
        buf.put_u8(pairs.len() as u8);
        for (pos, value) in pairs {
            if *pos > u8::MAX as u16 {
                return Err(WireError::FieldPosition(*pos));
            }
            let value = clamp(value.as_ref());
            buf.put_u8(*pos as u8);
            buf.put_u8(value.len() as u8 + 1);
            buf.put_slice(value.as_bytes());
            buf.put_u8(0);
        }
        Ok(Self {
            bytes: buf.freeze(),
        })
    }

    /// Read one result off the front of `buf`, returning it and the rest.
    ///
    /// This is the client-side primitive for walking the concatenated results
    /// in a batch response.
    pub fn parse(buf: &[u8]) -> Result<(Self, &[u8])> {
        let end = encoded_len(buf)?;
        Ok((
            Self {
                bytes: Bytes::copy_from_slice(&buf[..end]),
            },
            &buf[end..],
        ))
    }

    /// Number of pairs in this result.
    pub fn count(&self) -> u8 {
        self.bytes[0]
    }

    /// True when this result carries no pairs.
    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn to_bytes(&self) -> Bytes {
        self.bytes.clone()
    }

    /// Decode back into (field position, value) pairs.
    ///
    /// Inverts `encode` except for encode-time truncation. Fails when the
    /// count byte disagrees with the actual byte length.
    pub fn decode(&self) -> Result<Vec<(u16, String)>> {
        let buf = self.bytes.as_ref();
        if encoded_len(buf)? != buf.len() {
            return Err(WireError::MalformedResult);
        }
        let count = buf[0] as usize;
        let mut pairs = Vec::with_capacity(count);
        let mut offset = 1;
        for _ in 0..count {
            let pos = buf[offset] as u16;
            let len = buf[offset + 1] as usize;
            let value = String::from_utf8_lossy(&buf[offset + 2..offset + 1 + len]).into_owned();
            pairs.push((pos, value));
            offset += 2 + len;
        }
        Ok(pairs)
    }

    /// Concatenate many per-source results into one.
    ///
    /// `None` entries contribute nothing. Pair order follows input order with
    /// no de-duplication of repeated field positions. The summed count
    /// saturates at 255; pairs past that are dropped so the count byte stays
    /// truthful.
    pub fn combine(results: &[Option<EncodedResult>]) -> EncodedResult {
        let mut total = 0usize;
        let mut byte_len = 1usize;
        let mut present = 0usize;
        let mut only: Option<&EncodedResult> = None;
        for r in results.iter().flatten() {
            total += r.count() as usize;
            byte_len += r.bytes.len() - 1;
            present += 1;
            only = Some(r);
        }
        if total == 0 {
            return Self::empty();
        }
        if present == 1 {
            if let Some(r) = only {
                return r.clone();
            }
        }

        let take = total.min(MAX_PAIRS);
        let mut buf = BytesMut::with_capacity(byte_len);
        buf.put_u8(take as u8);
        let mut remaining = take;
        for r in results.iter().flatten() {
            if remaining == 0 {
                break;
            }
            let n = (r.count() as usize).min(remaining);
            if n == r.count() as usize {
                buf.put_slice(&r.bytes[1..]);
            } else {
                let mut offset = 1usize;
                for _ in 0..n {
                    offset += 2 + r.bytes[offset + 1] as usize;
                }
                buf.put_slice(&r.bytes[1..offset]);
            }
            remaining -= n;
        }
        Self {
            bytes: buf.freeze(),
        }
    }
}

/// One decoded pair with its field position resolved to a name, in the shape
/// the plain-text lookup endpoints render.
#[derive(Debug, Serialize, PartialEq)]
pub struct DisplayEntry {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    pub len: usize,
    pub value: String,
}

/// Total byte length of the single result at the front of `buf`.
fn encoded_len(buf: &[u8]) -> Result<usize> {
    let count = *buf.first().ok_or(WireError::MalformedResult)? as usize;
    let mut offset = 1usize;
    for _ in 0..count {
        if offset + 2 > buf.len() {
            return Err(WireError::MalformedResult);
        }
        let len = buf[offset + 1] as usize;
        if len == 0 || offset + 2 + len > buf.len() {
            return Err(WireError::MalformedResult);
        }
        offset += 2 + len;
    }
    Ok(offset)
}

fn clamp(value: &str) -> &str {
    if value.len() <= MAX_VALUE_LEN {
        return value;
    }
    let mut end = TRUNCATED_LEN;
    while !value.is_char_boundary(end) {
        end -= 1;
    }
    &value[..end]
}
