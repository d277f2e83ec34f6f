//! Batch lookup protocol framing.
//!
//! A request body is a run of records, each `[typeTag:u8][valueLen:u16BE]
//! [utf8 value]`. Tags with the high bit clear index [`BUILTIN_TYPES`]; a tag
//! with the high bit set carries an inline type name of length `tag & 0x7F`
//! between the tag and the value length. Any truncated or out-of-range
//! record poisons the whole batch: record boundaries cannot be trusted past
//! the corruption, so no partial decode is returned.
//!
//! Responses come in two framings picked by the client:
//!
//! - v0: `[fieldsTS:u32BE][0:u32BE]` then each result in request order.
//! - v2: `[0:u32BE][2:u32BE][hash:32 ascii hex]` then the field-table
//!   segment (`[count:u16BE]` plus entries, or a lone zero count when the
//!   client already holds the table), then each result in request order.

use bytes::{BufMut, Bytes, BytesMut};

use crate::result::EncodedResult;
use crate::{Result, WireError};

/// Type names addressable by bare tag index.
pub const BUILTIN_TYPES: [&str; 8] = [
    "ip", "domain", "md5", "email", "url", "tuple", "ja3", "sha256",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchQuery {
    pub type_name: String,
    pub value: String,
}

impl BatchQuery {
    pub fn new(type_name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            value: value.into(),
        }
    }
}

/// Decode a request body into queries, in wire order.
pub fn decode_request(buf: &[u8]) -> Result<Vec<BatchQuery>> {
    let mut queries = Vec::new();
    let mut offset = 0usize;
    while offset < buf.len() {
        let tag = buf[offset];
        offset += 1;

        let type_name = if tag & 0x80 != 0 {
            let name_len = (tag & 0x7F) as usize;
            if name_len == 0 || offset + name_len > buf.len() {
                return Err(WireError::MalformedBatch);
            }
            let name = String::from_utf8_lossy(&buf[offset..offset + name_len]).into_owned();
            offset += name_len;
            name
        } else {
            BUILTIN_TYPES
                .get(tag as usize)
                .ok_or(WireError::MalformedBatch)?
                .to_string()
        };

        if offset + 2 > buf.len() {
            return Err(WireError::MalformedBatch);
        }
        let value_len = u16::from_be_bytes([buf[offset], buf[offset + 1]]) as usize;
        offset += 2;
        if offset + value_len > buf.len() {
            return Err(WireError::MalformedBatch);
        }
        let value = String::from_utf8_lossy(&buf[offset..offset + value_len]).into_owned();
        offset += value_len;

        queries.push(BatchQuery { type_name, value });
    }
    Ok(queries)
}

/// Encode queries into a request body. Types outside [`BUILTIN_TYPES`] use
/// the inline-name form and must fit the 7-bit length.
pub fn encode_request(queries: &[BatchQuery]) -> Result<Bytes> {
    let mut buf = BytesMut::new();
    for q in queries {
        match BUILTIN_TYPES.iter().position(|t| *t == q.type_name) {
            Some(idx) => buf.put_u8(idx as u8),
            None => {
                let name_len = q.type_name.len();
                if name_len == 0 || name_len > 0x7F {
                    return Err(WireError::TypeNameLength(name_len));
                }
                buf.put_u8(0x80 | name_len as u8);
                buf.put_slice(q.type_name.as_bytes());
            }
        }
        if q.value.len() > u16::MAX as usize {
            return Err(WireError::ValueLength(q.value.len()));
        }
        buf.put_u16(q.value.len() as u16);
        buf.put_slice(q.value.as_bytes());
    }
    Ok(buf.freeze())
}

pub fn encode_response_v0(fields_ts: u32, results: &[EncodedResult]) -> Bytes {
    let body: usize = results.iter().map(EncodedResult::len).sum();
    let mut buf = BytesMut::with_capacity(8 + body);
    buf.put_u32(fields_ts);
    buf.put_u32(0);
    for r in results {
        buf.put_slice(r.as_bytes());
    }
    buf.freeze()
}

/// `table_tail` is the v1 field table past its 8-byte header; `None` emits
/// the zero-count marker that tells the client its cached table still holds.
pub fn encode_response_v2(
    hash_hex: &str,
    table_tail: Option<&[u8]>,
    results: &[EncodedResult],
) -> Bytes {
    let body: usize = results.iter().map(EncodedResult::len).sum();
    let mut buf = BytesMut::with_capacity(42 + table_tail.map_or(0, <[u8]>::len) + body);
    buf.put_u32(0);
    buf.put_u32(2);
    let mut hash = [0u8; 32];
    let src = hash_hex.as_bytes();
    let n = src.len().min(32);
    hash[..n].copy_from_slice(&src[..n]);
    buf.put_slice(&hash);
    match table_tail {
        Some(tail) => buf.put_slice(tail),
        None => buf.put_u16(0),
    }
    for r in results {
        buf.put_slice(r.as_bytes());
    }
    buf.freeze()
}
