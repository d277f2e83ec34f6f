//! Binary wire formats for the intelmux lookup broker.
//!
//! Three formats live here, shared by the service and its clients:
//!
//! 1. The tag-value result encoding: a count byte followed by
//!    `[fieldPos:u8][len:u8][utf8 value][0x00]` pairs, where `len` is the
//!    value length plus one. Results from multiple sources concatenate into
//!    one buffer with a summed count.
//! 2. The field tables: versioned serializations of every registered field
//!    definition, stamped with a monotonic timestamp and an MD5 content hash
//!    so clients can skip redundant downloads.
//! 3. The batch lookup protocol: `[typeTag:u8][valueLen:u16BE][value]`
//!    request records and the v0/v2 response framings.
//!
//! Everything here is synchronous and allocation-light; the broker layers
//! its locking and async plumbing on top.

pub mod batch;
pub mod fields;
pub mod result;

pub use batch::{decode_request, encode_request, BatchQuery, BUILTIN_TYPES};
pub use fields::{FieldInfo, FieldRegistry};
pub use result::{DisplayEntry, EncodedResult};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum WireError {
    #[error("malformed result buffer")]
    MalformedResult,
    #[error("malformed batch packet")]
    MalformedBatch,
    #[error("field position {0} does not fit the 8-bit result encoding")]
    FieldPosition(u16),
    #[error("result cannot hold {0} pairs")]
    TooManyPairs(usize),
    #[error("field definition has no field: attribute: {0:?}")]
    FieldDefinition(String),
    #[error("legacy field table cannot represent {0} fields")]
    TooManyFields(usize),
    #[error("field registry is full")]
    RegistryFull,
    #[error("inline type name length {0} exceeds 127")]
    TypeNameLength(usize),
    #[error("value length {0} exceeds 65535")]
    ValueLength(usize),
}

pub type Result<T> = std::result::Result<T, WireError>;
