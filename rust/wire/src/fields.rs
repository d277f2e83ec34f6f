//! Process-wide field registry.
//!
//! Fields arrive as semicolon definition strings (`field:<name>` plus
//! optional `db:`, `friendly:`, `kind:`, `shortcut:` attributes) and get a
//! stable position assigned in registration order. Positions are never
//! reused and a name registered twice keeps its first position. Every append
//! bumps a strictly monotonic timestamp and rebuilds the serialized field
//! tables clients download, plus an MD5 content hash of the 16-bit table so
//! clients holding the current table can skip the download entirely.
//!
//! Table wire formats, entries carrying the full definition string:
//!
//! - v0 (legacy): `[ts:u32BE][0:u32BE][count:u8]` then per field
//!   `[defLen+1:u16BE][utf8 def][0x00]`. Unrepresentable past 255 fields.
//! - v1: `[ts:u32BE][1:u32BE][count:u16BE]` then the same entry form.

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::{BufMut, Bytes, BytesMut};
use md5::{Digest, Md5};

use crate::result::{DisplayEntry, EncodedResult};
use crate::{Result, WireError};

/// Most fields the legacy v0 table can carry.
const V0_MAX_FIELDS: usize = 255;

#[derive(Debug, Clone)]
pub struct FieldInfo {
    pub name: String,
    pub definition: String,
    pub db: Option<String>,
    pub friendly: Option<String>,
}

pub struct FieldRegistry {
    fields: Vec<FieldInfo>,
    by_name: HashMap<String, u16>,
    ts: u32,
    table_v0: Option<Bytes>,
    table_v1: Bytes,
    hash_hex: String,
}

impl FieldRegistry {
    pub fn new() -> Self {
        let mut registry = Self {
            fields: Vec::new(),
            by_name: HashMap::new(),
            ts: 0,
            table_v0: None,
            table_v1: Bytes::new(),
            hash_hex: String::new(),
        };
        registry.rebuild();
        registry
    }

    /// Register a field definition, returning its position.
    ///
    /// Idempotent by name: a known name returns its existing position and
    /// nothing changes, not even the timestamp. A new name appends, bumps
    /// the timestamp and rebuilds the tables and hash as one unit; callers
    /// in threaded code must serialize calls around that.
    pub fn add_field(&mut self, definition: &str) -> Result<u16> {
        let name = definition_attr(definition, "field")
            .ok_or_else(|| WireError::FieldDefinition(definition.to_string()))?;
        if let Some(pos) = self.by_name.get(name) {
            return Ok(*pos);
        }
        if self.fields.len() >= u16::MAX as usize {
            return Err(WireError::RegistryFull);
        }
        if definition.len() >= u16::MAX as usize {
            return Err(WireError::ValueLength(definition.len()));
        }

        let pos = self.fields.len() as u16;
        self.bump_ts(epoch_secs());
        self.by_name.insert(name.to_string(), pos);
        self.fields.push(FieldInfo {
            name: name.to_string(),
            definition: definition.to_string(),
            db: definition_attr(definition, "db").map(str::to_string),
            friendly: definition_attr(definition, "friendly").map(str::to_string),
        });
        self.rebuild();
        Ok(pos)
    }

    pub fn position(&self, name: &str) -> Option<u16> {
        self.by_name.get(name).copied()
    }

    pub fn info(&self, pos: u16) -> Option<&FieldInfo> {
        self.fields.get(pos as usize)
    }

    pub fn name(&self, pos: u16) -> Option<&str> {
        self.info(pos).map(|f| f.name.as_str())
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Timestamp of the current tables, epoch seconds, strictly increasing
    /// across appends even within one wall-clock second.
    pub fn ts(&self) -> u32 {
        self.ts
    }

    /// 32 lowercase hex chars: MD5 of the v1 table past its 8-byte header.
    pub fn hash_hex(&self) -> &str {
        &self.hash_hex
    }

    /// The legacy 8-bit table; refused once 256 or more fields exist.
    pub fn table_v0(&self) -> Result<Bytes> {
        self.table_v0
            .clone()
            .ok_or(WireError::TooManyFields(self.fields.len()))
    }

    pub fn table_v1(&self) -> Bytes {
        self.table_v1.clone()
    }

    /// The v1 table minus timestamp and version, as inlined in v2 batch
    /// responses: `[count:u16BE]` plus entries.
    pub fn table_v1_tail(&self) -> Bytes {
        self.table_v1.slice(8..)
    }

    /// Resolve a result's positions to names for the display endpoints.
    pub fn render(&self, result: &EncodedResult) -> Result<Vec<DisplayEntry>> {
        Ok(result
            .decode()?
            .into_iter()
            .map(|(pos, value)| DisplayEntry {
                field: self.name(pos).map(str::to_string),
                len: value.len(),
                value,
            })
            .collect())
    }

    fn bump_ts(&mut self, now: u32) {
        self.ts = if now <= self.ts { self.ts + 1 } else { now };
    }

    fn rebuild(&mut self) {
        self.table_v0 = if self.fields.len() <= V0_MAX_FIELDS {
            Some(self.build_table(0))
        } else {
            None
        };
        self.table_v1 = self.build_table(1);
        let digest = Md5::new().chain_update(&self.table_v1[8..]).finalize();
        self.hash_hex = digest.iter().map(|b| format!("{b:02x}")).collect();
    }

    fn build_table(&self, version: u32) -> Bytes {
        let body: usize = self.fields.iter().map(|f| 3 + f.definition.len()).sum();
        let mut buf = BytesMut::with_capacity(10 + body);
        buf.put_u32(self.ts);
        buf.put_u32(version);
        if version == 0 {
            buf.put_u8(self.fields.len() as u8);
        } else {
            buf.put_u16(self.fields.len() as u16);
        }
        for f in &self.fields {
            buf.put_u16(f.definition.len() as u16 + 1);
            buf.put_slice(f.definition.as_bytes());
            buf.put_u8(0);
        }
        buf.freeze()
    }
}

impl Default for FieldRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Pull one `key:value` attribute out of a semicolon definition string.
pub fn definition_attr<'a>(definition: &'a str, key: &str) -> Option<&'a str> {
    definition
        .split(';')
        .find_map(|part| part.strip_prefix(key).and_then(|rest| rest.strip_prefix(':')))
        .filter(|v| !v.is_empty())
}

fn epoch_secs() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0)
}
