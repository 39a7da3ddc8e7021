//! Downsample Part Key Projection
//!
//! Incremental refresh indexes *downsample* series, not raw ones. Each raw
//! part key is projected through a [`SchemaSet`] to the key of its
//! coarser-resolution counterpart.
//!
//! # Key layout
//!
//! ```text
//! part key = [schema_id: u16 LE][series identity bytes ...]
//!
//! raw      : [id("gauge")]      ["job=api,instance=a"]
//!              ↓ gauge → ds-gauge
//! derived  : [id("ds-gauge")]   ["job=api,instance=a"]
//! ```
//!
//! Schema ids are CRC32 of the schema name folded to 16 bits. A raw key
//! whose schema is unknown, or has no downsample schema, projects to nothing;
//! that is a normal outcome and the record is skipped.

use crate::error::{BootstrapError, BootstrapResult};
use crate::types::PartKeyRecord;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Bytes taken by the schema id prefix
pub const SCHEMA_ID_LEN: usize = 2;

/// 16-bit id of a schema name
pub fn schema_id(name: &str) -> u16 {
    let hash = crc32fast::hash(name.as_bytes());
    ((hash >> 16) ^ (hash & 0xffff)) as u16
}

/// Build a part key for `series` under `schema`
pub fn encode_part_key(schema: &str, series: &[u8]) -> Vec<u8> {
    let mut key = Vec::with_capacity(SCHEMA_ID_LEN + series.len());
    key.extend_from_slice(&schema_id(schema).to_le_bytes());
    key.extend_from_slice(series);
    key
}

/// Split a part key into schema id and series bytes
pub fn decode_part_key(part_key: &[u8]) -> Option<(u16, &[u8])> {
    if part_key.len() < SCHEMA_ID_LEN {
        return None;
    }
    let (prefix, series) = part_key.split_at(SCHEMA_ID_LEN);
    Some((u16::from_le_bytes([prefix[0], prefix[1]]), series))
}

/// Schema as declared in configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaDefinition {
    /// Raw schema name
    pub name: String,
    /// Schema its series are downsampled into, if any
    #[serde(default)]
    pub downsample: Option<String>,
}

#[derive(Debug, Clone)]
struct Schema {
    name: String,
    downsample_id: Option<u16>,
}

/// Known raw schemas and the downsample schema each one maps to
#[derive(Debug, Clone, Default)]
pub struct SchemaSet {
    by_id: HashMap<u16, Schema>,
}

impl SchemaSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from configuration entries
    pub fn from_definitions(definitions: &[SchemaDefinition]) -> BootstrapResult<Self> {
        let mut set = Self::new();
        for def in definitions {
            set.register(&def.name, def.downsample.as_deref())?;
        }
        Ok(set)
    }

    /// Register a raw schema; fails if its id collides with another name
    pub fn register(&mut self, name: &str, downsample: Option<&str>) -> BootstrapResult<u16> {
        let id = schema_id(name);

        if let Some(existing) = self.by_id.get(&id) {
            if existing.name != name {
                return Err(BootstrapError::Schema(format!(
                    "schema '{}' collides with '{}' on id {:#06x}",
                    name, existing.name, id
                )));
            }
            return Err(BootstrapError::Schema(format!(
                "schema '{}' registered twice",
                name
            )));
        }

        self.by_id.insert(
            id,
            Schema {
                name: name.to_string(),
                downsample_id: downsample.map(schema_id),
            },
        );
        Ok(id)
    }

    /// Builder form of [`SchemaSet::register`] for static schema lists
    pub fn with_schema(mut self, name: &str, downsample: Option<&str>) -> BootstrapResult<Self> {
        self.register(name, downsample)?;
        Ok(self)
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    /// Name of the raw schema a key belongs to, if known
    pub fn schema_name(&self, part_key: &[u8]) -> Option<&str> {
        let (id, _) = decode_part_key(part_key)?;
        self.by_id.get(&id).map(|s| s.name.as_str())
    }

    /// Project a raw part key to its downsample key
    pub fn downsample_part_key(&self, raw_key: &[u8]) -> Option<Vec<u8>> {
        let (id, series) = decode_part_key(raw_key)?;
        let downsample_id = self.by_id.get(&id)?.downsample_id?;

        let mut key = Vec::with_capacity(raw_key.len());
        key.extend_from_slice(&downsample_id.to_le_bytes());
        key.extend_from_slice(series);
        Some(key)
    }

    /// Project a whole record, keeping its time window
    pub fn downsample_record(&self, record: &PartKeyRecord) -> Option<PartKeyRecord> {
        self.downsample_part_key(&record.part_key)
            .map(|key| record.with_key(key))
    }
}
