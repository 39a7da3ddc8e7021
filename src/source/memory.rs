//! In-memory partition key source

use crate::error::{BootstrapError, BootstrapResult};
use crate::source::{PartKeySource, PartKeyStream};
use crate::types::{PartKeyRecord, ShardRef};
use futures_util::stream::{self, StreamExt};
use std::collections::HashMap;
use std::sync::RwLock;

/// Stored record plus the hour bucket it was last updated in
#[derive(Debug, Clone)]
struct StoredPartKey {
    record: PartKeyRecord,
    update_hour: i64,
}

/// Column store stand-in keeping every shard's part keys in memory
#[derive(Debug, Default)]
pub struct MemPartKeySource {
    shards: RwLock<HashMap<ShardRef, Vec<StoredPartKey>>>,
}

impl MemPartKeySource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a record for `shard`, updated within `update_hour`
    pub fn add(
        &self,
        shard: &ShardRef,
        record: PartKeyRecord,
        update_hour: i64,
    ) -> BootstrapResult<()> {
        record.validate()?;

        let mut shards = self
            .shards
            .write()
            .map_err(|e| BootstrapError::Lock(format!("Failed to acquire source lock: {}", e)))?;
        shards.entry(shard.clone()).or_default().push(StoredPartKey {
            record,
            update_hour,
        });
        Ok(())
    }

    /// Number of records stored for a shard
    pub fn len(&self, shard: &ShardRef) -> usize {
        self.shards
            .read()
            .map(|shards| shards.get(shard).map(Vec::len).unwrap_or(0))
            .unwrap_or(0)
    }

    pub fn is_empty(&self, shard: &ShardRef) -> bool {
        self.len(shard) == 0
    }

    /// Snapshot matching records so the returned stream owns its data
    fn snapshot(
        &self,
        shard: &ShardRef,
        keep: impl Fn(&StoredPartKey) -> bool,
    ) -> BootstrapResult<Vec<PartKeyRecord>> {
        let shards = self
            .shards
            .read()
            .map_err(|e| BootstrapError::Lock(format!("Failed to acquire source lock: {}", e)))?;

        Ok(shards
            .get(shard)
            .map(|stored| {
                stored
                    .iter()
                    .filter(|s| keep(s))
                    .map(|s| s.record.clone())
                    .collect()
            })
            .unwrap_or_default())
    }

    fn into_stream(records: BootstrapResult<Vec<PartKeyRecord>>) -> PartKeyStream {
        match records {
            Ok(records) => stream::iter(records.into_iter().map(Ok)).boxed(),
            Err(e) => stream::once(async move { Err(e) }).boxed(),
        }
    }
}

impl PartKeySource for MemPartKeySource {
    fn scan_part_keys(&self, shard: &ShardRef) -> PartKeyStream {
        Self::into_stream(self.snapshot(shard, |_| true))
    }

    fn part_keys_by_update_hour(&self, shard: &ShardRef, hour: i64) -> PartKeyStream {
        Self::into_stream(self.snapshot(shard, |s| s.update_hour == hour))
    }
}
