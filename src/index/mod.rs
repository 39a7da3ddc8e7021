//! Partition Key Index
//!
//! The index engine the bootstrapper writes into, seen through the
//! [`PartKeyIndex`] trait:
//!
//! - **MemPartKeyIndex**: writer state, committed state and a reader snapshot
//!   kept apart in memory, so visibility rules can be observed in tests
//! - **SqlitePartKeyIndex**: pending writes buffered in memory and flushed to
//!   SQLite in one transaction per commit
//!
//! # Visibility
//!
//! ```text
//! add / upsert ──► writer state ──commit──► durable ──refresh──► readers
//!                                                     (commits first if
//!                                                      changes are pending)
//! ```
//!
//! Lifecycle notifications ([`IndexState`]) travel on a separate,
//! fire-and-forget channel; see [`LifecycleNotifier`].

mod lifecycle;
mod memory;
mod sqlite;

pub use lifecycle::{IndexState, LifecycleEvent, LifecycleNotifier};
pub use memory::MemPartKeyIndex;
pub use sqlite::SqlitePartKeyIndex;

use crate::error::BootstrapResult;
use crate::types::PartitionId;
use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashMap;

/// Write side of a partition key index
///
/// Implementations must accept concurrent `add_part_key` / `upsert_part_key`
/// calls from many workers.
#[async_trait]
pub trait PartKeyIndex: Send + Sync {
    /// Insert a key assumed not to be in the index yet
    async fn add_part_key(
        &self,
        part_key: &[u8],
        part_id: PartitionId,
        start_time: i64,
        end_time: i64,
    ) -> BootstrapResult<()>;

    /// Insert or extend an entry
    ///
    /// An existing entry keeps the union of both time ranges and takes the
    /// supplied part id. Repeating the same call leaves the index unchanged.
    async fn upsert_part_key(
        &self,
        part_key: &[u8],
        part_id: PartitionId,
        start_time: i64,
        end_time: i64,
    ) -> BootstrapResult<()>;

    /// Make every preceding add/upsert durable
    async fn commit(&self) -> BootstrapResult<()>;

    /// Make committed state visible to readers; resolves once it is
    async fn refresh_readers_blocking(&self) -> BootstrapResult<()>;

    /// Advisory broadcast; must not block or fail
    fn notify_lifecycle_listener(&self, state: IndexState, timestamp_ms: i64);
}

/// What the index stores per partition key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PartKeyEntry {
    pub part_id: PartitionId,
    pub start_time: i64,
    pub end_time: i64,
}

impl PartKeyEntry {
    pub fn new(part_id: PartitionId, start_time: i64, end_time: i64) -> Self {
        Self {
            part_id,
            start_time,
            end_time,
        }
    }

    /// Upsert rule: widen the window, adopt the new id
    pub fn merged(self, part_id: PartitionId, start_time: i64, end_time: i64) -> Self {
        Self {
            part_id,
            start_time: self.start_time.min(start_time),
            end_time: self.end_time.max(end_time),
        }
    }
}

/// Point-in-time reader view of an index
#[derive(Debug, Clone, Default)]
pub struct IndexSnapshot {
    entries: HashMap<Vec<u8>, PartKeyEntry>,
}

impl IndexSnapshot {
    pub fn new(entries: HashMap<Vec<u8>, PartKeyEntry>) -> Self {
        Self { entries }
    }

    pub fn num_entries(&self) -> usize {
        self.entries.len()
    }

    pub fn get(&self, part_key: &[u8]) -> Option<&PartKeyEntry> {
        self.entries.get(part_key)
    }

    pub fn part_id(&self, part_key: &[u8]) -> Option<PartitionId> {
        self.get(part_key).map(|e| e.part_id)
    }

    /// Ids of series whose window ended strictly before `timestamp_ms`
    pub fn part_ids_ended_before(&self, timestamp_ms: i64) -> Vec<PartitionId> {
        let mut ids: Vec<_> = self
            .entries
            .values()
            .filter(|e| e.end_time < timestamp_ms)
            .map(|e| e.part_id)
            .collect();
        ids.sort_unstable();
        ids
    }

    pub fn max_part_id(&self) -> Option<PartitionId> {
        self.entries.values().map(|e| e.part_id).max()
    }

    /// `(key, id)` pairs, e.g. to seed a lookup-or-assign resolver
    pub fn part_ids(&self) -> impl Iterator<Item = (Vec<u8>, PartitionId)> + '_ {
        self.entries.iter().map(|(k, e)| (k.clone(), e.part_id))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&[u8], &PartKeyEntry)> {
        self.entries.iter().map(|(k, e)| (k.as_slice(), e))
    }
}
