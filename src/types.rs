//! Core data types for partition key indexing
//!
//! - `PartKeyRecord`: one series identity with its validity window
//! - `PartitionId`: integer surrogate for a partition key
//! - `ShardRef`: which dataset/shard an operation targets
//! - `HourRange`: inclusive update-hour buckets for incremental refresh
//! - checkpoint and hour arithmetic

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{BootstrapError, BootstrapResult};

/// Integer surrogate for a partition key within one shard index
pub type PartitionId = u32;

/// Largest assignable partition id. Ids must fit a signed 32-bit column.
pub const MAX_PARTITION_ID: PartitionId = i32::MAX as PartitionId;

/// Shard number within a dataset
pub type ShardNum = u32;

/// Milliseconds in one update-hour bucket
pub const MILLIS_PER_HOUR: i64 = 3_600_000;

/// One partition key with the time range it is valid for
///
/// Produced by a partition key source and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PartKeyRecord {
    /// Opaque bytes uniquely identifying a series
    pub part_key: Vec<u8>,
    /// Unix timestamp in milliseconds
    pub start_time: i64,
    /// Unix timestamp in milliseconds, never before `start_time`
    pub end_time: i64,
}

impl PartKeyRecord {
    pub fn new(part_key: impl Into<Vec<u8>>, start_time: i64, end_time: i64) -> Self {
        Self {
            part_key: part_key.into(),
            start_time,
            end_time,
        }
    }

    /// Reject records whose window is inverted
    pub fn validate(&self) -> BootstrapResult<()> {
        if self.end_time < self.start_time {
            return Err(BootstrapError::InvalidRecord(format!(
                "end time {} is before start time {}",
                self.end_time, self.start_time
            )));
        }
        Ok(())
    }

    /// Same window, different key (used for derived downsample keys)
    pub fn with_key(&self, part_key: Vec<u8>) -> Self {
        Self {
            part_key,
            start_time: self.start_time,
            end_time: self.end_time,
        }
    }
}

/// Name of a dataset in the column store
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DatasetRef(String);

impl DatasetRef {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DatasetRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Target of a bootstrap or refresh: one shard of one dataset
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ShardRef {
    pub dataset: DatasetRef,
    pub shard: ShardNum,
}

impl ShardRef {
    pub fn new(dataset: impl Into<String>, shard: ShardNum) -> Self {
        Self {
            dataset: DatasetRef::new(dataset),
            shard,
        }
    }
}

impl fmt::Display for ShardRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.dataset, self.shard)
    }
}

/// Inclusive range of update-hour buckets `[from_hour, to_hour]`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HourRange {
    pub from_hour: i64,
    pub to_hour: i64,
}

impl HourRange {
    pub fn new(from_hour: i64, to_hour: i64) -> BootstrapResult<Self> {
        if from_hour > to_hour {
            return Err(BootstrapError::InvalidHourRange {
                from: from_hour,
                to: to_hour,
            });
        }
        Ok(Self { from_hour, to_hour })
    }

    pub fn hours(&self) -> std::ops::RangeInclusive<i64> {
        self.from_hour..=self.to_hour
    }

    /// Number of hour buckets covered (always at least one)
    pub fn hour_count(&self) -> u64 {
        self.to_hour.abs_diff(self.from_hour).saturating_add(1)
    }

    /// Timestamp at which the first bucket starts
    pub fn start_millis(&self) -> i64 {
        hour_start_millis(self.from_hour)
    }

    /// Timestamp at which the last bucket starts
    pub fn end_millis(&self) -> i64 {
        hour_start_millis(self.to_hour)
    }
}

/// Start of an hour bucket in epoch milliseconds
pub fn hour_start_millis(hour: i64) -> i64 {
    hour.saturating_mul(MILLIS_PER_HOUR)
}

/// Lower bound below which index state is assumed durable.
///
/// Never reaches further back than the retention window, even when the
/// persisted checkpoint is stale or missing.
pub fn effective_checkpoint(persisted: Option<i64>, now_ms: i64, ttl_ms: i64) -> i64 {
    let retention_floor = now_ms.saturating_sub(ttl_ms);
    persisted.map_or(retention_floor, |cp| cp.max(retention_floor))
}
