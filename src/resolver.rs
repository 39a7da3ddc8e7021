//! Partition id resolution
//!
//! The bootstrapper never decides which id a series gets; it asks a
//! [`PartIdResolver`] supplied by the caller. Two policies ship with the crate:
//!
//! - **PartIdAllocator**: monotonic counter, one fresh id per call. Used by
//!   cold bootstraps where every scanned key is new.
//! - **KeyedPartIdResolver**: lookup-or-assign keyed by part key bytes. Used by
//!   incremental refresh, where a series seen in several hour buckets must
//!   keep the id it already has.
//!
//! Plain closures `Fn(&PartKeyRecord) -> BootstrapResult<PartitionId>` are
//! resolvers too.
//!
//! The id space is 32-bit and never reclaimed. Allocation past
//! [`MAX_PARTITION_ID`] fails with `PartIdSpaceExhausted`, and crossing
//! [`SATURATION_WARN_RATIO`] of the space logs one warning per allocator.

use crate::error::{BootstrapError, BootstrapResult};
use crate::types::{PartKeyRecord, PartitionId, MAX_PARTITION_ID};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

/// Fraction of the id space after which saturation is reported
pub const SATURATION_WARN_RATIO: f64 = 0.9;

/// Maps a partition key record to the id it should be indexed under
///
/// Must be safe to call from many workers at once. May block.
pub trait PartIdResolver: Send + Sync {
    fn resolve(&self, record: &PartKeyRecord) -> BootstrapResult<PartitionId>;
}

impl<F> PartIdResolver for F
where
    F: Fn(&PartKeyRecord) -> BootstrapResult<PartitionId> + Send + Sync,
{
    fn resolve(&self, record: &PartKeyRecord) -> BootstrapResult<PartitionId> {
        self(record)
    }
}

/// Monotonic partition id counter
#[derive(Debug)]
pub struct PartIdAllocator {
    next: AtomicU64,
    limit: u64,
    saturation_warned: AtomicBool,
}

impl Default for PartIdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl PartIdAllocator {
    /// Allocator for a cold index, starting at id 0
    pub fn new() -> Self {
        Self::starting_at(0)
    }

    /// Continue numbering after ids that are already in use
    pub fn starting_at(first: PartitionId) -> Self {
        Self::with_limit(first, MAX_PARTITION_ID)
    }

    /// Allocator whose largest id is `max_id` (lets tests hit exhaustion)
    pub fn with_limit(first: PartitionId, max_id: PartitionId) -> Self {
        Self {
            next: AtomicU64::new(first as u64),
            limit: max_id as u64,
            saturation_warned: AtomicBool::new(false),
        }
    }

    /// Hand out the next unused id
    pub fn allocate(&self) -> BootstrapResult<PartitionId> {
        let limit = self.limit;
        let id = self
            .next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |next| {
                (next <= limit).then_some(next + 1)
            })
            .map_err(|next| BootstrapError::PartIdSpaceExhausted { allocated: next })?;

        self.check_saturation(id);
        Ok(id as PartitionId)
    }

    /// The id the next allocation would return
    pub fn next_id(&self) -> u64 {
        self.next.load(Ordering::SeqCst)
    }

    /// Share of the id space already handed out
    pub fn utilization(&self) -> f64 {
        self.next_id() as f64 / (self.limit as f64 + 1.0)
    }

    fn check_saturation(&self, id: u64) {
        let threshold = ((self.limit as f64 + 1.0) * SATURATION_WARN_RATIO) as u64;
        if id >= threshold && !self.saturation_warned.swap(true, Ordering::Relaxed) {
            tracing::warn!(
                part_id = id,
                limit = self.limit,
                "Partition id space is nearly exhausted; ids are never reclaimed"
            );
        }
    }
}

impl PartIdResolver for PartIdAllocator {
    fn resolve(&self, _record: &PartKeyRecord) -> BootstrapResult<PartitionId> {
        self.allocate()
    }
}

/// Lookup-or-assign resolver keyed by part key bytes
///
/// A key that already has an id always resolves to it; new keys take the
/// next id from the allocator. Safe under concurrent delivery of the same key.
#[derive(Debug, Default)]
pub struct KeyedPartIdResolver {
    ids: Mutex<HashMap<Vec<u8>, PartitionId>>,
    allocator: PartIdAllocator,
}

impl KeyedPartIdResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed with `(key, id)` pairs already present in an index
    ///
    /// New keys are numbered after the largest seeded id.
    pub fn from_existing(existing: impl IntoIterator<Item = (Vec<u8>, PartitionId)>) -> Self {
        let ids: HashMap<Vec<u8>, PartitionId> = existing.into_iter().collect();
        let first_free = ids.values().max().map(|max| max.saturating_add(1)).unwrap_or(0);

        Self {
            ids: Mutex::new(ids),
            allocator: PartIdAllocator::starting_at(first_free),
        }
    }

    /// Id already assigned to a key, if any
    pub fn lookup(&self, part_key: &[u8]) -> Option<PartitionId> {
        self.ids.lock().ok()?.get(part_key).copied()
    }

    /// Number of keys holding an id, seeded ones included
    pub fn key_count(&self) -> usize {
        self.ids.lock().map(|ids| ids.len()).unwrap_or(0)
    }

    /// The allocator backing new assignments
    pub fn allocator(&self) -> &PartIdAllocator {
        &self.allocator
    }

    pub fn lookup_or_assign(&self, part_key: &[u8]) -> BootstrapResult<PartitionId> {
        let mut ids = self
            .ids
            .lock()
            .map_err(|e| BootstrapError::Lock(format!("Failed to acquire resolver lock: {}", e)))?;

        if let Some(&id) = ids.get(part_key) {
            return Ok(id);
        }

        let id = self.allocator.allocate()?;
        ids.insert(part_key.to_vec(), id);
        tracing::trace!(part_id = id, "Assigned partition id");
        Ok(id)
    }
}

impl PartIdResolver for KeyedPartIdResolver {
    fn resolve(&self, record: &PartKeyRecord) -> BootstrapResult<PartitionId> {
        self.lookup_or_assign(&record.part_key)
    }
}
