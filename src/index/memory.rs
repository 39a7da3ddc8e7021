//! In-memory partition key index
//!
//! Three views of the same data, each behind its own lock:
//!
//! - `writer`: every add/upsert lands here immediately
//! - `committed`: copy of the writer taken at the last commit
//! - `reader`: snapshot handed to searchers, replaced on refresh
//!
//! Readers never observe writes that were not committed first.

use crate::error::{BootstrapError, BootstrapResult};
use crate::index::{IndexSnapshot, IndexState, LifecycleNotifier, PartKeyEntry, PartKeyIndex};
use crate::types::PartitionId;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

/// Partition key index held entirely in memory
#[derive(Debug, Default)]
pub struct MemPartKeyIndex {
    writer: Mutex<HashMap<Vec<u8>, PartKeyEntry>>,
    committed: Mutex<Arc<IndexSnapshot>>,
    reader: RwLock<Arc<IndexSnapshot>>,
    changes_pending: AtomicBool,
    commits: AtomicU64,
    lifecycle: LifecycleNotifier,
}

impl MemPartKeyIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current reader snapshot
    pub fn searcher(&self) -> Arc<IndexSnapshot> {
        self.reader
            .read()
            .map(|reader| Arc::clone(&reader))
            .unwrap_or_default()
    }

    /// State made durable by the last commit
    pub fn committed(&self) -> Arc<IndexSnapshot> {
        self.committed
            .lock()
            .map(|committed| Arc::clone(&committed))
            .unwrap_or_default()
    }

    /// Whether writes are waiting for a commit
    pub fn has_pending_changes(&self) -> bool {
        self.changes_pending.load(Ordering::SeqCst)
    }

    /// How many commits have completed
    pub fn commit_count(&self) -> u64 {
        self.commits.load(Ordering::SeqCst)
    }

    pub fn lifecycle(&self) -> &LifecycleNotifier {
        &self.lifecycle
    }

    fn lock_writer(&self) -> BootstrapResult<MutexGuard<'_, HashMap<Vec<u8>, PartKeyEntry>>> {
        self.writer
            .lock()
            .map_err(|e| BootstrapError::Lock(format!("Failed to acquire index writer: {}", e)))
    }

    fn commit_now(&self) -> BootstrapResult<()> {
        let writer = self.lock_writer()?;
        let snapshot = Arc::new(IndexSnapshot::new(writer.clone()));

        let mut committed = self
            .committed
            .lock()
            .map_err(|e| BootstrapError::Lock(format!("Failed to acquire commit lock: {}", e)))?;
        *committed = snapshot;

        // Cleared while the writer is still held so no write slips between
        self.changes_pending.store(false, Ordering::SeqCst);
        self.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl PartKeyIndex for MemPartKeyIndex {
    async fn add_part_key(
        &self,
        part_key: &[u8],
        part_id: PartitionId,
        start_time: i64,
        end_time: i64,
    ) -> BootstrapResult<()> {
        let mut writer = self.lock_writer()?;
        writer.insert(
            part_key.to_vec(),
            PartKeyEntry::new(part_id, start_time, end_time),
        );
        self.changes_pending.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn upsert_part_key(
        &self,
        part_key: &[u8],
        part_id: PartitionId,
        start_time: i64,
        end_time: i64,
    ) -> BootstrapResult<()> {
        let mut writer = self.lock_writer()?;
        let entry = match writer.get(part_key) {
            Some(existing) => existing.merged(part_id, start_time, end_time),
            None => PartKeyEntry::new(part_id, start_time, end_time),
        };
        writer.insert(part_key.to_vec(), entry);
        self.changes_pending.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn commit(&self) -> BootstrapResult<()> {
        self.commit_now()
    }

    async fn refresh_readers_blocking(&self) -> BootstrapResult<()> {
        if self.has_pending_changes() {
            self.commit_now()?;
        }

        let snapshot = self.committed();
        let mut reader = self
            .reader
            .write()
            .map_err(|e| BootstrapError::Lock(format!("Failed to acquire reader lock: {}", e)))?;
        *reader = snapshot;
        Ok(())
    }

    fn notify_lifecycle_listener(&self, state: IndexState, timestamp_ms: i64) {
        self.lifecycle.notify(state, timestamp_ms);
    }
}
