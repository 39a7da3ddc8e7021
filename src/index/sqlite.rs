//! SQLite-backed partition key index
//!
//! Adds and upserts are buffered in a pending map; `commit` writes the whole
//! buffer in one transaction. Readers query the table, so they only ever see
//! committed rows.
//!
//! # Performance
//! - add/upsert: O(1) in memory (upsert of an unbuffered key costs one lookup)
//! - commit: one transaction, O(pending) statements

use crate::error::{BootstrapError, BootstrapResult};
use crate::index::{IndexState, LifecycleNotifier, PartKeyEntry, PartKeyIndex};
use crate::types::PartitionId;
use async_trait::async_trait;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

/// Partition key index persisted in a SQLite table
pub struct SqlitePartKeyIndex {
    conn: Mutex<Connection>,
    pending: Mutex<HashMap<Vec<u8>, PartKeyEntry>>,
    path: PathBuf,
    reader_generation: AtomicU64,
    lifecycle: LifecycleNotifier,
}

impl SqlitePartKeyIndex {
    /// Create or open an index at `path`
    pub fn open(path: impl AsRef<Path>) -> BootstrapResult<Self> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open_with_flags(
            &path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;

        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA cache_size = 10000;
            PRAGMA temp_store = MEMORY;

            CREATE TABLE IF NOT EXISTS part_key_index (
                part_key BLOB PRIMARY KEY,
                part_id INTEGER NOT NULL,
                start_time INTEGER NOT NULL,
                end_time INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_part_id ON part_key_index(part_id);
            CREATE INDEX IF NOT EXISTS idx_end_time ON part_key_index(end_time);
            ",
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
            pending: Mutex::new(HashMap::new()),
            path,
            reader_generation: AtomicU64::new(0),
            lifecycle: LifecycleNotifier::default(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn lifecycle(&self) -> &LifecycleNotifier {
        &self.lifecycle
    }

    /// Times readers have been refreshed since open
    pub fn reader_generation(&self) -> u64 {
        self.reader_generation.load(Ordering::SeqCst)
    }

    /// Writes buffered since the last commit
    pub fn pending_count(&self) -> usize {
        self.pending.lock().map(|p| p.len()).unwrap_or(0)
    }

    // ==================== Reader Methods ====================

    /// Committed entry for a key
    pub fn get(&self, part_key: &[u8]) -> BootstrapResult<Option<PartKeyEntry>> {
        let conn = self.lock_conn()?;
        Self::load_entry(&conn, part_key)
    }

    pub fn num_entries(&self) -> BootstrapResult<u64> {
        let conn = self.lock_conn()?;
        let count: i64 =
            conn.query_row("SELECT COUNT(*) FROM part_key_index", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    pub fn max_part_id(&self) -> BootstrapResult<Option<PartitionId>> {
        let conn = self.lock_conn()?;
        let max: Option<u32> =
            conn.query_row("SELECT MAX(part_id) FROM part_key_index", [], |row| row.get(0))?;
        Ok(max)
    }

    /// Ids of series whose window ended strictly before `timestamp_ms`
    pub fn part_ids_ended_before(&self, timestamp_ms: i64) -> BootstrapResult<Vec<PartitionId>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare_cached(
            "SELECT part_id FROM part_key_index WHERE end_time < ? ORDER BY part_id",
        )?;
        let ids = stmt
            .query_map(params![timestamp_ms], |row| row.get(0))?
            .collect::<Result<Vec<PartitionId>, _>>()?;
        Ok(ids)
    }

    /// All committed `(key, id)` pairs
    pub fn part_ids(&self) -> BootstrapResult<Vec<(Vec<u8>, PartitionId)>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare_cached("SELECT part_key, part_id FROM part_key_index")?;
        let pairs = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(pairs)
    }

    // ==================== Internals ====================

    fn lock_conn(&self) -> BootstrapResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| BootstrapError::Lock(format!("Failed to acquire index connection: {}", e)))
    }

    fn lock_pending(&self) -> BootstrapResult<MutexGuard<'_, HashMap<Vec<u8>, PartKeyEntry>>> {
        self.pending
            .lock()
            .map_err(|e| BootstrapError::Lock(format!("Failed to acquire pending writes: {}", e)))
    }

    fn load_entry(conn: &Connection, part_key: &[u8]) -> BootstrapResult<Option<PartKeyEntry>> {
        let entry = conn
            .query_row(
                "SELECT part_id, start_time, end_time FROM part_key_index WHERE part_key = ?",
                params![part_key],
                |row| Ok(PartKeyEntry::new(row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;
        Ok(entry)
    }

    /// Write the pending buffer in one transaction; the buffer is only
    /// cleared once the transaction commits
    fn commit_now(&self) -> BootstrapResult<usize> {
        let mut pending = self.lock_pending()?;
        if pending.is_empty() {
            return Ok(0);
        }

        let mut conn = self.lock_conn()?;
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT OR REPLACE INTO part_key_index (part_key, part_id, start_time, end_time)
                 VALUES (?, ?, ?, ?)",
            )?;
            for (part_key, entry) in pending.iter() {
                stmt.execute(params![
                    part_key,
                    entry.part_id,
                    entry.start_time,
                    entry.end_time
                ])?;
            }
        }
        tx.commit()?;

        let written = pending.len();
        pending.clear();
        tracing::debug!(path = ?self.path, written, "Committed part key index");
        Ok(written)
    }
}

#[async_trait]
impl PartKeyIndex for SqlitePartKeyIndex {
    async fn add_part_key(
        &self,
        part_key: &[u8],
        part_id: PartitionId,
        start_time: i64,
        end_time: i64,
    ) -> BootstrapResult<()> {
        let mut pending = self.lock_pending()?;
        pending.insert(
            part_key.to_vec(),
            PartKeyEntry::new(part_id, start_time, end_time),
        );
        Ok(())
    }

    async fn upsert_part_key(
        &self,
        part_key: &[u8],
        part_id: PartitionId,
        start_time: i64,
        end_time: i64,
    ) -> BootstrapResult<()> {
        let mut pending = self.lock_pending()?;

        let existing = match pending.get(part_key) {
            Some(entry) => Some(*entry),
            None => {
                let conn = self.lock_conn()?;
                Self::load_entry(&conn, part_key)?
            }
        };

        let entry = match existing {
            Some(existing) => existing.merged(part_id, start_time, end_time),
            None => PartKeyEntry::new(part_id, start_time, end_time),
        };
        pending.insert(part_key.to_vec(), entry);
        Ok(())
    }

    async fn commit(&self) -> BootstrapResult<()> {
        self.commit_now().map(|_| ())
    }

    async fn refresh_readers_blocking(&self) -> BootstrapResult<()> {
        self.commit_now()?;

        {
            let conn = self.lock_conn()?;
            conn.query_row("PRAGMA wal_checkpoint(PASSIVE)", [], |_| Ok(()))?;
        }

        self.reader_generation.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn notify_lifecycle_listener(&self, state: IndexState, timestamp_ms: i64) {
        self.lifecycle.notify(state, timestamp_ms);
    }
}
