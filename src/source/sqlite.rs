//! SQLite-backed partition key source
//!
//! Persists part key records per (dataset, shard) together with the hour
//! bucket they were last updated in. Scans are paged by rowid so a stream
//! never holds more than `scan_batch_size` records in memory.
//!
//! # Layout
//! ```text
//! part_keys(dataset, shard, part_key) -> (start_time, end_time, update_hour)
//! idx_part_keys_hour on (dataset, shard, update_hour)
//! ```

use crate::error::{BootstrapError, BootstrapResult};
use crate::source::{PartKeySource, PartKeyStream};
use crate::types::{PartKeyRecord, ShardRef};
use futures_util::stream::{self, StreamExt, TryStreamExt};
use rusqlite::{params, Connection, OpenFlags};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// Default number of rows fetched per page
pub const DEFAULT_SCAN_BATCH_SIZE: usize = 4096;

/// Column store table of partition keys, scanned lazily
pub struct SqlitePartKeySource {
    conn: Arc<Mutex<Connection>>,
    path: PathBuf,
    scan_batch_size: usize,
}

impl SqlitePartKeySource {
    /// Create or open the column store at `path`
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
            PRAGMA temp_store = MEMORY;

            CREATE TABLE IF NOT EXISTS part_keys (
                dataset TEXT NOT NULL,
                shard INTEGER NOT NULL,
                part_key BLOB NOT NULL,
                start_time INTEGER NOT NULL,
                end_time INTEGER NOT NULL,
                update_hour INTEGER NOT NULL,
                PRIMARY KEY (dataset, shard, part_key)
            );

            CREATE INDEX IF NOT EXISTS idx_part_keys_hour
                ON part_keys(dataset, shard, update_hour);
            ",
        )?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path,
            scan_batch_size: DEFAULT_SCAN_BATCH_SIZE,
        })
    }

    /// Override the page size used by scans
    pub fn with_scan_batch_size(mut self, scan_batch_size: usize) -> Self {
        self.scan_batch_size = scan_batch_size.max(1);
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Persist records for a shard, replacing existing rows with the same key
    ///
    /// Each entry is `(record, update_hour)`. The whole batch is written in
    /// one transaction.
    pub fn write_part_keys(
        &self,
        shard: &ShardRef,
        records: &[(PartKeyRecord, i64)],
    ) -> BootstrapResult<usize> {
        for (record, _) in records {
            record.validate()?;
        }

        let mut conn = lock(&self.conn)?;
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT OR REPLACE INTO part_keys
                    (dataset, shard, part_key, start_time, end_time, update_hour)
                 VALUES (?, ?, ?, ?, ?, ?)",
            )?;

            for (record, update_hour) in records {
                stmt.execute(params![
                    shard.dataset.as_str(),
                    shard.shard,
                    record.part_key,
                    record.start_time,
                    record.end_time,
                    update_hour
                ])?;
            }
        }
        tx.commit()?;

        tracing::debug!(shard = %shard, records = records.len(), "Wrote part keys");
        Ok(records.len())
    }

    /// Number of stored records for a shard
    pub fn count(&self, shard: &ShardRef) -> BootstrapResult<u64> {
        let conn = lock(&self.conn)?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM part_keys WHERE dataset = ? AND shard = ?",
            params![shard.dataset.as_str(), shard.shard],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    /// Stream all rows for a shard (optionally one update hour), page by page
    fn paged_scan(&self, shard: &ShardRef, hour: Option<i64>) -> PartKeyStream {
        let conn = Arc::clone(&self.conn);
        let dataset = shard.dataset.as_str().to_string();
        let shard_num = shard.shard;
        let batch = self.scan_batch_size;

        stream::try_unfold(Some(0i64), move |cursor| {
            let conn = Arc::clone(&conn);
            let dataset = dataset.clone();

            async move {
                let Some(after_rowid) = cursor else {
                    return Ok(None);
                };

                let page = fetch_page(&conn, &dataset, shard_num, hour, after_rowid, batch)?;
                if page.is_empty() {
                    return Ok(None);
                }

                // A short page means the table is exhausted
                let next = match page.last() {
                    Some((rowid, _)) if page.len() == batch => Some(*rowid),
                    _ => None,
                };
                let records: Vec<PartKeyRecord> = page.into_iter().map(|(_, r)| r).collect();

                Ok::<_, BootstrapError>(Some((records, next)))
            }
        })
        .map_ok(|records| stream::iter(records.into_iter().map(Ok::<_, BootstrapError>)))
        .try_flatten()
        .boxed()
    }
}

impl PartKeySource for SqlitePartKeySource {
    fn scan_part_keys(&self, shard: &ShardRef) -> PartKeyStream {
        self.paged_scan(shard, None)
    }

    fn part_keys_by_update_hour(&self, shard: &ShardRef, hour: i64) -> PartKeyStream {
        self.paged_scan(shard, Some(hour))
    }
}

fn lock(conn: &Mutex<Connection>) -> BootstrapResult<std::sync::MutexGuard<'_, Connection>> {
    conn.lock()
        .map_err(|e| BootstrapError::Lock(format!("Failed to acquire column store lock: {}", e)))
}

fn fetch_page(
    conn: &Mutex<Connection>,
    dataset: &str,
    shard: u32,
    hour: Option<i64>,
    after_rowid: i64,
    limit: usize,
) -> BootstrapResult<Vec<(i64, PartKeyRecord)>> {
    let conn = lock(conn)?;
    let mut stmt = conn
        .prepare_cached(
            "SELECT rowid, part_key, start_time, end_time FROM part_keys
             WHERE dataset = ?1 AND shard = ?2
               AND (?3 IS NULL OR update_hour = ?3)
               AND rowid > ?4
             ORDER BY rowid
             LIMIT ?5",
        )
        .map_err(|e| BootstrapError::Source(e.to_string()))?;

    let rows = stmt
        .query_map(
            params![dataset, shard, hour, after_rowid, limit as i64],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    PartKeyRecord {
                        part_key: row.get(1)?,
                        start_time: row.get(2)?,
                        end_time: row.get(3)?,
                    },
                ))
            },
        )
        .map_err(|e| BootstrapError::Source(e.to_string()))?;

    rows.collect::<Result<Vec<_>, _>>()
        .map_err(|e| BootstrapError::Source(e.to_string()))
}
