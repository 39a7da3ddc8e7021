//! Index Bootstrapper
//!
//! Builds and refreshes a shard's partition key index from the column store.
//! Three strategies share one framing:
//!
//! ```text
//!                     ┌──────────────────────────────────────────────┐
//! Refreshing(t0) ──►  │ scan ─► (filter / project) ─► resolve ─► write │ ──► commit ──► Synced(t1) ──► refresh readers
//!                     └──────────────────────────────────────────────┘
//!
//! raw         : full scan, sequential add              Synced(now)
//! downsample  : full scan, end_time > checkpoint,      (no Synced)
//!               parallel add
//! refresh     : hour buckets merged unordered,         Synced(to_hour)
//!               projected to downsample keys,
//!               parallel upsert
//! ```
//!
//! Commit only runs after every write of the call has finished, and Synced is
//! only announced after commit succeeded. The first failure ends the call and
//! nothing after it runs, so failed calls never announce Synced. In-flight
//! writes of a failed call are aborted and awaited before it returns; any
//! that already landed stay uncommitted.

use crate::downsample::SchemaSet;
use crate::error::{BootstrapError, BootstrapResult};
use crate::index::{IndexState, PartKeyIndex};
use crate::resolver::PartIdResolver;
use crate::source::PartKeySource;
use crate::types::{effective_checkpoint, HourRange, PartKeyRecord, ShardRef};
use futures_util::future;
use futures_util::stream::{self, Stream, StreamExt, TryStreamExt};
use std::pin::{pin, Pin};
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinSet;

/// Source of "now" in epoch milliseconds
pub type Clock = Arc<dyn Fn() -> i64 + Send + Sync>;

/// Bootstrapper tuning
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootstrapConfig {
    /// Records processed concurrently by the parallel paths
    pub parallelism: usize,
}

impl Default for BootstrapConfig {
    fn default() -> Self {
        Self {
            parallelism: default_parallelism(),
        }
    }
}

/// Number of available processing units, at least one
pub fn default_parallelism() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// Orchestrates bootstrap and refresh of partition key indexes
///
/// Holds no state between calls apart from its source, configuration and
/// clock. Callers must not run two operations against the same shard index
/// at once.
pub struct IndexBootstrapper {
    source: Arc<dyn PartKeySource>,
    config: BootstrapConfig,
    clock: Clock,
}

impl IndexBootstrapper {
    /// Create a bootstrapper reading from `source` with default settings
    pub fn new(source: Arc<dyn PartKeySource>) -> Self {
        Self::with_config(source, BootstrapConfig::default())
    }

    /// Create with custom configuration
    pub fn with_config(source: Arc<dyn PartKeySource>, config: BootstrapConfig) -> Self {
        Self {
            source,
            config,
            clock: Arc::new(|| chrono::Utc::now().timestamp_millis()),
        }
    }

    /// Replace the wall clock (tests pin time with this)
    pub fn with_clock(mut self, clock: impl Fn() -> i64 + Send + Sync + 'static) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Override the default degree of parallelism
    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.config.parallelism = parallelism.max(1);
        self
    }

    /// Settings the parallel paths fall back to
    pub fn config(&self) -> &BootstrapConfig {
        &self.config
    }

    fn now(&self) -> i64 {
        (self.clock)()
    }

    fn parallelism(&self, requested: Option<usize>) -> usize {
        requested.unwrap_or(self.config.parallelism).max(1)
    }

    // ==================== Full Raw Bootstrap ====================

    /// Index every partition key of a shard, one record at a time
    ///
    /// Record N is written before record N+1 is resolved. Returns the number
    /// of records indexed.
    pub async fn bootstrap_index_raw<I, R>(
        &self,
        index: &Arc<I>,
        shard: &ShardRef,
        resolver: &Arc<R>,
    ) -> BootstrapResult<u64>
    where
        I: PartKeyIndex + ?Sized + 'static,
        R: PartIdResolver + ?Sized + 'static,
    {
        let start = Instant::now();
        let now = self.now();
        tracing::info!(shard = %shard, "Starting raw index bootstrap");

        index.notify_lifecycle_listener(IndexState::Refreshing, now);

        let result = async {
            let mut records = self.source.scan_part_keys(shard);
            let mut count = 0u64;

            while let Some(record) = records.try_next().await? {
                let part_id = resolver.resolve(&record)?;
                index
                    .add_part_key(
                        &record.part_key,
                        part_id,
                        record.start_time,
                        record.end_time,
                    )
                    .await?;
                tracing::trace!(
                    part_id,
                    start = record.start_time,
                    end = record.end_time,
                    "Indexed part key"
                );
                count += 1;
            }

            index.commit().await?;
            index.notify_lifecycle_listener(IndexState::Synced, now);
            index.refresh_readers_blocking().await?;
            Ok::<_, BootstrapError>(count)
        }
        .await;

        log_outcome("raw bootstrap", shard, &result, start);
        result
    }

    // ==================== Parallel Downsample Bootstrap ====================

    /// Index the partition keys still live after the checkpoint, in parallel
    ///
    /// The checkpoint is clamped to the retention window first; records with
    /// `end_time <= checkpoint` are skipped. Never announces Synced: the
    /// orchestrator above decides when the index is complete.
    pub async fn bootstrap_index_downsample<I, R>(
        &self,
        index: &Arc<I>,
        shard: &ShardRef,
        checkpoint: Option<i64>,
        ttl_ms: i64,
        parallelism: Option<usize>,
        resolver: &Arc<R>,
    ) -> BootstrapResult<u64>
    where
        I: PartKeyIndex + ?Sized + 'static,
        R: PartIdResolver + ?Sized + 'static,
    {
        let start = Instant::now();
        let checkpoint = effective_checkpoint(checkpoint, self.now(), ttl_ms);
        let parallelism = self.parallelism(parallelism);
        tracing::info!(
            shard = %shard,
            checkpoint,
            parallelism,
            "Starting downsample index bootstrap"
        );

        index.notify_lifecycle_listener(IndexState::Refreshing, checkpoint);

        let result = async {
            let mut skipped = 0u64;

            let live = self.source.scan_part_keys(shard).try_filter(|record| {
                let live = record.end_time > checkpoint;
                if !live {
                    skipped += 1;
                    tracing::debug!(
                        end = record.end_time,
                        checkpoint,
                        "Skipping part key covered by checkpoint"
                    );
                }
                future::ready(live)
            });
            let count = write_records(live, parallelism, index, resolver, WriteMode::Add).await?;
            tracing::debug!(skipped, "Checkpoint filter done");

            index.commit().await?;
            index.refresh_readers_blocking().await?;
            Ok::<_, BootstrapError>(count)
        }
        .await;

        log_outcome("downsample bootstrap", shard, &result, start);
        result
    }

    // ==================== Incremental Hourly Refresh ====================

    /// Upsert downsample keys for records updated in `[from_hour, to_hour]`
    ///
    /// Hour buckets are fetched concurrently and merged without ordering.
    /// Raw keys without a downsample projection are skipped. Returns the
    /// number of upserts performed.
    #[allow(clippy::too_many_arguments)]
    pub async fn refresh_with_downsample_part_keys<I, R>(
        &self,
        index: &Arc<I>,
        shard: &ShardRef,
        from_hour: i64,
        to_hour: i64,
        parallelism: Option<usize>,
        schemas: &SchemaSet,
        resolver: &Arc<R>,
    ) -> BootstrapResult<u64>
    where
        I: PartKeyIndex + ?Sized + 'static,
        R: PartIdResolver + ?Sized + 'static,
    {
        let hours = HourRange::new(from_hour, to_hour)?;
        let start = Instant::now();
        let parallelism = self.parallelism(parallelism);
        tracing::info!(
            shard = %shard,
            from_hour,
            to_hour,
            hours = hours.hour_count(),
            parallelism,
            "Starting downsample index refresh"
        );

        index.notify_lifecycle_listener(IndexState::Refreshing, hours.start_millis());

        let result = async {
            let source = Arc::clone(&self.source);
            let projected = stream::iter(hours.hours())
                .map(move |hour| source.part_keys_by_update_hour(shard, hour))
                .flatten_unordered(parallelism)
                .try_filter_map(|record| {
                    let derived = schemas.downsample_record(&record);
                    if derived.is_none() {
                        tracing::debug!(
                            schema = ?schemas.schema_name(&record.part_key),
                            start = record.start_time,
                            end = record.end_time,
                            "No downsample key for part key"
                        );
                    }
                    future::ready(Ok(derived))
                });
            let count =
                write_records(projected, parallelism, index, resolver, WriteMode::Upsert).await?;

            index.commit().await?;
            index.notify_lifecycle_listener(IndexState::Synced, hours.end_millis());
            index.refresh_readers_blocking().await?;
            Ok::<_, BootstrapError>(count)
        }
        .await;

        log_outcome("downsample refresh", shard, &result, start);
        result
    }
}

#[derive(Debug, Clone, Copy)]
enum WriteMode {
    Add,
    Upsert,
}

/// Resolve and write records on a bounded set of tasks
///
/// At most `parallelism` writes are in flight, completing in any order. On
/// the first error every remaining task is aborted and awaited, so no write
/// started by this call lands after it returns.
async fn write_records<S, I, R>(
    records: S,
    parallelism: usize,
    index: &Arc<I>,
    resolver: &Arc<R>,
    mode: WriteMode,
) -> BootstrapResult<u64>
where
    S: Stream<Item = BootstrapResult<PartKeyRecord>>,
    I: PartKeyIndex + ?Sized + 'static,
    R: PartIdResolver + ?Sized + 'static,
{
    let mut records = pin!(records);
    let mut tasks = JoinSet::new();

    let result = drain_records(
        records.as_mut(),
        parallelism,
        index,
        resolver,
        mode,
        &mut tasks,
    )
    .await;
    if result.is_err() {
        tasks.abort_all();
        while tasks.join_next().await.is_some() {}
    }
    result
}

async fn drain_records<S, I, R>(
    mut records: Pin<&mut S>,
    parallelism: usize,
    index: &Arc<I>,
    resolver: &Arc<R>,
    mode: WriteMode,
    tasks: &mut JoinSet<BootstrapResult<()>>,
) -> BootstrapResult<u64>
where
    S: Stream<Item = BootstrapResult<PartKeyRecord>>,
    I: PartKeyIndex + ?Sized + 'static,
    R: PartIdResolver + ?Sized + 'static,
{
    let mut count = 0u64;
    let mut exhausted = false;

    loop {
        while !exhausted && tasks.len() < parallelism {
            match records.try_next().await? {
                Some(record) => {
                    tasks.spawn(write_record(
                        Arc::clone(index),
                        Arc::clone(resolver),
                        record,
                        mode,
                    ));
                }
                None => exhausted = true,
            }
        }

        match tasks.join_next().await {
            Some(joined) => {
                joined??;
                count += 1;
            }
            None => return Ok(count),
        }
    }
}

async fn write_record<I, R>(
    index: Arc<I>,
    resolver: Arc<R>,
    record: PartKeyRecord,
    mode: WriteMode,
) -> BootstrapResult<()>
where
    I: PartKeyIndex + ?Sized + 'static,
    R: PartIdResolver + ?Sized + 'static,
{
    let part_id = resolver.resolve(&record)?;
    match mode {
        WriteMode::Add => {
            index
                .add_part_key(&record.part_key, part_id, record.start_time, record.end_time)
                .await?
        }
        WriteMode::Upsert => {
            index
                .upsert_part_key(&record.part_key, part_id, record.start_time, record.end_time)
                .await?
        }
    }
    tracing::trace!(
        part_id,
        start = record.start_time,
        end = record.end_time,
        "Indexed part key"
    );
    Ok(())
}

fn log_outcome(operation: &str, shard: &ShardRef, result: &BootstrapResult<u64>, start: Instant) {
    let elapsed_ms = start.elapsed().as_millis() as u64;
    match result {
        Ok(count) => {
            tracing::info!(shard = %shard, count, elapsed_ms, "Index {} completed", operation);
        }
        Err(e) => {
            tracing::error!(shard = %shard, error = %e, elapsed_ms, "Index {} failed", operation);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::downsample::encode_part_key;
    use crate::error::BootstrapError;
    use crate::index::{IndexSnapshot, MemPartKeyIndex, PartKeyEntry};
    use crate::resolver::{KeyedPartIdResolver, PartIdAllocator};
    use crate::source::{MemPartKeySource, PartKeyStream};
    use crate::types::{PartitionId, MILLIS_PER_HOUR};
    use async_trait::async_trait;
    use proptest::prelude::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    fn shard() -> ShardRef {
        ShardRef::new("prometheus", 0)
    }

    fn schemas() -> SchemaSet {
        SchemaSet::new()
            .with_schema("gauge", Some("ds-gauge"))
            .unwrap()
            .with_schema("untyped", None)
            .unwrap()
    }

    fn source_with(records: &[(&str, i64, i64, i64)]) -> Arc<MemPartKeySource> {
        let source = MemPartKeySource::new();
        for (key, start, end, hour) in records {
            source
                .add(&shard(), PartKeyRecord::new(key.as_bytes().to_vec(), *start, *end), *hour)
                .unwrap();
        }
        Arc::new(source)
    }

    fn entries(snapshot: &IndexSnapshot) -> HashMap<Vec<u8>, PartKeyEntry> {
        snapshot.iter().map(|(k, e)| (k.to_vec(), *e)).collect()
    }

    #[derive(Debug, Clone, PartialEq)]
    enum Call {
        Write,
        Commit,
        Refresh,
        Lifecycle(IndexState, i64),
    }

    /// Wraps the in-memory index and records the order of calls into it
    #[derive(Default)]
    struct RecordingIndex {
        inner: MemPartKeyIndex,
        calls: Mutex<Vec<Call>>,
        fail_commit: bool,
    }

    impl RecordingIndex {
        fn failing_commit() -> Self {
            Self {
                fail_commit: true,
                ..Default::default()
            }
        }

        fn record(&self, call: Call) {
            self.calls.lock().unwrap().push(call);
        }

        fn calls(&self) -> Vec<Call> {
            self.calls.lock().unwrap().clone()
        }

        fn position(&self, call: &Call) -> Option<usize> {
            self.calls().iter().position(|c| c == call)
        }

        fn announced(&self, state: IndexState) -> bool {
            self.calls()
                .iter()
                .any(|c| matches!(c, Call::Lifecycle(s, _) if *s == state))
        }
    }

    #[async_trait]
    impl PartKeyIndex for RecordingIndex {
        async fn add_part_key(
            &self,
            key: &[u8],
            id: PartitionId,
            start: i64,
            end: i64,
        ) -> BootstrapResult<()> {
            self.record(Call::Write);
            self.inner.add_part_key(key, id, start, end).await
        }

        async fn upsert_part_key(
            &self,
            key: &[u8],
            id: PartitionId,
            start: i64,
            end: i64,
        ) -> BootstrapResult<()> {
            self.record(Call::Write);
            self.inner.upsert_part_key(key, id, start, end).await
        }

        async fn commit(&self) -> BootstrapResult<()> {
            self.record(Call::Commit);
            if self.fail_commit {
                return Err(BootstrapError::Index("disk full".to_string()));
            }
            self.inner.commit().await
        }

        async fn refresh_readers_blocking(&self) -> BootstrapResult<()> {
            self.record(Call::Refresh);
            self.inner.refresh_readers_blocking().await
        }

        fn notify_lifecycle_listener(&self, state: IndexState, timestamp_ms: i64) {
            self.record(Call::Lifecycle(state, timestamp_ms));
            self.inner.notify_lifecycle_listener(state, timestamp_ms);
        }
    }

    /// Yields its records, then fails
    struct FailingSource {
        records: Vec<PartKeyRecord>,
    }

    impl PartKeySource for FailingSource {
        fn scan_part_keys(&self, _shard: &ShardRef) -> PartKeyStream {
            let mut items: Vec<BootstrapResult<PartKeyRecord>> =
                self.records.iter().cloned().map(Ok).collect();
            items.push(Err(BootstrapError::Source("segment unreadable".to_string())));
            stream::iter(items).boxed()
        }

        fn part_keys_by_update_hour(&self, shard: &ShardRef, _hour: i64) -> PartKeyStream {
            self.scan_part_keys(shard)
        }
    }

    // ==================== Raw ====================

    #[tokio::test]
    async fn test_raw_bootstrap_indexes_every_record() {
        let source = source_with(&[("k1", 0, 100, 0), ("k2", 50, 150, 0)]);
        let bootstrapper = IndexBootstrapper::new(source).with_clock(|| 1_000);
        let index = Arc::new(MemPartKeyIndex::new());
        let resolver = Arc::new(PartIdAllocator::new());

        let count = bootstrapper
            .bootstrap_index_raw(&index, &shard(), &resolver)
            .await
            .unwrap();

        assert_eq!(count, 2);
        let searcher = index.searcher();
        assert_eq!(searcher.num_entries(), 2);
        assert_eq!(searcher.get(b"k1"), Some(&PartKeyEntry::new(0, 0, 100)));
        assert_eq!(searcher.get(b"k2"), Some(&PartKeyEntry::new(1, 50, 150)));
        assert_eq!(index.lifecycle().latest().unwrap().state, IndexState::Synced);
    }

    #[tokio::test]
    async fn test_raw_bootstrap_lifecycle_ordering() {
        let source = source_with(&[("k1", 0, 100, 0), ("k2", 50, 150, 0)]);
        let bootstrapper = IndexBootstrapper::new(source).with_clock(|| 7_000);
        let index = Arc::new(RecordingIndex::default());
        let resolver = Arc::new(PartIdAllocator::new());

        bootstrapper
            .bootstrap_index_raw(&index, &shard(), &resolver)
            .await
            .unwrap();

        assert_eq!(
            index.calls(),
            vec![
                Call::Lifecycle(IndexState::Refreshing, 7_000),
                Call::Write,
                Call::Write,
                Call::Commit,
                Call::Lifecycle(IndexState::Synced, 7_000),
                Call::Refresh,
            ]
        );
    }

    #[tokio::test]
    async fn test_raw_bootstrap_empty_shard() {
        let bootstrapper = IndexBootstrapper::new(Arc::new(MemPartKeySource::new()));
        let index = Arc::new(MemPartKeyIndex::new());
        let resolver = Arc::new(PartIdAllocator::new());

        let count = bootstrapper
            .bootstrap_index_raw(&index, &shard(), &resolver)
            .await
            .unwrap();
        assert_eq!(count, 0);
        assert_eq!(index.searcher().num_entries(), 0);
    }

    #[tokio::test]
    async fn test_source_failure_never_announces_synced() {
        let source = FailingSource {
            records: vec![PartKeyRecord::new(b"k1".to_vec(), 0, 100)],
        };
        let bootstrapper = IndexBootstrapper::new(Arc::new(source));
        let index = Arc::new(RecordingIndex::default());
        let resolver = Arc::new(PartIdAllocator::new());

        let err = bootstrapper
            .bootstrap_index_raw(&index, &shard(), &resolver)
            .await
            .unwrap_err();

        assert!(matches!(err, BootstrapError::Source(_)));
        assert!(index.announced(IndexState::Refreshing));
        assert!(!index.announced(IndexState::Synced));
        assert_eq!(index.position(&Call::Commit), None);
        assert_eq!(index.inner.searcher().num_entries(), 0);
    }

    // ==================== Downsample ====================

    #[tokio::test]
    async fn test_downsample_bootstrap_filters_by_checkpoint() {
        let source = source_with(&[("k1", 0, 100, 0), ("k2", 200, 300, 0)]);
        let bootstrapper = IndexBootstrapper::new(source).with_clock(|| 1_000);
        let index = Arc::new(MemPartKeyIndex::new());
        let resolver = Arc::new(PartIdAllocator::new());

        let count = bootstrapper
            .bootstrap_index_downsample(&index, &shard(), Some(150), 10_000, Some(4), &resolver)
            .await
            .unwrap();

        assert_eq!(count, 1);
        let searcher = index.searcher();
        assert_eq!(searcher.num_entries(), 1);
        assert_eq!(searcher.get(b"k2"), Some(&PartKeyEntry::new(0, 200, 300)));
        assert!(searcher.get(b"k1").is_none());
    }

    #[tokio::test]
    async fn test_downsample_bootstrap_clamps_stale_checkpoint() {
        // now - ttl = 500 wins over the persisted 100
        let source = source_with(&[("old", 0, 400, 0), ("edge", 0, 500, 0), ("live", 0, 501, 0)]);
        let bootstrapper = IndexBootstrapper::new(source).with_clock(|| 1_000);
        let index = Arc::new(RecordingIndex::default());
        let resolver = Arc::new(PartIdAllocator::new());

        let count = bootstrapper
            .bootstrap_index_downsample(&index, &shard(), Some(100), 500, None, &resolver)
            .await
            .unwrap();

        assert_eq!(count, 1);
        assert_eq!(index.calls()[0], Call::Lifecycle(IndexState::Refreshing, 500));
        assert!(index.inner.searcher().get(b"live").is_some());
        assert!(index.inner.searcher().get(b"edge").is_none());
    }

    #[tokio::test]
    async fn test_downsample_bootstrap_never_announces_synced() {
        let source = source_with(&[("k1", 0, 100, 0), ("k2", 50, 150, 0)]);
        let bootstrapper = IndexBootstrapper::new(source).with_clock(|| 100);
        let index = Arc::new(RecordingIndex::default());
        let resolver = Arc::new(PartIdAllocator::new());

        bootstrapper
            .bootstrap_index_downsample(&index, &shard(), None, 1_000, Some(2), &resolver)
            .await
            .unwrap();

        assert!(!index.announced(IndexState::Synced));
        let calls = index.calls();
        assert_eq!(&calls[calls.len() - 2..], &[Call::Commit, Call::Refresh]);
    }

    #[tokio::test]
    async fn test_downsample_bootstrap_assigns_distinct_ids() {
        let source = MemPartKeySource::new();
        for i in 0..200 {
            source
                .add(
                    &shard(),
                    PartKeyRecord::new(format!("series-{}", i).into_bytes(), i, i + 10),
                    0,
                )
                .unwrap();
        }
        let bootstrapper = IndexBootstrapper::new(Arc::new(source)).with_clock(|| 0);
        let index = Arc::new(MemPartKeyIndex::new());
        let resolver = Arc::new(PartIdAllocator::new());

        let count = bootstrapper
            .bootstrap_index_downsample(&index, &shard(), None, 1_000, Some(8), &resolver)
            .await
            .unwrap();

        assert_eq!(count, 200);
        let mut ids: Vec<_> = index.searcher().part_ids().map(|(_, id)| id).collect();
        ids.sort_unstable();
        assert_eq!(ids, (0..200).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_resolver_failure_aborts_without_commit() {
        let source = source_with(&[("ok", 0, 100, 0), ("bad", 0, 100, 0)]);
        let bootstrapper = IndexBootstrapper::new(source).with_clock(|| 0);
        let index = Arc::new(MemPartKeyIndex::new());
        let resolver = Arc::new(|record: &PartKeyRecord| -> BootstrapResult<PartitionId> {
            if record.part_key == b"bad" {
                Err(BootstrapError::Resolver("no id for series".to_string()))
            } else {
                Ok(1)
            }
        });

        let err = bootstrapper
            .bootstrap_index_downsample(&index, &shard(), None, 1_000, Some(2), &resolver)
            .await
            .unwrap_err();

        assert!(matches!(err, BootstrapError::Resolver(_)));
        assert_eq!(index.commit_count(), 0);
        assert_eq!(index.searcher().num_entries(), 0);
    }

    #[tokio::test]
    async fn test_downsample_source_failure_never_commits() {
        let source = FailingSource {
            records: vec![
                PartKeyRecord::new(b"k1".to_vec(), 0, 100),
                PartKeyRecord::new(b"k2".to_vec(), 0, 100),
            ],
        };
        let bootstrapper = IndexBootstrapper::new(Arc::new(source)).with_clock(|| 0);
        let index = Arc::new(RecordingIndex::default());
        let resolver = Arc::new(PartIdAllocator::new());

        let err = bootstrapper
            .bootstrap_index_downsample(&index, &shard(), None, 1_000, Some(4), &resolver)
            .await
            .unwrap_err();

        assert!(matches!(err, BootstrapError::Source(_)));
        assert_eq!(index.position(&Call::Commit), None);
        assert_eq!(index.position(&Call::Refresh), None);
        assert!(!index.announced(IndexState::Synced));
        assert_eq!(index.inner.commit_count(), 0);
    }

    fn write_count(index: &RecordingIndex) -> usize {
        index.calls().iter().filter(|c| **c == Call::Write).count()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_failed_call_leaves_no_writes_behind() {
        let mut records = vec![("bad", 0, 100, 0)];
        let slow: Vec<String> = (0..6).map(|i| format!("slow-{}", i)).collect();
        records.extend(slow.iter().map(|key| (key.as_str(), 0, 100, 0)));
        let source = source_with(&records);
        let bootstrapper = IndexBootstrapper::new(source).with_clock(|| 0);
        let index = Arc::new(RecordingIndex::default());

        let failing = Arc::new(|record: &PartKeyRecord| -> BootstrapResult<PartitionId> {
            if record.part_key == b"bad" {
                return Err(BootstrapError::Resolver("no id for series".to_string()));
            }
            std::thread::sleep(std::time::Duration::from_millis(150));
            Ok(100)
        });

        let err = bootstrapper
            .bootstrap_index_downsample(&index, &shard(), None, 1_000, Some(8), &failing)
            .await
            .unwrap_err();
        assert!(matches!(err, BootstrapError::Resolver(_)));

        let writes_at_return = write_count(&index);
        let pending_at_return = index.inner.has_pending_changes();
        tokio::time::sleep(std::time::Duration::from_millis(400)).await;
        assert_eq!(write_count(&index), writes_at_return);
        assert_eq!(index.inner.has_pending_changes(), pending_at_return);

        // A clean re-run owns every id in the index
        let rerun_source = source_with(&records[1..]);
        let rerun = IndexBootstrapper::new(rerun_source).with_clock(|| 0);
        let resolver = Arc::new(PartIdAllocator::new());
        let count = rerun
            .bootstrap_index_downsample(&index, &shard(), None, 1_000, Some(8), &resolver)
            .await
            .unwrap();
        assert_eq!(count, 6);

        tokio::time::sleep(std::time::Duration::from_millis(400)).await;
        assert!(!index.inner.has_pending_changes());
        let mut ids: Vec<_> = index.inner.searcher().part_ids().map(|(_, id)| id).collect();
        ids.sort_unstable();
        assert_eq!(ids, (0..6).collect::<Vec<_>>());
    }

    // ==================== Refresh ====================

    fn gauge(series: &str) -> Vec<u8> {
        encode_part_key("gauge", series.as_bytes())
    }

    fn source_with_raw(records: &[(Vec<u8>, i64, i64, i64)]) -> Arc<MemPartKeySource> {
        let source = MemPartKeySource::new();
        for (key, start, end, hour) in records {
            source
                .add(&shard(), PartKeyRecord::new(key.clone(), *start, *end), *hour)
                .unwrap();
        }
        Arc::new(source)
    }

    #[tokio::test]
    async fn test_refresh_merges_hours_into_one_entry() {
        let source = source_with_raw(&[(gauge("s"), 0, 60, 0), (gauge("s"), 60, 120, 1)]);
        let bootstrapper = IndexBootstrapper::new(source);
        let index = Arc::new(MemPartKeyIndex::new());
        let resolver = Arc::new(KeyedPartIdResolver::new());

        let count = bootstrapper
            .refresh_with_downsample_part_keys(
                &index,
                &shard(),
                0,
                1,
                Some(4),
                &schemas(),
                &resolver,
            )
            .await
            .unwrap();

        assert_eq!(count, 2);
        let dk = encode_part_key("ds-gauge", b"s");
        assert_eq!(index.searcher().get(&dk), Some(&PartKeyEntry::new(0, 0, 120)));
        assert_eq!(index.searcher().num_entries(), 1);
        assert_eq!(resolver.key_count(), 1);
        assert_eq!(resolver.allocator().next_id(), 1);
    }

    #[tokio::test]
    async fn test_refresh_keeps_existing_ids() {
        let dk = encode_part_key("ds-gauge", b"s");
        let source = source_with_raw(&[(gauge("s"), 0, 60, 2), (gauge("t"), 0, 60, 3)]);
        let bootstrapper = IndexBootstrapper::new(source);
        let index = Arc::new(MemPartKeyIndex::new());
        let resolver = Arc::new(KeyedPartIdResolver::from_existing(vec![(dk.clone(), 41)]));

        bootstrapper
            .refresh_with_downsample_part_keys(&index, &shard(), 2, 3, None, &schemas(), &resolver)
            .await
            .unwrap();

        let searcher = index.searcher();
        assert_eq!(searcher.part_id(&dk), Some(41));
        assert_eq!(searcher.part_id(&encode_part_key("ds-gauge", b"t")), Some(42));
    }

    #[tokio::test]
    async fn test_refresh_skips_keys_without_projection() {
        let source = source_with_raw(&[
            (gauge("s"), 0, 60, 0),
            (encode_part_key("untyped", b"s"), 0, 60, 0),
            (encode_part_key("histogram", b"s"), 0, 60, 0),
        ]);
        let bootstrapper = IndexBootstrapper::new(source);
        let index = Arc::new(MemPartKeyIndex::new());
        let resolver = Arc::new(KeyedPartIdResolver::new());

        let count = bootstrapper
            .refresh_with_downsample_part_keys(&index, &shard(), 0, 0, None, &schemas(), &resolver)
            .await
            .unwrap();

        assert_eq!(count, 1);
        assert_eq!(index.searcher().num_entries(), 1);
    }

    #[tokio::test]
    async fn test_refresh_lifecycle_framing() {
        let source = source_with_raw(&[(gauge("s"), 0, 60, 4)]);
        let bootstrapper = IndexBootstrapper::new(source);
        let index = Arc::new(RecordingIndex::default());
        let resolver = Arc::new(KeyedPartIdResolver::new());

        bootstrapper
            .refresh_with_downsample_part_keys(
                &index,
                &shard(),
                3,
                5,
                Some(2),
                &schemas(),
                &resolver,
            )
            .await
            .unwrap();

        assert_eq!(
            index.calls(),
            vec![
                Call::Lifecycle(IndexState::Refreshing, 3 * MILLIS_PER_HOUR),
                Call::Write,
                Call::Commit,
                Call::Lifecycle(IndexState::Synced, 5 * MILLIS_PER_HOUR),
                Call::Refresh,
            ]
        );
    }

    #[tokio::test]
    async fn test_refresh_commit_failure_never_announces_synced() {
        let source = source_with_raw(&[(gauge("s"), 0, 60, 0)]);
        let bootstrapper = IndexBootstrapper::new(source);
        let index = Arc::new(RecordingIndex::failing_commit());
        let resolver = Arc::new(KeyedPartIdResolver::new());

        let err = bootstrapper
            .refresh_with_downsample_part_keys(&index, &shard(), 0, 0, None, &schemas(), &resolver)
            .await
            .unwrap_err();

        assert!(matches!(err, BootstrapError::Index(_)));
        assert!(!index.announced(IndexState::Synced));
        assert_eq!(index.position(&Call::Refresh), None);
    }

    #[tokio::test]
    async fn test_refresh_hour_stream_failure_never_commits() {
        let source = FailingSource {
            records: vec![PartKeyRecord::new(gauge("s"), 0, 60)],
        };
        let bootstrapper = IndexBootstrapper::new(Arc::new(source));
        let index = Arc::new(RecordingIndex::default());
        let resolver = Arc::new(KeyedPartIdResolver::new());

        let err = bootstrapper
            .refresh_with_downsample_part_keys(
                &index,
                &shard(),
                0,
                2,
                Some(3),
                &schemas(),
                &resolver,
            )
            .await
            .unwrap_err();

        assert!(matches!(err, BootstrapError::Source(_)));
        assert!(index.announced(IndexState::Refreshing));
        assert!(!index.announced(IndexState::Synced));
        assert_eq!(index.position(&Call::Commit), None);
        assert_eq!(index.inner.searcher().num_entries(), 0);
    }

    #[tokio::test]
    async fn test_refresh_rejects_inverted_range_before_announcing() {
        let bootstrapper = IndexBootstrapper::new(Arc::new(MemPartKeySource::new()));
        let index = Arc::new(RecordingIndex::default());
        let resolver = Arc::new(KeyedPartIdResolver::new());

        let err = bootstrapper
            .refresh_with_downsample_part_keys(&index, &shard(), 5, 3, None, &schemas(), &resolver)
            .await
            .unwrap_err();

        assert!(matches!(err, BootstrapError::InvalidHourRange { from: 5, to: 3 }));
        assert!(index.calls().is_empty());
    }

    #[tokio::test]
    async fn test_refresh_empty_range_still_syncs() {
        let bootstrapper = IndexBootstrapper::new(Arc::new(MemPartKeySource::new()));
        let index = Arc::new(MemPartKeyIndex::new());
        let resolver = Arc::new(KeyedPartIdResolver::new());

        let count = bootstrapper
            .refresh_with_downsample_part_keys(
                &index,
                &shard(),
                10,
                10,
                None,
                &schemas(),
                &resolver,
            )
            .await
            .unwrap();

        assert_eq!(count, 0);
        let latest = index.lifecycle().latest().unwrap();
        assert_eq!(latest.state, IndexState::Synced);
        assert_eq!(latest.timestamp_ms, 10 * MILLIS_PER_HOUR);
    }

    /// Index contents after one refresh and after repeating it
    fn refresh_twice(
        records: &[(Vec<u8>, i64, i64, i64)],
    ) -> (HashMap<Vec<u8>, PartKeyEntry>, HashMap<Vec<u8>, PartKeyEntry>) {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        runtime.block_on(async {
            let bootstrapper = IndexBootstrapper::new(source_with_raw(records));
            let index = Arc::new(MemPartKeyIndex::new());
            let resolver = Arc::new(KeyedPartIdResolver::new());
            let schemas = schemas();

            let mut snapshots = Vec::with_capacity(2);
            for _ in 0..2 {
                bootstrapper
                    .refresh_with_downsample_part_keys(
                        &index,
                        &shard(),
                        0,
                        3,
                        Some(3),
                        &schemas,
                        &resolver,
                    )
                    .await
                    .unwrap();
                snapshots.push(entries(&index.searcher()));
            }
            let twice = snapshots.pop().unwrap();
            let once = snapshots.pop().unwrap();
            (once, twice)
        })
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn refresh_twice_equals_refresh_once(
            raw in proptest::collection::vec(
                (0u8..4, any::<bool>(), 0i64..1_000, 0i64..1_000, 0i64..4),
                0..24,
            )
        ) {
            let records: Vec<_> = raw
                .into_iter()
                .map(|(series, typed, start, len, hour)| {
                    let schema = if typed { "gauge" } else { "untyped" };
                    (encode_part_key(schema, &[series]), start, start + len, hour)
                })
                .collect();

            let (once, twice) = refresh_twice(&records);
            prop_assert_eq!(once, twice);
        }
    }
}
