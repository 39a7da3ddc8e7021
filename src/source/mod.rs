//! Partition Key Sources
//!
//! The column store side of the pipeline. A source hands out lazy, finite
//! streams of [`PartKeyRecord`]s for one shard, either for the whole shard or
//! for a single update-hour bucket:
//!
//! - **MemPartKeySource**: in-process map, used by tests and benches
//! - **SqlitePartKeySource**: SQLite table scanned in pages
//!
//! No ordering is guaranteed within a stream.

mod memory;
mod sqlite;

pub use memory::MemPartKeySource;
pub use sqlite::{SqlitePartKeySource, DEFAULT_SCAN_BATCH_SIZE};

use crate::error::BootstrapResult;
use crate::types::{PartKeyRecord, ShardRef};
use futures_util::stream::BoxStream;

/// Lazy stream of part key records; an `Err` item ends the scan abnormally
pub type PartKeyStream = BoxStream<'static, BootstrapResult<PartKeyRecord>>;

/// Read access to the partition keys persisted for a shard
pub trait PartKeySource: Send + Sync {
    /// Every partition key stored for the shard
    fn scan_part_keys(&self, shard: &ShardRef) -> PartKeyStream;

    /// Partition keys whose last update fell inside `hour`
    fn part_keys_by_update_hour(&self, shard: &ShardRef, hour: i64) -> PartKeyStream;
}
