//! # chronicle-index
//!
//! Partition key index bootstrapper for the Chronicle time-series engine.
//! Builds a shard's secondary index (series key → partition id + validity
//! window) from the column store, and keeps it current with hourly refreshes.
//!
//! ## Features
//!
//! - **Full raw bootstrap**: sequential rebuild from a full scan
//! - **Parallel downsample bootstrap**: checkpoint-filtered rebuild with
//!   bounded, unordered parallelism
//! - **Incremental hourly refresh**: idempotent upserts of downsample keys
//! - **Lifecycle notifications**: `Refreshing` / `Synced` broadcast to readers
//!
//! ## Modules
//!
//! - [`bootstrap`]: The three bootstrap/refresh strategies
//! - [`source`]: Partition key sources (column store side)
//! - [`index`]: Partition key index trait and adapters
//! - [`resolver`]: Partition id resolution hooks
//! - [`downsample`]: Raw → downsample key projection
//! - [`config`]: TOML configuration with environment overrides
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use chronicle_index::*;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let shard = ShardRef::new("prometheus", 0);
//!
//!     // Column store with one series
//!     let source = Arc::new(MemPartKeySource::new());
//!     source.add(&shard, PartKeyRecord::new(b"job=api".to_vec(), 0, 100), 0)?;
//!
//!     // Cold bootstrap with a monotonic id allocator
//!     let index = Arc::new(MemPartKeyIndex::new());
//!     let resolver = Arc::new(PartIdAllocator::new());
//!     let bootstrapper = IndexBootstrapper::new(source);
//!
//!     let count = bootstrapper
//!         .bootstrap_index_raw(&index, &shard, &resolver)
//!         .await?;
//!
//!     println!("Indexed {} part keys", count);
//!     Ok(())
//! }
//! ```

pub mod bootstrap;
pub mod config;
pub mod downsample;
pub mod error;
pub mod index;
pub mod resolver;
pub mod source;
pub mod types;

// Re-export top-level types for convenience
pub use bootstrap::{BootstrapConfig, IndexBootstrapper};

pub use downsample::{SchemaDefinition, SchemaSet};

pub use error::{BootstrapError, BootstrapResult};

pub use index::{
    IndexSnapshot, IndexState, LifecycleEvent, LifecycleNotifier, MemPartKeyIndex, PartKeyEntry,
    PartKeyIndex, SqlitePartKeyIndex,
};

pub use resolver::{KeyedPartIdResolver, PartIdAllocator, PartIdResolver};

pub use source::{MemPartKeySource, PartKeySource, PartKeyStream, SqlitePartKeySource};

pub use types::{
    effective_checkpoint, DatasetRef, HourRange, PartKeyRecord, PartitionId, ShardRef,
    MAX_PARTITION_ID,
};

pub use config::{Config, ConfigError};
