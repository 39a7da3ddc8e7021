//! chronicle-index CLI
//!
//! Command-line interface for building and refreshing shard partition key
//! indexes from the SQLite column store:
//! - Load partition keys into the column store
//! - Run raw / downsample bootstraps and hourly refreshes
//! - Inspect an index
//!
//! Logs go to stderr (or the configured file); results are printed to stdout
//! as JSON.

use anyhow::Context;
use chronicle_index::config::{generate_default_config, Config, LoggingConfig};
use chronicle_index::{
    IndexBootstrapper, KeyedPartIdResolver, LifecycleEvent, PartKeyRecord, ShardRef,
    SqlitePartKeyIndex, SqlitePartKeySource,
};
use clap::{Args, Parser, Subcommand};
use serde::{Deserialize, Serialize};
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "chronicle-index")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Build and refresh partition key indexes for Chronicle shards")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Config file (default: standard locations, then environment)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,
}

#[derive(Args, Debug, Clone)]
pub struct ShardArgs {
    /// Dataset name
    #[arg(long)]
    pub dataset: String,
    /// Shard number
    #[arg(long, default_value = "0")]
    pub shard: u32,
}

impl ShardArgs {
    fn shard_ref(&self) -> ShardRef {
        ShardRef::new(self.dataset.clone(), self.shard)
    }
}

#[derive(Subcommand)]
pub enum Commands {
    /// Load partition keys from a JSON lines file into the column store
    Ingest {
        #[command(flatten)]
        shard: ShardArgs,
        /// One {"key_hex", "start", "end", "hour"} object per line
        #[arg(short, long)]
        file: PathBuf,
    },

    /// Rebuild the index from every partition key, sequentially
    BootstrapRaw {
        #[command(flatten)]
        shard: ShardArgs,
    },

    /// Rebuild the index from keys still live after a checkpoint, in parallel
    BootstrapDownsample {
        #[command(flatten)]
        shard: ShardArgs,
        /// Persisted checkpoint (epoch ms); clamped to the retention window
        #[arg(long)]
        checkpoint: Option<i64>,
        /// Concurrent records (default: config, then available cores)
        #[arg(short, long)]
        parallelism: Option<usize>,
    },

    /// Upsert downsample keys for records updated in an hour range
    ///
    /// Reads raw part keys of `--raw-dataset` from the column store and writes
    /// their downsample keys into the index of `--dataset`.
    Refresh {
        #[command(flatten)]
        shard: ShardArgs,
        /// Raw dataset the updated part keys are read from
        #[arg(long)]
        raw_dataset: String,
        /// First hour bucket (hours since epoch)
        #[arg(long)]
        from_hour: i64,
        /// Last hour bucket, inclusive
        #[arg(long)]
        to_hour: i64,
        /// Concurrent records (default: config, then available cores)
        #[arg(short, long)]
        parallelism: Option<usize>,
    },

    /// Show index statistics
    Stats {
        #[command(flatten)]
        shard: ShardArgs,
    },

    /// Generate default config file
    Config {
        /// Output path (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

/// One line of an ingest file
#[derive(Debug, Deserialize)]
struct IngestLine {
    key_hex: String,
    start: i64,
    end: i64,
    hour: i64,
}

#[derive(Debug, Serialize)]
struct OperationSummary {
    operation: &'static str,
    shard: String,
    count: u64,
    elapsed_ms: u64,
    lifecycle: Option<LifecycleEvent>,
}

#[derive(Debug, Serialize)]
struct IndexStats {
    shard: String,
    path: PathBuf,
    entries: u64,
    max_part_id: Option<u32>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if let Commands::Config { output } = &cli.command {
        return write_default_config(output.as_deref());
    }

    let config = match &cli.config {
        Some(path) => Config::load_with_env(path)?,
        None => Config::load_default(),
    };
    init_logging(&config.logging)?;

    tracing::debug!(
        data_dir = %config.store.data_dir,
        "chronicle-index v{}",
        env!("CARGO_PKG_VERSION")
    );

    match cli.command {
        Commands::Ingest { shard, file } => ingest(&config, &shard.shard_ref(), &file)?,

        Commands::BootstrapRaw { shard } => {
            let shard = shard.shard_ref();
            let (bootstrapper, index, resolver) = open_shard(&config, &shard)?;

            let start = Instant::now();
            let count = bootstrapper
                .bootstrap_index_raw(&index, &shard, &resolver)
                .await?;
            print_summary("bootstrap-raw", &shard, count, start, &index)?;
        }

        Commands::BootstrapDownsample {
            shard,
            checkpoint,
            parallelism,
        } => {
            let shard = shard.shard_ref();
            let (bootstrapper, index, resolver) = open_shard(&config, &shard)?;

            let start = Instant::now();
            let count = bootstrapper
                .bootstrap_index_downsample(
                    &index,
                    &shard,
                    checkpoint,
                    config.bootstrap.ttl_ms(),
                    parallelism,
                    &resolver,
                )
                .await?;
            print_summary("bootstrap-downsample", &shard, count, start, &index)?;
        }

        Commands::Refresh {
            shard,
            raw_dataset,
            from_hour,
            to_hour,
            parallelism,
        } => {
            let raw_shard = ShardRef::new(raw_dataset, shard.shard);
            let shard = shard.shard_ref();
            let schemas = config.bootstrap.schema_set()?;
            let (bootstrapper, index, resolver) = open_shard(&config, &shard)?;

            let start = Instant::now();
            let count = bootstrapper
                .refresh_with_downsample_part_keys(
                    &index,
                    &raw_shard,
                    from_hour,
                    to_hour,
                    parallelism,
                    &schemas,
                    &resolver,
                )
                .await?;
            print_summary("refresh", &shard, count, start, &index)?;
        }

        Commands::Stats { shard } => {
            let shard = shard.shard_ref();
            let path = config.store.index_path(&shard);
            let index = SqlitePartKeyIndex::open(&path)
                .with_context(|| format!("Failed to open index {:?}", path))?;

            let stats = IndexStats {
                shard: shard.to_string(),
                entries: index.num_entries()?,
                max_part_id: index.max_part_id()?,
                path,
            };
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }

        // Written before any config is loaded
        Commands::Config { .. } => {}
    }

    Ok(())
}

fn init_logging(config: &LoggingConfig) -> anyhow::Result<()> {
    // RUST_LOG wins over the configured level
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let writer = match &config.file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file {}", path))?;
            BoxMakeWriter::new(Mutex::new(file))
        }
        None => BoxMakeWriter::new(std::io::stderr),
    };

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_writer(writer)
        .with_ansi(config.file.is_none());
    let registry = tracing_subscriber::registry().with(filter);

    match config.format.as_str() {
        "json" => registry.with(fmt_layer.json()).init(),
        _ => registry.with(fmt_layer.pretty()).init(),
    }
    Ok(())
}

/// Bootstrapper, shard index and a resolver seeded from that index
///
/// Seeding keeps ids stable when a command is re-run against an index that
/// already holds entries.
fn open_shard(
    config: &Config,
    shard: &ShardRef,
) -> anyhow::Result<(
    IndexBootstrapper,
    Arc<SqlitePartKeyIndex>,
    Arc<KeyedPartIdResolver>,
)> {
    let store_path = config.store.column_store_path();
    let source = SqlitePartKeySource::open(&store_path)
        .with_context(|| format!("Failed to open column store {:?}", store_path))?
        .with_scan_batch_size(config.store.scan_batch_size);

    let index_path = config.store.index_path(shard);
    let index = SqlitePartKeyIndex::open(&index_path)
        .with_context(|| format!("Failed to open index {:?}", index_path))?;

    let resolver = KeyedPartIdResolver::from_existing(index.part_ids()?);
    tracing::info!(
        shard = %shard,
        existing = resolver.key_count(),
        next_part_id = resolver.allocator().next_id(),
        id_utilization = resolver.allocator().utilization(),
        "Opened shard index"
    );

    let bootstrapper =
        IndexBootstrapper::with_config(Arc::new(source), config.bootstrap.bootstrap_config());
    Ok((bootstrapper, Arc::new(index), Arc::new(resolver)))
}

fn ingest(config: &Config, shard: &ShardRef, file: &Path) -> anyhow::Result<()> {
    let start = Instant::now();
    let store_path = config.store.column_store_path();
    let source = SqlitePartKeySource::open(&store_path)
        .with_context(|| format!("Failed to open column store {:?}", store_path))?;

    let reader = BufReader::new(
        std::fs::File::open(file).with_context(|| format!("Failed to open {:?}", file))?,
    );
    let batch_size = config.store.scan_batch_size.max(1);
    let mut batch = Vec::with_capacity(batch_size);
    let mut count = 0u64;

    for (line_no, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }

        let parsed: IngestLine = serde_json::from_str(&line)
            .with_context(|| format!("Invalid record on line {}", line_no + 1))?;
        let key = hex::decode(parsed.key_hex.trim())
            .with_context(|| format!("Invalid key_hex on line {}", line_no + 1))?;
        batch.push((PartKeyRecord::new(key, parsed.start, parsed.end), parsed.hour));

        if batch.len() >= batch_size {
            count += source.write_part_keys(shard, &batch)? as u64;
            batch.clear();
        }
    }
    if !batch.is_empty() {
        count += source.write_part_keys(shard, &batch)? as u64;
    }

    let summary = OperationSummary {
        operation: "ingest",
        shard: shard.to_string(),
        count,
        elapsed_ms: start.elapsed().as_millis() as u64,
        lifecycle: None,
    };
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

fn print_summary(
    operation: &'static str,
    shard: &ShardRef,
    count: u64,
    start: Instant,
    index: &SqlitePartKeyIndex,
) -> anyhow::Result<()> {
    let summary = OperationSummary {
        operation,
        shard: shard.to_string(),
        count,
        elapsed_ms: start.elapsed().as_millis() as u64,
        lifecycle: index.lifecycle().latest(),
    };
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

fn write_default_config(output: Option<&Path>) -> anyhow::Result<()> {
    let content = generate_default_config();
    match output {
        Some(path) => {
            std::fs::write(path, content)
                .with_context(|| format!("Failed to write config to {:?}", path))?;
            println!("Config written to {:?}", path);
        }
        None => print!("{}", content),
    }
    Ok(())
}
