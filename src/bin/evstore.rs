//! evstore command-line tool
//!
//! Inspect saved embedding checkpoints, run a synthetic tiered workload, and
//! print the default configuration.
//!
//! # Examples
//!
//! ```bash
//! # Print the default configuration
//! evstore config > evstore.toml
//!
//! # Two-tier workload with a small primary tier, saved to /tmp/ev
//! evstore --config evstore.toml simulate --keys 100000 --capacity 5000 --output /tmp/ev
//!
//! # Show what was saved
//! evstore inspect --prefix /tmp/ev --name embedding
//! ```

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand};
use evstore::checkpoint::{tensor_name, CheckpointReader, SAVED_PARTITION_NUM};
use evstore::config::{load_config_or_default, EvConfig, SlotLayout, StorageType};
use evstore::storage::{new_storage, NormalSlot, SlotMeta, TierCopy};
use evstore::{BundleReader, BundleWriter, ContiguousSlot, EmbeddingVar, MemoryBundle, RayonPool};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const TENSOR_SUFFIXES: [&str; 9] = [
    "keys",
    "values",
    "versions",
    "freqs",
    "keys_filtered",
    "versions_filtered",
    "freqs_filtered",
    "partition_offset",
    "partition_filter_offset",
];

/// evstore - tiered sparse embedding storage
#[derive(Parser, Debug)]
#[command(name = "evstore")]
#[command(version = evstore::VERSION)]
#[command(about = "Tiered sparse embedding storage tools", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (TOML)
    #[arg(long, global = true, env = "EVSTORE_CONFIG")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "info", env = "RUST_LOG")]
    log_level: String,

    /// Disable colored output
    #[arg(long, global = true)]
    no_color: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Show the tensors of a saved variable
    Inspect(InspectArgs),

    /// Run a synthetic workload against two-tier storage
    Simulate(SimulateArgs),

    /// Print the default configuration as TOML
    Config,
}

#[derive(Args, Debug)]
struct InspectArgs {
    /// Bundle prefix (without .data / .index)
    #[arg(short, long)]
    prefix: PathBuf,

    /// Variable name
    #[arg(short, long, default_value = "embedding")]
    name: String,
}

#[derive(Args, Debug)]
struct SimulateArgs {
    /// Distinct keys in the workload
    #[arg(long, default_value = "100000")]
    keys: u64,

    /// Number of batches
    #[arg(long, default_value = "200")]
    batches: usize,

    /// Keys per batch
    #[arg(long, default_value = "4096")]
    batch_size: usize,

    /// Embedding length
    #[arg(long, default_value = "16")]
    value_len: usize,

    /// Primary tier capacity (overrides the configuration)
    #[arg(long)]
    capacity: Option<usize>,

    /// Worker threads
    #[arg(long, default_value = "4")]
    threads: usize,

    /// Release retired slots every this many batches
    #[arg(long, default_value = "10")]
    release_every: usize,

    /// Save to this bundle prefix instead of memory
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Variable name used when saving
    #[arg(long, default_value = "embedding")]
    name: String,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    setup_logging(&cli)?;
    evstore::metrics::init_metrics();

    match cli.command {
        Commands::Inspect(args) => inspect_command(args),
        Commands::Simulate(args) => {
            let config = load_config_or_default(cli.config.as_deref());
            simulate_command(config, args)
        }
        Commands::Config => {
            let text = toml::to_string_pretty(&EvConfig::default())
                .context("Failed to render default configuration")?;
            print!("{}", text);
            Ok(())
        }
    }
}

/// Console logging filtered by `--log-level` and `RUST_LOG`
fn setup_logging(cli: &Cli) -> anyhow::Result<()> {
    let log_level = cli
        .log_level
        .parse::<tracing::Level>()
        .unwrap_or(tracing::Level::INFO);

    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_ansi(!cli.no_color),
        )
        .with(EnvFilter::from_default_env().add_directive(log_level.into()))
        .try_init()
        .context("Failed to install tracing subscriber")?;

    Ok(())
}

fn inspect_command(args: InspectArgs) -> anyhow::Result<()> {
    let reader = BundleReader::open(&args.prefix)
        .with_context(|| format!("Failed to open bundle {}", args.prefix.display()))?;

    println!("{} @ {}", args.name, args.prefix.display());
    for suffix in TENSOR_SUFFIXES {
        let name = tensor_name(&args.name, suffix);
        match reader.entry(&name) {
            Some(entry) => println!(
                "  {:<28} {:>4} {:?} ({} bytes)",
                name, entry.dtype, entry.shape, entry.len
            ),
            None => println!("  {:<28} missing", name),
        }
    }

    let offsets: Vec<i32> = reader
        .read_tensor(&tensor_name(&args.name, "partition_offset"))?
        .to_vec()?;
    let filter_offsets: Vec<i32> = reader
        .read_tensor(&tensor_name(&args.name, "partition_filter_offset"))?
        .to_vec()?;
    if offsets.len() != SAVED_PARTITION_NUM + 1 || filter_offsets.len() != offsets.len() {
        warn!(
            partitions = offsets.len().saturating_sub(1),
            "Unexpected partition count"
        );
    }

    let non_empty = offsets.windows(2).filter(|w| w[1] > w[0]).count();
    let non_empty_filtered = filter_offsets.windows(2).filter(|w| w[1] > w[0]).count();
    println!(
        "  admitted keys: {} in {} partitions",
        offsets.last().copied().unwrap_or(0),
        non_empty
    );
    println!(
        "  filtered keys: {} in {} partitions",
        filter_offsets.last().copied().unwrap_or(0),
        non_empty_filtered
    );
    Ok(())
}

fn simulate_command(mut config: EvConfig, args: SimulateArgs) -> anyhow::Result<()> {
    if config.storage.storage_type == StorageType::Dram {
        info!("Simulation uses two tiers; switching storage type to dram_pmem");
        config.storage.storage_type = StorageType::DramPmem;
    }
    if let Some(capacity) = args.capacity {
        config.storage.primary_capacity = capacity;
    }
    match config.storage.layout {
        SlotLayout::Normal => run_simulation::<NormalSlot<f32>>(&config, &args),
        SlotLayout::NormalContiguous => run_simulation::<ContiguousSlot<f32>>(&config, &args),
        SlotLayout::Light => bail!("light slots keep no step or frequency and cannot be tiered"),
    }
}

/// Skewed key stream: low keys are drawn far more often than high ones
struct KeyStream {
    state: u64,
    keys: u64,
}

impl KeyStream {
    fn new(seed: u64, keys: u64) -> Self {
        Self {
            state: seed | 1,
            keys: keys.max(1),
        }
    }

    fn next_key(&mut self) -> i64 {
        // xorshift64
        self.state ^= self.state << 13;
        self.state ^= self.state >> 7;
        self.state ^= self.state << 17;
        let u = (self.state >> 11) as f64 / (1u64 << 53) as f64;
        ((u * u) * self.keys as f64) as i64
    }
}

fn run_simulation<S>(config: &EvConfig, args: &SimulateArgs) -> anyhow::Result<()>
where
    S: TierCopy<Elem = f32> + SlotMeta,
{
    let pool = RayonPool::new(args.threads)?;
    let storage = new_storage::<i64, S>(&config.storage, config.embedding.shrink_policy())?;

    let dim = config.embedding.default_value_dim;
    let defaults: Vec<f32> = (0..dim * args.value_len)
        .map(|i| ((i % 97) as f32 - 48.0) * 1e-3)
        .collect();
    let ev = EmbeddingVar::new(
        args.name.clone(),
        Arc::from(storage),
        config.embedding.clone(),
        defaults,
    )?
    .with_cache_capacity(config.storage.primary_capacity)
    .with_bytes_limit(config.checkpoint.bytes_limit);

    info!(
        keys = args.keys,
        batches = args.batches,
        batch_size = args.batch_size,
        capacity = config.storage.primary_capacity,
        "🚀 Starting simulation"
    );

    let start = Instant::now();
    let mut stream = KeyStream::new(0x9e37_79b9_7f4a_7c15, args.keys);
    let mut out = vec![0.0f32; args.batch_size * args.value_len];
    let mut evicted = 0;
    let mut released = 0;
    for step in 0..args.batches {
        let batch: Vec<i64> = (0..args.batch_size).map(|_| stream.next_key()).collect();
        {
            let slots = ev.gather_embeddings(&pool, &batch, &mut out)?;
            for slot in &slots {
                // SAFETY: nothing is evicted until evict_cold below
                ev.update_version(unsafe { slot.as_ref() }, step as i64);
            }
        }
        // the gather already touched the batch
        evicted += ev.evict_cold()?;

        if args.release_every > 0 && (step + 1) % args.release_every == 0 {
            // SAFETY: no slot handle outlives its batch
            released += unsafe { ev.release_invalid_slots() };
        }
        debug!(step, size = ev.size(), "Batch done");
    }
    // SAFETY: as above
    released += unsafe { ev.release_invalid_slots() };
    let elapsed = start.elapsed();

    let global_step = args.batches as i64;
    match &args.output {
        Some(prefix) => {
            let mut writer = BundleWriter::create(prefix)?;
            ev.save(&mut writer, global_step, None)?;
            writer.finish()?;
            info!(prefix = %prefix.display(), "💾 Checkpoint written");
        }
        None => {
            let mut bundle = MemoryBundle::new();
            ev.save(&mut bundle, global_step, None)?;
            let keys = bundle
                .read_tensor(&tensor_name(&args.name, "keys"))?
                .num_elements();
            info!(keys, "💾 Checkpoint kept in memory");
        }
    }

    let storage = ev.storage();
    println!("Simulation finished in {:.2?}", elapsed);
    println!("  distinct keys stored : {}", storage.snapshot().0.len());
    println!("  primary tier entries : {}", storage.size_at(0).unwrap_or(0));
    println!("  capacity tier entries: {}", storage.size_at(1).unwrap_or(0));
    println!("  evicted              : {}", evicted);
    println!("  released slots       : {}", released);
    if let Some(stats) = ev.cache_stats() {
        println!(
            "  cache hit rate       : {:.2}% ({} keys)",
            stats.hit_rate * 100.0,
            stats.size
        );
    }
    let alloc = storage.allocator().stats();
    println!(
        "  primary allocator    : {} blocks, {} bytes",
        alloc.live_blocks, alloc.live_bytes
    );
    println!();
    print!("{}", evstore::metrics::export_metrics());
    Ok(())
}
