//! memprobe command-line front end

use anyhow::{Context, Result};
use clap::Parser;
use memprobe_core::config::{ChunkWidth, EngineConfig, Operation, Pattern};
use memprobe_core::manager::BenchmarkManager;
use memprobe_core::report::{ConsoleReporter, CsvReporter, MultiSink};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// memprobe - NUMA-aware memory throughput, latency, and power characterization
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Working set size per worker thread, in KB (multiple of 4)
    #[arg(short = 'w', long, default_value_t = 4096)]
    working_set_size: usize,

    /// Number of worker threads
    #[arg(short = 'j', long, default_value_t = 1)]
    threads: usize,

    /// Chunk size in bits (32, 64, 128, 256); repeat for several
    #[arg(short = 'c', long = "chunk")]
    chunks: Vec<u32>,

    /// Stride in chunks (1, -1, 2, -2, 4, -4, 8, -8, 16, -16); repeat for several
    #[arg(short = 's', long = "stride", allow_hyphen_values = true)]
    strides: Vec<i64>,

    /// Enable the random access pattern
    #[arg(short = 'r', long)]
    random: bool,

    /// Enable the sequential access pattern
    #[arg(short = 'q', long)]
    sequential: bool,

    /// Use memory reads in load kernels
    #[arg(short = 'R', long)]
    reads: bool,

    /// Use memory writes in load kernels
    #[arg(short = 'W', long)]
    writes: bool,

    /// Disable NUMA awareness: one uniform working set for all nodes
    #[arg(short = 'u', long)]
    no_numa: bool,

    /// Back working sets with huge pages (requires --no-numa)
    #[arg(short = 'L', long)]
    large_pages: bool,

    /// Iterations per benchmark configuration
    #[arg(short = 'n', long, default_value_t = 1)]
    iterations: u32,

    /// Starting test index
    #[arg(short = 'i', long, default_value_t = 1)]
    base_test_index: u32,

    /// Write results to this CSV file in addition to the console
    #[arg(short = 'f', long)]
    output: Option<std::path::PathBuf>,

    /// Enable every chunk size, stride, pattern, and operation
    #[arg(short = 'a', long)]
    all: bool,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn build_config(args: &Args) -> Result<EngineConfig> {
    let mut builder = EngineConfig::builder()
        .working_set_per_thread(args.working_set_size * 1024)
        .worker_threads(args.threads)
        .numa_enabled(!args.no_numa)
        .large_pages(args.large_pages)
        .iterations(args.iterations)
        .starting_test_index(args.base_test_index);

    if args.all {
        builder = builder.all_dimensions();
    } else {
        if !args.chunks.is_empty() {
            let chunks = args
                .chunks
                .iter()
                .map(|&bits| {
                    ChunkWidth::from_bits(bits)
                        .with_context(|| format!("invalid chunk size {bits} bits"))
                })
                .collect::<Result<Vec<_>>>()?;
            builder = builder.chunk_widths(chunks);
        }
        if !args.strides.is_empty() {
            builder = builder.strides(args.strides.clone());
        }
        if args.random || args.sequential {
            let mut patterns = Vec::new();
            if args.sequential {
                patterns.push(Pattern::Sequential);
            }
            if args.random {
                patterns.push(Pattern::Random);
            }
            builder = builder.patterns(patterns);
        }
        if args.reads || args.writes {
            let mut operations = Vec::new();
            if args.reads {
                operations.push(Operation::Read);
            }
            if args.writes {
                operations.push(Operation::Write);
            }
            builder = builder.operations(operations);
        }
    }

    if let Some(path) = &args.output {
        builder = builder.output_file(path.clone());
    }

    builder.build().context("invalid configuration")
}

fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("memprobe={}", args.log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("memprobe {}", env!("CARGO_PKG_VERSION"));

    let config = build_config(&args)?;

    let mut sink = MultiSink::new().with(Box::new(ConsoleReporter::new()));
    if let Some(path) = config.output_file() {
        let csv = CsvReporter::create(path)
            .with_context(|| format!("failed to create {}", path.display()))?;
        sink = sink.with(Box::new(csv));
        info!("writing results to {}", path.display());
    }

    let mut manager = BenchmarkManager::new(config).context("engine setup failed")?;
    let rows = manager.run(&mut sink).context("benchmark run failed")?;

    info!("done: {rows} result row(s)");
    Ok(())
}
