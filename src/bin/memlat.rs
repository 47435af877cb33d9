//! Memory latency and cache test suite.
//!
//! Runs the selected measurements in order and renders each result as a bar chart on stdout.
//! Logging goes to stderr; set `RUST_LOG=debug` for per-pass and per-size detail.
use clap::{Parser, ValueEnum};
use log::{error, info, warn};
use mem_latency_rs::cache::{self, Metric, Step, SweepRange, Thresholds};
use mem_latency_rs::report::{BarChart, ReportSink, Series};
use mem_latency_rs::scaling::ScalingHarness;
use mem_latency_rs::{Config, KIB, MIB, access, config, format_size, format_size_fixed_int, latency};
use std::io::{self, Stdout};
use std::process::ExitCode;

// use faster/smaller `mimalloc` allocator
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum TestKind {
    /// Multi-pass pointer-chase latency over the working set
    #[value(alias = "advanced")]
    Latency,
    /// Latency at fixed block sizes from 4 KiB to 64 MiB
    Sizes,
    /// Sequential vs random chase, and the prefetcher probe
    Access,
    /// Cache size estimation and per-level probes
    Cache,
    /// Latency scaling across 1..N threads
    Threads,
    /// Everything above
    All,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum DetectBy {
    Bandwidth,
    Latency,
}

#[derive(Debug, Parser)]
#[command(version, about = "Memory latency and cache test suite")]
struct Args {
    /// Tests to run, in order
    #[arg(long = "test", value_enum, default_values_t = [TestKind::All])]
    tests: Vec<TestKind>,

    /// Working set of the latency test in MiB
    #[arg(long, default_value_t = 256)]
    size_mb: usize,

    /// Timed accesses per latency pass
    #[arg(long = "iter", default_value_t = 10_000_000)]
    iterations: u64,

    /// Highest thread count for the scaling test [default: logical cores]
    #[arg(long)]
    threads: Option<usize>,

    /// Minimum storage distance between successive nodes [default: max(16, N/4)]
    #[arg(long)]
    stride: Option<usize>,

    /// Statistical passes per latency figure
    #[arg(long, default_value_t = 5)]
    passes: usize,

    /// Smallest cache sweep size in KiB
    #[arg(long, default_value_t = 4)]
    sweep_min_kb: usize,

    /// Largest cache sweep size in MiB
    #[arg(long, default_value_t = 32)]
    sweep_max_mb: usize,

    /// Growth factor between sweep sizes
    #[arg(long, default_value_t = 2)]
    sweep_factor: usize,

    /// Metric the cache sweep watches for cliffs
    #[arg(long, value_enum, default_value_t = DetectBy::Bandwidth)]
    detect_by: DetectBy,

    /// Relative bandwidth drop that marks a cache boundary
    #[arg(long, default_value_t = 0.3)]
    bandwidth_drop: f64,

    /// Latency ratio that marks a cache boundary
    #[arg(long, default_value_t = 1.5)]
    latency_ratio: f64,

    /// Also run one latency sweep per cache level over its typical range
    #[arg(long)]
    per_level: bool,

    /// Skip the 64 MiB tests
    #[arg(long)]
    skip_large: bool,

    /// Don't pin scaling workers to cores
    #[arg(long)]
    no_pin: bool,

    /// Seed for reproducible access patterns
    #[arg(long)]
    seed: Option<u64>,

    /// Width of the ASCII charts
    #[arg(long, default_value_t = 40)]
    chart_width: usize,
}

impl Args {
    fn config(&self) -> Config {
        Config {
            working_set_bytes: self.size_mb.saturating_mul(MIB),
            iterations: self.iterations,
            threads: self.threads.unwrap_or_else(config::logical_cores),
            min_stride: self.stride,
            passes: self.passes,
            sweep: SweepRange {
                start: self.sweep_min_kb.saturating_mul(KIB),
                end: self.sweep_max_mb.saturating_mul(MIB),
                step: Step::Geometric(self.sweep_factor),
            },
            metric: match self.detect_by {
                DetectBy::Bandwidth => Metric::Bandwidth,
                DetectBy::Latency => Metric::Latency,
            },
            thresholds: Thresholds {
                bandwidth_drop: self.bandwidth_drop,
                latency_ratio: self.latency_ratio,
            },
            skip_large_tests: self.skip_large,
            pin_threads: !self.no_pin,
            seed: self.seed,
            ..Config::default()
        }
        .normalized()
    }

    fn wants(&self, kind: TestKind) -> bool {
        self.tests.contains(&kind) || self.tests.contains(&TestKind::All)
    }
}

type Chart = BarChart<Stdout>;

fn print_system_info(config: &Config) {
    println!("\n==== System Information ====");
    println!("Tool version: {}", env!("CARGO_PKG_VERSION"));
    println!("OS: {}", std::env::consts::OS);
    println!("Architecture: {}", std::env::consts::ARCH);
    println!("CPU Cores: {}", config::logical_cores());
    println!("Scaling threads: {}", config.threads);
    println!();
}

fn chart(sink: &mut Chart, title: &str, values: Vec<f64>, labels: Vec<String>, unit: &str) {
    match Series::new(title, values, labels, unit) {
        Some(series) => {
            if let Err(e) = sink.report(&series) {
                error!("Couldn't write chart '{}': {}", title, e);
            }
        }
        None => error!("Chart '{}' has mismatched labels and values", title),
    }
}

fn suspect_note(suspect: bool) -> &'static str {
    if suspect { " (suspect)" } else { "" }
}

fn run_latency(
    config: &Config,
    rng: &mut impl rand::Rng,
    sink: &mut Chart,
) -> mem_latency_rs::Result<()> {
    println!("\n==== Pointer Chasing Latency ====");
    let stats = latency::working_set_latency(config, rng)?;
    for (i, pass) in stats.passes.iter().enumerate() {
        println!("Pass {}: {:.2} ns{}", i + 1, pass.value, suspect_note(pass.is_suspect()));
    }
    println!("Minimum: {:.2} ns", stats.min);
    println!("Maximum: {:.2} ns", stats.max);
    println!("Average: {:.2} ns", stats.mean);
    chart(
        sink,
        "Random Access Latency",
        vec![stats.min],
        vec![format_size(config.working_set_bytes)],
        "ns",
    );
    Ok(())
}

fn run_sizes(
    config: &Config,
    rng: &mut impl rand::Rng,
    sink: &mut Chart,
) -> mem_latency_rs::Result<()> {
    println!("\n==== Detailed Memory Latency Benchmarks ====");
    let results = cache::latency_by_size(config, rng)?;
    println!("{:>10} {:>12}", "Size", "Latency (ns)");
    println!("{:-<10} {:-<12}", "", "");
    for r in &results {
        println!(
            "{:>10} {:>10.2} ns{}",
            format_size_fixed_int(r.bytes),
            r.latency.value,
            suspect_note(r.latency.is_suspect())
        );
    }
    chart(
        sink,
        "Memory Latency by Block Size",
        results.iter().map(|r| r.latency.value).collect(),
        results.iter().map(|r| format_size(r.bytes)).collect(),
        "ns",
    );
    Ok(())
}

fn run_access(
    config: &Config,
    rng: &mut impl rand::Rng,
    sink: &mut Chart,
) -> mem_latency_rs::Result<()> {
    println!("\n==== Sequential vs Random Access ====");
    let bytes = if config.skip_large_tests { 8 * MIB } else { 64 * MIB };
    let cmp = access::compare_chains(bytes, config.iterations, config, rng)?;
    println!("Sequential access latency: {:.2} ns", cmp.sequential.value);
    println!("Random access latency:     {:.2} ns", cmp.random.value);
    println!("Sequential bandwidth: {:.2} GB/s", cmp.sequential_gbs);
    println!("Random bandwidth:     {:.2} GB/s", cmp.random_gbs);
    chart(
        sink,
        "Access Pattern Comparison",
        vec![cmp.sequential.value, cmp.random.value],
        vec!["Sequential".into(), "Random".into()],
        "ns",
    );
    chart(
        sink,
        "Memory Bandwidth",
        vec![cmp.sequential_gbs, cmp.random_gbs],
        vec!["Sequential".into(), "Random".into()],
        "GB/s",
    );

    println!("\nTesting for hardware prefetching effects...");
    let probe = access::probe_prefetcher(MIB, (config.iterations / 4).max(1), config)?;
    println!("Sequential access: {:.2} ns", probe.sequential.value);
    println!("Random access:     {:.2} ns", probe.random.value);
    println!("Strided access:    {:.2} ns", probe.strided.value);
    println!("\nRandom/Sequential ratio: {:.2}x", probe.random_ratio());
    println!("Stride/Sequential ratio: {:.2}x", probe.stride_ratio());
    if probe.prefetcher_active() {
        println!(
            "Hardware prefetcher detected: sequential access is much faster than random access."
        );
    } else {
        println!("Hardware prefetcher may be disabled or less aggressive.");
    }
    if probe.stride_ineffective() {
        println!(
            "Stride prefetcher appears less effective with a {}-element stride.",
            access::PROBE_STRIDE
        );
    } else {
        println!(
            "Stride prefetcher seems effective for a {}-element stride.",
            access::PROBE_STRIDE
        );
    }
    Ok(())
}

fn run_cache(
    config: &Config,
    per_level: bool,
    rng: &mut impl rand::Rng,
    sink: &mut Chart,
) -> mem_latency_rs::Result<()> {
    println!("\n==== Cache Size Estimation ====");
    let sweep = cache::estimate_cache_sizes(config, rng)?;
    let unit = match sweep.metric {
        Metric::Bandwidth => "GB/s",
        Metric::Latency => "ns",
    };
    for (size, sample) in sweep.sizes.iter().zip(&sweep.samples) {
        println!(
            "Buffer size: {:>10}, {:8.2} {}{}",
            format_size(*size),
            sample.value,
            unit,
            suspect_note(sample.is_suspect())
        );
    }
    chart(
        sink,
        "Cache Sweep",
        sweep.values(),
        sweep.sizes.iter().map(|&s| format_size(s)).collect(),
        unit,
    );

    let mut estimate = sweep.estimate;
    if per_level {
        let levels = cache::estimate_per_level(config, rng)?;
        println!("\nPer-level sweeps:");
        for level in cache::CacheLevel::ALL {
            println!("  {}: {}", level, format_size(levels.get(level)));
        }
        // Direct sweeps win for levels the coarse sweep missed
        for level in cache::CacheLevel::ALL {
            if !estimate.is_detected(level) && levels.is_detected(level) {
                estimate = levels;
                warn!("Coarse sweep missed {}; using per-level estimates", level);
                break;
            }
        }
    }

    println!("\n==== Cache Size Detection Results ====");
    for level in cache::CacheLevel::ALL {
        println!(
            "{} Cache (estimated): {}{}",
            level,
            format_size(estimate.get(level)),
            if estimate.is_detected(level) { "" } else { " (default)" }
        );
    }
    println!("Note: These are estimates based on access patterns and may not be accurate.");

    println!("\n==== Cache Performance Tests ====");
    let probes = cache::probe_levels(&estimate, config, rng)?;
    for p in &probes {
        println!("\n{} ({}):", p.name, format_size(p.bytes));
        println!(
            "  latency:         {:.2} ns{}",
            p.latency.value,
            suspect_note(p.latency.is_suspect())
        );
        println!("  read bandwidth:  {:.2} GB/s", p.bandwidth.read.value);
        println!("  write bandwidth: {:.2} GB/s", p.bandwidth.write.value);
        println!("  copy bandwidth:  {:.2} GB/s", p.bandwidth.copy.value);
    }
    chart(
        sink,
        "Cache Level Latency",
        probes.iter().map(|p| p.latency.value).collect(),
        probes.iter().map(|p| p.name.to_string()).collect(),
        "ns",
    );
    chart(
        sink,
        "Cache Level Read Bandwidth",
        probes.iter().map(|p| p.bandwidth.read.value).collect(),
        probes.iter().map(|p| p.name.to_string()).collect(),
        "GB/s",
    );
    Ok(())
}

fn run_threads(
    config: &Config,
    rng: &mut impl rand::Rng,
    sink: &mut Chart,
) -> mem_latency_rs::Result<()> {
    println!("\n==== Multi-threaded Memory Latency Test ====");
    let result = ScalingHarness::new(config).run(rng)?;
    println!("Per-thread block: {}", format_size(result.block_bytes));
    for p in &result.points {
        println!(
            "{} thread(s): {:.2} ns average latency (total elapsed: {:?}){}",
            p.threads,
            p.avg_latency_ns,
            p.round_elapsed,
            suspect_note(p.is_suspect())
        );
    }
    chart(
        sink,
        "Multi-threaded Memory Latency",
        result.points.iter().map(|p| p.avg_latency_ns).collect(),
        result.points.iter().map(|p| p.threads.to_string()).collect(),
        "ns",
    );
    Ok(())
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let config = args.config();
    let mut rng = config.rng();
    let mut sink = BarChart::new(io::stdout(), args.chart_width);

    println!("Memory Latency and Cache Test Suite");
    print_system_info(&config);

    let mut failed = 0;
    let mut record = |name: &str, result: mem_latency_rs::Result<()>| {
        if let Err(e) = result {
            error!("{} test failed: {}", name, e);
            failed += 1;
        }
    };

    if args.wants(TestKind::Latency) {
        record("Latency", run_latency(&config, &mut rng, &mut sink));
    }
    if args.wants(TestKind::Sizes) {
        record("Block size", run_sizes(&config, &mut rng, &mut sink));
    }
    if args.wants(TestKind::Access) {
        record("Access pattern", run_access(&config, &mut rng, &mut sink));
    }
    if args.wants(TestKind::Cache) {
        record("Cache", run_cache(&config, args.per_level, &mut rng, &mut sink));
    }
    if args.wants(TestKind::Threads) {
        record("Multi-threaded", run_threads(&config, &mut rng, &mut sink));
    }

    if failed == 0 {
        info!("All selected tests completed");
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}
