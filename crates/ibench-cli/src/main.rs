use anyhow::{bail, Result};
use clap::Parser;
use ibench_runner::{
    start_timestamp, BenchRunner, Benchmark, Catalogue, CleanPolicy, Operation, Reporter,
    RunPlan, RunnerConfig, TraceSpec, DEFAULT_READY_TIMEOUT_SECS,
};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

#[derive(Parser)]
#[command(
    name = "ibench",
    version,
    about = "Times container image startup and distribution operations"
)]
struct Cli {
    /// Benchmark names, comma separated, or "all".
    #[arg(required_unless_present_any = ["list", "list_json"])]
    benchmarks: Option<String>,
    /// Docker-compatible engine binary.
    #[arg(long, default_value = "docker")]
    engine: String,
    /// Output file for the result records.
    #[arg(long, default_value = "bench.out")]
    out: String,
    /// Append the run timestamp to the output file name.
    #[arg(short = 't', long)]
    add_time_postfix: bool,
    /// Operation to time (run|push|pull|tag|move).
    #[arg(long, default_value = "run")]
    op: String,
    /// Registry the images are pulled from.
    #[arg(long, default_value = "docker.io")]
    registry: String,
    /// Destination registry for tag and move.
    #[arg(long, default_value = "localhost:5000")]
    registry2: String,
    /// Show the image list for the benchmark.
    #[arg(long)]
    list: bool,
    /// Show the image list for the benchmark as JSON.
    #[arg(long)]
    list_json: bool,
    /// Image cleanup policy (none|first|each).
    #[arg(long, default_value = "none")]
    clean: String,
    /// Trace file to copy after each benchmark.
    #[arg(long)]
    trace_file: Option<PathBuf>,
    /// Destination directory for trace copies.
    #[arg(long)]
    trace_dir: Option<PathBuf>,
    /// Directory holding the source trees staged into language benchmarks.
    #[arg(long, default_value = ".")]
    data_dir: PathBuf,
    /// Give up on readiness probes after this many seconds.
    #[arg(long, default_value_t = DEFAULT_READY_TIMEOUT_SECS)]
    ready_timeout: u64,
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let catalogue = Catalogue::new();
    if cli.list {
        print_listing(&catalogue);
        return Ok(());
    }
    if cli.list_json {
        let benches: Vec<&Benchmark> = catalogue.iter().collect();
        println!("{}", serde_json::to_string(&benches)?);
        return Ok(());
    }

    let op: Operation = cli.op.parse()?;
    let clean: CleanPolicy = cli.clean.parse()?;
    let trace = match (cli.trace_file, cli.trace_dir) {
        (Some(file), Some(dir)) => Some(TraceSpec { file, dir }),
        (None, None) => None,
        _ => bail!("trace_options_mismatch: --trace-file and --trace-dir must be given together"),
    };
    let benches = catalogue.select(cli.benchmarks.as_deref().unwrap_or_default())?;

    let start_time = start_timestamp();
    let outpath = if cli.add_time_postfix {
        format!("{}.{}", cli.out, start_time)
    } else {
        cli.out.clone()
    };
    debug!(
        engine = %cli.engine,
        op = %cli.op,
        outpath = %outpath,
        clean = %cli.clean,
        registry = %cli.registry,
        registry2 = %cli.registry2,
        "configuration"
    );

    let mut runner = BenchRunner::new(RunnerConfig {
        engine: cli.engine,
        registry: cli.registry,
        registry2: Some(cli.registry2),
        data_dir: cli.data_dir,
        verbose: cli.verbose,
        ready_timeout: Duration::from_secs(cli.ready_timeout),
    })?;

    let invocation = std::env::args().collect::<Vec<_>>().join(" ");
    let mut reporter = Reporter::create(Path::new(&outpath), &invocation)?;
    let plan = RunPlan {
        op,
        clean,
        start_time,
        trace,
    };
    runner.execute(&catalogue, &benches, &plan, &mut reporter)?;
    Ok(())
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "warn" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn print_listing(catalogue: &Catalogue) {
    println!("{:<16}\t{:<20}", "CATEGORY", "NAME");
    let mut benches: Vec<&Benchmark> = catalogue.iter().collect();
    benches.sort_by_key(|b| (b.category.as_str(), b.name));
    for bench in benches {
        println!("{:<16}\t{:<20}", bench.category.as_str(), bench.name);
    }
}
