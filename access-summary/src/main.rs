use std::fs::File;
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use access_log::JsonLinesEmitter;
use chrono::Local;
use clap::{Args as ClapArgs, Parser, Subcommand};
use color_eyre::eyre::WrapErr;
use human_panic::setup_panic;
use log::info;
use partitioned_aggregate::EngineConfig;

use access_summary::*;

/// Summarises page views and bytes transferred per user from JSON-lines access logs.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Aggregate an access log into one summary per user.
    Aggregate {
        #[command(flatten)]
        aggregate_args: AggregateArgs,
    },
    /// Write a synthetic access log.
    Generate {
        #[command(flatten)]
        generate_args: GenerateArgs,
    },
}

#[derive(ClapArgs, Debug)]
struct AggregateArgs {
    /// Input file of JSON lines, `-` for stdin
    #[arg(short, long)]
    input: PathBuf,

    #[arg(short, long, value_enum, default_value_t = Runner::Parallel)]
    runner: Runner,

    /// Worker partitions for the parallel runner, defaults to available parallelism
    #[arg(short, long)]
    workers: Option<usize>,

    #[arg(long, default_value_t = EngineConfig::DEFAULT_CHUNK_SIZE)]
    chunk_size: usize,

    #[arg(long, value_enum, default_value_t = MalformedPolicy::Skip)]
    on_malformed: MalformedPolicy,

    /// Output file, stdout when omitted
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Order output by user id
    #[arg(long)]
    sorted: bool,
}

#[derive(ClapArgs, Debug)]
struct GenerateArgs {
    #[arg(short, long)]
    elements: usize,

    #[arg(short, long)]
    users: usize,

    /// Zipf exponent for user popularity, uniform when omitted
    #[arg(long)]
    zipf: Option<f64>,

    #[arg(long, default_value_t = 42)]
    seed: u64,

    /// Output file, stdout when omitted
    #[arg(short, long)]
    output: Option<PathBuf>,
}

fn open_input(path: &Path) -> color_eyre::Result<Box<dyn BufRead>> {
    if path == Path::new("-") {
        return Ok(Box::new(io::stdin().lock()));
    }
    let file = File::open(path).wrap_err_with(|| format!("could not open input {}", path.display()))?;
    Ok(Box::new(BufReader::new(file)))
}

fn open_output(path: Option<&Path>) -> color_eyre::Result<Box<dyn Write>> {
    match path {
        Some(path) => {
            let file = File::create(path).wrap_err_with(|| format!("could not create output {}", path.display()))?;
            Ok(Box::new(BufWriter::new(file)))
        }
        None => Ok(Box::new(BufWriter::new(io::stdout().lock()))),
    }
}

fn main() -> color_eyre::Result<()> {
    // Install coloured errors
    color_eyre::install()?;

    // Install human readable panics
    setup_panic!();

    // Install and configure environment logger
    env_logger::builder()
        .format(|buf, record| {
            writeln!(
                buf,
                "{} [{}] {}:{} - {}",
                Local::now().format("%Y-%m-%dT%H:%M:%S"),
                record.level(),
                record.file().unwrap_or("??"),
                record.line().unwrap_or(0),
                record.args()
            )
        })
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .init();

    let args = Args::parse();

    match args.command {
        Commands::Aggregate { aggregate_args } => {
            let AggregateArgs { input, runner, workers, chunk_size, on_malformed, output, sorted } = aggregate_args;
            let options = PipelineOptions { runner, workers, chunk_size, on_malformed, sorted };

            let aggregated = aggregate(open_input(&input)?, &options)
                .wrap_err_with(|| format!("aggregation of {} failed", input.display()))?;
            aggregated.report.log();

            // Output is only opened once aggregation has succeeded.
            let mut emitter = JsonLinesEmitter::new(open_output(output.as_deref())?);
            let emitted = aggregated.emit(&mut emitter)?;
            info!("Wrote {} user summaries", emitted);
        }
        Commands::Generate { generate_args } => {
            let GenerateArgs { elements, users, zipf, seed, output } = generate_args;
            let options = GenerateOptions { elements, users, zipf, seed };

            let written = generate_dataset(open_output(output.as_deref())?, &options)?;
            info!("Generated {} events for {} users", written, users);
        }
    }
    Ok(())
}
