//! Distributed build CLI: reads a Google Web-1T-layout corpus and writes a
//! `counts` repository. Wraps `expgram::indexer::run`.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

use expgram::cli;
use expgram::indexer::{self, BuildConfig};

#[derive(Parser, Debug)]
#[command(name = "expgram-index", about = "Build an n-gram index repository from a Google Web-1T-layout corpus")]
struct Args {
    /// Corpus root directory (holds `1gms/`, `2gms/`, ...).
    #[arg(long)]
    input: PathBuf,

    /// Destination repository directory.
    #[arg(long)]
    output: PathBuf,

    /// Highest n-gram order to build.
    #[arg(long, default_value_t = 5)]
    order: usize,

    /// Number of shards to route bigram-and-up contexts across.
    #[arg(long, default_value_t = 1)]
    shards: usize,

    /// Number of simulated mapper ranks per order.
    #[arg(long = "world-size", default_value_t = 1)]
    world_size: usize,

    /// Scratch directory for intermediate files. Unused by the in-process
    /// build (everything is held in memory), accepted for CLI-surface
    /// parity with a real distributed run.
    #[arg(long = "temp-dir")]
    temp_dir: Option<PathBuf>,

    /// This process's simulated rank. Unused by the in-process build,
    /// accepted for CLI-surface parity with a real distributed run.
    #[arg(long, default_value_t = 0)]
    rank: usize,

    #[arg(short, long = "verbose", action = clap::ArgAction::Count)]
    verbose: u8,

    #[arg(long, default_value_t = 0)]
    debug: u8,
}

fn main() -> ExitCode {
    let args = Args::parse();
    cli::init_logging(args.verbose, args.debug);

    if args.temp_dir.is_some() {
        log::debug!("--temp-dir is accepted for CLI-surface parity but unused by the in-process build");
    }
    if args.rank != 0 || args.world_size > 1 {
        log::debug!("rank={}, world-size={}: simulated in-process, not a real cluster launch", args.rank, args.world_size);
    }

    let config = BuildConfig {
        corpus_root: args.input,
        output_dir: args.output,
        order: args.order,
        shard_count: args.shards.max(1),
        mapper_count: args.world_size.max(1),
    };

    match indexer::run(&config) {
        Ok(()) => {
            println!("build complete: order={}, shards={}", config.order, config.shard_count);
            ExitCode::from(cli::EXIT_SUCCESS as u8)
        }
        Err(err) => {
            let code = cli::report_error(&err);
            ExitCode::from(code as u8)
        }
    }
}
