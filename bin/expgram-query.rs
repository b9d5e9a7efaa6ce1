//! Query CLI: scores sentences read from `--input` against a built
//! repository, writing one total logprob per line to `--output`. Matches
//! the flag surface `--ngram`, `--input`, `--output`, `--order`, `--shard`,
//! `--verbose`, `--debug`; `-` means stdin/stdout for `--input`/`--output`.

use std::fs::File;
use std::io::{self, BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

use expgram::cli;
use expgram::query::QueryEngine;
use expgram::state::{self, StateViewMut};
use expgram::Error;

#[derive(Parser, Debug)]
#[command(name = "expgram-query", about = "Score sentences against an n-gram index repository")]
struct Args {
    /// Repository directory to open.
    #[arg(long)]
    ngram: PathBuf,

    /// Input file of whitespace-tokenized sentences, one per line, or `-`
    /// for stdin.
    #[arg(long, default_value = "-")]
    input: String,

    /// Output file for per-line total logprob, or `-` for stdout.
    #[arg(long, default_value = "-")]
    output: String,

    /// Expected n-gram order; logged if it disagrees with the opened
    /// repository's own order, but the repository's order always wins.
    #[arg(long)]
    order: Option<usize>,

    /// Restrict scoring to a single shard's diagnostics (currently
    /// informational only: logprob queries always route through every
    /// shard a context needs).
    #[arg(long)]
    shard: Option<usize>,

    #[arg(short, long = "verbose", action = clap::ArgAction::Count)]
    verbose: u8,

    #[arg(long, default_value_t = 0)]
    debug: u8,
}

fn open_input(spec: &str) -> io::Result<Box<dyn BufRead>> {
    if spec == "-" {
        Ok(Box::new(BufReader::new(io::stdin())))
    } else {
        Ok(Box::new(BufReader::new(File::open(spec)?)))
    }
}

fn open_output(spec: &str) -> io::Result<Box<dyn Write>> {
    if spec == "-" {
        Ok(Box::new(io::stdout()))
    } else {
        Ok(Box::new(File::create(spec)?))
    }
}

fn score_sentence(engine: &QueryEngine, line: &str) -> Result<f32, Error> {
    let order = engine.order();
    let mut state = vec![0u8; engine.state_buffer_size()];
    {
        let mut view = StateViewMut::new(&mut state, order)?;
        view.fill_empty();
    }
    let mut out_state = vec![0u8; engine.state_buffer_size()];

    let mut total = 0f32;
    for token in line.split_whitespace() {
        let id = engine.index().vocab().lookup_id(token.as_bytes());
        let lp = engine.logprob(&state, id, &mut out_state)?;
        total += lp;
        state::copy(&out_state, &mut state);
    }
    Ok(total)
}

fn run(args: &Args) -> Result<(), Error> {
    let engine = QueryEngine::open(&args.ngram)?;

    if let Some(expected) = args.order {
        if expected != engine.order() {
            log::warn!("repository order {} does not match --order {}", engine.order(), expected);
        }
    }
    if let Some(shard) = args.shard {
        log::debug!("--shard {shard} is informational only; queries route through whichever shard a context needs");
    }

    let mut input = open_input(&args.input).map_err(|e| Error::io(&args.ngram, e))?;
    let mut output = open_output(&args.output).map_err(|e| Error::io(&args.ngram, e))?;

    let mut line = String::new();
    loop {
        line.clear();
        let n = input.read_line(&mut line).map_err(|e| Error::io(&args.ngram, e))?;
        if n == 0 {
            break;
        }
        let trimmed = line.trim_end_matches(['\n', '\r']);
        let total = score_sentence(&engine, trimmed)?;
        writeln!(output, "{total}").map_err(|e| Error::io(&args.ngram, e))?;
    }
    output.flush().map_err(|e| Error::io(&args.ngram, e))?;
    Ok(())
}

fn main() -> ExitCode {
    let args = Args::parse();
    cli::init_logging(args.verbose, args.debug);

    match run(&args) {
        Ok(()) => ExitCode::from(cli::EXIT_SUCCESS as u8),
        Err(err) => {
            let code = cli::report_error(&err);
            ExitCode::from(code as u8)
        }
    }
}
