//! CLI entry point for the Sokoban solver harness.
//!
//! Usage:
//!   sokoban-harness run --corpus <levels.data> [options] -- <solver> [args...]
//!   sokoban-harness run --config <batch.json> [options]
//!   sokoban-harness replay <board-file> <moves>
//!
//! Options for `run`:
//!   --jobs <n>         Solver processes in flight (default: available cores)
//!   --timeout <secs>   Per-level time limit (default: 10)
//!   --limit <n|all>    Only run the first n levels (default: all)
//!   --format <fmt>     human or json (default: human)
//!   --verbose          Debug logging on stderr
//!
//! Exit status is 0 when every level passed, 1 when some did not and 2 when
//! the batch could not be run at all.

use std::fs;
use std::io::{self, Read};
use std::path::PathBuf;
use std::process;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

use sokoban_harness::report::{self, BatchReport};
use sokoban_harness::scheduler::{BatchObserver, Progress};
use sokoban_harness::{
    load_corpus, verify_solution, BatchConfig, ExecutionOutcome, InstanceLimit, Scheduler,
    SolverCommand, Verdict,
};

#[derive(Parser)]
#[command(name = "sokoban-harness")]
#[command(about = "Concurrent conformance harness for external Sokoban solvers")]
#[command(version)]
struct Cli {
    /// Debug logging on stderr
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a solver over a level corpus
    Run {
        /// Level corpus file
        #[arg(long, value_name = "FILE", required_unless_present = "config")]
        corpus: Option<PathBuf>,

        /// JSON batch config; command line flags override its values
        #[arg(long, value_name = "FILE")]
        config: Option<PathBuf>,

        /// Solver processes in flight
        #[arg(long, short)]
        jobs: Option<usize>,

        /// Per-level time limit in seconds
        #[arg(long, value_name = "SECS", value_parser = parse_timeout)]
        timeout: Option<Duration>,

        /// Number of levels to run, or "all"
        #[arg(long)]
        limit: Option<InstanceLimit>,

        /// Report format
        #[arg(long, value_enum, default_value_t = OutputFormat::Human)]
        format: OutputFormat,

        /// Solver executable and its arguments
        #[arg(
            value_name = "SOLVER",
            trailing_var_arg = true,
            allow_hyphen_values = true,
            required_unless_present = "config"
        )]
        solver: Vec<String>,
    },

    /// Replay a move sequence on a single board
    Replay {
        /// Board file in level text format
        #[arg(value_name = "BOARD")]
        board: PathBuf,

        /// Move sequence, or "-" to read it from stdin
        #[arg(value_name = "MOVES")]
        moves: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Human,
    Json,
}

/// Output format for the replay subcommand
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ReplayOutput {
    solved: bool,
    moves: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

/// Logs batch progress through tracing
struct LogObserver;

impl BatchObserver for LogObserver {
    fn on_dispatch(&self, identifier: u32, progress: Progress) {
        tracing::debug!(
            level = identifier,
            running = progress.running,
            executed = progress.executed,
            total = progress.total,
            "dispatched"
        );
    }

    fn on_outcome(&self, outcome: &ExecutionOutcome, progress: Progress) {
        match outcome {
            ExecutionOutcome::Passed {
                identifier,
                elapsed_ms,
            } => tracing::info!(
                level = identifier,
                elapsed_ms,
                done = progress.executed,
                total = progress.total,
                "passed"
            ),
            ExecutionOutcome::Failed { identifier, reason } => tracing::warn!(
                level = identifier,
                %reason,
                done = progress.executed,
                total = progress.total,
                "failed"
            ),
            ExecutionOutcome::TimedOut { identifier } => tracing::warn!(
                level = identifier,
                done = progress.executed,
                total = progress.total,
                "timed out"
            ),
        }
    }
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let outcome = match cli.command {
        Commands::Run {
            corpus,
            config,
            jobs,
            timeout,
            limit,
            format,
            solver,
        } => build_config(config, corpus, jobs, timeout, limit, solver)
            .and_then(|config| run_batch(&config, format)),
        Commands::Replay { board, moves } => replay(board, moves),
    };

    match outcome {
        Ok(true) => process::exit(0),
        Ok(false) => process::exit(1),
        Err(e) => {
            eprintln!("Error: {:#}", e);
            process::exit(2);
        }
    }
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("sokoban_harness=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("sokoban_harness=info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .init();
}

fn build_config(
    config: Option<PathBuf>,
    corpus: Option<PathBuf>,
    jobs: Option<usize>,
    timeout: Option<Duration>,
    limit: Option<InstanceLimit>,
    solver: Vec<String>,
) -> anyhow::Result<BatchConfig> {
    let mut solver = solver.into_iter();
    let command = solver.next().map(|program| SolverCommand {
        program,
        args: solver.collect(),
    });

    let mut batch = match config {
        Some(path) => BatchConfig::from_json_file(&path)?,
        None => {
            let Some(command) = command.clone() else {
                bail!("no solver command given");
            };
            let Some(corpus) = corpus.clone() else {
                bail!("no corpus given");
            };
            BatchConfig::new(command, corpus)
        }
    };

    if let Some(command) = command {
        batch.solver = command;
    }
    if let Some(corpus) = corpus {
        batch.corpus = corpus;
    }
    if let Some(jobs) = jobs {
        batch.concurrency = jobs;
    }
    if let Some(timeout) = timeout {
        batch.timeout = timeout;
    }
    if let Some(limit) = limit {
        batch.limit = limit;
    }

    batch.validate()?;
    Ok(batch)
}

/// Positive number of seconds that fits in a `Duration`
fn parse_timeout(value: &str) -> anyhow::Result<Duration> {
    let secs: f64 = value
        .trim()
        .parse()
        .with_context(|| format!("{:?} is not a number of seconds", value))?;
    let timeout = Duration::try_from_secs_f64(secs)
        .with_context(|| format!("timeout {} is out of range", value))?;
    if timeout.is_zero() {
        bail!("timeout must be positive, got {}", value);
    }
    Ok(timeout)
}

fn run_batch(config: &BatchConfig, format: OutputFormat) -> anyhow::Result<bool> {
    let instances = load_corpus(&config.corpus, config.limit)?;
    tracing::debug!(solver = %config.solver, "solver command");

    let metrics = report::measure(&instances);
    let scheduler = Scheduler::from_config(config);
    let result = scheduler.run_with_observer(instances, &LogObserver);
    let report = BatchReport::summarize(result, &metrics);

    match format {
        OutputFormat::Human => print!("{}", report.to_human()),
        OutputFormat::Json => println!("{}", report.to_json()?),
    }

    Ok(report.all_passed())
}

fn replay(board: PathBuf, moves: String) -> anyhow::Result<bool> {
    let text = fs::read_to_string(&board)
        .with_context(|| format!("failed to read board {}", board.display()))?;
    let moves = if moves == "-" {
        let mut buffer = String::new();
        io::stdin()
            .read_to_string(&mut buffer)
            .context("failed to read moves from stdin")?;
        buffer
    } else {
        moves
    };

    let verdict = verify_solution(&text, &moves)
        .with_context(|| format!("invalid board {}", board.display()))?;
    let output = match verdict {
        Verdict::Solved { moves } => ReplayOutput {
            solved: true,
            moves,
            error: None,
        },
        Verdict::Unsolved { moves } => ReplayOutput {
            solved: false,
            moves,
            error: Some("targets left uncovered".to_string()),
        },
        // moves applied before the illegal one
        Verdict::Invalid(e) => ReplayOutput {
            solved: false,
            moves: moves
                .chars()
                .take(e.offset)
                .filter(|c| !c.is_whitespace())
                .count(),
            error: Some(e.to_string()),
        },
    };

    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(output.solved)
}
