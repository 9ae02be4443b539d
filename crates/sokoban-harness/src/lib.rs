//! Conformance harness for external Sokoban solvers.
//!
//! A corpus of levels is handed to a solver executable one level per
//! process, with a bounded number of processes in flight. Every answer is
//! replayed against the board rules before it counts as a pass, and the
//! batch ends with pass/fail/timeout counts plus per-category statistics.

pub mod config;
pub mod corpus;
pub mod puzzle;
pub mod registry;
pub mod replay;
pub mod report;
pub mod runner;
pub mod scheduler;
pub mod stats;

// Re-export main types
pub use config::{BatchConfig, ConfigError, InstanceLimit, SolverCommand};
pub use corpus::{load_corpus, parse_corpus, CorpusError, PuzzleInstance};
pub use puzzle::{Board, BoardMetrics, Cell, Direction, ParseError, Position};
pub use registry::ProcessRegistry;
pub use replay::{go_by_string, step, verify, verify_solution, InvalidMove, ReplayError, Verdict};
pub use report::BatchReport;
pub use runner::{ProcessRunner, RunError, RunOutput, SolverRunner};
pub use scheduler::{
    BatchObserver, BatchResult, ExecutionOutcome, FailureReason, Progress, Scheduler,
};
pub use stats::{summarize, Category, CategorySummary, MeasuredOutcome, Stat};
