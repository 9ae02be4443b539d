//! Bounded-concurrency batch scheduler.
//!
//! A batch is driven by a fixed pool of workers sharing one queue. The queue,
//! the running/executed counters and the outcome list live behind a single
//! lock, and a worker that finishes a job records its outcome and pops the
//! next level in the same critical section. Outside that lock the number of
//! jobs in flight is therefore always `min(concurrency, total - executed)`
//! once the pool is primed.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::config::BatchConfig;
use crate::corpus::PuzzleInstance;
use crate::puzzle::{Board, ParseError};
use crate::registry::ProcessRegistry;
use crate::replay::{self, ReplayError, Verdict};
use crate::runner::{ProcessRunner, RunError, SolverRunner};

/// Why a level did not pass
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureReason {
    /// The level text is not a valid board
    Parse { error: ParseError },
    /// The solver crashed, wrote to stderr or printed nothing
    Process { details: String },
    /// The solver's answer contains an illegal move
    InvalidSolution { error: ReplayError, output: String },
    /// The answer replays cleanly but leaves targets uncovered
    Unsolved { output: String },
    /// The batch was cancelled while the solver was running
    Cancelled,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::Parse { error } => write!(f, "parse error: {}", error),
            FailureReason::Process { details } => write!(f, "process error: {}", details),
            FailureReason::InvalidSolution { error, .. } => {
                write!(f, "invalid solution: {}", error)
            }
            FailureReason::Unsolved { .. } => f.write_str("unsolved"),
            FailureReason::Cancelled => f.write_str("cancelled"),
        }
    }
}

/// Final result for one level
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ExecutionOutcome {
    #[serde(rename_all = "camelCase")]
    Passed { identifier: u32, elapsed_ms: u64 },
    Failed { identifier: u32, reason: FailureReason },
    TimedOut { identifier: u32 },
}

impl ExecutionOutcome {
    pub fn identifier(&self) -> u32 {
        match self {
            ExecutionOutcome::Passed { identifier, .. }
            | ExecutionOutcome::Failed { identifier, .. }
            | ExecutionOutcome::TimedOut { identifier } => *identifier,
        }
    }

    pub fn is_passed(&self) -> bool {
        matches!(self, ExecutionOutcome::Passed { .. })
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, ExecutionOutcome::Failed { .. })
    }

    pub fn is_timed_out(&self) -> bool {
        matches!(self, ExecutionOutcome::TimedOut { .. })
    }

    /// Solve time, for passed levels only
    pub fn elapsed_ms(&self) -> Option<u64> {
        match self {
            ExecutionOutcome::Passed { elapsed_ms, .. } => Some(*elapsed_ms),
            _ => None,
        }
    }

    pub fn failure_reason(&self) -> Option<&FailureReason> {
        match self {
            ExecutionOutcome::Failed { reason, .. } => Some(reason),
            _ => None,
        }
    }
}

/// Everything recorded for a batch, frozen once the batch completes
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchResult {
    pub total: usize,
    pub executed: usize,
    pub passed: usize,
    pub failed: usize,
    pub timed_out: usize,
    pub cancelled: bool,
    pub elapsed_ms: u64,
    /// Ordered by level identifier
    pub outcomes: Vec<ExecutionOutcome>,
}

impl BatchResult {
    pub fn outcome(&self, identifier: u32) -> Option<&ExecutionOutcome> {
        self.outcomes.iter().find(|o| o.identifier() == identifier)
    }
}

/// Counter snapshot taken under the scheduler lock
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    pub total: usize,
    pub executed: usize,
    pub running: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Running,
    Completed,
}

/// Hooks for progress rendering. All methods default to no-ops.
pub trait BatchObserver: Sync {
    fn on_dispatch(&self, _identifier: u32, _progress: Progress) {}

    fn on_outcome(&self, _outcome: &ExecutionOutcome, _progress: Progress) {}

    /// Called exactly once per batch
    fn on_complete(&self, _result: &BatchResult) {}
}

impl BatchObserver for () {}

struct BatchState {
    phase: Phase,
    queue: VecDeque<PuzzleInstance>,
    total: usize,
    running: usize,
    executed: usize,
    passed: usize,
    failed: usize,
    timed_out: usize,
    outcomes: Vec<ExecutionOutcome>,
}

impl BatchState {
    fn new(instances: Vec<PuzzleInstance>) -> Self {
        let total = instances.len();
        Self {
            phase: Phase::Idle,
            queue: instances.into(),
            total,
            running: 0,
            executed: 0,
            passed: 0,
            failed: 0,
            timed_out: 0,
            outcomes: Vec::with_capacity(total),
        }
    }

    fn progress(&self) -> Progress {
        Progress {
            total: self.total,
            executed: self.executed,
            running: self.running,
        }
    }

    /// Pop the next level if there is spare capacity
    fn dispatch(&mut self, limit: usize, cancelled: bool) -> Option<PuzzleInstance> {
        debug_assert_eq!(self.phase, Phase::Running);
        if cancelled || self.running >= limit || self.executed + self.running >= self.total {
            return None;
        }
        let instance = self.queue.pop_front()?;
        self.running += 1;
        Some(instance)
    }

    fn complete(&mut self, outcome: ExecutionOutcome) {
        debug_assert_eq!(self.phase, Phase::Running);
        self.running -= 1;
        self.executed += 1;
        match outcome {
            ExecutionOutcome::Passed { .. } => self.passed += 1,
            ExecutionOutcome::Failed { .. } => self.failed += 1,
            ExecutionOutcome::TimedOut { .. } => self.timed_out += 1,
        }
        self.outcomes.push(outcome);
    }

    fn freeze(mut self, elapsed: Duration, cancelled: bool) -> BatchResult {
        self.phase = Phase::Completed;
        self.outcomes.sort_by_key(|o| o.identifier());
        BatchResult {
            total: self.total,
            executed: self.executed,
            passed: self.passed,
            failed: self.failed,
            timed_out: self.timed_out,
            cancelled,
            elapsed_ms: elapsed.as_millis() as u64,
            outcomes: self.outcomes,
        }
    }
}

fn lock(state: &Mutex<BatchState>) -> MutexGuard<'_, BatchState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct Scheduler<R = ProcessRunner> {
    runner: R,
    registry: Arc<ProcessRegistry>,
    concurrency: usize,
    timeout: Duration,
}

impl Scheduler<ProcessRunner> {
    /// Scheduler driving the configured solver as child processes
    pub fn from_config(config: &BatchConfig) -> Self {
        let registry = ProcessRegistry::new();
        let runner = ProcessRunner::new(config.solver.clone(), Arc::clone(&registry));
        Self::new(runner, registry, config.concurrency, config.timeout)
    }
}

impl<R: SolverRunner> Scheduler<R> {
    /// `registry` is consulted before every dispatch; cancelling it stops the
    /// batch.
    pub fn new(
        runner: R,
        registry: Arc<ProcessRegistry>,
        concurrency: usize,
        timeout: Duration,
    ) -> Self {
        Self {
            runner,
            registry,
            concurrency: concurrency.max(1),
            timeout,
        }
    }

    /// Handle for bulk cancellation
    pub fn registry(&self) -> Arc<ProcessRegistry> {
        Arc::clone(&self.registry)
    }

    pub fn run(&self, instances: Vec<PuzzleInstance>) -> BatchResult {
        self.run_with_observer(instances, &())
    }

    pub fn run_with_observer(
        &self,
        instances: Vec<PuzzleInstance>,
        observer: &dyn BatchObserver,
    ) -> BatchResult {
        let started = Instant::now();
        let state = Mutex::new(BatchState::new(instances));

        let initial: Vec<(PuzzleInstance, Progress)> = {
            let mut guard = lock(&state);
            guard.phase = Phase::Running;
            tracing::info!(
                levels = guard.total,
                concurrency = self.concurrency,
                timeout = ?self.timeout,
                "starting batch"
            );
            let mut initial = Vec::new();
            while let Some(instance) = guard.dispatch(self.concurrency, self.registry.is_cancelled())
            {
                initial.push((instance, guard.progress()));
            }
            initial
        };

        thread::scope(|scope| {
            let state = &state;
            for (instance, progress) in initial {
                observer.on_dispatch(instance.identifier, progress);
                scope.spawn(move || self.worker(instance, state, observer));
            }
        });

        let state = state.into_inner().unwrap_or_else(PoisonError::into_inner);
        debug_assert_eq!(state.running, 0);
        let result = state.freeze(started.elapsed(), self.registry.is_cancelled());

        tracing::info!(
            executed = result.executed,
            passed = result.passed,
            failed = result.failed,
            timed_out = result.timed_out,
            cancelled = result.cancelled,
            elapsed_ms = result.elapsed_ms,
            "batch complete"
        );
        observer.on_complete(&result);
        result
    }

    fn worker(
        &self,
        first: PuzzleInstance,
        state: &Mutex<BatchState>,
        observer: &dyn BatchObserver,
    ) {
        let mut next = Some(first);
        while let Some(instance) = next.take() {
            let outcome = self.execute(&instance);

            let (progress, following) = {
                let mut guard = lock(state);
                guard.complete(outcome.clone());
                let following = guard.dispatch(self.concurrency, self.registry.is_cancelled());
                (guard.progress(), following)
            };

            observer.on_outcome(&outcome, progress);
            if let Some(following) = &following {
                observer.on_dispatch(following.identifier, progress);
            }
            next = following;
        }
    }

    /// Run one level through the solver and the replay check
    fn execute(&self, instance: &PuzzleInstance) -> ExecutionOutcome {
        let identifier = instance.identifier;

        let board = match Board::parse(&instance.raw_text) {
            Ok(board) => board,
            Err(error) => {
                tracing::debug!(level = identifier, %error, "level does not parse");
                return ExecutionOutcome::Failed {
                    identifier,
                    reason: FailureReason::Parse { error },
                };
            }
        };

        let output = match self.runner.run(instance, self.timeout) {
            Ok(output) => output,
            Err(RunError::Timeout(_)) => return ExecutionOutcome::TimedOut { identifier },
            Err(RunError::Cancelled) => {
                return ExecutionOutcome::Failed {
                    identifier,
                    reason: FailureReason::Cancelled,
                }
            }
            Err(RunError::Failure(details)) => {
                return ExecutionOutcome::Failed {
                    identifier,
                    reason: FailureReason::Process { details },
                }
            }
        };

        let outcome = match replay::verify(&board, &output.stdout) {
            Verdict::Solved { .. } => ExecutionOutcome::Passed {
                identifier,
                elapsed_ms: output.elapsed_ms(),
            },
            Verdict::Unsolved { .. } => ExecutionOutcome::Failed {
                identifier,
                reason: FailureReason::Unsolved {
                    output: output.stdout,
                },
            },
            Verdict::Invalid(error) => ExecutionOutcome::Failed {
                identifier,
                reason: FailureReason::InvalidSolution {
                    error,
                    output: output.stdout,
                },
            },
        };
        tracing::debug!(level = identifier, passed = outcome.is_passed(), "level finished");
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::puzzle::Position;
    use crate::replay::InvalidMove;
    use crate::runner::RunOutput;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const CORRIDOR: &str = "######\n#@$ .#\n######";

    /// In-memory solver with canned answers and an in-flight gauge
    struct ScriptedRunner {
        delay: Duration,
        answers: HashMap<u32, Result<String, RunError>>,
        in_flight: AtomicUsize,
        peak: AtomicUsize,
    }

    impl ScriptedRunner {
        fn new(delay: Duration) -> Self {
            Self {
                delay,
                answers: HashMap::new(),
                in_flight: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
            }
        }

        fn answer(mut self, level: u32, answer: Result<&str, RunError>) -> Self {
            self.answers.insert(level, answer.map(str::to_string));
            self
        }
    }

    impl SolverRunner for ScriptedRunner {
        fn run(&self, instance: &PuzzleInstance, _timeout: Duration) -> Result<RunOutput, RunError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            thread::sleep(self.delay);
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            let answer = self
                .answers
                .get(&instance.identifier)
                .cloned()
                .unwrap_or_else(|| Ok("RR".to_string()));
            answer.map(|stdout| RunOutput {
                stdout,
                elapsed: self.delay,
            })
        }
    }

    #[derive(Default)]
    struct Recorder {
        outcomes: Mutex<Vec<Progress>>,
        dispatched: Mutex<Vec<u32>>,
        completions: AtomicUsize,
        cancel_after_first: Option<Arc<ProcessRegistry>>,
    }

    impl BatchObserver for Recorder {
        fn on_dispatch(&self, identifier: u32, _progress: Progress) {
            self.dispatched.lock().unwrap().push(identifier);
        }

        fn on_outcome(&self, _outcome: &ExecutionOutcome, progress: Progress) {
            self.outcomes.lock().unwrap().push(progress);
            if let Some(registry) = &self.cancel_after_first {
                registry.cancel_all();
            }
        }

        fn on_complete(&self, _result: &BatchResult) {
            self.completions.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn levels(n: u32) -> Vec<PuzzleInstance> {
        (1..=n).map(|id| PuzzleInstance::new(id, CORRIDOR)).collect()
    }

    #[test]
    fn test_outcome_classification() {
        let runner = ScriptedRunner::new(Duration::ZERO)
            .answer(2, Ok("R"))
            .answer(3, Ok("L"))
            .answer(4, Err(RunError::Timeout(Duration::from_secs(1))))
            .answer(5, Err(RunError::Failure("exited with 1".to_string())))
            .answer(7, Err(RunError::Cancelled));
        let mut instances = levels(7);
        instances[5] = PuzzleInstance::new(6, "#$.#");

        let scheduler = Scheduler::new(runner, ProcessRegistry::new(), 3, Duration::from_secs(1));
        let result = scheduler.run(instances);

        assert_eq!(result.total, 7);
        assert_eq!(result.executed, 7);
        assert_eq!(result.passed, 1);
        assert_eq!(result.failed, 5);
        assert_eq!(result.timed_out, 1);
        assert!(!result.cancelled);

        let ids: Vec<u32> = result.outcomes.iter().map(|o| o.identifier()).collect();
        assert_eq!(ids, vec![1, 2, 3, 4, 5, 6, 7]);

        assert_eq!(
            result.outcome(1),
            Some(&ExecutionOutcome::Passed {
                identifier: 1,
                elapsed_ms: 0
            })
        );
        assert_eq!(
            result.outcome(2).and_then(|o| o.failure_reason()),
            Some(&FailureReason::Unsolved {
                output: "R".to_string()
            })
        );
        assert_eq!(
            result.outcome(3).and_then(|o| o.failure_reason()),
            Some(&FailureReason::InvalidSolution {
                error: ReplayError {
                    offset: 0,
                    reason: InvalidMove::BlockedByWall {
                        at: Position::new(0, 1)
                    },
                },
                output: "L".to_string(),
            })
        );
        assert!(result.outcome(4).unwrap().is_timed_out());
        assert!(matches!(
            result.outcome(5).and_then(|o| o.failure_reason()),
            Some(FailureReason::Process { .. })
        ));
        assert_eq!(
            result.outcome(6).and_then(|o| o.failure_reason()),
            Some(&FailureReason::Parse {
                error: ParseError::NoPlayer
            })
        );
        assert_eq!(
            result.outcome(7).and_then(|o| o.failure_reason()),
            Some(&FailureReason::Cancelled)
        );
    }

    #[test]
    fn test_pool_stays_full_until_queue_drains() {
        let runner = ScriptedRunner::new(Duration::from_millis(10));
        let scheduler = Scheduler::new(runner, ProcessRegistry::new(), 3, Duration::from_secs(1));
        let recorder = Recorder::default();

        let result = scheduler.run_with_observer(levels(12), &recorder);
        assert_eq!(result.executed, 12);
        assert_eq!(result.passed, 12);

        let snapshots = recorder.outcomes.lock().unwrap();
        assert_eq!(snapshots.len(), 12);
        for progress in snapshots.iter() {
            assert_eq!(
                progress.running,
                3.min(progress.total - progress.executed),
                "{:?}",
                progress
            );
        }

        assert_eq!(scheduler.runner.peak.load(Ordering::SeqCst), 3);
        assert_eq!(recorder.completions.load(Ordering::SeqCst), 1);

        let mut dispatched = recorder.dispatched.lock().unwrap().clone();
        assert_eq!(dispatched.len(), 12);
        dispatched.sort_unstable();
        assert_eq!(dispatched, (1..=12).collect::<Vec<_>>());
    }

    #[test]
    fn test_dispatch_is_fifo_with_single_worker() {
        let scheduler = Scheduler::new(
            ScriptedRunner::new(Duration::ZERO),
            ProcessRegistry::new(),
            1,
            Duration::from_secs(1),
        );
        let recorder = Recorder::default();
        let instances: Vec<PuzzleInstance> = [5, 3, 9, 1]
            .into_iter()
            .map(|id| PuzzleInstance::new(id, CORRIDOR))
            .collect();

        scheduler.run_with_observer(instances, &recorder);
        assert_eq!(*recorder.dispatched.lock().unwrap(), vec![5, 3, 9, 1]);
    }

    #[test]
    fn test_fewer_levels_than_workers() {
        let scheduler = Scheduler::new(
            ScriptedRunner::new(Duration::from_millis(5)),
            ProcessRegistry::new(),
            8,
            Duration::from_secs(1),
        );
        let result = scheduler.run(levels(2));
        assert_eq!(result.executed, 2);
        assert!(scheduler.runner.peak.load(Ordering::SeqCst) <= 2);
    }

    #[test]
    fn test_empty_batch_completes_once() {
        let scheduler = Scheduler::new(
            ScriptedRunner::new(Duration::ZERO),
            ProcessRegistry::new(),
            4,
            Duration::from_secs(1),
        );
        let recorder = Recorder::default();
        let result = scheduler.run_with_observer(Vec::new(), &recorder);
        assert_eq!(result.total, 0);
        assert_eq!(result.executed, 0);
        assert_eq!(recorder.completions.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_cancellation_stops_dispatch() {
        let registry = ProcessRegistry::new();
        let scheduler = Scheduler::new(
            ScriptedRunner::new(Duration::ZERO),
            Arc::clone(&registry),
            1,
            Duration::from_secs(1),
        );
        let recorder = Recorder {
            cancel_after_first: Some(scheduler.registry()),
            ..Recorder::default()
        };

        let result = scheduler.run_with_observer(levels(5), &recorder);

        // The second level was already popped when the first outcome was
        // reported; nothing is dispatched after that.
        assert!(result.cancelled);
        assert_eq!(result.total, 5);
        assert_eq!(result.executed, 2);
        assert_eq!(recorder.completions.load(Ordering::SeqCst), 1);
        assert!(registry.is_cancelled());
    }
}
