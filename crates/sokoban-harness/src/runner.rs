//! External solver invocation.
//!
//! One call spawns one solver process, feeds it a level on stdin and collects
//! stdout and stderr on their own threads while the calling thread watches
//! the deadline. On unix the solver runs in its own process group so that a
//! forced termination also takes down anything it forked.

use std::io::{self, Read, Write};
use std::process::{Child, ChildStdin, Command, ExitStatus, Stdio};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use thiserror::Error;

use crate::config::SolverCommand;
use crate::corpus::PuzzleInstance;
use crate::registry::{ProcessRegistry, Registration};

/// How often a running solver is checked for exit, deadline and cancellation
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(5);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RunError {
    #[error("solver did not finish within {0:?}")]
    Timeout(Duration),

    #[error("solver failed: {0}")]
    Failure(String),

    #[error("solver run was cancelled")]
    Cancelled,
}

/// Output of a solver that exited cleanly
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOutput {
    pub stdout: String,
    pub elapsed: Duration,
}

impl RunOutput {
    pub fn elapsed_ms(&self) -> u64 {
        self.elapsed.as_millis() as u64
    }
}

/// Something that can produce a move sequence for a level
pub trait SolverRunner: Sync {
    fn run(&self, instance: &PuzzleInstance, timeout: Duration) -> Result<RunOutput, RunError>;
}

/// Runs the configured solver as a child process
pub struct ProcessRunner {
    command: SolverCommand,
    registry: Arc<ProcessRegistry>,
    poll_interval: Duration,
}

enum Waited {
    Exited(ExitStatus, Instant),
    TimedOut,
    Cancelled,
}

impl ProcessRunner {
    pub fn new(command: SolverCommand, registry: Arc<ProcessRegistry>) -> Self {
        Self {
            command,
            registry,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval.max(Duration::from_millis(1));
        self
    }

    pub fn registry(&self) -> &Arc<ProcessRegistry> {
        &self.registry
    }

    fn spawn(&self) -> io::Result<Child> {
        let mut command = Command::new(&self.command.program);
        command
            .args(&self.command.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            command.process_group(0);
        }

        command.spawn()
    }

    /// Poll until the child exits, the deadline passes or the batch is
    /// cancelled. Exit is only accepted if it was observed before the
    /// deadline. The child is reaped only after its group has been killed,
    /// so the pid and group id stay reserved until then.
    fn wait(
        &self,
        child: &mut Child,
        deadline: Instant,
        registration: &Registration,
    ) -> io::Result<Waited> {
        loop {
            let exited = has_exited(child)?;
            let now = Instant::now();

            if now >= deadline {
                terminate(child);
                return Ok(Waited::TimedOut);
            }
            if exited {
                // Stragglers forked by the solver would otherwise hold the
                // pipes open.
                #[cfg(unix)]
                kill_group(child.id());
                let status = child.wait()?;
                return Ok(Waited::Exited(status, now));
            }
            if registration.is_cancelled() {
                terminate(child);
                return Ok(Waited::Cancelled);
            }

            thread::sleep(self.poll_interval.min(deadline - now));
        }
    }
}

impl SolverRunner for ProcessRunner {
    fn run(&self, instance: &PuzzleInstance, timeout: Duration) -> Result<RunOutput, RunError> {
        let started = Instant::now();
        let deadline = started + timeout;

        let mut child = self.spawn().map_err(|e| {
            RunError::Failure(format!("failed to spawn `{}`: {}", self.command, e))
        })?;
        let registration =
            self.registry
                .register(child.id(), instance.identifier, started, timeout);
        tracing::debug!(level = instance.identifier, pid = child.id(), "spawned solver");

        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let payload = instance.solver_input();

        let (waited, stdout, stderr) = thread::scope(|scope| {
            scope.spawn(move || feed(stdin, payload));
            let out = scope.spawn(move || drain(stdout));
            let err = scope.spawn(move || drain(stderr));

            let waited = self.wait(&mut child, deadline, &registration);
            if waited.is_err() {
                terminate(&mut child);
            }

            let stdout = out.join().unwrap_or_default();
            let stderr = err.join().unwrap_or_default();
            (waited, stdout, stderr)
        });
        drop(registration);

        let waited = waited
            .map_err(|e| RunError::Failure(format!("failed waiting for solver: {}", e)))?;

        let (status, finished) = match waited {
            Waited::Exited(status, finished) => (status, finished),
            Waited::TimedOut => {
                tracing::warn!(level = instance.identifier, ?timeout, "solver timed out");
                return Err(RunError::Timeout(timeout));
            }
            Waited::Cancelled => {
                tracing::warn!(level = instance.identifier, "solver cancelled");
                return Err(RunError::Cancelled);
            }
        };

        let diagnostics = String::from_utf8_lossy(&stderr);
        let diagnostics = diagnostics.trim();

        if !status.success() {
            return Err(RunError::Failure(if diagnostics.is_empty() {
                format!("exited with {}", status)
            } else {
                format!("exited with {}; stderr={}", status, diagnostics)
            }));
        }
        // Any stderr output counts, whitespace included.
        if !stderr.is_empty() {
            return Err(RunError::Failure(if diagnostics.is_empty() {
                format!("wrote {} bytes of whitespace to stderr", stderr.len())
            } else {
                format!("wrote to stderr: {}", diagnostics)
            }));
        }
        // Whitespace-only output is left to the replay to judge.
        if stdout.is_empty() {
            return Err(RunError::Failure("produced no output".to_string()));
        }
        let stdout = String::from_utf8_lossy(&stdout).into_owned();

        Ok(RunOutput {
            stdout,
            elapsed: finished.duration_since(started),
        })
    }
}

fn feed(stdin: Option<ChildStdin>, payload: String) {
    let Some(mut stdin) = stdin else {
        return;
    };
    if let Err(e) = stdin.write_all(payload.as_bytes()) {
        // A solver may legitimately exit without reading all of its input.
        if e.kind() != io::ErrorKind::BrokenPipe {
            tracing::debug!(error = %e, "failed to write solver input");
        }
    }
}

fn drain<R: Read>(pipe: Option<R>) -> Vec<u8> {
    let mut buffer = Vec::new();
    if let Some(mut pipe) = pipe {
        if let Err(e) = pipe.read_to_end(&mut buffer) {
            tracing::debug!(error = %e, "failed to read solver output");
        }
    }
    buffer
}

/// Whether the child has exited, without reaping it
#[cfg(unix)]
fn has_exited(child: &mut Child) -> io::Result<bool> {
    // SAFETY: siginfo_t is plain data and waitid only writes into it.
    let mut info: libc::siginfo_t = unsafe { std::mem::zeroed() };
    let rc = unsafe {
        libc::waitid(
            libc::P_PID,
            child.id() as libc::id_t,
            &mut info,
            libc::WEXITED | libc::WNOHANG | libc::WNOWAIT,
        )
    };
    if rc == -1 {
        return Err(io::Error::last_os_error());
    }
    // With WNOHANG and nothing to report, si_pid stays zero.
    Ok(unsafe { info.si_pid() } != 0)
}

#[cfg(not(unix))]
fn has_exited(child: &mut Child) -> io::Result<bool> {
    Ok(child.try_wait()?.is_some())
}

/// Forcibly stop a child (and its process group) and reap it
fn terminate(child: &mut Child) {
    #[cfg(unix)]
    kill_group(child.id());
    let _ = child.kill();
    let _ = child.wait();
}

#[cfg(unix)]
fn kill_group(pid: u32) {
    // The child was spawned as leader of its own group, so the group id is
    // its pid. ESRCH just means the group is already gone.
    unsafe {
        libc::killpg(pid as libc::pid_t, libc::SIGKILL);
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    const LEVEL: &str = "#####\n#@$.#\n#####";

    fn runner(script: &str) -> ProcessRunner {
        ProcessRunner::new(SolverCommand::shell(script), ProcessRegistry::new())
    }

    fn instance() -> PuzzleInstance {
        PuzzleInstance::new(1, LEVEL)
    }

    #[test]
    fn test_successful_run() {
        let runner = runner("cat > /dev/null; echo 'R'");
        let output = runner.run(&instance(), Duration::from_secs(5)).unwrap();
        assert_eq!(output.stdout.trim(), "R");
        assert!(output.elapsed < Duration::from_secs(5));
        assert!(runner.registry().is_empty());
    }

    #[test]
    fn test_solver_receives_terminated_board() {
        let runner = runner("cat");
        let output = runner.run(&instance(), Duration::from_secs(5)).unwrap();
        assert_eq!(output.stdout, "#####\n#@$.#\n#####\n;\n");
    }

    #[test]
    fn test_failures() {
        let timeout = Duration::from_secs(5);

        let err = runner("echo R; exit 3").run(&instance(), timeout).unwrap_err();
        assert!(matches!(err, RunError::Failure(ref d) if d.contains("exited")));

        let err = runner("echo R; echo oops >&2")
            .run(&instance(), timeout)
            .unwrap_err();
        assert_eq!(err, RunError::Failure("wrote to stderr: oops".to_string()));

        let err = runner("cat > /dev/null").run(&instance(), timeout).unwrap_err();
        assert_eq!(err, RunError::Failure("produced no output".to_string()));

        let err = runner("cat > /dev/null; echo RR; echo >&2")
            .run(&instance(), timeout)
            .unwrap_err();
        assert_eq!(
            err,
            RunError::Failure("wrote 1 bytes of whitespace to stderr".to_string())
        );

        let missing = ProcessRunner::new(
            SolverCommand::new("/nonexistent/solver"),
            ProcessRegistry::new(),
        );
        assert!(matches!(
            missing.run(&instance(), timeout),
            Err(RunError::Failure(_))
        ));
    }

    #[test]
    fn test_whitespace_output_is_passed_on() {
        let runner = runner("cat > /dev/null; echo");
        let solved = PuzzleInstance::new(1, "#@*#");
        let output = runner.run(&solved, Duration::from_secs(5)).unwrap();
        assert_eq!(output.stdout, "\n");
    }

    #[test]
    fn test_poll_interval() {
        let runner = runner("cat > /dev/null; echo R").with_poll_interval(Duration::ZERO);
        assert_eq!(runner.poll_interval, Duration::from_millis(1));

        let slow = runner.with_poll_interval(Duration::from_millis(50));
        let output = slow.run(&instance(), Duration::from_secs(5)).unwrap();
        assert_eq!(output.stdout.trim(), "R");
    }

    #[test]
    fn test_timeout_kills_solver() {
        let runner = runner("sleep 5; echo R");
        let started = Instant::now();
        let err = runner
            .run(&instance(), Duration::from_millis(200))
            .unwrap_err();
        assert_eq!(err, RunError::Timeout(Duration::from_millis(200)));
        assert!(started.elapsed() < Duration::from_secs(4));
        assert!(runner.registry().is_empty());
    }

    #[test]
    fn test_output_after_deadline_is_timeout() {
        let runner = runner("echo R; sleep 1");
        let err = runner
            .run(&instance(), Duration::from_millis(200))
            .unwrap_err();
        assert!(matches!(err, RunError::Timeout(_)));
    }

    #[test]
    fn test_background_children_do_not_hold_the_run() {
        let runner = runner("sleep 30 & echo R");
        let started = Instant::now();
        let output = runner.run(&instance(), Duration::from_secs(10)).unwrap();
        assert_eq!(output.stdout.trim(), "R");
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn test_cancel_all_stops_running_solver() {
        let runner = runner("sleep 30; echo R");
        let registry = Arc::clone(runner.registry());

        let result = thread::scope(|scope| {
            let handle = scope.spawn(|| runner.run(&instance(), Duration::from_secs(30)));
            while registry.is_empty() {
                thread::sleep(Duration::from_millis(5));
            }
            assert_eq!(registry.active()[0].level, 1);
            registry.cancel_all();
            handle.join().unwrap()
        });

        assert_eq!(result, Err(RunError::Cancelled));
        assert!(registry.is_empty());
    }
}
