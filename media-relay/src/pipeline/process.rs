//! Handles around spawned external programs.

use std::time::Duration;

use process_utils::{StdioLayout, display_command, supervised_command};
use tokio::io::AsyncReadExt;
use tokio::process::{Child, ChildStdin, ChildStdout};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::diagnostics::drain_diagnostics;
use crate::{Error, Result};

/// How long to wait for a diagnostic drain after its process exited.
///
/// A grandchild that inherited stderr can keep the pipe open after the
/// direct child is gone.
const DIAGNOSTIC_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// How a child process ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitOutcome {
    pub program: String,
    /// Exit code, `None` when terminated by a signal.
    pub code: Option<i32>,
    /// True when the session killed the process itself.
    pub killed: bool,
    /// Last lines of the diagnostic stream.
    pub stderr_tail: String,
}

impl ExitOutcome {
    pub fn success(&self) -> bool {
        !self.killed && self.code == Some(0)
    }

    pub fn into_error(self) -> Error {
        Error::Process {
            program: self.program,
            code: self.code,
            stderr: self.stderr_tail,
        }
    }
}

/// One spawned external process.
///
/// Diagnostic output is drained concurrently from the moment of spawning.
/// Dropping the handle kills the process.
pub struct ChildProcessHandle {
    program: String,
    session_id: Uuid,
    child: Child,
    pid: Option<u32>,
    stderr_drain: Option<JoinHandle<String>>,
    outcome: Option<ExitOutcome>,
}

impl ChildProcessHandle {
    /// Spawn `program` with a discrete argument vector.
    pub fn spawn(
        program: &str,
        args: &[String],
        layout: StdioLayout,
        session_id: Uuid,
    ) -> Result<Self> {
        debug!(
            session_id = %session_id,
            command = %display_command(program, args),
            "Spawning child process"
        );

        let mut child = supervised_command(program, args, layout)
            .spawn()
            .map_err(|e| Error::startup(program, e))?;

        let pid = child.id();
        let stderr_drain = child.stderr.take().map(|stderr| {
            tokio::spawn(drain_diagnostics(stderr, program.to_string(), session_id))
        });

        info!(session_id = %session_id, program = %program, pid = ?pid, "Child process started");

        Ok(Self {
            program: program.to_string(),
            session_id,
            child,
            pid,
            stderr_drain,
            outcome: None,
        })
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn take_stdin(&mut self) -> Option<ChildStdin> {
        self.child.stdin.take()
    }

    pub fn take_stdout(&mut self) -> Option<ChildStdout> {
        self.child.stdout.take()
    }

    /// Take stdout, failing with a startup error when it was not piped.
    pub fn require_stdout(&mut self) -> Result<ChildStdout> {
        self.take_stdout().ok_or_else(|| {
            Error::startup(
                self.program.clone(),
                std::io::Error::other("stdout was not captured"),
            )
        })
    }

    /// Take stdin, failing with a startup error when it was not piped.
    pub fn require_stdin(&mut self) -> Result<ChildStdin> {
        self.take_stdin().ok_or_else(|| {
            Error::startup(
                self.program.clone(),
                std::io::Error::other("stdin was not captured"),
            )
        })
    }

    /// The outcome, if the process has already been reaped.
    pub fn outcome(&self) -> Option<&ExitOutcome> {
        self.outcome.as_ref()
    }

    /// Wait for the process to exit on its own.
    ///
    /// Cancel-safe: dropping the future leaves the handle usable.
    pub async fn wait(&mut self) -> ExitOutcome {
        if let Some(outcome) = &self.outcome {
            return outcome.clone();
        }
        let code = match self.child.wait().await {
            Ok(status) => status.code(),
            Err(e) => {
                warn!(
                    session_id = %self.session_id,
                    program = %self.program,
                    error = %e,
                    "Error waiting for child process"
                );
                None
            }
        };
        self.finish(code, false).await
    }

    /// Forcefully kill the process (if still running) and reap it.
    pub async fn terminate(&mut self) -> ExitOutcome {
        if let Some(outcome) = &self.outcome {
            return outcome.clone();
        }

        // It may have exited between our last poll and now.
        if let Ok(Some(status)) = self.child.try_wait() {
            return self.finish(status.code(), false).await;
        }

        if let Err(e) = self.child.start_kill() {
            warn!(
                session_id = %self.session_id,
                program = %self.program,
                error = %e,
                "Failed to kill child process"
            );
        }
        let code = match self.child.wait().await {
            Ok(status) => status.code(),
            Err(e) => {
                warn!(
                    session_id = %self.session_id,
                    program = %self.program,
                    error = %e,
                    "Error reaping killed child process"
                );
                None
            }
        };
        debug!(
            session_id = %self.session_id,
            program = %self.program,
            pid = ?self.pid,
            "Child process killed"
        );
        self.finish(code, true).await
    }

    async fn finish(&mut self, code: Option<i32>, killed: bool) -> ExitOutcome {
        let stderr_tail = match self.stderr_drain.take() {
            Some(mut drain) => {
                match tokio::time::timeout(DIAGNOSTIC_DRAIN_TIMEOUT, &mut drain).await {
                    Ok(Ok(tail)) => tail,
                    Ok(Err(e)) => {
                        warn!(
                            session_id = %self.session_id,
                            program = %self.program,
                            error = %e,
                            "Diagnostic drain task failed"
                        );
                        String::new()
                    }
                    Err(_) => {
                        drain.abort();
                        String::new()
                    }
                }
            }
            None => String::new(),
        };

        let outcome = ExitOutcome {
            program: self.program.clone(),
            code,
            killed,
            stderr_tail,
        };
        self.outcome = Some(outcome.clone());
        outcome
    }
}

impl std::fmt::Debug for ChildProcessHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChildProcessHandle")
            .field("program", &self.program)
            .field("pid", &self.pid)
            .field("outcome", &self.outcome)
            .finish()
    }
}

/// Output of a short-lived process run to completion.
#[derive(Debug)]
pub struct CapturedOutput {
    pub stdout: Vec<u8>,
    pub outcome: ExitOutcome,
}

/// Run a process to completion, capturing stdout.
///
/// Only meant for small outputs such as JSON metadata or a filename.
/// A non-zero exit becomes [`Error::Process`].
pub async fn run_to_completion(
    program: &str,
    args: &[String],
    session_id: Uuid,
) -> Result<CapturedOutput> {
    let mut handle = ChildProcessHandle::spawn(program, args, StdioLayout::Producer, session_id)?;
    let mut stdout = handle.require_stdout()?;

    let mut buf = Vec::new();
    if let Err(e) = stdout.read_to_end(&mut buf).await {
        handle.terminate().await;
        return Err(Error::Io(e));
    }
    drop(stdout);

    let outcome = handle.wait().await;
    if !outcome.success() {
        return Err(outcome.into_error());
    }
    Ok(CapturedOutput {
        stdout: buf,
        outcome,
    })
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh(script: &str) -> Vec<String> {
        vec!["-c".to_string(), script.to_string()]
    }

    #[tokio::test]
    async fn missing_binary_is_startup_error() {
        let err = ChildProcessHandle::spawn(
            "/definitely/not/a/binary",
            &[],
            StdioLayout::Producer,
            Uuid::new_v4(),
        )
        .unwrap_err();
        assert!(matches!(err, Error::Startup { .. }));
    }

    #[tokio::test]
    async fn wait_reports_exit_code_and_stderr_tail() {
        let mut handle = ChildProcessHandle::spawn(
            "sh",
            &sh("echo 'ERROR: unsupported url' >&2; exit 3"),
            StdioLayout::Producer,
            Uuid::new_v4(),
        )
        .unwrap();

        let outcome = handle.wait().await;
        assert_eq!(outcome.code, Some(3));
        assert!(!outcome.success());
        assert!(outcome.stderr_tail.contains("unsupported url"));
        assert_eq!(handle.outcome(), Some(&outcome));
    }

    #[tokio::test]
    async fn terminate_kills_running_process() {
        let mut handle = ChildProcessHandle::spawn(
            "sh",
            &sh("exec sleep 30"),
            StdioLayout::Producer,
            Uuid::new_v4(),
        )
        .unwrap();

        let outcome = tokio::time::timeout(Duration::from_secs(5), handle.terminate())
            .await
            .expect("terminate should not hang");
        assert!(outcome.killed);
        assert!(!outcome.success());
    }

    #[tokio::test]
    async fn terminate_after_exit_is_not_a_kill() {
        let mut handle =
            ChildProcessHandle::spawn("sh", &sh("exit 0"), StdioLayout::Producer, Uuid::new_v4())
                .unwrap();
        let waited = handle.wait().await;
        let terminated = handle.terminate().await;
        assert!(waited.success());
        assert_eq!(waited, terminated);
    }

    #[tokio::test]
    async fn run_to_completion_captures_stdout() {
        let output = run_to_completion("sh", &sh("printf 'My Title.webm'"), Uuid::new_v4())
            .await
            .unwrap();
        assert_eq!(output.stdout, b"My Title.webm");
        assert!(output.outcome.success());
    }

    #[tokio::test]
    async fn run_to_completion_maps_failure() {
        let err = run_to_completion("sh", &sh("echo boom >&2; exit 1"), Uuid::new_v4())
            .await
            .unwrap_err();
        match err {
            Error::Process { code, stderr, .. } => {
                assert_eq!(code, Some(1));
                assert!(stderr.contains("boom"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
