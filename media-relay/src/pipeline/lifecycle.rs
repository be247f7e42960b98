//! Session lifecycle and cancellation.
//!
//! A session moves through `starting → streaming → draining → closed`, with an
//! orthogonal `cancelled` flag. Transitions are driven by named events through
//! [`SessionStateMachine::apply`]; the supervisor task turns process exits and
//! cancellation into those events and enforces termination of every child.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::process::{ChildProcessHandle, ExitOutcome};
use super::workspace::Workspace;
use crate::{Error, Result};

/// State of a pipeline session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    /// Processes spawned, no bytes relayed yet.
    Starting,
    /// Bytes flowing end-to-end.
    Streaming,
    /// Terminal output ended or failed; remaining children are being stopped.
    Draining,
    /// Every child reaped and the workspace released.
    Closed,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Streaming => "streaming",
            Self::Draining => "draining",
            Self::Closed => "closed",
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Events that drive the state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// The relay handed the first chunk to the transport.
    FirstByte,
    /// The terminal process finished its output normally.
    EndOfStream,
    /// The client went away.
    ClientDisconnected,
    /// A child failed, or the relay hit an unrecoverable error.
    ProcessFailed(String),
    /// Children reaped and workspace released.
    Closed,
}

impl SessionEvent {
    fn name(&self) -> &'static str {
        match self {
            Self::FirstByte => "first_byte",
            Self::EndOfStream => "end_of_stream",
            Self::ClientDisconnected => "client_disconnected",
            Self::ProcessFailed(_) => "process_failed",
            Self::Closed => "closed",
        }
    }
}

/// Snapshot of a session's lifecycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionStatus {
    pub state: SessionState,
    pub cancelled: bool,
    pub error: Option<String>,
}

/// The pure state machine behind a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionStateMachine {
    state: SessionState,
    cancelled: bool,
    error: Option<String>,
}

impl Default for SessionStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionStateMachine {
    pub fn new() -> Self {
        Self {
            state: SessionState::Starting,
            cancelled: false,
            error: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn status(&self) -> SessionStatus {
        SessionStatus {
            state: self.state,
            cancelled: self.cancelled,
            error: self.error.clone(),
        }
    }

    /// Apply an event, returning the resulting state.
    ///
    /// Events that arrive late but are harmless (a buffered first chunk read
    /// after the process already exited, a second failure while draining)
    /// leave the state unchanged. Anything after `closed` is rejected.
    pub fn apply(&mut self, event: SessionEvent) -> Result<SessionState> {
        use SessionState::*;

        let next = match (self.state, &event) {
            (Closed, _) => return Err(self.invalid(&event)),

            (Starting, SessionEvent::FirstByte) => Streaming,
            (Streaming | Draining, SessionEvent::FirstByte) => self.state,

            (Starting | Streaming | Draining, SessionEvent::EndOfStream) => Draining,

            (Starting | Streaming | Draining, SessionEvent::ClientDisconnected) => {
                self.cancelled = true;
                Draining
            }

            (Starting | Streaming | Draining, SessionEvent::ProcessFailed(msg)) => {
                if self.error.is_none() {
                    self.error = Some(msg.clone());
                }
                Draining
            }

            (Draining, SessionEvent::Closed) => Closed,
            (Starting | Streaming, SessionEvent::Closed) => return Err(self.invalid(&event)),
        };

        self.state = next;
        Ok(next)
    }

    fn invalid(&self, event: &SessionEvent) -> Error {
        Error::InvalidStateTransition {
            from: self.state.to_string(),
            to: event.name().to_string(),
        }
    }
}

/// Shared view of one session's state machine.
///
/// Cloned into the relay and the supervisor of the same session only; it is
/// never shared across sessions.
#[derive(Clone)]
pub struct SessionMonitor {
    inner: Arc<MonitorInner>,
}

struct MonitorInner {
    id: Uuid,
    machine: Mutex<SessionStateMachine>,
    status_tx: watch::Sender<SessionStatus>,
}

impl SessionMonitor {
    pub fn new(id: Uuid) -> Self {
        let machine = SessionStateMachine::new();
        let (status_tx, _) = watch::channel(machine.status());
        Self {
            inner: Arc::new(MonitorInner {
                id,
                machine: Mutex::new(machine),
                status_tx,
            }),
        }
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    /// Apply an event and publish the new status.
    pub fn apply(&self, event: SessionEvent) -> Result<SessionState> {
        let mut machine = self.inner.machine.lock();
        let before = machine.state();
        let after = machine.apply(event.clone())?;
        if before != after {
            debug!(
                session_id = %self.inner.id,
                from = %before,
                to = %after,
                event = event.name(),
                "Session state changed"
            );
        }
        // Published under the lock so subscribers never see statuses out of order.
        self.inner.status_tx.send_replace(machine.status());
        Ok(after)
    }

    pub fn status(&self) -> SessionStatus {
        self.inner.machine.lock().status()
    }

    pub fn state(&self) -> SessionState {
        self.inner.machine.lock().state()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionStatus> {
        self.inner.status_tx.subscribe()
    }

    /// Wait until the session reaches `closed`.
    pub async fn closed(&self) -> SessionStatus {
        let mut rx = self.subscribe();
        match rx.wait_for(|s| s.state == SessionState::Closed).await {
            Ok(status) => status.clone(),
            // Sender lives in `self`, so this only happens during teardown.
            Err(_) => self.status(),
        }
    }
}

impl std::fmt::Debug for SessionMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionMonitor")
            .field("id", &self.inner.id)
            .field("status", &self.status())
            .finish()
    }
}

/// Result of the terminal stage, reported to the relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminalOutcome {
    /// Every child that exited on its own did so successfully.
    Completed,
    /// A child failed.
    Failed(ExitOutcome),
    /// The session was cancelled before the terminal child finished.
    Cancelled,
}

/// Everything the supervisor owns for one session.
pub struct SupervisedSession {
    pub monitor: SessionMonitor,
    pub cancel: CancellationToken,
    /// Fired by the relay when it ends or is dropped.
    pub relay_done: CancellationToken,
    /// Children in pipeline order; the last one produces the terminal output.
    pub children: Vec<ChildProcessHandle>,
    pub workspace: Option<Workspace>,
    pub outcome_tx: oneshot::Sender<TerminalOutcome>,
    /// Grace given to upstream children once the terminal child is done.
    pub upstream_grace: Duration,
}

/// Spawn the supervisor task for a session.
pub fn spawn_supervisor(session: SupervisedSession) -> tokio::task::JoinHandle<()> {
    tokio::spawn(supervise(session))
}

async fn supervise(session: SupervisedSession) {
    let SupervisedSession {
        monitor,
        cancel,
        relay_done,
        mut children,
        workspace,
        outcome_tx,
        upstream_grace,
    } = session;
    let session_id = monitor.id();
    let mut terminal = children.pop();

    // `None` means cancelled; `Some(None)` means there is no terminal child.
    let finished = match terminal.as_mut() {
        Some(child) => tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            outcome = child.wait() => Some(Some(outcome)),
        },
        None => Some(None),
    };

    let outcome = match finished {
        None => {
            cancel_all(&monitor, terminal.as_mut(), &mut children).await;
            TerminalOutcome::Cancelled
        }
        Some(terminal_outcome) => {
            let upstream = drain_upstream(&mut children, upstream_grace, &cancel).await;
            // A starved transcoder fails too; the upstream cause is the one to report.
            let failure = upstream.or(terminal_outcome.filter(|o| !o.success()));

            match failure {
                Some(failed) => {
                    error!(
                        session_id = %session_id,
                        program = %failed.program,
                        code = ?failed.code,
                        stderr = %failed.stderr_tail,
                        "Pipeline process failed"
                    );
                    apply_or_log(
                        &monitor,
                        SessionEvent::ProcessFailed(failed.clone().into_error().to_string()),
                    );
                    TerminalOutcome::Failed(failed)
                }
                None if cancel.is_cancelled() => {
                    cancel_all(&monitor, terminal.as_mut(), &mut children).await;
                    TerminalOutcome::Cancelled
                }
                None => {
                    apply_or_log(&monitor, SessionEvent::EndOfStream);
                    TerminalOutcome::Completed
                }
            }
        }
    };

    // The relay may already be gone, in which case nobody is listening.
    let _ = outcome_tx.send(outcome);

    // Bytes may still sit in the pipe or file; the response owns them until it ends.
    tokio::select! {
        _ = relay_done.cancelled() => {}
        _ = cancel.cancelled() => {}
    }

    // A client leaving after the children finished is still a cancellation.
    if cancel.is_cancelled() && !monitor.status().cancelled && monitor.status().error.is_none() {
        apply_or_log(&monitor, SessionEvent::ClientDisconnected);
    }

    if let Some(child) = terminal.as_mut() {
        child.terminate().await;
    }
    for child in children.iter_mut() {
        child.terminate().await;
    }

    if let Some(workspace) = workspace {
        workspace.remove().await;
    }

    apply_or_log(&monitor, SessionEvent::Closed);

    let status = monitor.status();
    if status.cancelled {
        info!(session_id = %session_id, "Session cancelled by client, resources released");
    } else if let Some(err) = &status.error {
        warn!(session_id = %session_id, error = %err, "Session closed after failure");
    } else {
        info!(session_id = %session_id, "Session completed");
    }
}

/// Mark the session cancelled and kill every live child immediately.
async fn cancel_all(
    monitor: &SessionMonitor,
    terminal: Option<&mut ChildProcessHandle>,
    upstream: &mut [ChildProcessHandle],
) {
    // A relay error already moved the session to draining with the cause recorded.
    if monitor.state() != SessionState::Draining {
        apply_or_log(monitor, SessionEvent::ClientDisconnected);
    }

    if let Some(child) = terminal {
        child.terminate().await;
    }
    for child in upstream.iter_mut() {
        child.terminate().await;
    }
}

/// Give upstream children a grace period, then kill whatever is left.
///
/// Returns the first upstream failure among children that exited on their
/// own; children we had to kill are not failures.
async fn drain_upstream(
    upstream: &mut [ChildProcessHandle],
    grace: Duration,
    cancel: &CancellationToken,
) -> Option<ExitOutcome> {
    let mut failure = None;
    for child in upstream.iter_mut() {
        let exited = tokio::select! {
            _ = cancel.cancelled() => None,
            res = tokio::time::timeout(grace, child.wait()) => res.ok(),
        };
        let outcome = match exited {
            Some(outcome) => outcome,
            None => {
                debug!(
                    program = %child.program(),
                    "Upstream process still running after terminal exit"
                );
                child.terminate().await
            }
        };
        if failure.is_none() && !outcome.killed && !outcome.success() {
            failure = Some(outcome);
        }
    }
    failure
}

fn apply_or_log(monitor: &SessionMonitor, event: SessionEvent) {
    if let Err(e) = monitor.apply(event) {
        warn!(session_id = %monitor.id(), error = %e, "Ignoring session event");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_transitions() {
        let mut machine = SessionStateMachine::new();
        assert_eq!(machine.state(), SessionState::Starting);
        assert_eq!(machine.apply(SessionEvent::FirstByte).unwrap(), SessionState::Streaming);
        assert_eq!(machine.apply(SessionEvent::EndOfStream).unwrap(), SessionState::Draining);
        assert_eq!(machine.apply(SessionEvent::Closed).unwrap(), SessionState::Closed);
        assert!(!machine.is_cancelled());
        assert!(machine.error().is_none());
    }

    #[test]
    fn disconnect_sets_cancelled_from_any_open_state() {
        for prelude in [vec![], vec![SessionEvent::FirstByte], vec![SessionEvent::EndOfStream]] {
            let mut machine = SessionStateMachine::new();
            for event in prelude {
                machine.apply(event).unwrap();
            }
            assert_eq!(
                machine.apply(SessionEvent::ClientDisconnected).unwrap(),
                SessionState::Draining
            );
            assert!(machine.is_cancelled());
        }
    }

    #[test]
    fn failure_before_output_goes_straight_to_draining() {
        let mut machine = SessionStateMachine::new();
        let state = machine
            .apply(SessionEvent::ProcessFailed("yt-dlp exited with code 1".into()))
            .unwrap();
        assert_eq!(state, SessionState::Draining);
        assert_eq!(machine.error(), Some("yt-dlp exited with code 1"));
        assert!(!machine.is_cancelled());
    }

    #[test]
    fn first_error_is_kept() {
        let mut machine = SessionStateMachine::new();
        machine.apply(SessionEvent::ProcessFailed("first".into())).unwrap();
        machine.apply(SessionEvent::ProcessFailed("second".into())).unwrap();
        assert_eq!(machine.error(), Some("first"));
    }

    #[test]
    fn late_first_byte_while_draining_is_ignored() {
        let mut machine = SessionStateMachine::new();
        machine.apply(SessionEvent::EndOfStream).unwrap();
        assert_eq!(machine.apply(SessionEvent::FirstByte).unwrap(), SessionState::Draining);
    }

    #[test]
    fn closed_requires_draining() {
        let mut machine = SessionStateMachine::new();
        let err = machine.apply(SessionEvent::Closed).unwrap_err();
        assert!(matches!(err, Error::InvalidStateTransition { .. }));
        assert_eq!(machine.state(), SessionState::Starting);
    }

    #[test]
    fn nothing_happens_after_closed() {
        let mut machine = SessionStateMachine::new();
        machine.apply(SessionEvent::EndOfStream).unwrap();
        machine.apply(SessionEvent::Closed).unwrap();
        for event in [
            SessionEvent::FirstByte,
            SessionEvent::EndOfStream,
            SessionEvent::ClientDisconnected,
            SessionEvent::ProcessFailed("late".into()),
            SessionEvent::Closed,
        ] {
            assert!(machine.apply(event).is_err());
        }
        assert!(!machine.is_cancelled());
    }

    #[tokio::test]
    async fn monitor_publishes_status() {
        let monitor = SessionMonitor::new(Uuid::new_v4());
        let mut rx = monitor.subscribe();
        monitor.apply(SessionEvent::FirstByte).unwrap();
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow().state, SessionState::Streaming);

        monitor.apply(SessionEvent::ClientDisconnected).unwrap();
        monitor.apply(SessionEvent::Closed).unwrap();
        let status = monitor.closed().await;
        assert!(status.cancelled);
        assert_eq!(status.state, SessionState::Closed);
    }

    #[cfg(unix)]
    mod supervisor {
        use super::*;
        use process_utils::StdioLayout;

        fn spawn_sh(script: &str, id: Uuid) -> ChildProcessHandle {
            ChildProcessHandle::spawn(
                "sh",
                &["-c".to_string(), script.to_string()],
                StdioLayout::Producer,
                id,
            )
            .unwrap()
        }

        struct Harness {
            monitor: SessionMonitor,
            cancel: CancellationToken,
            relay_done: CancellationToken,
            outcome_rx: oneshot::Receiver<TerminalOutcome>,
        }

        fn start(children: Vec<ChildProcessHandle>, id: Uuid) -> Harness {
            let monitor = SessionMonitor::new(id);
            let cancel = CancellationToken::new();
            let relay_done = CancellationToken::new();
            let (outcome_tx, outcome_rx) = oneshot::channel();
            spawn_supervisor(SupervisedSession {
                monitor: monitor.clone(),
                cancel: cancel.clone(),
                relay_done: relay_done.clone(),
                children,
                workspace: None,
                outcome_tx,
                upstream_grace: Duration::from_millis(200),
            });
            Harness {
                monitor,
                cancel,
                relay_done,
                outcome_rx,
            }
        }

        #[tokio::test]
        async fn completes_when_terminal_succeeds() {
            let id = Uuid::new_v4();
            let h = start(vec![spawn_sh("exit 0", id)], id);
            assert_eq!(h.outcome_rx.await.unwrap(), TerminalOutcome::Completed);
            h.relay_done.cancel();
            let status = h.monitor.closed().await;
            assert!(!status.cancelled);
            assert!(status.error.is_none());
        }

        #[tokio::test]
        async fn reports_terminal_failure() {
            let id = Uuid::new_v4();
            let h = start(vec![spawn_sh("echo nope >&2; exit 2", id)], id);
            match h.outcome_rx.await.unwrap() {
                TerminalOutcome::Failed(outcome) => {
                    assert_eq!(outcome.code, Some(2));
                    assert!(outcome.stderr_tail.contains("nope"));
                }
                other => panic!("unexpected outcome {other:?}"),
            }
            h.relay_done.cancel();
            let status = h.monitor.closed().await;
            assert!(status.error.is_some());
        }

        #[tokio::test]
        async fn upstream_failure_fails_the_session() {
            let id = Uuid::new_v4();
            let upstream = spawn_sh("exit 1", id);
            let terminal = spawn_sh("sleep 0.2; exit 0", id);
            let h = start(vec![upstream, terminal], id);
            assert!(matches!(h.outcome_rx.await.unwrap(), TerminalOutcome::Failed(_)));
            h.relay_done.cancel();
            h.monitor.closed().await;
        }

        #[tokio::test]
        async fn upstream_failure_wins_over_terminal_failure() {
            let id = Uuid::new_v4();
            let upstream = spawn_sh("echo 'ERROR: Video unavailable' >&2; exit 1", id);
            let terminal = spawn_sh("sleep 0.1; echo 'pipe:0: Invalid data' >&2; exit 1", id);
            let h = start(vec![upstream, terminal], id);
            match h.outcome_rx.await.unwrap() {
                TerminalOutcome::Failed(outcome) => {
                    assert!(outcome.stderr_tail.contains("Video unavailable"));
                }
                other => panic!("unexpected outcome {other:?}"),
            }
            h.relay_done.cancel();
            h.monitor.closed().await;
        }

        #[tokio::test]
        async fn lingering_upstream_is_killed_not_failed() {
            let id = Uuid::new_v4();
            let upstream = spawn_sh("exec sleep 30", id);
            let terminal = spawn_sh("exit 0", id);
            let h = start(vec![upstream, terminal], id);
            let outcome = tokio::time::timeout(Duration::from_secs(5), h.outcome_rx)
                .await
                .unwrap()
                .unwrap();
            assert_eq!(outcome, TerminalOutcome::Completed);
            h.relay_done.cancel();
            h.monitor.closed().await;
        }

        #[tokio::test]
        async fn cancellation_kills_everything() {
            let id = Uuid::new_v4();
            let upstream = spawn_sh("exec sleep 30", id);
            let terminal = spawn_sh("exec sleep 30", id);
            let h = start(vec![upstream, terminal], id);

            h.cancel.cancel();
            let outcome = tokio::time::timeout(Duration::from_secs(5), h.outcome_rx)
                .await
                .unwrap()
                .unwrap();
            assert_eq!(outcome, TerminalOutcome::Cancelled);

            let status = tokio::time::timeout(Duration::from_secs(5), h.monitor.closed())
                .await
                .unwrap();
            assert!(status.cancelled);
            assert_eq!(status.state, SessionState::Closed);
        }
    }
}
