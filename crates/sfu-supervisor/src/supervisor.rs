//! Worker process supervision.
//!
//! The supervisor launches every configured worker binary, watches for
//! exits, and relaunches a worker that exits with [`RESTART_EXIT_CODE`]
//! while the supervisor is running. Workers use that code to ask for a
//! clean restart after an unrecoverable fault, such as losing the broker
//! connection for longer than the reconnect policy allows.
//!
//! On shutdown every worker receives SIGTERM and gets a configurable
//! grace period to drain before SIGKILL.

use crate::config::SupervisorConfig;
use crate::errors::SupervisorError;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::collections::HashMap;
use std::fmt;
use std::process::ExitStatus;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Exit code that marks an unrecoverable worker fault and triggers a restart.
pub const RESTART_EXIT_CODE: i32 = 1;

/// Buffer size for supervisor control messages.
const SUPERVISOR_CHANNEL_BUFFER: usize = 16;

/// Supervisor lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    /// Workers are supervised and restarted on failure.
    Running,
    /// Shutdown has begun, exits no longer trigger restarts.
    Stopping,
    /// All workers are gone.
    Stopped,
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunState::Running => write!(f, "running"),
            RunState::Stopping => write!(f, "stopping"),
            RunState::Stopped => write!(f, "stopped"),
        }
    }
}

/// Snapshot of the supervised process set.
#[derive(Debug, Clone)]
pub struct SupervisorStatus {
    pub state: RunState,
    /// Total restarts performed since launch.
    pub restarts: u32,
    pub workers: Vec<WorkerInfo>,
}

/// A single tracked worker process.
#[derive(Debug, Clone)]
pub struct WorkerInfo {
    pub pid: u32,
    pub path: String,
}

/// Messages handled by the supervision loop.
enum SupervisorMessage {
    GetStatus {
        respond_to: oneshot::Sender<SupervisorStatus>,
    },
}

/// Exit notification from a worker monitor task.
struct WorkerExit {
    pid: u32,
    path: String,
    status: std::io::Result<ExitStatus>,
}

/// Handle for interacting with a running supervisor.
#[derive(Clone)]
pub struct SupervisorHandle {
    sender: mpsc::Sender<SupervisorMessage>,
    cancel: CancellationToken,
}

impl SupervisorHandle {
    /// Launch all configured workers and the supervision loop.
    ///
    /// If any worker fails to spawn, the ones already launched are drained
    /// before the error is returned.
    pub async fn spawn(
        config: &SupervisorConfig,
    ) -> Result<(Self, JoinHandle<()>), SupervisorError> {
        let (sender, receiver) = mpsc::channel(SUPERVISOR_CHANNEL_BUFFER);
        let (exit_tx, mut exit_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        let mut supervisor = ProcessSupervisor {
            grace: config.worker_grace(),
            state: RunState::Running,
            workers: HashMap::new(),
            restarts: 0,
            exit_tx,
        };

        for path in &config.worker_paths {
            if let Err(e) = supervisor.spawn_worker(path) {
                supervisor.drain(&mut exit_rx).await;
                return Err(e);
            }
        }

        let task = tokio::spawn(supervisor.run(receiver, exit_rx, cancel.clone()));

        Ok((Self { sender, cancel }, task))
    }

    /// Current state and tracked workers, or `None` once the loop has exited.
    pub async fn status(&self) -> Option<SupervisorStatus> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(SupervisorMessage::GetStatus { respond_to: tx })
            .await
            .ok()?;
        rx.await.ok()
    }

    /// Request shutdown. The loop drains all workers and then exits.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Create a child cancellation token tied to this supervisor.
    pub fn child_token(&self) -> CancellationToken {
        self.cancel.child_token()
    }
}

/// The supervision loop state. Owned by a single task.
struct ProcessSupervisor {
    grace: Duration,
    state: RunState,
    /// Tracked workers by pid.
    workers: HashMap<u32, String>,
    restarts: u32,
    exit_tx: mpsc::UnboundedSender<WorkerExit>,
}

impl ProcessSupervisor {
    async fn run(
        mut self,
        mut messages: mpsc::Receiver<SupervisorMessage>,
        mut exits: mpsc::UnboundedReceiver<WorkerExit>,
        cancel: CancellationToken,
    ) {
        info!(
            target: "sfu.supervisor",
            workers = self.workers.len(),
            "Process supervisor running"
        );

        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                maybe_exit = exits.recv() => {
                    let Some(exit) = maybe_exit else { break };
                    self.handle_exit(&exit);
                }
                maybe_message = messages.recv() => {
                    // A closed control channel means every handle is gone,
                    // which is treated the same as a shutdown request.
                    let Some(message) = maybe_message else { break };
                    match message {
                        SupervisorMessage::GetStatus { respond_to } => {
                            let _ = respond_to.send(self.status());
                        }
                    }
                }
            }
        }

        self.drain(&mut exits).await;
    }

    /// Launch one worker and a monitor task that reports its exit.
    fn spawn_worker(&mut self, path: &str) -> Result<(), SupervisorError> {
        let mut child = Command::new(path)
            .spawn()
            .map_err(|source| SupervisorError::Spawn {
                path: path.to_string(),
                source,
            })?;

        let Some(pid) = child.id() else {
            return Err(SupervisorError::Spawn {
                path: path.to_string(),
                source: std::io::Error::other("worker exited before its pid could be read"),
            });
        };

        self.workers.insert(pid, path.to_string());
        info!(target: "sfu.supervisor", pid, path, "Worker started");

        let exit_tx = self.exit_tx.clone();
        let path = path.to_string();
        tokio::spawn(async move {
            let status = child.wait().await;
            let _ = exit_tx.send(WorkerExit { pid, path, status });
        });

        Ok(())
    }

    /// React to a worker exit while running.
    ///
    /// Only exits with [`RESTART_EXIT_CODE`] are restarted. Any other exit,
    /// including signal deaths, leaves the worker down: those point at
    /// problems a blind relaunch would only repeat.
    fn handle_exit(&mut self, exit: &WorkerExit) {
        let Some(path) = self.workers.remove(&exit.pid) else {
            debug!(
                target: "sfu.supervisor",
                pid = exit.pid,
                path = %exit.path,
                "Exit event for untracked worker"
            );
            return;
        };

        let code = match &exit.status {
            Ok(status) => status.code(),
            Err(e) => {
                warn!(
                    target: "sfu.supervisor",
                    pid = exit.pid,
                    error = %e,
                    "Could not read worker exit status"
                );
                None
            }
        };

        if self.state == RunState::Running && code == Some(RESTART_EXIT_CODE) {
            error!(
                target: "sfu.supervisor",
                pid = exit.pid,
                path = %path,
                code = RESTART_EXIT_CODE,
                "Worker exited with restart code, relaunching"
            );
            self.restarts = self.restarts.saturating_add(1);
            if let Err(e) = self.spawn_worker(&path) {
                error!(
                    target: "sfu.supervisor",
                    path = %path,
                    error = %e,
                    "Failed to relaunch worker"
                );
            }
        } else {
            info!(
                target: "sfu.supervisor",
                pid = exit.pid,
                path = %path,
                code = ?code,
                "Worker exited without restart"
            );
        }
    }

    /// SIGTERM every worker, wait out the grace period, SIGKILL stragglers.
    async fn drain(&mut self, exits: &mut mpsc::UnboundedReceiver<WorkerExit>) {
        self.state = RunState::Stopping;

        if !self.workers.is_empty() {
            info!(
                target: "sfu.supervisor",
                count = self.workers.len(),
                grace_ms = self.grace.as_millis() as u64,
                "Draining workers"
            );

            for (&pid, path) in &self.workers {
                debug!(target: "sfu.supervisor", pid, path = %path, "Sending SIGTERM");
                deliver_signal(pid, Signal::SIGTERM);
            }

            let deadline = Instant::now() + self.grace;
            while !self.workers.is_empty() {
                tokio::select! {
                    maybe_exit = exits.recv() => {
                        let Some(exit) = maybe_exit else { break };
                        if self.workers.remove(&exit.pid).is_some() {
                            debug!(
                                target: "sfu.supervisor",
                                pid = exit.pid,
                                path = %exit.path,
                                "Worker drained"
                            );
                        }
                    }
                    () = tokio::time::sleep_until(deadline) => {
                        for (&pid, path) in &self.workers {
                            warn!(
                                target: "sfu.supervisor",
                                pid,
                                path = %path,
                                "Worker did not exit within grace period, killing"
                            );
                            deliver_signal(pid, Signal::SIGKILL);
                        }
                        break;
                    }
                }
            }
        }

        self.state = RunState::Stopped;
        info!(target: "sfu.supervisor", "Process supervisor stopped");
    }

    fn status(&self) -> SupervisorStatus {
        let mut workers: Vec<WorkerInfo> = self
            .workers
            .iter()
            .map(|(&pid, path)| WorkerInfo {
                pid,
                path: path.clone(),
            })
            .collect();
        workers.sort_by_key(|worker| worker.pid);

        SupervisorStatus {
            state: self.state,
            restarts: self.restarts,
            workers,
        }
    }
}

/// Send a signal to a worker, logging delivery failures.
///
/// A failure here usually means the process is already gone.
fn deliver_signal(pid: u32, sig: Signal) {
    #[allow(clippy::cast_possible_wrap)]
    let raw = pid as i32;
    if let Err(e) = signal::kill(Pid::from_raw(raw), sig) {
        debug!(
            target: "sfu.supervisor",
            pid,
            signal = %sig,
            error = %e,
            "Signal delivery failed"
        );
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn bare_supervisor() -> (ProcessSupervisor, mpsc::UnboundedReceiver<WorkerExit>) {
        let (exit_tx, exit_rx) = mpsc::unbounded_channel();
        (
            ProcessSupervisor {
                grace: Duration::from_millis(100),
                state: RunState::Running,
                workers: HashMap::new(),
                restarts: 0,
                exit_tx,
            },
            exit_rx,
        )
    }

    #[test]
    fn test_run_state_display() {
        assert_eq!(RunState::Running.to_string(), "running");
        assert_eq!(RunState::Stopping.to_string(), "stopping");
        assert_eq!(RunState::Stopped.to_string(), "stopped");
    }

    #[tokio::test]
    async fn test_spawn_worker_reports_missing_binary() {
        let (mut supervisor, _exit_rx) = bare_supervisor();

        let result = supervisor.spawn_worker("/definitely/not/a/real/binary");

        assert!(matches!(
            result,
            Err(SupervisorError::Spawn { path, .. }) if path == "/definitely/not/a/real/binary"
        ));
        assert!(supervisor.workers.is_empty());
    }

    #[tokio::test]
    async fn test_status_snapshot_sorts_workers_by_pid() {
        let (mut supervisor, _exit_rx) = bare_supervisor();
        supervisor.workers.insert(42, "b".to_string());
        supervisor.workers.insert(7, "a".to_string());

        let status = supervisor.status();

        assert_eq!(status.state, RunState::Running);
        assert_eq!(status.restarts, 0);
        let pids: Vec<u32> = status.workers.iter().map(|w| w.pid).collect();
        assert_eq!(pids, vec![7, 42]);
    }

    #[tokio::test]
    async fn test_exit_without_restart_code_is_not_relaunched() {
        let (mut supervisor, mut exit_rx) = bare_supervisor();
        supervisor
            .spawn_worker("/bin/true")
            .expect("spawning /bin/true should succeed");

        let exit = exit_rx.recv().await.expect("monitor should report exit");
        assert_eq!(exit.path, "/bin/true");
        supervisor.handle_exit(&exit);

        assert_eq!(supervisor.restarts, 0);
        assert!(supervisor.workers.is_empty());
    }

    #[tokio::test]
    async fn test_exit_with_restart_code_is_relaunched() {
        let (mut supervisor, mut exit_rx) = bare_supervisor();
        supervisor
            .spawn_worker("/bin/false")
            .expect("spawning /bin/false should succeed");

        let exit = exit_rx.recv().await.expect("monitor should report exit");
        supervisor.handle_exit(&exit);

        assert_eq!(supervisor.restarts, 1);
        assert_eq!(supervisor.workers.len(), 1);

        // Let the relaunched /bin/false run to completion as well.
        let exit = exit_rx.recv().await.expect("monitor should report exit");
        supervisor.state = RunState::Stopping;
        supervisor.handle_exit(&exit);
        assert_eq!(supervisor.restarts, 1);
    }
}
