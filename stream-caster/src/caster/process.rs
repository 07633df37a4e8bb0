//! Supervised external processes.

use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::process::{Child, ChildStderr};
use tracing::{debug, info, warn};

use super::command::CommandLine;
use crate::{Error, Result};

/// How a process ended when it was terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminateOutcome {
    /// The process had already exited before terminate was requested.
    AlreadyExited(ExitStatus),
    /// The process exited within the grace period.
    Graceful(ExitStatus),
    /// The grace period elapsed and the process was killed.
    Killed,
}

/// One spawned external process.
#[derive(Debug)]
pub struct ProcessHandle {
    label: String,
    command: CommandLine,
    pid: Option<u32>,
    child: Child,
    stderr: Option<ChildStderr>,
}

impl ProcessHandle {
    /// Spawn `command` with its diagnostic stream piped.
    pub fn spawn(label: impl Into<String>, command: CommandLine) -> Result<Self> {
        let label = label.into();

        let mut child = process_utils::supervised_command(command.program())
            .args(command.args())
            .env("LC_ALL", "C")
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                Error::ProcessFailure(format!("Failed to spawn {}: {}", command.program(), e))
            })?;

        let pid = child.id();
        let stderr = child.stderr.take();

        info!(process = %label, pid = ?pid, command = %command, "Spawned process");

        Ok(Self {
            label,
            command,
            pid,
            child,
            stderr,
        })
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn command(&self) -> &CommandLine {
        &self.command
    }

    /// Take the diagnostic stream for a monitor. Returns `None` after the first call.
    pub fn take_stderr(&mut self) -> Option<ChildStderr> {
        self.stderr.take()
    }

    /// Whether the process has not exited yet.
    pub fn is_running(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    /// Terminate gracefully, force-killing after `grace`.
    ///
    /// Never fails: a grace timeout or signal error is logged and the kill
    /// proceeds.
    pub async fn terminate(mut self, grace: Duration) -> TerminateOutcome {
        if let Ok(Some(status)) = self.child.try_wait() {
            debug!(process = %self.label, %status, "Process already exited");
            return TerminateOutcome::AlreadyExited(status);
        }

        let signalled = match self.pid {
            Some(pid) => match process_utils::request_terminate(pid) {
                Ok(()) => true,
                Err(e) => {
                    debug!(process = %self.label, error = %e, "Graceful terminate unavailable");
                    false
                }
            },
            None => false,
        };

        if signalled {
            match tokio::time::timeout(grace, self.child.wait()).await {
                Ok(Ok(status)) => {
                    info!(process = %self.label, %status, "Process terminated");
                    return TerminateOutcome::Graceful(status);
                }
                Ok(Err(e)) => {
                    warn!(process = %self.label, error = %e, "Error waiting for process");
                }
                Err(_) => {
                    warn!(
                        process = %self.label,
                        grace_secs = grace.as_secs_f64(),
                        "Process did not terminate in time, forcing kill"
                    );
                }
            }
        }

        if let Err(e) = self.child.kill().await {
            warn!(process = %self.label, error = %e, "Failed to kill process");
        }
        TerminateOutcome::Killed
    }
}

/// Terminate every handle concurrently with the same grace period.
pub async fn terminate_all(handles: Vec<ProcessHandle>, grace: Duration) -> Vec<TerminateOutcome> {
    futures::future::join_all(handles.into_iter().map(|h| h.terminate(grace))).await
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::time::Instant;

    fn shell(script: &str) -> CommandLine {
        CommandLine::new("sh", ["-c", script])
    }

    #[tokio::test]
    async fn test_graceful_terminate() {
        let handle = ProcessHandle::spawn("sleeper", shell("exec sleep 30")).unwrap();
        assert!(handle.pid().is_some());

        let outcome = handle.terminate(Duration::from_secs(5)).await;
        assert!(matches!(outcome, TerminateOutcome::Graceful(_)));
    }

    #[tokio::test]
    async fn test_kill_after_grace_when_term_ignored() {
        let handle =
            ProcessHandle::spawn("stubborn", shell("trap '' TERM; while :; do sleep 1; done"))
                .unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        let started = Instant::now();
        let outcome = handle.terminate(Duration::from_millis(300)).await;

        assert_eq!(outcome, TerminateOutcome::Killed);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_terminate_after_exit() {
        let mut handle = ProcessHandle::spawn("short", shell("exit 0")).unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(!handle.is_running());

        let outcome = handle.terminate(Duration::from_secs(1)).await;
        assert!(matches!(outcome, TerminateOutcome::AlreadyExited(_)));
    }

    #[tokio::test]
    async fn test_spawn_missing_binary_fails() {
        let err = ProcessHandle::spawn(
            "missing",
            CommandLine::new("/nonexistent/transmit-binary", ["-version"]),
        )
        .unwrap_err();
        assert!(matches!(err, Error::ProcessFailure(_)));
    }

    #[tokio::test]
    async fn test_stderr_taken_once() {
        let mut handle = ProcessHandle::spawn("echo", shell("echo hi >&2")).unwrap();
        assert!(handle.take_stderr().is_some());
        assert!(handle.take_stderr().is_none());
        handle.terminate(Duration::from_secs(1)).await;
    }
}
