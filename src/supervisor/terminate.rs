//! Best-effort teardown of the agent process tree.
//!
//! The agent is spawned as the leader of its own process group, so one
//! `killpg` reaches every descendant that stayed in the group. Some
//! descendants (editor test hosts, for instance) detach into their own
//! session; the optional pattern sweep catches those by command line.

use nix::errno::Errno;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use std::time::Duration;
use tokio::process::Command;

use super::process::ProcessHandle;

/// How long the `pkill` sweep may take before it is abandoned.
const SWEEP_TIMEOUT: Duration = Duration::from_secs(10);

/// Stops a supervised process and everything it left behind.
///
/// Never fails: every error is logged and swallowed, since termination only
/// happens once the run's outcome is already decided.
#[derive(Debug, Clone)]
pub struct Terminator {
    sweep_pattern: Option<String>,
    reap_timeout: Duration,
}

impl Terminator {
    pub fn new(sweep_pattern: Option<String>, reap_timeout: Duration) -> Self {
        Self {
            sweep_pattern,
            reap_timeout,
        }
    }

    /// Close the pipes, kill the process group, reap the child, then sweep
    /// for orphans. Safe to call more than once.
    pub async fn terminate(&self, handle: &mut ProcessHandle) {
        handle.close_streams();

        // Group members can outlive a leader that already exited and was
        // reaped; the pgid stays reserved while any of them remain.
        if let Some(pid) = handle.pid() {
            kill_group(pid);
        }

        match handle.try_reap() {
            Ok(Some(status)) => {
                tracing::debug!(pid = ?handle.pid(), ?status, "agent exited");
            }
            Ok(None) => self.kill_and_reap(handle).await,
            Err(e) => {
                tracing::warn!(error = %e, pid = ?handle.pid(), "failed to poll agent status");
                self.kill_and_reap(handle).await;
            }
        }

        if let Some(pattern) = &self.sweep_pattern {
            sweep(pattern).await;
        }
    }

    async fn kill_and_reap(&self, handle: &mut ProcessHandle) {
        if let Err(e) = handle.start_kill() {
            if e.kind() != std::io::ErrorKind::InvalidInput {
                tracing::warn!(error = %e, pid = ?handle.pid(), "failed to kill agent process");
            }
        }
        match handle.wait_for_exit(self.reap_timeout).await {
            Some(status) => tracing::info!(pid = ?handle.pid(), ?status, "agent process terminated"),
            None => tracing::warn!(
                pid = ?handle.pid(),
                timeout_secs = self.reap_timeout.as_secs(),
                "agent process not reaped after kill"
            ),
        }
    }
}

/// SIGKILL the process group led by `pid`.
fn kill_group(pid: u32) {
    let Ok(raw) = i32::try_from(pid) else {
        tracing::warn!(pid, "pid out of range for process group kill");
        return;
    };
    match killpg(Pid::from_raw(raw), Signal::SIGKILL) {
        Ok(()) => tracing::debug!(pgid = raw, "sent SIGKILL to process group"),
        Err(Errno::ESRCH) => tracing::debug!(pgid = raw, "process group already gone"),
        Err(e) => tracing::warn!(error = %e, pgid = raw, "failed to kill process group"),
    }
}

/// `pkill -f <pattern>`. Exit status 1 means nothing matched.
async fn sweep(pattern: &str) {
    let output = Command::new("pkill")
        .arg("-KILL")
        .arg("-f")
        .arg(pattern)
        .kill_on_drop(true)
        .output();
    match tokio::time::timeout(SWEEP_TIMEOUT, output).await {
        Ok(Ok(out)) => match out.status.code() {
            Some(0) => tracing::info!(pattern, "killed orphaned agent descendants"),
            Some(1) => tracing::debug!(pattern, "no orphaned agent descendants"),
            code => tracing::warn!(
                pattern,
                ?code,
                stderr = %String::from_utf8_lossy(&out.stderr).trim(),
                "orphan sweep failed"
            ),
        },
        Ok(Err(e)) => tracing::warn!(error = %e, pattern, "failed to run orphan sweep"),
        Err(_) => tracing::warn!(pattern, "orphan sweep timed out"),
    }
}
