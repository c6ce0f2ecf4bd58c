//! Ownership of the supervised child and its captured pipes.

use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::{AsyncReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::time::Instant;

use super::reader::{LineReader, ReadEvent};

/// Upper bound on buffered stderr; older bytes are dropped first.
const STDERR_CAP: usize = 1024 * 1024;

/// The invocation to supervise.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentCommand {
    /// Program followed by its arguments.
    pub argv: Vec<String>,
    pub working_dir: PathBuf,
}

impl AgentCommand {
    pub fn new(argv: Vec<String>, working_dir: impl Into<PathBuf>) -> Self {
        Self {
            argv,
            working_dir: working_dir.into(),
        }
    }
}

/// Buffered stderr, read alongside stdout so the pipe never fills up.
struct StderrBuffer {
    pipe: ChildStderr,
    buf: Vec<u8>,
    open: bool,
}

impl StderrBuffer {
    async fn read_chunk(&mut self) {
        let mut chunk = [0u8; 4096];
        match self.pipe.read(&mut chunk).await {
            Ok(0) => self.open = false,
            Ok(n) => {
                self.buf.extend_from_slice(&chunk[..n]);
                if self.buf.len() > STDERR_CAP {
                    let excess = self.buf.len() - STDERR_CAP;
                    self.buf.drain(..excess);
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to read agent stderr");
                self.open = false;
            }
        }
    }
}

/// Exclusive handle on a spawned agent process.
///
/// The child runs in its own process group (pgid == pid) so the whole tree
/// can be signalled at once.
pub struct ProcessHandle {
    child: Child,
    pid: Option<u32>,
    stdout: Option<LineReader<BufReader<ChildStdout>>>,
    stderr: Option<StderrBuffer>,
    exit_status: Option<ExitStatus>,
}

impl ProcessHandle {
    /// Spawn `command` with stdout and stderr captured and stdin closed.
    pub fn spawn(command: &AgentCommand) -> std::io::Result<Self> {
        let (program, args) = command.argv.split_first().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::InvalidInput, "empty command")
        })?;

        let mut child = Command::new(program)
            .args(args)
            .current_dir(&command.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0) // New process group for clean kill
            .kill_on_drop(true)
            .spawn()?;

        let stdout = child
            .stdout
            .take()
            .map(|out| LineReader::new(BufReader::new(out)));
        let stderr = child.stderr.take().map(|pipe| StderrBuffer {
            pipe,
            buf: Vec::new(),
            open: true,
        });
        let pid = child.id();

        Ok(Self {
            child,
            pid,
            stdout,
            stderr,
            exit_status: None,
        })
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn exit_status(&self) -> Option<ExitStatus> {
        self.exit_status
    }

    /// Wait at most `max_wait` for the next stdout line.
    ///
    /// Stderr is drained in the same wait so a chatty stderr cannot stall the
    /// child; stderr bytes do not count as a line.
    pub async fn next_line(&mut self, max_wait: Duration) -> ReadEvent {
        let deadline = Instant::now() + max_wait;
        let Some(stdout) = self.stdout.as_mut() else {
            return ReadEvent::Closed;
        };
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.stderr.as_mut() {
                Some(stderr) if stderr.open => {
                    tokio::select! {
                        event = stdout.next_line(remaining) => return event,
                        _ = stderr.read_chunk() => {}
                    }
                }
                _ => return stdout.next_line(remaining).await,
            }
        }
    }

    /// Unterminated stdout bytes read so far.
    pub fn take_partial(&mut self) -> Option<String> {
        self.stdout.as_mut().and_then(|s| s.take_partial())
    }

    /// Read the rest of stderr for at most `max_wait` and return everything
    /// captured, lossily decoded.
    pub async fn drain_stderr(&mut self, max_wait: Duration) -> String {
        let Some(stderr) = self.stderr.as_mut() else {
            return String::new();
        };
        let drain = async {
            while stderr.open {
                stderr.read_chunk().await;
            }
        };
        if tokio::time::timeout(max_wait, drain).await.is_err() {
            tracing::warn!(pid = ?self.pid, "stderr still open after agent exit, truncating");
        }
        let text = String::from_utf8_lossy(&stderr.buf).into_owned();
        stderr.buf.clear();
        text
    }

    /// Wait for natural exit for at most `max_wait`.
    pub async fn wait_for_exit(&mut self, max_wait: Duration) -> Option<ExitStatus> {
        if let Some(status) = self.exit_status {
            return Some(status);
        }
        match tokio::time::timeout(max_wait, self.child.wait()).await {
            Ok(Ok(status)) => {
                self.exit_status = Some(status);
                Some(status)
            }
            Ok(Err(e)) => {
                tracing::warn!(error = %e, pid = ?self.pid, "failed to wait for agent process");
                None
            }
            Err(_) => None,
        }
    }

    /// Wait for natural exit for at most `max_wait`, reading stderr in the
    /// meantime so a child blocked on a full stderr pipe can still finish.
    pub async fn wait_for_exit_draining(&mut self, max_wait: Duration) -> Option<ExitStatus> {
        if let Some(status) = self.exit_status {
            return Some(status);
        }
        let deadline = Instant::now() + max_wait;
        let waited = loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let wait = tokio::time::timeout(remaining, self.child.wait());
            match self.stderr.as_mut() {
                Some(stderr) if stderr.open => {
                    let exited = tokio::select! {
                        result = wait => Some(result),
                        _ = stderr.read_chunk() => None,
                    };
                    if let Some(result) = exited {
                        break result;
                    }
                }
                _ => break wait.await,
            }
        };
        match waited {
            Ok(Ok(status)) => {
                self.exit_status = Some(status);
                Some(status)
            }
            Ok(Err(e)) => {
                tracing::warn!(error = %e, pid = ?self.pid, "failed to wait for agent process");
                None
            }
            Err(_) => None,
        }
    }

    /// Drop both pipes so nothing blocks on them any longer.
    pub(super) fn close_streams(&mut self) {
        self.stdout = None;
        self.stderr = None;
    }

    /// Non-blocking check for exit; records the status when it has happened.
    pub(super) fn try_reap(&mut self) -> std::io::Result<Option<ExitStatus>> {
        if self.exit_status.is_none() {
            self.exit_status = self.child.try_wait()?;
        }
        Ok(self.exit_status)
    }

    pub(super) fn start_kill(&mut self) -> std::io::Result<()> {
        self.child.start_kill()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> AgentCommand {
        AgentCommand::new(
            vec!["sh".to_string(), "-c".to_string(), script.to_string()],
            ".",
        )
    }

    #[tokio::test]
    async fn test_spawn_empty_command_is_invalid_input() {
        let err = ProcessHandle::spawn(&AgentCommand::new(vec![], "."))
            .err()
            .unwrap();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidInput);
    }

    #[tokio::test]
    async fn test_spawn_missing_binary_fails() {
        let cmd = AgentCommand::new(vec!["nonexistent-binary-xyz".to_string()], ".");
        assert!(ProcessHandle::spawn(&cmd).is_err());
    }

    #[tokio::test]
    async fn test_runs_in_working_dir() {
        let dir = tempfile::tempdir().unwrap();
        let cmd = AgentCommand::new(
            vec!["sh".to_string(), "-c".to_string(), "pwd".to_string()],
            dir.path(),
        );
        let mut handle = ProcessHandle::spawn(&cmd).unwrap();
        let ReadEvent::Line(line) = handle.next_line(Duration::from_secs(5)).await else {
            panic!("expected pwd output");
        };
        let expected = dir.path().canonicalize().unwrap();
        assert_eq!(PathBuf::from(line).canonicalize().unwrap(), expected);
    }

    #[tokio::test]
    async fn test_stderr_is_drained_while_reading_stdout() {
        // 256 KiB of stderr would fill the pipe if nobody read it.
        let mut handle = ProcessHandle::spawn(&sh(
            "head -c 262144 /dev/zero | tr '\\0' 'e' >&2; echo after",
        ))
        .unwrap();

        let ReadEvent::Line(line) = handle.next_line(Duration::from_secs(10)).await else {
            panic!("expected stdout line after stderr burst");
        };
        assert_eq!(line, "after");
        assert!(matches!(
            handle.next_line(Duration::from_secs(10)).await,
            ReadEvent::Closed
        ));

        let status = handle.wait_for_exit(Duration::from_secs(5)).await.unwrap();
        assert!(status.success());
        let stderr = handle.drain_stderr(Duration::from_secs(5)).await;
        assert_eq!(stderr.len(), 262144);
    }

    #[tokio::test]
    async fn test_wait_for_exit_times_out_on_running_child() {
        let mut handle = ProcessHandle::spawn(&sh("sleep 5")).unwrap();
        assert!(handle
            .wait_for_exit(Duration::from_millis(50))
            .await
            .is_none());
        assert!(handle.exit_status().is_none());
        handle.start_kill().unwrap();
        assert!(handle.wait_for_exit(Duration::from_secs(5)).await.is_some());
        assert!(handle.exit_status().is_some());
    }

    #[tokio::test]
    async fn test_exit_wait_drains_stderr_after_stdout_closes() {
        // More stderr than a pipe holds, written after stdout is gone.
        let mut handle = ProcessHandle::spawn(&sh(
            "exec 1>&-; head -c 200000 /dev/zero | tr '\\0' 'e' >&2; exit 0",
        ))
        .unwrap();
        assert!(matches!(
            handle.next_line(Duration::from_secs(5)).await,
            ReadEvent::Closed
        ));

        let status = handle
            .wait_for_exit_draining(Duration::from_secs(5))
            .await
            .expect("child should exit once stderr is read");
        assert!(status.success());
        let stderr = handle.drain_stderr(Duration::from_secs(5)).await;
        assert_eq!(stderr.len(), 200000);
    }

    #[tokio::test]
    async fn test_exit_wait_draining_times_out() {
        let mut handle = ProcessHandle::spawn(&sh("echo noise >&2; sleep 5")).unwrap();
        assert!(handle
            .wait_for_exit_draining(Duration::from_millis(200))
            .await
            .is_none());
        assert_eq!(handle.drain_stderr(Duration::ZERO).await, "noise\n");
        handle.start_kill().unwrap();
        handle.wait_for_exit(Duration::from_secs(5)).await;
    }

    #[tokio::test]
    async fn test_closed_streams_report_closed() {
        let mut handle = ProcessHandle::spawn(&sh("echo hi; sleep 5")).unwrap();
        handle.close_streams();
        assert!(matches!(
            handle.next_line(Duration::from_millis(10)).await,
            ReadEvent::Closed
        ));
        assert_eq!(handle.drain_stderr(Duration::from_millis(10)).await, "");
        handle.start_kill().unwrap();
        handle.wait_for_exit(Duration::from_secs(5)).await;
    }
}
