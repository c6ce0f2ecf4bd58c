//! Streaming supervision of a single agent run.
//!
//! Spawns the agent, reads its stdout line by line under an idle budget,
//! logs and mirrors every line, stops at the first sentinel, and tears the
//! process tree down on every terminal path.

pub mod idle;
pub mod log_sink;
pub mod process;
pub mod reader;
pub mod sentinel;
pub mod terminate;

use serde::Serialize;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::time::Duration;
use tokio::time::Instant;

pub use process::AgentCommand;

use log_sink::{LogSink, LogSinkError};
use process::ProcessHandle;
use reader::ReadEvent;
use sentinel::{SentinelScanner, Signal, DEFAULT_FAILURE_MARKERS, DEFAULT_SUCCESS_MARKERS};
use terminate::Terminator;

/// Runtime settings for one supervised run.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Maximum silence on stdout before the run is cut off.
    pub idle_budget: Duration,
    /// `pkill -f` pattern for descendants that escape the process group.
    pub sweep_pattern: Option<String>,
    /// Echo every line to stdout as it is logged.
    pub mirror_console: bool,
    pub success_markers: Vec<String>,
    pub failure_markers: Vec<String>,
    /// Bound on waiting for a killed child to be reaped.
    pub reap_timeout: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            idle_budget: Duration::from_secs(250),
            sweep_pattern: Some(".vscode-test".to_string()),
            mirror_console: true,
            success_markers: DEFAULT_SUCCESS_MARKERS.iter().map(|m| m.to_string()).collect(),
            failure_markers: DEFAULT_FAILURE_MARKERS.iter().map(|m| m.to_string()).collect(),
            reap_timeout: Duration::from_secs(10),
        }
    }
}

/// Terminal classification returned to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Success,
    Failure,
    TimedOut,
    SpawnError,
}

impl RunOutcome {
    pub fn is_success(self) -> bool {
        self == RunOutcome::Success
    }
}

/// Why a run ended. Finer grained than [`RunOutcome`]; several reasons
/// collapse to `Failure`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    SuccessSentinel,
    FailureSentinel,
    IdleTimeout,
    /// Output ended without either sentinel: not an explicit failure, but
    /// no completion was confirmed.
    ClosedWithoutSentinel,
    StreamError,
    LogWriteFailed,
    Interrupted,
    SpawnFailed,
}

impl EndReason {
    pub fn outcome(self) -> RunOutcome {
        match self {
            EndReason::SuccessSentinel => RunOutcome::Success,
            EndReason::IdleTimeout => RunOutcome::TimedOut,
            EndReason::SpawnFailed => RunOutcome::SpawnError,
            EndReason::FailureSentinel
            | EndReason::ClosedWithoutSentinel
            | EndReason::StreamError
            | EndReason::LogWriteFailed
            | EndReason::Interrupted => RunOutcome::Failure,
        }
    }

    /// Whether the end came from the stream itself rather than a decision to
    /// stop the agent.
    fn is_natural_close(self) -> bool {
        matches!(
            self,
            EndReason::ClosedWithoutSentinel | EndReason::StreamError
        )
    }
}

/// State of one execution: timestamps and the write-once end reason.
#[derive(Debug)]
pub struct SupervisedRun {
    started_at: Instant,
    last_activity_at: Instant,
    idle_budget: Duration,
    end: Option<EndReason>,
}

impl SupervisedRun {
    pub fn new(idle_budget: Duration, started_at: Instant) -> Self {
        Self {
            started_at,
            last_activity_at: started_at,
            idle_budget,
            end: None,
        }
    }

    pub fn started_at(&self) -> Instant {
        self.started_at
    }

    pub fn last_activity_at(&self) -> Instant {
        self.last_activity_at
    }

    /// Idle budget left at `now`.
    pub fn remaining(&self, now: Instant) -> Duration {
        idle::remaining(now, self.last_activity_at, self.idle_budget)
    }

    /// Note output observed at `now`. Never moves backwards.
    pub fn record_activity(&mut self, now: Instant) {
        self.last_activity_at = self.last_activity_at.max(now);
    }

    /// Set the end reason. Only the first call has an effect.
    pub fn settle(&mut self, end: EndReason) -> bool {
        if let Some(existing) = self.end {
            tracing::debug!(?existing, ignored = ?end, "run already settled");
            return false;
        }
        self.end = Some(end);
        true
    }

    pub fn end(&self) -> Option<EndReason> {
        self.end
    }

    /// `None` while the run is still pending.
    #[allow(dead_code)]
    pub fn outcome(&self) -> Option<RunOutcome> {
        self.end.map(EndReason::outcome)
    }
}

/// Everything a caller needs after the run.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub outcome: RunOutcome,
    pub end: EndReason,
    /// Exit code of the agent (None if killed by signal or never spawned).
    pub exit_code: Option<i32>,
    pub pid: Option<u32>,
    /// Output lines recorded in the log.
    pub lines: u64,
    pub duration: Duration,
    pub log_path: PathBuf,
    /// Degraded-run warnings (log or console write problems).
    pub warnings: Vec<String>,
}

/// Errors that prevent a run from starting at all.
#[derive(Debug)]
pub enum SupervisorError {
    /// The run log could not be created; nothing was spawned.
    Log(LogSinkError),
}

impl std::fmt::Display for SupervisorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SupervisorError::Log(e) => write!(f, "cannot start supervised run: {e}"),
        }
    }
}

impl std::error::Error for SupervisorError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SupervisorError::Log(e) => Some(e),
        }
    }
}

/// Drives one agent process from spawn to a terminal outcome.
pub struct Supervisor {
    config: SupervisorConfig,
    terminator: Terminator,
}

impl Supervisor {
    pub fn new(config: SupervisorConfig) -> Self {
        let terminator = Terminator::new(config.sweep_pattern.clone(), config.reap_timeout);
        Self { config, terminator }
    }

    /// Run `command` to a terminal outcome, logging its output to `log_path`.
    #[allow(dead_code)]
    pub async fn supervise(
        &self,
        command: &AgentCommand,
        log_path: &Path,
    ) -> Result<RunReport, SupervisorError> {
        self.supervise_until(command, log_path, std::future::pending())
            .await
    }

    /// Like [`Supervisor::supervise`], but `cancel` resolving ends the run
    /// through the same termination path (`EndReason::Interrupted`).
    pub async fn supervise_until<F>(
        &self,
        command: &AgentCommand,
        log_path: &Path,
        cancel: F,
    ) -> Result<RunReport, SupervisorError>
    where
        F: Future<Output = ()>,
    {
        let mut sink =
            LogSink::open(log_path, self.config.mirror_console).map_err(SupervisorError::Log)?;
        let mut run = SupervisedRun::new(self.config.idle_budget, Instant::now());
        let mut warnings = Vec::new();

        let mut handle = match ProcessHandle::spawn(command) {
            Ok(handle) => handle,
            Err(e) => {
                tracing::error!(error = %e, argv = ?command.argv, "failed to spawn agent");
                if let Err(le) = sink.note(&format!("Error running agent: {e}")) {
                    warnings.push(le.to_string());
                }
                run.settle(EndReason::SpawnFailed);
                return Ok(self.finish(run, sink, None, warnings));
            }
        };

        let pid = handle.pid();
        tracing::info!(
            pid = ?pid,
            argv = ?command.argv,
            cwd = %command.working_dir.display(),
            idle_budget_secs = self.config.idle_budget.as_secs(),
            log = %log_path.display(),
            "agent subprocess started"
        );

        let mut scanner = SentinelScanner::new(
            self.config.success_markers.clone(),
            self.config.failure_markers.clone(),
        );
        tokio::pin!(cancel);

        let end = self
            .read_until_terminal(
                &mut run,
                &mut handle,
                &mut sink,
                &mut scanner,
                &mut warnings,
                cancel.as_mut(),
            )
            .await;
        run.settle(end);

        if end.is_natural_close() {
            self.finish_natural_close(&mut handle, &mut sink, &mut warnings)
                .await;
        } else {
            // The decision is made; record what is left, then tear down.
            if let Some(partial) = handle.take_partial() {
                if let Err(e) = sink.append(&partial) {
                    warnings.push(e.to_string());
                }
            }
            match end {
                EndReason::IdleTimeout => {
                    let note = format!(
                        "Timeout occurred: No output received for {} seconds.",
                        self.config.idle_budget.as_secs()
                    );
                    tracing::warn!(
                        pid = ?pid,
                        silent_secs = run.last_activity_at().elapsed().as_secs(),
                        "agent idle budget exhausted"
                    );
                    if let Err(e) = sink.note(&note) {
                        warnings.push(e.to_string());
                    }
                }
                EndReason::Interrupted => {
                    tracing::warn!(pid = ?pid, "run interrupted, terminating agent");
                    if let Err(e) = sink.note("Run interrupted by operator.") {
                        warnings.push(e.to_string());
                    }
                }
                _ => {}
            }
            self.terminator.terminate(&mut handle).await;
        }

        let exit_code = handle.exit_status().and_then(|s| s.code());
        let mut report = self.finish(run, sink, exit_code, warnings);
        report.pid = pid;
        Ok(report)
    }

    /// The single suspension loop: wait for a line within the remaining idle
    /// budget, log it, classify it. Returns as soon as the end is determined;
    /// nothing is read after that.
    async fn read_until_terminal<F>(
        &self,
        run: &mut SupervisedRun,
        handle: &mut ProcessHandle,
        sink: &mut LogSink,
        scanner: &mut SentinelScanner,
        warnings: &mut Vec<String>,
        mut cancel: Pin<&mut F>,
    ) -> EndReason
    where
        F: Future<Output = ()>,
    {
        loop {
            let remaining = run.remaining(Instant::now());
            if remaining.is_zero() {
                return EndReason::IdleTimeout;
            }

            let event = tokio::select! {
                event = handle.next_line(remaining) => event,
                _ = cancel.as_mut() => return EndReason::Interrupted,
            };

            if let Some(end) = self.on_event(event, run, sink, scanner, warnings) {
                return end;
            }
        }
    }

    /// Apply one read result. `Some` once the run's end is determined.
    fn on_event(
        &self,
        event: ReadEvent,
        run: &mut SupervisedRun,
        sink: &mut LogSink,
        scanner: &mut SentinelScanner,
        warnings: &mut Vec<String>,
    ) -> Option<EndReason> {
        match event {
            ReadEvent::Line(line) => {
                run.record_activity(Instant::now());
                if let Err(e) = sink.append(&line) {
                    tracing::error!(error = %e, "run log write failed, stopping run");
                    warnings.push(e.to_string());
                    return Some(EndReason::LogWriteFailed);
                }
                match scanner.observe(&line) {
                    Signal::Failure => {
                        tracing::info!("agent asked a follow-up question");
                        Some(EndReason::FailureSentinel)
                    }
                    Signal::Success => {
                        tracing::info!("agent reported completion");
                        Some(EndReason::SuccessSentinel)
                    }
                    Signal::None => None,
                }
            }
            ReadEvent::Timeout => Some(EndReason::IdleTimeout),
            ReadEvent::Closed => {
                tracing::debug!("agent stdout closed");
                Some(EndReason::ClosedWithoutSentinel)
            }
            ReadEvent::Error(e) => {
                tracing::warn!(error = %e, "agent stdout read failed");
                if let Err(le) = sink.note(&format!("Error reading agent output: {e}")) {
                    warnings.push(le.to_string());
                }
                Some(EndReason::StreamError)
            }
        }
    }

    /// Output ended on its own: reap the child while draining stderr, append
    /// the captured stderr, then tear down whatever the agent left running.
    async fn finish_natural_close(
        &self,
        handle: &mut ProcessHandle,
        sink: &mut LogSink,
        warnings: &mut Vec<String>,
    ) {
        let stderr = match handle.wait_for_exit_draining(self.config.idle_budget).await {
            Some(status) => {
                tracing::debug!(pid = ?handle.pid(), ?status, "agent exited");
                handle.drain_stderr(self.config.reap_timeout).await
            }
            None => {
                tracing::warn!(pid = ?handle.pid(), "agent closed its output but did not exit");
                handle.drain_stderr(Duration::ZERO).await
            }
        };
        if !stderr.trim().is_empty() {
            if let Err(e) = sink.append_raw(&stderr) {
                warnings.push(e.to_string());
            }
        }
        // Kills group members and sweeps orphans that outlived the agent.
        self.terminator.terminate(handle).await;
    }

    fn finish(
        &self,
        run: SupervisedRun,
        mut sink: LogSink,
        exit_code: Option<i32>,
        mut warnings: Vec<String>,
    ) -> RunReport {
        if let Err(e) = sink.close() {
            tracing::warn!(error = %e, "failed to close run log");
            warnings.push(e.to_string());
        }
        warnings.extend(sink.warnings().iter().cloned());

        // Every path settles before finishing.
        let end = run.end().unwrap_or(EndReason::ClosedWithoutSentinel);
        let report = RunReport {
            outcome: end.outcome(),
            end,
            exit_code,
            pid: None,
            lines: sink.lines(),
            duration: run.started_at().elapsed(),
            log_path: sink.path().to_path_buf(),
            warnings,
        };
        tracing::info!(
            outcome = ?report.outcome,
            end = ?report.end,
            exit_code = ?report.exit_code,
            lines = report.lines,
            duration_secs = report.duration.as_secs(),
            "supervised run finished"
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(idle_budget: Duration) -> SupervisorConfig {
        SupervisorConfig {
            idle_budget,
            sweep_pattern: None,
            mirror_console: false,
            reap_timeout: Duration::from_secs(5),
            ..Default::default()
        }
    }

    fn sh(script: &str) -> AgentCommand {
        AgentCommand::new(
            vec!["sh".to_string(), "-c".to_string(), script.to_string()],
            ".",
        )
    }

    fn log_lines(path: &Path) -> Vec<String> {
        std::fs::read_to_string(path)
            .unwrap()
            .lines()
            .map(str::to_string)
            .collect()
    }

    fn is_running(pid: u32) -> bool {
        match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
            Ok(stat) => !stat
                .rsplit_once(')')
                .map(|(_, rest)| rest.trim_start().starts_with('Z'))
                .unwrap_or(false),
            Err(_) => false,
        }
    }

    #[test]
    fn test_end_reason_collapses_to_outcome() {
        assert_eq!(EndReason::SuccessSentinel.outcome(), RunOutcome::Success);
        assert_eq!(EndReason::FailureSentinel.outcome(), RunOutcome::Failure);
        assert_eq!(EndReason::IdleTimeout.outcome(), RunOutcome::TimedOut);
        assert_eq!(
            EndReason::ClosedWithoutSentinel.outcome(),
            RunOutcome::Failure
        );
        assert_eq!(EndReason::StreamError.outcome(), RunOutcome::Failure);
        assert_eq!(EndReason::LogWriteFailed.outcome(), RunOutcome::Failure);
        assert_eq!(EndReason::Interrupted.outcome(), RunOutcome::Failure);
        assert_eq!(EndReason::SpawnFailed.outcome(), RunOutcome::SpawnError);
    }

    #[test]
    fn test_supervised_run_settles_once() {
        let mut run = SupervisedRun::new(Duration::from_secs(1), Instant::now());
        assert_eq!(run.outcome(), None);
        assert!(run.settle(EndReason::FailureSentinel));
        assert!(!run.settle(EndReason::SuccessSentinel));
        assert_eq!(run.outcome(), Some(RunOutcome::Failure));
    }

    #[test]
    fn test_activity_is_monotonic() {
        let start = Instant::now();
        let mut run = SupervisedRun::new(Duration::from_secs(10), start);
        assert_eq!(run.last_activity_at(), run.started_at());

        run.record_activity(start + Duration::from_secs(4));
        run.record_activity(start + Duration::from_secs(2));
        assert_eq!(run.last_activity_at(), start + Duration::from_secs(4));
        assert_eq!(
            run.remaining(start + Duration::from_secs(5)),
            Duration::from_secs(9)
        );
    }

    #[tokio::test]
    async fn test_scenario_a_completion_is_success() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("a.log");
        let supervisor = Supervisor::new(config(Duration::from_secs(10)));

        let report = supervisor
            .supervise(
                &sh("echo hello; echo '...<attempt_completion>...'; sleep 30"),
                &log,
            )
            .await
            .unwrap();

        assert_eq!(report.outcome, RunOutcome::Success);
        assert_eq!(report.end, EndReason::SuccessSentinel);
        assert_eq!(report.lines, 2);
        assert_eq!(
            log_lines(&log),
            vec!["hello", "...<attempt_completion>..."]
        );
        assert!(report.duration < Duration::from_secs(10));
        assert!(!is_running(report.pid.unwrap()));
    }

    #[tokio::test]
    async fn test_scenario_b_question_is_failure_and_stops_reading() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("b.log");
        let supervisor = Supervisor::new(config(Duration::from_secs(10)));

        let report = supervisor
            .supervise(
                &sh("echo '...<ask_followup_question>...'; echo more; echo '<attempt_completion>'; sleep 30"),
                &log,
            )
            .await
            .unwrap();

        assert_eq!(report.outcome, RunOutcome::Failure);
        assert_eq!(report.end, EndReason::FailureSentinel);
        assert_eq!(log_lines(&log), vec!["...<ask_followup_question>..."]);
        assert!(!is_running(report.pid.unwrap()));
    }

    #[tokio::test]
    async fn test_scenario_c_silence_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("c.log");
        let supervisor = Supervisor::new(config(Duration::from_secs(1)));

        let report = supervisor.supervise(&sh("sleep 30"), &log).await.unwrap();

        assert_eq!(report.outcome, RunOutcome::TimedOut);
        assert!(report.duration >= Duration::from_secs(1));
        assert!(report.duration < Duration::from_secs(15));
        assert!(!is_running(report.pid.unwrap()));
        let lines = log_lines(&log);
        assert_eq!(lines.len(), 1);
        assert!(lines[0].starts_with("Timeout occurred"));
    }

    #[tokio::test]
    async fn test_scenario_d_clean_exit_without_sentinel() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("d.log");
        let supervisor = Supervisor::new(config(Duration::from_secs(10)));

        let report = supervisor
            .supervise(&sh("echo one; echo two"), &log)
            .await
            .unwrap();

        assert_eq!(report.outcome, RunOutcome::Failure);
        assert_eq!(report.end, EndReason::ClosedWithoutSentinel);
        assert_eq!(report.exit_code, Some(0));
        assert_eq!(log_lines(&log), vec!["one", "two"]);
    }

    #[tokio::test]
    async fn test_failure_and_success_on_same_line_is_failure() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("both.log");
        let supervisor = Supervisor::new(config(Duration::from_secs(10)));

        let report = supervisor
            .supervise(
                &sh("echo '<attempt_completion></attempt_completion><ask_followup_question>'; sleep 30"),
                &log,
            )
            .await
            .unwrap();
        assert_eq!(report.outcome, RunOutcome::Failure);
    }

    #[tokio::test]
    async fn test_output_resets_idle_budget() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("steady.log");
        let supervisor = Supervisor::new(config(Duration::from_secs(1)));

        // 2s of total runtime, never silent for the full budget.
        let report = supervisor
            .supervise(
                &sh("for i in 1 2 3 4 5; do echo tick $i; sleep 0.4; done"),
                &log,
            )
            .await
            .unwrap();

        assert_eq!(report.end, EndReason::ClosedWithoutSentinel);
        assert_eq!(report.lines, 5);
        assert_eq!(log_lines(&log)[4], "tick 5");
    }

    #[tokio::test]
    async fn test_silence_after_output_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("stall.log");
        let supervisor = Supervisor::new(config(Duration::from_secs(1)));

        let report = supervisor
            .supervise(&sh("echo start; sleep 30"), &log)
            .await
            .unwrap();

        assert_eq!(report.outcome, RunOutcome::TimedOut);
        assert_eq!(report.lines, 1);
        assert_eq!(log_lines(&log)[0], "start");
    }

    #[tokio::test]
    async fn test_stderr_appended_after_natural_close() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("stderr.log");
        let supervisor = Supervisor::new(config(Duration::from_secs(10)));

        let report = supervisor
            .supervise(&sh("echo out; echo oops >&2; exit 2"), &log)
            .await
            .unwrap();

        assert_eq!(report.exit_code, Some(2));
        assert_eq!(report.lines, 1);
        assert_eq!(log_lines(&log), vec!["out", "oops"]);
    }

    #[tokio::test]
    async fn test_partial_line_logged_on_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("partial.log");
        let supervisor = Supervisor::new(config(Duration::from_secs(1)));

        let report = supervisor
            .supervise(&sh("printf 'half a li'; sleep 30"), &log)
            .await
            .unwrap();

        assert_eq!(report.outcome, RunOutcome::TimedOut);
        assert_eq!(log_lines(&log)[0], "half a li");
    }

    #[tokio::test]
    async fn test_spawn_error_writes_note_only() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("spawn.log");
        let supervisor = Supervisor::new(config(Duration::from_secs(1)));

        let report = supervisor
            .supervise(
                &AgentCommand::new(vec!["nonexistent-binary-xyz".to_string()], "."),
                &log,
            )
            .await
            .unwrap();

        assert_eq!(report.outcome, RunOutcome::SpawnError);
        assert_eq!(report.lines, 0);
        assert_eq!(report.pid, None);
        let lines = log_lines(&log);
        assert_eq!(lines.len(), 1);
        assert!(lines[0].starts_with("Error running agent"));
    }

    #[tokio::test]
    async fn test_empty_command_is_spawn_error() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = Supervisor::new(config(Duration::from_secs(1)));
        let report = supervisor
            .supervise(&AgentCommand::new(vec![], "."), &dir.path().join("e.log"))
            .await
            .unwrap();
        assert_eq!(report.outcome, RunOutcome::SpawnError);
    }

    #[tokio::test]
    async fn test_unopenable_log_is_setup_error() {
        let supervisor = Supervisor::new(config(Duration::from_secs(1)));
        let err = supervisor
            .supervise(&sh("echo hi"), Path::new("/dev/null/nope/run.log"))
            .await
            .unwrap_err();
        assert!(matches!(err, SupervisorError::Log(_)));
    }

    #[tokio::test]
    async fn test_cancel_terminates_through_same_path() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("cancel.log");
        let supervisor = Supervisor::new(config(Duration::from_secs(30)));

        let report = supervisor
            .supervise_until(
                &sh("echo working; sleep 30"),
                &log,
                tokio::time::sleep(Duration::from_millis(500)),
            )
            .await
            .unwrap();

        assert_eq!(report.end, EndReason::Interrupted);
        assert_eq!(report.outcome, RunOutcome::Failure);
        assert!(!is_running(report.pid.unwrap()));
        assert_eq!(log_lines(&log)[0], "working");
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_log_write_failure_still_terminates() {
        let supervisor = Supervisor::new(config(Duration::from_secs(10)));

        let report = supervisor
            .supervise(&sh("echo line; sleep 30"), Path::new("/dev/full"))
            .await
            .unwrap();

        assert_eq!(report.end, EndReason::LogWriteFailed);
        assert_eq!(report.outcome, RunOutcome::Failure);
        assert!(!report.warnings.is_empty());
        assert!(!is_running(report.pid.unwrap()));
    }

    #[tokio::test]
    async fn test_many_lines_logged_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("many.log");
        let supervisor = Supervisor::new(config(Duration::from_secs(10)));

        let report = supervisor
            .supervise(
                &sh("i=0; while [ $i -lt 500 ]; do echo line-$i; i=$((i+1)); done; echo '</attempt_completion>'"),
                &log,
            )
            .await
            .unwrap();

        assert_eq!(report.outcome, RunOutcome::Success);
        let lines = log_lines(&log);
        assert_eq!(lines.len(), 501);
        for (i, line) in lines.iter().take(500).enumerate() {
            assert_eq!(line, &format!("line-{i}"));
        }
    }

    #[tokio::test]
    async fn test_stderr_flood_after_stdout_close_is_logged() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("flood.log");
        let supervisor = Supervisor::new(config(Duration::from_secs(10)));

        let report = supervisor
            .supervise(
                &sh("echo out; exec 1>&-; head -c 200000 /dev/zero | tr '\\0' e >&2; exit 0"),
                &log,
            )
            .await
            .unwrap();

        assert_eq!(report.end, EndReason::ClosedWithoutSentinel);
        assert_eq!(report.exit_code, Some(0));
        assert!(report.duration < Duration::from_secs(5));
        let lines = log_lines(&log);
        assert_eq!(lines[0], "out");
        assert_eq!(lines[1].len(), 200000);
        assert!(lines[1].bytes().all(|b| b == b'e'));
    }

    #[tokio::test]
    async fn test_natural_close_kills_background_group_members() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("bg.log");
        let supervisor = Supervisor::new(config(Duration::from_secs(10)));

        let report = supervisor
            .supervise(&sh("sleep 60 >/dev/null 2>&1 & echo $!"), &log)
            .await
            .unwrap();

        assert_eq!(report.end, EndReason::ClosedWithoutSentinel);
        let background: u32 = log_lines(&log)[0].trim().parse().unwrap();
        let mut alive = is_running(background);
        for _ in 0..50 {
            if !alive {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
            alive = is_running(background);
        }
        assert!(!alive, "background sleep survived the run");
    }

    #[test]
    fn test_stream_error_is_noted_and_fails() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("err.log");
        let supervisor = Supervisor::new(config(Duration::from_secs(10)));
        let mut sink = LogSink::open(&log, false).unwrap();
        let mut run = SupervisedRun::new(Duration::from_secs(10), Instant::now());
        let mut scanner = SentinelScanner::default();
        let mut warnings = Vec::new();

        let line = ReadEvent::Line("working".to_string());
        assert_eq!(
            supervisor.on_event(line, &mut run, &mut sink, &mut scanner, &mut warnings),
            None
        );
        let error = ReadEvent::Error(std::io::Error::other("pipe broke"));
        let end = supervisor
            .on_event(error, &mut run, &mut sink, &mut scanner, &mut warnings)
            .unwrap();
        sink.close().unwrap();

        assert_eq!(end, EndReason::StreamError);
        assert!(end.is_natural_close());
        assert_eq!(end.outcome(), RunOutcome::Failure);
        assert!(warnings.is_empty());
        assert_eq!(
            log_lines(&log),
            vec!["working", "Error reading agent output: pipe broke"]
        );
    }
}
