//! Sentinel detection over agent output lines.
//!
//! The agent ends a turn with tag-like blocks. A follow-up question means the
//! run cannot continue unattended; an attempted completion means it finished.

/// Markers that signal the agent considers the task complete.
pub const DEFAULT_SUCCESS_MARKERS: &[&str] = &["<attempt_completion>", "</attempt_completion>"];

/// Markers that signal the agent is waiting on a human answer.
pub const DEFAULT_FAILURE_MARKERS: &[&str] =
    &["<ask_followup_question>", "</ask_followup_question>"];

/// Classification of a single output line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    None,
    Success,
    Failure,
}

/// Case-sensitive substring scanner for success and failure markers.
#[derive(Debug, Clone)]
pub struct SentinelScanner {
    success_markers: Vec<String>,
    failure_markers: Vec<String>,
    failure_seen: bool,
}

impl SentinelScanner {
    pub fn new(success_markers: Vec<String>, failure_markers: Vec<String>) -> Self {
        Self {
            success_markers,
            failure_markers,
            failure_seen: false,
        }
    }

    /// Classify one line. Failure wins when both kinds of marker are present.
    pub fn classify(&self, line: &str) -> Signal {
        if self.failure_markers.iter().any(|m| line.contains(m.as_str())) {
            Signal::Failure
        } else if self.success_markers.iter().any(|m| line.contains(m.as_str())) {
            Signal::Success
        } else {
            Signal::None
        }
    }

    /// Classify and remember. A success marker after a recorded failure is
    /// reported as `Signal::None`.
    pub fn observe(&mut self, line: &str) -> Signal {
        match self.classify(line) {
            Signal::Failure => {
                self.failure_seen = true;
                Signal::Failure
            }
            Signal::Success if self.failure_seen => Signal::None,
            other => other,
        }
    }
}

impl Default for SentinelScanner {
    fn default() -> Self {
        Self::new(
            DEFAULT_SUCCESS_MARKERS.iter().map(|m| m.to_string()).collect(),
            DEFAULT_FAILURE_MARKERS.iter().map(|m| m.to_string()).collect(),
        )
    }
}
