/// Run record: one JSON document per evaluated instance, next to its log.
///
/// Written with the temp-file-then-rename pattern so a reader never sees a
/// partial record.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::supervisor::{EndReason, RunOutcome, RunReport};

/// What happened to one problem instance.
#[derive(Debug, Clone, Serialize)]
pub struct RunRecord {
    pub instance_id: String,
    pub problem_id: usize,
    pub repo: String,
    pub base_commit: String,
    pub outcome: RunOutcome,
    pub end: EndReason,
    pub exit_code: Option<i32>,
    pub pid: Option<u32>,
    pub lines: u64,
    pub duration_secs: f64,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub log_path: PathBuf,
    pub diff_path: Option<PathBuf>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

/// Identity of the instance a record describes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instance {
    pub instance_id: String,
    pub problem_id: usize,
    pub repo: String,
    pub base_commit: String,
}

impl RunRecord {
    /// Combine an instance with the supervisor's report.
    pub fn from_report(
        instance: Instance,
        report: &RunReport,
        started_at: DateTime<Utc>,
        diff_path: Option<PathBuf>,
    ) -> Self {
        let finished_at = started_at
            + chrono::Duration::from_std(report.duration).unwrap_or(chrono::Duration::zero());
        Self {
            instance_id: instance.instance_id,
            problem_id: instance.problem_id,
            repo: instance.repo,
            base_commit: instance.base_commit,
            outcome: report.outcome,
            end: report.end,
            exit_code: report.exit_code,
            pid: report.pid,
            lines: report.lines,
            duration_secs: report.duration.as_secs_f64(),
            started_at,
            finished_at,
            log_path: report.log_path.clone(),
            diff_path,
            warnings: report.warnings.clone(),
        }
    }

    /// Atomically write the record as pretty JSON to `path`.
    pub fn write(&self, path: &Path) -> Result<(), RecordError> {
        let json =
            serde_json::to_string_pretty(self).map_err(|e| RecordError::Serialize { source: e })?;

        let dir = path.parent().unwrap_or(Path::new("."));
        let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(|e| RecordError::Write {
            path: dir.to_path_buf(),
            source: e,
        })?;
        tmp.write_all(json.as_bytes())
            .and_then(|_| tmp.as_file().sync_all())
            .map_err(|e| RecordError::Write {
                path: tmp.path().to_path_buf(),
                source: e,
            })?;
        tmp.persist(path).map_err(|e| RecordError::Persist {
            path: path.to_path_buf(),
            source: e.error,
        })?;

        tracing::debug!(path = %path.display(), "run record written");
        Ok(())
    }
}

#[derive(Debug)]
pub enum RecordError {
    Serialize {
        source: serde_json::Error,
    },
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    Persist {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl std::fmt::Display for RecordError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RecordError::Serialize { source } => write!(f, "failed to serialize run record: {source}"),
            RecordError::Write { path, source } => {
                write!(f, "failed to write temp record in {}: {source}", path.display())
            }
            RecordError::Persist { path, source } => {
                write!(f, "failed to persist run record {}: {source}", path.display())
            }
        }
    }
}

impl std::error::Error for RecordError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RecordError::Serialize { source } => Some(source),
            RecordError::Write { source, .. } => Some(source),
            RecordError::Persist { source, .. } => Some(source),
        }
    }
}
