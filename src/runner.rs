//! One evaluation: fetch a problem, prepare its checkout, supervise the agent,
//! and persist the log, diff and run record.

use chrono::Utc;
use fs2::FileExt;
use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::config::HarnessConfig;
use crate::data_dir::DataDir;
use crate::dataset::{DatasetClient, DatasetError, ProblemRow};
use crate::record::{Instance, RecordError, RunRecord};
use crate::supervisor::{AgentCommand, RunReport, Supervisor, SupervisorError};
use crate::workspace::{self, GitError};

const DATASET_TIMEOUT: Duration = Duration::from_secs(60);

/// Result of a completed evaluation.
#[derive(Debug)]
pub struct EvalSummary {
    pub instance_id: String,
    pub report: RunReport,
    pub record_path: PathBuf,
    pub diff_path: Option<PathBuf>,
}

#[derive(Debug)]
pub enum RunError {
    Layout {
        path: PathBuf,
        source: std::io::Error,
    },
    /// Another harness holds the data directory lock.
    Locked {
        path: PathBuf,
    },
    Dataset(DatasetError),
    Git(GitError),
    ProblemStatement {
        path: PathBuf,
        source: std::io::Error,
    },
    Supervisor(SupervisorError),
    Record(RecordError),
}

impl std::fmt::Display for RunError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunError::Layout { path, source } => {
                write!(f, "failed to prepare {}: {source}", path.display())
            }
            RunError::Locked { path } => write!(
                f,
                "another evaluation holds {}; refusing to share the checkout tree",
                path.display()
            ),
            RunError::Dataset(e) => write!(f, "{e}"),
            RunError::Git(e) => write!(f, "{e}"),
            RunError::ProblemStatement { path, source } => write!(
                f,
                "failed to write problem statement {}: {source}",
                path.display()
            ),
            RunError::Supervisor(e) => write!(f, "{e}"),
            RunError::Record(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for RunError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RunError::Layout { source, .. } => Some(source),
            RunError::Locked { .. } => None,
            RunError::Dataset(e) => Some(e),
            RunError::Git(e) => Some(e),
            RunError::ProblemStatement { source, .. } => Some(source),
            RunError::Supervisor(e) => Some(e),
            RunError::Record(e) => Some(e),
        }
    }
}

impl From<DatasetError> for RunError {
    fn from(e: DatasetError) -> Self {
        RunError::Dataset(e)
    }
}

impl From<GitError> for RunError {
    fn from(e: GitError) -> Self {
        RunError::Git(e)
    }
}

impl From<SupervisorError> for RunError {
    fn from(e: SupervisorError) -> Self {
        RunError::Supervisor(e)
    }
}

impl From<RecordError> for RunError {
    fn from(e: RecordError) -> Self {
        RunError::Record(e)
    }
}

/// Replace `{name}` placeholders in every argument.
fn build_args(args: &[String], vars: &HashMap<&str, String>) -> Vec<String> {
    args.iter()
        .map(|arg| {
            vars.iter().fold(arg.clone(), |acc, (name, value)| {
                acc.replace(&format!("{{{name}}}"), value)
            })
        })
        .collect()
}

/// The agent invocation for one problem row.
pub fn agent_command(
    config: &HarnessConfig,
    row: &ProblemRow,
    problem_id: usize,
    repo_dir_name: &str,
    repo_path: &Path,
) -> AgentCommand {
    let vars = HashMap::from([
        ("repo_dir", repo_dir_name.to_string()),
        ("repo_path", repo_path.to_string_lossy().into_owned()),
        ("instance_id", row.instance_id.clone()),
        ("problem_id", problem_id.to_string()),
    ]);
    let mut argv = vec![config.agent.command.clone()];
    argv.extend(build_args(&config.agent.args, &vars));
    AgentCommand::new(argv, &config.agent.working_dir)
}

/// Exclusive lock on the data directory, held for the whole evaluation.
fn lock_data_dir(data_dir: &DataDir) -> Result<std::fs::File, RunError> {
    let path = data_dir.lock();
    let file = std::fs::OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(&path)
        .map_err(|e| RunError::Layout {
            path: path.clone(),
            source: e,
        })?;
    file.try_lock_exclusive()
        .map_err(|_| RunError::Locked { path })?;
    Ok(file)
}

/// Evaluate problem `problem_id`.
///
/// Every setup step (layout, lock, dataset, clone, problem statement) fails
/// before the agent is spawned. Once supervision has started, the run always
/// produces a record, whatever the outcome.
pub async fn run_eval<F>(
    config: &HarnessConfig,
    problem_id: usize,
    cancel: F,
) -> Result<EvalSummary, RunError>
where
    F: Future<Output = ()>,
{
    let data_dir = DataDir::new(&config.storage.base_dir);
    data_dir.init().map_err(|e| RunError::Layout {
        path: data_dir.root().to_path_buf(),
        source: e,
    })?;
    let _lock = lock_data_dir(&data_dir)?;

    let client = DatasetClient::new(DATASET_TIMEOUT)?;
    let page = client.fetch(&config.dataset.url).await?;
    let row = page.select(problem_id)?.clone();
    tracing::info!(
        problem_id,
        instance_id = %row.instance_id,
        repo = %row.repo,
        "selected problem"
    );

    let repo_dir_name = row.repo_dir_name(problem_id);
    let repo_path = data_dir.repo_dir(&repo_dir_name);
    workspace::clone_repo_at_commit(
        &row.repo_url(&config.dataset.clone_base_url),
        &repo_path,
        &row.base_commit,
    )
    .await?;
    data_dir
        .write_problem_statement(&row, &repo_dir_name)
        .map_err(|e| RunError::ProblemStatement {
            path: data_dir.problem_statement_file(&repo_dir_name),
            source: e,
        })?;

    // The agent resolves paths from its own working directory.
    let absolute_repo = repo_path.canonicalize().unwrap_or_else(|_| repo_path.clone());
    let command = agent_command(config, &row, problem_id, &repo_dir_name, &absolute_repo);
    let log_path = data_dir.log_file(&row.instance_id);

    let started_at = Utc::now();
    let supervisor = Supervisor::new(config.supervisor_config());
    let mut report = supervisor
        .supervise_until(&command, &log_path, cancel)
        .await?;

    let mut diff_path = None;
    if report.outcome.is_success() {
        let path = data_dir.diff_file(&row.instance_id);
        match workspace::write_diff(&repo_path, &path).await {
            Ok(_) => diff_path = Some(path),
            Err(e) => {
                tracing::warn!(error = %e, "failed to capture diff");
                report.warnings.push(format!("diff capture failed: {e}"));
            }
        }
    }

    let instance = Instance {
        instance_id: row.instance_id.clone(),
        problem_id,
        repo: row.repo.clone(),
        base_commit: row.base_commit.clone(),
    };
    let record_path = data_dir.record_file(&row.instance_id);
    RunRecord::from_report(instance, &report, started_at, diff_path.clone()).write(&record_path)?;

    Ok(EvalSummary {
        instance_id: row.instance_id,
        report,
        record_path,
        diff_path,
    })
}
