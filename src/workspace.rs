//! Repository preparation and diff capture with the `git` CLI.

use std::path::{Path, PathBuf};
use tokio::process::Command;

/// Errors from git invocations and checkout bookkeeping.
#[derive(Debug)]
pub enum GitError {
    /// git could not be started.
    Spawn { source: std::io::Error },
    /// git ran and exited non-zero.
    Failed {
        action: String,
        code: Option<i32>,
        stderr: String,
    },
    /// Removing a stale checkout or writing the diff failed.
    Io { path: PathBuf, source: std::io::Error },
}

impl std::fmt::Display for GitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GitError::Spawn { source } => write!(f, "failed to run git: {source}"),
            GitError::Failed {
                action,
                code,
                stderr,
            } => {
                write!(f, "git failed to {action}")?;
                if let Some(code) = code {
                    write!(f, " (exit {code})")?;
                }
                if !stderr.is_empty() {
                    write!(f, ": {stderr}")?;
                }
                Ok(())
            }
            GitError::Io { path, source } => write!(f, "{}: {}", path.display(), source),
        }
    }
}

impl std::error::Error for GitError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            GitError::Spawn { source } => Some(source),
            GitError::Io { source, .. } => Some(source),
            GitError::Failed { .. } => None,
        }
    }
}

/// Run `git <args>` in `cwd` and return stdout.
async fn run_git(args: &[&str], cwd: Option<&Path>, action: &str) -> Result<String, GitError> {
    let mut cmd = Command::new("git");
    cmd.args(args);
    if let Some(dir) = cwd {
        cmd.current_dir(dir);
    }
    tracing::debug!(?args, cwd = ?cwd, "running git");

    let output = cmd
        .output()
        .await
        .map_err(|e| GitError::Spawn { source: e })?;
    if !output.status.success() {
        return Err(GitError::Failed {
            action: action.to_string(),
            code: output.status.code(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Fresh checkout of `repo_url` at `commit` in `dir`.
///
/// Any existing checkout at `dir` is removed first.
pub async fn clone_repo_at_commit(repo_url: &str, dir: &Path, commit: &str) -> Result<(), GitError> {
    if dir.exists() {
        tracing::info!(dir = %dir.display(), "removing existing checkout");
        std::fs::remove_dir_all(dir).map_err(|e| GitError::Io {
            path: dir.to_path_buf(),
            source: e,
        })?;
    }

    let dir_str = dir.to_string_lossy();
    tracing::info!(repo_url, dir = %dir.display(), "cloning repository");
    run_git(&["clone", repo_url, &dir_str], None, "clone repository").await?;

    tracing::info!(commit, "checking out base commit");
    run_git(&["checkout", commit], Some(dir), "check out base commit").await?;
    Ok(())
}

/// Working-tree changes of the checkout at `dir`, as `git diff` prints them.
pub async fn capture_diff(dir: &Path) -> Result<String, GitError> {
    run_git(&["diff"], Some(dir), "capture diff").await
}

/// Capture the diff of `dir` and write it to `path`.
pub async fn write_diff(dir: &Path, path: &Path) -> Result<usize, GitError> {
    let diff = capture_diff(dir).await?;
    std::fs::write(path, &diff).map_err(|e| GitError::Io {
        path: path.to_path_buf(),
        source: e,
    })?;
    tracing::info!(path = %path.display(), bytes = diff.len(), "diff written");
    Ok(diff.len())
}
