//! File and shell pass-throughs the agent calls while working on a checkout.
//!
//! Every path is resolved against the agent's working directory.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

/// Maximum number of entries `list_files` returns.
pub const LIST_FILES_LIMIT: usize = 100;

const EMPTY_LISTING: &str = "No files found or you do not have permission to view this directory.";

#[derive(Debug)]
pub enum ToolError {
    Io { path: PathBuf, source: std::io::Error },
    Spawn { command: String, source: std::io::Error },
    TimedOut { command: String, timeout: Duration },
}

impl std::fmt::Display for ToolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ToolError::Io { path, source } => write!(f, "{}: {source}", path.display()),
            ToolError::Spawn { command, source } => {
                write!(f, "failed to run `{command}`: {source}")
            }
            ToolError::TimedOut { command, timeout } => write!(
                f,
                "`{command}` did not finish within {} seconds and was killed",
                timeout.as_secs()
            ),
        }
    }
}

impl std::error::Error for ToolError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ToolError::Io { source, .. } => Some(source),
            ToolError::Spawn { source, .. } => Some(source),
            ToolError::TimedOut { .. } => None,
        }
    }
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> ToolError + '_ {
    move |source| ToolError::Io {
        path: path.to_path_buf(),
        source,
    }
}

pub fn read_file(cwd: &Path, rel: &str) -> Result<String, ToolError> {
    let path = cwd.join(rel);
    std::fs::read_to_string(&path).map_err(io_err(&path))
}

/// Write `content` to `rel`, creating missing parent directories.
pub fn write_file(cwd: &Path, rel: &str, content: &str) -> Result<PathBuf, ToolError> {
    let path = cwd.join(rel);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(io_err(parent))?;
    }
    std::fs::write(&path, content).map_err(io_err(&path))?;
    tracing::debug!(path = %path.display(), bytes = content.len(), "file written");
    Ok(path)
}

/// List files under `rel`, one relative path per line.
///
/// Shallow paths come first, then case-insensitive order. Unreadable
/// directories are skipped.
pub fn list_files(cwd: &Path, rel: &str, recursive: bool) -> String {
    let root = cwd.join(rel);
    let mut files = Vec::new();
    collect_files(&root, recursive, &mut files);

    let mut relative: Vec<String> = files
        .iter()
        .filter_map(|p| p.strip_prefix(&root).ok())
        .map(|p| p.to_string_lossy().into_owned())
        .collect();
    relative.sort_by_cached_key(|p| (p.matches('/').count(), p.to_lowercase()));

    if relative.is_empty() {
        return EMPTY_LISTING.to_string();
    }
    if relative.len() >= LIST_FILES_LIMIT {
        relative.truncate(LIST_FILES_LIMIT);
        return format!(
            "{}\n\n(Truncated at {LIST_FILES_LIMIT} results. Try listing files in subdirectories if you need to explore further.)",
            relative.join("\n")
        );
    }
    relative.join("\n")
}

fn collect_files(dir: &Path, recursive: bool, out: &mut Vec<PathBuf>) {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            tracing::debug!(dir = %dir.display(), error = %e, "skipping unreadable directory");
            return;
        }
    };
    for entry in entries.flatten() {
        let Ok(file_type) = entry.file_type() else {
            continue;
        };
        let path = entry.path();
        if file_type.is_file() {
            out.push(path);
        } else if file_type.is_dir() && recursive {
            collect_files(&path, recursive, out);
        }
    }
}

/// Captured result of a shell command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub exit_code: Option<i32>,
    /// Stdout followed by stderr.
    pub output: String,
}

/// Run `command` through `sh -c` in `cwd`, killing it if it outlives `timeout`.
pub async fn execute_command(
    cwd: &Path,
    command: &str,
    timeout: Duration,
) -> Result<CommandOutput, ToolError> {
    tracing::info!(command, cwd = %cwd.display(), "executing command");
    let child = Command::new("sh")
        .arg("-c")
        .arg(command)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| ToolError::Spawn {
            command: command.to_string(),
            source: e,
        })?;

    // Dropping the child on timeout kills it.
    let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(result) => result.map_err(|e| ToolError::Spawn {
            command: command.to_string(),
            source: e,
        })?,
        Err(_) => {
            tracing::warn!(command, timeout_secs = timeout.as_secs(), "command timed out");
            return Err(ToolError::TimedOut {
                command: command.to_string(),
                timeout,
            });
        }
    };

    let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
    combined.push_str(&String::from_utf8_lossy(&output.stderr));
    Ok(CommandOutput {
        exit_code: output.status.code(),
        output: combined,
    })
}
