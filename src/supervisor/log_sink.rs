//! Append-only run log with a live console mirror.

use std::fs::File;
use std::io::{LineWriter, Write};
use std::path::{Path, PathBuf};

/// Errors writing the run log. Console mirror failures are never errors; they
/// are collected as warnings instead.
#[derive(Debug)]
pub enum LogSinkError {
    Open {
        path: PathBuf,
        source: std::io::Error,
    },
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    Closed {
        path: PathBuf,
    },
}

impl std::fmt::Display for LogSinkError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogSinkError::Open { path, source } => {
                write!(f, "failed to open log file {}: {}", path.display(), source)
            }
            LogSinkError::Write { path, source } => {
                write!(f, "failed to write log file {}: {}", path.display(), source)
            }
            LogSinkError::Closed { path } => {
                write!(f, "log file {} is already closed", path.display())
            }
        }
    }
}

impl std::error::Error for LogSinkError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            LogSinkError::Open { source, .. } => Some(source),
            LogSinkError::Write { source, .. } => Some(source),
            LogSinkError::Closed { .. } => None,
        }
    }
}

/// Durable destination for every observed output line.
///
/// Each record is one line of plain text. Lines are flushed as they are
/// written so the file is complete up to the last line even if the harness
/// itself dies.
pub struct LogSink {
    path: PathBuf,
    file: Option<LineWriter<File>>,
    mirror: Option<Box<dyn Write + Send>>,
    lines: u64,
    warnings: Vec<String>,
}

impl LogSink {
    /// Create (or truncate) the log at `path`, creating parent directories.
    pub fn open(path: &Path, mirror_console: bool) -> Result<Self, LogSinkError> {
        let open_err = |e| LogSinkError::Open {
            path: path.to_path_buf(),
            source: e,
        };
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(open_err)?;
            }
        }
        let file = File::create(path).map_err(open_err)?;

        let mirror: Option<Box<dyn Write + Send>> = if mirror_console {
            Some(Box::new(std::io::stdout()))
        } else {
            None
        };

        Ok(Self {
            path: path.to_path_buf(),
            file: Some(LineWriter::new(file)),
            mirror,
            lines: 0,
            warnings: Vec::new(),
        })
    }

    /// Replace the console mirror.
    #[cfg(test)]
    pub fn with_mirror(mut self, mirror: Box<dyn Write + Send>) -> Self {
        self.mirror = Some(mirror);
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of output lines appended (notes and stderr tails excluded).
    pub fn lines(&self) -> u64 {
        self.lines
    }

    /// Degraded-run warnings collected so far.
    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    /// Record one output line.
    pub fn append(&mut self, line: &str) -> Result<(), LogSinkError> {
        self.write_record(line)?;
        self.lines += 1;
        Ok(())
    }

    /// Record a harness note (timeouts, spawn and stream errors).
    pub fn note(&mut self, text: &str) -> Result<(), LogSinkError> {
        self.write_record(text)
    }

    /// Record captured stderr verbatim, newline-terminated.
    pub fn append_raw(&mut self, text: &str) -> Result<(), LogSinkError> {
        self.write_record(text.strip_suffix('\n').unwrap_or(text))
    }

    /// Flush and close. Closing an already closed sink is a no-op.
    pub fn close(&mut self) -> Result<(), LogSinkError> {
        let Some(mut file) = self.file.take() else {
            return Ok(());
        };
        if let Some(mirror) = self.mirror.as_mut() {
            let _ = mirror.flush();
        }
        file.flush().map_err(|e| LogSinkError::Write {
            path: self.path.clone(),
            source: e,
        })?;
        tracing::debug!(path = %self.path.display(), lines = self.lines, "run log closed");
        Ok(())
    }

    fn write_record(&mut self, text: &str) -> Result<(), LogSinkError> {
        let Some(file) = self.file.as_mut() else {
            return Err(LogSinkError::Closed {
                path: self.path.clone(),
            });
        };
        writeln!(file, "{text}").map_err(|e| LogSinkError::Write {
            path: self.path.clone(),
            source: e,
        })?;
        self.mirror_record(text);
        Ok(())
    }

    fn mirror_record(&mut self, text: &str) {
        let Some(mirror) = self.mirror.as_mut() else {
            return;
        };
        if let Err(e) = writeln!(mirror, "{text}") {
            // Stop mirroring after the first failure; the file stays authoritative.
            tracing::warn!(error = %e, "console mirror failed, continuing with file log only");
            self.warnings.push(format!("console mirror failed: {e}"));
            self.mirror = None;
        }
    }
}
