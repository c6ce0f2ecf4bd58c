use serde::Serialize;
use std::path::{Path, PathBuf};

/// Manages the evaluation directory layout.
///
/// Cloned repositories and problem statements live under `eval_data/`, run
/// logs and run records under `eval_logs/`, diffs under `eval_output/`.
#[derive(Debug, Clone)]
pub struct DataDir {
    root: PathBuf,
}

impl DataDir {
    /// Create a new DataDir referencing the given base path.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The base directory holding the three eval_* directories.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding cloned repositories.
    pub fn data_dir(&self) -> PathBuf {
        self.root.join("eval_data")
    }

    /// Directory holding the persisted problem rows.
    pub fn problem_statements_dir(&self) -> PathBuf {
        self.data_dir().join("00_problem_statements")
    }

    /// Directory holding run logs and run records.
    pub fn logs_dir(&self) -> PathBuf {
        self.root.join("eval_logs")
    }

    /// Directory holding captured diffs.
    pub fn output_dir(&self) -> PathBuf {
        self.root.join("eval_output")
    }

    /// Path to the lock file guarding `eval_data/`.
    pub fn lock(&self) -> PathBuf {
        self.data_dir().join(".lock")
    }

    /// Checkout location for a repository (e.g. `eval_data/3_django_django`).
    pub fn repo_dir(&self, name: &str) -> PathBuf {
        self.data_dir().join(name)
    }

    /// Run log for an instance (e.g. `eval_logs/django__django-11099.log`).
    pub fn log_file(&self, instance_id: &str) -> PathBuf {
        self.logs_dir().join(format!("{instance_id}.log"))
    }

    /// Run record for an instance (e.g. `eval_logs/django__django-11099.json`).
    pub fn record_file(&self, instance_id: &str) -> PathBuf {
        self.logs_dir().join(format!("{instance_id}.json"))
    }

    /// Diff artifact for an instance (e.g. `eval_output/django__django-11099.txt`).
    pub fn diff_file(&self, instance_id: &str) -> PathBuf {
        self.output_dir().join(format!("{instance_id}.txt"))
    }

    /// Problem statement for a repository checkout name.
    pub fn problem_statement_file(&self, name: &str) -> PathBuf {
        self.problem_statements_dir().join(format!("{name}.json"))
    }

    /// Create every directory of the layout.
    /// Returns Ok(true) if the base layout was created, Ok(false) if it already existed.
    pub fn init(&self) -> std::io::Result<bool> {
        let created = !self.data_dir().exists();
        std::fs::create_dir_all(self.problem_statements_dir())?;
        std::fs::create_dir_all(self.logs_dir())?;
        std::fs::create_dir_all(self.output_dir())?;
        Ok(created)
    }

    /// Write `row` as pretty JSON for the checkout `name`, unless a statement
    /// is already there. Returns the statement path.
    pub fn write_problem_statement<T: Serialize>(
        &self,
        row: &T,
        name: &str,
    ) -> std::io::Result<PathBuf> {
        let path = self.problem_statement_file(name);
        if path.exists() {
            tracing::debug!(path = %path.display(), "problem statement already present");
            return Ok(path);
        }
        let json = serde_json::to_string_pretty(row)?;
        std::fs::write(&path, json)?;
        tracing::info!(path = %path.display(), "problem statement written");
        Ok(path)
    }
}
