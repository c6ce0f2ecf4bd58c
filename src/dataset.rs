//! Benchmark problem rows from a datasets-server style rows API.
//!
//! The endpoint answers `{"rows": [{"row_idx": 0, "row": {...}}, ...]}` where
//! each row is a SWE-bench instance.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Errors fetching or selecting problem rows.
#[derive(Debug)]
pub enum DatasetError {
    Http(reqwest::Error),
    Status { status: u16, body: String },
    Parse(String),
    InvalidProblemId(String),
    OutOfRange { problem_id: usize, rows: usize },
}

impl std::fmt::Display for DatasetError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DatasetError::Http(e) => write!(f, "failed to fetch dataset: {e}"),
            DatasetError::Status { status, body } => {
                write!(f, "failed to fetch dataset: HTTP {status}: {body}")
            }
            DatasetError::Parse(msg) => write!(f, "failed to parse dataset: {msg}"),
            DatasetError::InvalidProblemId(raw) => {
                write!(f, "PROBLEM_ID must be an integer, got {raw:?}")
            }
            DatasetError::OutOfRange { problem_id, rows } => {
                write!(f, "PROBLEM_ID {problem_id} is out of range ({rows} rows)")
            }
        }
    }
}

impl std::error::Error for DatasetError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            DatasetError::Http(e) => Some(e),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for DatasetError {
    fn from(e: reqwest::Error) -> Self {
        DatasetError::Http(e)
    }
}

/// One page of the rows API.
#[derive(Debug, Clone, Deserialize)]
pub struct DatasetPage {
    pub rows: Vec<DatasetEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatasetEntry {
    #[allow(dead_code)]
    #[serde(default)]
    pub row_idx: usize,
    pub row: ProblemRow,
}

/// A benchmark instance. Fields beyond the ones the harness needs are kept
/// so the persisted problem statement is the full row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProblemRow {
    pub repo: String,
    pub instance_id: String,
    pub base_commit: String,
    #[serde(default)]
    pub problem_statement: String,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl ProblemRow {
    /// Clone URL for the row's repository under `base` (e.g. `https://github.com`).
    pub fn repo_url(&self, base: &str) -> String {
        format!("{}/{}", base.trim_end_matches('/'), self.repo)
    }

    /// Checkout directory name: `{problem_id}_{owner}_{name}`.
    pub fn repo_dir_name(&self, problem_id: usize) -> String {
        format!("{}_{}", problem_id, self.repo.replace('/', "_"))
    }
}

impl DatasetPage {
    pub fn parse(json: &str) -> Result<Self, DatasetError> {
        serde_json::from_str(json).map_err(|e| DatasetError::Parse(e.to_string()))
    }

    /// Row at position `problem_id`.
    pub fn select(&self, problem_id: usize) -> Result<&ProblemRow, DatasetError> {
        self.rows
            .get(problem_id)
            .map(|entry| &entry.row)
            .ok_or(DatasetError::OutOfRange {
                problem_id,
                rows: self.rows.len(),
            })
    }
}

/// Parse a problem id from the CLI or environment. Missing means `0`.
pub fn parse_problem_id(raw: Option<&str>) -> Result<usize, DatasetError> {
    let Some(raw) = raw else {
        return Ok(0);
    };
    raw.trim()
        .parse()
        .map_err(|_| DatasetError::InvalidProblemId(raw.to_string()))
}

/// HTTP client for the rows API.
pub struct DatasetClient {
    http: reqwest::Client,
}

impl DatasetClient {
    pub fn new(timeout: Duration) -> Result<Self, DatasetError> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { http })
    }

    pub async fn fetch(&self, url: &str) -> Result<DatasetPage, DatasetError> {
        tracing::info!(url, "fetching dataset");
        let resp = self
            .http
            .get(url)
            .header("Accept", "application/json")
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(DatasetError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let body = resp.text().await?;
        let page = DatasetPage::parse(&body)?;
        tracing::info!(rows = page.rows.len(), "dataset fetched");
        Ok(page)
    }
}
