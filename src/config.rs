use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::supervisor::sentinel::{DEFAULT_FAILURE_MARKERS, DEFAULT_SUCCESS_MARKERS};
use crate::supervisor::SupervisorConfig;

/// Top-level configuration loaded from evalsmith.toml.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
#[derive(Default)]
pub struct HarnessConfig {
    pub dataset: DatasetConfig,
    pub agent: AgentConfig,
    pub supervisor: SupervisorSection,
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatasetConfig {
    /// Rows API endpoint returning `{"rows": [{"row_idx": .., "row": {..}}]}`.
    pub url: String,
    /// Prefix joined with a row's `owner/name` to form the clone URL.
    pub clone_base_url: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub command: String,
    /// Arguments; `{repo_dir}`, `{repo_path}`, `{instance_id}` and `{problem_id}`
    /// are substituted per run.
    pub args: Vec<String>,
    /// Working directory the agent is launched from.
    pub working_dir: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SupervisorSection {
    pub idle_timeout_secs: u64,
    /// `pkill -f` pattern for orphaned descendants. Empty disables the sweep.
    pub sweep_pattern: String,
    pub mirror_console: bool,
    pub success_markers: Vec<String>,
    pub failure_markers: Vec<String>,
    pub reap_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory holding eval_data/, eval_logs/ and eval_output/.
    pub base_dir: PathBuf,
}

// --- Default implementations ---

impl Default for DatasetConfig {
    fn default() -> Self {
        Self {
            url: "https://datasets-server.huggingface.co/rows?dataset=princeton-nlp%2FSWE-bench_Lite&config=default&split=test&offset=0&length=100".to_string(),
            clone_base_url: "https://github.com".to_string(),
        }
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            command: "bash".to_string(),
            args: vec![
                "-c".to_string(),
                "cd ./extension && npm run exec-test {repo_dir}".to_string(),
            ],
            working_dir: PathBuf::from("."),
        }
    }
}

impl Default for SupervisorSection {
    fn default() -> Self {
        Self {
            idle_timeout_secs: 250,
            sweep_pattern: ".vscode-test".to_string(),
            mirror_console: true,
            success_markers: DEFAULT_SUCCESS_MARKERS
                .iter()
                .map(|m| m.to_string())
                .collect(),
            failure_markers: DEFAULT_FAILURE_MARKERS
                .iter()
                .map(|m| m.to_string())
                .collect(),
            reap_timeout_secs: 10,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            base_dir: PathBuf::from("."),
        }
    }
}

/// Errors raised while loading or validating configuration.
#[derive(Debug)]
pub enum ConfigError {
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Read { path, source } => {
                write!(f, "failed to read config {}: {}", path.display(), source)
            }
            ConfigError::Parse { path, source } => {
                write!(f, "failed to parse config {}: {}", path.display(), source)
            }
            ConfigError::Invalid(msg) => write!(f, "invalid config: {msg}"),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Read { source, .. } => Some(source),
            ConfigError::Parse { source, .. } => Some(source),
            ConfigError::Invalid(_) => None,
        }
    }
}

impl HarnessConfig {
    /// Load config from `path`. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "config file not found, using defaults");
                return Ok(Self::default());
            }
            Err(e) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source: e,
                })
            }
        };
        toml::from_str(&contents).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            source: e,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.agent.command.trim().is_empty() {
            return Err(ConfigError::Invalid("agent.command is empty".to_string()));
        }
        if self.supervisor.idle_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "supervisor.idle_timeout_secs must be greater than zero".to_string(),
            ));
        }
        if self.supervisor.success_markers.iter().any(|m| m.is_empty())
            || self.supervisor.failure_markers.iter().any(|m| m.is_empty())
        {
            return Err(ConfigError::Invalid(
                "sentinel markers must not be empty strings".to_string(),
            ));
        }
        Ok(())
    }

    /// Resolve the supervisor section into the runtime settings.
    pub fn supervisor_config(&self) -> SupervisorConfig {
        let section = &self.supervisor;
        let sweep = section.sweep_pattern.trim();
        SupervisorConfig {
            idle_budget: Duration::from_secs(section.idle_timeout_secs),
            sweep_pattern: (!sweep.is_empty()).then(|| sweep.to_string()),
            mirror_console: section.mirror_console,
            success_markers: section.success_markers.clone(),
            failure_markers: section.failure_markers.clone(),
            reap_timeout: Duration::from_secs(section.reap_timeout_secs),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_reference_run() {
        let config = HarnessConfig::default();
        assert_eq!(config.supervisor.idle_timeout_secs, 250);
        assert_eq!(config.supervisor.sweep_pattern, ".vscode-test");
        assert_eq!(config.agent.command, "bash");
        assert!(config.dataset.url.contains("SWE-bench_Lite"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = HarnessConfig::load(&dir.path().join("nope.toml")).unwrap();
        assert_eq!(config.supervisor.idle_timeout_secs, 250);
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("evalsmith.toml");
        std::fs::write(
            &path,
            "[supervisor]\nidle_timeout_secs = 30\n\n[agent]\ncommand = \"sh\"\nargs = [\"-c\", \"echo {repo_dir}\"]\n",
        )
        .unwrap();

        let config = HarnessConfig::load(&path).unwrap();
        assert_eq!(config.supervisor.idle_timeout_secs, 30);
        assert_eq!(config.supervisor.sweep_pattern, ".vscode-test");
        assert_eq!(config.agent.command, "sh");
        assert_eq!(config.agent.working_dir, PathBuf::from("."));
    }

    #[test]
    fn test_invalid_toml_is_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "[supervisor\nidle").unwrap();
        let err = HarnessConfig::load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn test_validate_rejects_zero_idle_budget() {
        let mut config = HarnessConfig::default();
        config.supervisor.idle_timeout_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_empty_command() {
        let mut config = HarnessConfig::default();
        config.agent.command = "  ".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_empty_sweep_pattern_disables_sweep() {
        let mut config = HarnessConfig::default();
        config.supervisor.sweep_pattern = String::new();
        let resolved = config.supervisor_config();
        assert!(resolved.sweep_pattern.is_none());
        assert_eq!(resolved.idle_budget, Duration::from_secs(250));
    }
}
