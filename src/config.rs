//! Configuration for phase-forge, read from `.forge/forge.toml`.
//!
//! Every section is optional. Values are layered file → environment → CLI:
//! the file provides the base, `CLAUDE_CMD` and `FORGE_TEST_CMD` fill in the
//! commands when the file leaves them unset, and `run` flags override the
//! `[defaults]` options for a single execution.
//!
//! # Configuration File Format
//!
//! ```toml
//! [project]
//! claude_cmd = "claude"
//!
//! [executor]
//! db_path = ".forge/executions.db"
//! worker_timeout_secs = 1800
//! test_timeout_secs = 300
//! qa_timeout_secs = 900
//! poll_interval_ms = 1000
//! test_command = "cargo test"
//! no_tests_patterns = ["no tests to run", "running 0 tests"]
//! event_capacity = 256
//!
//! [defaults]
//! auto_create_specs = true
//! auto_create_tasks = true
//! run_qa = false
//! max_qa_iterations = 3
//! stop_on_error = false
//! use_isolated_workspace = false
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::execution::models::ExecutionOptions;

/// Project-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProjectConfig {
    /// Claude CLI command (default: "claude")
    #[serde(default)]
    pub claude_cmd: Option<String>,
}

/// Execution engine tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// SQLite database path, relative to the project directory
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
    #[serde(default = "default_worker_timeout_secs")]
    pub worker_timeout_secs: u64,
    #[serde(default = "default_test_timeout_secs")]
    pub test_timeout_secs: u64,
    #[serde(default = "default_qa_timeout_secs")]
    pub qa_timeout_secs: u64,
    /// Cadence for worker pools that can only be polled
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Shell command that runs the project's tests
    #[serde(default)]
    pub test_command: Option<String>,
    /// Output fragments that mean "no tests were found"
    #[serde(default = "default_no_tests_patterns")]
    pub no_tests_patterns: Vec<String>,
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

fn default_db_path() -> PathBuf {
    PathBuf::from(".forge/executions.db")
}

fn default_worker_timeout_secs() -> u64 {
    30 * 60
}

fn default_test_timeout_secs() -> u64 {
    5 * 60
}

fn default_qa_timeout_secs() -> u64 {
    15 * 60
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_no_tests_patterns() -> Vec<String> {
    vec!["no tests to run".to_string(), "running 0 tests".to_string()]
}

fn default_event_capacity() -> usize {
    256
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            worker_timeout_secs: default_worker_timeout_secs(),
            test_timeout_secs: default_test_timeout_secs(),
            qa_timeout_secs: default_qa_timeout_secs(),
            poll_interval_ms: default_poll_interval_ms(),
            test_command: None,
            no_tests_patterns: default_no_tests_patterns(),
            event_capacity: default_event_capacity(),
        }
    }
}

impl ExecutorConfig {
    pub fn worker_timeout(&self) -> Duration {
        Duration::from_secs(self.worker_timeout_secs)
    }

    pub fn test_timeout(&self) -> Duration {
        Duration::from_secs(self.test_timeout_secs)
    }

    pub fn qa_timeout(&self) -> Duration {
        Duration::from_secs(self.qa_timeout_secs)
    }

    /// Never zero; `tokio::time::interval` rejects a zero period.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

/// The forge.toml file structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ForgeToml {
    #[serde(default)]
    pub project: ProjectConfig,
    #[serde(default)]
    pub executor: ExecutorConfig,
    /// Default options for every execution
    #[serde(default)]
    pub defaults: ExecutionOptions,
}

impl ForgeToml {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse forge.toml")
    }

    /// Load configuration from `<forge_dir>/forge.toml`, or defaults when absent.
    pub fn load_or_default(forge_dir: &Path) -> Result<Self> {
        let config_path = forge_dir.join("forge.toml");
        if config_path.exists() {
            Self::load(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    /// Get the Claude command, with fallback to environment variable.
    pub fn claude_cmd(&self) -> String {
        self.project
            .claude_cmd
            .clone()
            .or_else(|| std::env::var("CLAUDE_CMD").ok())
            .unwrap_or_else(|| "claude".to_string())
    }

    /// Get the test command, with fallback to environment variable.
    /// Empty means no tests are configured.
    pub fn test_command(&self) -> Option<String> {
        self.executor
            .test_command
            .clone()
            .or_else(|| std::env::var("FORGE_TEST_CMD").ok())
            .filter(|cmd| !cmd.trim().is_empty())
    }

    /// Validate the configuration and return any warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        for (name, value) in [
            ("worker_timeout_secs", self.executor.worker_timeout_secs),
            ("test_timeout_secs", self.executor.test_timeout_secs),
            ("qa_timeout_secs", self.executor.qa_timeout_secs),
        ] {
            if value == 0 {
                warnings.push(format!(
                    "executor.{} is 0: every such call will time out immediately",
                    name
                ));
            }
        }

        if self.executor.poll_interval_ms == 0 {
            warnings.push("executor.poll_interval_ms must be greater than 0".to_string());
        }

        if self.defaults.run_qa && self.defaults.max_qa_iterations == 0 {
            warnings.push(
                "defaults.run_qa is enabled but max_qa_iterations is 0: QA can never pass"
                    .to_string(),
            );
        }

        warnings
    }
}

/// Resolved configuration for one invocation.
///
/// It merges settings from:
/// 1. forge.toml file
/// 2. Environment variables
/// 3. CLI arguments (applied by the caller through [`ForgeConfig::options`])
#[derive(Debug, Clone)]
pub struct ForgeConfig {
    /// Path to the project directory
    pub project_dir: PathBuf,
    /// Path to the .forge directory
    pub forge_dir: PathBuf,
    /// Parsed forge.toml configuration
    pub toml: ForgeToml,
}

impl ForgeConfig {
    /// Create a new ForgeConfig from a project directory.
    pub fn new(project_dir: PathBuf) -> Result<Self> {
        let project_dir = project_dir
            .canonicalize()
            .context("Failed to resolve project directory")?;
        let forge_dir = project_dir.join(".forge");
        let toml = ForgeToml::load_or_default(&forge_dir)?;

        Ok(Self {
            project_dir,
            forge_dir,
            toml,
        })
    }

    pub fn claude_cmd(&self) -> String {
        self.toml.claude_cmd()
    }

    pub fn test_command(&self) -> Option<String> {
        self.toml.test_command()
    }

    pub fn executor(&self) -> &ExecutorConfig {
        &self.toml.executor
    }

    /// Default execution options from `[defaults]`.
    pub fn options(&self) -> ExecutionOptions {
        self.toml.defaults.clone()
    }

    /// Get path to the execution database.
    pub fn db_path(&self) -> PathBuf {
        if self.toml.executor.db_path.is_absolute() {
            self.toml.executor.db_path.clone()
        } else {
            self.project_dir.join(&self.toml.executor.db_path)
        }
    }

    /// Get path to roadmap.json.
    pub fn roadmap_file(&self) -> PathBuf {
        self.forge_dir.join("roadmap.json")
    }

    /// Get path to the spec catalog directory.
    pub fn specs_dir(&self) -> PathBuf {
        self.forge_dir.join("specs")
    }

    /// Get path to the QA issue directory.
    pub fn qa_dir(&self) -> PathBuf {
        self.forge_dir.join("qa")
    }

    pub fn validate(&self) -> Vec<String> {
        self.toml.validate()
    }
}
