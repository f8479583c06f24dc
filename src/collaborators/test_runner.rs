use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::process::Command;

use super::TestRunner;

/// Runs the configured shell command in the project root.
///
/// Exit status 0 is a pass. A failing exit whose output matches one of the
/// no-tests patterns is also a pass. With no command configured every run passes.
pub struct CommandTestRunner {
    command: Option<String>,
    no_tests_patterns: Vec<String>,
}

impl CommandTestRunner {
    pub fn new(command: Option<String>, no_tests_patterns: Vec<String>) -> Self {
        Self {
            command,
            no_tests_patterns: no_tests_patterns
                .into_iter()
                .map(|p| p.to_lowercase())
                .collect(),
        }
    }

    fn reports_no_tests(&self, output: &str) -> bool {
        let output = output.to_lowercase();
        self.no_tests_patterns
            .iter()
            .any(|pattern| output.contains(pattern.as_str()))
    }
}

#[async_trait]
impl TestRunner for CommandTestRunner {
    async fn run(&self, project_root: &Path) -> Result<bool> {
        let Some(command) = self.command.as_deref() else {
            tracing::debug!("no test command configured, treating as pass");
            return Ok(true);
        };

        let output = Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(project_root)
            .kill_on_drop(true)
            .output()
            .await
            .with_context(|| format!("Failed to run test command '{}'", command))?;

        if output.status.success() {
            return Ok(true);
        }

        let combined = format!(
            "{}\n{}",
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        );
        if self.reports_no_tests(&combined) {
            tracing::info!(command, "no tests found, treating as pass");
            return Ok(true);
        }

        tracing::info!(command, status = %output.status, "tests failed");
        Ok(false)
    }
}
