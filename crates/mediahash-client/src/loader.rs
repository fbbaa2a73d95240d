use std::collections::HashMap;
use std::process::Stdio;
use std::time::Duration;

use mediahash_core::error::AppError;
use mediahash_core::traits::BulkLoader;
use tokio::io::AsyncWriteExt;

use crate::command::{CommandLine, with_timeout};

pub const DEFAULT_LOADER_COMMAND: &str = "node catalog/scripts/load/load-db-direct.js";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(600);

/// Pipes newline-delimited export documents into an external loader and
/// reads back `<identifier> <status>` lines.
#[derive(Debug, Clone)]
pub struct CommandLoader {
    command: CommandLine,
    timeout: Duration,
}

impl CommandLoader {
    pub fn new(command_line: &str) -> Result<Self, AppError> {
        Ok(Self {
            command: CommandLine::parse(command_line)?,
            timeout: DEFAULT_TIMEOUT,
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn run(&self, documents: &[String]) -> Result<String, AppError> {
        let mut cmd = self.command.command();
        cmd.stdin(Stdio::piped());
        let mut child = cmd.spawn().map_err(|e| {
            AppError::CommandError(format!("Failed to start '{}': {e}", self.command))
        })?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| AppError::CommandError("Loader stdin unavailable".into()))?;
        let mut input = documents.join("\n");
        input.push('\n');

        // Feed stdin while draining stdout so neither pipe fills up.
        let write = async move {
            stdin.write_all(input.as_bytes()).await?;
            stdin.shutdown().await
        };
        let (written, output) = tokio::join!(write, child.wait_with_output());

        let output = output.map_err(|e| {
            AppError::CommandError(format!("Failed to wait for '{}': {e}", self.command))
        })?;
        let stderr = String::from_utf8_lossy(&output.stderr);
        for line in stderr.lines().filter(|l| !l.trim().is_empty()) {
            tracing::warn!(loader = %self.command, "{line}");
        }

        if !output.status.success() {
            return Err(AppError::CommandError(format!(
                "'{}' exited with {}",
                self.command, output.status
            )));
        }
        written.map_err(|e| {
            AppError::CommandError(format!("Failed to write to '{}': {e}", self.command))
        })?;

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

impl BulkLoader for CommandLoader {
    async fn load(&self, documents: &[String]) -> Result<HashMap<String, String>, AppError> {
        let stdout = with_timeout(self.timeout, self.run(documents)).await?;
        parse_loader_output(&stdout)
    }
}

/// Parse `<identifier> <status>` lines. Blank lines are ignored; any other
/// malformed line fails the whole batch.
fn parse_loader_output(stdout: &str) -> Result<HashMap<String, String>, AppError> {
    let mut statuses = HashMap::new();
    for line in stdout.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let (identifier, status) = line
            .split_once(char::is_whitespace)
            .map(|(id, status)| (id, status.trim()))
            .filter(|(_, status)| !status.is_empty() && !status.contains(char::is_whitespace))
            .ok_or_else(|| AppError::CommandError(format!("Unparsable loader output line: '{line}'")))?;
        statuses.insert(identifier.to_string(), status.to_string());
    }
    Ok(statuses)
}
