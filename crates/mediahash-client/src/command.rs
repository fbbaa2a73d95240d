use std::process::Stdio;
use std::time::Duration;

use mediahash_core::error::AppError;
use tokio::process::Command;

/// A program plus leading arguments, parsed with shell quoting rules from a
/// command line such as `node "catalog/scripts/load db.js" --direct`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct CommandLine {
    pub program: String,
    pub args: Vec<String>,
}

impl CommandLine {
    pub fn parse(line: &str) -> Result<Self, AppError> {
        let mut parts = shell_words::split(line)
            .map_err(|e| AppError::ConfigError(format!("Invalid command line '{line}': {e}")))?
            .into_iter();
        let program = parts
            .next()
            .ok_or_else(|| AppError::ConfigError("Empty command line".into()))?;
        Ok(Self {
            program,
            args: parts.collect(),
        })
    }

    /// A command with piped stdout/stderr that is killed if its future is dropped.
    pub fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

impl std::fmt::Display for CommandLine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let words = std::iter::once(&self.program).chain(&self.args);
        write!(f, "{}", shell_words::join(words))
    }
}

/// Wait for `fut` up to `timeout`, mapping expiry to [`AppError::Timeout`].
pub(crate) async fn with_timeout<T>(
    timeout: Duration,
    fut: impl Future<Output = Result<T, AppError>>,
) -> Result<T, AppError> {
    tokio::time::timeout(timeout, fut)
        .await
        .map_err(|_| AppError::Timeout(timeout.as_secs()))?
}
