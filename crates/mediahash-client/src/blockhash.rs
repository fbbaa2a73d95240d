use std::path::Path;
use std::time::Duration;

use mediahash_core::error::AppError;
use mediahash_core::traits::PerceptualHasher;

use crate::command::{CommandLine, with_timeout};

pub const DEFAULT_HASH_COMMAND: &str = "blockhash";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// Runs an external blockhash tool as `<command> <file>`.
///
/// The tool prints a descriptor followed by the hash; everything after the
/// first space is taken as the hash.
#[derive(Debug, Clone)]
pub struct CommandHasher {
    command: CommandLine,
    timeout: Duration,
}

impl CommandHasher {
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
}

impl PerceptualHasher for CommandHasher {
    async fn hash_file(&self, path: &Path) -> Result<String, AppError> {
        let mut cmd = self.command.command();
        cmd.arg(path);

        let output = with_timeout(self.timeout, async {
            cmd.output().await.map_err(|e| {
                AppError::CommandError(format!("Failed to run '{}': {e}", self.command))
            })
        })
        .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(AppError::CommandError(format!(
                "'{}' exited with {}: {}",
                self.command,
                output.status,
                stderr.trim()
            )));
        }

        parse_hash_output(&String::from_utf8_lossy(&output.stdout))
    }
}

fn parse_hash_output(stdout: &str) -> Result<String, AppError> {
    stdout
        .trim()
        .split_once(' ')
        .map(|(_, hash)| hash.trim())
        .filter(|hash| !hash.is_empty())
        .map(String::from)
        .ok_or_else(|| AppError::CommandError(format!("Unparsable hasher output: '{}'", stdout.trim())))
}
