//! Real process execution on top of `tokio::process`.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;

use super::{CommandError, CommandOutput, CommandRunner};

/// Spawns real processes. The child is killed if the deadline passes.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemRunner;

impl SystemRunner {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl CommandRunner for SystemRunner {
    async fn run(
        &self,
        program: &str,
        args: &[String],
        timeout: Duration,
    ) -> Result<CommandOutput, CommandError> {
        tracing::debug!(program, ?args, "executing command");

        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output();

        let output = match tokio::time::timeout(timeout, child).await {
            Ok(result) => result.map_err(|source| CommandError::Spawn {
                program: program.to_string(),
                source,
            })?,
            Err(_) => {
                return Err(CommandError::Timeout {
                    program: program.to_string(),
                    timeout,
                });
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();

        if !output.status.success() {
            return Err(CommandError::Failed {
                program: program.to_string(),
                code: output.status.code(),
                stderr,
            });
        }

        tracing::trace!(program, stdout_len = stdout.len(), stderr_len = stderr.len(), "command succeeded");
        Ok(CommandOutput { stdout, stderr })
    }
}
