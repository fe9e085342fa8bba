//! External command execution as a capability.
//!
//! The scrape cycle never spawns processes directly: it goes through a
//! [`CommandRunner`], so tests can substitute canned output, latency and
//! failures.
//!
//! ```text
//!            ┌──────────────┐
//!            │   Scraper    │
//!            └──────┬───────┘
//!                   │ run(program, args, timeout)
//!            ┌──────▼───────┐
//!            │CommandRunner │ (trait)
//!            └──────┬───────┘
//!          ┌────────┴────────┐
//!   ┌──────▼──────┐   ┌──────▼──────┐
//!   │SystemRunner │   │ MockRunner  │
//!   │ (tokio)     │   │ (Testing)   │
//!   └─────────────┘   └─────────────┘
//! ```

pub mod mock;
pub mod scenarios;
mod system;

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;

pub use mock::{MockResponse, MockRunner, RecordedCall};
pub use system::SystemRunner;

/// Captured output of a command that exited successfully.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
}

/// Why a command produced no usable output.
#[derive(Debug)]
pub enum CommandError {
    /// The program could not be started (missing, not executable).
    Spawn {
        program: String,
        source: std::io::Error,
    },
    /// The program did not finish in time and was killed.
    Timeout { program: String, timeout: Duration },
    /// The program exited with a non-zero status.
    Failed {
        program: String,
        code: Option<i32>,
        stderr: String,
    },
}

impl fmt::Display for CommandError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandError::Spawn { program, source } => {
                write!(f, "failed to start {}: {}", program, source)
            }
            CommandError::Timeout { program, timeout } => {
                write!(f, "{} timed out after {:.1}s", program, timeout.as_secs_f64())
            }
            CommandError::Failed {
                program,
                code: Some(code),
                stderr,
            } => write!(f, "{} exited with status {}: {}", program, code, stderr.trim()),
            CommandError::Failed {
                program,
                code: None,
                stderr,
            } => write!(f, "{} killed by signal: {}", program, stderr.trim()),
        }
    }
}

impl std::error::Error for CommandError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CommandError::Spawn { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// Runs an external program to completion with a deadline.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Runs `program` with `args`, returning its output if it exits with
    /// status 0 within `timeout`.
    async fn run(
        &self,
        program: &str,
        args: &[String],
        timeout: Duration,
    ) -> Result<CommandOutput, CommandError>;
}

#[async_trait]
impl<R: CommandRunner + ?Sized> CommandRunner for std::sync::Arc<R> {
    async fn run(
        &self,
        program: &str,
        args: &[String],
        timeout: Duration,
    ) -> Result<CommandOutput, CommandError> {
        (**self).run(program, args, timeout).await
    }
}
