//! Scriptable [`CommandRunner`] for tests.
//!
//! Responses are keyed by program name. One-shot responses queued with
//! [`MockRunner::push`] are consumed first; after that the persistent
//! response set with [`MockRunner::with_response`] is returned. A program
//! with neither behaves like a missing binary.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use super::{CommandError, CommandOutput, CommandRunner};

/// What a mocked program does when run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockResponse {
    /// Exit 0 after `latency`.
    Output {
        stdout: String,
        stderr: String,
        latency: Duration,
    },
    /// Exit with a non-zero status.
    Fail { code: i32, stderr: String },
    /// Never finish; always exceeds the caller's timeout.
    Hang,
}

impl MockResponse {
    pub fn output(stdout: impl Into<String>, stderr: impl Into<String>) -> Self {
        MockResponse::Output {
            stdout: stdout.into(),
            stderr: stderr.into(),
            latency: Duration::ZERO,
        }
    }

    pub fn fail(code: i32, stderr: impl Into<String>) -> Self {
        MockResponse::Fail {
            code,
            stderr: stderr.into(),
        }
    }
}

/// A program invocation seen by the mock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedCall {
    pub program: String,
    pub args: Vec<String>,
}

#[derive(Debug, Default)]
struct MockState {
    queued: HashMap<String, VecDeque<MockResponse>>,
    persistent: HashMap<String, MockResponse>,
    calls: Vec<RecordedCall>,
}

/// Mock command runner with canned responses and call recording.
#[derive(Debug, Default)]
pub struct MockRunner {
    state: Mutex<MockState>,
}

impl MockRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the response returned every time `program` runs.
    pub fn with_response(self, program: &str, response: MockResponse) -> Self {
        self.set_response(program, response);
        self
    }

    pub fn set_response(&self, program: &str, response: MockResponse) {
        self.lock().persistent.insert(program.to_string(), response);
    }

    /// Queues a response for the next run of `program` only.
    pub fn push(&self, program: &str, response: MockResponse) {
        self.lock()
            .queued
            .entry(program.to_string())
            .or_default()
            .push_back(response);
    }

    /// All invocations so far, in order.
    pub fn calls(&self) -> Vec<RecordedCall> {
        self.lock().calls.clone()
    }

    /// Invocations of one program.
    pub fn calls_to(&self, program: &str) -> Vec<RecordedCall> {
        self.lock()
            .calls
            .iter()
            .filter(|c| c.program == program)
            .cloned()
            .collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn next_response(&self, program: &str, args: &[String]) -> Option<MockResponse> {
        let mut state = self.lock();
        state.calls.push(RecordedCall {
            program: program.to_string(),
            args: args.to_vec(),
        });
        if let Some(response) = state.queued.get_mut(program).and_then(VecDeque::pop_front) {
            return Some(response);
        }
        state.persistent.get(program).cloned()
    }
}

#[async_trait]
impl CommandRunner for MockRunner {
    async fn run(
        &self,
        program: &str,
        args: &[String],
        timeout: Duration,
    ) -> Result<CommandOutput, CommandError> {
        let Some(response) = self.next_response(program, args) else {
            return Err(CommandError::Spawn {
                program: program.to_string(),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "no such mocked program"),
            });
        };

        match response {
            MockResponse::Output {
                stdout,
                stderr,
                latency,
            } => {
                if latency >= timeout {
                    tokio::time::sleep(timeout).await;
                    return Err(CommandError::Timeout {
                        program: program.to_string(),
                        timeout,
                    });
                }
                if !latency.is_zero() {
                    tokio::time::sleep(latency).await;
                }
                Ok(CommandOutput { stdout, stderr })
            }
            MockResponse::Fail { code, stderr } => Err(CommandError::Failed {
                program: program.to_string(),
                code: Some(code),
                stderr,
            }),
            MockResponse::Hang => {
                tokio::time::sleep(timeout).await;
                Err(CommandError::Timeout {
                    program: program.to_string(),
                    timeout,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const T: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn test_queued_then_persistent() {
        let runner = MockRunner::new().with_response("tool", MockResponse::output("steady", ""));
        runner.push("tool", MockResponse::output("first", ""));

        assert_eq!(runner.run("tool", &[], T).await.unwrap().stdout, "first");
        assert_eq!(runner.run("tool", &[], T).await.unwrap().stdout, "steady");
        assert_eq!(runner.run("tool", &[], T).await.unwrap().stdout, "steady");
        assert_eq!(runner.calls_to("tool").len(), 3);
    }

    #[tokio::test]
    async fn test_unknown_program_is_spawn_error() {
        let runner = MockRunner::new();
        let err = runner.run("missing", &[], T).await.unwrap_err();
        assert!(matches!(err, CommandError::Spawn { .. }));
        assert_eq!(runner.calls().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_latency_beyond_timeout() {
        let runner = MockRunner::new().with_response(
            "slow",
            MockResponse::Output {
                stdout: "late".into(),
                stderr: String::new(),
                latency: Duration::from_secs(120),
            },
        );
        let err = runner.run("slow", &[], T).await.unwrap_err();
        assert!(matches!(err, CommandError::Timeout { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_hang_times_out() {
        let runner = MockRunner::new().with_response("hang", MockResponse::Hang);
        let err = runner.run("hang", &[], T).await.unwrap_err();
        assert!(matches!(err, CommandError::Timeout { .. }));
    }

    #[tokio::test]
    async fn test_records_arguments() {
        let runner = MockRunner::new().with_response("perfquery", MockResponse::output("", ""));
        let args = vec!["-R".to_string(), "-G".to_string()];
        runner.run("perfquery", &args, T).await.unwrap();
        assert_eq!(runner.calls()[0].args, args);
    }
}
