//! Base command execution abstraction
//!
//! Provides the foundational trait for executing external commands, enabling
//! dependency injection for testing and keeping every subprocess invocation
//! (git, disk usage probes, ...) behind one seam.

use async_trait::async_trait;
use thiserror::Error;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub status_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status_code == 0
    }
}

#[derive(Debug, Error, Clone)]
pub enum CommandError {
    #[error("command execution failed: {message}")]
    ExecutionFailed { message: String },
    #[error("command not found: {command}")]
    CommandNotFound { command: String },
    #[error("command timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },
    #[error("io error: {message}")]
    Io { message: String },
}

/// Trait for executing external commands.
///
/// Every `git` invocation in the crate goes through this seam so tests can
/// substitute a scripted executor instead of shelling out to a real binary.
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    async fn execute(&self, program: &str, args: &[&str], cwd: Option<&str>) -> Result<CommandOutput, CommandError>;

    async fn execute_with_timeout(
        &self,
        program: &str,
        args: &[&str],
        cwd: Option<&str>,
        timeout: Duration,
    ) -> Result<CommandOutput, CommandError> {
        match tokio::time::timeout(timeout, self.execute(program, args, cwd)).await {
            Ok(result) => result,
            Err(_) => Err(CommandError::Timeout {
                timeout_ms: timeout.as_millis() as u64,
            }),
        }
    }
}

/// Real implementation using `tokio::process::Command`, kept off the runtime's
/// worker threads for the duration of the subprocess.
pub struct ProcessCommandExecutor;

#[async_trait]
impl CommandExecutor for ProcessCommandExecutor {
    async fn execute(&self, program: &str, args: &[&str], cwd: Option<&str>) -> Result<CommandOutput, CommandError> {
        let mut command = tokio::process::Command::new(program);
        command.args(args);
        if let Some(dir) = cwd {
            command.current_dir(dir);
        }

        let output = command.output().await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                CommandError::CommandNotFound {
                    command: program.to_string(),
                }
            } else {
                CommandError::Io { message: e.to_string() }
            }
        })?;

        Ok(CommandOutput {
            status_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct MockCommandExecutor {
        responses: std::collections::HashMap<String, Result<CommandOutput, CommandError>>,
    }

    impl MockCommandExecutor {
        fn new() -> Self {
            Self {
                responses: std::collections::HashMap::new(),
            }
        }

        fn expect_command(mut self, program: &str, args: &[&str], response: Result<CommandOutput, CommandError>) -> Self {
            let key = format!("{} {}", program, args.join(" "));
            self.responses.insert(key, response);
            self
        }
    }

    #[async_trait]
    impl CommandExecutor for MockCommandExecutor {
        async fn execute(&self, program: &str, args: &[&str], _cwd: Option<&str>) -> Result<CommandOutput, CommandError> {
            let key = format!("{} {}", program, args.join(" "));
            self.responses.get(&key)
                .cloned()
                .unwrap_or(Err(CommandError::CommandNotFound {
                    command: program.to_string(),
                }))
        }
    }

    #[tokio::test]
    async fn process_command_executor_success() {
        let executor = ProcessCommandExecutor;
        let result = executor.execute("echo", &["hello"], None).await;

        assert!(result.is_ok());
        let output = result.unwrap();
        assert!(output.success());
        assert!(output.stdout.contains("hello"));
    }

    #[tokio::test]
    async fn process_command_executor_command_not_found() {
        let executor = ProcessCommandExecutor;
        let result = executor.execute("nonexistent_command_xyz", &[], None).await;

        assert!(result.is_err());
        assert!(matches!(result.unwrap_err(), CommandError::CommandNotFound { .. }));
    }

    #[tokio::test]
    async fn mock_command_executor_matches_recorded_response() {
        let mock = MockCommandExecutor::new()
            .expect_command("echo", &["hello"], Ok(CommandOutput {
                status_code: 0,
                stdout: "hello\n".to_string(),
                stderr: String::new(),
            }));

        let result = mock.execute("echo", &["hello"], None).await;
        assert!(result.is_ok());
        let output = result.unwrap();
        assert!(output.success());
        assert_eq!(output.stdout, "hello\n");
    }

    #[tokio::test]
    async fn execute_with_timeout_surfaces_timeout_error() {
        struct SlowExecutor;

        #[async_trait]
        impl CommandExecutor for SlowExecutor {
            async fn execute(&self, _program: &str, _args: &[&str], _cwd: Option<&str>) -> Result<CommandOutput, CommandError> {
                tokio::time::sleep(Duration::from_millis(50)).await;
                Ok(CommandOutput { status_code: 0, stdout: String::new(), stderr: String::new() })
            }
        }

        let result = SlowExecutor
            .execute_with_timeout("slow", &[], None, Duration::from_millis(5))
            .await;
        assert!(matches!(result, Err(CommandError::Timeout { .. })));
    }
}
