//! External command execution.
//!
//! Every `ip`, `tc`, `ethtool`, `sysctl`, and `modprobe` invocation goes
//! through the [`CommandRunner`] trait so tests can substitute canned
//! output. The production [`ProcessRunner`] captures combined stdout/stderr
//! and enforces a per-invocation timeout.

use std::process::ExitStatus;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;

/// Default per-invocation timeout for external commands.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("failed to spawn {name}: {source}")]
    Spawn {
        name: String,
        #[source]
        source: std::io::Error,
    },
    #[error("command {name} timed out after {timeout:?}")]
    Timeout { name: String, timeout: Duration },
    #[error("command {name} exited with {status}: {output}")]
    NonZero { name: String, status: ExitStatus, output: String },
}

impl CommandError {
    /// Combined stdout/stderr captured before the command failed, when any.
    pub fn output(&self) -> &str {
        match self {
            CommandError::NonZero { output, .. } => output,
            _ => "",
        }
    }
}

/// Runs an external command and returns its combined stdout/stderr.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, name: &str, args: &[&str]) -> Result<String, CommandError>;

    /// Runs with a caller-supplied deadline instead of the runner's own.
    /// Probe-style invocations use this for tighter budgets. The default
    /// implementation ignores the deadline; [`ProcessRunner`] enforces it.
    async fn run_with_timeout(
        &self,
        name: &str,
        args: &[&str],
        _timeout: Duration,
    ) -> Result<String, CommandError> {
        self.run(name, args).await
    }
}

/// [`CommandRunner`] backed by `tokio::process` with a hard timeout.
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    timeout: Duration,
}

impl Default for ProcessRunner {
    fn default() -> Self {
        Self::new(DEFAULT_COMMAND_TIMEOUT)
    }
}

impl ProcessRunner {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(&self, name: &str, args: &[&str]) -> Result<String, CommandError> {
        self.run_with_timeout(name, args, self.timeout).await
    }

    async fn run_with_timeout(
        &self,
        name: &str,
        args: &[&str],
        timeout: Duration,
    ) -> Result<String, CommandError> {
        tracing::trace!(cmd = name, ?args, ?timeout, "running command");

        let mut command = Command::new(name);
        // kill_on_drop reaps the child when the timeout future wins.
        command.args(args).kill_on_drop(true);

        let output = tokio::time::timeout(timeout, command.output())
            .await
            .map_err(|_| CommandError::Timeout { name: name.to_string(), timeout })?
            .map_err(|source| CommandError::Spawn { name: name.to_string(), source })?;

        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        text.push_str(&String::from_utf8_lossy(&output.stderr));

        if !output.status.success() {
            return Err(CommandError::NonZero {
                name: name.to_string(),
                status: output.status,
                output: text,
            });
        }

        Ok(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn captures_stdout() {
        let runner = ProcessRunner::default();
        let out = runner.run("echo", &["hello"]).await.unwrap();
        assert_eq!(out.trim(), "hello");
    }

    #[tokio::test]
    async fn non_zero_exit_carries_output() {
        let runner = ProcessRunner::default();
        let err = runner.run("sh", &["-c", "echo oops >&2; exit 3"]).await.unwrap_err();
        match &err {
            CommandError::NonZero { output, .. } => assert!(output.contains("oops")),
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(err.output().contains("oops"));
    }

    #[tokio::test]
    async fn timeout_fires() {
        let runner = ProcessRunner::new(Duration::from_millis(50));
        let err = runner.run("sleep", &["5"]).await.unwrap_err();
        assert!(matches!(err, CommandError::Timeout { .. }));
    }

    #[tokio::test]
    async fn per_call_timeout_overrides_the_default() {
        let runner = ProcessRunner::default();
        let err = runner
            .run_with_timeout("sleep", &["5"], Duration::from_millis(50))
            .await
            .unwrap_err();
        match err {
            CommandError::Timeout { timeout, .. } => {
                assert_eq!(timeout, Duration::from_millis(50));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn missing_binary_is_spawn_error() {
        let runner = ProcessRunner::default();
        let err = runner.run("definitely-not-a-binary-xyz", &[]).await.unwrap_err();
        assert!(matches!(err, CommandError::Spawn { .. }));
    }
}
