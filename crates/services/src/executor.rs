use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::collaborators::{CommandExecutor, CommandOutput};

/// Runs commands as local child processes.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessExecutor;

impl ProcessExecutor {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl CommandExecutor for ProcessExecutor {
    async fn run(&self, program: &str, args: &[String]) -> CommandOutput {
        debug!(program, ?args, "running command");
        let output = match Command::new(program).args(args).output().await {
            Ok(output) => output,
            Err(e) => {
                warn!(program, error = %e, "failed to spawn command");
                return CommandOutput::failed(format!("failed to run {program}: {e}"));
            }
        };

        let error = (!output.status.success())
            .then(|| format!("{program} exited with {}", output.status));
        CommandOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            error,
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[tokio::test]
    async fn captures_stdout() {
        let out = ProcessExecutor::new()
            .run("echo", &["rendering".to_string()])
            .await;
        assert_eq!(out.stdout.trim(), "rendering");
        assert!(out.stderr.is_empty());
        assert_eq!(out.error, None);
    }

    #[tokio::test]
    async fn non_zero_exit_is_an_error() {
        let out = ProcessExecutor::new()
            .run("sh", &["-c".to_string(), "echo oops >&2; exit 3".to_string()])
            .await;
        assert_eq!(out.stderr.trim(), "oops");
        assert!(out.error.is_some());
    }

    #[tokio::test]
    async fn missing_program_is_reported() {
        let out = ProcessExecutor::new()
            .run("/nonexistent/submitter", &[])
            .await;
        assert!(out.error.unwrap().contains("/nonexistent/submitter"));
    }
}
