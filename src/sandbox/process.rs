//! Shared helpers for running commands and joining their output.

use std::process::{Output, Stdio};
use std::time::Duration;

use tokio::process::Command;

use crate::error::{Error, Result};

/// Runs `command` to completion, killing it if it outlives `timeout`.
pub(crate) async fn run(command: &mut Command, timeout: Duration) -> Result<Output> {
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    match tokio::time::timeout(timeout, command.output()).await {
        Ok(output) => output.map_err(|e| Error::Execution(format!("failed to spawn: {}", e))),
        Err(_) => Err(Error::Timeout(timeout)),
    }
}

/// Joins stdout and stderr the way a terminal would show them.
pub(crate) fn combined_output(output: &Output) -> String {
    join_output(
        &String::from_utf8_lossy(&output.stdout),
        &String::from_utf8_lossy(&output.stderr),
    )
}

pub(crate) fn join_output(stdout: &str, stderr: &str) -> String {
    if stderr.is_empty() {
        stdout.to_string()
    } else if stdout.is_empty() {
        stderr.to_string()
    } else {
        format!("{}\n{}", stdout, stderr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn run_captures_stdout() {
        let output = run(
            Command::new("sh").args(["-c", "echo hello"]),
            Duration::from_secs(5),
        )
        .await
        .unwrap();

        assert!(output.status.success());
        assert_eq!(combined_output(&output).trim(), "hello");
    }

    #[tokio::test]
    async fn run_joins_stderr_after_stdout() {
        let output = run(
            Command::new("sh").args(["-c", "echo out; echo err >&2; exit 3"]),
            Duration::from_secs(5),
        )
        .await
        .unwrap();

        assert_eq!(output.status.code(), Some(3));
        assert_eq!(combined_output(&output), "out\n\nerr\n");
    }

    #[tokio::test]
    async fn run_times_out() {
        let err = run(
            Command::new("sh").args(["-c", "sleep 5"]),
            Duration::from_millis(100),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, Error::Timeout(_)));
    }
}
