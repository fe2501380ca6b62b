//! Bounded subprocess execution
//!
//! Every external command the supervisor runs, scheduler tools and plugin
//! helpers alike, goes through [`run_bounded`] so that a hung command cannot
//! stall a monitor pass.

use std::process::Output;
use std::time::Duration;

use tokio::process::Command;

use crate::error::ExecError;

fn program_name(command: &Command) -> String {
    command.as_std().get_program().to_string_lossy().into_owned()
}

/// Run a command to completion, killing it if it outlives `timeout`
///
/// # Errors
/// [`ExecError::Spawn`] if it cannot start, [`ExecError::Timeout`] if it is killed
pub async fn run_bounded(mut command: Command, timeout: Duration) -> Result<Output, ExecError> {
    let program = program_name(&command);
    command.kill_on_drop(true);
    tracing::debug!("Running {:?} (timeout {}s)", command.as_std(), timeout.as_secs());
    match tokio::time::timeout(timeout, command.output()).await {
        Err(_) => Err(ExecError::Timeout {
            program,
            seconds: timeout.as_secs(),
        }),
        Ok(Err(source)) => Err(ExecError::Spawn { program, source }),
        Ok(Ok(output)) => Ok(output),
    }
}

/// Standard output of a successful run
///
/// # Errors
/// [`ExecError::Failed`] when the process exited unsuccessfully
pub fn stdout_of(program: &str, output: Output) -> Result<String, ExecError> {
    if output.status.success() {
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    } else {
        Err(ExecError::Failed {
            program: program.to_string(),
            code: output.status.code(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }
}

/// [`run_bounded`] followed by [`stdout_of`]
///
/// # Errors
/// Any [`ExecError`]
pub async fn run_checked(command: Command, timeout: Duration) -> Result<String, ExecError> {
    let program = program_name(&command);
    let output = run_bounded(command, timeout).await?;
    stdout_of(&program, output)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_success_captures_stdout() {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "echo hello"]);
        let out = run_checked(cmd, Duration::from_secs(5)).await.unwrap();
        assert_eq!(out.trim(), "hello");
    }

    #[tokio::test]
    async fn test_failure_reports_code_and_stderr() {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "echo broken >&2; exit 3"]);
        let err = run_checked(cmd, Duration::from_secs(5)).await.unwrap_err();
        assert!(matches!(
            err,
            ExecError::Failed { code: Some(3), ref stderr, .. } if stderr == "broken"
        ));
    }

    #[tokio::test]
    async fn test_timeout_kills() {
        let mut cmd = Command::new("sleep");
        cmd.arg("10");
        let err = run_bounded(cmd, Duration::from_millis(100)).await.unwrap_err();
        assert!(matches!(err, ExecError::Timeout { .. }));
    }

    #[tokio::test]
    async fn test_missing_program() {
        let cmd = Command::new("definitely-not-a-real-program-asimov");
        let err = run_bounded(cmd, Duration::from_secs(5)).await.unwrap_err();
        assert!(matches!(err, ExecError::Spawn { .. }));
    }
}
