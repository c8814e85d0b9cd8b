//! Subprocess execution with timeout and cancellation

use crate::error::PipelineError;
use anyhow::Result;
use std::process::Output;
use std::time::Duration;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

/// Grace period between SIGTERM and SIGKILL
#[cfg(unix)]
const KILL_GRACE: Duration = Duration::from_secs(5);

/// Run an external tool to completion, capturing its output.
///
/// `timeout` of `None` means unbounded; cancellation still applies. A
/// missing binary maps to a configuration error, timeout and cancellation
/// to an external-tool error. Exit status is returned to the caller
/// unexamined; use [`expect_success`] for the common case.
pub async fn run_tool(
    mut cmd: Command,
    tool: &str,
    timeout: Option<Duration>,
    cancel: Option<CancellationToken>,
) -> Result<Output> {
    cmd.stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped());

    let mut child = cmd.spawn().map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            PipelineError::Config(format!("{} not found in PATH", tool))
        } else {
            PipelineError::ExternalTool {
                tool: tool.to_string(),
                message: format!("failed to spawn: {}", e),
            }
        }
    })?;

    let pid = child.id();
    let mut output_fut = Box::pin(child.wait_with_output());

    let raced = tokio::select! {
        out = &mut output_fut => Some(out),
        _ = expiry(timeout, cancel.clone()) => None,
    };

    match raced {
        Some(out) => Ok(out.map_err(|e| PipelineError::ExternalTool {
            tool: tool.to_string(),
            message: format!("wait failed: {}", e),
        })?),
        None => {
            let reason = if cancel.map(|c| c.is_cancelled()).unwrap_or(false) {
                "cancelled"
            } else {
                "timed out"
            };
            tracing::warn!("{} {}; terminating", tool, reason);

            terminate(pid).await;
            // Reap so the child does not linger as a zombie.
            let _ = output_fut.await;

            Err(PipelineError::ExternalTool {
                tool: tool.to_string(),
                message: reason.to_string(),
            }
            .into())
        }
    }
}

/// Run a tool and fail on non-zero exit, classifying by exit code
pub async fn expect_success(
    cmd: Command,
    tool: &str,
    timeout: Option<Duration>,
    cancel: Option<CancellationToken>,
) -> Result<Output> {
    let output = run_tool(cmd, tool, timeout, cancel).await?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(PipelineError::from_tool_exit(tool, output.status, &stderr).into());
    }
    Ok(output)
}

async fn expiry(timeout: Option<Duration>, cancel: Option<CancellationToken>) {
    let sleep = async {
        match timeout {
            Some(d) => tokio::time::sleep(d).await,
            None => futures::future::pending::<()>().await,
        }
    };
    let cancelled = async {
        match cancel {
            Some(token) => token.cancelled_owned().await,
            None => futures::future::pending::<()>().await,
        }
    };

    tokio::select! {
        _ = sleep => {}
        _ = cancelled => {}
    }
}

#[cfg(unix)]
async fn terminate(pid: Option<u32>) {
    let Some(pid) = pid else { return };
    // SIGTERM first so the tool can clean up partial output, SIGKILL after
    // the grace period.
    unsafe {
        libc::kill(pid as libc::pid_t, libc::SIGTERM);
    }
    tokio::time::sleep(KILL_GRACE).await;
    unsafe {
        libc::kill(pid as libc::pid_t, libc::SIGKILL);
    }
}

#[cfg(not(unix))]
async fn terminate(_pid: Option<u32>) {}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_binary_is_config_error() {
        let cmd = Command::new("definitely-not-a-real-binary-7f3a");
        let err = run_tool(cmd, "definitely-not-a-real-binary-7f3a", None, None)
            .await
            .unwrap_err();
        let pe = err.downcast_ref::<PipelineError>().unwrap();
        assert!(matches!(pe, PipelineError::Config(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_successful_command() {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "echo hello"]);
        let out = expect_success(cmd, "sh", Some(Duration::from_secs(5)), None)
            .await
            .unwrap();
        assert_eq!(String::from_utf8_lossy(&out.stdout).trim(), "hello");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_nonzero_exit_classified() {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "exit 3"]);
        let err = expect_success(cmd, "sh", Some(Duration::from_secs(5)), None)
            .await
            .unwrap_err();
        let pe = err.downcast_ref::<PipelineError>().unwrap();
        assert!(pe.is_permanent());
    }

    #[cfg(unix)]
    #[tokio::test(start_paused = true)]
    async fn test_cancellation_terminates() {
        let mut cmd = Command::new("sleep");
        cmd.arg("600");
        let token = CancellationToken::new();
        token.cancel();

        let err = run_tool(cmd, "sleep", None, Some(token)).await.unwrap_err();
        assert!(err.to_string().contains("cancelled"));
    }
}
