use std::ffi::OsStr;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::processor::ProcessError;

/// Captured output of an external conversion tool.
#[derive(Debug, Clone)]
pub struct ToolOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

/// A child process running in its own process group, so a timeout can take
/// down anything the tool forked (Ghostscript delegates, ImageMagick helpers).
struct ManagedChild {
    child: tokio::process::Child,
    pgid: i32,
}

impl ManagedChild {
    /// SIGTERM the group, wait `grace_period`, then SIGKILL.
    async fn kill_group(&mut self, grace_period: Duration) {
        if let Err(e) = kill(Pid::from_raw(-self.pgid), Signal::SIGTERM) {
            // ESRCH: already gone.
            if e != nix::errno::Errno::ESRCH {
                warn!("SIGTERM to process group {} failed: {e}", self.pgid);
            }
            return;
        }

        if tokio::time::timeout(grace_period, self.child.wait())
            .await
            .is_err()
        {
            if let Err(e) = kill(Pid::from_raw(-self.pgid), Signal::SIGKILL) {
                if e != nix::errno::Errno::ESRCH {
                    warn!("SIGKILL to process group {} failed: {e}", self.pgid);
                }
            }
            let _ = self.child.wait().await;
        }
    }
}

/// Run `program args...` in `work_dir`, killing its process group if it
/// outlives `timeout`. A non-zero exit status is returned as
/// `ProcessError::Tool` carrying the tail of stderr.
pub async fn run_tool<I, S>(
    program: &str,
    args: I,
    work_dir: &Path,
    timeout: Duration,
    kill_grace: Duration,
) -> Result<ToolOutput, ProcessError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let mut cmd = Command::new(program);
    cmd.args(args)
        .current_dir(work_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    // New session => new process group we can signal as a whole.
    unsafe {
        cmd.pre_exec(|| {
            libc::setsid();
            Ok(())
        });
    }

    debug!("running {program} in {}", work_dir.display());
    let mut child = cmd.spawn().map_err(|e| ProcessError::Tool {
        tool: program.to_string(),
        message: format!("spawn failed: {e}"),
    })?;
    let pgid = child.id().ok_or_else(|| ProcessError::Tool {
        tool: program.to_string(),
        message: "no child PID".into(),
    })? as i32;
    let mut stdout = child.stdout.take().ok_or_else(|| ProcessError::Tool {
        tool: program.to_string(),
        message: "stdout not captured".into(),
    })?;
    let mut stderr = child.stderr.take().ok_or_else(|| ProcessError::Tool {
        tool: program.to_string(),
        message: "stderr not captured".into(),
    })?;
    let mut managed = ManagedChild { child, pgid };

    let result = tokio::time::timeout(timeout, async {
        let mut stdout_bytes = Vec::new();
        let mut stderr_bytes = Vec::new();
        let (_, _, status) = tokio::try_join!(
            stdout.read_to_end(&mut stdout_bytes),
            stderr.read_to_end(&mut stderr_bytes),
            managed.child.wait()
        )?;
        Ok::<_, std::io::Error>((stdout_bytes, stderr_bytes, status))
    })
    .await;

    match result {
        Ok(Ok((stdout_bytes, stderr_bytes, status))) => {
            let output = ToolOutput {
                stdout: String::from_utf8_lossy(&stdout_bytes).to_string(),
                stderr: String::from_utf8_lossy(&stderr_bytes).to_string(),
                exit_code: status.code().unwrap_or(-1),
            };
            if status.success() {
                Ok(output)
            } else {
                Err(ProcessError::Tool {
                    tool: program.to_string(),
                    message: format!(
                        "exited with status {}: {}",
                        output.exit_code,
                        stderr_tail(&output.stderr)
                    ),
                })
            }
        }
        Ok(Err(e)) => Err(ProcessError::Tool {
            tool: program.to_string(),
            message: e.to_string(),
        }),
        Err(_elapsed) => {
            info!("{program} timed out after {timeout:?}, killing process group");
            managed.kill_group(kill_grace).await;
            Err(ProcessError::Timeout {
                tool: program.to_string(),
                after: timeout,
            })
        }
    }
}

/// Check that a tool can be started, returning the first line of its
/// version output.
pub async fn tool_version(program: &str, version_arg: &str) -> Result<String, ProcessError> {
    let cwd = std::env::temp_dir();
    let output = run_tool(
        program,
        [version_arg],
        &cwd,
        Duration::from_secs(10),
        Duration::from_secs(1),
    )
    .await?;
    Ok(output.stdout.lines().next().unwrap_or("").trim().to_string())
}

/// Last few lines of stderr, which is where conversion tools explain themselves.
fn stderr_tail(stderr: &str) -> String {
    let lines: Vec<&str> = stderr.trim().lines().collect();
    let start = lines.len().saturating_sub(5);
    let tail = lines[start..].join(" | ");
    if tail.is_empty() {
        "(no stderr)".to_string()
    } else {
        tail
    }
}
