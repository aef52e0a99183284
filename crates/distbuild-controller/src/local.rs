//! Local subprocess execution.
//!
//! Runs one admitted action in a sandboxed subprocess with captured output,
//! bounded by the io timeout and killed on cancellation. Oversized command
//! lines marked `InFile` are spilled to a response file first.

use crate::error::ControllerError;
use distbuild_core::protocol::CommandType;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

/// Env flag set by CI drivers that must keep their own process tree alive.
pub const DONT_KILL_TREE_ENV: &str = "DEVOPS_DONT_KILL_PROCESS_TREE";

/// Outcome of one local run.
#[derive(Debug)]
pub struct LocalOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

/// Run `command` in `workdir`, waiting at most `io_timeout`.
pub async fn run_local(
    command: &[String],
    workdir: &str,
    command_type: CommandType,
    io_timeout: Duration,
    cancel: &CancellationToken,
) -> Result<LocalOutput, ControllerError> {
    let (program, args) = command
        .split_first()
        .ok_or_else(|| ControllerError::InvalidParam("empty command".to_string()))?;

    // spill an oversized argument payload into a response file
    let mut response_file: Option<PathBuf> = None;
    let mut args: Vec<String> = args.to_vec();
    if command_type == CommandType::InFile {
        let arg = args.join(" ");
        let path = std::env::temp_dir().join(format!("distbuild_args_{}.rsp", Uuid::new_v4()));
        tokio::fs::write(&path, &arg).await?;
        args = vec![format!("@{}", path.display())];
        response_file = Some(path);
    }

    debug!(program = %program, args = args.len(), workdir = %workdir, "spawning subprocess");

    let mut cmd = Command::new(program);
    cmd.args(&args)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .stdin(Stdio::null())
        .kill_on_drop(true);
    if !workdir.is_empty() {
        cmd.current_dir(workdir);
    }
    #[cfg(unix)]
    if !dont_kill_tree() {
        // own process group so cancellation can take the whole tree down
        cmd.process_group(0);
    }

    let mut child = cmd.spawn()?;

    let mut stdout_pipe = child.stdout.take();
    let mut stderr_pipe = child.stderr.take();
    let reader = tokio::spawn(async move {
        let mut stdout = String::new();
        let mut stderr = String::new();
        if let Some(pipe) = stdout_pipe.as_mut() {
            let _ = pipe.read_to_string(&mut stdout).await;
        }
        if let Some(pipe) = stderr_pipe.as_mut() {
            let _ = pipe.read_to_string(&mut stderr).await;
        }
        (stdout, stderr)
    });

    let result = tokio::select! {
        status = child.wait() => {
            let status = status?;
            let (stdout, stderr) = reader.await.unwrap_or_default();
            Ok(LocalOutput {
                exit_code: status.code().unwrap_or(1),
                stdout,
                stderr,
            })
        }
        _ = tokio::time::sleep(io_timeout) => {
            warn!(program = %program, secs = io_timeout.as_secs(), "subprocess io timeout");
            kill_child(&mut child).await;
            Err(ControllerError::IoTimeout(io_timeout.as_secs()))
        }
        _ = cancel.cancelled() => {
            debug!(program = %program, "cancelled, killing subprocess");
            kill_child(&mut child).await;
            Err(ControllerError::AdmissionCancelled)
        }
    };

    if let Some(path) = response_file {
        let _ = tokio::fs::remove_file(path).await;
    }
    result
}

fn dont_kill_tree() -> bool {
    std::env::var(DONT_KILL_TREE_ENV)
        .map(|v| v == "true")
        .unwrap_or(false)
}

#[cfg(unix)]
async fn kill_child(child: &mut Child) {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;
    if !dont_kill_tree() {
        if let Some(id) = child.id() {
            // the child leads its own process group; take down the tree
            let _ = killpg(Pid::from_raw(id as i32), Signal::SIGTERM);
        }
    }
    let _ = child.kill().await;
}

#[cfg(not(unix))]
async fn kill_child(child: &mut Child) {
    let _ = child.kill().await;
}
