//! Spawning transport commands and collecting their output.

use std::process::Stdio;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, info};

use super::{CommandOutput, OutputMode, Transport};
use crate::error::{Error, Result};

/// Run `cmd` to completion and classify the outcome.
///
/// `node` and `args` only label errors and log lines.
pub(crate) async fn run(
    transport: &dyn Transport,
    node: &str,
    args: &[String],
    mut cmd: Command,
    output: OutputMode,
) -> Result<CommandOutput> {
    debug!(node = %node, transport = %transport.kind(), args = ?args, "Running command");

    let stdout_pipe = if output == OutputMode::Discard {
        Stdio::null()
    } else {
        Stdio::piped()
    };
    let mut child = cmd
        .stdin(Stdio::null())
        .stdout(stdout_pipe)
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| Error::Connection {
            node: node.to_string(),
            message: format!("Failed to spawn {} transport: {e}", transport.kind()),
        })?;

    let log_live = output == OutputMode::LogAndCapture;
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let (stdout, stderr) = tokio::try_join!(
        drain(stdout, node, "stdout", log_live),
        drain(stderr, node, "stderr", log_live),
    )?;
    let status = child.wait().await?;

    let result = CommandOutput {
        exit_code: status.code(),
        stdout,
        stderr,
    };

    if result.success() {
        return Ok(result);
    }

    if transport.is_connection_failure(result.exit_code, &result.stderr) {
        return Err(Error::Connection {
            node: node.to_string(),
            message: result.stderr.trim().to_string(),
        });
    }

    Err(Error::CommandExecution {
        node: node.to_string(),
        args: args.to_vec(),
        exit_code: result.exit_code,
        stdout: result.stdout,
        stderr: result.stderr,
    })
}

/// Spawn `cmd` and hand the live child to the caller.
pub(crate) fn spawn(transport: &dyn Transport, node: &str, mut cmd: Command) -> Result<Child> {
    debug!(node = %node, transport = %transport.kind(), "Spawning command");
    cmd.stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| Error::Connection {
            node: node.to_string(),
            message: format!("Failed to spawn {} transport: {e}", transport.kind()),
        })
}

async fn drain<R>(reader: Option<R>, node: &str, stream: &str, log_live: bool) -> Result<String>
where
    R: AsyncRead + Unpin,
{
    let Some(reader) = reader else {
        return Ok(String::new());
    };

    let mut reader = BufReader::new(reader);
    let mut captured = Vec::new();
    let mut line = Vec::new();
    loop {
        line.clear();
        if reader.read_until(b'\n', &mut line).await? == 0 {
            break;
        }
        if log_live {
            let text = String::from_utf8_lossy(&line);
            info!(node = %node, stream, "{}", text.trim_end());
        }
        captured.extend_from_slice(&line);
    }

    Ok(String::from_utf8_lossy(&captured).into_owned())
}
