//! Child processes on the orchestrator host.

use std::path::Path;

use tokio::process::Command;

use super::{Invocation, Transport, TransportKind};
use crate::error::{Error, Result};
use crate::node::Node;

/// Runs commands directly on the machine running the harness.
///
/// Used when a node is the local host. Commands always run as the invoking
/// user; the requested user is ignored.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalTransport;

impl LocalTransport {
    /// Create a local transport.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl Transport for LocalTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Local
    }

    fn command(&self, _node: &Node, invocation: &Invocation, _user: &str) -> Result<Command> {
        let mut cmd = if invocation.is_shell() {
            let mut cmd = Command::new("sh");
            cmd.arg("-c").arg(invocation.command_line()?);
            cmd
        } else {
            let (program, rest) = invocation
                .args()
                .split_first()
                .ok_or_else(|| Error::Configuration("Empty command".into()))?;
            if invocation.is_sudo() {
                let mut cmd = Command::new("sudo");
                cmd.arg("-E").arg(program).args(rest);
                cmd
            } else {
                let mut cmd = Command::new(program);
                cmd.args(rest);
                cmd
            }
        };
        cmd.envs(invocation.env_vars());
        Ok(cmd)
    }

    fn send_file_command(
        &self,
        _node: &Node,
        local: &Path,
        remote: &Path,
        _user: &str,
    ) -> Result<Command> {
        let mut cmd = Command::new("cp");
        cmd.arg("-R").arg(local).arg(remote);
        Ok(cmd)
    }

    fn download_file_command(
        &self,
        _node: &Node,
        remote: &Path,
        local: &Path,
        _user: &str,
    ) -> Result<Command> {
        let mut cmd = Command::new("cp");
        cmd.arg("-R").arg(remote).arg(local);
        Ok(cmd)
    }
}
