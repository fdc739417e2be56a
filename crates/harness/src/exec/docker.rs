//! `docker exec` transport for container-backed nodes.

use std::path::Path;

use tokio::process::Command;

use super::{Invocation, Transport, TransportKind};
use crate::error::{Error, Result};
use crate::node::Node;

/// Exit status the docker CLI uses when the daemon itself fails.
const DOCKER_DAEMON_FAILURE_EXIT: i32 = 125;

/// Messages the docker CLI prints when it cannot reach the container.
const DAEMON_ERROR_PREFIXES: [&str; 3] = [
    "Error response from daemon:",
    "Error: No such container",
    "Cannot connect to the Docker daemon",
];

/// Runs commands inside the node's container with `docker exec`.
///
/// File copies use `docker cp` and are always owned by the container's root
/// user.
#[derive(Debug, Clone)]
pub struct DockerExecTransport {
    docker: String,
}

impl Default for DockerExecTransport {
    fn default() -> Self {
        Self {
            docker: "docker".to_string(),
        }
    }
}

impl DockerExecTransport {
    /// Create a transport that uses the `docker` binary on `PATH`.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a different docker-compatible CLI (e.g. `podman`).
    #[must_use]
    pub fn with_binary(mut self, binary: impl Into<String>) -> Self {
        self.docker = binary.into();
        self
    }

    fn container(node: &Node) -> Result<&str> {
        node.container().ok_or_else(|| {
            Error::Configuration(format!(
                "Node {} has no container for docker exec",
                node.public_address()
            ))
        })
    }
}

impl Transport for DockerExecTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::DockerExec
    }

    fn command(&self, node: &Node, invocation: &Invocation, user: &str) -> Result<Command> {
        let container = Self::container(node)?;
        let mut cmd = Command::new(&self.docker);
        cmd.arg("exec");
        if invocation.is_tty() {
            cmd.args(["--interactive", "--tty"]);
        }
        cmd.args(["--user", user]);
        for (key, value) in invocation.env_vars() {
            cmd.arg("--env").arg(format!("{key}={value}"));
        }
        cmd.arg(container);

        if invocation.is_shell() {
            cmd.args(["/bin/sh", "-c"]).arg(invocation.command_line()?);
        } else {
            if invocation.args().is_empty() {
                return Err(Error::Configuration("Empty command".into()));
            }
            if invocation.is_sudo() {
                cmd.args(["sudo", "-E"]);
            }
            cmd.args(invocation.args());
        }
        Ok(cmd)
    }

    fn send_file_command(
        &self,
        node: &Node,
        local: &Path,
        remote: &Path,
        _user: &str,
    ) -> Result<Command> {
        let container = Self::container(node)?;
        let mut cmd = Command::new(&self.docker);
        cmd.arg("cp")
            .arg(local)
            .arg(format!("{container}:{}", remote.display()));
        Ok(cmd)
    }

    fn download_file_command(
        &self,
        node: &Node,
        remote: &Path,
        local: &Path,
        _user: &str,
    ) -> Result<Command> {
        let container = Self::container(node)?;
        let mut cmd = Command::new(&self.docker);
        cmd.arg("cp")
            .arg(format!("{container}:{}", remote.display()))
            .arg(local);
        Ok(cmd)
    }

    /// Only the docker CLI's own failures count. Remote commands are free to
    /// print anything, so their stderr is matched at its start only.
    fn is_connection_failure(&self, exit_code: Option<i32>, stderr: &str) -> bool {
        if exit_code == Some(DOCKER_DAEMON_FAILURE_EXIT) {
            return true;
        }
        let stderr = stderr.trim_start();
        DAEMON_ERROR_PREFIXES
            .iter()
            .any(|prefix| stderr.starts_with(prefix))
    }
}
