//! OpenSSH transport.

use std::path::Path;

use tokio::process::Command;

use super::{Invocation, Transport, TransportKind};
use crate::error::Result;
use crate::node::Node;

/// Exit status `ssh` and `scp` use for their own failures.
const SSH_FAILURE_EXIT: i32 = 255;

/// Default connect timeout in seconds.
const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 30;

/// Runs commands through the `ssh` client and copies files with `scp`.
///
/// Host keys are not checked: test nodes are disposable and reuse addresses.
#[derive(Debug, Clone)]
pub struct SshTransport {
    port: u16,
    connect_timeout_secs: u64,
}

impl Default for SshTransport {
    fn default() -> Self {
        Self {
            port: 22,
            connect_timeout_secs: DEFAULT_CONNECT_TIMEOUT_SECS,
        }
    }
}

impl SshTransport {
    /// Create an SSH transport with default options.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a non-standard SSH port.
    #[must_use]
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Set the connect timeout.
    #[must_use]
    pub fn with_connect_timeout(mut self, secs: u64) -> Self {
        self.connect_timeout_secs = secs;
        self
    }

    fn common_options(&self, cmd: &mut Command, node: &Node) {
        cmd.args(["-o", "StrictHostKeyChecking=no"])
            .args(["-o", "UserKnownHostsFile=/dev/null"])
            .args(["-o", "LogLevel=ERROR"])
            .args(["-o", "BatchMode=yes"])
            .arg("-o")
            .arg(format!("ConnectTimeout={}", self.connect_timeout_secs));
        if let Some(key) = node.ssh_key_path() {
            cmd.arg("-i").arg(key);
        }
    }

    fn destination(user: &str, node: &Node) -> String {
        format!("{user}@{}", node.public_address())
    }
}

impl Transport for SshTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Ssh
    }

    fn command(&self, node: &Node, invocation: &Invocation, user: &str) -> Result<Command> {
        let remote = format!(
            "{}{}",
            invocation.export_prefix()?,
            invocation.command_line()?
        );

        let mut cmd = Command::new("ssh");
        self.common_options(&mut cmd, node);
        if invocation.is_tty() {
            cmd.arg("-tt");
        }
        cmd.arg("-p")
            .arg(self.port.to_string())
            .arg(Self::destination(user, node))
            .arg("--")
            .arg(remote);
        Ok(cmd)
    }

    fn send_file_command(
        &self,
        node: &Node,
        local: &Path,
        remote: &Path,
        user: &str,
    ) -> Result<Command> {
        let mut cmd = Command::new("scp");
        self.common_options(&mut cmd, node);
        cmd.arg("-r")
            .arg("-P")
            .arg(self.port.to_string())
            .arg(local)
            .arg(format!(
                "{}:{}",
                Self::destination(user, node),
                remote.display()
            ));
        Ok(cmd)
    }

    fn download_file_command(
        &self,
        node: &Node,
        remote: &Path,
        local: &Path,
        user: &str,
    ) -> Result<Command> {
        let mut cmd = Command::new("scp");
        self.common_options(&mut cmd, node);
        cmd.arg("-r")
            .arg("-P")
            .arg(self.port.to_string())
            .arg(format!(
                "{}:{}",
                Self::destination(user, node),
                remote.display()
            ))
            .arg(local);
        Ok(cmd)
    }

    fn is_connection_failure(&self, exit_code: Option<i32>, _stderr: &str) -> bool {
        exit_code == Some(SSH_FAILURE_EXIT)
    }
}

#[cfg(test)]
mod tests {
    use std::ffi::OsStr;
    use std::sync::Arc;

    use super::*;

    fn node() -> Node {
        Node::new(
            "203.0.113.10".parse().unwrap(),
            "10.0.0.10".parse().unwrap(),
            "centos",
            Arc::new(SshTransport::new()),
        )
        .with_ssh_key_path("/keys/id_rsa")
    }

    fn argv(cmd: &Command) -> Vec<String> {
        cmd.as_std()
            .get_args()
            .map(OsStr::to_string_lossy)
            .map(|s| s.into_owned())
            .collect()
    }

    #[test]
    fn test_literal_command_is_quoted_for_remote_shell() {
        let transport = SshTransport::new();
        let cmd = transport
            .command(&node(), &Invocation::new(["echo", "$HOME"]), "centos")
            .unwrap();
        let args = argv(&cmd);

        assert_eq!(cmd.as_std().get_program(), OsStr::new("ssh"));
        assert!(args.contains(&"centos@203.0.113.10".to_string()));
        assert!(args.windows(2).any(|w| w[0] == "-i" && w[1] == "/keys/id_rsa"));
        let remote = args.last().unwrap();
        assert_eq!(shlex::split(remote).unwrap(), vec!["echo", "$HOME"]);
    }

    #[test]
    fn test_shell_command_with_env_and_tty() {
        let transport = SshTransport::new().with_port(2222);
        let invocation = Invocation::new(["echo", "$FOO"])
            .shell(true)
            .tty(true)
            .env("FOO", "bar");
        let args = argv(&transport.command(&node(), &invocation, "root").unwrap());

        assert!(args.contains(&"-tt".to_string()));
        assert!(args.windows(2).any(|w| w[0] == "-p" && w[1] == "2222"));
        assert_eq!(args.last().unwrap(), "export FOO=bar && echo $FOO");
    }

    #[test]
    fn test_scp_targets() {
        let transport = SshTransport::new();
        let send = transport
            .send_file_command(&node(), Path::new("/tmp/a"), Path::new("/opt/b"), "root")
            .unwrap();
        assert_eq!(argv(&send).last().unwrap(), "root@203.0.113.10:/opt/b");

        let download = transport
            .download_file_command(&node(), Path::new("/opt/b"), Path::new("/tmp/a"), "root")
            .unwrap();
        let args = argv(&download);
        assert_eq!(args[args.len() - 2], "root@203.0.113.10:/opt/b");
    }

    #[test]
    fn test_exit_255_is_connection_failure() {
        let transport = SshTransport::new();
        assert!(transport.is_connection_failure(Some(255), ""));
        assert!(!transport.is_connection_failure(Some(1), ""));
    }
}
