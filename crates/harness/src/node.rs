//! Cluster members and their remote-execution entry points.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::process::Child;
use tracing::debug;

use crate::error::{Error, Result};
use crate::exec::{process, CommandOutput, Invocation, OutputMode, Transport, TransportKind};

/// Role of a node in the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Control plane node.
    Master,
    /// Private agent.
    Agent,
    /// Public agent.
    PublicAgent,
}

impl Role {
    /// All roles, masters first.
    pub const ALL: [Self; 3] = [Self::Master, Self::Agent, Self::PublicAgent];

    /// Role argument understood by `dcos_install.sh`.
    #[must_use]
    pub fn installer_arg(self) -> &'static str {
        match self {
            Self::Master => "master",
            Self::Agent => "slave",
            Self::PublicAgent => "slave_public",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Master => write!(f, "master"),
            Self::Agent => write!(f, "agent"),
            Self::PublicAgent => write!(f, "public_agent"),
        }
    }
}

/// One addressable member of a cluster.
///
/// Two nodes are equal when both addresses match; role, user and transport
/// do not take part in equality.
#[derive(Debug, Clone)]
pub struct Node {
    public_address: IpAddr,
    private_address: IpAddr,
    default_user: String,
    ssh_key_path: Option<PathBuf>,
    container: Option<String>,
    role: Option<Role>,
    transport: Arc<dyn Transport>,
}

impl Node {
    /// Create a node reachable through `transport`.
    #[must_use]
    pub fn new(
        public_address: IpAddr,
        private_address: IpAddr,
        default_user: impl Into<String>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self {
            public_address,
            private_address,
            default_user: default_user.into(),
            ssh_key_path: None,
            container: None,
            role: None,
            transport,
        }
    }

    /// Tag the node with a role.
    #[must_use]
    pub fn with_role(mut self, role: Role) -> Self {
        self.role = Some(role);
        self
    }

    /// Set the SSH private key used to reach the node.
    #[must_use]
    pub fn with_ssh_key_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.ssh_key_path = Some(path.into());
        self
    }

    /// Set the container backing the node.
    #[must_use]
    pub fn with_container(mut self, container: impl Into<String>) -> Self {
        self.container = Some(container.into());
        self
    }

    /// Address the orchestrator uses to reach the node.
    #[must_use]
    pub fn public_address(&self) -> IpAddr {
        self.public_address
    }

    /// Address other cluster members use.
    #[must_use]
    pub fn private_address(&self) -> IpAddr {
        self.private_address
    }

    /// User for commands that do not name one.
    #[must_use]
    pub fn default_user(&self) -> &str {
        &self.default_user
    }

    /// SSH private key, if any.
    #[must_use]
    pub fn ssh_key_path(&self) -> Option<&Path> {
        self.ssh_key_path.as_deref()
    }

    /// Backing container, if any.
    #[must_use]
    pub fn container(&self) -> Option<&str> {
        self.container.as_deref()
    }

    /// Role tag, if assigned.
    #[must_use]
    pub fn role(&self) -> Option<Role> {
        self.role
    }

    /// Transport used for this node.
    #[must_use]
    pub fn transport_kind(&self) -> TransportKind {
        self.transport.kind()
    }

    fn label(&self) -> String {
        self.public_address.to_string()
    }

    fn user_for<'a>(&'a self, invocation: &'a Invocation) -> &'a str {
        invocation.user_override().unwrap_or(&self.default_user)
    }

    /// Run a command and wait for it.
    ///
    /// # Errors
    /// Returns [`Error::CommandExecution`] on non-zero exit and
    /// [`Error::Connection`] if the node cannot be reached.
    pub async fn run(&self, invocation: &Invocation) -> Result<CommandOutput> {
        let user = self.user_for(invocation);
        let cmd = self.transport.command(self, invocation, user)?;
        process::run(
            self.transport.as_ref(),
            &self.label(),
            invocation.args(),
            cmd,
            invocation.output_mode(),
        )
        .await
    }

    /// Run a command as `user`, whatever the invocation says.
    ///
    /// # Errors
    /// Same as [`Node::run`].
    pub async fn run_as(&self, user: &str, invocation: &Invocation) -> Result<CommandOutput> {
        self.run(&invocation.clone().user(user)).await
    }

    /// Start a command and return the live process.
    ///
    /// The child is killed if the handle is dropped.
    ///
    /// # Errors
    /// Returns an error if the transport command cannot be built or spawned.
    pub fn popen(&self, invocation: &Invocation) -> Result<Child> {
        let user = self.user_for(invocation);
        let cmd = self.transport.command(self, invocation, user)?;
        process::spawn(self.transport.as_ref(), &self.label(), cmd)
    }

    /// Copy a local file or directory to `remote`.
    ///
    /// The remote parent directory is created first. A directory is copied
    /// as `remote` itself, so `remote` should not already exist.
    ///
    /// # Errors
    /// Returns [`Error::Configuration`] if `local` does not exist, otherwise
    /// the errors of [`Node::run`].
    pub async fn send_file(&self, local: &Path, remote: &Path, user: Option<&str>) -> Result<()> {
        if !local.exists() {
            return Err(Error::Configuration(format!(
                "Local path does not exist: {}",
                local.display()
            )));
        }
        let user = user.unwrap_or(&self.default_user);

        if let Some(parent) = remote.parent().filter(|p| !p.as_os_str().is_empty()) {
            let mkdir = Invocation::new([
                "mkdir".to_string(),
                "-p".to_string(),
                parent.display().to_string(),
            ])
            .user(user);
            self.run(&mkdir).await?;
        }

        debug!(node = %self, local = %local.display(), remote = %remote.display(), "Sending file");
        let cmd = self.transport.send_file_command(self, local, remote, user)?;
        let args = vec![local.display().to_string(), remote.display().to_string()];
        process::run(
            self.transport.as_ref(),
            &self.label(),
            &args,
            cmd,
            OutputMode::Capture,
        )
        .await?;
        Ok(())
    }

    /// Copy `remote` (file or directory) from the node to `local`.
    ///
    /// # Errors
    /// Same as [`Node::run`].
    pub async fn download_file(&self, remote: &Path, local: &Path) -> Result<()> {
        debug!(node = %self, remote = %remote.display(), local = %local.display(), "Downloading file");
        let cmd = self
            .transport
            .download_file_command(self, remote, local, &self.default_user)?;
        let args = vec![remote.display().to_string(), local.display().to_string()];
        process::run(
            self.transport.as_ref(),
            &self.label(),
            &args,
            cmd,
            OutputMode::Capture,
        )
        .await?;
        Ok(())
    }
}

impl PartialEq for Node {
    fn eq(&self, other: &Self) -> bool {
        self.public_address == other.public_address
            && self.private_address == other.private_address
    }
}

impl Eq for Node {}

impl Hash for Node {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.public_address.hash(state);
        self.private_address.hash(state);
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.public_address)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use tokio::io::AsyncReadExt;

    use super::*;
    use crate::exec::LocalTransport;

    fn local_node() -> Node {
        Node::new(
            "127.0.0.1".parse().unwrap(),
            "127.0.0.1".parse().unwrap(),
            "root",
            Arc::new(LocalTransport::new()),
        )
    }

    #[test]
    fn test_equality_ignores_role_and_user() {
        let a = local_node().with_role(Role::Master);
        let b = Node::new(
            "127.0.0.1".parse().unwrap(),
            "127.0.0.1".parse().unwrap(),
            "centos",
            Arc::new(LocalTransport::new()),
        )
        .with_role(Role::Agent);
        let c = Node::new(
            "127.0.0.1".parse().unwrap(),
            "10.0.0.1".parse().unwrap(),
            "root",
            Arc::new(LocalTransport::new()),
        );

        assert_eq!(a, b);
        assert_ne!(a, c);
        let set: HashSet<Node> = [a, b, c].into_iter().collect();
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_installer_role_args() {
        assert_eq!(Role::Master.installer_arg(), "master");
        assert_eq!(Role::Agent.installer_arg(), "slave");
        assert_eq!(Role::PublicAgent.installer_arg(), "slave_public");
    }

    #[tokio::test]
    async fn test_literal_arguments_are_not_expanded() {
        let output = local_node()
            .run(&Invocation::new(["echo", "$HOME"]))
            .await
            .unwrap();
        assert_eq!(output.stdout, "$HOME\n");
    }

    #[tokio::test]
    async fn test_shell_arguments_are_expanded() {
        let output = local_node()
            .run(
                &Invocation::new(["echo", "$HOME"])
                    .shell(true)
                    .env("HOME", "/home/tester"),
            )
            .await
            .unwrap();
        assert_eq!(output.stdout, "/home/tester\n");
    }

    #[tokio::test]
    async fn test_non_zero_exit_carries_output() {
        let err = local_node()
            .run(&Invocation::new(["echo out; echo err >&2; exit 3"]).shell(true))
            .await
            .unwrap_err();

        match err {
            Error::CommandExecution {
                exit_code,
                stdout,
                stderr,
                ..
            } => {
                assert_eq!(exit_code, Some(3));
                assert_eq!(stdout, "out\n");
                assert_eq!(stderr, "err\n");
            }
            other => panic!("Expected command failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_live_logging_still_captures() {
        let output = local_node()
            .run(
                &Invocation::new(["printf", "a\\nb\\n"])
                    .output(OutputMode::LogAndCapture),
            )
            .await
            .unwrap();
        assert_eq!(output.stdout, "a\nb\n");
    }

    #[tokio::test]
    async fn test_discard_keeps_stderr() {
        let err = local_node()
            .run(
                &Invocation::new(["echo noise; echo broken >&2; exit 1"])
                    .shell(true)
                    .output(OutputMode::Discard),
            )
            .await
            .unwrap_err();
        match err {
            Error::CommandExecution { stdout, stderr, .. } => {
                assert!(stdout.is_empty());
                assert_eq!(stderr, "broken\n");
            }
            other => panic!("Expected command failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_missing_binary_is_connection_error() {
        let err = local_node()
            .run(&Invocation::new(["/nonexistent/dcos-harness-binary"]))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Connection { .. }));
    }

    #[tokio::test]
    async fn test_popen_streams_output() {
        let mut child = local_node()
            .popen(&Invocation::new(["echo", "streamed"]))
            .unwrap();
        let mut stdout = child.stdout.take().unwrap();
        let mut text = String::new();
        stdout.read_to_string(&mut text).await.unwrap();
        assert!(child.wait().await.unwrap().success());
        assert_eq!(text, "streamed\n");
    }

    #[tokio::test]
    async fn test_send_and_download_directory() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("bundle");
        std::fs::create_dir_all(source.join("nested")).unwrap();
        std::fs::write(source.join("nested/config.yaml"), "a: 1\n").unwrap();

        let node = local_node();
        let remote = dir.path().join("remote/deep/bundle");
        node.send_file(&source, &remote, None).await.unwrap();
        assert_eq!(
            std::fs::read_to_string(remote.join("nested/config.yaml")).unwrap(),
            "a: 1\n"
        );

        let back = dir.path().join("back");
        node.download_file(&remote, &back).await.unwrap();
        assert!(back.join("nested/config.yaml").exists());
    }

    #[tokio::test]
    async fn test_send_missing_file_fails_fast() {
        let err = local_node()
            .send_file(Path::new("/nonexistent/file"), Path::new("/tmp/x"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }
}
