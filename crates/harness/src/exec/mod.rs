//! Remote execution over pluggable transports.
//!
//! A [`Transport`] knows how to turn an [`Invocation`] (or a file transfer)
//! into a local [`Command`] that performs the operation on a node: `ssh` for
//! machines, `docker exec` for containers, or a plain child process when the
//! node is the local host. Spawning, output capture and failure
//! classification are shared in [`process`].

mod docker;
mod local;
pub(crate) mod process;
mod ssh;

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::process::Command;

use crate::error::{Error, Result};
use crate::node::Node;

pub use docker::DockerExecTransport;
pub use local::LocalTransport;
pub use ssh::SshTransport;

/// What to do with command output besides capturing it.
///
/// Every mode but [`OutputMode::Discard`] captures both streams. Nothing in
/// the harness picks `Discard` on its own; a caller has to ask for it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputMode {
    /// Capture only.
    #[default]
    Capture,
    /// Capture and emit each line to the log as it arrives.
    LogAndCapture,
    /// Opt-in for chatty commands: stdout is dropped and only stderr is
    /// kept for failure reports.
    Discard,
}

/// Transport implementations known to the harness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// OpenSSH client (`ssh`/`scp`).
    Ssh,
    /// `docker exec` / `docker cp` against a container.
    DockerExec,
    /// Child processes on the orchestrator host.
    Local,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ssh => write!(f, "ssh"),
            Self::DockerExec => write!(f, "docker_exec"),
            Self::Local => write!(f, "local"),
        }
    }
}

impl TransportKind {
    /// Build the transport with its default options.
    #[must_use]
    pub fn build(self) -> Arc<dyn Transport> {
        match self {
            Self::Ssh => Arc::new(SshTransport::new()),
            Self::DockerExec => Arc::new(DockerExecTransport::new()),
            Self::Local => Arc::new(LocalTransport::new()),
        }
    }
}

/// A command to run on a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    args: Vec<String>,
    user: Option<String>,
    env: BTreeMap<String, String>,
    shell: bool,
    tty: bool,
    sudo: bool,
    output: OutputMode,
}

impl Invocation {
    /// Create an invocation from argv entries.
    ///
    /// Arguments are passed literally unless [`Invocation::shell`] is set.
    pub fn new<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            args: args.into_iter().map(Into::into).collect(),
            user: None,
            env: BTreeMap::new(),
            shell: false,
            tty: false,
            sudo: false,
            output: OutputMode::Capture,
        }
    }

    /// Append an argument.
    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Append a path argument.
    #[must_use]
    pub fn arg_path(self, path: &Path) -> Self {
        self.arg(path.display().to_string())
    }

    /// Interpret the joined arguments with a shell (pipes, redirection,
    /// expansion). The caller is responsible for quoting.
    #[must_use]
    pub fn shell(mut self, shell: bool) -> Self {
        self.shell = shell;
        self
    }

    /// Allocate a pseudo-terminal.
    #[must_use]
    pub fn tty(mut self, tty: bool) -> Self {
        self.tty = tty;
        self
    }

    /// Run with `sudo`.
    #[must_use]
    pub fn sudo(mut self, sudo: bool) -> Self {
        self.sudo = sudo;
        self
    }

    /// Run as this user instead of the node default.
    #[must_use]
    pub fn user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    /// Set an environment variable for the remote command.
    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Set several environment variables for the remote command.
    #[must_use]
    pub fn envs<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.env
            .extend(vars.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    /// Choose what happens to output besides capture.
    #[must_use]
    pub fn output(mut self, output: OutputMode) -> Self {
        self.output = output;
        self
    }

    /// Argument vector.
    #[must_use]
    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// User override, if any.
    #[must_use]
    pub fn user_override(&self) -> Option<&str> {
        self.user.as_deref()
    }

    /// Environment overrides.
    #[must_use]
    pub fn env_vars(&self) -> &BTreeMap<String, String> {
        &self.env
    }

    /// Whether the arguments go through a shell.
    #[must_use]
    pub fn is_shell(&self) -> bool {
        self.shell
    }

    /// Whether a TTY is requested.
    #[must_use]
    pub fn is_tty(&self) -> bool {
        self.tty
    }

    /// Whether `sudo` is requested.
    #[must_use]
    pub fn is_sudo(&self) -> bool {
        self.sudo
    }

    /// Output handling mode.
    #[must_use]
    pub fn output_mode(&self) -> OutputMode {
        self.output
    }

    /// The command portion as one shell line.
    ///
    /// Literal arguments are quoted so a remote shell sees them verbatim;
    /// shell arguments are joined as given.
    ///
    /// # Errors
    /// Returns an error if there are no arguments or one contains a NUL byte.
    pub fn command_line(&self) -> Result<String> {
        if self.args.is_empty() {
            return Err(Error::Configuration("Empty command".into()));
        }
        let line = if self.shell {
            self.args.join(" ")
        } else {
            quote_all(&self.args)?
        };
        Ok(if self.sudo {
            format!("sudo -E {line}")
        } else {
            line
        })
    }

    /// `export` statements for the environment overrides, ending in `&& `
    /// when non-empty.
    ///
    /// # Errors
    /// Returns an error if a value cannot be quoted.
    pub fn export_prefix(&self) -> Result<String> {
        let mut prefix = String::new();
        for (key, value) in &self.env {
            prefix.push_str(&format!("export {key}={} && ", quote(value)?));
        }
        Ok(prefix)
    }
}

/// Captured result of a completed command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code; `None` when terminated by a signal.
    pub exit_code: Option<i32>,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
}

impl CommandOutput {
    /// Whether the command exited zero.
    #[must_use]
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Strategy for reaching a node.
///
/// Implementations only build commands; [`Node`] drives them through the
/// shared process runner, so one node's operations run one at a time from
/// the caller's point of view.
pub trait Transport: Send + Sync + fmt::Debug {
    /// Which transport this is.
    fn kind(&self) -> TransportKind;

    /// Build the local command that runs `invocation` on `node` as `user`.
    ///
    /// # Errors
    /// Returns an error if the node lacks what this transport needs.
    fn command(&self, node: &Node, invocation: &Invocation, user: &str) -> Result<Command>;

    /// Build the local command that copies `local` (file or directory) to
    /// `remote` on `node`.
    ///
    /// # Errors
    /// Returns an error if the node lacks what this transport needs.
    fn send_file_command(
        &self,
        node: &Node,
        local: &Path,
        remote: &Path,
        user: &str,
    ) -> Result<Command>;

    /// Build the local command that copies `remote` on `node` to `local`.
    ///
    /// # Errors
    /// Returns an error if the node lacks what this transport needs.
    fn download_file_command(
        &self,
        node: &Node,
        remote: &Path,
        local: &Path,
        user: &str,
    ) -> Result<Command>;

    /// Whether a failed exit means the node was never reached.
    fn is_connection_failure(&self, _exit_code: Option<i32>, _stderr: &str) -> bool {
        false
    }
}

fn quote(value: &str) -> Result<String> {
    shlex::try_quote(value)
        .map(std::borrow::Cow::into_owned)
        .map_err(|e| Error::Configuration(format!("Cannot quote {value:?}: {e}")))
}

fn quote_all(args: &[String]) -> Result<String> {
    let quoted = args.iter().map(|a| quote(a)).collect::<Result<Vec<_>>>()?;
    Ok(quoted.join(" "))
}
