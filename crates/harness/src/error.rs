//! Error types for cluster orchestration.

use std::time::Duration;

use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors that can occur while provisioning, installing or polling a cluster.
#[derive(Error, Debug)]
pub enum Error {
    /// The transport could not reach the node (unreachable host, auth failure,
    /// missing container). Never retried by the orchestrator.
    #[error("Connection to {node} failed: {message}")]
    Connection { node: String, message: String },

    /// A remote command exited non-zero.
    #[error("Command {args:?} on {node} exited with {exit_code:?}: {}", .stderr.trim())]
    CommandExecution {
        node: String,
        args: Vec<String>,
        exit_code: Option<i32>,
        stdout: String,
        stderr: String,
    },

    /// The cluster did not become ready in time, or a phase deadline expired.
    #[error("Timed out after {}s (last state: {last_state})", .elapsed.as_secs())]
    Timeout {
        elapsed: Duration,
        last_state: String,
    },

    /// Invalid parameter combination, raised before any remote operation.
    #[error("Invalid configuration: {0}")]
    Configuration(String),

    /// The backend failed to create the requested infrastructure.
    #[error("Provisioning failed: {0}")]
    Provisioning(String),

    /// The cluster rejected our credentials.
    #[error("Authentication failed: {status} - {message}")]
    Authentication { status: u16, message: String },

    /// The cluster answered with something we do not understand.
    #[error("Unexpected response: {0}")]
    Protocol(String),

    /// A fatal installation phase failed; carries per-node diagnostics.
    #[error("Install phase '{phase}' failed: {source}")]
    InstallPhase {
        phase: String,
        #[source]
        source: Box<Error>,
        node_logs: Vec<NodeLog>,
    },

    /// HTTP request failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Local I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML serialization error.
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Diagnostic log captured from one node after a failed phase.
#[derive(Debug, Clone)]
pub struct NodeLog {
    /// Public address of the node.
    pub node: String,
    /// Captured journal output, or the reason it could not be collected.
    pub log: String,
}

impl Error {
    /// Whether a readiness poll should try again after this error.
    ///
    /// Connection refusals, request timeouts and 5xx answers happen while
    /// services come up. Authentication and protocol errors do not go away
    /// by waiting.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Http(e) => {
                e.is_connect()
                    || e.is_timeout()
                    || e.is_request()
                    || e.status().is_some_and(|s| s.is_server_error())
            }
            _ => false,
        }
    }

    /// Exit code of a failed command, if this is a command failure.
    #[must_use]
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            Self::CommandExecution { exit_code, .. } => *exit_code,
            Self::InstallPhase { source, .. } => source.exit_code(),
            _ => None,
        }
    }
}
