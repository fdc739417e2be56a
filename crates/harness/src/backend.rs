//! Backend contract for provisioning drivers.
//!
//! A backend is split in two: [`ClusterBackend`] carries static knowledge
//! (default config, transport, supported install sources) and builds a
//! [`ClusterManager`], which owns the live infrastructure of one cluster.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::net::IpAddr;
use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::{DcosConfig, HarnessSettings, DEFAULT_INSTALLER_WORKDIR};
use crate::error::{Error, Result};
use crate::exec::TransportKind;
use crate::node::{Node, Role};

/// Ways a backend can get the installer onto its nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstallMethod {
    /// The orchestrator pushes a local installer file.
    FromPath,
    /// The installer node downloads the installer itself.
    FromUrl,
}

impl fmt::Display for InstallMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FromPath => write!(f, "install-from-path"),
            Self::FromUrl => write!(f, "install-from-url"),
        }
    }
}

/// A volume to attach to every node of a role.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeMount {
    /// Source on the host (or backend-specific volume name).
    pub source: String,
    /// Mount point inside the node.
    pub target: PathBuf,
    /// Mount read-only.
    pub read_only: bool,
}

/// Cluster shape requested by the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterRequest {
    /// Number of masters (at least one).
    pub masters: usize,
    /// Number of private agents.
    pub agents: usize,
    /// Number of public agents.
    pub public_agents: usize,
    /// Extra volumes per role.
    pub volumes: BTreeMap<Role, Vec<VolumeMount>>,
    /// Tear down when the scoped body fails.
    pub destroy_on_error: bool,
    /// Tear down when the scoped body succeeds.
    pub destroy_on_success: bool,
}

impl Default for ClusterRequest {
    fn default() -> Self {
        Self {
            masters: 1,
            agents: 1,
            public_agents: 1,
            volumes: BTreeMap::new(),
            destroy_on_error: true,
            destroy_on_success: true,
        }
    }
}

impl ClusterRequest {
    /// Request a cluster with the given role counts.
    #[must_use]
    pub fn new(masters: usize, agents: usize, public_agents: usize) -> Self {
        Self {
            masters,
            agents,
            public_agents,
            ..Self::default()
        }
    }

    /// Attach volumes to every node of `role`.
    #[must_use]
    pub fn with_volumes(mut self, role: Role, volumes: Vec<VolumeMount>) -> Self {
        self.volumes.insert(role, volumes);
        self
    }

    /// Keep the cluster if the scoped body fails.
    #[must_use]
    pub fn destroy_on_error(mut self, destroy: bool) -> Self {
        self.destroy_on_error = destroy;
        self
    }

    /// Keep the cluster if the scoped body succeeds.
    #[must_use]
    pub fn destroy_on_success(mut self, destroy: bool) -> Self {
        self.destroy_on_success = destroy;
        self
    }

    /// Expected node count for `role`.
    #[must_use]
    pub fn count(&self, role: Role) -> usize {
        match role {
            Role::Master => self.masters,
            Role::Agent => self.agents,
            Role::PublicAgent => self.public_agents,
        }
    }

    /// The provisioning part of this request.
    #[must_use]
    pub fn provision_request(&self) -> ProvisionRequest {
        ProvisionRequest {
            masters: self.masters,
            agents: self.agents,
            public_agents: self.public_agents,
            volumes: self.volumes.clone(),
        }
    }
}

/// What a [`ClusterManager`] is asked to create.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionRequest {
    /// Number of masters.
    pub masters: usize,
    /// Number of private agents.
    pub agents: usize,
    /// Number of public agents.
    pub public_agents: usize,
    /// Extra volumes per role.
    pub volumes: BTreeMap<Role, Vec<VolumeMount>>,
}

/// Nodes created by a [`ClusterManager`].
#[derive(Debug, Clone, Default)]
pub struct ProvisionedNodes {
    /// Masters.
    pub masters: Vec<Node>,
    /// Private agents.
    pub agents: Vec<Node>,
    /// Public agents.
    pub public_agents: Vec<Node>,
}

/// Static knowledge about one infrastructure substrate.
#[async_trait]
pub trait ClusterBackend: Send + Sync {
    /// Minimal valid install config for this backend. Deterministic and
    /// free of side effects.
    fn base_config(&self) -> DcosConfig;

    /// Transport nodes of this backend use by default.
    fn default_transport(&self) -> TransportKind;

    /// Install sources this backend supports; must not be empty.
    fn supported_install_methods(&self) -> BTreeSet<InstallMethod>;

    /// Local IP-detection script staged as `genconf/ip-detect`.
    fn ip_detect_script_path(&self) -> Option<PathBuf>;

    /// Installer working directory on the installer node. Staged files must
    /// fall under its `genconf` directory.
    fn installer_workdir(&self) -> PathBuf {
        PathBuf::from(DEFAULT_INSTALLER_WORKDIR)
    }

    /// Build the manager that provisions and owns one cluster.
    async fn cluster_manager(&self, request: &ClusterRequest) -> Result<Box<dyn ClusterManager>>;
}

/// Live infrastructure of one cluster.
#[async_trait]
pub trait ClusterManager: Send + Sync {
    /// Create the nodes. On partial failure, whatever this call created must
    /// be removed before the error is returned.
    async fn provision(&mut self, request: &ProvisionRequest) -> Result<ProvisionedNodes>;

    /// Remove everything. Calling it again is a no-op.
    async fn destroy(&mut self) -> Result<()>;

    /// Remove a single node.
    async fn destroy_node(&mut self, node: &Node) -> Result<()> {
        Err(Error::Configuration(format!(
            "This backend cannot destroy individual nodes ({node})"
        )))
    }
}

/// A node on `backend`'s default transport, logged in as the configured
/// user with the configured SSH key.
///
/// Cluster managers use this to hand out the nodes they create.
#[must_use]
pub fn backend_node(
    backend: &dyn ClusterBackend,
    settings: &HarnessSettings,
    public_address: IpAddr,
    private_address: IpAddr,
) -> Node {
    let node = Node::new(
        public_address,
        private_address,
        settings.default_user.clone(),
        backend.default_transport().build(),
    );
    match &settings.ssh_key_path {
        Some(key) => node.with_ssh_key_path(key.clone()),
        None => node,
    }
}

/// Reject backends that declare no install method.
///
/// # Errors
/// Returns [`Error::Configuration`] for an empty method set.
pub fn validate_backend(backend: &dyn ClusterBackend) -> Result<()> {
    if backend.supported_install_methods().is_empty() {
        return Err(Error::Configuration(
            "Backend supports neither install-from-path nor install-from-url".into(),
        ));
    }
    Ok(())
}
