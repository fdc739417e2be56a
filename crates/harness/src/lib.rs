//! Orchestration of throwaway DC/OS clusters for integration testing.
//!
//! A [`ClusterBackend`] describes an infrastructure substrate (containers,
//! cloud instances, pre-built VMs). [`Cluster::create`] provisions nodes
//! through it, [`Cluster::install_from_path`] or
//! [`Cluster::install_from_url`] install DC/OS in four barrier-separated
//! phases, [`Cluster::wait_for_dcos_oss`] and [`Cluster::wait_for_dcos_ee`]
//! poll until the cluster is healthy, and [`Cluster::destroy`] tears it all
//! down again. [`Cluster::scoped`] ties teardown to the end of a block.
//!
//! Commands reach nodes through a [`Transport`]: SSH, `docker exec` or the
//! local shell.

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod backend;
pub mod cluster;
pub mod config;
pub mod error;
pub mod exec;
pub mod install;
pub mod node;
pub mod readiness;
pub mod retry;

pub use backend::{
    backend_node, ClusterBackend, ClusterManager, ClusterRequest, InstallMethod,
    ProvisionRequest, ProvisionedNodes, VolumeMount,
};
pub use cluster::Cluster;
pub use config::{DcosConfig, HarnessSettings};
pub use error::{Error, NodeLog, Result};
pub use exec::{
    CommandOutput, DockerExecTransport, Invocation, LocalTransport, OutputMode, SshTransport,
    Transport, TransportKind,
};
pub use install::{
    DcosVariant, EnterpriseCredentials, InstallOptions, InstallState, StagedFile,
    VariantSelection,
};
pub use node::{Node, Role};
pub use readiness::WaitOptions;
pub use retry::RetryConfig;
