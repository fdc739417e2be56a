//! The cluster handle: provisioning, install, readiness and teardown.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::net::IpAddr;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};

use chrono::Utc;
use futures::future::{join_all, BoxFuture};
use futures::FutureExt;
use tracing::{debug, error, info, warn};
use url::Url;
use uuid::Uuid;

use crate::backend::{
    validate_backend, ClusterBackend, ClusterManager, ClusterRequest, InstallMethod,
};
use crate::config::{DcosConfig, DEFAULT_INSTALLER_WORKDIR};
use crate::error::{Error, Result};
use crate::exec::{CommandOutput, Invocation};
use crate::install::{
    detect_local, DcosVariant, InstallOptions, InstallProtocol, InstallSession, InstallSource,
    InstallState, Phase, Transition,
};
use crate::node::{Node, Role};
use crate::readiness::{master_url, ReadinessPoller, WaitOptions};

/// Environment the integration tests expect to have sourced.
const ENVIRONMENT_EXPORT: &str = "/opt/mesosphere/environment.export";

/// Where the integration test suite is installed on masters.
const INTEGRATION_TEST_DIR: &str = "/opt/mesosphere/active/dcos-integration-test";

/// A set of nodes running, or about to run, DC/OS.
///
/// Clusters created through a backend own their infrastructure and must be
/// torn down with [`Cluster::destroy`] (or used through [`Cluster::scoped`]).
/// Clusters built with [`Cluster::from_nodes`] wrap existing infrastructure
/// and can neither be installed nor destroyed.
pub struct Cluster {
    id: Uuid,
    masters: Vec<Node>,
    agents: Vec<Node>,
    public_agents: Vec<Node>,
    base_config: DcosConfig,
    install_methods: BTreeSet<InstallMethod>,
    installer_workdir: PathBuf,
    ip_detect: Option<PathBuf>,
    manager: Option<Box<dyn ClusterManager>>,
    state: InstallState,
    transitions: Vec<Transition>,
    variant: Option<DcosVariant>,
    login: Option<(String, String)>,
    ca_certificate: Option<String>,
    destroy_on_error: bool,
    destroy_on_success: bool,
    keep_running: bool,
}

impl fmt::Debug for Cluster {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cluster")
            .field("id", &self.id)
            .field("masters", &self.masters)
            .field("agents", &self.agents)
            .field("public_agents", &self.public_agents)
            .field("state", &self.state)
            .field("variant", &self.variant)
            .finish_non_exhaustive()
    }
}

impl Cluster {
    /// Provision a cluster through `backend`.
    ///
    /// The provisioned node counts are checked against the request; on a
    /// mismatch the infrastructure is torn down again.
    ///
    /// # Errors
    /// Returns [`Error::Configuration`] for an invalid backend or request and
    /// [`Error::Provisioning`] if the backend fails or delivers the wrong
    /// nodes.
    pub async fn create(backend: &dyn ClusterBackend, request: ClusterRequest) -> Result<Self> {
        validate_backend(backend)?;
        if request.masters == 0 {
            return Err(Error::Configuration(
                "A cluster needs at least one master".into(),
            ));
        }

        let id = Uuid::new_v4();
        info!(
            cluster = %id,
            masters = request.masters,
            agents = request.agents,
            public_agents = request.public_agents,
            "Provisioning cluster"
        );

        let mut manager = backend.cluster_manager(&request).await?;
        let provisioned = match manager.provision(&request.provision_request()).await {
            Ok(nodes) => nodes,
            Err(e) => {
                error!(cluster = %id, error = %e, "Provisioning failed");
                teardown_after_failure(&mut *manager).await;
                return Err(e);
            }
        };

        let counts = [
            (Role::Master, provisioned.masters.len()),
            (Role::Agent, provisioned.agents.len()),
            (Role::PublicAgent, provisioned.public_agents.len()),
        ];
        for (role, got) in counts {
            let wanted = request.count(role);
            if got != wanted {
                error!(
                    cluster = %id,
                    role = %role,
                    wanted,
                    got,
                    "Backend delivered the wrong number of nodes"
                );
                teardown_after_failure(&mut *manager).await;
                return Err(Error::Provisioning(format!(
                    "Requested {wanted} {role} node(s), backend created {got}"
                )));
            }
        }

        let mut cluster = Self::assemble(
            id,
            tag(provisioned.masters, Role::Master),
            tag(provisioned.agents, Role::Agent),
            tag(provisioned.public_agents, Role::PublicAgent),
        );
        cluster.base_config = backend.base_config();
        cluster.install_methods = backend.supported_install_methods();
        cluster.installer_workdir = backend.installer_workdir();
        cluster.ip_detect = backend.ip_detect_script_path();
        cluster.manager = Some(manager);
        cluster.destroy_on_error = request.destroy_on_error;
        cluster.destroy_on_success = request.destroy_on_success;
        cluster.transition(InstallState::Uninstalled);

        info!(cluster = %id, "Cluster provisioned");
        Ok(cluster)
    }

    /// Provision a cluster, hand it to `body`, and tear it down afterwards.
    ///
    /// Teardown follows the request's `destroy_on_success` and
    /// `destroy_on_error` flags. A panic in `body` is re-raised after
    /// teardown.
    ///
    /// ```no_run
    /// # use dcos_harness::{Cluster, ClusterBackend, ClusterRequest, WaitOptions};
    /// # async fn demo(backend: &dyn ClusterBackend) -> dcos_harness::Result<()> {
    /// Cluster::scoped(backend, ClusterRequest::new(1, 1, 0), |cluster| {
    ///     Box::pin(async move { cluster.wait_for_dcos_oss(&WaitOptions::default()).await })
    /// })
    /// .await
    /// # }
    /// ```
    ///
    /// # Errors
    /// Returns the body's error, or the teardown error if the body
    /// succeeded but teardown did not.
    pub async fn scoped<F, T>(
        backend: &dyn ClusterBackend,
        request: ClusterRequest,
        body: F,
    ) -> Result<T>
    where
        F: for<'c> FnOnce(&'c mut Cluster) -> BoxFuture<'c, Result<T>>,
        T: 'static,
    {
        let mut cluster = Self::create(backend, request).await?;
        let outcome = AssertUnwindSafe(body(&mut cluster)).catch_unwind().await;

        let succeeded = matches!(outcome, Ok(Ok(_)));
        let destroy = if succeeded {
            cluster.destroy_on_success
        } else {
            cluster.destroy_on_error
        };

        let teardown = if destroy {
            cluster.destroy().await
        } else {
            info!(cluster = %cluster.id, succeeded, "Leaving cluster running");
            cluster.keep_running = true;
            Ok(())
        };

        match outcome {
            Err(panic) => {
                if let Err(e) = teardown {
                    error!(cluster = %cluster.id, error = %e, "Teardown after panic failed");
                }
                std::panic::resume_unwind(panic)
            }
            Ok(Err(e)) => {
                if let Err(teardown_error) = teardown {
                    error!(
                        cluster = %cluster.id,
                        error = %teardown_error,
                        "Teardown after failure failed"
                    );
                }
                Err(e)
            }
            Ok(Ok(value)) => teardown.map(|()| value),
        }
    }

    /// Wrap nodes of a cluster that already runs DC/OS.
    ///
    /// The cluster starts as [`InstallState::AssumedInstalled`]; install and
    /// destroy are rejected.
    ///
    /// # Errors
    /// Returns [`Error::Configuration`] if `masters` is empty.
    pub fn from_nodes(
        masters: Vec<Node>,
        agents: Vec<Node>,
        public_agents: Vec<Node>,
    ) -> Result<Self> {
        if masters.is_empty() {
            return Err(Error::Configuration(
                "A cluster needs at least one master".into(),
            ));
        }
        let mut cluster = Self::assemble(
            Uuid::new_v4(),
            tag(masters, Role::Master),
            tag(agents, Role::Agent),
            tag(public_agents, Role::PublicAgent),
        );
        cluster.transition(InstallState::AssumedInstalled);
        Ok(cluster)
    }

    fn assemble(id: Uuid, masters: Vec<Node>, agents: Vec<Node>, public_agents: Vec<Node>) -> Self {
        Self {
            id,
            masters,
            agents,
            public_agents,
            base_config: DcosConfig::new(),
            install_methods: BTreeSet::new(),
            installer_workdir: PathBuf::from(DEFAULT_INSTALLER_WORKDIR),
            ip_detect: None,
            manager: None,
            state: InstallState::Uninstalled,
            transitions: Vec::new(),
            variant: None,
            login: None,
            ca_certificate: None,
            destroy_on_error: true,
            destroy_on_success: true,
            keep_running: false,
        }
    }

    /// Install DC/OS from a local installer file.
    ///
    /// # Errors
    /// See [`Cluster::install_from_url`].
    pub async fn install_from_path(
        &mut self,
        installer: &Path,
        options: &InstallOptions,
    ) -> Result<()> {
        self.install(InstallSource::Path(installer.to_path_buf()), options)
            .await
    }

    /// Install DC/OS from an installer URL, downloaded by the installer node.
    ///
    /// # Errors
    /// - [`Error::Configuration`] if the cluster is not installable, the
    ///   backend does not support this install method, or the inputs are
    ///   invalid. The cluster stays `Uninstalled`. Without a declared
    ///   variant the installer has been downloaded to inspect it, otherwise
    ///   nothing remote has run.
    /// - [`Error::InstallPhase`] wrapping the failure of a phase, with
    ///   journal output from every node. The cluster is then `Failed`.
    /// - [`Error::Connection`] if a node became unreachable mid-install.
    pub async fn install_from_url(&mut self, url: &Url, options: &InstallOptions) -> Result<()> {
        self.install(InstallSource::Url(url.clone()), options).await
    }

    async fn install(&mut self, source: InstallSource, options: &InstallOptions) -> Result<()> {
        self.ensure_installable()?;
        let method = source.method();
        if !self.install_methods.contains(&method) {
            return Err(Error::Configuration(format!(
                "Backend does not support {method}"
            )));
        }

        let installer = self.first_master()?.clone();
        let nodes = self.nodes();
        let workdir = options
            .installer_workdir
            .clone()
            .unwrap_or_else(|| self.installer_workdir.clone());
        let ip_detect = self.ip_detect.clone();

        let mut session = InstallSession::new(source, &self.base_config, options, &workdir)?;
        let protocol = InstallProtocol::new(&installer, &nodes, options, ip_detect.as_deref());
        match (options.variant.declared(), session.source().clone()) {
            (Some(variant), _) => {
                session.resolve_variant(Some(variant), None)?;
            }
            (None, InstallSource::Path(path)) => {
                let details = detect_local(&path).await?;
                session.resolve_variant(None, Some(&details))?;
            }
            // Only the installer node can look inside a download. Doing it
            // now keeps a variant mismatch from failing the cluster.
            (None, InstallSource::Url(_)) => {
                protocol.fetch_installer(&mut session).await?;
                protocol.detect_variant(&mut session).await?;
            }
        }

        info!(
            cluster = %self.id,
            source = %session.source(),
            installer = %installer,
            variant = ?session.variant(),
            "Installing DC/OS"
        );
        self.transition(InstallState::Installing);

        for phase in [Phase::Stage, Phase::Prepare, Phase::Deploy, Phase::Postflight] {
            if let Err(e) = protocol.run(phase, &mut session).await {
                self.transition(InstallState::Failed);
                error!(cluster = %self.id, phase = %phase, error = %e, "Install failed");
                if matches!(e, Error::Connection { .. }) {
                    return Err(e);
                }
                let node_logs = protocol.collect_logs().await;
                return Err(Error::InstallPhase {
                    phase: phase.to_string(),
                    source: Box::new(e),
                    node_logs,
                });
            }
        }

        self.variant = session.variant();
        if let Some(credentials) = &options.enterprise {
            if let Some(password) = &credentials.superuser_password {
                self.login = Some((credentials.superuser_username.clone(), password.clone()));
            }
        }
        self.transition(InstallState::Installed);
        info!(cluster = %self.id, "DC/OS installed");
        Ok(())
    }

    fn ensure_installable(&self) -> Result<()> {
        match self.state {
            InstallState::Uninstalled => Ok(()),
            InstallState::AssumedInstalled => Err(Error::Configuration(
                "Clusters built from existing nodes cannot be installed".into(),
            )),
            state => Err(Error::Configuration(format!(
                "Cannot install a cluster that is {state}"
            ))),
        }
    }

    /// Wait until an open source cluster reports every unit healthy.
    ///
    /// # Errors
    /// Returns [`Error::Timeout`] if the cluster is not healthy in time.
    pub async fn wait_for_dcos_oss(&self, options: &WaitOptions) -> Result<()> {
        let base = self.endpoint("http", options)?;
        ReadinessPoller::new(base, options.clone())
            .wait_for_oss()
            .await
    }

    /// Wait until an enterprise cluster accepts the superuser and reports
    /// every unit healthy. The cluster CA certificate is kept afterwards.
    ///
    /// # Errors
    /// Returns [`Error::Timeout`] if the cluster is not healthy in time and
    /// [`Error::Authentication`] if the credentials are rejected.
    pub async fn wait_for_dcos_ee(
        &mut self,
        username: &str,
        password: &str,
        options: &WaitOptions,
    ) -> Result<()> {
        let base = self.endpoint("https", options)?;
        let ca = ReadinessPoller::new(base, options.clone())
            .wait_for_ee(username, password)
            .await?;
        self.ca_certificate = Some(ca);
        self.login = Some((username.to_string(), password.to_string()));
        Ok(())
    }

    fn endpoint(&self, scheme: &str, options: &WaitOptions) -> Result<Url> {
        if self.state == InstallState::Destroyed {
            return Err(Error::Configuration("Cluster has been destroyed".into()));
        }
        match &options.endpoint {
            Some(endpoint) => Ok(endpoint.clone()),
            None => master_url(scheme, self.first_master()?.public_address()),
        }
    }

    /// Run the DC/OS integration test suite on the first master.
    ///
    /// `invocation` is the test command (for example
    /// `pytest -x test_applications.py`). It runs from the test suite
    /// directory with the cluster environment sourced and the node lists
    /// exported.
    ///
    /// # Errors
    /// Returns [`Error::CommandExecution`] if the tests fail.
    pub async fn run_integration_tests(&self, invocation: &Invocation) -> Result<CommandOutput> {
        let master = self.first_master()?;
        let command = invocation.command_line()?;
        let script = format!(". {ENVIRONMENT_EXPORT} && cd {INTEGRATION_TEST_DIR} && {command}");

        let mut wrapped = Invocation::new(["sh", "-c"])
            .arg(script)
            .tty(invocation.is_tty())
            .output(invocation.output_mode())
            .envs(self.test_environment())
            .envs(invocation.env_vars().clone());
        if let Some(user) = invocation.user_override() {
            wrapped = wrapped.user(user);
        }

        info!(cluster = %self.id, node = %master, "Running integration tests");
        master.run(&wrapped).await
    }

    fn test_environment(&self) -> BTreeMap<String, String> {
        let hosts = |nodes: &[Node], address: fn(&Node) -> IpAddr| {
            nodes
                .iter()
                .map(|n| address(n).to_string())
                .collect::<Vec<_>>()
                .join(",")
        };

        let mut env = BTreeMap::from([
            ("MASTER_HOSTS".to_string(), hosts(&self.masters, Node::private_address)),
            ("SLAVE_HOSTS".to_string(), hosts(&self.agents, Node::private_address)),
            ("PUBLIC_SLAVE_HOSTS".to_string(), hosts(&self.public_agents, Node::private_address)),
            ("PUBLIC_MASTER_HOSTS".to_string(), hosts(&self.masters, Node::public_address)),
        ]);
        if let Some((username, password)) = &self.login {
            env.insert("DCOS_LOGIN_UNAME".to_string(), username.clone());
            env.insert("DCOS_LOGIN_PW".to_string(), password.clone());
        }
        env
    }

    /// Run `invocation` on every node of `role` concurrently.
    ///
    /// Returns one result per node, in node order.
    pub async fn run_on_role(
        &self,
        role: Role,
        invocation: &Invocation,
    ) -> Vec<(Node, Result<CommandOutput>)> {
        let nodes = self.role_nodes(role);
        let results = join_all(nodes.iter().map(|node| node.run(invocation))).await;
        nodes.iter().cloned().zip(results).collect()
    }

    /// Drop `node` from the cluster; with `destroy`, also tear it down.
    ///
    /// # Errors
    /// Returns [`Error::Configuration`] if the node is not part of the
    /// cluster, is its last master, or if `destroy` is requested on a
    /// cluster without a backend.
    pub async fn remove_node(&mut self, node: &Node, destroy: bool) -> Result<()> {
        let Some(role) = Role::ALL
            .into_iter()
            .find(|role| self.role_nodes(*role).contains(node))
        else {
            return Err(Error::Configuration(format!(
                "Node {node} is not part of this cluster"
            )));
        };

        if role == Role::Master && self.masters.len() == 1 {
            return Err(Error::Configuration(format!(
                "Node {node} is the last master and cannot be removed"
            )));
        }

        if destroy {
            let manager = self.manager.as_mut().ok_or_else(|| {
                Error::Configuration("Cluster has no backend to destroy nodes with".into())
            })?;
            info!(cluster = %self.id, node = %node, role = %role, "Destroying node");
            manager.destroy_node(node).await?;
        }

        let set = match role {
            Role::Master => &mut self.masters,
            Role::Agent => &mut self.agents,
            Role::PublicAgent => &mut self.public_agents,
        };
        set.retain(|n| n != node);
        debug!(cluster = %self.id, node = %node, role = %role, "Node removed");
        Ok(())
    }

    /// Tear the cluster down. A second call does nothing.
    ///
    /// # Errors
    /// Returns [`Error::Configuration`] for clusters built from existing
    /// nodes, or the backend's error.
    pub async fn destroy(&mut self) -> Result<()> {
        match self.state {
            InstallState::AssumedInstalled => Err(Error::Configuration(
                "Clusters built from existing nodes cannot be destroyed".into(),
            )),
            InstallState::Destroyed => {
                debug!(cluster = %self.id, "Cluster already destroyed");
                Ok(())
            }
            _ => {
                let manager = self.manager.as_mut().ok_or_else(|| {
                    Error::Configuration("Cluster has no backend to destroy it with".into())
                })?;
                info!(cluster = %self.id, "Destroying cluster");
                manager.destroy().await?;
                self.transition(InstallState::Destroyed);
                Ok(())
            }
        }
    }

    fn transition(&mut self, state: InstallState) {
        debug!(cluster = %self.id, from = %self.state, to = %state, "Cluster state change");
        self.state = state;
        self.transitions.push(Transition {
            state,
            at: Utc::now(),
        });
    }

    fn first_master(&self) -> Result<&Node> {
        self.masters
            .first()
            .ok_or_else(|| Error::Configuration("Cluster has no master".into()))
    }

    fn role_nodes(&self, role: Role) -> &[Node] {
        match role {
            Role::Master => &self.masters,
            Role::Agent => &self.agents,
            Role::PublicAgent => &self.public_agents,
        }
    }

    /// All nodes, masters first.
    #[must_use]
    pub fn nodes(&self) -> Vec<Node> {
        self.masters
            .iter()
            .chain(&self.agents)
            .chain(&self.public_agents)
            .cloned()
            .collect()
    }

    /// Identifier used in log output.
    #[must_use]
    pub fn id(&self) -> Uuid {
        self.id
    }

    #[must_use]
    pub fn masters(&self) -> &[Node] {
        &self.masters
    }

    #[must_use]
    pub fn agents(&self) -> &[Node] {
        &self.agents
    }

    #[must_use]
    pub fn public_agents(&self) -> &[Node] {
        &self.public_agents
    }

    /// Current install state.
    #[must_use]
    pub fn state(&self) -> InstallState {
        self.state
    }

    /// Every state entered so far, oldest first.
    #[must_use]
    pub fn transitions(&self) -> &[Transition] {
        &self.transitions
    }

    /// Variant installed, once known.
    #[must_use]
    pub fn variant(&self) -> Option<DcosVariant> {
        self.variant
    }

    /// Config the backend starts every install from.
    #[must_use]
    pub fn base_config(&self) -> &DcosConfig {
        &self.base_config
    }

    /// CA certificate (PEM) of an enterprise cluster, once waited for.
    #[must_use]
    pub fn ca_certificate(&self) -> Option<&str> {
        self.ca_certificate.as_deref()
    }
}

impl Drop for Cluster {
    fn drop(&mut self) {
        if self.manager.is_some() && self.state != InstallState::Destroyed && !self.keep_running {
            warn!(
                cluster = %self.id,
                state = %self.state,
                "Cluster dropped without being destroyed; its infrastructure is still running"
            );
        }
    }
}

fn tag(nodes: Vec<Node>, role: Role) -> Vec<Node> {
    nodes.into_iter().map(|n| n.with_role(role)).collect()
}

async fn teardown_after_failure(manager: &mut dyn ClusterManager) {
    if let Err(e) = manager.destroy().await {
        warn!(error = %e, "Teardown after failed provisioning also failed");
    }
}
