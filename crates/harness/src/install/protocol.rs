//! The four install phases, run against every node.

use std::path::Path;

use futures::future::join_all;
use tracing::{error, info, warn};

use super::session::InstallSession;
use super::variant::detect_remote;
use super::{InstallOptions, InstallSource, Phase};
use crate::error::{Error, NodeLog, Result};
use crate::exec::{CommandOutput, Invocation};
use crate::node::{Node, Role};
use crate::retry::{with_retry_async, RetryConfig};

/// Lines of journal collected from each node after a failure.
const DIAGNOSTIC_LOG_LINES: &str = "200";

/// Environment variable carrying the superuser password to the hasher.
const PASSWORD_ENV: &str = "DCOS_SUPERUSER_PASSWORD";

/// Drives the install phases for one cluster.
pub(crate) struct InstallProtocol<'a> {
    installer: &'a Node,
    nodes: &'a [Node],
    options: &'a InstallOptions,
    ip_detect: Option<&'a Path>,
}

impl<'a> InstallProtocol<'a> {
    /// `nodes` must all carry a role; `installer` is one of them.
    pub(crate) fn new(
        installer: &'a Node,
        nodes: &'a [Node],
        options: &'a InstallOptions,
        ip_detect: Option<&'a Path>,
    ) -> Self {
        Self {
            installer,
            nodes,
            options,
            ip_detect,
        }
    }

    /// Run one phase to completion on every node, bounded by the phase
    /// deadline if one is configured.
    pub(crate) async fn run(&self, phase: Phase, session: &mut InstallSession) -> Result<()> {
        info!(phase = %phase, nodes = self.nodes.len(), "Starting install phase");
        let work = async {
            match phase {
                Phase::Stage => self.stage(session).await,
                Phase::Prepare => self.prepare(session).await,
                Phase::Deploy => self.deploy(session).await,
                Phase::Postflight => self.postflight().await,
            }
        };

        match self.options.phase_timeout {
            Some(deadline) => tokio::time::timeout(deadline, work)
                .await
                .map_err(|_| Error::Timeout {
                    elapsed: deadline,
                    last_state: format!("{phase} phase still running"),
                })?,
            None => work.await,
        }?;

        info!(phase = %phase, "Install phase complete");
        Ok(())
    }

    /// Put the installer in the working directory on the installer node.
    /// Staging skips this if it already happened.
    pub(crate) async fn fetch_installer(&self, session: &mut InstallSession) -> Result<()> {
        let installer_path = session.installer_path();
        self.claim(self.installer, session, &session.genconf_dir())
            .await?;

        match session.source().clone() {
            InstallSource::Path(local) => {
                self.installer
                    .send_file(&local, &installer_path, None)
                    .await?;
            }
            InstallSource::Url(url) => {
                info!(node = %self.installer, url = %url, "Downloading installer");
                let fetch = Invocation::new([
                    "curl",
                    "--fail",
                    "--location",
                    "--silent",
                    "--show-error",
                    "--output",
                ])
                .arg_path(&installer_path)
                .arg(url.as_str());
                self.run_on(self.installer, fetch).await?;
            }
        }
        session.mark_installer_fetched();
        Ok(())
    }

    /// Ask the fetched installer which variant it is.
    pub(crate) async fn detect_variant(&self, session: &mut InstallSession) -> Result<()> {
        let details = detect_remote(self.installer, &session.installer_path()).await?;
        session.resolve_variant(None, Some(&details))?;
        Ok(())
    }

    async fn stage(&self, session: &mut InstallSession) -> Result<()> {
        let installer_path = session.installer_path();
        let genconf = session.genconf_dir();

        if !session.installer_fetched() {
            self.fetch_installer(session).await?;
        }
        if session.variant().is_none() {
            self.detect_variant(session).await?;
        }

        if let Some(password) = session.password_to_hash().map(str::to_string) {
            // Handed over through the environment so it stays out of
            // recorded command lines and error reports.
            let hash_cmd = Invocation::new(["sh", "-c"])
                .arg(format!(
                    "bash {} --hash-password \"${PASSWORD_ENV}\"",
                    quote(&installer_path)?
                ))
                .env(PASSWORD_ENV, password);
            let hash = self.run_on(self.installer, hash_cmd).await?;
            let hash = hash
                .stdout
                .lines()
                .map(str::trim)
                .rfind(|l| !l.is_empty())
                .ok_or_else(|| Error::Protocol("Installer printed no password hash".into()))?
                .to_string();
            session.set_password_hash(hash);
        }

        let scratch = tempfile::tempdir()?;
        let config_path = scratch.path().join("config.yaml");
        std::fs::write(&config_path, session.config_yaml()?)?;
        self.installer
            .send_file(&config_path, &genconf.join("config.yaml"), None)
            .await?;

        if let Some(ip_detect) = self.ip_detect {
            self.installer
                .send_file(ip_detect, &genconf.join("ip-detect"), None)
                .await?;
        }

        for file in session.files() {
            self.installer
                .send_file(&file.local, &file.remote, None)
                .await?;
        }

        // Wrapped in `sh -c` so a sudo prefix applies to the whole line.
        let genconf_cmd = Invocation::new(["sh", "-c"]).arg(format!(
            "cd {} && bash dcos_generate_config.sh --genconf",
            quote(session.workdir())?
        ));
        self.run_on(self.installer, genconf_cmd).await?;

        // The bundle is written by root; take it back for the download.
        self.claim(self.installer, session, session.workdir())
            .await?;
        self.distribute_bundle(session, scratch.path()).await
    }

    /// Copy the generated bundle from the installer node to every other node.
    async fn distribute_bundle(&self, session: &InstallSession, scratch: &Path) -> Result<()> {
        let others: Vec<&Node> = self
            .nodes
            .iter()
            .filter(|n| *n != self.installer)
            .collect();
        if others.is_empty() {
            return Ok(());
        }

        let serve = session.serve_dir();
        let local_serve = scratch.join("serve");
        self.installer.download_file(&serve, &local_serve).await?;

        let results = join_all(others.iter().map(|node| {
            let local_serve = &local_serve;
            let serve = &serve;
            async move {
                self.claim(node, session, session.workdir()).await?;
                node.send_file(local_serve, serve, None).await
            }
        }))
        .await;
        first_failure(Phase::Stage, others.iter().copied().zip(results))
    }

    async fn prepare(&self, session: &InstallSession) -> Result<()> {
        let script = session.serve_dir().join("dcos_install.sh");
        self.on_every_node(Phase::Prepare, &self.options.prepare_retry, |role| {
            Invocation::new(["bash"])
                .arg_path(&script)
                .arg("--preflight-only")
                .arg(role.installer_arg())
        })
        .await
    }

    async fn deploy(&self, session: &InstallSession) -> Result<()> {
        let script = session.serve_dir().join("dcos_install.sh");
        self.on_every_node(Phase::Deploy, &RetryConfig::once(), |role| {
            Invocation::new(["bash"])
                .arg_path(&script)
                .arg("--no-block-dcos-setup")
                .arg("--disable-preflight")
                .arg(role.installer_arg())
        })
        .await
    }

    async fn postflight(&self) -> Result<()> {
        self.on_every_node(Phase::Postflight, &self.options.postflight_retry, |_| {
            Invocation::new([
                "/opt/mesosphere/bin/dcos-shell",
                "dcos-diagnostics",
                "check",
                "node-poststart",
            ])
        })
        .await
    }

    /// Run the per-role command on all nodes concurrently and wait for all
    /// of them. Only command failures are retried.
    async fn on_every_node<F>(&self, phase: Phase, retry: &RetryConfig, command: F) -> Result<()>
    where
        F: Fn(Role) -> Invocation,
    {
        let mut work = Vec::with_capacity(self.nodes.len());
        for node in self.nodes {
            let role = node.role().ok_or_else(|| {
                Error::Configuration(format!("Node {node} has no role for the {phase} phase"))
            })?;
            let invocation = self.prepared(node, command(role));
            let operation = format!("{phase} on {node}");
            work.push(async move {
                with_retry_async(
                    retry,
                    &operation,
                    |e| matches!(e, Error::CommandExecution { .. }),
                    || node.run(&invocation),
                )
                .await
            });
        }

        let results = join_all(work).await;
        first_failure(phase, self.nodes.iter().zip(results))
    }

    /// Create `dir` and, for a non-root login, hand the working directory
    /// to that user so file transfers can write into it.
    async fn claim(&self, node: &Node, session: &InstallSession, dir: &Path) -> Result<()> {
        let mkdir = format!("mkdir -p {}", quote(dir)?);
        let user = node.default_user();
        let line = if user == "root" {
            mkdir
        } else {
            let owner = shlex::try_quote(user)
                .map_err(|e| Error::Configuration(format!("Cannot quote user {user:?}: {e}")))?;
            format!("{mkdir} && chown -R {owner} {}", quote(session.workdir())?)
        };
        self.run_on(node, Invocation::new(["sh", "-c"]).arg(line))
            .await?;
        Ok(())
    }

    async fn run_on(&self, node: &Node, invocation: Invocation) -> Result<CommandOutput> {
        node.run(&self.prepared(node, invocation)).await
    }

    fn prepared(&self, node: &Node, invocation: Invocation) -> Invocation {
        invocation
            .sudo(node.default_user() != "root")
            .output(self.options.output)
    }

    /// Best-effort journal tail from every node.
    pub(crate) async fn collect_logs(&self) -> Vec<NodeLog> {
        let results = join_all(self.nodes.iter().map(|node| {
            let invocation = self.prepared(
                node,
                Invocation::new(["journalctl", "--no-pager", "-n", DIAGNOSTIC_LOG_LINES]),
            );
            async move { node.run(&invocation).await }
        }))
        .await;

        self.nodes
            .iter()
            .zip(results)
            .map(|(node, result)| {
                let log = match result {
                    Ok(output) => output.stdout,
                    Err(e) => {
                        warn!(node = %node, error = %e, "Could not collect diagnostics");
                        format!("<unavailable: {e}>")
                    }
                };
                NodeLog {
                    node: node.to_string(),
                    log,
                }
            })
            .collect()
    }
}

fn first_failure<'n, I, T>(phase: Phase, results: I) -> Result<()>
where
    I: IntoIterator<Item = (&'n Node, Result<T>)>,
{
    let mut first = None;
    for (node, result) in results {
        if let Err(e) = result {
            error!(phase = %phase, node = %node, error = %e, "Node failed install phase");
            first.get_or_insert(e);
        }
    }
    first.map_or(Ok(()), Err)
}

fn quote(path: &Path) -> Result<String> {
    let text = path.display().to_string();
    shlex::try_quote(&text)
        .map(std::borrow::Cow::into_owned)
        .map_err(|e| Error::Configuration(format!("Cannot quote {text:?}: {e}")))
}
