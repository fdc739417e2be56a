//! Fake backend and scripted transport shared by the integration tests.

#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use dcos_harness::{
    ClusterBackend, ClusterManager, ClusterRequest, DcosConfig, Error, InstallMethod, Invocation,
    Node, ProvisionRequest, ProvisionedNodes, Result, RetryConfig, Role, Transport, TransportKind,
};
use tokio::process::Command;

/// Send test logs through the test harness writer.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("dcos_harness=debug")
        .with_test_writer()
        .try_init();
}

/// Fast retry budget for tests.
pub fn quick_retry(attempts: u32) -> RetryConfig {
    RetryConfig {
        max_attempts: attempts,
        initial_delay: Duration::from_millis(10),
        max_delay: Duration::from_millis(10),
        backoff_multiplier: 1.0,
    }
}

/// One operation the transport was asked to perform.
#[derive(Debug, Clone)]
pub struct Record {
    /// Public address of the target node.
    pub node: IpAddr,
    /// Shell line for commands, `send <local> <remote>` or
    /// `download <remote> <local>` for transfers.
    pub line: String,
    /// Environment overrides of a command.
    pub env: BTreeMap<String, String>,
    /// Content of a sent file, if it was readable text.
    pub content: Option<String>,
}

/// Scripted reply for commands containing `pattern`.
#[derive(Debug, Clone)]
struct Rule {
    node: Option<IpAddr>,
    pattern: String,
    exit_code: i32,
    stdout: String,
    /// Stop matching after this many commands.
    times: Option<usize>,
    sleep_secs: u64,
}

impl Rule {
    fn new(node: Option<IpAddr>, pattern: &str, exit_code: i32, stdout: &str) -> Self {
        Self {
            node,
            pattern: pattern.to_string(),
            exit_code,
            stdout: stdout.to_string(),
            times: None,
            sleep_secs: 0,
        }
    }
}

/// Transport that records every operation and answers from a script
/// instead of reaching a node. Unmatched commands succeed silently.
/// Exit status 255 stands for an unreachable node, as with ssh.
#[derive(Debug, Default)]
pub struct RecordingTransport {
    rules: Mutex<Vec<Rule>>,
    records: Mutex<Vec<Record>>,
}

impl RecordingTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Commands containing `pattern` print `stdout` and exit with `exit_code`.
    pub fn reply(&self, pattern: &str, exit_code: i32, stdout: &str) {
        self.add_rule(Rule::new(None, pattern, exit_code, stdout));
    }

    /// Like [`RecordingTransport::reply`], for one node only.
    pub fn reply_on(&self, node: IpAddr, pattern: &str, exit_code: i32, stdout: &str) {
        self.add_rule(Rule::new(Some(node), pattern, exit_code, stdout));
    }

    /// Like [`RecordingTransport::reply`], for the next `times` matching
    /// commands only.
    pub fn reply_times(&self, pattern: &str, times: usize, exit_code: i32, stdout: &str) {
        let mut rule = Rule::new(None, pattern, exit_code, stdout);
        rule.times = Some(times);
        self.add_rule(rule);
    }

    /// Commands containing `pattern` take `secs` seconds before succeeding.
    pub fn stall(&self, pattern: &str, secs: u64) {
        let mut rule = Rule::new(None, pattern, 0, "");
        rule.sleep_secs = secs;
        self.add_rule(rule);
    }

    fn add_rule(&self, rule: Rule) {
        // Later rules take precedence.
        self.rules.lock().unwrap().insert(0, rule);
    }

    pub fn records(&self) -> Vec<Record> {
        self.records.lock().unwrap().clone()
    }

    /// Lines recorded for `node`, in order.
    pub fn lines_on(&self, node: IpAddr) -> Vec<String> {
        self.records()
            .into_iter()
            .filter(|r| r.node == node)
            .map(|r| r.line)
            .collect()
    }

    /// Index of the first record matching `pattern`.
    pub fn position(&self, pattern: &str) -> Option<usize> {
        self.records().iter().position(|r| r.line.contains(pattern))
    }

    /// Index of the last record matching `pattern`.
    pub fn last_position(&self, pattern: &str) -> Option<usize> {
        self.records().iter().rposition(|r| r.line.contains(pattern))
    }

    fn record(&self, node: &Node, line: String, env: BTreeMap<String, String>, content: Option<String>) {
        self.records.lock().unwrap().push(Record {
            node: node.public_address(),
            line,
            env,
            content,
        });
    }

    fn scripted(&self, node: &Node, line: &str) -> Command {
        let rule = {
            let mut rules = self.rules.lock().unwrap();
            let found = rules.iter_mut().find(|r| {
                line.contains(&r.pattern)
                    && r.node.map_or(true, |n| n == node.public_address())
                    && r.times != Some(0)
            });
            found.map(|r| {
                if let Some(times) = r.times.as_mut() {
                    *times -= 1;
                }
                r.clone()
            })
        };
        let (exit_code, stdout, sleep_secs) =
            rule.map_or((0, String::new(), 0), |r| (r.exit_code, r.stdout, r.sleep_secs));

        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg("sleep \"$FAKE_SLEEP\"; printf '%s' \"$FAKE_STDOUT\"; [ \"$FAKE_EXIT\" = 0 ] || echo 'scripted failure' >&2; exit \"$FAKE_EXIT\"")
            .env("FAKE_STDOUT", stdout)
            .env("FAKE_EXIT", exit_code.to_string())
            .env("FAKE_SLEEP", sleep_secs.to_string());
        cmd
    }
}

impl Transport for RecordingTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Local
    }

    fn command(&self, node: &Node, invocation: &Invocation, _user: &str) -> Result<Command> {
        let line = invocation.command_line()?;
        self.record(node, line.clone(), invocation.env_vars().clone(), None);
        Ok(self.scripted(node, &line))
    }

    fn send_file_command(
        &self,
        node: &Node,
        local: &Path,
        remote: &Path,
        _user: &str,
    ) -> Result<Command> {
        let content = std::fs::read_to_string(local).ok();
        self.record(
            node,
            format!("send {} {}", local.display(), remote.display()),
            BTreeMap::new(),
            content,
        );
        Ok(Command::new("true"))
    }

    fn download_file_command(
        &self,
        node: &Node,
        remote: &Path,
        local: &Path,
        _user: &str,
    ) -> Result<Command> {
        self.record(
            node,
            format!("download {} {}", remote.display(), local.display()),
            BTreeMap::new(),
            None,
        );
        // The caller expects the download to exist afterwards.
        let mut cmd = Command::new("mkdir");
        cmd.arg("-p").arg(local);
        Ok(cmd)
    }

    fn is_connection_failure(&self, exit_code: Option<i32>, _stderr: &str) -> bool {
        exit_code == Some(255)
    }
}

/// Backend handing out nodes that talk to a [`RecordingTransport`].
#[derive(Debug, Clone)]
pub struct FakeBackend {
    pub transport: Arc<RecordingTransport>,
    pub methods: BTreeSet<InstallMethod>,
    /// Deliver one node fewer of this role than requested.
    pub shortfall: Option<Role>,
    pub fail_provision: bool,
    /// Login user of every node.
    pub user: String,
    pub destroys: Arc<AtomicUsize>,
    pub destroyed_nodes: Arc<Mutex<Vec<IpAddr>>>,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self {
            transport: RecordingTransport::new(),
            methods: BTreeSet::from([InstallMethod::FromPath, InstallMethod::FromUrl]),
            shortfall: None,
            fail_provision: false,
            user: "root".to_string(),
            destroys: Arc::new(AtomicUsize::new(0)),
            destroyed_nodes: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn with_methods(mut self, methods: &[InstallMethod]) -> Self {
        self.methods = methods.iter().copied().collect();
        self
    }

    pub fn with_user(mut self, user: &str) -> Self {
        self.user = user.to_string();
        self
    }

    pub fn destroy_count(&self) -> usize {
        self.destroys.load(Ordering::SeqCst)
    }

    /// A node outside any cluster, on the same transport.
    pub fn node(&self, public: [u8; 4], private: [u8; 4]) -> Node {
        Node::new(
            IpAddr::V4(Ipv4Addr::from(public)),
            IpAddr::V4(Ipv4Addr::from(private)),
            self.user.clone(),
            self.transport.clone(),
        )
    }
}

#[async_trait]
impl ClusterBackend for FakeBackend {
    fn base_config(&self) -> DcosConfig {
        serde_yaml::from_str(
            "cluster_name: harness-test\nresolvers:\n  - 8.8.8.8\nexhibitor_storage_backend: static\nmaster_discovery: static\n",
        )
        .unwrap()
    }

    fn default_transport(&self) -> TransportKind {
        TransportKind::Local
    }

    fn supported_install_methods(&self) -> BTreeSet<InstallMethod> {
        self.methods.clone()
    }

    fn ip_detect_script_path(&self) -> Option<std::path::PathBuf> {
        None
    }

    async fn cluster_manager(&self, _request: &ClusterRequest) -> Result<Box<dyn ClusterManager>> {
        Ok(Box::new(FakeManager {
            backend: self.clone(),
        }))
    }
}

/// Manager of one fake cluster.
#[derive(Debug)]
/// Every `destroy` call is counted, so callers can check they do not repeat it.
pub struct FakeManager {
    backend: FakeBackend,
}

impl FakeManager {
    fn nodes(&self, count: usize, role: Role, subnet: u8) -> Vec<Node> {
        let count = if self.backend.shortfall == Some(role) {
            count.saturating_sub(1)
        } else {
            count
        };
        (1..=count)
            .map(|i| {
                let i = u8::try_from(i).unwrap();
                self.backend.node([172, 16, subnet, i], [10, 0, subnet, i])
            })
            .collect()
    }
}

#[async_trait]
impl ClusterManager for FakeManager {
    async fn provision(&mut self, request: &ProvisionRequest) -> Result<ProvisionedNodes> {
        if self.backend.fail_provision {
            return Err(Error::Provisioning("out of capacity".into()));
        }
        Ok(ProvisionedNodes {
            masters: self.nodes(request.masters, Role::Master, 1),
            agents: self.nodes(request.agents, Role::Agent, 2),
            public_agents: self.nodes(request.public_agents, Role::PublicAgent, 3),
        })
    }

    async fn destroy(&mut self) -> Result<()> {
        self.backend.destroys.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn destroy_node(&mut self, node: &Node) -> Result<()> {
        self.backend
            .destroyed_nodes
            .lock()
            .unwrap()
            .push(node.public_address());
        Ok(())
    }
}

/// A local installer stand-in that answers `--version`.
pub fn fake_installer(variant: &str, version: &str) -> tempfile::NamedTempFile {
    use std::io::Write;

    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(
        file,
        "echo 'Extracting image...'\necho '{{\"version\": \"{version}\", \"variant\": \"{variant}\"}}'"
    )
    .unwrap();
    file
}
