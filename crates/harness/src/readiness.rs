//! Polling a cluster until it reports itself healthy.
//!
//! Open source clusters are polled on the unauthenticated health endpoint.
//! Enterprise clusters first have to serve their CA certificate, then accept
//! a superuser login, and are then polled with the session token.
//!
//! Connection refusals, request timeouts and 5xx answers are expected while
//! services come up and are retried until the overall deadline. Rejected
//! credentials and unintelligible answers fail immediately.

use std::future::Future;
use std::net::IpAddr;
use std::time::{Duration, Instant};

use reqwest::{Certificate, Client, RequestBuilder, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use url::Url;

use crate::config::HarnessSettings;
use crate::error::{Error, Result};

/// Health report of all units.
const UNITS_PATH: &str = "system/health/v1/units";

/// The cluster's internal CA certificate.
const CA_CERT_PATH: &str = "ca/dcos-ca.crt";

/// Superuser login.
const LOGIN_PATH: &str = "acs/api/v1/auth/login";

/// Options for waiting on a cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WaitOptions {
    /// Overall deadline.
    pub timeout: Duration,
    /// Pause between polls.
    pub poll_interval: Duration,
    /// Deadline for a single HTTP request.
    pub request_timeout: Duration,
    /// Poll this base URL instead of the first master.
    pub endpoint: Option<Url>,
}

impl Default for WaitOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(3600),
            poll_interval: Duration::from_secs(5),
            request_timeout: Duration::from_secs(30),
            endpoint: None,
        }
    }
}

impl WaitOptions {
    /// Options seeded from harness settings.
    #[must_use]
    pub fn from_settings(settings: &HarnessSettings) -> Self {
        Self {
            timeout: settings.wait_timeout(),
            poll_interval: settings.poll_interval(),
            ..Self::default()
        }
    }

    /// Set the overall deadline.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the pause between polls.
    #[must_use]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Set the per-request deadline.
    #[must_use]
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Poll `endpoint` instead of the first master.
    #[must_use]
    pub fn with_endpoint(mut self, endpoint: Url) -> Self {
        self.endpoint = Some(endpoint);
        self
    }
}

/// Health of one unit as reported by the diagnostics service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitHealth {
    /// Unit identifier.
    pub id: String,
    /// `0` means healthy.
    pub health: i32,
    /// Human-readable name.
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Deserialize)]
struct UnitsReport {
    units: Vec<UnitHealth>,
}

#[derive(Serialize)]
struct LoginRequest<'a> {
    uid: &'a str,
    password: &'a str,
}

#[derive(Deserialize)]
struct LoginResponse {
    token: String,
}

enum PollOutcome<T> {
    Ready(T),
    Pending(String),
}

/// Base URL of a master for `scheme`.
///
/// # Errors
/// Returns [`Error::Configuration`] if the result is not a valid URL.
pub fn master_url(scheme: &str, address: IpAddr) -> Result<Url> {
    let host = match address {
        IpAddr::V4(v4) => v4.to_string(),
        IpAddr::V6(v6) => format!("[{v6}]"),
    };
    Url::parse(&format!("{scheme}://{host}/"))
        .map_err(|e| Error::Configuration(format!("Invalid master URL for {address}: {e}")))
}

/// Waits for a cluster to become healthy.
#[derive(Debug)]
pub struct ReadinessPoller {
    base: Url,
    options: WaitOptions,
}

impl ReadinessPoller {
    /// Poll the cluster at `base` (e.g. `http://10.0.0.1/`).
    #[must_use]
    pub fn new(base: Url, options: WaitOptions) -> Self {
        Self { base, options }
    }

    /// Wait until every unit of an open source cluster is healthy.
    ///
    /// # Errors
    /// Returns [`Error::Timeout`] when the deadline passes, or the first
    /// non-transient error.
    pub async fn wait_for_oss(&self) -> Result<()> {
        let deadline = Deadline::start(self.options.timeout);
        let client = self.client()?;
        let units = self.join(UNITS_PATH)?;

        info!(url = %units, timeout_secs = self.options.timeout.as_secs(), "Waiting for cluster health");
        self.poll(&deadline, || check_units(client.get(units.clone())))
            .await?;
        info!("Cluster is healthy");
        Ok(())
    }

    /// Wait until an enterprise cluster serves its CA certificate, accepts
    /// the superuser login and reports every unit healthy.
    ///
    /// Returns the CA certificate (PEM).
    ///
    /// # Errors
    /// Returns [`Error::Timeout`] when the deadline passes,
    /// [`Error::Authentication`] if the login is rejected, or another
    /// non-transient error.
    pub async fn wait_for_ee(&self, username: &str, password: &str) -> Result<String> {
        let deadline = Deadline::start(self.options.timeout);
        // Nothing can verify the proxy certificate until its CA is known.
        let bootstrap = Client::builder()
            .timeout(self.options.request_timeout)
            .danger_accept_invalid_certs(true)
            .build()?;

        let ca_url = self.join(CA_CERT_PATH)?;
        info!(url = %ca_url, "Waiting for the cluster CA certificate");
        let ca_cert = self
            .poll(&deadline, || fetch_ca_cert(bootstrap.get(ca_url.clone())))
            .await?;

        let certificate = Certificate::from_pem(ca_cert.as_bytes())
            .map_err(|e| Error::Protocol(format!("Unusable CA certificate: {e}")))?;
        let client = Client::builder()
            .timeout(self.options.request_timeout)
            .add_root_certificate(certificate)
            .build()
            .map_err(|e| Error::Protocol(format!("Unusable CA certificate: {e}")))?;

        let login_url = self.join(LOGIN_PATH)?;
        info!(url = %login_url, user = %username, "Logging in as superuser");
        let body = LoginRequest {
            uid: username,
            password,
        };
        let token = self
            .poll(&deadline, || login(client.post(login_url.clone()).json(&body)))
            .await?;

        let units = self.join(UNITS_PATH)?;
        info!(url = %units, "Waiting for cluster health");
        let auth = format!("token={token}");
        self.poll(&deadline, || {
            check_units(client.get(units.clone()).header("Authorization", auth.as_str()))
        })
        .await?;
        info!("Cluster is healthy");
        Ok(ca_cert)
    }

    fn client(&self) -> Result<Client> {
        Ok(Client::builder()
            .timeout(self.options.request_timeout)
            .build()?)
    }

    fn join(&self, path: &str) -> Result<Url> {
        self.base
            .join(path)
            .map_err(|e| Error::Configuration(format!("Invalid endpoint {}: {e}", self.base)))
    }

    /// Poll until ready, a non-transient error, or the deadline.
    async fn poll<T, F, Fut>(&self, deadline: &Deadline, mut check: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<PollOutcome<T>>>,
    {
        let mut last_state = "no response yet".to_string();
        let interval = self.options.poll_interval;

        let outcome = tokio::time::timeout(deadline.remaining(), async {
            let mut attempt: u64 = 0;
            loop {
                attempt += 1;
                match check().await {
                    Ok(PollOutcome::Ready(value)) => return Ok(value),
                    Ok(PollOutcome::Pending(state)) => {
                        debug!(attempt, state = %state, "Cluster not ready");
                        last_state = state;
                    }
                    Err(e) if e.is_transient() => {
                        debug!(attempt, error = %e, "Cluster unreachable");
                        last_state = e.to_string();
                    }
                    Err(e) => return Err(e),
                }
                tokio::time::sleep(interval).await;
            }
        })
        .await;

        outcome.unwrap_or_else(|_| {
            Err(Error::Timeout {
                elapsed: deadline.elapsed(),
                last_state,
            })
        })
    }
}

struct Deadline {
    started: Instant,
    timeout: Duration,
}

impl Deadline {
    fn start(timeout: Duration) -> Self {
        Self {
            started: Instant::now(),
            timeout,
        }
    }

    fn remaining(&self) -> Duration {
        self.timeout.saturating_sub(self.started.elapsed())
    }

    fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}

/// Map status codes shared by every endpoint.
fn check_status(response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return Err(Error::Authentication {
            status: status.as_u16(),
            message: format!("{} rejected the request", response.url()),
        });
    }
    if status.is_server_error() {
        // Keeps the status on the error so it is classified as transient.
        return Ok(response.error_for_status()?);
    }
    Err(Error::Protocol(format!(
        "{} answered {status}",
        response.url()
    )))
}

async fn check_units(request: RequestBuilder) -> Result<PollOutcome<()>> {
    let response = check_status(request.send().await?)?;
    let body = response.text().await?;
    let report: UnitsReport = serde_json::from_str(&body)
        .map_err(|e| Error::Protocol(format!("Malformed health report: {e}")))?;

    if report.units.is_empty() {
        return Ok(PollOutcome::Pending("no units reported".into()));
    }
    let unhealthy: Vec<&str> = report
        .units
        .iter()
        .filter(|u| u.health != 0)
        .map(|u| u.id.as_str())
        .collect();
    if unhealthy.is_empty() {
        Ok(PollOutcome::Ready(()))
    } else {
        Ok(PollOutcome::Pending(format!(
            "{} of {} units unhealthy: {}",
            unhealthy.len(),
            report.units.len(),
            unhealthy.join(", ")
        )))
    }
}

async fn fetch_ca_cert(request: RequestBuilder) -> Result<PollOutcome<String>> {
    let response = check_status(request.send().await?)?;
    let pem = response.text().await?;
    if pem.contains("BEGIN CERTIFICATE") {
        Ok(PollOutcome::Ready(pem))
    } else {
        Err(Error::Protocol("CA endpoint did not return a PEM certificate".into()))
    }
}

async fn login(request: RequestBuilder) -> Result<PollOutcome<String>> {
    let response = check_status(request.send().await?)?;
    let body = response.text().await?;
    let login: LoginResponse = serde_json::from_str(&body)
        .map_err(|e| Error::Protocol(format!("Malformed login response: {e}")))?;
    Ok(PollOutcome::Ready(login.token))
}
