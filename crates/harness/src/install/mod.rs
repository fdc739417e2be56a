//! Installation state machine and protocol.
//!
//! An install moves a cluster `Uninstalled -> Installing -> Installed`, or
//! to `Failed` if a phase fails. The protocol runs four phases as strict
//! barriers (every node finishes a phase before the next one starts):
//!
//! 1. **Stage**: deliver the installer, config and extra files to the
//!    installer node, generate the install bundle and copy it to every node.
//! 2. **Prepare**: preflight checks on every node (retried).
//! 3. **Deploy**: role-specific install on every node.
//! 4. **Post-flight**: service checks on every node (longest retry budget).

mod protocol;
mod session;
mod variant;

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::backend::InstallMethod;
use crate::config::{DcosConfig, HarnessSettings};
use crate::exec::OutputMode;
use crate::retry::RetryConfig;

pub(crate) use protocol::InstallProtocol;
pub use session::{EnterpriseCredentials, InstallSession, StagedFile};
pub use variant::{
    detect_local, detect_remote, version_requires_license, DcosVariant, InstallerDetails,
    VariantSelection,
};

/// Installation state of a cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstallState {
    /// Provisioned, nothing installed yet.
    Uninstalled,
    /// An install is running.
    Installing,
    /// Install finished successfully.
    Installed,
    /// An install phase failed.
    Failed,
    /// Built from existing nodes; assumed to run already.
    AssumedInstalled,
    /// Torn down; the cluster is unusable.
    Destroyed,
}

impl fmt::Display for InstallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Uninstalled => write!(f, "uninstalled"),
            Self::Installing => write!(f, "installing"),
            Self::Installed => write!(f, "installed"),
            Self::Failed => write!(f, "failed"),
            Self::AssumedInstalled => write!(f, "assumed_installed"),
            Self::Destroyed => write!(f, "destroyed"),
        }
    }
}

/// A recorded state change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transition {
    /// State entered.
    pub state: InstallState,
    /// When it was entered.
    pub at: DateTime<Utc>,
}

/// Install protocol phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    /// Deliver installer and config, generate and distribute the bundle.
    Stage,
    /// Preflight checks.
    Prepare,
    /// Role-specific install.
    Deploy,
    /// Local service checks.
    Postflight,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stage => write!(f, "stage"),
            Self::Prepare => write!(f, "prepare"),
            Self::Deploy => write!(f, "deploy"),
            Self::Postflight => write!(f, "post-flight"),
        }
    }
}

/// Where the installer comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstallSource {
    /// A local installer file pushed by the orchestrator.
    Path(PathBuf),
    /// A URL the installer node downloads itself.
    Url(Url),
}

impl InstallSource {
    /// Backend capability this source needs.
    #[must_use]
    pub fn method(&self) -> InstallMethod {
        match self {
            Self::Path(_) => InstallMethod::FromPath,
            Self::Url(_) => InstallMethod::FromUrl,
        }
    }
}

impl fmt::Display for InstallSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Path(path) => write!(f, "{}", path.display()),
            Self::Url(url) => write!(f, "{url}"),
        }
    }
}

/// Options for one install call.
#[derive(Debug, Clone)]
pub struct InstallOptions {
    /// Keys replacing those of the backend's base config.
    pub config_overrides: DcosConfig,
    /// Extra files for the installer's `genconf` directory.
    pub files_to_stage: Vec<StagedFile>,
    /// How the variant is decided.
    pub variant: VariantSelection,
    /// Enterprise credentials and license.
    pub enterprise: Option<EnterpriseCredentials>,
    /// License file from the environment, lowest precedence.
    pub env_license_key_path: Option<PathBuf>,
    /// Retry budget for Prepare.
    pub prepare_retry: RetryConfig,
    /// Retry budget for Post-flight.
    pub postflight_retry: RetryConfig,
    /// Deadline for a single phase; none by default.
    pub phase_timeout: Option<Duration>,
    /// Installer output handling.
    pub output: OutputMode,
    /// Working directory on the installer node, replacing the backend's.
    pub installer_workdir: Option<PathBuf>,
}

impl Default for InstallOptions {
    fn default() -> Self {
        Self::from_settings(&HarnessSettings::default())
    }
}

impl InstallOptions {
    /// Options seeded from harness settings.
    #[must_use]
    pub fn from_settings(settings: &HarnessSettings) -> Self {
        Self {
            config_overrides: DcosConfig::new(),
            files_to_stage: Vec::new(),
            variant: VariantSelection::Auto,
            enterprise: None,
            env_license_key_path: settings.license_key_path.clone(),
            prepare_retry: settings.prepare_retry(),
            postflight_retry: settings.postflight_retry(),
            phase_timeout: settings.phase_timeout_secs.map(Duration::from_secs),
            output: OutputMode::Capture,
            installer_workdir: settings.installer_workdir.clone(),
        }
    }

    /// Replace the config overrides.
    #[must_use]
    pub fn with_config_overrides(mut self, overrides: DcosConfig) -> Self {
        self.config_overrides = overrides;
        self
    }

    /// Stage an extra file.
    #[must_use]
    pub fn with_file(mut self, file: StagedFile) -> Self {
        self.files_to_stage.push(file);
        self
    }

    /// Declare or auto-detect the variant.
    #[must_use]
    pub fn with_variant(mut self, variant: VariantSelection) -> Self {
        self.variant = variant;
        self
    }

    /// Provide enterprise credentials.
    #[must_use]
    pub fn with_enterprise(mut self, credentials: EnterpriseCredentials) -> Self {
        self.enterprise = Some(credentials);
        self
    }

    /// Set the retry budgets for Prepare and Post-flight.
    #[must_use]
    pub fn with_retries(mut self, prepare: RetryConfig, postflight: RetryConfig) -> Self {
        self.prepare_retry = prepare;
        self.postflight_retry = postflight;
        self
    }

    /// Bound every phase by `timeout`.
    #[must_use]
    pub fn with_phase_timeout(mut self, timeout: Duration) -> Self {
        self.phase_timeout = Some(timeout);
        self
    }

    /// Log installer output live.
    #[must_use]
    pub fn with_output(mut self, output: OutputMode) -> Self {
        self.output = output;
        self
    }

    /// Install from `workdir` instead of the backend's directory.
    #[must_use]
    pub fn with_installer_workdir(mut self, workdir: impl Into<PathBuf>) -> Self {
        self.installer_workdir = Some(workdir.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_options_follow_settings() {
        let settings = HarnessSettings {
            license_key_path: Some(PathBuf::from("/etc/dcos/license.txt")),
            installer_workdir: Some(PathBuf::from("/var/lib/dcos-bootstrap")),
            prepare_attempts: 7,
            phase_timeout_secs: Some(900),
            ..HarnessSettings::default()
        };

        let options = InstallOptions::from_settings(&settings);

        assert_eq!(
            options.env_license_key_path,
            Some(PathBuf::from("/etc/dcos/license.txt"))
        );
        assert_eq!(
            options.installer_workdir,
            Some(PathBuf::from("/var/lib/dcos-bootstrap"))
        );
        assert_eq!(options.prepare_retry.max_attempts, 7);
        assert_eq!(options.phase_timeout, Some(Duration::from_secs(900)));
    }

    #[test]
    fn test_default_options_use_backend_workdir() {
        let options = InstallOptions::default();
        assert!(options.installer_workdir.is_none());
        assert_eq!(
            options
                .with_installer_workdir("/opt/bootstrap")
                .installer_workdir,
            Some(PathBuf::from("/opt/bootstrap"))
        );
    }
}
