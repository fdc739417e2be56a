//! Install-time configuration and harness settings.
//!
//! [`DcosConfig`] is the flat key-value mapping handed to the installer as
//! `genconf/config.yaml`. [`HarnessSettings`] holds the knobs of the harness
//! itself and is loaded from a YAML file plus an explicit environment
//! snapshot.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};
use crate::retry::RetryConfig;

/// Install-time configuration of the distributed system.
pub type DcosConfig = BTreeMap<String, serde_yaml::Value>;

/// Config key holding an inline enterprise license.
pub const LICENSE_KEY_CONTENTS: &str = "license_key_contents";

/// Environment variable naming a license key file.
pub const ENV_LICENSE_KEY_PATH: &str = "DCOS_LICENSE_KEY_PATH";

/// Environment variable naming the SSH private key for nodes.
pub const ENV_SSH_KEY: &str = "DCOS_HARNESS_SSH_KEY";

/// Environment variable naming the default remote user.
pub const ENV_DEFAULT_USER: &str = "DCOS_HARNESS_DEFAULT_USER";

/// Default working directory of the installer on the installer node.
pub const DEFAULT_INSTALLER_WORKDIR: &str = "/dcos-install-dir";

/// Merge `overrides` on top of `base`.
///
/// The merge is shallow: an override key replaces the whole value, nested
/// mappings included. The installer reads each top-level key as one unit.
#[must_use]
pub fn merge_config(base: &DcosConfig, overrides: &DcosConfig) -> DcosConfig {
    let mut merged = base.clone();
    for (key, value) in overrides {
        merged.insert(key.clone(), value.clone());
    }
    merged
}

/// Settings for the harness itself.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HarnessSettings {
    /// User for remote commands when none is given.
    pub default_user: String,
    /// SSH private key used by the SSH transport.
    pub ssh_key_path: Option<PathBuf>,
    /// License key file provided through the environment.
    pub license_key_path: Option<PathBuf>,
    /// Installer working directory on the installer node. The backend's
    /// own when unset.
    pub installer_workdir: Option<PathBuf>,
    /// Overall readiness timeout in seconds.
    pub wait_timeout_secs: u64,
    /// Interval between readiness polls in seconds.
    pub poll_interval_secs: u64,
    /// Attempts for the Prepare phase.
    pub prepare_attempts: u32,
    /// Attempts for the Post-flight phase.
    pub postflight_attempts: u32,
    /// Initial delay between retried phase attempts in seconds.
    pub retry_delay_secs: u64,
    /// Optional deadline for a single install phase in seconds.
    pub phase_timeout_secs: Option<u64>,
}

impl Default for HarnessSettings {
    fn default() -> Self {
        Self {
            default_user: "root".to_string(),
            ssh_key_path: None,
            license_key_path: None,
            installer_workdir: None,
            wait_timeout_secs: 3600,
            poll_interval_secs: 5,
            prepare_attempts: 3,
            postflight_attempts: 60,
            retry_delay_secs: 10,
            phase_timeout_secs: None,
        }
    }
}

impl HarnessSettings {
    /// Load settings from a YAML file. Missing keys take their defaults.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Configuration(format!("Failed to read {}: {e}", path.display()))
        })?;
        let settings: Self = serde_yaml::from_str(&content)?;
        debug!(path = %path.display(), "Loaded harness settings");
        Ok(settings)
    }

    /// Apply overrides from an environment snapshot such as `std::env::vars()`.
    #[must_use]
    pub fn with_env_overrides<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        for (key, value) in vars {
            match key.as_ref() {
                ENV_LICENSE_KEY_PATH => self.license_key_path = Some(PathBuf::from(value.into())),
                ENV_SSH_KEY => self.ssh_key_path = Some(PathBuf::from(value.into())),
                ENV_DEFAULT_USER => self.default_user = value.into(),
                _ => {}
            }
        }
        self
    }

    /// Overall readiness timeout.
    #[must_use]
    pub fn wait_timeout(&self) -> Duration {
        Duration::from_secs(self.wait_timeout_secs)
    }

    /// Interval between readiness polls.
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    /// Retry budget for the Prepare phase.
    #[must_use]
    pub fn prepare_retry(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.prepare_attempts,
            initial_delay: Duration::from_secs(self.retry_delay_secs),
            ..RetryConfig::default()
        }
    }

    /// Retry budget for the Post-flight phase.
    #[must_use]
    pub fn postflight_retry(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.postflight_attempts,
            initial_delay: Duration::from_secs(self.retry_delay_secs),
            ..RetryConfig::default()
        }
    }
}
