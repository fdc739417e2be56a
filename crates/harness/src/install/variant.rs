//! Open-source vs. enterprise detection from the installer artifact.

use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::exec::Invocation;
use crate::node::Node;

/// First release that refuses to install enterprise without a license.
const LICENSE_REQUIRED_FROM: (u32, u32) = (1, 11);

/// Edition of the distributed system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DcosVariant {
    /// Open source.
    Oss,
    /// Enterprise.
    Enterprise,
}

impl fmt::Display for DcosVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Oss => write!(f, "oss"),
            Self::Enterprise => write!(f, "enterprise"),
        }
    }
}

/// How the variant of an install is decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VariantSelection {
    /// Ask the installer (slow: runs it).
    #[default]
    Auto,
    /// Declared open source.
    Oss,
    /// Declared enterprise.
    Enterprise,
}

impl VariantSelection {
    /// The declared variant, if not `Auto`.
    #[must_use]
    pub fn declared(self) -> Option<DcosVariant> {
        match self {
            Self::Auto => None,
            Self::Oss => Some(DcosVariant::Oss),
            Self::Enterprise => Some(DcosVariant::Enterprise),
        }
    }
}

/// What the installer reports about itself with `--version`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallerDetails {
    /// Edition the installer builds.
    pub variant: DcosVariant,
    /// Release version, e.g. `1.12.0`.
    pub version: String,
}

#[derive(Deserialize)]
struct VersionReport {
    #[serde(default)]
    variant: String,
    version: String,
}

impl InstallerDetails {
    /// Parse `--version` output. The installer may print banner lines
    /// around the JSON object.
    ///
    /// # Errors
    /// Returns [`Error::Protocol`] if no JSON object is found.
    pub fn parse(output: &str) -> Result<Self> {
        let start = output.find('{');
        let end = output.rfind('}');
        let json = match (start, end) {
            (Some(s), Some(e)) if s < e => &output[s..=e],
            _ => {
                return Err(Error::Protocol(format!(
                    "Installer version output has no JSON: {}",
                    output.trim()
                )))
            }
        };
        let report: VersionReport = serde_json::from_str(json)?;
        let variant = if report.variant == "ee" {
            DcosVariant::Enterprise
        } else {
            DcosVariant::Oss
        };
        Ok(Self {
            variant,
            version: report.version,
        })
    }

    /// Whether this release needs a license for enterprise installs.
    #[must_use]
    pub fn requires_license(&self) -> bool {
        self.variant == DcosVariant::Enterprise && version_requires_license(Some(&self.version))
    }
}

/// Whether an enterprise install of `version` needs a license. Unknown or
/// unparsable versions are assumed to need one.
#[must_use]
pub fn version_requires_license(version: Option<&str>) -> bool {
    let Some(version) = version else {
        return true;
    };
    let mut parts = version
        .split(|c: char| !c.is_ascii_digit())
        .filter(|p| !p.is_empty())
        .map(str::parse::<u32>);
    match (parts.next(), parts.next()) {
        (Some(Ok(major)), Some(Ok(minor))) => (major, minor) >= LICENSE_REQUIRED_FROM,
        _ => true,
    }
}

/// Ask a local installer file for its details.
///
/// # Errors
/// Returns an error if the installer cannot be run or its output parsed.
pub async fn detect_local(installer: &Path) -> Result<InstallerDetails> {
    info!(installer = %installer.display(), "Inspecting installer for its variant");
    let output = Command::new("bash")
        .arg(installer)
        .arg("--version")
        .kill_on_drop(true)
        .output()
        .await?;

    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    if !output.status.success() {
        return Err(Error::CommandExecution {
            node: "localhost".to_string(),
            args: vec![
                "bash".to_string(),
                installer.display().to_string(),
                "--version".to_string(),
            ],
            exit_code: output.status.code(),
            stdout,
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        });
    }

    let details = InstallerDetails::parse(&stdout)?;
    debug!(variant = %details.variant, version = %details.version, "Installer details");
    Ok(details)
}

/// Ask an installer already present on `node` for its details.
///
/// # Errors
/// Returns an error if the command fails or its output cannot be parsed.
pub async fn detect_remote(node: &Node, installer: &Path) -> Result<InstallerDetails> {
    info!(node = %node, installer = %installer.display(), "Inspecting remote installer for its variant");
    // The installer extracts into its own directory, which needs root.
    let output = node
        .run(
            &Invocation::new([
                "bash".to_string(),
                installer.display().to_string(),
                "--version".to_string(),
            ])
            .sudo(node.default_user() != "root"),
        )
        .await?;
    InstallerDetails::parse(&output.stdout)
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn test_parse_enterprise() {
        let details =
            InstallerDetails::parse("Extracting image...\n{\"variant\": \"ee\", \"version\": \"1.12.3\"}\n")
                .unwrap();
        assert_eq!(details.variant, DcosVariant::Enterprise);
        assert_eq!(details.version, "1.12.3");
        assert!(details.requires_license());
    }

    #[test]
    fn test_parse_open_source() {
        let details = InstallerDetails::parse("{\n  \"variant\": \"\",\n  \"version\": \"1.13.0\"\n}").unwrap();
        assert_eq!(details.variant, DcosVariant::Oss);
        assert!(!details.requires_license());
    }

    #[test]
    fn test_parse_garbage() {
        assert!(matches!(
            InstallerDetails::parse("command not found"),
            Err(Error::Protocol(_))
        ));
    }

    #[test]
    fn test_license_threshold() {
        assert!(!version_requires_license(Some("1.10.4")));
        assert!(version_requires_license(Some("1.11.0")));
        assert!(version_requires_license(Some("1.13.0-dev")));
        assert!(version_requires_license(Some("2.0")));
        assert!(version_requires_license(Some("master")));
        assert!(version_requires_license(None));
    }

    #[test]
    fn test_declared_selection() {
        assert_eq!(VariantSelection::Auto.declared(), None);
        assert_eq!(
            VariantSelection::Enterprise.declared(),
            Some(DcosVariant::Enterprise)
        );
    }

    #[tokio::test]
    async fn test_detect_local_runs_installer() {
        let mut script = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            script,
            "echo '{{\"variant\": \"ee\", \"version\": \"1.10.1\"}}'"
        )
        .unwrap();

        let details = detect_local(script.path()).await.unwrap();
        assert_eq!(details.variant, DcosVariant::Enterprise);
        assert!(!details.requires_license());
    }
}
