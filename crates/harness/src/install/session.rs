//! Per-install inputs: source, merged config, staged files, credentials.

use std::fmt;
use std::path::{Component, Path, PathBuf};

use serde_yaml::Value;
use tracing::{debug, info};

use super::variant::{version_requires_license, DcosVariant, InstallerDetails};
use super::{InstallOptions, InstallSource};
use crate::config::{merge_config, DcosConfig, LICENSE_KEY_CONTENTS};
use crate::error::{Error, Result};

/// A local file to place in the installer's `genconf` directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedFile {
    /// Local source.
    pub local: PathBuf,
    /// Destination; relative paths are taken from `genconf`.
    pub remote: PathBuf,
}

impl StagedFile {
    /// Stage `local` at `remote`.
    #[must_use]
    pub fn new(local: impl Into<PathBuf>, remote: impl Into<PathBuf>) -> Self {
        Self {
            local: local.into(),
            remote: remote.into(),
        }
    }
}

/// Superuser credentials and license for enterprise installs.
#[derive(Clone, Default)]
pub struct EnterpriseCredentials {
    /// Superuser login.
    pub superuser_username: String,
    /// Plain password; hashed by the installer when no hash is given.
    pub superuser_password: Option<String>,
    /// Pre-computed password hash.
    pub superuser_password_hash: Option<String>,
    /// License key file.
    pub license_key_path: Option<PathBuf>,
}

impl EnterpriseCredentials {
    /// Credentials with a plain password.
    #[must_use]
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            superuser_username: username.into(),
            superuser_password: Some(password.into()),
            ..Self::default()
        }
    }

    /// Use a pre-computed password hash.
    #[must_use]
    pub fn with_password_hash(mut self, hash: impl Into<String>) -> Self {
        self.superuser_password_hash = Some(hash.into());
        self
    }

    /// Read the license from this file.
    #[must_use]
    pub fn with_license_key_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.license_key_path = Some(path.into());
        self
    }
}

impl fmt::Debug for EnterpriseCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EnterpriseCredentials")
            .field("superuser_username", &self.superuser_username)
            .field(
                "superuser_password",
                &self.superuser_password.as_ref().map(|_| "<redacted>"),
            )
            .field(
                "superuser_password_hash",
                &self.superuser_password_hash.as_ref().map(|_| "<redacted>"),
            )
            .field("license_key_path", &self.license_key_path)
            .finish()
    }
}

/// Everything one install call needs, validated up front.
#[derive(Debug)]
pub struct InstallSession {
    source: InstallSource,
    config: DcosConfig,
    files: Vec<StagedFile>,
    workdir: PathBuf,
    variant: Option<DcosVariant>,
    version: Option<String>,
    credentials: Option<EnterpriseCredentials>,
    env_license_key_path: Option<PathBuf>,
    installer_fetched: bool,
}

impl InstallSession {
    /// Validate inputs and merge `overrides` onto `base_config`.
    ///
    /// Touches nothing remote.
    ///
    /// # Errors
    /// Returns [`Error::Configuration`] for a missing installer file, a
    /// missing staged file, or a staging destination outside `genconf`.
    pub fn new(
        source: InstallSource,
        base_config: &DcosConfig,
        options: &InstallOptions,
        workdir: &Path,
    ) -> Result<Self> {
        if let InstallSource::Path(path) = &source {
            if !path.is_file() {
                return Err(Error::Configuration(format!(
                    "Installer not found: {}",
                    path.display()
                )));
            }
        }

        let genconf = workdir.join("genconf");
        let files = options
            .files_to_stage
            .iter()
            .map(|file| {
                if !file.local.exists() {
                    return Err(Error::Configuration(format!(
                        "File to stage not found: {}",
                        file.local.display()
                    )));
                }
                Ok(StagedFile {
                    local: file.local.clone(),
                    remote: resolve_staging_path(&genconf, &file.remote)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            source,
            config: merge_config(base_config, &options.config_overrides),
            files,
            workdir: workdir.to_path_buf(),
            variant: None,
            version: None,
            credentials: options.enterprise.clone(),
            env_license_key_path: options.env_license_key_path.clone(),
            installer_fetched: false,
        })
    }

    /// Fix the variant, from a declaration or from installer details, and
    /// complete the enterprise configuration.
    ///
    /// # Errors
    /// Returns [`Error::Configuration`] if an enterprise install lacks
    /// credentials or a license it needs.
    pub fn resolve_variant(
        &mut self,
        declared: Option<DcosVariant>,
        details: Option<&InstallerDetails>,
    ) -> Result<DcosVariant> {
        let variant = declared
            .or_else(|| details.map(|d| d.variant))
            .ok_or_else(|| Error::Configuration("Variant could not be determined".into()))?;
        self.variant = Some(variant);
        self.version = details.map(|d| d.version.clone());
        info!(variant = %variant, version = ?self.version, "Install variant resolved");

        if variant == DcosVariant::Enterprise {
            self.apply_enterprise()?;
        }
        Ok(variant)
    }

    fn apply_enterprise(&mut self) -> Result<()> {
        let credentials = self.credentials.clone().ok_or_else(|| {
            Error::Configuration("Enterprise install requires superuser credentials".into())
        })?;
        if credentials.superuser_password.is_none() && credentials.superuser_password_hash.is_none()
        {
            return Err(Error::Configuration(
                "Enterprise install requires a superuser password or password hash".into(),
            ));
        }

        let licensed = version_requires_license(self.version.as_deref());
        if licensed && !self.config.contains_key(LICENSE_KEY_CONTENTS) {
            let license = self.resolve_license(&credentials)?;
            self.config
                .insert(LICENSE_KEY_CONTENTS.to_string(), Value::String(license));
        }
        if licensed {
            self.config
                .entry("fault_domain_enabled".to_string())
                .or_insert(Value::Bool(false));
        }

        self.config.insert(
            "superuser_username".to_string(),
            Value::String(credentials.superuser_username.clone()),
        );
        if let Some(hash) = &credentials.superuser_password_hash {
            self.set_password_hash(hash.clone());
        }
        Ok(())
    }

    /// License from, in order: the credentials' file, the environment file.
    fn resolve_license(&self, credentials: &EnterpriseCredentials) -> Result<String> {
        let path = credentials
            .license_key_path
            .as_ref()
            .or(self.env_license_key_path.as_ref())
            .ok_or_else(|| {
                Error::Configuration(
                    "Enterprise install requires a license key (config, license file or DCOS_LICENSE_KEY_PATH)"
                        .into(),
                )
            })?;
        debug!(path = %path.display(), "Reading license key");
        let license = std::fs::read_to_string(path).map_err(|e| {
            Error::Configuration(format!("Cannot read license key {}: {e}", path.display()))
        })?;
        Ok(license.trim().to_string())
    }

    /// Password the installer still has to hash, if any.
    #[must_use]
    pub fn password_to_hash(&self) -> Option<&str> {
        if self.variant != Some(DcosVariant::Enterprise)
            || self.config.contains_key("superuser_password_hash")
        {
            return None;
        }
        self.credentials
            .as_ref()
            .and_then(|c| c.superuser_password.as_deref())
    }

    /// Record the superuser password hash in the config.
    pub fn set_password_hash(&mut self, hash: String) {
        self.config
            .insert("superuser_password_hash".to_string(), Value::String(hash));
    }

    /// Installer source.
    #[must_use]
    pub fn source(&self) -> &InstallSource {
        &self.source
    }

    /// Merged install config.
    #[must_use]
    pub fn config(&self) -> &DcosConfig {
        &self.config
    }

    /// Merged install config as YAML.
    ///
    /// # Errors
    /// Returns an error if a value cannot be serialized.
    pub fn config_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(&self.config)?)
    }

    /// Staged files with absolute destinations.
    #[must_use]
    pub fn files(&self) -> &[StagedFile] {
        &self.files
    }

    /// Whether the installer is already on the installer node.
    #[must_use]
    pub fn installer_fetched(&self) -> bool {
        self.installer_fetched
    }

    pub(crate) fn mark_installer_fetched(&mut self) {
        self.installer_fetched = true;
    }

    /// Resolved variant, once known.
    #[must_use]
    pub fn variant(&self) -> Option<DcosVariant> {
        self.variant
    }

    /// Installer working directory.
    #[must_use]
    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    /// Path of the installer script on the installer node.
    #[must_use]
    pub fn installer_path(&self) -> PathBuf {
        self.workdir.join("dcos_generate_config.sh")
    }

    /// The installer's `genconf` directory.
    #[must_use]
    pub fn genconf_dir(&self) -> PathBuf {
        self.workdir.join("genconf")
    }

    /// The generated install bundle.
    #[must_use]
    pub fn serve_dir(&self) -> PathBuf {
        self.genconf_dir().join("serve")
    }
}

/// Resolve a staging destination under `genconf`, rejecting anything that
/// would land outside it.
fn resolve_staging_path(genconf: &Path, remote: &Path) -> Result<PathBuf> {
    if remote
        .components()
        .any(|c| matches!(c, Component::ParentDir))
    {
        return Err(Error::Configuration(format!(
            "Staging path may not contain '..': {}",
            remote.display()
        )));
    }

    let resolved = if remote.is_absolute() {
        remote.to_path_buf()
    } else {
        genconf.join(remote)
    };

    if !resolved.starts_with(genconf) || resolved == genconf {
        return Err(Error::Configuration(format!(
            "Staging path {} is outside {}",
            resolved.display(),
            genconf.display()
        )));
    }
    Ok(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::install::VariantSelection;

    fn workdir() -> PathBuf {
        PathBuf::from("/dcos-install-dir")
    }

    fn installer() -> tempfile::NamedTempFile {
        tempfile::NamedTempFile::new().unwrap()
    }

    #[test]
    fn test_staging_path_resolution() {
        let genconf = workdir().join("genconf");
        assert_eq!(
            resolve_staging_path(&genconf, Path::new("ca/key.pem")).unwrap(),
            genconf.join("ca/key.pem")
        );
        assert_eq!(
            resolve_staging_path(&genconf, Path::new("/dcos-install-dir/genconf/x")).unwrap(),
            genconf.join("x")
        );
        assert!(resolve_staging_path(&genconf, Path::new("/etc/passwd")).is_err());
        assert!(resolve_staging_path(&genconf, Path::new("../escape")).is_err());
        assert!(resolve_staging_path(&genconf, Path::new("/dcos-install-dir/genconf")).is_err());
    }

    #[test]
    fn test_session_rejects_missing_installer() {
        let err = InstallSession::new(
            InstallSource::Path(PathBuf::from("/nonexistent/dcos_generate_config.sh")),
            &DcosConfig::new(),
            &InstallOptions::default(),
            &workdir(),
        )
        .unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn test_session_rejects_file_outside_genconf() {
        let artifact = installer();
        let extra = installer();
        let options = InstallOptions::default()
            .with_file(StagedFile::new(extra.path(), "/opt/elsewhere"));

        let err = InstallSession::new(
            InstallSource::Path(artifact.path().to_path_buf()),
            &DcosConfig::new(),
            &options,
            &workdir(),
        )
        .unwrap_err();
        assert!(err.to_string().contains("outside"));
    }

    #[test]
    fn test_enterprise_without_license_is_rejected() {
        let artifact = installer();
        let options = InstallOptions::default()
            .with_variant(VariantSelection::Enterprise)
            .with_enterprise(EnterpriseCredentials::new("admin", "admin"));
        let mut session = InstallSession::new(
            InstallSource::Path(artifact.path().to_path_buf()),
            &DcosConfig::new(),
            &options,
            &workdir(),
        )
        .unwrap();

        let err = session
            .resolve_variant(Some(DcosVariant::Enterprise), None)
            .unwrap_err();
        assert!(err.to_string().contains("license"));
    }

    #[test]
    fn test_enterprise_license_from_environment_path() {
        let artifact = installer();
        let dir = tempfile::tempdir().unwrap();
        let license = dir.path().join("license.txt");
        std::fs::write(&license, "LICENSE-123\n").unwrap();

        let mut options = InstallOptions::default()
            .with_enterprise(EnterpriseCredentials::new("admin", "secret").with_password_hash("$6$hash"));
        options.env_license_key_path = Some(license);
        let mut session = InstallSession::new(
            InstallSource::Path(artifact.path().to_path_buf()),
            &DcosConfig::new(),
            &options,
            &workdir(),
        )
        .unwrap();

        session
            .resolve_variant(Some(DcosVariant::Enterprise), None)
            .unwrap();

        let config = session.config();
        assert_eq!(config[LICENSE_KEY_CONTENTS], Value::from("LICENSE-123"));
        assert_eq!(config["superuser_username"], Value::from("admin"));
        assert_eq!(config["superuser_password_hash"], Value::from("$6$hash"));
        assert_eq!(config["fault_domain_enabled"], Value::Bool(false));
        assert!(session.password_to_hash().is_none());
    }

    #[test]
    fn test_enterprise_license_in_config_wins() {
        let artifact = installer();
        let mut overrides = DcosConfig::new();
        overrides.insert(LICENSE_KEY_CONTENTS.into(), Value::from("INLINE"));
        let options = InstallOptions::default()
            .with_config_overrides(overrides)
            .with_enterprise(
                EnterpriseCredentials::new("admin", "secret")
                    .with_license_key_path("/nonexistent/license"),
            );
        let mut session = InstallSession::new(
            InstallSource::Path(artifact.path().to_path_buf()),
            &DcosConfig::new(),
            &options,
            &workdir(),
        )
        .unwrap();

        session
            .resolve_variant(Some(DcosVariant::Enterprise), None)
            .unwrap();
        assert_eq!(session.config()[LICENSE_KEY_CONTENTS], Value::from("INLINE"));
        assert_eq!(session.password_to_hash(), Some("secret"));
    }

    #[test]
    fn test_old_enterprise_needs_no_license() {
        let artifact = installer();
        let options = InstallOptions::default()
            .with_enterprise(EnterpriseCredentials::new("admin", "secret"));
        let mut session = InstallSession::new(
            InstallSource::Path(artifact.path().to_path_buf()),
            &DcosConfig::new(),
            &options,
            &workdir(),
        )
        .unwrap();
        let details = InstallerDetails {
            variant: DcosVariant::Enterprise,
            version: "1.10.2".into(),
        };

        session.resolve_variant(None, Some(&details)).unwrap();
        assert!(!session.config().contains_key(LICENSE_KEY_CONTENTS));
    }

    #[test]
    fn test_credentials_debug_redacts_secrets() {
        let credentials = EnterpriseCredentials::new("admin", "hunter2").with_password_hash("$6$x");
        let debug = format!("{credentials:?}");
        assert!(!debug.contains("hunter2"));
        assert!(!debug.contains("$6$x"));
        assert!(debug.contains("admin"));
    }
}
