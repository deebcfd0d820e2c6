use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

use anyhow::{bail, Context, Result};
use semver::{Version, VersionReq};
use serde::{Deserialize, Serialize};

/// Extension manifest schema loaded from `plugin.toml`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExtensionManifest {
    pub id: String,
    pub name: String,
    pub version: String,
    pub runtime: ExtensionRuntime,
    pub compatibility: ExtensionCompatibility,
    pub methods: ExtensionMethods,
}

/// How the host starts the extension process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExtensionRuntime {
    pub entrypoint: String,
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
}

/// Compatibility constraints for host API negotiation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExtensionCompatibility {
    pub host_api: String,
}

/// Remote methods the extension exports to the host.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExtensionMethods {
    #[serde(default)]
    pub exported: Vec<String>,
}

impl ExtensionManifest {
    /// Parse and validate manifest TOML.
    pub fn from_toml_str(input: &str) -> Result<Self> {
        let manifest: Self =
            toml::from_str(input).context("failed to parse extension manifest TOML")?;
        manifest.validate()?;
        Ok(manifest)
    }

    /// Load and validate a manifest from disk.
    pub fn from_path(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read extension manifest at {}", path.display()))?;

        Self::from_toml_str(&raw)
            .with_context(|| format!("invalid extension manifest at {}", path.display()))
    }

    /// Validate required fields and semantic constraints.
    pub fn validate(&self) -> Result<()> {
        validate_nonempty("id", &self.id)?;
        validate_nonempty("name", &self.name)?;
        validate_nonempty("version", &self.version)?;
        validate_nonempty("runtime.entrypoint", &self.runtime.entrypoint)?;
        validate_nonempty("compatibility.host_api", &self.compatibility.host_api)?;

        if let Some(command) = &self.runtime.command {
            validate_nonempty("runtime.command", command)?;
        }

        validate_runtime_args(&self.runtime.args)?;
        validate_method_names("methods.exported", &self.methods.exported)?;

        Version::parse(&self.version)
            .with_context(|| format!("manifest version must be valid semver: {}", self.version))?;
        VersionReq::parse(&self.compatibility.host_api).with_context(|| {
            format!(
                "compatibility.host_api must be a valid semver requirement: {}",
                self.compatibility.host_api
            )
        })?;

        Ok(())
    }

    /// Ensure this extension supports the provided host API version.
    pub fn supports_host_api(&self, host_api_version: &str) -> Result<()> {
        let requirement = VersionReq::parse(&self.compatibility.host_api).with_context(|| {
            format!(
                "compatibility.host_api must be a valid semver requirement: {}",
                self.compatibility.host_api
            )
        })?;
        let host = Version::parse(host_api_version).with_context(|| {
            format!("host API version must be valid semver: {host_api_version}")
        })?;

        if requirement.matches(&host) {
            Ok(())
        } else {
            bail!(
                "extension requires host_api {} but host is {}",
                self.compatibility.host_api,
                host
            )
        }
    }
}

impl ExtensionMethods {
    /// Return true when the host may call `method` on this extension.
    pub fn exports(&self, method: &str) -> bool {
        self.exported.iter().any(|exported| exported == method)
    }
}

fn validate_nonempty(field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        bail!("{field} must not be empty")
    }
    Ok(())
}

fn validate_runtime_args(args: &[String]) -> Result<()> {
    for arg in args {
        if arg.trim().is_empty() {
            bail!("runtime.args entries must not be empty");
        }
        if arg.trim() != arg {
            bail!(
                "runtime.args entry {:?} has leading/trailing whitespace",
                arg
            );
        }
    }

    Ok(())
}

fn validate_method_names(field: &str, values: &[String]) -> Result<()> {
    let mut seen = BTreeSet::new();

    for value in values {
        if value.trim().is_empty() {
            bail!("{field} entries must not be empty");
        }
        if value.chars().any(char::is_whitespace) {
            bail!("{field} entry {:?} must not contain whitespace", value);
        }
        if !seen.insert(value.as_str()) {
            bail!("{field} contains duplicate entry {:?}", value);
        }
    }

    Ok(())
}
