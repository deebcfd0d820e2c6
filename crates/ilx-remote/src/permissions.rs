use std::collections::BTreeSet;
use std::fmt;

use ilx_config::ExtensionManifest;
use semver::{Version, VersionReq};

use crate::protocol::{error_code, JsonRpcError, HOST_API_VERSION};

/// Host-side call policy built from a validated extension manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodPolicy {
    host_api_requirement: String,
    exported: BTreeSet<String>,
}

/// Compatibility and allowlist failures mapped to structured JSON-RPC errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthorizationError {
    InvalidHostApiRequirement(String),
    InvalidHostApiVersion(String),
    UnsupportedHostApi { required: String, host: String },
    UnexportedMethod(String),
}

impl AuthorizationError {
    /// Map authorization failure to JSON-RPC error code.
    pub fn code(&self) -> i32 {
        match self {
            Self::InvalidHostApiRequirement(_) | Self::InvalidHostApiVersion(_) => {
                error_code::INVALID_PARAMS
            }
            Self::UnsupportedHostApi { .. } => error_code::UNSUPPORTED_API_VERSION,
            Self::UnexportedMethod(_) => error_code::UNAUTHORIZED,
        }
    }

    /// Convert to a JSON-RPC error payload.
    pub fn to_jsonrpc_error(&self) -> JsonRpcError {
        JsonRpcError::new(self.code(), self.to_string())
    }
}

impl fmt::Display for AuthorizationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidHostApiRequirement(req) => {
                write!(
                    f,
                    "invalid manifest compatibility.host_api requirement: {req}"
                )
            }
            Self::InvalidHostApiVersion(version) => {
                write!(f, "invalid host API version: {version}")
            }
            Self::UnsupportedHostApi { required, host } => {
                write!(
                    f,
                    "extension requires host_api {required}, but host API is {host}"
                )
            }
            Self::UnexportedMethod(method) => {
                write!(f, "method is not exported by the extension manifest: {method}")
            }
        }
    }
}

impl std::error::Error for AuthorizationError {}

impl MethodPolicy {
    /// Build a policy snapshot from the manifest's exported methods.
    pub fn from_manifest(manifest: &ExtensionManifest) -> Self {
        Self {
            host_api_requirement: manifest.compatibility.host_api.clone(),
            exported: manifest.methods.exported.iter().cloned().collect(),
        }
    }

    /// Ensure the manifest's compatibility requirement matches the host API.
    pub fn ensure_host_compatibility(&self) -> std::result::Result<(), AuthorizationError> {
        let requirement = VersionReq::parse(&self.host_api_requirement).map_err(|_| {
            AuthorizationError::InvalidHostApiRequirement(self.host_api_requirement.clone())
        })?;
        let host = Version::parse(HOST_API_VERSION)
            .map_err(|_| AuthorizationError::InvalidHostApiVersion(HOST_API_VERSION.to_string()))?;

        if requirement.matches(&host) {
            Ok(())
        } else {
            Err(AuthorizationError::UnsupportedHostApi {
                required: self.host_api_requirement.clone(),
                host: host.to_string(),
            })
        }
    }

    /// Enforce the exported-method allowlist before a call leaves the host.
    pub fn authorize_call(&self, method: &str) -> std::result::Result<(), AuthorizationError> {
        if self.exported.contains(method) {
            Ok(())
        } else {
            Err(AuthorizationError::UnexportedMethod(method.to_string()))
        }
    }

    /// Exported methods missing from the list an extension registered.
    pub fn missing_from<'a>(&'a self, registered: &[String]) -> Vec<&'a str> {
        self.exported
            .iter()
            .filter(|method| !registered.contains(*method))
            .map(String::as_str)
            .collect()
    }
}

/// Validate manifest compatibility and return a policy ready for runtime checks.
pub fn policy_from_manifest(
    manifest: &ExtensionManifest,
) -> std::result::Result<MethodPolicy, AuthorizationError> {
    let policy = MethodPolicy::from_manifest(manifest);
    policy.ensure_host_compatibility()?;
    Ok(policy)
}
