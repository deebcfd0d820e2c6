//! Credential lookup exported to iRules LX as `getCredentials`.
//!
//! The provider here is a placeholder that answers every lookup with the same
//! static pair. A vault-backed provider plugs in through [`CredentialProvider`]
//! without touching the registration code.

use ilx_core::dispatch::MethodHandle;
use ilx_core::method::{required_str, MethodError, MethodResult};
use ilx_remote::server::{IlxServer, ServerError};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Remote method name the host dispatches on.
pub const GET_CREDENTIALS_METHOD: &str = "getCredentials";

/// Embedded OpenRPC document for the methods this module registers.
pub const OPENRPC_SPEC_JSON: &str = include_str!("../openrpc/credentials.openrpc.json");

/// A `(username, password)` pair, carried on the wire as a two-element array.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "(String, String)", into = "(String, String)")]
pub struct CredentialPair {
    pub username: String,
    pub password: String,
}

impl From<(String, String)> for CredentialPair {
    fn from((username, password): (String, String)) -> Self {
        Self { username, password }
    }
}

impl From<CredentialPair> for (String, String) {
    fn from(pair: CredentialPair) -> Self {
        (pair.username, pair.password)
    }
}

/// Source of credentials for a username.
pub trait CredentialProvider: Send + Sync {
    fn get_credentials(&self, username: &str) -> CredentialPair;
}

/// Placeholder provider: ignores the username and returns `("admin", "password")`.
#[derive(Debug, Default, Clone, Copy)]
pub struct StaticCredentials;

impl CredentialProvider for StaticCredentials {
    fn get_credentials(&self, _username: &str) -> CredentialPair {
        CredentialPair {
            username: "admin".to_string(),
            password: "password".to_string(),
        }
    }
}

/// Register `getCredentials` on `server`, backed by `provider`.
///
/// Position 0 must be the username as a string; anything else is rejected
/// before the provider runs.
pub fn register<P: CredentialProvider + 'static>(
    server: &mut IlxServer,
    provider: P,
) -> Result<MethodHandle, ServerError> {
    server.add_method(
        GET_CREDENTIALS_METHOD,
        move |params: &[Value]| -> MethodResult {
            let username = required_str(params, 0, "username")?;
            tracing::debug!(username, "credential lookup");

            let pair = provider.get_credentials(username);
            serde_json::to_value(pair).map_err(|err| {
                MethodError::Failed(format!("failed to encode credential pair: {err}"))
            })
        },
    )
}
