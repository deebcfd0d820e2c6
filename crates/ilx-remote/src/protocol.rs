use std::collections::BTreeSet;
use std::fmt;
use std::io::Write;

use anyhow::{anyhow, Context, Result};
use ilx_core::method::{required_str, MethodError};
use semver::{Version, VersionReq};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Number, Value};

/// JSON-RPC protocol version used on the host channel.
pub const JSONRPC_VERSION: &str = "2.0";
/// OpenRPC spec version for embedded contract documents.
pub const OPENRPC_VERSION: &str = "1.3.2";
/// Host API version announced by the host during `ilx.handshake`.
pub const HOST_API_VERSION: &str = "1.0.0";
/// Host API versions this extension runtime can serve.
pub const SUPPORTED_HOST_API: &str = "^1.0";

/// Builtin version negotiation method answered by every extension.
pub const HANDSHAKE_METHOD: &str = "ilx.handshake";

/// Embedded OpenRPC document for the runtime-owned methods.
pub const OPENRPC_SPEC_JSON: &str = include_str!("../openrpc/ilx-extension-v1.openrpc.json");

/// Methods the runtime answers on behalf of every extension.
pub const RUNTIME_METHODS: [&str; 1] = [HANDSHAKE_METHOD];

/// JSON-RPC error codes used on the host channel.
pub mod error_code {
    /// Line was not valid JSON.
    pub const PARSE_ERROR: i32 = -32700;
    /// Line was JSON but not a request envelope.
    pub const INVALID_REQUEST: i32 = -32600;
    /// No handler is registered under the requested name.
    pub const METHOD_NOT_FOUND: i32 = -32601;
    /// JSON-RPC standard invalid params error.
    pub const INVALID_PARAMS: i32 = -32602;
    /// Handler ran and reported a failure.
    pub const HANDLER_FAILED: i32 = -32000;
    /// API version is unsupported by the extension.
    pub const UNSUPPORTED_API_VERSION: i32 = -32001;
    /// Host attempted a call the manifest does not allow.
    pub const UNAUTHORIZED: i32 = -32002;
    /// Extension process or transport is unavailable.
    pub const PLUGIN_UNAVAILABLE: i32 = -32003;
}

/// JSON-RPC request/response ID type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    String(String),
    Number(Number),
    Null,
}

impl From<u64> for RequestId {
    fn from(id: u64) -> Self {
        Self::Number(id.into())
    }
}

/// Present `id` fields, `null` included, become `Some`; only an absent field
/// is left to `#[serde(default)]`.
fn present_id<'de, D>(deserializer: D) -> std::result::Result<Option<RequestId>, D::Error>
where
    D: Deserializer<'de>,
{
    RequestId::deserialize(deserializer).map(Some)
}

/// JSON-RPC error payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl JsonRpcError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }
}

impl fmt::Display for JsonRpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (code {})", self.message, self.code)
    }
}

impl std::error::Error for JsonRpcError {}

/// Request envelope sent by the host. A missing `id` marks a notification;
/// an explicit `"id": null` is still a call and gets a reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    #[serde(
        default,
        deserialize_with = "present_id",
        skip_serializing_if = "Option::is_none"
    )]
    pub id: Option<RequestId>,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

/// Response envelope written by the extension.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    pub id: RequestId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    pub fn result(id: RequestId, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn error(id: RequestId, error: JsonRpcError) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: None,
            error: Some(error),
        }
    }

    /// Collapse the envelope into the reply value or the remote error.
    ///
    /// A `null` result deserializes as an absent one, so absence maps to `null`.
    pub fn into_result(self) -> std::result::Result<Value, JsonRpcError> {
        match self.error {
            Some(error) => Err(error),
            None => Ok(self.result.unwrap_or(Value::Null)),
        }
    }
}

/// Parameters for `ilx.handshake`, sent positionally as `[host_api_version]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeParams {
    pub host_api_version: String,
}

impl HandshakeParams {
    pub fn from_positional(params: &[Value]) -> std::result::Result<Self, MethodError> {
        let host_api_version = required_str(params, 0, "host_api_version")?;
        Ok(Self {
            host_api_version: host_api_version.to_string(),
        })
    }

    pub fn to_positional(&self) -> Vec<Value> {
        vec![Value::String(self.host_api_version.clone())]
    }
}

/// Result payload for `ilx.handshake`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeResult {
    pub plugin_id: String,
    pub plugin_version: String,
    pub api_version: String,
    pub methods: Vec<String>,
}

/// Handshake-specific negotiation failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeError {
    InvalidHostVersion(String),
    UnsupportedHostVersion { host: String, supported: String },
    SupportedRangeInvalid(String),
}

impl HandshakeError {
    /// Map handshake failure to JSON-RPC error code.
    pub fn code(&self) -> i32 {
        match self {
            Self::InvalidHostVersion(_) => error_code::INVALID_PARAMS,
            Self::UnsupportedHostVersion { .. } => error_code::UNSUPPORTED_API_VERSION,
            Self::SupportedRangeInvalid(_) => error_code::PLUGIN_UNAVAILABLE,
        }
    }

    /// Convert to a JSON-RPC error payload.
    pub fn to_jsonrpc_error(&self) -> JsonRpcError {
        JsonRpcError::new(self.code(), self.to_string())
    }
}

impl fmt::Display for HandshakeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidHostVersion(version) => {
                write!(f, "host_api_version is not valid semver: {version}")
            }
            Self::UnsupportedHostVersion { host, supported } => write!(
                f,
                "host API version {host} is not compatible with extension requirement {supported}"
            ),
            Self::SupportedRangeInvalid(range) => {
                write!(f, "supported host API range is not valid semver: {range}")
            }
        }
    }
}

impl std::error::Error for HandshakeError {}

/// Check the host's announced API version against [`SUPPORTED_HOST_API`].
pub fn negotiate_host_api(host_api_version: &str) -> std::result::Result<String, HandshakeError> {
    let supported = VersionReq::parse(SUPPORTED_HOST_API)
        .map_err(|_| HandshakeError::SupportedRangeInvalid(SUPPORTED_HOST_API.to_string()))?;
    let host = Version::parse(host_api_version)
        .map_err(|_| HandshakeError::InvalidHostVersion(host_api_version.to_string()))?;

    if supported.matches(&host) {
        Ok(host.to_string())
    } else {
        Err(HandshakeError::UnsupportedHostVersion {
            host: host.to_string(),
            supported: SUPPORTED_HOST_API.to_string(),
        })
    }
}

/// Map a handler failure onto the wire error it is reported as.
pub fn method_error(method: &str, err: &MethodError) -> JsonRpcError {
    let code = if err.is_params_error() {
        error_code::INVALID_PARAMS
    } else {
        error_code::HANDLER_FAILED
    };
    JsonRpcError::new(code, format!("{method}: {err}"))
}

/// Extract the positional parameter list from a request's `params` field.
///
/// Absent params are an empty sequence. By-name (object) params are rejected.
pub fn positional_params(
    method: &str,
    params: &Value,
) -> std::result::Result<Vec<Value>, JsonRpcError> {
    match params {
        Value::Null => Ok(Vec::new()),
        Value::Array(values) => Ok(values.clone()),
        _ => Err(JsonRpcError::new(
            error_code::INVALID_PARAMS,
            format!("invalid params for {method}: expected a positional array"),
        )),
    }
}

/// Write one JSON value followed by a newline and flush.
pub fn write_json_line<W: Write, T: Serialize>(writer: &mut W, payload: &T) -> Result<()> {
    let encoded =
        serde_json::to_string(payload).context("failed to encode JSON-RPC payload")?;
    writer
        .write_all(encoded.as_bytes())
        .context("failed to write JSON-RPC payload")?;
    writer
        .write_all(b"\n")
        .context("failed to write JSON-RPC payload")?;
    writer.flush().context("failed to flush host channel")?;
    Ok(())
}

#[derive(Debug, Deserialize)]
struct OpenRpcDocument {
    openrpc: String,
    methods: Vec<OpenRpcMethod>,
}

#[derive(Debug, Deserialize)]
struct OpenRpcMethod {
    name: String,
}

/// Read method names from an OpenRPC document.
pub fn openrpc_method_names(document: &str) -> Result<Vec<String>> {
    let doc: OpenRpcDocument =
        serde_json::from_str(document).context("failed to parse OpenRPC document")?;

    if doc.openrpc != OPENRPC_VERSION {
        return Err(anyhow!(
            "OpenRPC version {} does not match expected {}",
            doc.openrpc,
            OPENRPC_VERSION
        ));
    }

    Ok(doc.methods.into_iter().map(|m| m.name).collect())
}

/// Check that an OpenRPC document describes exactly `expected`.
pub fn validate_openrpc_methods(document: &str, expected: &[&str]) -> Result<()> {
    let names = openrpc_method_names(document)?;
    let methods: BTreeSet<_> = names.iter().map(String::as_str).collect();
    let expected: BTreeSet<_> = expected.iter().copied().collect();

    if methods != expected {
        return Err(anyhow!(
            "OpenRPC method set mismatch. expected={:?} actual={:?}",
            expected,
            methods
        ));
    }

    Ok(())
}

/// Parse and validate the embedded runtime OpenRPC document.
pub fn validate_openrpc_spec() -> Result<()> {
    validate_openrpc_methods(OPENRPC_SPEC_JSON, &RUNTIME_METHODS)
}
