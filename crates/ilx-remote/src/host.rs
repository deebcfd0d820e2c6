use std::collections::BTreeMap;
use std::fs;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use ilx_config::ExtensionManifest;
use serde::Serialize;
use serde_json::Value;

use crate::permissions::{policy_from_manifest, AuthorizationError, MethodPolicy};
use crate::protocol::{
    HandshakeParams, HandshakeResult, JsonRpcError, JsonRpcRequest, JsonRpcResponse, RequestId,
    HANDSHAKE_METHOD, HOST_API_VERSION, JSONRPC_VERSION,
};

const EXIT_GRACE: Duration = Duration::from_millis(200);

/// An extension manifest discovered on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredExtension {
    pub manifest_path: PathBuf,
    pub manifest: ExtensionManifest,
}

/// Host runtime failures.
#[derive(Debug, Clone, PartialEq)]
pub enum RuntimeError {
    Discovery(String),
    Spawn(String),
    UnknownExtension(String),
    AlreadyRunning(String),
    NotRunning(String),
    Unauthorized(AuthorizationError),
    Timeout {
        extension_id: String,
        timeout_ms: u64,
    },
    ProcessExited {
        extension_id: String,
        code: Option<i32>,
    },
    Remote {
        extension_id: String,
        method: String,
        error: JsonRpcError,
    },
    Protocol(String),
    Io(String),
}

impl std::fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Discovery(msg) => write!(f, "{msg}"),
            Self::Spawn(msg) => write!(f, "{msg}"),
            Self::UnknownExtension(id) => write!(f, "unknown extension id: {id}"),
            Self::AlreadyRunning(id) => write!(f, "extension is already running: {id}"),
            Self::NotRunning(id) => write!(f, "extension is not running: {id}"),
            Self::Unauthorized(err) => write!(f, "{err}"),
            Self::Timeout {
                extension_id,
                timeout_ms,
            } => write!(
                f,
                "timed out waiting for extension {extension_id} reply after {timeout_ms}ms"
            ),
            Self::ProcessExited { extension_id, code } => {
                write!(f, "extension process exited: {extension_id} (code={code:?})")
            }
            Self::Remote {
                extension_id,
                method,
                error,
            } => write!(f, "extension {extension_id} failed {method}: {error}"),
            Self::Protocol(msg) => write!(f, "{msg}"),
            Self::Io(msg) => write!(f, "{msg}"),
        }
    }
}

impl std::error::Error for RuntimeError {}

/// Discover extension manifests from one or more search roots.
///
/// A root can be either a directory (recursively searched for `plugin.toml`)
/// or a direct path to a `plugin.toml` file.
pub fn discover_extensions(search_roots: &[PathBuf]) -> Result<Vec<DiscoveredExtension>> {
    let mut manifest_paths = Vec::new();
    for root in search_roots {
        collect_manifest_paths(root, &mut manifest_paths)
            .with_context(|| format!("failed to scan extension root {}", root.display()))?;
    }
    manifest_paths.sort();

    let mut discovered = Vec::new();
    let mut seen_ids: BTreeMap<String, PathBuf> = BTreeMap::new();

    for path in manifest_paths {
        let manifest = ExtensionManifest::from_path(&path)
            .with_context(|| format!("failed to load extension manifest {}", path.display()))?;

        if let Some(previous) = seen_ids.insert(manifest.id.clone(), path.clone()) {
            bail!(
                "duplicate extension id {:?} in manifests {} and {}",
                manifest.id,
                previous.display(),
                path.display()
            );
        }

        discovered.push(DiscoveredExtension {
            manifest_path: path,
            manifest,
        });
    }

    discovered.sort_by(|left, right| left.manifest.id.cmp(&right.manifest.id));
    Ok(discovered)
}

/// Registry of discovered extensions and their live processes.
///
/// This is the host side of the channel: it spawns an extension, negotiates
/// the API version and dispatches calls to the extension's registered methods.
pub struct ExtensionHost {
    extensions: BTreeMap<String, RegisteredExtension>,
}

impl ExtensionHost {
    /// Build a host registry from extension search roots.
    pub fn from_search_roots(search_roots: &[PathBuf]) -> std::result::Result<Self, RuntimeError> {
        let discovered = discover_extensions(search_roots)
            .map_err(|err| RuntimeError::Discovery(format!("extension discovery failed: {err:#}")))?;
        Self::register_discovered(discovered)
    }

    /// Build a host registry from discovered manifests.
    pub fn register_discovered(
        discovered: Vec<DiscoveredExtension>,
    ) -> std::result::Result<Self, RuntimeError> {
        let mut extensions = BTreeMap::new();

        for item in discovered {
            if extensions.contains_key(&item.manifest.id) {
                return Err(RuntimeError::Discovery(format!(
                    "duplicate extension id in discovered set: {}",
                    item.manifest.id
                )));
            }

            let policy = policy_from_manifest(&item.manifest).map_err(|err| {
                RuntimeError::Discovery(format!(
                    "extension {} failed compatibility validation: {err}",
                    item.manifest.id
                ))
            })?;

            extensions.insert(
                item.manifest.id.clone(),
                RegisteredExtension {
                    manifest_path: item.manifest_path,
                    manifest: item.manifest,
                    policy,
                    session: None,
                },
            );
        }

        Ok(Self { extensions })
    }

    /// Return all registered extension IDs in sorted order.
    pub fn extension_ids(&self) -> Vec<&str> {
        self.extensions.keys().map(String::as_str).collect()
    }

    pub fn is_running(&self, extension_id: &str) -> bool {
        self.extensions
            .get(extension_id)
            .is_some_and(|ext| ext.session.is_some())
    }

    /// Start an extension process and complete the handshake.
    pub fn start(
        &mut self,
        extension_id: &str,
        timeout: Duration,
    ) -> std::result::Result<HandshakeResult, RuntimeError> {
        let ext = self
            .extensions
            .get_mut(extension_id)
            .ok_or_else(|| RuntimeError::UnknownExtension(extension_id.to_string()))?;

        if ext.session.is_some() {
            return Err(RuntimeError::AlreadyRunning(extension_id.to_string()));
        }

        let mut session = ExtensionSession::spawn(&ext.manifest_path, &ext.manifest)?;

        let handshake = match session.complete_handshake(&ext.manifest, &ext.policy, timeout) {
            Ok(result) => result,
            Err(err) => {
                session.shutdown();
                return Err(err);
            }
        };

        tracing::info!(
            extension = extension_id,
            api_version = %handshake.api_version,
            "extension started"
        );
        ext.session = Some(session);
        Ok(handshake)
    }

    /// Call an exported method on a running extension and wait for its reply.
    pub fn call(
        &mut self,
        extension_id: &str,
        method: &str,
        params: Vec<Value>,
        timeout: Duration,
    ) -> std::result::Result<Value, RuntimeError> {
        let ext = self
            .extensions
            .get_mut(extension_id)
            .ok_or_else(|| RuntimeError::UnknownExtension(extension_id.to_string()))?;

        ext.policy
            .authorize_call(method)
            .map_err(RuntimeError::Unauthorized)?;

        let session = ext
            .session
            .as_mut()
            .ok_or_else(|| RuntimeError::NotRunning(extension_id.to_string()))?;

        let result = session.request(method, params, timeout);
        if matches!(result, Err(RuntimeError::ProcessExited { .. })) {
            ext.session = None;
        }

        match result? {
            Ok(value) => Ok(value),
            Err(error) => Err(RuntimeError::Remote {
                extension_id: extension_id.to_string(),
                method: method.to_string(),
                error,
            }),
        }
    }

    /// Stop one running extension process.
    pub fn shutdown_extension(&mut self, extension_id: &str) -> std::result::Result<(), RuntimeError> {
        let ext = self
            .extensions
            .get_mut(extension_id)
            .ok_or_else(|| RuntimeError::UnknownExtension(extension_id.to_string()))?;

        ext.session = None;
        Ok(())
    }

    /// Stop all running extension processes.
    pub fn shutdown_all(&mut self) {
        for ext in self.extensions.values_mut() {
            ext.session = None;
        }
    }
}

struct RegisteredExtension {
    manifest_path: PathBuf,
    manifest: ExtensionManifest,
    policy: MethodPolicy,
    session: Option<ExtensionSession>,
}

struct ExtensionSession {
    extension_id: String,
    child: Child,
    stdin: ChildStdin,
    reader_rx: Receiver<ReaderEvent>,
    next_id: u64,
}

impl ExtensionSession {
    fn spawn(
        manifest_path: &Path,
        manifest: &ExtensionManifest,
    ) -> std::result::Result<Self, RuntimeError> {
        let manifest_dir = manifest_path.parent().ok_or_else(|| {
            RuntimeError::Spawn(format!(
                "manifest has no parent directory: {}",
                manifest_path.display()
            ))
        })?;

        let entrypoint = manifest_dir.join(&manifest.runtime.entrypoint);
        if !entrypoint.exists() {
            return Err(RuntimeError::Spawn(format!(
                "extension entrypoint does not exist: {}",
                entrypoint.display()
            )));
        }

        let mut command = if let Some(runtime_command) = &manifest.runtime.command {
            let mut command = Command::new(runtime_command);
            command.args(&manifest.runtime.args);
            command.arg(&entrypoint);
            command
        } else {
            let mut command = Command::new(&entrypoint);
            command.args(&manifest.runtime.args);
            command
        };

        command
            .current_dir(manifest_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());

        let mut child = command.spawn().map_err(|err| {
            RuntimeError::Spawn(format!(
                "failed to spawn extension {} process: {err}",
                manifest.id
            ))
        })?;

        let stdin = child.stdin.take().ok_or_else(|| {
            RuntimeError::Spawn(format!(
                "failed to capture extension {} stdin pipe",
                manifest.id
            ))
        })?;

        let stdout = child.stdout.take().ok_or_else(|| {
            RuntimeError::Spawn(format!(
                "failed to capture extension {} stdout pipe",
                manifest.id
            ))
        })?;

        Ok(Self {
            extension_id: manifest.id.clone(),
            child,
            stdin,
            reader_rx: spawn_reader(stdout),
            next_id: 1,
        })
    }

    fn complete_handshake(
        &mut self,
        manifest: &ExtensionManifest,
        policy: &MethodPolicy,
        timeout: Duration,
    ) -> std::result::Result<HandshakeResult, RuntimeError> {
        let params = HandshakeParams {
            host_api_version: HOST_API_VERSION.to_string(),
        };

        let value = self
            .request(HANDSHAKE_METHOD, params.to_positional(), timeout)?
            .map_err(|error| {
                RuntimeError::Protocol(format!(
                    "extension {} rejected {HANDSHAKE_METHOD}: {error}",
                    self.extension_id
                ))
            })?;

        let result: HandshakeResult = serde_json::from_value(value).map_err(|err| {
            RuntimeError::Protocol(format!(
                "invalid {HANDSHAKE_METHOD} result from extension {}: {err}",
                self.extension_id
            ))
        })?;

        if result.plugin_id != manifest.id {
            return Err(RuntimeError::Protocol(format!(
                "handshake plugin_id mismatch: manifest={} reply={}",
                manifest.id, result.plugin_id
            )));
        }

        if result.plugin_version != manifest.version {
            return Err(RuntimeError::Protocol(format!(
                "handshake plugin_version mismatch: manifest={} reply={}",
                manifest.version, result.plugin_version
            )));
        }

        let missing = policy.missing_from(&result.methods);
        if !missing.is_empty() {
            return Err(RuntimeError::Protocol(format!(
                "extension {} exports methods it did not register: {}",
                self.extension_id,
                missing.join(", ")
            )));
        }

        Ok(result)
    }

    /// Send one request and wait for the response carrying its id.
    fn request(
        &mut self,
        method: &str,
        params: Vec<Value>,
        timeout: Duration,
    ) -> std::result::Result<std::result::Result<Value, JsonRpcError>, RuntimeError> {
        let id = RequestId::from(self.next_id);
        self.next_id += 1;

        let request = JsonRpcRequest {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: Some(id.clone()),
            method: method.to_string(),
            params: Value::Array(params),
        };
        self.send_json_line(&request)?;

        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let response = self.next_response(remaining, timeout)?;
            if response.id == id {
                return Ok(response.into_result());
            }

            tracing::warn!(
                extension = %self.extension_id,
                expected = ?id,
                received = ?response.id,
                "discarding reply with unexpected id"
            );
        }
    }

    fn next_response(
        &mut self,
        remaining: Duration,
        timeout: Duration,
    ) -> std::result::Result<JsonRpcResponse, RuntimeError> {
        match self.reader_rx.recv_timeout(remaining) {
            Ok(ReaderEvent::Response(response)) => Ok(response),
            Ok(ReaderEvent::ProtocolError(message)) => Err(RuntimeError::Protocol(format!(
                "extension {} protocol error: {message}",
                self.extension_id
            ))),
            Ok(ReaderEvent::IoError(message)) => Err(RuntimeError::Io(format!(
                "extension {} stdout read error: {message}",
                self.extension_id
            ))),
            Ok(ReaderEvent::Eof) => Err(self.process_exited_error()),
            Err(RecvTimeoutError::Timeout) => {
                if let Some(status) = self.child.try_wait().map_err(|err| {
                    RuntimeError::Io(format!(
                        "failed to poll extension {} process status: {err}",
                        self.extension_id
                    ))
                })? {
                    return Err(RuntimeError::ProcessExited {
                        extension_id: self.extension_id.clone(),
                        code: status.code(),
                    });
                }

                Err(RuntimeError::Timeout {
                    extension_id: self.extension_id.clone(),
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
            Err(RecvTimeoutError::Disconnected) => Err(self.process_exited_error()),
        }
    }

    fn send_json_line<T: Serialize>(
        &mut self,
        payload: &T,
    ) -> std::result::Result<(), RuntimeError> {
        let encoded = serde_json::to_string(payload).map_err(|err| {
            RuntimeError::Protocol(format!("failed to encode JSON-RPC payload: {err}"))
        })?;

        self.stdin
            .write_all(encoded.as_bytes())
            .map_err(|err| self.io_error(err))?;
        self.stdin
            .write_all(b"\n")
            .map_err(|err| self.io_error(err))?;
        self.stdin.flush().map_err(|err| self.io_error(err))?;
        Ok(())
    }

    fn io_error(&mut self, error: std::io::Error) -> RuntimeError {
        match self.wait_for_exit() {
            Ok(Some(code)) => RuntimeError::ProcessExited {
                extension_id: self.extension_id.clone(),
                code,
            },
            Ok(None) | Err(_) => RuntimeError::Io(format!(
                "extension {} stdio error: {error}",
                self.extension_id
            )),
        }
    }

    fn process_exited_error(&mut self) -> RuntimeError {
        match self.wait_for_exit() {
            Ok(Some(code)) => RuntimeError::ProcessExited {
                extension_id: self.extension_id.clone(),
                code,
            },
            Ok(None) => RuntimeError::Io(format!(
                "extension {} reply stream ended unexpectedly",
                self.extension_id
            )),
            Err(err) => RuntimeError::Io(format!(
                "failed to poll extension {} process status: {err}",
                self.extension_id
            )),
        }
    }

    /// Poll for process exit for a short grace period.
    ///
    /// Stdout closes slightly before the exit status becomes observable.
    fn wait_for_exit(&mut self) -> std::io::Result<Option<Option<i32>>> {
        let deadline = Instant::now() + EXIT_GRACE;
        loop {
            if let Some(status) = self.child.try_wait()? {
                return Ok(Some(status.code()));
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            thread::sleep(Duration::from_millis(10));
        }
    }

    fn shutdown(&mut self) {
        match self.child.try_wait() {
            Ok(Some(_)) => {}
            Ok(None) => {
                let _ = self.child.kill();
                let _ = self.child.wait();
            }
            Err(_) => {}
        }
    }
}

impl Drop for ExtensionSession {
    fn drop(&mut self) {
        self.shutdown();
    }
}

enum ReaderEvent {
    Response(JsonRpcResponse),
    ProtocolError(String),
    IoError(String),
    Eof,
}

fn spawn_reader(stdout: ChildStdout) -> Receiver<ReaderEvent> {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let reader = BufReader::new(stdout);
        for line in reader.lines() {
            match line {
                Ok(line) => {
                    if line.trim().is_empty() {
                        continue;
                    }

                    let parsed = serde_json::from_str::<JsonRpcResponse>(&line)
                        .map_err(|err| format!("invalid JSON-RPC response ({err}): {line}"));

                    match parsed {
                        Ok(response) => {
                            if tx.send(ReaderEvent::Response(response)).is_err() {
                                return;
                            }
                        }
                        Err(message) => {
                            let _ = tx.send(ReaderEvent::ProtocolError(message));
                            return;
                        }
                    }
                }
                Err(err) => {
                    let _ = tx.send(ReaderEvent::IoError(err.to_string()));
                    return;
                }
            }
        }

        let _ = tx.send(ReaderEvent::Eof);
    });
    rx
}

fn collect_manifest_paths(root: &Path, paths: &mut Vec<PathBuf>) -> Result<()> {
    if !root.exists() {
        return Ok(());
    }

    if root.is_file() {
        if root.file_name().and_then(|name| name.to_str()) == Some("plugin.toml") {
            paths.push(root.to_path_buf());
        }
        return Ok(());
    }

    let mut stack = vec![root.to_path_buf()];
    while let Some(path) = stack.pop() {
        for entry in fs::read_dir(&path)
            .with_context(|| format!("failed to read directory {}", path.display()))?
        {
            let entry = entry
                .with_context(|| format!("failed to read directory entry in {}", path.display()))?;
            let child = entry.path();
            if child.is_dir() {
                stack.push(child);
                continue;
            }

            if child.file_name().and_then(|name| name.to_str()) == Some("plugin.toml") {
                paths.push(child);
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::{SystemTime, UNIX_EPOCH};

    use serde_json::json;

    use crate::protocol::error_code;

    static TEST_COUNTER: AtomicU64 = AtomicU64::new(0);

    struct TestDir {
        path: PathBuf,
    }

    impl TestDir {
        fn new(name: &str) -> Self {
            let nanos = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap()
                .as_nanos();
            let counter = TEST_COUNTER.fetch_add(1, Ordering::Relaxed);
            let path = std::env::temp_dir().join(format!(
                "ilx-remote-{name}-{}-{nanos}-{counter}",
                std::process::id()
            ));
            fs::create_dir_all(&path).unwrap();
            Self { path }
        }
    }

    impl Drop for TestDir {
        fn drop(&mut self) {
            let _ = fs::remove_dir_all(&self.path);
        }
    }

    fn write_manifest(dir: &Path, extension_id: &str, entrypoint: &str, exported: &[&str]) {
        let exported = exported
            .iter()
            .map(|method| format!("\"{method}\""))
            .collect::<Vec<_>>()
            .join(", ");

        let manifest = format!(
            r#"
id = "{extension_id}"
name = "Fixture Extension"
version = "0.1.0"

[runtime]
entrypoint = "{entrypoint}"
command = "sh"
args = []

[compatibility]
host_api = "^1.0.0"

[methods]
exported = [{exported}]
"#
        );

        fs::write(dir.join("plugin.toml"), manifest).unwrap();
    }

    fn handshake_reply(extension_id: &str, methods: &str) -> String {
        format!(
            r#"echo '{{"jsonrpc":"2.0","id":1,"result":{{"plugin_id":"{extension_id}","plugin_version":"0.1.0","api_version":"1.0.0","methods":{methods}}}}}'"#
        )
    }

    fn wait_for_transcript(path: &Path, min_lines: usize) -> Vec<String> {
        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            if let Ok(raw) = fs::read_to_string(path) {
                let lines = raw
                    .lines()
                    .map(|line| line.to_string())
                    .collect::<Vec<String>>();
                if lines.len() >= min_lines {
                    return lines;
                }
            }

            if Instant::now() > deadline {
                panic!(
                    "timed out waiting for transcript {} to reach {min_lines} lines",
                    path.display()
                );
            }

            thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn discover_extensions_rejects_duplicate_ids() {
        let root = TestDir::new("duplicate-discovery");
        let ext_a = root.path.join("a");
        let ext_b = root.path.join("b");
        fs::create_dir_all(&ext_a).unwrap();
        fs::create_dir_all(&ext_b).unwrap();

        write_manifest(&ext_a, "ilx.dup", "a.sh", &[]);
        write_manifest(&ext_b, "ilx.dup", "b.sh", &[]);

        let err = discover_extensions(std::slice::from_ref(&root.path)).unwrap_err();
        assert!(err.to_string().contains("duplicate extension id"));
    }

    #[test]
    fn discover_extensions_accepts_direct_manifest_path() {
        let root = TestDir::new("direct-path");
        write_manifest(&root.path, "ilx.direct", "index.sh", &["getCredentials"]);

        let discovered = discover_extensions(&[root.path.join("plugin.toml")]).unwrap();
        assert_eq!(discovered.len(), 1);
        assert_eq!(discovered[0].manifest.id, "ilx.direct");
    }

    #[test]
    fn unknown_extension_is_reported() {
        let mut host = ExtensionHost::register_discovered(Vec::new()).unwrap();
        let err = host
            .call("ilx.nope", "getCredentials", vec![], Duration::from_millis(10))
            .unwrap_err();
        assert_eq!(err, RuntimeError::UnknownExtension("ilx.nope".into()));
    }

    #[cfg(unix)]
    #[test]
    fn host_handshakes_and_calls_exported_method() {
        let root = TestDir::new("call-flow");
        let ext_dir = root.path.join("ext");
        fs::create_dir_all(&ext_dir).unwrap();

        let transcript = ext_dir.join("transcript.log");
        let script = format!(
            r#"#!/bin/sh
set -eu
TRANSCRIPT="__TRANSCRIPT__"

IFS= read -r line
echo "$line" >> "$TRANSCRIPT"
{handshake}

IFS= read -r line
echo "$line" >> "$TRANSCRIPT"
echo '{{"jsonrpc":"2.0","id":2,"result":["admin","password"]}}'

IFS= read -r line
echo "$line" >> "$TRANSCRIPT"
echo '{{"jsonrpc":"2.0","id":3,"error":{{"code":-32602,"message":"getCredentials: missing parameter username at position 0"}}}}'

IFS= read -r line || true
"#,
            handshake = handshake_reply("ilx.fixture", r#"["getCredentials"]"#)
        )
        .replace("__TRANSCRIPT__", &transcript.to_string_lossy());

        fs::write(ext_dir.join("index.sh"), script).unwrap();
        write_manifest(&ext_dir, "ilx.fixture", "index.sh", &["getCredentials"]);

        let mut host = ExtensionHost::from_search_roots(std::slice::from_ref(&root.path)).unwrap();
        assert_eq!(host.extension_ids(), vec!["ilx.fixture"]);

        let handshake = host.start("ilx.fixture", Duration::from_secs(2)).unwrap();
        assert_eq!(handshake.api_version, HOST_API_VERSION);
        assert_eq!(handshake.methods, vec!["getCredentials".to_string()]);
        assert!(host.is_running("ilx.fixture"));

        let reply = host
            .call(
                "ilx.fixture",
                "getCredentials",
                vec![json!("alice")],
                Duration::from_secs(2),
            )
            .unwrap();
        assert_eq!(reply, json!(["admin", "password"]));

        let err = host
            .call("ilx.fixture", "getCredentials", vec![], Duration::from_secs(2))
            .unwrap_err();
        match err {
            RuntimeError::Remote { error, method, .. } => {
                assert_eq!(method, "getCredentials");
                assert_eq!(error.code, error_code::INVALID_PARAMS);
            }
            other => panic!("expected remote error, got {other:?}"),
        }

        let lines = wait_for_transcript(&transcript, 3);
        let handshake_request: Value = serde_json::from_str(&lines[0]).unwrap();
        let call_request: Value = serde_json::from_str(&lines[1]).unwrap();
        let empty_request: Value = serde_json::from_str(&lines[2]).unwrap();

        assert_eq!(handshake_request["method"], HANDSHAKE_METHOD);
        assert_eq!(handshake_request["params"], json!([HOST_API_VERSION]));
        assert_eq!(call_request["id"], 2);
        assert_eq!(call_request["method"], "getCredentials");
        assert_eq!(call_request["params"], json!(["alice"]));
        assert_eq!(empty_request["params"], json!([]));

        host.shutdown_all();
        assert!(!host.is_running("ilx.fixture"));
    }

    #[cfg(unix)]
    #[test]
    fn host_refuses_unexported_method_without_sending() {
        let root = TestDir::new("deny-call");
        let ext_dir = root.path.join("ext");
        fs::create_dir_all(&ext_dir).unwrap();

        let transcript = ext_dir.join("transcript.log");
        let script = format!(
            r#"#!/bin/sh
set -eu
TRANSCRIPT="__TRANSCRIPT__"

IFS= read -r line
{handshake}

while IFS= read -r line; do
  echo "$line" >> "$TRANSCRIPT"
done
"#,
            handshake = handshake_reply("ilx.deny", r#"["getCredentials"]"#)
        )
        .replace("__TRANSCRIPT__", &transcript.to_string_lossy());

        fs::write(ext_dir.join("index.sh"), script).unwrap();
        write_manifest(&ext_dir, "ilx.deny", "index.sh", &["getCredentials"]);

        let mut host = ExtensionHost::from_search_roots(std::slice::from_ref(&root.path)).unwrap();
        host.start("ilx.deny", Duration::from_secs(2)).unwrap();

        let err = host
            .call("ilx.deny", "dumpVault", vec![], Duration::from_secs(2))
            .unwrap_err();
        match err {
            RuntimeError::Unauthorized(err) => assert_eq!(err.code(), error_code::UNAUTHORIZED),
            other => panic!("expected unauthorized, got {other:?}"),
        }
        assert!(host.is_running("ilx.deny"));

        host.shutdown_all();
        assert!(!transcript.exists());
    }

    #[cfg(unix)]
    #[test]
    fn handshake_identity_mismatch_is_rejected() {
        let root = TestDir::new("identity-mismatch");
        let ext_dir = root.path.join("ext");
        fs::create_dir_all(&ext_dir).unwrap();

        let script = format!(
            "#!/bin/sh\nIFS= read -r line\n{}\nIFS= read -r line || true\n",
            handshake_reply("ilx.other", r#"["getCredentials"]"#)
        );
        fs::write(ext_dir.join("index.sh"), script).unwrap();
        write_manifest(&ext_dir, "ilx.expected", "index.sh", &["getCredentials"]);

        let mut host = ExtensionHost::from_search_roots(std::slice::from_ref(&root.path)).unwrap();
        let err = host
            .start("ilx.expected", Duration::from_secs(2))
            .unwrap_err();

        assert!(matches!(err, RuntimeError::Protocol(ref msg) if msg.contains("plugin_id mismatch")));
        assert!(!host.is_running("ilx.expected"));
    }

    #[cfg(unix)]
    #[test]
    fn handshake_missing_export_is_rejected() {
        let root = TestDir::new("missing-export");
        let ext_dir = root.path.join("ext");
        fs::create_dir_all(&ext_dir).unwrap();

        let script = format!(
            "#!/bin/sh\nIFS= read -r line\n{}\nIFS= read -r line || true\n",
            handshake_reply("ilx.partial", "[]")
        );
        fs::write(ext_dir.join("index.sh"), script).unwrap();
        write_manifest(&ext_dir, "ilx.partial", "index.sh", &["getCredentials"]);

        let mut host = ExtensionHost::from_search_roots(std::slice::from_ref(&root.path)).unwrap();
        let err = host.start("ilx.partial", Duration::from_secs(2)).unwrap_err();

        assert!(matches!(err, RuntimeError::Protocol(ref msg) if msg.contains("did not register")));
    }

    #[cfg(unix)]
    #[test]
    fn crashed_extension_is_reported_without_panicking_host() {
        let root = TestDir::new("crash-isolation");
        let ext_dir = root.path.join("ext");
        fs::create_dir_all(&ext_dir).unwrap();

        fs::write(ext_dir.join("index.sh"), "#!/bin/sh\nexit 17\n").unwrap();
        write_manifest(&ext_dir, "ilx.crash", "index.sh", &[]);

        let mut host = ExtensionHost::from_search_roots(std::slice::from_ref(&root.path)).unwrap();
        let err = host
            .start("ilx.crash", Duration::from_millis(400))
            .unwrap_err();

        assert!(matches!(
            err,
            RuntimeError::ProcessExited {
                extension_id,
                code: Some(17)
            } if extension_id == "ilx.crash"
        ));
    }
}
