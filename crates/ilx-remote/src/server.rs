use std::fmt;
use std::io::{self, BufRead, StdinLock, Stdout, Write};

use anyhow::{bail, Context, Result};
use ilx_core::dispatch::{DispatchTable, MethodHandle, RegistrationError};
use ilx_core::method::MethodHandler;
use serde_json::Value;

use crate::protocol::{
    error_code, method_error, negotiate_host_api, positional_params, write_json_line,
    HandshakeParams, HandshakeResult, JsonRpcError, JsonRpcRequest, JsonRpcResponse, RequestId, HANDSHAKE_METHOD,
    JSONRPC_VERSION,
};

/// Identity an extension reports during `ilx.handshake`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerInfo {
    pub plugin_id: String,
    pub plugin_version: String,
}

/// Lifecycle of an [`IlxServer`]. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Uninitialized,
    Registered,
    Listening,
}

impl fmt::Display for ServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerState::Uninitialized => write!(f, "uninitialized"),
            ServerState::Registered => write!(f, "registered"),
            ServerState::Listening => write!(f, "listening"),
        }
    }
}

/// Explicit connection to the host: a line reader for requests and a writer
/// for responses.
pub struct HostConnection<R, W> {
    reader: R,
    writer: W,
}

impl<R: BufRead, W: Write> HostConnection<R, W> {
    pub fn new(reader: R, writer: W) -> Self {
        Self { reader, writer }
    }
}

impl HostConnection<StdinLock<'static>, Stdout> {
    /// Connect to a host that drives this process over stdin/stdout.
    pub fn stdio() -> Self {
        Self::new(io::stdin().lock(), io::stdout())
    }
}

/// One host-dispatched call, with its parameters already extracted.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    id: Option<RequestId>,
    method: String,
    params: Vec<Value>,
}

impl Request {
    pub fn method(&self) -> &str {
        &self.method
    }

    /// Ordered positional parameters.
    pub fn params(&self) -> &[Value] {
        &self.params
    }

    /// Return true when the host expects no reply.
    pub fn is_notification(&self) -> bool {
        self.id.is_none()
    }
}

/// Reply channel for a single request. Consumed by the reply, so at most one
/// reply is ever written; notifications swallow theirs.
pub struct Response<'a, W: Write> {
    id: Option<RequestId>,
    writer: &'a mut W,
}

impl<'a, W: Write> Response<'a, W> {
    fn new(id: Option<RequestId>, writer: &'a mut W) -> Self {
        Self { id, writer }
    }

    pub fn reply(self, value: Value) -> Result<()> {
        match self.id {
            Some(id) => write_json_line(self.writer, &JsonRpcResponse::result(id, value)),
            None => Ok(()),
        }
    }

    pub fn error(self, error: JsonRpcError) -> Result<()> {
        match self.id {
            Some(id) => write_json_line(self.writer, &JsonRpcResponse::error(id, error)),
            None => Ok(()),
        }
    }
}

/// Counters reported once the host closes the channel.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ListenSummary {
    /// Requests answered with a result.
    pub handled: u64,
    /// Requests or lines answered with an error.
    pub failed: u64,
}

/// Extension-side server: a dispatch table bound to a host connection.
pub struct IlxServer {
    info: ServerInfo,
    methods: DispatchTable,
    state: ServerState,
}

impl IlxServer {
    pub fn new(info: ServerInfo) -> Self {
        Self {
            info,
            methods: DispatchTable::new(),
            state: ServerState::Uninitialized,
        }
    }

    pub fn info(&self) -> &ServerInfo {
        &self.info
    }

    pub fn state(&self) -> ServerState {
        self.state
    }

    /// Registered method names in sorted order.
    pub fn methods(&self) -> Vec<&str> {
        self.methods.names()
    }

    /// Register `handler` under `name`.
    ///
    /// Registration is closed once the server has started listening.
    pub fn add_method<H: MethodHandler + 'static>(
        &mut self,
        name: &str,
        handler: H,
    ) -> std::result::Result<MethodHandle, ServerError> {
        if self.state == ServerState::Listening {
            return Err(ServerError::AlreadyListening);
        }

        let handle = self
            .methods
            .register(name, Box::new(handler))
            .map_err(ServerError::Registration)?;
        self.state = ServerState::Registered;
        Ok(handle)
    }

    /// Serve host-dispatched calls until the host closes the channel.
    pub fn listen<R: BufRead, W: Write>(
        &mut self,
        connection: HostConnection<R, W>,
    ) -> Result<ListenSummary> {
        match self.state {
            ServerState::Uninitialized => bail!(ServerError::NoMethods),
            ServerState::Listening => bail!(ServerError::AlreadyListening),
            ServerState::Registered => {}
        }
        self.state = ServerState::Listening;
        tracing::info!(
            plugin_id = %self.info.plugin_id,
            methods = ?self.methods.names(),
            "listening for host calls"
        );

        let HostConnection {
            mut reader,
            mut writer,
        } = connection;
        let mut summary = ListenSummary::default();
        let mut buf = Vec::new();

        loop {
            buf.clear();
            let read = reader
                .read_until(b'\n', &mut buf)
                .context("failed to read from host channel")?;
            if read == 0 {
                break;
            }

            let answered = match std::str::from_utf8(&buf) {
                Ok(line) if line.trim().is_empty() => continue,
                Ok(line) => self.handle_line(line.trim_end_matches(['\r', '\n']), &mut writer)?,
                Err(err) => {
                    tracing::warn!(error = %err, "non UTF-8 line from host");
                    parse_error(format!("parse error: {err}"), &mut writer)?;
                    false
                }
            };

            if answered {
                summary.handled += 1;
            } else {
                summary.failed += 1;
            }
        }

        tracing::info!(
            handled = summary.handled,
            failed = summary.failed,
            "host closed the channel"
        );
        Ok(summary)
    }

    /// Serve calls on stdin/stdout.
    pub fn listen_stdio(&mut self) -> Result<ListenSummary> {
        self.listen(HostConnection::stdio())
    }

    /// Handle one raw line. Returns whether it was answered successfully.
    fn handle_line<W: Write>(&self, line: &str, writer: &mut W) -> Result<bool> {
        let value: Value = match serde_json::from_str(line) {
            Ok(value) => value,
            Err(err) => {
                tracing::warn!(error = %err, "unparseable line from host");
                parse_error(format!("parse error: {err}"), writer)?;
                return Ok(false);
            }
        };

        let fallback_id = value
            .get("id")
            .cloned()
            .and_then(|id| serde_json::from_value::<RequestId>(id).ok())
            .unwrap_or(RequestId::Null);

        let envelope: JsonRpcRequest = match serde_json::from_value(value) {
            Ok(envelope) => envelope,
            Err(err) => {
                let error = JsonRpcError::new(
                    error_code::INVALID_REQUEST,
                    format!("invalid request envelope: {err}"),
                );
                Response::new(Some(fallback_id), writer).error(error)?;
                return Ok(false);
            }
        };

        let response = Response::new(envelope.id.clone(), writer);

        if envelope.jsonrpc != JSONRPC_VERSION {
            let error = JsonRpcError::new(
                error_code::INVALID_REQUEST,
                format!("unsupported jsonrpc version: {}", envelope.jsonrpc),
            );
            response.error(error)?;
            return Ok(false);
        }

        let params = match positional_params(&envelope.method, &envelope.params) {
            Ok(params) => params,
            Err(error) => {
                response.error(error)?;
                return Ok(false);
            }
        };

        let request = Request {
            id: envelope.id,
            method: envelope.method,
            params,
        };
        self.handle_request(&request, response)
    }

    fn handle_request<W: Write>(&self, request: &Request, response: Response<'_, W>) -> Result<bool> {
        tracing::debug!(
            method = request.method(),
            params = request.params().len(),
            notification = request.is_notification(),
            "dispatching host call"
        );

        if request.method() == HANDSHAKE_METHOD {
            return self.handshake(request, response);
        }

        match self.methods.dispatch(request.method(), request.params()) {
            None => {
                tracing::warn!(method = request.method(), "call to unregistered method");
                let error = JsonRpcError::new(
                    error_code::METHOD_NOT_FOUND,
                    format!("method not found: {}", request.method()),
                );
                response.error(error)?;
                Ok(false)
            }
            Some(Ok(value)) => {
                response.reply(value)?;
                Ok(true)
            }
            Some(Err(err)) => {
                tracing::warn!(method = request.method(), error = %err, "method failed");
                response.error(method_error(request.method(), &err))?;
                Ok(false)
            }
        }
    }

    fn handshake<W: Write>(&self, request: &Request, response: Response<'_, W>) -> Result<bool> {
        let params = match HandshakeParams::from_positional(request.params()) {
            Ok(params) => params,
            Err(err) => {
                response.error(method_error(HANDSHAKE_METHOD, &err))?;
                return Ok(false);
            }
        };

        match negotiate_host_api(&params.host_api_version) {
            Ok(api_version) => {
                let result = HandshakeResult {
                    plugin_id: self.info.plugin_id.clone(),
                    plugin_version: self.info.plugin_version.clone(),
                    api_version,
                    methods: self.methods.names().into_iter().map(str::to_string).collect(),
                };
                let value = serde_json::to_value(result)
                    .context("failed to encode handshake result")?;
                response.reply(value)?;
                Ok(true)
            }
            Err(err) => {
                tracing::warn!(error = %err, "handshake rejected");
                response.error(err.to_jsonrpc_error())?;
                Ok(false)
            }
        }
    }
}

/// Answer a line that never became a request; there is no id to echo.
fn parse_error<W: Write>(message: String, writer: &mut W) -> Result<()> {
    let error = JsonRpcError::new(error_code::PARSE_ERROR, message);
    Response::new(Some(RequestId::Null), writer).error(error)
}

/// Server lifecycle failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerError {
    Registration(RegistrationError),
    NoMethods,
    AlreadyListening,
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Registration(err) => write!(f, "{err}"),
            Self::NoMethods => write!(f, "cannot listen before any method is registered"),
            Self::AlreadyListening => write!(f, "server is already listening"),
        }
    }
}

impl std::error::Error for ServerError {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    use ilx_core::method::{MethodError, MethodResult};
    use serde_json::json;

    use crate::protocol::HOST_API_VERSION;

    fn info() -> ServerInfo {
        ServerInfo {
            plugin_id: "ilx.test".into(),
            plugin_version: "0.1.0".into(),
        }
    }

    fn echo(params: &[Value]) -> MethodResult {
        Ok(Value::Array(params.to_vec()))
    }

    fn serve(server: &mut IlxServer, input: &str) -> (ListenSummary, Vec<Value>) {
        serve_bytes(server, input.as_bytes())
    }

    fn serve_bytes(server: &mut IlxServer, input: &[u8]) -> (ListenSummary, Vec<Value>) {
        let mut output = Vec::new();
        let summary = server
            .listen(HostConnection::new(Cursor::new(input.to_vec()), &mut output))
            .unwrap();
        let replies = String::from_utf8(output)
            .unwrap()
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        (summary, replies)
    }

    #[test]
    fn state_moves_forward_only() {
        let mut server = IlxServer::new(info());
        assert_eq!(server.state(), ServerState::Uninitialized);

        server.add_method("echo", echo).unwrap();
        assert_eq!(server.state(), ServerState::Registered);

        serve(&mut server, "");
        assert_eq!(server.state(), ServerState::Listening);

        let err = server.add_method("late", echo).unwrap_err();
        assert_eq!(err, ServerError::AlreadyListening);

        let mut output = Vec::new();
        let err = server
            .listen(HostConnection::new(Cursor::new(String::new()), &mut output))
            .unwrap_err();
        assert!(err.to_string().contains("already listening"));
    }

    #[test]
    fn listen_without_methods_is_rejected() {
        let mut server = IlxServer::new(info());
        let mut output = Vec::new();
        let err = server
            .listen(HostConnection::new(Cursor::new(String::new()), &mut output))
            .unwrap_err();
        assert!(err.to_string().contains("before any method is registered"));
        assert_eq!(server.state(), ServerState::Uninitialized);
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let mut server = IlxServer::new(info());
        server.add_method("echo", echo).unwrap();
        let err = server.add_method("echo", echo).unwrap_err();
        assert_eq!(
            err,
            ServerError::Registration(RegistrationError::Duplicate("echo".into()))
        );
    }

    #[test]
    fn dispatches_positional_params_and_replies_once() {
        let mut server = IlxServer::new(info());
        let handle = server.add_method("echo", echo).unwrap();

        let (summary, replies) = serve(
            &mut server,
            "{\"jsonrpc\":\"2.0\",\"id\":7,\"method\":\"echo\",\"params\":[\"a\",1]}\n",
        );

        assert_eq!(handle.calls(), 1);
        assert_eq!(summary, ListenSummary { handled: 1, failed: 0 });
        assert_eq!(replies, vec![json!({"jsonrpc": "2.0", "id": 7, "result": ["a", 1]})]);
    }

    #[test]
    fn unregistered_method_is_not_found() {
        let mut server = IlxServer::new(info());
        let handle = server.add_method("echo", echo).unwrap();

        let (summary, replies) = serve(
            &mut server,
            "{\"jsonrpc\":\"2.0\",\"id\":\"x\",\"method\":\"other\",\"params\":[]}\n",
        );

        assert_eq!(handle.calls(), 0);
        assert_eq!(summary.failed, 1);
        assert_eq!(replies[0]["id"], "x");
        assert_eq!(replies[0]["error"]["code"], error_code::METHOD_NOT_FOUND);
    }

    #[test]
    fn malformed_lines_do_not_stop_the_loop() {
        let mut server = IlxServer::new(info());
        server.add_method("echo", echo).unwrap();

        let lines: [&[u8]; 7] = [
            b"not json\n",
            b"\n",
            b"\xff\xfe garbage\n",
            b"{\"jsonrpc\":\"2.0\",\"id\":2}\n",
            b"{\"jsonrpc\":\"1.0\",\"id\":3,\"method\":\"echo\"}\n",
            b"{\"jsonrpc\":\"2.0\",\"id\":4,\"method\":\"echo\",\"params\":{\"a\":1}}\n",
            b"{\"jsonrpc\":\"2.0\",\"id\":5,\"method\":\"echo\"}\r\n",
        ];
        let (summary, replies) = serve_bytes(&mut server, &lines.concat());

        assert_eq!(summary, ListenSummary { handled: 1, failed: 5 });
        assert_eq!(replies.len(), 6);
        assert_eq!(replies[0]["id"], Value::Null);
        assert_eq!(replies[0]["error"]["code"], error_code::PARSE_ERROR);
        assert_eq!(replies[1]["id"], Value::Null);
        assert_eq!(replies[1]["error"]["code"], error_code::PARSE_ERROR);
        assert_eq!(replies[2]["id"], 2);
        assert_eq!(replies[2]["error"]["code"], error_code::INVALID_REQUEST);
        assert_eq!(replies[3]["error"]["code"], error_code::INVALID_REQUEST);
        assert_eq!(replies[4]["error"]["code"], error_code::INVALID_PARAMS);
        assert_eq!(replies[5]["id"], 5);
        assert_eq!(replies[5]["result"], json!([]));
    }

    #[test]
    fn invalid_utf8_line_is_answered_and_the_next_call_served() {
        let mut server = IlxServer::new(info());
        let handle = server.add_method("echo", echo).unwrap();

        let mut input = b"\xff\xfe\n".to_vec();
        input.extend_from_slice(b"{\"jsonrpc\":\"2.0\",\"id\":1,\"method\":\"echo\",\"params\":[\"alice\"]}\n");
        let (summary, replies) = serve_bytes(&mut server, &input);

        assert_eq!(handle.calls(), 1);
        assert_eq!(summary, ListenSummary { handled: 1, failed: 1 });
        assert_eq!(replies[0]["error"]["code"], error_code::PARSE_ERROR);
        assert_eq!(replies[1], json!({"jsonrpc": "2.0", "id": 1, "result": ["alice"]}));
    }

    #[test]
    fn null_id_call_gets_a_reply() {
        let mut server = IlxServer::new(info());
        let handle = server.add_method("echo", echo).unwrap();

        let (summary, replies) = serve(
            &mut server,
            "{\"jsonrpc\":\"2.0\",\"id\":null,\"method\":\"echo\",\"params\":[\"alice\"]}\n",
        );

        assert_eq!(handle.calls(), 1);
        assert_eq!(summary, ListenSummary { handled: 1, failed: 0 });
        assert_eq!(replies, vec![json!({"jsonrpc": "2.0", "id": null, "result": ["alice"]})]);
    }

    #[test]
    fn fractional_and_large_ids_are_echoed() {
        let mut server = IlxServer::new(info());
        server.add_method("echo", echo).unwrap();

        let input = concat!(
            "{\"jsonrpc\":\"2.0\",\"id\":1.5,\"method\":\"echo\"}\n",
            "{\"jsonrpc\":\"2.0\",\"id\":18446744073709551615,\"method\":\"echo\"}\n",
        );
        let (summary, replies) = serve(&mut server, input);

        assert_eq!(summary, ListenSummary { handled: 2, failed: 0 });
        assert_eq!(replies[0]["id"], json!(1.5));
        assert_eq!(replies[1]["id"], json!(18446744073709551615u64));
    }

    #[test]
    fn notifications_run_but_are_not_answered() {
        let mut server = IlxServer::new(info());
        let handle = server.add_method("echo", echo).unwrap();

        let (summary, replies) = serve(
            &mut server,
            "{\"jsonrpc\":\"2.0\",\"method\":\"echo\",\"params\":[1]}\n",
        );

        assert_eq!(handle.calls(), 1);
        assert_eq!(summary.handled, 1);
        assert!(replies.is_empty());
    }

    #[test]
    fn handler_errors_are_reported() {
        let mut server = IlxServer::new(info());
        server
            .add_method("fail", |_: &[Value]| -> MethodResult {
                Err(MethodError::Failed("vault offline".into()))
            })
            .unwrap();

        let (_, replies) = serve(
            &mut server,
            "{\"jsonrpc\":\"2.0\",\"id\":1,\"method\":\"fail\"}\n",
        );
        assert_eq!(replies[0]["error"]["code"], error_code::HANDLER_FAILED);
        assert_eq!(replies[0]["error"]["message"], "fail: vault offline");
    }

    #[test]
    fn handshake_reports_identity_and_methods() {
        let mut server = IlxServer::new(info());
        server.add_method("echo", echo).unwrap();
        server.add_method("alpha", echo).unwrap();

        let input = format!(
            "{{\"jsonrpc\":\"2.0\",\"id\":1,\"method\":\"{HANDSHAKE_METHOD}\",\"params\":[\"{HOST_API_VERSION}\"]}}\n"
        );
        let (_, replies) = serve(&mut server, &input);

        let result: HandshakeResult =
            serde_json::from_value(replies[0]["result"].clone()).unwrap();
        assert_eq!(
            result,
            HandshakeResult {
                plugin_id: "ilx.test".into(),
                plugin_version: "0.1.0".into(),
                api_version: HOST_API_VERSION.into(),
                methods: vec!["alpha".into(), "echo".into()],
            }
        );
    }

    #[test]
    fn handshake_rejects_incompatible_host() {
        let mut server = IlxServer::new(info());
        server.add_method("echo", echo).unwrap();

        let input = concat!(
            "{\"jsonrpc\":\"2.0\",\"id\":1,\"method\":\"ilx.handshake\",\"params\":[\"2.0.0\"]}\n",
            "{\"jsonrpc\":\"2.0\",\"id\":2,\"method\":\"ilx.handshake\",\"params\":[]}\n",
        );
        let (_, replies) = serve(&mut server, input);
        assert_eq!(replies[0]["error"]["code"], error_code::UNSUPPORTED_API_VERSION);
        assert_eq!(replies[1]["error"]["code"], error_code::INVALID_PARAMS);
    }
}
