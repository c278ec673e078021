//! MCP method dispatch: manifest lookups, argument marshalling, serial
//! transactions, and the JSON-RPC error mapping.

use std::sync::Arc;
use std::time::Duration;

use mculink_manifest::ToolDescriptor;
use mculink_protocol::{ArgEncoder, PayloadCursor, WireType};
use serde_json::{json, Map, Value};
use tracing::{debug, warn};

use crate::rpc::{error_codes, JsonRpcRequest, JsonRpcResponse};
use crate::script;
use crate::supervisor::{ConnectionState, StateCell};
use crate::transactor::Transactor;

/// MCP protocol revision advertised when the client does not name one.
pub const PROTOCOL_VERSION: &str = "2024-11-05";

pub struct Dispatcher {
    state: StateCell,
    transactor: Arc<Transactor>,
    call_timeout: Duration,
    /// Loopback URL of our own `/mcp` endpoint, handed to script
    /// trampolines so scripted tool calls funnel through the same
    /// transactor as direct ones.
    mcp_endpoint: String,
}

impl Dispatcher {
    pub fn new(
        state: StateCell,
        transactor: Arc<Transactor>,
        call_timeout: Duration,
        mcp_endpoint: String,
    ) -> Self {
        Self {
            state,
            transactor,
            call_timeout,
            mcp_endpoint,
        }
    }

    /// Parse and handle one JSON-RPC request body.
    pub async fn dispatch(&self, body: &str) -> JsonRpcResponse {
        let request: JsonRpcRequest = match serde_json::from_str(body) {
            Ok(request) => request,
            Err(e) => {
                warn!(error = %e, "unparseable JSON-RPC request");
                return JsonRpcResponse::error(
                    None,
                    error_codes::PARSE_ERROR,
                    format!("JSON parse error: {e}"),
                );
            }
        };
        self.handle(request).await
    }

    pub async fn handle(&self, request: JsonRpcRequest) -> JsonRpcResponse {
        debug!(method = %request.method, "handling MCP request");
        let id = request.id.clone();
        match request.method.as_str() {
            "initialize" => self.handle_initialize(request),
            "notifications/initialized" => JsonRpcResponse::success(id, json!({})),
            "tools/list" => self.handle_tools_list(id),
            "tools/call" => self.handle_tools_call(id, request.params).await,
            other => JsonRpcResponse::error(
                id,
                error_codes::METHOD_NOT_FOUND,
                format!("method not found: {other}"),
            ),
        }
    }

    fn handle_initialize(&self, request: JsonRpcRequest) -> JsonRpcResponse {
        let protocol_version = request
            .params
            .as_ref()
            .and_then(|p| p.get("protocolVersion"))
            .and_then(Value::as_str)
            .unwrap_or(PROTOCOL_VERSION);
        JsonRpcResponse::success(
            request.id,
            json!({
                "protocolVersion": protocol_version,
                "capabilities": { "tools": {} },
                "serverInfo": {
                    "name": env!("CARGO_PKG_NAME"),
                    "version": env!("CARGO_PKG_VERSION"),
                },
            }),
        )
    }

    /// `tools/list` never fails over an absent device: it reports an empty
    /// list together with a status annotation instead.
    fn handle_tools_list(&self, id: Option<Value>) -> JsonRpcResponse {
        match self.state.snapshot() {
            ConnectionState::Ready { manifest, .. } => {
                let mut tools: Vec<Value> = manifest.tools.iter().map(tool_info).collect();
                tools.push(script::tool_info());
                JsonRpcResponse::success(id, json!({ "tools": tools }))
            }
            state => JsonRpcResponse::success(
                id,
                json!({
                    "tools": [],
                    "_status": {
                        "state": state.name(),
                        "message": state.status_message(),
                    },
                }),
            ),
        }
    }

    async fn handle_tools_call(&self, id: Option<Value>, params: Option<Value>) -> JsonRpcResponse {
        let Some(params) = params else {
            return JsonRpcResponse::error(id, error_codes::INVALID_PARAMS, "missing params");
        };
        let Some(name) = params.get("name").and_then(Value::as_str) else {
            return JsonRpcResponse::error(id, error_codes::INVALID_PARAMS, "missing tool name");
        };
        let default_args = json!({});
        let arguments = params.get("arguments").unwrap_or(&default_args);

        let state = self.state.snapshot();
        let manifest = match &state {
            ConnectionState::Ready { manifest, .. } => manifest.clone(),
            _ => {
                return JsonRpcResponse::error_with_data(
                    id,
                    error_codes::INTERNAL_ERROR,
                    format!("device not ready: {}", state.status_message()),
                    Some(json!({ "state": state.name() })),
                );
            }
        };

        if name == script::TOOL_NAME {
            return script::handle_call(id, arguments, &manifest, &self.mcp_endpoint).await;
        }

        let Some(tool) = manifest.by_name(name) else {
            return JsonRpcResponse::error(
                id,
                error_codes::INVALID_PARAMS,
                format!("unknown tool: {name}"),
            );
        };

        let encoder = match encode_arguments(tool, arguments) {
            Ok(encoder) => encoder,
            Err(message) => {
                return JsonRpcResponse::error(id, error_codes::INVALID_PARAMS, message)
            }
        };

        // Serial I/O is blocking; keep it off the async workers.
        let transactor = self.transactor.clone();
        let tag = tool.tag;
        let timeout = self.call_timeout;
        let outcome = tokio::task::spawn_blocking(move || {
            transactor.transact(tag, encoder.as_bytes(), timeout)
        })
        .await;

        let payload = match outcome {
            Ok(Ok(payload)) => payload,
            Ok(Err(e)) => {
                warn!(tool = name, error = %e, "tool call failed");
                return JsonRpcResponse::error(
                    id,
                    error_codes::INTERNAL_ERROR,
                    format!("tool '{name}' failed: {e}"),
                );
            }
            Err(e) => {
                return JsonRpcResponse::error(
                    id,
                    error_codes::INTERNAL_ERROR,
                    format!("transaction task failed: {e}"),
                );
            }
        };

        match render_return(tool, &payload) {
            Ok(text) => JsonRpcResponse::success(
                id,
                json!({ "content": [{ "type": "text", "text": text }] }),
            ),
            Err(message) => JsonRpcResponse::error(id, error_codes::INTERNAL_ERROR, message),
        }
    }
}

/// The MCP tool listing entry for one manifest descriptor.
fn tool_info(tool: &ToolDescriptor) -> Value {
    let mut properties = Map::new();
    let mut required = Vec::new();
    for param in &tool.params {
        let ty = match param.ty {
            WireType::I16 | WireType::I32 => "integer",
            WireType::CStr => "string",
        };
        properties.insert(param.name.clone(), json!({ "type": ty }));
        required.push(param.name.clone());
    }
    json!({
        "name": tool.name,
        "description": tool.description,
        "inputSchema": {
            "type": "object",
            "properties": properties,
            "required": required,
        },
    })
}

/// Coerce the JSON argument object into the wire encoding, in declaration
/// order. Every failure here is an invalid-params error raised before any
/// byte reaches the device.
fn encode_arguments(tool: &ToolDescriptor, arguments: &Value) -> Result<ArgEncoder, String> {
    let args = arguments
        .as_object()
        .ok_or_else(|| "arguments must be an object".to_string())?;

    for key in args.keys() {
        if !tool.params.iter().any(|p| &p.name == key) {
            return Err(format!(
                "unexpected argument '{key}' for tool '{}'",
                tool.name
            ));
        }
    }

    let mut encoder = ArgEncoder::new();
    for param in &tool.params {
        let value = args.get(&param.name).ok_or_else(|| {
            format!(
                "missing required argument '{}' ({}) for tool '{}'",
                param.name,
                param.ty.name(),
                tool.name
            )
        })?;
        let oversize =
            |_| format!("arguments for tool '{}' exceed the frame size budget", tool.name);
        match param.ty {
            WireType::I16 => {
                let raw = value.as_i64().ok_or_else(|| {
                    format!("argument '{}' must be an integer, got {value}", param.name)
                })?;
                let v = i16::try_from(raw).map_err(|_| {
                    format!(
                        "argument '{}' value {raw} is out of range for i16 ({}..={})",
                        param.name,
                        i16::MIN,
                        i16::MAX
                    )
                })?;
                encoder.write_i16(v).map_err(oversize)?;
            }
            WireType::I32 => {
                let raw = value.as_i64().ok_or_else(|| {
                    format!("argument '{}' must be an integer, got {value}", param.name)
                })?;
                let v = i32::try_from(raw).map_err(|_| {
                    format!(
                        "argument '{}' value {raw} is out of range for i32 ({}..={})",
                        param.name,
                        i32::MIN,
                        i32::MAX
                    )
                })?;
                encoder.write_i32(v).map_err(oversize)?;
            }
            WireType::CStr => {
                let s = value.as_str().ok_or_else(|| {
                    format!("argument '{}' must be a string, got {value}", param.name)
                })?;
                encoder.write_cstr(s).map_err(|e| match e {
                    mculink_protocol::Error::InteriorNul => format!(
                        "argument '{}' must not contain embedded NUL bytes",
                        param.name
                    ),
                    _ => oversize(e),
                })?;
            }
        }
    }
    Ok(encoder)
}

/// Decode the response payload against the declared return type and render
/// it as result text.
fn render_return(tool: &ToolDescriptor, payload: &[u8]) -> Result<String, String> {
    let malformed = |_| format!("malformed response payload from tool '{}'", tool.name);
    match tool.return_type {
        None => {
            if payload.is_empty() {
                Ok("Command executed successfully".to_string())
            } else {
                Err(format!(
                    "unexpected {}-byte payload in void response from tool '{}'",
                    payload.len(),
                    tool.name
                ))
            }
        }
        Some(WireType::I16) => {
            let mut cursor = PayloadCursor::new(payload);
            let v = cursor.read_i16().map_err(malformed)?;
            cursor.finish().map_err(malformed)?;
            Ok(v.to_string())
        }
        Some(WireType::I32) => {
            let mut cursor = PayloadCursor::new(payload);
            let v = cursor.read_i32().map_err(malformed)?;
            cursor.finish().map_err(malformed)?;
            Ok(v.to_string())
        }
        Some(WireType::CStr) => {
            let mut cursor = PayloadCursor::new(payload);
            let s = cursor.read_cstr().map_err(malformed)?.to_string();
            cursor.finish().map_err(malformed)?;
            Ok(s)
        }
    }
}
