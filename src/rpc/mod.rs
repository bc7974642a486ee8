use std::sync::Arc;

use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::dispatch::{Dispatcher, FunctionCall, RunOptions};
use crate::errors::{DispatchError, DispatchResult};
use crate::finder::{SearchMethod, ToolFinder};

pub mod http;
pub mod stdio;

/// MCP protocol revision this server negotiates.
pub const PROTOCOL_VERSION: &str = "2024-11-05";

pub const PARSE_ERROR: i64 = -32700;
pub const INVALID_REQUEST: i64 = -32600;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;
pub const INTERNAL_ERROR: i64 = -32603;

#[derive(Debug, Deserialize)]
struct JsonRpcRequest {
    jsonrpc: String,
    #[serde(default)]
    id: Option<Value>,
    method: String,
    #[serde(default)]
    params: Value,
}

#[derive(Debug, Deserialize)]
struct FindParams {
    query: String,
    #[serde(default)]
    search_method: Option<String>,
    #[serde(default)]
    limit: Option<usize>,
    #[serde(default)]
    format: Option<String>,
}

/// JSON-RPC 2.0 server core, shared by the stdio and HTTP transports.
///
/// Exposes discovery (`tools/list`, `tools/find`) and execution
/// (`tools/call`) plus the `initialize` handshake. Tool errors map onto
/// the JSON-RPC code table with a structured `error.data` object carrying
/// `{type, next_steps, details}`.
pub struct RpcServer {
    dispatcher: Arc<Dispatcher>,
    finder: Arc<ToolFinder>,
    server_name: String,
}

impl RpcServer {
    pub fn new(dispatcher: Arc<Dispatcher>, finder: Arc<ToolFinder>, server_name: impl Into<String>) -> Self {
        Self {
            dispatcher,
            finder,
            server_name: server_name.into(),
        }
    }

    /// Handle one raw frame. Returns `None` for notifications (requests
    /// without an id), which get no response by JSON-RPC rules.
    pub async fn handle_frame(&self, raw: &str) -> Option<Value> {
        let parsed: Value = match serde_json::from_str(raw) {
            Ok(value) => value,
            Err(e) => {
                return Some(error_response(
                    Value::Null,
                    PARSE_ERROR,
                    format!("parse error: {}", e),
                    Value::Null,
                ));
            }
        };
        self.handle_value(parsed).await
    }

    /// Handle one decoded request object.
    pub async fn handle_value(&self, frame: Value) -> Option<Value> {
        let request: JsonRpcRequest = match serde_json::from_value(frame) {
            Ok(request) => request,
            Err(e) => {
                return Some(error_response(
                    Value::Null,
                    INVALID_REQUEST,
                    format!("invalid request: {}", e),
                    Value::Null,
                ));
            }
        };
        if request.jsonrpc != "2.0" {
            return Some(error_response(
                request.id.unwrap_or(Value::Null),
                INVALID_REQUEST,
                "unsupported jsonrpc version".to_string(),
                Value::Null,
            ));
        }

        let id = request.id.clone();
        debug!("rpc: {} (id={:?})", request.method, id);
        let outcome = self.dispatch_method(&request.method, request.params).await;

        // Notifications get no response, success or failure.
        let id = id?;
        Some(match outcome {
            Ok(result) => json!({ "jsonrpc": "2.0", "id": id, "result": result }),
            Err(err) => {
                let (code, message, data) = map_error(&err);
                error_response(id, code, message, data)
            }
        })
    }

    async fn dispatch_method(&self, method: &str, params: Value) -> DispatchResult<Value> {
        match method {
            "initialize" => Ok(self.initialize()),
            "notifications/initialized" | "initialized" => Ok(Value::Null),
            "ping" => Ok(json!({})),
            "tools/list" => Ok(self.tools_list()),
            "tools/find" => self.tools_find(params).await,
            "tools/call" => self.tools_call(params).await,
            other => Err(DispatchError::Protocol(format!(
                "unknown method '{}'",
                other
            ))),
        }
    }

    fn initialize(&self) -> Value {
        json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": { "tools": { "listChanged": false } },
            "serverInfo": {
                "name": self.server_name,
                "version": crate::VERSION,
            },
        })
    }

    /// The full projected catalog: every spec's `parameter` object is the
    /// MCP `inputSchema`.
    fn tools_list(&self) -> Value {
        let tools: Vec<Value> = self
            .dispatcher
            .registry()
            .list_specs()
            .iter()
            .map(|spec| {
                json!({
                    "name": spec.name,
                    "description": spec.description,
                    "inputSchema": spec.parameter,
                })
            })
            .collect();
        json!({ "tools": tools })
    }

    async fn tools_find(&self, params: Value) -> DispatchResult<Value> {
        let params: FindParams = serde_json::from_value(params).map_err(|e| {
            DispatchError::Validation(crate::errors::ValidationError::new(
                "params",
                "object with a 'query' string",
                e.to_string(),
                vec!["Pass {\"query\": \"...\"} with optional search_method/limit/format".into()],
            ))
        })?;

        let method = match params.search_method.as_deref() {
            None => SearchMethod::Auto,
            Some(raw) => SearchMethod::parse(raw).unwrap_or_else(|| {
                warn!("unknown search_method '{}'; falling back to keyword", raw);
                SearchMethod::Keyword
            }),
        };
        let limit = params.limit.unwrap_or(10);
        let matches = self.finder.find(&params.query, method, limit).await?;

        match params.format.as_deref().unwrap_or("detailed") {
            "mcp_standard" => {
                // Shape the shortlist like tools/list so MCP clients can
                // consume it without a custom envelope.
                let registry = self.dispatcher.registry();
                let tools: Vec<Value> = matches
                    .iter()
                    .filter_map(|m| registry.get_spec(&m.name).ok())
                    .map(|spec| {
                        json!({
                            "name": spec.name,
                            "description": spec.description,
                            "inputSchema": spec.parameter,
                        })
                    })
                    .collect();
                Ok(json!({ "tools": tools }))
            }
            _ => Ok(json!({
                "query": params.query,
                "total": matches.len(),
                "tools": matches,
            })),
        }
    }

    async fn tools_call(&self, params: Value) -> DispatchResult<Value> {
        let name = params
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                DispatchError::Validation(crate::errors::ValidationError::new(
                    "name",
                    "string",
                    "missing",
                    vec!["Pass the tool name in params.name".into()],
                ))
            })?
            .to_string();

        // Arguments arrive as a JSON object or a JSON-encoded string.
        let arguments = match params.get("arguments") {
            None | Some(Value::Null) => Value::Object(serde_json::Map::new()),
            Some(Value::String(raw)) => serde_json::from_str(raw).map_err(|e| {
                DispatchError::Validation(crate::errors::ValidationError::new(
                    "arguments",
                    "JSON object (or JSON-encoded object string)",
                    format!("unparseable string: {}", e),
                    vec!["Encode arguments as a JSON object".into()],
                ))
            })?,
            Some(other) => other.clone(),
        };

        let call = FunctionCall::new(name, arguments);
        let result = self.dispatcher.try_run_one(&call, &RunOptions::rpc()).await?;

        let text = match &result {
            Value::String(s) => s.clone(),
            other => serde_json::to_string(other).unwrap_or_default(),
        };
        Ok(json!({ "content": [{ "type": "text", "text": text }] }))
    }
}

fn error_response(id: Value, code: i64, message: String, data: Value) -> Value {
    let mut error = json!({ "code": code, "message": message });
    if !data.is_null() {
        error["data"] = data;
    }
    json!({ "jsonrpc": "2.0", "id": id, "error": error })
}

/// Map a dispatch error onto the JSON-RPC code table, carrying the
/// structured details as `error.data`.
fn map_error(err: &DispatchError) -> (i64, String, Value) {
    let code = match err {
        DispatchError::Validation(_) => INVALID_PARAMS,
        DispatchError::ToolNotFound { .. } => METHOD_NOT_FOUND,
        DispatchError::Protocol(message) if message.starts_with("unknown method") => {
            METHOD_NOT_FOUND
        }
        DispatchError::Protocol(_) => INVALID_REQUEST,
        _ => INTERNAL_ERROR,
    };
    let data = json!({
        "type": err.kind(),
        "next_steps": err.next_steps(),
        "details": err.details(),
    });
    (code, err.to_string(), data)
}

#[cfg(test)]
mod tests;
