use async_trait::async_trait;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use uuid::Uuid;
use zima_core::MCP_PROTOCOL_VERSION;
use zima_runtime::ZimaCore;

/// JSON-RPC 2.0 request. A request without an `id` is a notification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

impl JsonRpcRequest {
    pub fn is_notification(&self) -> bool {
        self.id.is_none()
    }
}

/// JSON-RPC 2.0 response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    pub id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

/// JSON-RPC 2.0 error object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[error("{message} ({code})")]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

// Standard JSON-RPC error codes.
pub const ERR_PARSE: i64 = -32700;
pub const ERR_INVALID_REQUEST: i64 = -32600;
pub const ERR_METHOD_NOT_FOUND: i64 = -32601;
pub const ERR_INVALID_PARAMS: i64 = -32602;
pub const ERR_INTERNAL: i64 = -32603;

impl JsonRpcError {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn parse_error() -> Self {
        Self::new(ERR_PARSE, "Parse error")
    }

    pub fn invalid_request(detail: impl Into<String>) -> Self {
        Self::new(ERR_INVALID_REQUEST, format!("Invalid Request: {}", detail.into()))
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::new(ERR_METHOD_NOT_FOUND, format!("Method not found: {method}"))
    }

    pub fn invalid_params(detail: impl Into<String>) -> Self {
        Self::new(ERR_INVALID_PARAMS, format!("Invalid params: {}", detail.into()))
    }

    pub fn internal(detail: impl Into<String>) -> Self {
        Self::new(ERR_INTERNAL, format!("Internal error: {}", detail.into()))
    }
}

impl JsonRpcResponse {
    pub fn success(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn error(id: Value, error: JsonRpcError) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: None,
            error: Some(error),
        }
    }
}

/// Method dispatch behind every transport.
#[async_trait]
pub trait RpcHandler: Send + Sync {
    async fn handle(&self, method: &str, params: Value) -> Result<Value, JsonRpcError>;
}

/// Turn one raw request into one raw response. Notifications produce an
/// empty string, which transports treat as "nothing to send".
pub async fn handle_text(handler: &dyn RpcHandler, raw: &str) -> String {
    let value: Value = match serde_json::from_str(raw.trim()) {
        Ok(value) => value,
        Err(err) => {
            tracing::debug!(error = %err, "unparseable JSON-RPC payload");
            return encode(JsonRpcResponse::error(Value::Null, JsonRpcError::parse_error()));
        }
    };
    let id = value.get("id").cloned().unwrap_or(Value::Null);
    let request: JsonRpcRequest = match serde_json::from_value(value) {
        Ok(request) => request,
        Err(err) => {
            return encode(JsonRpcResponse::error(
                id,
                JsonRpcError::invalid_request(err.to_string()),
            ));
        }
    };
    if request.jsonrpc != "2.0" {
        return encode(JsonRpcResponse::error(
            id,
            JsonRpcError::invalid_request("jsonrpc must be \"2.0\""),
        ));
    }

    let outcome = match AssertUnwindSafe(handler.handle(&request.method, request.params))
        .catch_unwind()
        .await
    {
        Ok(outcome) => outcome,
        Err(payload) => {
            let message = panic_message(payload);
            tracing::error!(method = %request.method, error = %message, "rpc handler panicked");
            Err(JsonRpcError::internal(message))
        }
    };
    let Some(id) = request.id else {
        if let Err(err) = outcome {
            tracing::debug!(method = %request.method, error = %err, "notification failed");
        }
        return String::new();
    };
    match outcome {
        Ok(result) => encode(JsonRpcResponse::success(id, result)),
        Err(err) => encode(JsonRpcResponse::error(id, err)),
    }
}

/// [`handle_text`] for raw transport bytes. A payload that is not UTF-8 gets
/// the same parse error as malformed JSON.
pub async fn handle_bytes(handler: &dyn RpcHandler, raw: &[u8]) -> String {
    match std::str::from_utf8(raw) {
        Ok(text) => handle_text(handler, text).await,
        Err(err) => {
            tracing::debug!(error = %err, "JSON-RPC payload is not UTF-8");
            encode(JsonRpcResponse::error(Value::Null, JsonRpcError::parse_error()))
        }
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "handler panicked".to_string()
    }
}

fn encode(response: JsonRpcResponse) -> String {
    serde_json::to_string(&response).unwrap_or_else(|err| {
        format!(
            r#"{{"jsonrpc":"2.0","id":null,"error":{{"code":{ERR_INTERNAL},"message":"Internal error: {err}"}}}}"#
        )
    })
}

// ---------------------------------------------------------------------------
// MCP methods over the orchestration core
// ---------------------------------------------------------------------------

pub struct McpHandler {
    core: Arc<ZimaCore>,
}

impl McpHandler {
    pub fn new(core: Arc<ZimaCore>) -> Self {
        Self { core }
    }

    pub fn core(&self) -> &Arc<ZimaCore> {
        &self.core
    }

    fn initialize(&self) -> Value {
        json!({
            "protocolVersion": MCP_PROTOCOL_VERSION,
            "serverInfo": {
                "name": self.core.config().server.name,
                "version": env!("CARGO_PKG_VERSION"),
            },
            "capabilities": {
                "tools": { "listChanged": true },
            },
        })
    }

    fn tools_list(&self, params: &Value) -> Result<Value, JsonRpcError> {
        let session_id = optional_uuid(params, "sessionId")?;
        let tools: Vec<Value> = self
            .core
            .visible_tools(session_id)
            .iter()
            .map(|tool| {
                json!({
                    "name": tool.name,
                    "description": tool.description,
                    "inputSchema": tool.input_schema(),
                })
            })
            .collect();
        Ok(json!({ "tools": tools }))
    }

    async fn tools_call(&self, params: Value) -> Result<Value, JsonRpcError> {
        let name = params
            .get("name")
            .and_then(Value::as_str)
            .filter(|n| !n.is_empty())
            .ok_or_else(|| JsonRpcError::invalid_params("missing tool name"))?;
        let arguments = match params.get("arguments") {
            None | Some(Value::Null) => json!({}),
            Some(args @ Value::Object(_)) => args.clone(),
            Some(_) => return Err(JsonRpcError::invalid_params("arguments must be an object")),
        };
        let session_id = optional_uuid(&params, "sessionId")?;

        let result = self.core.execute_tool(name, arguments, session_id).await;
        Ok(json!({
            "content": [{ "type": "text", "text": result.display_text() }],
            "isError": !result.success,
        }))
    }
}

#[async_trait]
impl RpcHandler for McpHandler {
    async fn handle(&self, method: &str, params: Value) -> Result<Value, JsonRpcError> {
        match method {
            "initialize" => Ok(self.initialize()),
            "ping" => Ok(json!({})),
            "tools/list" => self.tools_list(&params),
            "tools/call" => self.tools_call(params).await,
            m if m.starts_with("notifications/") => Ok(Value::Null),
            _ => Err(JsonRpcError::method_not_found(method)),
        }
    }
}

fn optional_uuid(params: &Value, field: &str) -> Result<Option<Uuid>, JsonRpcError> {
    match params.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Uuid::parse_str(s)
            .map(Some)
            .map_err(|_| JsonRpcError::invalid_params(format!("{field} is not a valid id: {s}"))),
        Some(_) => Err(JsonRpcError::invalid_params(format!("{field} must be a string"))),
    }
}
