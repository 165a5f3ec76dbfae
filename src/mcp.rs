//! MCP JSON-RPC bridge over `POST /mcp`.
//!
//! Exposes the retrieval tools to MCP clients through a minimal
//! initialize / tools-list / tools-call handshake. `initialize` mints a
//! session ID returned via the `Mcp-Session-Id` response header; every
//! subsequent request must echo it. Sessions live in a process-wide map
//! behind a reader/writer lock.
//!
//! JSON-RPC error codes: `-32700` parse, `-32600` bad request, `-32601`
//! method or tool not found, `-32602` invalid params, `-32603` internal,
//! `-32000` session errors.

use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::server::AppState;

const SESSION_HEADER: &str = "Mcp-Session-Id";
const PROTOCOL_VERSION: &str = "2024-11-05";

/// One initialized MCP session.
#[derive(Debug, Clone)]
pub struct McpSession {
    pub id: String,
    pub created: i64,
}

#[derive(Debug, Deserialize)]
struct McpRequest {
    #[allow(dead_code)]
    #[serde(default)]
    jsonrpc: String,
    #[serde(default)]
    id: Value,
    #[serde(default)]
    method: String,
    #[serde(default)]
    params: Value,
}

#[derive(Debug, Serialize)]
struct McpResponse {
    jsonrpc: &'static str,
    id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<McpError>,
}

#[derive(Debug, Serialize)]
struct McpError {
    code: i32,
    message: String,
}

fn ok(id: Value, result: Value) -> McpResponse {
    McpResponse {
        jsonrpc: "2.0",
        id,
        result: Some(result),
        error: None,
    }
}

fn err(id: Value, code: i32, message: impl Into<String>) -> McpResponse {
    McpResponse {
        jsonrpc: "2.0",
        id,
        result: None,
        error: Some(McpError {
            code,
            message: message.into(),
        }),
    }
}

/// Handle one JSON-RPC request.
pub async fn handle(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> Response {
    let session_id = headers
        .get(SESSION_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();

    let req: McpRequest = match serde_json::from_str(&body) {
        Ok(req) => req,
        Err(_) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(err(Value::Null, -32700, "Parse error")),
            )
                .into_response();
        }
    };

    if req.method.is_empty() {
        return Json(err(req.id, -32600, "Invalid Request")).into_response();
    }

    if req.method == "initialize" {
        return handle_initialize(&state, session_id, req);
    }

    // Every other method needs an initialized session.
    if session_id.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(err(
                req.id,
                -32000,
                "Bad Request: No valid session ID provided",
            )),
        )
            .into_response();
    }

    let known = state
        .mcp_sessions
        .read()
        .expect("session lock poisoned")
        .contains_key(&session_id);
    if !known {
        return (
            StatusCode::BAD_REQUEST,
            Json(err(req.id, -32000, "Invalid session ID")),
        )
            .into_response();
    }

    match req.method.as_str() {
        "tools/list" => Json(ok(req.id, tools_list(&state))).into_response(),
        "tools/call" => handle_tools_call(&state, req).await,
        "ping" => Json(ok(req.id, json!({}))).into_response(),
        _ => Json(err(req.id, -32601, "Method not found")).into_response(),
    }
}

fn handle_initialize(state: &AppState, session_id: String, req: McpRequest) -> Response {
    let mut response_headers = HeaderMap::new();

    if session_id.is_empty() {
        let session_id = Uuid::new_v4().to_string();
        if let Ok(value) = session_id.parse() {
            response_headers.insert(SESSION_HEADER, value);
        }

        state
            .mcp_sessions
            .write()
            .expect("session lock poisoned")
            .insert(
                session_id.clone(),
                McpSession {
                    id: session_id,
                    created: chrono::Utc::now().timestamp(),
                },
            );
    }

    let result = json!({
        "protocolVersion": PROTOCOL_VERSION,
        "serverInfo": {
            "name": "research-helper-mcp",
            "version": env!("CARGO_PKG_VERSION"),
        },
        "capabilities": {
            "tools": {}
        }
    });

    (response_headers, Json(ok(req.id, result))).into_response()
}

fn tools_list(state: &AppState) -> Value {
    let tools: Vec<Value> = state
        .chat
        .tools()
        .tools()
        .iter()
        .map(|t| {
            json!({
                "name": t.name(),
                "description": t.description(),
                "inputSchema": t.parameters_schema(),
            })
        })
        .collect();

    json!({ "tools": tools })
}

async fn handle_tools_call(state: &AppState, req: McpRequest) -> Response {
    #[derive(Deserialize)]
    struct CallParams {
        name: String,
        #[serde(default)]
        arguments: Value,
    }

    let params: CallParams = match serde_json::from_value(req.params.clone()) {
        Ok(p) => p,
        Err(_) => return Json(err(req.id, -32602, "Invalid params")).into_response(),
    };

    let Some(tool) = state.chat.tools().find(&params.name) else {
        return Json(err(
            req.id,
            -32601,
            format!("Tool not found: {}", params.name),
        ))
        .into_response();
    };

    let arguments = if params.arguments.is_null() {
        json!({})
    } else {
        params.arguments
    };

    match tool.execute(arguments).await {
        Ok(text) => Json(ok(
            req.id,
            json!({
                "content": [{ "type": "text", "text": text }]
            }),
        ))
        .into_response(),
        Err(e) => Json(err(req.id, -32603, e.to_string())).into_response(),
    }
}
