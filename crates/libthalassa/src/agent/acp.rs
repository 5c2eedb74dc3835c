//! Agent Client Protocol: JSON-RPC 2.0 over newline-delimited JSON.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

pub const JSONRPC_VERSION: &str = "2.0";
pub const ACP_PROTOCOL_VERSION: u32 = 1;
pub const METHOD_NOT_FOUND: i64 = -32601;

pub const METHOD_INITIALIZE: &str = "initialize";
pub const METHOD_SESSION_NEW: &str = "session/new";
pub const METHOD_SESSION_PROMPT: &str = "session/prompt";
pub const METHOD_SESSION_UPDATE: &str = "session/update";

/// Prefix for agent payloads none of the known reply shapes matched.
pub const UNRECOGNIZED_MARKER: &str = "[unrecognized agent payload]";

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct RpcRequest {
    pub jsonrpc: String,
    pub id: u64,
    pub method: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub params: Value,
}

impl RpcRequest {
    pub fn new(id: u64, method: impl Into<String>, params: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            method: method.into(),
            params,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// One decoded line from the agent.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Response {
        id: u64,
        result: Result<Value, RpcError>,
    },
    Notification {
        method: String,
        params: Value,
    },
    /// Agent-initiated call; `id` is echoed back verbatim.
    Request {
        id: Value,
        method: String,
        params: Value,
    },
    Unrecognized(Value),
}

pub fn decode_line(line: &str) -> Result<Inbound, serde_json::Error> {
    let mut value: Value = serde_json::from_str(line)?;
    let Some(obj) = value.as_object_mut() else {
        return Ok(Inbound::Unrecognized(value));
    };

    if let Some(method) = obj.get("method").and_then(Value::as_str).map(str::to_string) {
        let params = obj.remove("params").unwrap_or(Value::Null);
        return Ok(match obj.remove("id") {
            Some(id) if !id.is_null() => Inbound::Request { id, method, params },
            _ => Inbound::Notification { method, params },
        });
    }

    let id = obj.get("id").and_then(Value::as_u64);
    if let Some(id) = id {
        if let Some(error) = obj.get("error") {
            let error = serde_json::from_value::<RpcError>(error.clone()).unwrap_or(RpcError {
                code: error.get("code").and_then(Value::as_i64).unwrap_or(0),
                message: error.to_string(),
                data: None,
            });
            return Ok(Inbound::Response {
                id,
                result: Err(error),
            });
        }
        if obj.contains_key("result") {
            let result = obj.remove("result").unwrap_or(Value::Null);
            return Ok(Inbound::Response {
                id,
                result: Ok(result),
            });
        }
    }
    Ok(Inbound::Unrecognized(value))
}

pub fn initialize_params(client_version: &str) -> Value {
    json!({
        "protocolVersion": ACP_PROTOCOL_VERSION,
        "clientCapabilities": {
            "fs": { "readTextFile": true, "writeTextFile": true },
            "terminal": true
        },
        "clientInfo": { "name": "thalassa", "version": client_version }
    })
}

pub fn session_new_params(cwd: &str) -> Value {
    json!({ "cwd": cwd, "mcpServers": [] })
}

pub fn session_prompt_params(session_id: &str, text: &str) -> Value {
    json!({
        "sessionId": session_id,
        "prompt": [{ "type": "text", "text": text }]
    })
}

/// Reply sent for agent-initiated calls we do not serve.
pub fn method_not_found(id: Value, method: &str) -> Value {
    json!({
        "jsonrpc": JSONRPC_VERSION,
        "id": id,
        "error": { "code": METHOD_NOT_FOUND, "message": format!("method not found: {method}") }
    })
}

/// `session/new` answers either `{"sessionId": ..}` or a bare string.
pub fn parse_session_id(result: &Value) -> Option<String> {
    result
        .get("sessionId")
        .and_then(Value::as_str)
        .or_else(|| result.as_str())
        .map(str::to_string)
}

/// Text of an `agent_message_chunk` session update, if that is what `params` holds.
pub fn message_chunk(params: &Value) -> Option<&str> {
    let update = params.get("update")?;
    if update.get("sessionUpdate").and_then(Value::as_str) != Some("agent_message_chunk") {
        return None;
    }
    update.get("content")?.get("text")?.as_str()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Extracted {
    Text(String),
    /// A completed turn that carried no text of its own.
    Empty,
    /// Nothing matched; marked raw JSON.
    Raw(String),
}

impl Extracted {
    pub fn into_text(self) -> String {
        match self {
            Extracted::Text(text) | Extracted::Raw(text) => text,
            Extracted::Empty => String::new(),
        }
    }
}

/// Pull reply text out of the payload shapes agents are known to produce.
pub fn extract_reply_text(payload: &Value) -> Extracted {
    if let Some(text) = payload.get("content").and_then(text_from_blocks) {
        return Extracted::Text(text);
    }
    if let Some(content) = payload.get("message").and_then(|m| m.get("content")) {
        if let Some(text) = content.as_str() {
            return Extracted::Text(text.to_string());
        }
        if let Some(text) = text_from_blocks(content) {
            return Extracted::Text(text);
        }
    }
    for key in ["text", "output"] {
        if let Some(text) = payload.get(key).and_then(Value::as_str) {
            return Extracted::Text(text.to_string());
        }
    }
    if let Some(text) = payload.as_str() {
        return Extracted::Text(text.to_string());
    }
    if let Some(obj) = payload.as_object()
        && obj.contains_key("stopReason")
        && obj.keys().all(|k| k == "stopReason" || k == "_meta")
    {
        return Extracted::Empty;
    }
    Extracted::Raw(format!("{UNRECOGNIZED_MARKER} {payload}"))
}

fn text_from_blocks(content: &Value) -> Option<String> {
    let blocks = content.as_array()?;
    let texts: Vec<&str> = blocks
        .iter()
        .filter_map(|block| block.get("text").and_then(Value::as_str))
        .collect();
    if texts.is_empty() {
        None
    } else {
        Some(texts.concat())
    }
}
