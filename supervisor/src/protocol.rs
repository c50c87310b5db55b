//! JSON-RPC 2.0 wire types for the stdio transport
//!
//! One JSON object per line. Outgoing requests carry integer ids; incoming
//! lines are classified into responses, notifications and server-initiated
//! requests before any correlation happens.
//!
//! Supported methods form a closed set ([`Method`]) so a typo in a method
//! name is a compile error rather than a runtime `Method not found`.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// JSON-RPC version string carried by every message
pub const JSONRPC_VERSION: &str = "2.0";

/// MCP protocol revision sent in the initialize request
pub const PROTOCOL_VERSION: &str = "2024-11-05";

/// Standard JSON-RPC error codes
pub const PARSE_ERROR: i64 = -32700;
pub const INVALID_REQUEST: i64 = -32600;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;
pub const INTERNAL_ERROR: i64 = -32603;

// ============================================================================
// Methods
// ============================================================================

/// Methods the supervisor speaks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Initialize,
    Initialized,
    Ping,
    ToolsList,
    ToolsCall,
}

/// Static description of a method: wire name and whether a response follows
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MethodSpec {
    pub name: &'static str,
    pub expects_response: bool,
}

impl Method {
    /// Every supported method, in declaration order
    pub const ALL: [Method; 5] = [
        Method::Initialize,
        Method::Initialized,
        Method::Ping,
        Method::ToolsList,
        Method::ToolsCall,
    ];

    pub const fn spec(self) -> MethodSpec {
        match self {
            Method::Initialize => MethodSpec {
                name: "initialize",
                expects_response: true,
            },
            Method::Initialized => MethodSpec {
                name: "notifications/initialized",
                expects_response: false,
            },
            Method::Ping => MethodSpec {
                name: "ping",
                expects_response: true,
            },
            Method::ToolsList => MethodSpec {
                name: "tools/list",
                expects_response: true,
            },
            Method::ToolsCall => MethodSpec {
                name: "tools/call",
                expects_response: true,
            },
        }
    }

    pub const fn as_str(self) -> &'static str {
        self.spec().name
    }

    pub const fn expects_response(self) -> bool {
        self.spec().expects_response
    }

    /// Reverse lookup from a wire name
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|m| m.as_str() == name)
    }
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Messages
// ============================================================================

/// Outgoing request (or, without an id, a notification)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    pub fn new(id: u64, method: Method, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: Some(id),
            method: method.as_str().to_string(),
            params,
        }
    }

    pub fn notification(method: Method, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: None,
            method: method.as_str().to_string(),
            params,
        }
    }
}

/// Error object inside a response
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl JsonRpcError {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }
}

/// Response as written on the wire
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    pub id: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    pub fn success(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(id: Value, error: JsonRpcError) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: None,
            error: Some(error),
        }
    }
}

/// Why an incoming line could not be used
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("malformed message: {0}")]
    Malformed(&'static str),
}

/// A classified incoming line
#[derive(Debug, Clone, PartialEq)]
pub enum IncomingMessage {
    /// Answer to one of our requests
    Response {
        id: Value,
        outcome: std::result::Result<Value, JsonRpcError>,
    },
    /// Fire-and-forget message from the server
    Notification {
        method: String,
        params: Option<Value>,
    },
    /// Request initiated by the server
    Request {
        id: Value,
        method: String,
        params: Option<Value>,
    },
}

impl IncomingMessage {
    /// Parse and classify one line of output
    pub fn parse(line: &str) -> std::result::Result<Self, FrameError> {
        let value: Value = serde_json::from_str(line)?;
        let obj = value
            .as_object()
            .ok_or(FrameError::Malformed("not a JSON object"))?;
        Self::classify(obj)
    }

    fn classify(obj: &Map<String, Value>) -> std::result::Result<Self, FrameError> {
        let id = obj.get("id").filter(|id| !id.is_null()).cloned();

        if let Some(method) = obj.get("method") {
            let method = method
                .as_str()
                .ok_or(FrameError::Malformed("method is not a string"))?
                .to_string();
            let params = obj.get("params").cloned();
            return Ok(match id {
                Some(id) => IncomingMessage::Request { id, method, params },
                None => IncomingMessage::Notification { method, params },
            });
        }

        let id = id.ok_or(FrameError::Malformed("response without id"))?;

        if let Some(error) = obj.get("error") {
            let error: JsonRpcError = serde_json::from_value(error.clone())?;
            return Ok(IncomingMessage::Response {
                id,
                outcome: Err(error),
            });
        }

        match obj.get("result") {
            Some(result) => Ok(IncomingMessage::Response {
                id,
                outcome: Ok(result.clone()),
            }),
            None => Err(FrameError::Malformed("response without result or error")),
        }
    }
}

/// Serialize a message as one newline-terminated frame
pub fn encode_line<T: Serialize>(message: &T) -> serde_json::Result<String> {
    let mut line = serde_json::to_string(message)?;
    line.push('\n');
    Ok(line)
}

// ============================================================================
// MCP payloads
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClientInfo {
    pub name: String,
    pub version: String,
}

/// Params of the `initialize` request
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InitializeParams {
    pub protocol_version: String,
    pub capabilities: Value,
    pub client_info: ClientInfo,
}

impl InitializeParams {
    /// Params identifying this crate as the client
    pub fn for_this_client() -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION.to_string(),
            capabilities: Value::Object(Map::new()),
            client_info: ClientInfo {
                name: env!("CARGO_PKG_NAME").to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
            },
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ServerInfo {
    pub name: String,
    #[serde(default)]
    pub version: Option<String>,
}

/// Result of the `initialize` request
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InitializeResult {
    #[serde(default)]
    pub protocol_version: Option<String>,
    #[serde(default)]
    pub capabilities: Value,
    #[serde(default)]
    pub server_info: Option<ServerInfo>,
}

/// Params of `tools/call`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CallToolParams {
    pub name: String,
    #[serde(default)]
    pub arguments: Value,
}
