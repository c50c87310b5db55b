//! Minimal MCP server on stdio
//!
//! Answers the handshake, `ping` and `tools/list`, and offers a few tools
//! that exercise a supervisor:
//!
//! - `echo`: returns its arguments unchanged
//! - `sleep`: waits `ms` milliseconds before answering
//! - `crash`: exits with `code` without answering
//! - `notify`: sends a `notifications/message` before answering

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Stdout};
use tokio::sync::Mutex;

use mcp_supervisor::protocol::{
    encode_line, CallToolParams, JsonRpcError, JsonRpcRequest, JsonRpcResponse, Method,
    INTERNAL_ERROR, INVALID_PARAMS, JSONRPC_VERSION, METHOD_NOT_FOUND, PARSE_ERROR,
    PROTOCOL_VERSION,
};

type SharedStdout = Arc<Mutex<Stdout>>;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let stdout: SharedStdout = Arc::new(Mutex::new(tokio::io::stdout()));
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let request: JsonRpcRequest = match serde_json::from_str(&line) {
            Ok(request) => request,
            Err(e) => {
                tracing::warn!("unparseable line: {}", e);
                let error = JsonRpcError::new(PARSE_ERROR, e.to_string());
                write(&stdout, &JsonRpcResponse::failure(Value::Null, error)).await?;
                continue;
            }
        };

        // Requests are answered concurrently so a slow tool never blocks the rest
        let stdout = stdout.clone();
        tokio::spawn(async move {
            if let Err(e) = handle(request, &stdout).await {
                tracing::error!("failed to answer request: {}", e);
            }
        });
    }
    Ok(())
}

async fn handle(request: JsonRpcRequest, stdout: &SharedStdout) -> Result<()> {
    let Some(id) = request.id else {
        tracing::debug!(method = %request.method, "notification");
        return Ok(());
    };
    let id = Value::from(id);

    let outcome = match Method::from_name(&request.method) {
        Some(Method::Initialize) => Ok(json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {"tools": {}},
            "serverInfo": {"name": "mcp-echo", "version": env!("CARGO_PKG_VERSION")},
        })),
        Some(Method::Ping) => Ok(json!({})),
        Some(Method::ToolsList) => Ok(json!({"tools": tool_list()})),
        Some(Method::ToolsCall) => call_tool(request.params, stdout).await,
        _ => Err(JsonRpcError::new(
            METHOD_NOT_FOUND,
            format!("Method not found: {}", request.method),
        )),
    };

    let response = match outcome {
        Ok(result) => JsonRpcResponse::success(id, result),
        Err(error) => JsonRpcResponse::failure(id, error),
    };
    write(stdout, &response).await
}

async fn call_tool(
    params: Option<Value>,
    stdout: &SharedStdout,
) -> std::result::Result<Value, JsonRpcError> {
    let params: CallToolParams = params
        .map(serde_json::from_value::<CallToolParams>)
        .transpose()
        .map_err(|e| JsonRpcError::new(INVALID_PARAMS, e.to_string()))?
        .ok_or_else(|| JsonRpcError::new(INVALID_PARAMS, "missing params"))?;
    let args = params.arguments;

    match params.name.as_str() {
        "echo" => Ok(text_result(args.to_string(), Some(args))),
        "sleep" => {
            let ms = args.get("ms").and_then(Value::as_u64).unwrap_or(1000);
            tokio::time::sleep(Duration::from_millis(ms)).await;
            Ok(text_result(format!("slept {}ms", ms), None))
        }
        "crash" => {
            let code = args.get("code").and_then(Value::as_i64).unwrap_or(1);
            std::process::exit(code as i32);
        }
        "notify" => {
            let message = args
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("hello")
                .to_string();
            let notification = json!({
                "jsonrpc": JSONRPC_VERSION,
                "method": "notifications/message",
                "params": {"level": "info", "data": message},
            });
            write(stdout, &notification)
                .await
                .map_err(|e| JsonRpcError::new(INTERNAL_ERROR, e.to_string()))?;
            Ok(text_result("notified".to_string(), None))
        }
        other => Err(JsonRpcError::new(
            INVALID_PARAMS,
            format!("Unknown tool: {}", other),
        )),
    }
}

fn text_result(text: String, structured: Option<Value>) -> Value {
    let mut result = json!({
        "content": [{"type": "text", "text": text}],
        "isError": false,
    });
    if let Some(structured) = structured {
        result["structuredContent"] = structured;
    }
    result
}

fn tool_list() -> Value {
    json!([
        {
            "name": "echo",
            "description": "Return the arguments unchanged",
            "inputSchema": {"type": "object"},
        },
        {
            "name": "sleep",
            "description": "Wait before answering",
            "inputSchema": {"type": "object", "properties": {"ms": {"type": "integer"}}},
        },
        {
            "name": "crash",
            "description": "Exit immediately without answering",
            "inputSchema": {"type": "object", "properties": {"code": {"type": "integer"}}},
        },
        {
            "name": "notify",
            "description": "Send a notification, then answer",
            "inputSchema": {"type": "object", "properties": {"message": {"type": "string"}}},
        },
    ])
}

async fn write<T: serde::Serialize>(stdout: &SharedStdout, message: &T) -> Result<()> {
    let line = encode_line(message)?;
    let mut stdout = stdout.lock().await;
    stdout.write_all(line.as_bytes()).await?;
    stdout.flush().await?;
    Ok(())
}
