//! Tools command handlers
//!
//! List a process's tools and call tools directly.

use anyhow::{Context, Result};
use serde_json::Value;

use super::CommandContext;

/// Handle the `tools` command
pub async fn run_tools(ctx: &CommandContext, name: &str) -> Result<()> {
    let response = ctx.client().list_tools(name).await?;
    if !response.success {
        anyhow::bail!("{}", response.error.unwrap_or_default());
    }

    let tools = response
        .result
        .as_ref()
        .and_then(|r| r.get("tools"))
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    if tools.is_empty() {
        println!("No tools found.");
        return Ok(());
    }

    println!("=== {} ({} tools) ===", name, tools.len());
    for tool in &tools {
        let tool_name = tool.get("name").and_then(Value::as_str).unwrap_or("?");
        let desc = tool
            .get("description")
            .and_then(Value::as_str)
            .unwrap_or("No description")
            .lines()
            .next()
            .unwrap_or("");
        println!("  {} - {}", tool_name, desc);
    }
    Ok(())
}

/// Handle the `call` command
pub async fn run_call_tool(
    ctx: &CommandContext,
    name: &str,
    tool: &str,
    args: Option<String>,
) -> Result<()> {
    let arguments = match args {
        Some(json) => serde_json::from_str(&json).context("--args is not valid JSON")?,
        None => Value::Object(Default::default()),
    };

    let response = ctx.client().call_tool(name, tool, arguments).await?;
    if !response.success {
        anyhow::bail!(
            "{} on '{}' failed: {}",
            tool,
            name,
            response.error.unwrap_or_default()
        );
    }

    let result = response.result.unwrap_or(Value::Null);
    match result.get("content").and_then(Value::as_array) {
        Some(content) => {
            for item in content {
                match item.get("text").and_then(Value::as_str) {
                    Some(text) => println!("{}", text),
                    None => println!("{}", item),
                }
            }
        }
        None => println!("{}", serde_json::to_string_pretty(&result)?),
    }
    Ok(())
}
