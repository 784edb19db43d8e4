//! A small MCP server on stdio, for demos and for exercising the stdio transport
use clap::Parser;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;

const PROTOCOL_VERSION: &str = "2025-03-26";

#[derive(Parser, Debug)]
#[command(author, version, about = "Stub tool provider speaking MCP over stdio")]
struct Cli {
    /// Number of tools returned per tools/list page
    #[arg(long, default_value_t = 2)]
    page_size: usize,
}

#[derive(Deserialize)]
struct Incoming {
    id: Option<Value>,
    method: Option<String>,
    #[serde(default)]
    params: Value,
}

fn tools() -> Vec<Value> {
    vec![
        json!({
            "name": "get_coordinates",
            "description": "Get the current coordinates of the user",
            "inputSchema": {"type": "object", "properties": {}}
        }),
        json!({
            "name": "echo",
            "description": "Repeat the given text",
            "inputSchema": {
                "type": "object",
                "properties": {"text": {"type": "string"}},
                "required": ["text"]
            }
        }),
        json!({
            "name": "add",
            "description": "Add two numbers",
            "inputSchema": {
                "type": "object",
                "properties": {"a": {"type": "number"}, "b": {"type": "number"}},
                "required": ["a", "b"]
            }
        }),
        json!({
            "name": "sleep",
            "description": "Wait for the given number of milliseconds",
            "inputSchema": {
                "type": "object",
                "properties": {"ms": {"type": "integer"}},
                "required": ["ms"]
            }
        }),
        json!({
            "name": "fail",
            "description": "Always reports an error",
            "inputSchema": {"type": "object", "properties": {}}
        }),
    ]
}

fn text_result(text: String, is_error: bool) -> Value {
    json!({"content": [{"type": "text", "text": text}], "isError": is_error})
}

/// Run one tool, returning a `tools/call` result or a JSON-RPC error
async fn call_tool(name: &str, arguments: &Value) -> Result<Value, (i64, String)> {
    match name {
        "get_coordinates" => Ok(text_result(
            json!({"long": -122.4194, "lat": 37.7749}).to_string(),
            false,
        )),
        "echo" => {
            let text = arguments["text"]
                .as_str()
                .ok_or((-32602, "`text` must be a string".to_string()))?;
            Ok(text_result(text.to_string(), false))
        }
        "add" => match (arguments["a"].as_f64(), arguments["b"].as_f64()) {
            (Some(a), Some(b)) => Ok(text_result((a + b).to_string(), false)),
            _ => Err((-32602, "`a` and `b` must be numbers".to_string())),
        },
        "sleep" => {
            let ms = arguments["ms"].as_u64().unwrap_or(0);
            tokio::time::sleep(Duration::from_millis(ms)).await;
            Ok(text_result(format!("slept {}ms", ms), false))
        }
        "fail" => Ok(text_result("this tool always fails".to_string(), true)),
        other => Err((-32602, format!("Unknown tool: {}", other))),
    }
}

fn list_page(page_size: usize, cursor: Option<&str>) -> Result<Value, (i64, String)> {
    let all = tools();
    let start = match cursor {
        None | Some("") => 0,
        Some(cursor) => cursor
            .parse::<usize>()
            .map_err(|_| (-32602, format!("Invalid cursor: {}", cursor)))?,
    };
    let end = (start + page_size.max(1)).min(all.len());
    let page: Vec<Value> = all.get(start..end).map(<[Value]>::to_vec).unwrap_or_default();

    let mut result = json!({ "tools": page });
    if end < all.len() {
        result["nextCursor"] = json!(end.to_string());
    }
    Ok(result)
}

fn reply(id: Value, outcome: Result<Value, (i64, String)>) -> Value {
    match outcome {
        Ok(result) => json!({"jsonrpc": "2.0", "id": id, "result": result}),
        Err((code, message)) => {
            json!({"jsonrpc": "2.0", "id": id, "error": {"code": code, "message": message}})
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Value>();

    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(message) = out_rx.recv().await {
            let mut line = message.to_string();
            line.push('\n');
            if stdout.write_all(line.as_bytes()).await.is_err() || stdout.flush().await.is_err() {
                break;
            }
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let incoming: Incoming = match serde_json::from_str(&line) {
            Ok(incoming) => incoming,
            Err(e) => {
                eprintln!("ignoring malformed message: {}", e);
                continue;
            }
        };

        // Responses to our own requests and notifications need no answer
        let (id, method) = match (incoming.id, incoming.method) {
            (Some(id), Some(method)) => (id, method),
            (None, Some(method)) => {
                eprintln!("notification: {}", method);
                continue;
            }
            _ => continue,
        };

        match method.as_str() {
            "initialize" => {
                let _ = out_tx.send(reply(
                    id,
                    Ok(json!({
                        "protocolVersion": PROTOCOL_VERSION,
                        "capabilities": {"tools": {}, "logging": {}},
                        "serverInfo": {"name": "stub-system", "version": env!("CARGO_PKG_VERSION")}
                    })),
                ));
            }
            "ping" => {
                let _ = out_tx.send(reply(id, Ok(json!({}))));
            }
            "tools/list" => {
                let cursor = incoming.params["cursor"].as_str();
                let _ = out_tx.send(reply(id, list_page(cli.page_size, cursor)));
            }
            "tools/call" => {
                let out = out_tx.clone();
                let params = incoming.params;
                // Calls run concurrently so a slow tool does not hold up the others
                tokio::spawn(async move {
                    let name = params["name"].as_str().unwrap_or_default().to_string();
                    let _ = out.send(json!({
                        "jsonrpc": "2.0",
                        "method": "notifications/message",
                        "params": {"level": "info", "data": format!("calling {}", name)}
                    }));
                    let outcome = call_tool(&name, &params["arguments"]).await;
                    let _ = out.send(reply(id, outcome));
                });
            }
            other => {
                let _ = out_tx.send(reply(
                    id,
                    Err((-32601, format!("Method not found: {}", other))),
                ));
            }
        }
    }

    drop(out_tx);
    let _ = writer.await;
    Ok(())
}
