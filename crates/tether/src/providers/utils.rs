use anyhow::{anyhow, Result};
use lazy_static::lazy_static;
use regex::Regex;
use serde_json::{json, Value};

use super::base::Usage;
use crate::models::content::{Content, ImageContent};
use crate::models::message::{Message, MessageContent};
use crate::models::role::Role;
use crate::models::tool::{Tool, ToolCall};

/// Longest tool name the Messages API accepts
pub const MAX_FUNCTION_NAME_LEN: usize = 64;

lazy_static! {
    static ref INVALID_NAME_CHARS: Regex = Regex::new(r"[^a-zA-Z0-9_-]").unwrap();
}

/// Convert internal Message format to Anthropic's message specification
///
/// Placeholders are never sent, and messages left without content are dropped.
pub fn messages_to_anthropic_spec(messages: &[Message]) -> Vec<Value> {
    let mut messages_spec = Vec::new();

    for message in messages {
        let mut blocks = Vec::new();

        for content in &message.content {
            match content {
                MessageContent::Text(text) => {
                    if !text.text.is_empty() {
                        blocks.push(json!({"type": "text", "text": text.text}));
                    }
                }
                MessageContent::ToolRequest(request) => {
                    blocks.push(json!({
                        "type": "tool_use",
                        "id": request.id,
                        "name": request.tool_call.name,
                        "input": request.tool_call.arguments,
                    }));
                }
                MessageContent::ToolResponse(response) => match &response.tool_result {
                    Ok(contents) => {
                        let result: Vec<Value> = contents
                            .iter()
                            .map(|content| match content {
                                Content::Text(text) => json!({"type": "text", "text": text.text}),
                                Content::Image(image) => convert_image(image),
                            })
                            .collect();
                        blocks.push(json!({
                            "type": "tool_result",
                            "tool_use_id": response.id,
                            "content": result,
                            "is_error": false,
                        }));
                    }
                    Err(e) => {
                        // The model sees the error text so it can decide what to do next
                        blocks.push(json!({
                            "type": "tool_result",
                            "tool_use_id": response.id,
                            "content": [{"type": "text", "text": e.to_string()}],
                            "is_error": true,
                        }));
                    }
                },
                MessageContent::Pending => {}
            }
        }

        if !blocks.is_empty() {
            messages_spec.push(json!({
                "role": message.role,
                "content": blocks,
            }));
        }
    }

    messages_spec
}

pub fn convert_image(image: &ImageContent) -> Value {
    json!({
        "type": "image",
        "source": {
            "type": "base64",
            "media_type": image.mime_type,
            "data": image.data,
        }
    })
}

/// Convert internal Tool format to Anthropic's tool specification
pub fn tools_to_anthropic_spec(tools: &[Tool]) -> Result<Vec<Value>> {
    let mut tool_names = std::collections::HashSet::new();
    let mut result = Vec::new();

    for tool in tools {
        if !tool_names.insert(&tool.name) {
            return Err(anyhow!("Duplicate tool name: {}", tool.name));
        }

        result.push(json!({
            "name": tool.name,
            "description": tool.description,
            "input_schema": tool.input_schema,
        }));
    }

    Ok(result)
}

/// Convert Anthropic's API response to internal Message format
pub fn anthropic_response_to_message(response: &Value) -> Result<Message> {
    let blocks = response
        .get("content")
        .and_then(|c| c.as_array())
        .ok_or_else(|| anyhow!("Invalid response format from Anthropic API: missing content"))?;

    let mut content = Vec::new();
    for block in blocks {
        match block.get("type").and_then(|t| t.as_str()) {
            Some("text") => {
                let text = block.get("text").and_then(|t| t.as_str()).unwrap_or_default();
                content.push(MessageContent::text(text));
            }
            Some("tool_use") => {
                let id = block
                    .get("id")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| anyhow!("tool_use block without an id"))?;
                let name = block
                    .get("name")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default();
                let input = block.get("input").cloned().unwrap_or_else(|| json!({}));
                content.push(MessageContent::tool_request(id, ToolCall::new(name, input)));
            }
            other => {
                tracing::debug!(block_type = ?other, "skipping unsupported content block");
            }
        }
    }

    Ok(Message {
        role: Role::Assistant,
        created: chrono::Utc::now().timestamp(),
        content,
    })
}

pub fn get_usage(data: &Value) -> Usage {
    let usage = match data.get("usage") {
        Some(usage) => usage,
        None => return Usage::default(),
    };

    let input_tokens = usage
        .get("input_tokens")
        .and_then(|v| v.as_i64())
        .map(|v| v as i32);
    let output_tokens = usage
        .get("output_tokens")
        .and_then(|v| v.as_i64())
        .map(|v| v as i32);
    let total_tokens = match (input_tokens, output_tokens) {
        (Some(input), Some(output)) => Some(input + output),
        _ => None,
    };

    Usage::new(input_tokens, output_tokens, total_tokens)
}

/// Map an arbitrary tool name onto the character set and length the model accepts
pub fn sanitize_function_name(name: &str) -> String {
    let sanitized = INVALID_NAME_CHARS.replace_all(name, "_");
    let truncated: String = sanitized.chars().take(MAX_FUNCTION_NAME_LEN).collect();
    if truncated.is_empty() {
        "_".to_string()
    } else {
        truncated
    }
}
