//! The Anthropic Messages dialect: system messages lift into a top-level
//! `system` field, tools map to `input_schema` declarations, and
//! `max_tokens` is mandatory.

use serde_json::{Map, Value};

use crate::error::{GatewayError, Result};
use crate::router::Route;
use crate::types::{
    ChatCompletionRequest, ChatMessage, FinishReason, NormalizedResponse, TokenUsage, ToolCall,
};

use super::openai_compatible::clamp_u32;

const DEFAULT_MAX_TOKENS: u32 = 4_096;

pub fn translate(route: &Route, request: &ChatCompletionRequest) -> Value {
    let mut system = Vec::<String>::new();
    let mut saw_non_system = false;
    let mut messages = Vec::<Value>::new();

    for message in &request.messages {
        if message.role == "system" && !saw_non_system {
            let text = message.text();
            if !text.is_empty() {
                system.push(text);
            }
            continue;
        }
        saw_non_system = true;
        messages.push(convert_message(message));
    }

    let max_tokens = request
        .max_tokens
        .or_else(|| route.mapping.as_ref().map(|mapping| mapping.max_output))
        .unwrap_or(DEFAULT_MAX_TOKENS);

    let mut body = Map::<String, Value>::new();
    body.insert(
        "model".to_string(),
        Value::String(route.provider_model.clone()),
    );
    body.insert("messages".to_string(), Value::Array(messages));
    body.insert("max_tokens".to_string(), max_tokens.into());
    if request.stream {
        body.insert("stream".to_string(), Value::Bool(true));
    }
    if !system.is_empty() {
        body.insert("system".to_string(), Value::String(system.join("\n\n")));
    }
    if let Some(temperature) = request.temperature {
        if let Some(number) = serde_json::Number::from_f64(temperature) {
            body.insert("temperature".to_string(), Value::Number(number));
        }
    }
    if let Some(top_p) = request.top_p {
        if let Some(number) = serde_json::Number::from_f64(top_p) {
            body.insert("top_p".to_string(), Value::Number(number));
        }
    }
    if let Some(tools) = request.tools.as_ref().and_then(Value::as_array) {
        let mapped: Vec<Value> = tools.iter().filter_map(convert_tool).collect();
        if !mapped.is_empty() {
            body.insert("tools".to_string(), Value::Array(mapped));
        }
    }
    if let Some(choice) = request.tool_choice.as_ref() {
        match convert_tool_choice(choice) {
            ToolChoiceMapping::Mapped(mapped) => {
                body.insert("tool_choice".to_string(), mapped);
            }
            ToolChoiceMapping::DropTools => {
                body.remove("tools");
            }
            ToolChoiceMapping::Skip => {}
        }
    }

    Value::Object(body)
}

fn convert_message(message: &ChatMessage) -> Value {
    // Tool results arrive with role "tool"; Anthropic wants them as user
    // content blocks referencing the originating call.
    if message.role == "tool" {
        return serde_json::json!({
            "role": "user",
            "content": [{
                "type": "tool_result",
                "tool_use_id": message.tool_call_id.clone().unwrap_or_default(),
                "content": message.text(),
            }],
        });
    }

    let role = if message.role == "assistant" {
        "assistant"
    } else {
        "user"
    };

    let mut blocks = Vec::<Value>::new();
    let text = message.text();
    if !text.is_empty() {
        blocks.push(serde_json::json!({ "type": "text", "text": text }));
    }
    if let Some(calls) = message.tool_calls.as_ref().and_then(Value::as_array) {
        for call in calls {
            let Some(function) = call.get("function") else {
                continue;
            };
            let arguments = function
                .get("arguments")
                .and_then(Value::as_str)
                .and_then(|raw| serde_json::from_str::<Value>(raw).ok())
                .unwrap_or_else(|| serde_json::json!({}));
            blocks.push(serde_json::json!({
                "type": "tool_use",
                "id": call.get("id").cloned().unwrap_or(Value::Null),
                "name": function.get("name").cloned().unwrap_or(Value::Null),
                "input": arguments,
            }));
        }
    }

    serde_json::json!({ "role": role, "content": blocks })
}

fn convert_tool(tool: &Value) -> Option<Value> {
    let function = tool.get("function")?;
    let name = function.get("name").and_then(Value::as_str)?;
    let mut mapped = Map::<String, Value>::new();
    mapped.insert("name".to_string(), name.into());
    if let Some(description) = function.get("description").and_then(Value::as_str) {
        mapped.insert("description".to_string(), description.into());
    }
    mapped.insert(
        "input_schema".to_string(),
        function
            .get("parameters")
            .cloned()
            .unwrap_or_else(|| serde_json::json!({ "type": "object" })),
    );
    Some(Value::Object(mapped))
}

enum ToolChoiceMapping {
    Mapped(Value),
    DropTools,
    Skip,
}

fn convert_tool_choice(choice: &Value) -> ToolChoiceMapping {
    match choice {
        Value::String(tag) => match tag.as_str() {
            "auto" => ToolChoiceMapping::Mapped(serde_json::json!({ "type": "auto" })),
            "required" => ToolChoiceMapping::Mapped(serde_json::json!({ "type": "any" })),
            "none" => ToolChoiceMapping::DropTools,
            _ => ToolChoiceMapping::Skip,
        },
        Value::Object(_) => {
            let Some(name) = choice
                .get("function")
                .and_then(|function| function.get("name"))
                .and_then(Value::as_str)
            else {
                return ToolChoiceMapping::Skip;
            };
            ToolChoiceMapping::Mapped(serde_json::json!({ "type": "tool", "name": name }))
        }
        _ => ToolChoiceMapping::Skip,
    }
}

pub fn parse_unary(body: &[u8]) -> Result<NormalizedResponse> {
    let value: Value = serde_json::from_slice(body)?;
    let blocks = value
        .get("content")
        .and_then(Value::as_array)
        .ok_or_else(|| {
            GatewayError::InvalidResponse("anthropic response has no content blocks".to_string())
        })?;

    let mut content = String::new();
    let mut reasoning = String::new();
    let mut tool_calls = Vec::<ToolCall>::new();
    for block in blocks {
        let Some(kind) = block.get("type").and_then(Value::as_str) else {
            continue;
        };
        match kind {
            "text" => {
                if let Some(text) = block.get("text").and_then(Value::as_str) {
                    content.push_str(text);
                }
            }
            "thinking" => {
                if let Some(text) = block.get("thinking").and_then(Value::as_str) {
                    reasoning.push_str(text);
                }
            }
            "tool_use" => {
                tool_calls.push(ToolCall {
                    id: block
                        .get("id")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    name: block
                        .get("name")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    arguments: block
                        .get("input")
                        .map(|input| input.to_string())
                        .unwrap_or_default(),
                });
            }
            _ => {}
        }
    }

    let finish_reason = value
        .get("stop_reason")
        .and_then(Value::as_str)
        .map(|raw| FinishReason::from_upstream(Some(raw)));

    Ok(NormalizedResponse {
        content,
        reasoning_content: (!reasoning.is_empty()).then_some(reasoning),
        finish_reason,
        usage: extract_usage(value.get("usage")),
        tool_calls,
        upstream_id: value
            .get("id")
            .and_then(Value::as_str)
            .map(str::to_string),
        upstream_created: None,
    })
}

pub fn extract_usage(usage: Option<&Value>) -> TokenUsage {
    let Some(usage) = usage else {
        return TokenUsage::default();
    };
    let field = |name: &str| usage.get(name).and_then(Value::as_u64).map(clamp_u32);
    TokenUsage {
        prompt_tokens: field("input_tokens"),
        completion_tokens: field("output_tokens"),
        total_tokens: None,
        reasoning_tokens: None,
        cached_tokens: field("cache_read_input_tokens"),
    }
}
