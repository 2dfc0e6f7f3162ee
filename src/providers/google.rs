//! The Google generateContent dialect: messages convert to
//! `contents`/`parts`, system text to `system_instruction`, generation
//! parameters to `generationConfig`, and streaming switches the URL verb
//! instead of a body flag.

use serde_json::{Map, Value};

use crate::error::{GatewayError, Result};
use crate::router::Route;
use crate::types::{
    ChatCompletionRequest, ChatMessage, FinishReason, NormalizedResponse, TokenUsage, ToolCall,
};

use super::openai_compatible::clamp_u32;

/// The model rides in the URL, so the body never names it.
pub fn translate(_route: &Route, request: &ChatCompletionRequest) -> Value {
    let mut system = Vec::<String>::new();
    let mut contents = Vec::<Value>::new();

    for message in &request.messages {
        if message.role == "system" {
            let text = message.text();
            if !text.is_empty() {
                system.push(text);
            }
            continue;
        }
        contents.push(convert_message(message));
    }

    let mut body = Map::<String, Value>::new();
    body.insert("contents".to_string(), Value::Array(contents));
    if !system.is_empty() {
        body.insert(
            "system_instruction".to_string(),
            serde_json::json!({ "parts": [{ "text": system.join("\n\n") }] }),
        );
    }

    let mut generation = Map::<String, Value>::new();
    if let Some(temperature) = request.temperature {
        if let Some(number) = serde_json::Number::from_f64(temperature) {
            generation.insert("temperature".to_string(), Value::Number(number));
        }
    }
    if let Some(top_p) = request.top_p {
        if let Some(number) = serde_json::Number::from_f64(top_p) {
            generation.insert("topP".to_string(), Value::Number(number));
        }
    }
    if let Some(max_tokens) = request.max_tokens {
        generation.insert("maxOutputTokens".to_string(), max_tokens.into());
    }
    if request.wants_json_object() {
        generation.insert(
            "responseMimeType".to_string(),
            "application/json".into(),
        );
    }
    if !generation.is_empty() {
        body.insert("generationConfig".to_string(), Value::Object(generation));
    }

    if let Some(tools) = request.tools.as_ref().and_then(Value::as_array) {
        let declarations: Vec<Value> = tools
            .iter()
            .filter_map(|tool| {
                let function = tool.get("function")?;
                let mut declaration = Map::<String, Value>::new();
                declaration.insert(
                    "name".to_string(),
                    function.get("name").cloned().unwrap_or(Value::Null),
                );
                if let Some(description) = function.get("description") {
                    declaration.insert("description".to_string(), description.clone());
                }
                if let Some(parameters) = function.get("parameters") {
                    declaration.insert("parameters".to_string(), parameters.clone());
                }
                Some(Value::Object(declaration))
            })
            .collect();
        if !declarations.is_empty() {
            body.insert(
                "tools".to_string(),
                serde_json::json!([{ "functionDeclarations": declarations }]),
            );
        }
    }

    Value::Object(body)
}

fn convert_message(message: &ChatMessage) -> Value {
    // Tool results travel back as functionResponse parts under the user
    // role; google has no dedicated tool role.
    if message.role == "tool" {
        return serde_json::json!({
            "role": "user",
            "parts": [{
                "functionResponse": {
                    "name": message.tool_call_id.clone().unwrap_or_default(),
                    "response": { "content": message.text() },
                }
            }],
        });
    }

    let role = if message.role == "assistant" {
        "model"
    } else {
        "user"
    };

    let mut parts = Vec::<Value>::new();
    let text = message.text();
    if !text.is_empty() {
        parts.push(serde_json::json!({ "text": text }));
    }
    if let Some(calls) = message.tool_calls.as_ref().and_then(Value::as_array) {
        for call in calls {
            let Some(function) = call.get("function") else {
                continue;
            };
            let args = function
                .get("arguments")
                .and_then(Value::as_str)
                .and_then(|raw| serde_json::from_str::<Value>(raw).ok())
                .unwrap_or_else(|| serde_json::json!({}));
            parts.push(serde_json::json!({
                "functionCall": {
                    "name": function.get("name").cloned().unwrap_or(Value::Null),
                    "args": args,
                }
            }));
        }
    }

    serde_json::json!({ "role": role, "parts": parts })
}

pub fn parse_unary(body: &[u8]) -> Result<NormalizedResponse> {
    let value: Value = serde_json::from_slice(body)?;
    let candidate = value
        .get("candidates")
        .and_then(Value::as_array)
        .and_then(|candidates| candidates.first())
        .ok_or_else(|| {
            GatewayError::InvalidResponse("google response has no candidates".to_string())
        })?;

    let mut response = parse_candidate(candidate);
    response.usage = extract_usage(value.get("usageMetadata"));
    Ok(response)
}

/// Shared with the streaming scanner: one candidate object to normalized
/// fields, usage excluded.
pub fn parse_candidate(candidate: &Value) -> NormalizedResponse {
    let mut content = String::new();
    let mut reasoning = String::new();
    let mut tool_calls = Vec::<ToolCall>::new();

    if let Some(parts) = candidate
        .get("content")
        .and_then(|value| value.get("parts"))
        .and_then(Value::as_array)
    {
        for part in parts {
            if let Some(text) = part.get("text").and_then(Value::as_str) {
                if part.get("thought").and_then(Value::as_bool) == Some(true) {
                    reasoning.push_str(text);
                } else {
                    content.push_str(text);
                }
                continue;
            }
            if let Some(call) = part.get("functionCall") {
                tool_calls.push(ToolCall {
                    id: format!("call_{}", tool_calls.len()),
                    name: call
                        .get("name")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    arguments: call
                        .get("args")
                        .map(|args| args.to_string())
                        .unwrap_or_else(|| "{}".to_string()),
                });
            }
        }
    }

    let finish_reason = candidate
        .get("finishReason")
        .and_then(Value::as_str)
        .map(|raw| FinishReason::from_upstream(Some(raw)));

    NormalizedResponse {
        content,
        reasoning_content: (!reasoning.is_empty()).then_some(reasoning),
        finish_reason,
        usage: TokenUsage::default(),
        tool_calls,
        upstream_id: None,
        upstream_created: None,
    }
}

pub fn extract_usage(metadata: Option<&Value>) -> TokenUsage {
    let Some(metadata) = metadata else {
        return TokenUsage::default();
    };
    let field = |name: &str| metadata.get(name).and_then(Value::as_u64).map(clamp_u32);
    TokenUsage {
        prompt_tokens: field("promptTokenCount"),
        completion_tokens: field("candidatesTokenCount"),
        total_tokens: field("totalTokenCount"),
        reasoning_tokens: field("thoughtsTokenCount"),
        cached_tokens: field("cachedContentTokenCount"),
    }
}
