//! The openai-shaped dialect: OpenAI itself plus DeepSeek, Perplexity,
//! Groq, Together, Inference.net, Alibaba, xAI, Moonshot, Meta, and custom
//! endpoints. Translation is pass-through with absent fields omitted.

use serde_json::{Map, Value};

use crate::error::{GatewayError, Result};
use crate::router::Route;
use crate::types::{
    ChatCompletionRequest, FinishReason, NormalizedResponse, TokenUsage, ToolCall,
};

pub fn translate(route: &Route, request: &ChatCompletionRequest) -> Value {
    let mut body = Map::<String, Value>::new();
    body.insert(
        "model".to_string(),
        Value::String(route.provider_model.clone()),
    );
    body.insert(
        "messages".to_string(),
        serde_json::to_value(&request.messages).unwrap_or(Value::Array(Vec::new())),
    );
    if request.stream {
        body.insert("stream".to_string(), Value::Bool(true));
    }
    if let Some(temperature) = request.temperature {
        insert_number(&mut body, "temperature", temperature);
    }
    if let Some(max_tokens) = request.max_tokens {
        body.insert("max_tokens".to_string(), max_tokens.into());
    }
    if let Some(top_p) = request.top_p {
        insert_number(&mut body, "top_p", top_p);
    }
    if let Some(frequency_penalty) = request.frequency_penalty {
        insert_number(&mut body, "frequency_penalty", frequency_penalty);
    }
    if let Some(presence_penalty) = request.presence_penalty {
        insert_number(&mut body, "presence_penalty", presence_penalty);
    }
    if let Some(format) = request.response_format.as_ref() {
        body.insert(
            "response_format".to_string(),
            serde_json::json!({ "type": format.kind }),
        );
    }
    if let Some(tools) = request.tools.as_ref() {
        body.insert("tools".to_string(), tools.clone());
    }
    if let Some(tool_choice) = request.tool_choice.as_ref() {
        body.insert("tool_choice".to_string(), tool_choice.clone());
    }
    if let Some(effort) = request.reasoning_effort {
        body.insert("reasoning_effort".to_string(), effort.as_str().into());
    }
    Value::Object(body)
}

fn insert_number(body: &mut Map<String, Value>, key: &str, value: f64) {
    if let Some(number) = serde_json::Number::from_f64(value) {
        body.insert(key.to_string(), Value::Number(number));
    }
}

pub fn parse_unary(body: &[u8]) -> Result<NormalizedResponse> {
    let value: Value = serde_json::from_slice(body)?;
    let choice = value
        .get("choices")
        .and_then(Value::as_array)
        .and_then(|choices| choices.first())
        .ok_or_else(|| {
            GatewayError::InvalidResponse("upstream response has no choices".to_string())
        })?;
    let message = choice.get("message").cloned().unwrap_or(Value::Null);

    let content = message
        .get("content")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let reasoning_content = message
        .get("reasoning_content")
        .and_then(Value::as_str)
        .filter(|text| !text.is_empty())
        .map(str::to_string);

    let tool_calls = message
        .get("tool_calls")
        .and_then(Value::as_array)
        .map(|calls| {
            calls
                .iter()
                .filter_map(|call| {
                    let function = call.get("function")?;
                    Some(ToolCall {
                        id: call
                            .get("id")
                            .and_then(Value::as_str)
                            .unwrap_or_default()
                            .to_string(),
                        name: function
                            .get("name")
                            .and_then(Value::as_str)
                            .unwrap_or_default()
                            .to_string(),
                        arguments: function
                            .get("arguments")
                            .and_then(Value::as_str)
                            .unwrap_or_default()
                            .to_string(),
                    })
                })
                .collect()
        })
        .unwrap_or_default();

    let finish_reason = choice
        .get("finish_reason")
        .and_then(Value::as_str)
        .map(|raw| FinishReason::from_upstream(Some(raw)));

    Ok(NormalizedResponse {
        content,
        reasoning_content,
        finish_reason,
        usage: extract_usage(value.get("usage")),
        tool_calls,
        upstream_id: value
            .get("id")
            .and_then(Value::as_str)
            .map(str::to_string),
        upstream_created: value.get("created").and_then(Value::as_u64),
    })
}

/// Usage in the openai wire shape, including the nested detail blocks.
pub fn extract_usage(usage: Option<&Value>) -> TokenUsage {
    let Some(usage) = usage else {
        return TokenUsage::default();
    };
    let field = |name: &str| usage.get(name).and_then(Value::as_u64).map(clamp_u32);
    TokenUsage {
        prompt_tokens: field("prompt_tokens"),
        completion_tokens: field("completion_tokens"),
        total_tokens: field("total_tokens"),
        reasoning_tokens: usage
            .get("completion_tokens_details")
            .and_then(|details| details.get("reasoning_tokens"))
            .and_then(Value::as_u64)
            .map(clamp_u32),
        cached_tokens: usage
            .get("prompt_tokens_details")
            .and_then(|details| details.get("cached_tokens"))
            .and_then(Value::as_u64)
            .map(clamp_u32),
    }
}

pub(crate) fn clamp_u32(value: u64) -> u32 {
    u32::try_from(value).unwrap_or(u32::MAX)
}
