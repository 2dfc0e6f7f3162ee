use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The OpenAI-shaped ingress body. Unknown fields are rejected so callers
/// get an early 400 instead of silently dropped parameters.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ChatCompletionRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub stream: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frequency_penalty: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub presence_penalty: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_format: Option<ResponseFormat>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_effort: Option<ReasoningEffort>,
}

impl ChatCompletionRequest {
    pub fn wants_json_object(&self) -> bool {
        matches!(
            self.response_format.as_ref(),
            Some(format) if format.kind == "json_object"
        )
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<MessageContent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Value>,
}

impl ChatMessage {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: Some(MessageContent::Text(text.into())),
            name: None,
            tool_call_id: None,
            tool_calls: None,
        }
    }

    pub fn system(text: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: Some(MessageContent::Text(text.into())),
            name: None,
            tool_call_id: None,
            tool_calls: None,
        }
    }

    /// All text in the message, parts joined by newlines. Image parts
    /// contribute nothing.
    pub fn text(&self) -> String {
        match self.content.as_ref() {
            Some(MessageContent::Text(text)) => text.clone(),
            Some(MessageContent::Parts(parts)) => {
                let mut out = String::new();
                for part in parts {
                    let Some(text) = part.text.as_deref() else {
                        continue;
                    };
                    if !out.is_empty() {
                        out.push('\n');
                    }
                    out.push_str(text);
                }
                out
            }
            None => String::new(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ContentPart {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<Value>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ResponseFormat {
    #[serde(rename = "type")]
    pub kind: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReasoningEffort {
    Low,
    Medium,
    High,
}

impl ReasoningEffort {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }
}

/// Canonical finish reasons. Unknown upstream values are carried through
/// lowercased so nothing is silently reshaped into `stop`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FinishReason {
    Stop,
    Length,
    ToolCalls,
    ContentFilter,
    Canceled,
    UpstreamError,
    GatewayError,
    Other(String),
}

impl FinishReason {
    pub fn from_upstream(raw: Option<&str>) -> Self {
        let Some(raw) = raw else {
            return Self::Stop;
        };
        match raw {
            "" | "stop" | "STOP" | "end_turn" => Self::Stop,
            "tool_use" | "tool_calls" => Self::ToolCalls,
            "length" | "MAX_TOKENS" => Self::Length,
            "content_filter" => Self::ContentFilter,
            "canceled" => Self::Canceled,
            "upstream_error" => Self::UpstreamError,
            "gateway_error" => Self::GatewayError,
            other => Self::Other(other.to_ascii_lowercase()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Stop => "stop",
            Self::Length => "length",
            Self::ToolCalls => "tool_calls",
            Self::ContentFilter => "content_filter",
            Self::Canceled => "canceled",
            Self::UpstreamError => "upstream_error",
            Self::GatewayError => "gateway_error",
            Self::Other(other) => other.as_str(),
        }
    }
}

/// Token counts as the upstream reported them. `None` means the upstream
/// did not say, which triggers estimation downstream.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TokenUsage {
    pub prompt_tokens: Option<u32>,
    pub completion_tokens: Option<u32>,
    pub total_tokens: Option<u32>,
    pub reasoning_tokens: Option<u32>,
    pub cached_tokens: Option<u32>,
}

impl TokenUsage {
    pub fn merge(&mut self, other: &TokenUsage) {
        if other.prompt_tokens.is_some() {
            self.prompt_tokens = other.prompt_tokens;
        }
        if other.completion_tokens.is_some() {
            self.completion_tokens = other.completion_tokens;
        }
        if other.total_tokens.is_some() {
            self.total_tokens = other.total_tokens;
        }
        if other.reasoning_tokens.is_some() {
            self.reasoning_tokens = other.reasoning_tokens;
        }
        if other.cached_tokens.is_some() {
            self.cached_tokens = other.cached_tokens;
        }
    }

    pub fn to_openai(&self) -> Value {
        let prompt = self.prompt_tokens.unwrap_or(0);
        let completion = self.completion_tokens.unwrap_or(0);
        let total = self
            .total_tokens
            .unwrap_or_else(|| prompt.saturating_add(completion));
        let mut usage = serde_json::Map::new();
        usage.insert("prompt_tokens".to_string(), prompt.into());
        usage.insert("completion_tokens".to_string(), completion.into());
        usage.insert("total_tokens".to_string(), total.into());
        if let Some(reasoning) = self.reasoning_tokens {
            usage.insert("reasoning_tokens".to_string(), reasoning.into());
        }
        if let Some(cached) = self.cached_tokens {
            usage.insert(
                "prompt_tokens_details".to_string(),
                serde_json::json!({ "cached_tokens": cached }),
            );
        }
        Value::Object(usage)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: String,
}

impl ToolCall {
    pub fn to_openai(&self, index: usize) -> Value {
        serde_json::json!({
            "index": index,
            "id": self.id,
            "type": "function",
            "function": { "name": self.name, "arguments": self.arguments },
        })
    }
}

/// What every provider family's response boils down to.
#[derive(Clone, Debug, Default)]
pub struct NormalizedResponse {
    pub content: String,
    pub reasoning_content: Option<String>,
    pub finish_reason: Option<FinishReason>,
    pub usage: TokenUsage,
    pub tool_calls: Vec<ToolCall>,
    /// Upstream completion id, reused when present.
    pub upstream_id: Option<String>,
    pub upstream_created: Option<u64>,
}

impl NormalizedResponse {
    /// Re-emit in OpenAI chat-completion shape. `id`/`created` are
    /// synthesized by the caller when the upstream omitted them.
    pub fn to_chat_completion(&self, id: &str, created: u64, model: &str) -> Value {
        let mut message = serde_json::Map::new();
        message.insert("role".to_string(), "assistant".into());
        message.insert("content".to_string(), self.content.clone().into());
        if let Some(reasoning) = self.reasoning_content.as_deref() {
            message.insert("reasoning_content".to_string(), reasoning.into());
        }
        if !self.tool_calls.is_empty() {
            let calls: Vec<Value> = self
                .tool_calls
                .iter()
                .enumerate()
                .map(|(index, call)| call.to_openai(index))
                .collect();
            message.insert("tool_calls".to_string(), Value::Array(calls));
        }

        let finish = self
            .finish_reason
            .as_ref()
            .map(FinishReason::as_str)
            .unwrap_or("stop");

        serde_json::json!({
            "id": id,
            "object": "chat.completion",
            "created": created,
            "model": model,
            "choices": [{
                "index": 0,
                "message": Value::Object(message),
                "finish_reason": finish,
            }],
            "usage": self.usage.to_openai(),
        })
    }
}

pub fn now_epoch_seconds() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

pub fn now_epoch_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Random 40-char lowercase alphanumeric slug, used for request ids and
/// synthetic completion ids.
pub fn random_slug() -> String {
    use rand::Rng;
    const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::thread_rng();
    (0..40)
        .map(|_| {
            let idx = rng.gen_range(0..ALPHABET.len());
            ALPHABET[idx] as char
        })
        .collect()
}
