//! Streaming response normalization: per-family pull-parsers fed by raw
//! upstream body chunks, emitting OpenAI `chat.completion.chunk` values
//! and accumulating everything the log row needs.

use bytes::BytesMut;
use serde_json::{Map, Value};

use crate::catalog::Family;
use crate::providers::{anthropic, google, openai_compatible};
use crate::sse::SseFramer;
use crate::token_count;
use crate::types::{ChatMessage, FinishReason, TokenUsage, ToolCall};

/// Identity stamped onto every normalized chunk.
#[derive(Clone, Debug)]
pub struct ChunkContext {
    pub id: String,
    pub created: u64,
    pub model: String,
}

/// Everything accumulated over a stream, for caching, cost, and the log.
#[derive(Clone, Debug, Default)]
pub struct StreamSummary {
    pub content: String,
    pub reasoning: String,
    pub tool_calls: Vec<ToolCall>,
    pub usage: TokenUsage,
    pub finish_reason: Option<FinishReason>,
}

/// A pull-parser over one upstream stream. `feed` returns the normalized
/// chunks ready for the client; `summary` is read once at EOF.
pub trait StreamParser: Send {
    fn feed(&mut self, chunk: &[u8]) -> Vec<Value>;
    fn summary(&mut self) -> StreamSummary;
}

pub fn parser_for(family: Family, ctx: ChunkContext, buffer_cap: usize) -> Box<dyn StreamParser> {
    match family {
        Family::OpenAi | Family::Mistral => Box::new(OpenAiStreamParser::new(ctx)),
        Family::Anthropic => Box::new(AnthropicStreamParser::new(ctx)),
        Family::Google => Box::new(GoogleStreamParser::new(ctx, buffer_cap)),
    }
}

fn make_chunk(ctx: &ChunkContext, delta: Map<String, Value>, finish: Option<&str>) -> Value {
    let mut delta = delta;
    delta.insert("role".to_string(), "assistant".into());
    serde_json::json!({
        "id": ctx.id,
        "object": "chat.completion.chunk",
        "created": ctx.created,
        "model": ctx.model,
        "choices": [{
            "index": 0,
            "delta": Value::Object(delta),
            "finish_reason": finish.map(Value::from).unwrap_or(Value::Null),
        }],
    })
}

/// The final usage-bearing chunk sent ahead of `[DONE]`.
pub fn usage_chunk(ctx: &ChunkContext, usage: &TokenUsage) -> Value {
    serde_json::json!({
        "id": ctx.id,
        "object": "chat.completion.chunk",
        "created": ctx.created,
        "model": ctx.model,
        "choices": [],
        "usage": usage.to_openai(),
    })
}

/// Fill in token counts the upstream never delivered. Prompt tokens come
/// from the request messages, completion tokens from the concatenated
/// assistant text. Returns whether anything was imputed.
pub fn finalize_usage(
    usage: &mut TokenUsage,
    messages: &[ChatMessage],
    assistant_text: &str,
) -> bool {
    let mut imputed = false;
    if usage.prompt_tokens.is_none() {
        usage.prompt_tokens = Some(token_count::count_chat(messages));
        imputed = true;
    }
    if usage.completion_tokens.is_none() {
        usage.completion_tokens = Some(token_count::count_text(assistant_text));
        imputed = true;
    }
    if usage.total_tokens.is_none() {
        usage.total_tokens = Some(
            usage
                .prompt_tokens
                .unwrap_or(0)
                .saturating_add(usage.completion_tokens.unwrap_or(0)),
        );
    }
    imputed
}

#[derive(Debug, Default)]
struct ToolCallAccumulator {
    calls: Vec<ToolCall>,
}

impl ToolCallAccumulator {
    /// Indexed fill for the openai dialect: concatenate arguments, adopt
    /// id/name when they first appear.
    fn apply_indexed(&mut self, index: usize, id: Option<&str>, name: Option<&str>, args: &str) {
        while self.calls.len() <= index {
            self.calls.push(ToolCall::default());
        }
        let call = &mut self.calls[index];
        if let Some(id) = id {
            if call.id.is_empty() {
                call.id = id.to_string();
            }
        }
        if let Some(name) = name {
            if call.name.is_empty() {
                call.name = name.to_string();
            }
        }
        call.arguments.push_str(args);
    }

    /// Anthropic dialect: a block start opens a new call, deltas extend
    /// the most recent one.
    fn start(&mut self, id: &str, name: &str) -> usize {
        self.calls.push(ToolCall {
            id: id.to_string(),
            name: name.to_string(),
            arguments: String::new(),
        });
        self.calls.len() - 1
    }

    fn extend_last(&mut self, args: &str) -> Option<usize> {
        let index = self.calls.len().checked_sub(1)?;
        self.calls[index].arguments.push_str(args);
        Some(index)
    }
}

// --- openai family ---------------------------------------------------------

struct OpenAiStreamParser {
    ctx: ChunkContext,
    framer: SseFramer,
    done: bool,
    content: String,
    reasoning: String,
    tool_calls: ToolCallAccumulator,
    usage: TokenUsage,
    finish_reason: Option<FinishReason>,
}

impl OpenAiStreamParser {
    fn new(ctx: ChunkContext) -> Self {
        Self {
            ctx,
            framer: SseFramer::new(),
            done: false,
            content: String::new(),
            reasoning: String::new(),
            tool_calls: ToolCallAccumulator::default(),
            usage: TokenUsage::default(),
            finish_reason: None,
        }
    }

    fn handle_data(&mut self, data: &str, out: &mut Vec<Value>) {
        if data == "[DONE]" {
            self.done = true;
            return;
        }
        let Ok(value) = serde_json::from_str::<Value>(data) else {
            return;
        };

        let chunk_usage = openai_compatible::extract_usage(value.get("usage"));
        self.usage.merge(&chunk_usage);

        let Some(choice) = value
            .get("choices")
            .and_then(Value::as_array)
            .and_then(|choices| choices.first())
        else {
            // Upstream usage-only chunks (stream_options include_usage)
            // pass through in normalized shape.
            if chunk_usage != TokenUsage::default() {
                out.push(usage_chunk(&self.ctx, &chunk_usage));
            }
            return;
        };

        let mut delta_out = Map::<String, Value>::new();
        if let Some(delta) = choice.get("delta") {
            if let Some(text) = delta.get("content").and_then(Value::as_str) {
                if !text.is_empty() {
                    self.content.push_str(text);
                    delta_out.insert("content".to_string(), text.into());
                }
            }
            if let Some(text) = delta.get("reasoning_content").and_then(Value::as_str) {
                if !text.is_empty() {
                    self.reasoning.push_str(text);
                    delta_out.insert("reasoning_content".to_string(), text.into());
                }
            }
            if let Some(calls) = delta.get("tool_calls").and_then(Value::as_array) {
                let mut normalized = Vec::<Value>::new();
                for call in calls {
                    let index = call
                        .get("index")
                        .and_then(Value::as_u64)
                        .unwrap_or(0) as usize;
                    let id = call.get("id").and_then(Value::as_str);
                    let function = call.get("function");
                    let name = function
                        .and_then(|function| function.get("name"))
                        .and_then(Value::as_str);
                    let args = function
                        .and_then(|function| function.get("arguments"))
                        .and_then(Value::as_str)
                        .unwrap_or_default();
                    self.tool_calls.apply_indexed(index, id, name, args);

                    let mut entry = Map::<String, Value>::new();
                    entry.insert("index".to_string(), index.into());
                    if let Some(id) = id {
                        entry.insert("id".to_string(), id.into());
                        entry.insert("type".to_string(), "function".into());
                    }
                    let mut function_out = Map::<String, Value>::new();
                    if let Some(name) = name {
                        function_out.insert("name".to_string(), name.into());
                    }
                    function_out.insert("arguments".to_string(), args.into());
                    entry.insert("function".to_string(), Value::Object(function_out));
                    normalized.push(Value::Object(entry));
                }
                if !normalized.is_empty() {
                    delta_out.insert("tool_calls".to_string(), Value::Array(normalized));
                }
            }
        }

        let finish = choice
            .get("finish_reason")
            .and_then(Value::as_str)
            .filter(|raw| !raw.is_empty());
        if let Some(raw) = finish {
            self.finish_reason = Some(FinishReason::from_upstream(Some(raw)));
        }

        if !delta_out.is_empty() || finish.is_some() {
            let finish_out = if finish.is_some() {
                Some(
                    self.finish_reason
                        .as_ref()
                        .map(FinishReason::as_str)
                        .unwrap_or("stop"),
                )
            } else {
                None
            };
            out.push(make_chunk(&self.ctx, delta_out, finish_out));
        }
    }
}

impl StreamParser for OpenAiStreamParser {
    fn feed(&mut self, chunk: &[u8]) -> Vec<Value> {
        let mut out = Vec::new();
        if self.done {
            return out;
        }
        for event in self.framer.feed(chunk) {
            if self.done {
                break;
            }
            self.handle_data(&event.data, &mut out);
        }
        out
    }

    fn summary(&mut self) -> StreamSummary {
        if !self.done {
            if let Some(event) = self.framer.finish() {
                let mut out = Vec::new();
                self.handle_data(&event.data, &mut out);
            }
        }
        StreamSummary {
            content: std::mem::take(&mut self.content),
            reasoning: std::mem::take(&mut self.reasoning),
            tool_calls: std::mem::take(&mut self.tool_calls.calls),
            usage: self.usage,
            finish_reason: self.finish_reason.clone(),
        }
    }
}

// --- anthropic -------------------------------------------------------------

struct AnthropicStreamParser {
    ctx: ChunkContext,
    framer: SseFramer,
    done: bool,
    content: String,
    reasoning: String,
    tool_calls: ToolCallAccumulator,
    /// Whether the current content block is a tool_use block.
    in_tool_block: bool,
    usage: TokenUsage,
    pending_finish: Option<FinishReason>,
    finish_reason: Option<FinishReason>,
}

impl AnthropicStreamParser {
    fn new(ctx: ChunkContext) -> Self {
        Self {
            ctx,
            framer: SseFramer::new(),
            done: false,
            content: String::new(),
            reasoning: String::new(),
            tool_calls: ToolCallAccumulator::default(),
            in_tool_block: false,
            usage: TokenUsage::default(),
            pending_finish: None,
            finish_reason: None,
        }
    }

    fn handle_event(&mut self, data: &str, out: &mut Vec<Value>) {
        let Ok(event) = serde_json::from_str::<Value>(data) else {
            return;
        };
        let Some(kind) = event.get("type").and_then(Value::as_str) else {
            return;
        };
        match kind {
            "message_start" => {
                let usage = event
                    .get("message")
                    .and_then(|message| message.get("usage"));
                self.usage.merge(&anthropic::extract_usage(usage));
            }
            "content_block_start" => {
                let Some(block) = event.get("content_block") else {
                    return;
                };
                self.in_tool_block =
                    block.get("type").and_then(Value::as_str) == Some("tool_use");
                if !self.in_tool_block {
                    return;
                }
                let id = block.get("id").and_then(Value::as_str).unwrap_or_default();
                let name = block
                    .get("name")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                let index = self.tool_calls.start(id, name);

                let mut delta = Map::<String, Value>::new();
                delta.insert(
                    "tool_calls".to_string(),
                    serde_json::json!([{
                        "index": index,
                        "id": id,
                        "type": "function",
                        "function": { "name": name, "arguments": "" },
                    }]),
                );
                out.push(make_chunk(&self.ctx, delta, None));
            }
            "content_block_delta" => {
                let Some(delta) = event.get("delta") else {
                    return;
                };
                match delta.get("type").and_then(Value::as_str) {
                    Some("text_delta") => {
                        let Some(text) = delta.get("text").and_then(Value::as_str) else {
                            return;
                        };
                        self.content.push_str(text);
                        let mut delta_out = Map::<String, Value>::new();
                        delta_out.insert("content".to_string(), text.into());
                        out.push(make_chunk(&self.ctx, delta_out, None));
                    }
                    Some("thinking_delta") => {
                        let Some(text) = delta.get("thinking").and_then(Value::as_str) else {
                            return;
                        };
                        self.reasoning.push_str(text);
                        let mut delta_out = Map::<String, Value>::new();
                        delta_out.insert("reasoning_content".to_string(), text.into());
                        out.push(make_chunk(&self.ctx, delta_out, None));
                    }
                    Some("input_json_delta") => {
                        let Some(partial) = delta.get("partial_json").and_then(Value::as_str)
                        else {
                            return;
                        };
                        let Some(index) = self.tool_calls.extend_last(partial) else {
                            return;
                        };
                        let mut delta_out = Map::<String, Value>::new();
                        delta_out.insert(
                            "tool_calls".to_string(),
                            serde_json::json!([{
                                "index": index,
                                "function": { "arguments": partial },
                            }]),
                        );
                        out.push(make_chunk(&self.ctx, delta_out, None));
                    }
                    _ => {}
                }
            }
            "message_delta" => {
                self.usage
                    .merge(&anthropic::extract_usage(event.get("usage")));
                let stop_reason = event
                    .get("delta")
                    .and_then(|delta| delta.get("stop_reason"))
                    .and_then(Value::as_str);
                if let Some(raw) = stop_reason {
                    self.pending_finish = Some(FinishReason::from_upstream(Some(raw)));
                }
            }
            "message_stop" => {
                self.done = true;
                let finish = self
                    .pending_finish
                    .take()
                    .unwrap_or(FinishReason::Stop);
                out.push(make_chunk(
                    &self.ctx,
                    Map::new(),
                    Some(finish.as_str()),
                ));
                self.finish_reason = Some(finish);
            }
            _ => {}
        }
    }
}

impl StreamParser for AnthropicStreamParser {
    fn feed(&mut self, chunk: &[u8]) -> Vec<Value> {
        let mut out = Vec::new();
        if self.done {
            return out;
        }
        for event in self.framer.feed(chunk) {
            if self.done {
                break;
            }
            self.handle_event(&event.data, &mut out);
        }
        out
    }

    fn summary(&mut self) -> StreamSummary {
        StreamSummary {
            content: std::mem::take(&mut self.content),
            reasoning: std::mem::take(&mut self.reasoning),
            tool_calls: std::mem::take(&mut self.tool_calls.calls),
            usage: self.usage,
            finish_reason: self.finish_reason.clone(),
        }
    }
}

// --- google ----------------------------------------------------------------

/// The google stream is a concatenation of raw JSON objects with no SSE
/// framing (array brackets and commas may appear between them). The
/// scanner finds each top-level object by attempting a parse from every
/// `{`; incomplete trailers stay buffered up to the cap.
struct GoogleStreamParser {
    ctx: ChunkContext,
    buffer: BytesMut,
    buffer_cap: usize,
    content: String,
    reasoning: String,
    tool_calls: ToolCallAccumulator,
    usage: TokenUsage,
    finish_reason: Option<FinishReason>,
}

impl GoogleStreamParser {
    fn new(ctx: ChunkContext, buffer_cap: usize) -> Self {
        Self {
            ctx,
            buffer: BytesMut::new(),
            buffer_cap,
            content: String::new(),
            reasoning: String::new(),
            tool_calls: ToolCallAccumulator::default(),
            usage: TokenUsage::default(),
            finish_reason: None,
        }
    }

    fn scan_objects(&mut self) -> Vec<Value> {
        enum Scan {
            Parsed(Value, usize),
            Incomplete,
            Skip,
        }

        let mut objects = Vec::new();
        loop {
            let Some(start) = self.buffer.iter().position(|b| *b == b'{') else {
                self.buffer.clear();
                break;
            };
            let _ = self.buffer.split_to(start);

            let scan = {
                let mut iter = serde_json::Deserializer::from_slice(self.buffer.as_ref())
                    .into_iter::<Value>();
                match iter.next() {
                    Some(Ok(value)) => Scan::Parsed(value, iter.byte_offset()),
                    Some(Err(err)) if err.is_eof() => Scan::Incomplete,
                    // Not a parseable object from this brace; skip it and
                    // rescan from the next one.
                    Some(Err(_)) | None => Scan::Skip,
                }
            };
            match scan {
                Scan::Parsed(value, consumed) => {
                    let _ = self.buffer.split_to(consumed);
                    objects.push(value);
                }
                Scan::Incomplete => break,
                Scan::Skip => {
                    let _ = self.buffer.split_to(1);
                }
            }
        }

        if self.buffer.len() > self.buffer_cap {
            tracing::warn!(
                buffered = self.buffer.len(),
                cap = self.buffer_cap,
                "google stream buffer overflow; dropping accumulated bytes"
            );
            self.buffer.clear();
        }
        objects
    }

    fn handle_object(&mut self, object: &Value, out: &mut Vec<Value>) {
        self.usage
            .merge(&google::extract_usage(object.get("usageMetadata")));

        let Some(candidate) = object
            .get("candidates")
            .and_then(Value::as_array)
            .and_then(|candidates| candidates.first())
        else {
            return;
        };
        let parsed = google::parse_candidate(candidate);

        let mut delta_out = Map::<String, Value>::new();
        if !parsed.content.is_empty() {
            self.content.push_str(&parsed.content);
            delta_out.insert("content".to_string(), parsed.content.into());
        }
        if let Some(reasoning) = parsed.reasoning_content {
            self.reasoning.push_str(&reasoning);
            delta_out.insert("reasoning_content".to_string(), reasoning.into());
        }
        if !parsed.tool_calls.is_empty() {
            let mut normalized = Vec::<Value>::new();
            for call in parsed.tool_calls {
                let index = self.tool_calls.start(&call.id, &call.name);
                self.tool_calls.extend_last(&call.arguments);
                normalized.push(serde_json::json!({
                    "index": index,
                    "id": call.id,
                    "type": "function",
                    "function": { "name": call.name, "arguments": call.arguments },
                }));
            }
            delta_out.insert("tool_calls".to_string(), Value::Array(normalized));
        }

        if let Some(finish) = parsed.finish_reason {
            self.finish_reason = Some(finish.clone());
            out.push(make_chunk(&self.ctx, delta_out, Some(finish.as_str())));
        } else if !delta_out.is_empty() {
            out.push(make_chunk(&self.ctx, delta_out, None));
        }
    }
}

impl StreamParser for GoogleStreamParser {
    fn feed(&mut self, chunk: &[u8]) -> Vec<Value> {
        self.buffer.extend_from_slice(chunk);
        let objects = self.scan_objects();
        let mut out = Vec::new();
        for object in &objects {
            self.handle_object(object, &mut out);
        }
        out
    }

    fn summary(&mut self) -> StreamSummary {
        StreamSummary {
            content: std::mem::take(&mut self.content),
            reasoning: std::mem::take(&mut self.reasoning),
            tool_calls: std::mem::take(&mut self.tool_calls.calls),
            usage: self.usage,
            finish_reason: self.finish_reason.clone(),
        }
    }
}
