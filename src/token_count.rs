//! Token estimation for requests whose upstream omitted usage data.
//!
//! The reference tokenizer is the gpt-4-family BPE (`cl100k_base`). When
//! encoding fails the fallback is `ceil(len/4)`, never less than 1.

use tiktoken_rs::CoreBPE;

use crate::types::ChatMessage;

fn bpe() -> std::sync::Arc<parking_lot::Mutex<CoreBPE>> {
    tiktoken_rs::cl100k_base_singleton()
}

/// `ceil(len/4).max(1)` on byte length.
fn fallback_count(text: &str) -> u32 {
    let quarters = text.len().div_ceil(4).max(1);
    u32::try_from(quarters).unwrap_or(u32::MAX)
}

pub fn count_text(text: &str) -> u32 {
    if text.is_empty() {
        return 1;
    }
    let tokens = bpe().lock().encode_with_special_tokens(text).len();
    if tokens == 0 {
        return fallback_count(text);
    }
    u32::try_from(tokens).unwrap_or(u32::MAX)
}

/// Chat estimate in the tiktoken message framing: a fixed per-message
/// overhead plus role, content, and name tokens, plus the reply priming.
pub fn count_chat(messages: &[ChatMessage]) -> u32 {
    const TOKENS_PER_MESSAGE: u32 = 3;
    const REPLY_PRIMING: u32 = 3;

    let mut total: u32 = REPLY_PRIMING;
    for message in messages {
        total = total.saturating_add(TOKENS_PER_MESSAGE);
        total = total.saturating_add(count_text(&message.role));
        let text = message.text();
        if !text.is_empty() {
            total = total.saturating_add(count_text(&text));
        }
        if let Some(name) = message.name.as_deref() {
            total = total.saturating_add(count_text(name)).saturating_add(1);
        }
    }
    total.max(1)
}
