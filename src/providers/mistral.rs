//! Mistral is openai-shaped on the wire, but JSON-mode responses arrive
//! wrapped in a markdown fence. Unwrapping preserves the `json_object`
//! contract for callers.

/// If `content` carries a ```json fenced block, return the inner JSON
/// re-serialized compactly; otherwise return the content unchanged.
pub fn unwrap_json_fence(content: &str) -> String {
    let Some(inner) = extract_fenced_json(content) else {
        return content.to_string();
    };
    match serde_json::from_str::<serde_json::Value>(inner) {
        Ok(value) => value.to_string(),
        Err(_) => content.to_string(),
    }
}

fn extract_fenced_json(content: &str) -> Option<&str> {
    let start = content.find("```json")?;
    let after_tag = &content[start + "```json".len()..];
    let end = after_tag.find("```")?;
    Some(after_tag[..end].trim())
}
