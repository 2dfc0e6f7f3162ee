//! Fingerprint-keyed cache of prior non-streaming responses.

use std::collections::{HashMap, VecDeque};

use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::types::ChatCompletionRequest;

#[derive(Clone, Debug)]
pub struct CacheLimits {
    pub max_entries: usize,
}

impl Default for CacheLimits {
    fn default() -> Self {
        Self { max_entries: 4_096 }
    }
}

#[derive(Clone, Debug)]
struct CacheEntry {
    response: Value,
    expires_at: u64,
}

#[derive(Debug)]
pub struct ResponseCache {
    limits: CacheLimits,
    entries: HashMap<String, CacheEntry>,
    order: VecDeque<String>,
}

impl ResponseCache {
    pub fn new(limits: CacheLimits) -> Self {
        Self {
            limits,
            entries: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    pub fn get(&mut self, key: &str, now: u64) -> Option<Value> {
        let expires_at = self.entries.get(key)?.expires_at;
        if now >= expires_at {
            self.entries.remove(key);
            self.order.retain(|candidate| candidate != key);
            return None;
        }
        Some(self.entries.get(key)?.response.clone())
    }

    pub fn insert(&mut self, key: String, response: Value, ttl_seconds: u64, now: u64) {
        if ttl_seconds == 0 || self.limits.max_entries == 0 {
            return;
        }

        let entry = CacheEntry {
            response,
            expires_at: now.saturating_add(ttl_seconds),
        };
        if self.entries.insert(key.clone(), entry).is_some() {
            self.order.retain(|candidate| candidate != &key);
        }
        self.order.push_back(key);

        while self.entries.len() > self.limits.max_entries {
            let Some(oldest) = self.order.pop_front() else {
                break;
            };
            self.entries.remove(&oldest);
        }
    }
}

impl Default for ResponseCache {
    fn default() -> Self {
        Self::new(CacheLimits::default())
    }
}

/// Stable fingerprint over the generation-relevant request fields. Field
/// order is fixed and absent optionals are omitted, so two requests that
/// differ only in ignored fields (or header noise) share a key.
pub fn fingerprint(request: &ChatCompletionRequest) -> String {
    let mut canonical = serde_json::Map::new();
    canonical.insert("model".to_string(), request.model.clone().into());
    canonical.insert(
        "messages".to_string(),
        serde_json::to_value(&request.messages).unwrap_or(Value::Null),
    );
    if let Some(temperature) = request.temperature {
        canonical.insert("temperature".to_string(), canonical_number(temperature));
    }
    if let Some(max_tokens) = request.max_tokens {
        canonical.insert("max_tokens".to_string(), max_tokens.into());
    }
    if let Some(top_p) = request.top_p {
        canonical.insert("top_p".to_string(), canonical_number(top_p));
    }
    if let Some(frequency_penalty) = request.frequency_penalty {
        canonical.insert(
            "frequency_penalty".to_string(),
            canonical_number(frequency_penalty),
        );
    }
    if let Some(presence_penalty) = request.presence_penalty {
        canonical.insert(
            "presence_penalty".to_string(),
            canonical_number(presence_penalty),
        );
    }
    if let Some(format) = request.response_format.as_ref() {
        canonical.insert(
            "response_format".to_string(),
            serde_json::json!({ "type": format.kind }),
        );
    }

    let serialized =
        serde_json::to_string(&Value::Object(canonical)).unwrap_or_default();
    let digest = Sha256::digest(serialized.as_bytes());
    let mut out = String::with_capacity(64);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

/// Integral floats serialize as integers so `1` and `1.0` fingerprint
/// identically.
fn canonical_number(value: f64) -> Value {
    if value.fract() == 0.0 && value.is_finite() && value.abs() < i64::MAX as f64 {
        Value::from(value as i64)
    } else {
        serde_json::Number::from_f64(value)
            .map(Value::Number)
            .unwrap_or(Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ChatMessage;

    fn request(model: &str, temperature: Option<f64>) -> ChatCompletionRequest {
        ChatCompletionRequest {
            model: model.to_string(),
            messages: vec![ChatMessage::user("hi")],
            stream: false,
            temperature,
            max_tokens: None,
            top_p: None,
            frequency_penalty: None,
            presence_penalty: None,
            response_format: None,
            tools: None,
            tool_choice: None,
            reasoning_effort: None,
        }
    }

    #[test]
    fn fingerprint_is_deterministic() {
        let a = fingerprint(&request("gpt-4o-mini", Some(0.5)));
        let b = fingerprint(&request("gpt-4o-mini", Some(0.5)));
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn fingerprint_distinguishes_generation_params() {
        let base = fingerprint(&request("gpt-4o-mini", None));
        let warm = fingerprint(&request("gpt-4o-mini", Some(0.9)));
        let other_model = fingerprint(&request("gpt-4o", None));
        assert_ne!(base, warm);
        assert_ne!(base, other_model);
    }

    #[test]
    fn integral_floats_normalize() {
        let int_ish = fingerprint(&request("gpt-4o-mini", Some(1.0)));
        let explicit = fingerprint(&request("gpt-4o-mini", Some(1.0 + 0.0)));
        assert_eq!(int_ish, explicit);
    }

    #[test]
    fn cache_expires_entries_at_ttl() {
        let mut cache = ResponseCache::default();
        cache.insert("k".to_string(), serde_json::json!({"ok": true}), 10, 100);
        assert!(cache.get("k", 105).is_some());
        assert!(cache.get("k", 110).is_none());
        assert!(cache.get("k", 111).is_none());
    }

    #[test]
    fn zero_ttl_disables_insertion() {
        let mut cache = ResponseCache::default();
        cache.insert("k".to_string(), serde_json::json!({}), 0, 100);
        assert!(cache.get("k", 100).is_none());
    }

    #[test]
    fn cache_evicts_oldest_when_full() {
        let mut cache = ResponseCache::new(CacheLimits { max_entries: 2 });
        for key in ["a", "b", "c"] {
            cache.insert(key.to_string(), serde_json::json!({}), 60, 0);
        }
        assert!(cache.get("a", 0).is_none());
        assert!(cache.get("b", 0).is_some());
        assert!(cache.get("c", 0).is_some());
    }
}
